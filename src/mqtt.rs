use std::time::Duration;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::config;
use crate::messages::{BeaconIdentity, Command, ProximityAnnouncement};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct ProximityMqttMessage<'a> {
    #[serde(rename = "id")]
    identifier: &'a str,
    uuid: String,
    major: u16,
    minor: u16,
    proximity: &'static str,
    retained: bool,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "beacon-monitor".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "beacon".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        let filters = ["scan/start", "scan/stop", "advertise/start", "advertise/stop"]
            .iter()
            .map(|suffix| {
                SubscribeFilter::new(format!("{}/{}", self.topic_path, suffix), QoS::AtMostOnce)
            })
            .collect::<Vec<_>>();
        self.client.subscribe_many(filters).await?;

        Ok(())
    }

    /// Turns control topics into commands for the dispatcher.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<Command>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(command) = parse_command(&self.topic_path, &p.topic, &p.payload)
                        else {
                            warn!("Ignoring MQTT message on topic {}", p.topic);
                            continue;
                        };

                        if let Err(err) = tx.send(command) {
                            error!("Error forwarding command: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Publishes every classification until the announcement channel closes.
    pub async fn publish_loop(&self, mut rx: broadcast::Receiver<ProximityAnnouncement>) {
        loop {
            match rx.recv().await {
                Ok(announcement) => {
                    if let Err(err) = self.announce_proximity(&announcement).await {
                        error!("Error announcing proximity: {:?}", err);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Announcement receiver lagged, skipped {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Announcement channel closed");
                    break;
                }
            }
        }
    }

    pub async fn announce_proximity(
        &self,
        announcement: &ProximityAnnouncement,
    ) -> anyhow::Result<()> {
        let identity = &announcement.identity;
        info!(
            "Announcing {} ({}) on MQTT",
            identity.identifier, announcement.proximity
        );
        let message = ProximityMqttMessage {
            identifier: &identity.identifier,
            uuid: identity.uuid.to_string(),
            major: identity.major,
            minor: identity.minor,
            proximity: announcement.proximity.as_str(),
            retained: false,
        };
        let payload =
            serde_json::to_string(&message).context("serializing proximity announcement")?;
        self.client
            .publish(
                format!(
                    "{}/{}/{}",
                    self.topic_path,
                    self.publisher_id,
                    sanitize_name(&identity.identifier)
                ),
                QoS::AtMostOnce,
                false,
                payload,
            )
            .await
            .context("publishing proximity announcement")
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

/// Start payloads may carry a JSON identity; an empty payload means the
/// configured one.
fn parse_command(topic_path: &str, topic: &str, payload: &[u8]) -> Option<Command> {
    let suffix = topic.strip_prefix(topic_path)?.strip_prefix('/')?;
    let identity = || -> Option<BeaconIdentity> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice(payload) {
            Ok(identity) => Some(identity),
            Err(err) => {
                warn!("Ignoring unparseable beacon identity: {:?}", err);
                None
            }
        }
    };
    match suffix {
        "scan/start" => Some(Command::StartScanning(identity())),
        "scan/stop" => Some(Command::StopScanning),
        "advertise/start" => Some(Command::StartAdvertising(identity())),
        "advertise/stop" => Some(Command::StopAdvertising),
        _ => None,
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        let name = "Test's Beacon 123";
        let sanitized = super::sanitize_name(name);
        assert_eq!(sanitized, "test_s_beacon_123");
    }

    #[test]
    fn test_parse_control_topics() {
        assert!(matches!(
            parse_command("beacon", "beacon/scan/start", b""),
            Some(Command::StartScanning(None))
        ));
        assert!(matches!(
            parse_command("beacon", "beacon/scan/stop", b""),
            Some(Command::StopScanning)
        ));
        assert!(matches!(
            parse_command("beacon", "beacon/advertise/stop", b""),
            Some(Command::StopAdvertising)
        ));
        assert!(parse_command("beacon", "other/scan/start", b"").is_none());
        assert!(parse_command("beacon", "beacon/scan/pause", b"").is_none());
    }

    #[test]
    fn test_start_payload_carries_identity() {
        let payload = br#"{"uuid":"E2C56DB5-DFFB-48D2-B060-D0F5A71096E0","major":1,"minor":2,"identifier":"Door"}"#;
        match parse_command("beacon", "beacon/advertise/start", payload) {
            Some(Command::StartAdvertising(Some(identity))) => {
                assert_eq!(identity.identifier, "Door");
                assert_eq!((identity.major, identity.minor), (1, 2));
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(matches!(
            parse_command("beacon", "beacon/scan/start", b"not json"),
            Some(Command::StartScanning(None))
        ));
    }

    #[test]
    fn test_proximity_message_shape() {
        let identity = BeaconIdentity::default();
        let message = ProximityMqttMessage {
            identifier: &identity.identifier,
            uuid: identity.uuid.to_string(),
            major: identity.major,
            minor: identity.minor,
            proximity: "near",
            retained: false,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(json["id"], "MyBeacon");
        assert_eq!(json["proximity"], "near");
        assert_eq!(json["major"], 123);
    }
}
