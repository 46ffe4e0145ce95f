use serde_derive::Deserialize;
use uuid::Uuid;

use crate::messages::BeaconIdentity;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub beacon: Option<BeaconIdentity>,
    pub scan: Option<ScanConfig>,
    pub advertise: Option<AdvertiseConfig>,
    pub mqtt: Option<MqttConfig>,
}

impl AppConfig {
    pub fn target(&self) -> BeaconIdentity {
        self.beacon.clone().unwrap_or_default()
    }

    /// The advertised identity falls back to the scan target field by field.
    pub fn advertised_identity(&self) -> BeaconIdentity {
        let target = self.target();
        let Some(advertise) = &self.advertise else {
            return target;
        };
        BeaconIdentity {
            uuid: advertise.uuid.unwrap_or(target.uuid),
            major: advertise.major.unwrap_or(target.major),
            minor: advertise.minor.unwrap_or(target.minor),
            identifier: advertise.identifier.clone().unwrap_or(target.identifier),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub enabled: Option<bool>,
    pub ranging_interval_seconds: Option<u64>,
    pub immediate_distance_meters: Option<f64>,
    pub near_distance_meters: Option<f64>,
    pub path_loss_exponent: Option<f64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AdvertiseConfig {
    pub enabled: Option<bool>,
    /// RSSI at one metre, in dBm.
    pub measured_power: Option<i8>,
    pub uuid: Option<Uuid>,
    pub major: Option<u16>,
    pub minor: Option<u16>,
    pub identifier: Option<String>,
}
