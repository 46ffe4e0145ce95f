use std::fmt;

use serde_derive::Deserialize;
use uuid::Uuid;

/// Proximity category reported for a ranged beacon. Categorical only, no
/// distance is implied beyond the ordering of the names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProximityLevel {
    Unknown,
    Far,
    Near,
    Immediate,
}

impl ProximityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProximityLevel::Unknown => "unknown",
            ProximityLevel::Far => "far",
            ProximityLevel::Near => "near",
            ProximityLevel::Immediate => "immediate",
        }
    }
}

impl fmt::Display for ProximityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProximityLevel::Unknown => "Unknown Distance",
            ProximityLevel::Far => "Far Distance",
            ProximityLevel::Near => "Near Distance",
            ProximityLevel::Immediate => "Immediate Distance",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct BeaconIdentity {
    pub uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    pub identifier: String,
}

impl Default for BeaconIdentity {
    fn default() -> Self {
        BeaconIdentity {
            uuid: Uuid::from_u128(0x92AB49BE_4127_42F4_B532_90FAF1E26491),
            major: 123,
            minor: 456,
            identifier: "MyBeacon".to_string(),
        }
    }
}

impl fmt::Display for BeaconIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}/{})",
            self.identifier, self.uuid, self.major, self.minor
        )
    }
}

/// One beacon observed during a ranging window, already bucketed by the
/// radio layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangedBeacon {
    pub major: u16,
    pub minor: u16,
    pub proximity: ProximityLevel,
    pub rssi: Option<i16>,
}

/// Token identifying one scan or advertise session. Callbacks carrying a
/// stale generation are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorizationStatus {
    NotDetermined,
    Restricted,
    Denied,
    AuthorizedWhenInUse,
    AuthorizedAlways,
}

impl AuthorizationStatus {
    /// Background ranging needs the "always" grant; when-in-use is not enough.
    pub fn permits_scanning(&self) -> bool {
        matches!(self, AuthorizationStatus::AuthorizedAlways)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    Unknown,
    PoweredOn,
    PoweredOff,
}

/// What an advertising session asks the radio to broadcast. Encoding into
/// advertisement bytes is the radio layer's business.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeaconPayload {
    pub identity: BeaconIdentity,
    pub measured_power: Option<i8>,
}

/// Asynchronous notifications delivered by a capability provider.
#[derive(Clone, Debug)]
pub enum RadioEvent {
    AuthorizationChanged(AuthorizationStatus),
    Ranged {
        generation: Generation,
        beacons: Vec<RangedBeacon>,
    },
    PowerChanged(PowerState),
}

/// Control requests, from MQTT or from the process itself. `None` means the
/// configured identity.
#[derive(Clone, Debug)]
pub enum Command {
    StartScanning(Option<BeaconIdentity>),
    StopScanning,
    StartAdvertising(Option<BeaconIdentity>),
    StopAdvertising,
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct ProximityAnnouncement {
    pub identity: BeaconIdentity,
    pub proximity: ProximityLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_identity() {
        let identity = BeaconIdentity::default();
        assert_eq!(
            identity.uuid.to_string(),
            "92ab49be-4127-42f4-b532-90faf1e26491"
        );
        assert_eq!((identity.major, identity.minor), (123, 456));
        assert_eq!(identity.identifier, "MyBeacon");
    }

    #[test]
    fn test_proximity_labels() {
        assert_eq!(ProximityLevel::Unknown.to_string(), "Unknown Distance");
        assert_eq!(ProximityLevel::Immediate.to_string(), "Immediate Distance");
        assert_eq!(ProximityLevel::Near.as_str(), "near");
    }

    #[test]
    fn test_only_always_authorization_permits_scanning() {
        assert!(AuthorizationStatus::AuthorizedAlways.permits_scanning());
        assert!(!AuthorizationStatus::AuthorizedWhenInUse.permits_scanning());
        assert!(!AuthorizationStatus::Denied.permits_scanning());
        assert!(!AuthorizationStatus::Restricted.permits_scanning());
        assert!(!AuthorizationStatus::NotDetermined.permits_scanning());
    }
}
