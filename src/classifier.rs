use log::debug;

use crate::messages::{BeaconIdentity, ProximityLevel, RangedBeacon};

/// Only the first beacon the radio reports is authoritative; the rest of the
/// delivery is ignored.
pub fn classify(beacons: &[RangedBeacon]) -> ProximityLevel {
    beacons
        .first()
        .map(|beacon| beacon.proximity)
        .unwrap_or(ProximityLevel::Unknown)
}

type Hook = Box<dyn FnMut(&BeaconIdentity, ProximityLevel) + Send>;

/// Runs `classify` on every ranging delivery and hands the result to a hook.
/// The hook runs on the dispatcher, so it must not block.
pub struct ProximityClassifier {
    hook: Hook,
}

impl ProximityClassifier {
    pub fn new<F>(hook: F) -> Self
    where
        F: FnMut(&BeaconIdentity, ProximityLevel) + Send + 'static,
    {
        ProximityClassifier {
            hook: Box::new(hook),
        }
    }

    pub fn update(
        &mut self,
        identity: &BeaconIdentity,
        beacons: &[RangedBeacon],
    ) -> ProximityLevel {
        let level = classify(beacons);
        if let Some(first) = beacons.first() {
            debug!(
                "Ranged {} beacon(s) for {}, using {}/{} at {:?} dBm",
                beacons.len(),
                identity.identifier,
                first.major,
                first.minor,
                first.rssi
            );
        }
        (self.hook)(identity, level);
        level
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn beacon(proximity: ProximityLevel) -> RangedBeacon {
        RangedBeacon {
            major: 123,
            minor: 456,
            proximity,
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_empty_delivery_is_unknown() {
        assert_eq!(classify(&[]), ProximityLevel::Unknown);
    }

    #[test]
    fn test_first_beacon_wins() {
        let beacons = vec![
            beacon(ProximityLevel::Immediate),
            beacon(ProximityLevel::Far),
            beacon(ProximityLevel::Unknown),
        ];
        assert_eq!(classify(&beacons), ProximityLevel::Immediate);

        let beacons = vec![beacon(ProximityLevel::Far), beacon(ProximityLevel::Immediate)];
        assert_eq!(classify(&beacons), ProximityLevel::Far);
    }

    #[test]
    fn test_classify_has_no_memory() {
        let near = vec![beacon(ProximityLevel::Near)];
        let first = classify(&near);
        classify(&[beacon(ProximityLevel::Immediate)]);
        classify(&[]);
        assert_eq!(classify(&near), first);
    }

    #[test]
    fn test_hook_receives_every_result() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut classifier = ProximityClassifier::new(move |identity, level| {
            sink.lock().unwrap().push((identity.identifier.clone(), level));
        });

        let identity = BeaconIdentity::default();
        classifier.update(&identity, &[beacon(ProximityLevel::Near)]);
        classifier.update(&identity, &[]);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("MyBeacon".to_string(), ProximityLevel::Near),
                ("MyBeacon".to_string(), ProximityLevel::Unknown),
            ]
        );
    }
}
