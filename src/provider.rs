use std::fmt;

use crate::messages::{AuthorizationStatus, BeaconIdentity, BeaconPayload, Generation, PowerState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitoringKind {
    BeaconRegion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AdvertiseHandle(pub u64);

impl fmt::Display for AdvertiseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Platform radio and location services. Calls return immediately; results
/// arrive later as `RadioEvent`s on the channel the provider was built with.
pub trait CapabilityProvider {
    fn authorization_status(&self) -> AuthorizationStatus;
    /// Answered by a later `RadioEvent::AuthorizationChanged`.
    fn request_authorization(&mut self);

    fn monitoring_available(&self, kind: MonitoringKind) -> bool;
    fn ranging_available(&self) -> bool;
    /// Ranging deliveries for this subscription are tagged with `generation`.
    fn begin_monitor_and_range(&mut self, identity: &BeaconIdentity, generation: Generation);
    fn end_monitor_and_range(&mut self);

    fn radio_power(&self) -> PowerState;
    fn begin_advertise(
        &mut self,
        identity: &BeaconIdentity,
        payload: &BeaconPayload,
    ) -> AdvertiseHandle;
    fn end_advertise(&mut self, handle: AdvertiseHandle);
}
