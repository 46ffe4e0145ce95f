use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};

use crate::classifier::ProximityClassifier;
use crate::messages::{
    AuthorizationStatus, BeaconIdentity, BeaconPayload, Command, Generation, PowerState,
    RadioEvent, RangedBeacon,
};
use crate::provider::{AdvertiseHandle, CapabilityProvider, MonitoringKind};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanSession {
    pub identity: BeaconIdentity,
    pub generation: Generation,
}

/// Scanning role. Only `Scanning` holds a live subscription; the other
/// variants remember the identity of the last attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    AwaitingAuthorization(BeaconIdentity),
    /// Left only when the platform later grants authorization.
    Unauthorized(BeaconIdentity),
    /// Terminal for this attempt, `start_scanning` must be called again.
    CapabilityCheckFailed(BeaconIdentity),
    Scanning(ScanSession),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastState {
    /// Waiting for the radio to power on.
    Pending,
    Broadcasting(AdvertiseHandle),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvertiseSession {
    pub identity: BeaconIdentity,
    pub generation: Generation,
    pub state: BroadcastState,
}

pub struct Manager<P: CapabilityProvider> {
    provider: P,
    classifier: ProximityClassifier,
    target: BeaconIdentity,
    advertise_target: BeaconIdentity,
    measured_power: Option<i8>,
    scan: ScanState,
    advertise: Option<AdvertiseSession>,
    last_generation: u64,
}

impl<P: CapabilityProvider> Manager<P> {
    pub fn new(provider: P, classifier: ProximityClassifier, target: BeaconIdentity) -> Self {
        Manager {
            provider,
            classifier,
            advertise_target: target.clone(),
            target,
            measured_power: None,
            scan: ScanState::Idle,
            advertise: None,
            last_generation: 0,
        }
    }

    /// Identity advertised when a start command names none.
    pub fn with_advertise_target(mut self, identity: BeaconIdentity) -> Self {
        self.advertise_target = identity;
        self
    }

    pub fn with_measured_power(mut self, measured_power: Option<i8>) -> Self {
        self.measured_power = measured_power;
        self
    }

    fn next_generation(&mut self) -> Generation {
        self.last_generation += 1;
        Generation(self.last_generation)
    }

    /// Attempts that do not reach `Scanning` never disturb a live session.
    fn record_attempt(&mut self, state: ScanState) {
        if !matches!(self.scan, ScanState::Scanning(_)) {
            self.scan = state;
        }
    }

    pub fn start_scanning(&mut self, identity: BeaconIdentity) {
        let status = self.provider.authorization_status();
        match status {
            s if s.permits_scanning() => self.begin_scan_if_capable(identity),
            AuthorizationStatus::NotDetermined => {
                info!("Requesting authorization to range for {}", identity);
                self.record_attempt(ScanState::AwaitingAuthorization(identity));
                self.provider.request_authorization();
            }
            _ => {
                warn!("Authorization {:?} does not permit scanning for {}", status, identity);
                self.record_attempt(ScanState::Unauthorized(identity));
            }
        }
    }

    fn begin_scan_if_capable(&mut self, identity: BeaconIdentity) {
        if !self.provider.monitoring_available(MonitoringKind::BeaconRegion) {
            warn!("Beacon region monitoring is not available, not scanning for {}", identity);
            self.record_attempt(ScanState::CapabilityCheckFailed(identity));
            return;
        }
        if !self.provider.ranging_available() {
            warn!("Ranging is not available, not scanning for {}", identity);
            self.record_attempt(ScanState::CapabilityCheckFailed(identity));
            return;
        }

        self.stop_scanning();
        let generation = self.next_generation();
        info!("Scanning for {} (session {})", identity, generation);
        self.provider.begin_monitor_and_range(&identity, generation);
        self.scan = ScanState::Scanning(ScanSession {
            identity,
            generation,
        });
    }

    pub fn stop_scanning(&mut self) {
        match std::mem::replace(&mut self.scan, ScanState::Idle) {
            ScanState::Scanning(session) => {
                info!(
                    "Stopping scan for {} (session {})",
                    session.identity, session.generation
                );
                self.provider.end_monitor_and_range();
            }
            ScanState::Idle => debug!("No scan to stop"),
            other => debug!("Dropping unfinished scan attempt {:?}", other),
        }
    }

    pub fn start_advertising(&mut self, identity: BeaconIdentity) {
        self.stop_advertising();

        let generation = self.next_generation();
        let mut session = AdvertiseSession {
            identity,
            generation,
            state: BroadcastState::Pending,
        };
        if self.provider.radio_power() == PowerState::PoweredOn {
            let payload = BeaconPayload {
                identity: session.identity.clone(),
                measured_power: self.measured_power,
            };
            let handle = self.provider.begin_advertise(&session.identity, &payload);
            info!("Advertising as {} (session {})", session.identity, generation);
            session.state = BroadcastState::Broadcasting(handle);
        } else {
            info!(
                "Radio is not powered on, advertising {} once it is (session {})",
                session.identity, generation
            );
        }
        self.advertise = Some(session);
    }

    pub fn stop_advertising(&mut self) {
        let Some(session) = self.advertise.take() else {
            debug!("No advertisement to stop");
            return;
        };
        if let BroadcastState::Broadcasting(handle) = session.state {
            self.provider.end_advertise(handle);
        }
        info!(
            "Stopped advertising {} (session {})",
            session.identity, session.generation
        );
    }

    pub fn handle_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::AuthorizationChanged(status) => self.on_authorization(status),
            RadioEvent::Ranged {
                generation,
                beacons,
            } => self.on_ranged(generation, &beacons),
            RadioEvent::PowerChanged(state) => self.on_power(state),
        }
    }

    fn on_authorization(&mut self, status: AuthorizationStatus) {
        debug!("Authorization changed to {:?}", status);
        match std::mem::replace(&mut self.scan, ScanState::Idle) {
            ScanState::AwaitingAuthorization(identity) | ScanState::Unauthorized(identity)
                if status.permits_scanning() =>
            {
                self.begin_scan_if_capable(identity);
            }
            ScanState::AwaitingAuthorization(identity)
                if status == AuthorizationStatus::NotDetermined =>
            {
                self.scan = ScanState::AwaitingAuthorization(identity);
            }
            ScanState::AwaitingAuthorization(identity) | ScanState::Unauthorized(identity) => {
                warn!("Authorization {:?} does not permit scanning for {}", status, identity);
                self.scan = ScanState::Unauthorized(identity);
            }
            ScanState::Scanning(session) if !status.permits_scanning() => {
                warn!("Authorization revoked, stopping scan for {}", session.identity);
                self.provider.end_monitor_and_range();
                self.scan = ScanState::Unauthorized(session.identity);
            }
            other => self.scan = other,
        }
    }

    fn on_ranged(&mut self, generation: Generation, beacons: &[RangedBeacon]) {
        match &self.scan {
            ScanState::Scanning(session) if session.generation == generation => {
                self.classifier.update(&session.identity, beacons);
            }
            _ => debug!("Discarding ranging result from stale session {}", generation),
        }
    }

    fn on_power(&mut self, power: PowerState) {
        let Some(session) = self.advertise.as_mut() else {
            debug!("Radio power is now {:?}", power);
            return;
        };
        match (power, session.state) {
            (PowerState::PoweredOn, BroadcastState::Pending) => {
                let payload = BeaconPayload {
                    identity: session.identity.clone(),
                    measured_power: self.measured_power,
                };
                let handle = self.provider.begin_advertise(&session.identity, &payload);
                info!("Radio powered on, advertising {}", session.identity);
                session.state = BroadcastState::Broadcasting(handle);
            }
            (
                PowerState::PoweredOff | PowerState::Unknown,
                BroadcastState::Broadcasting(handle),
            ) => {
                self.provider.end_advertise(handle);
                info!("Radio powered off, pausing advertisement of {}", session.identity);
                session.state = BroadcastState::Pending;
            }
            _ => {}
        }
    }

    /// Returns false once the dispatcher should exit.
    pub fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartScanning(identity) => {
                let identity = identity.unwrap_or_else(|| self.target.clone());
                self.start_scanning(identity);
            }
            Command::StopScanning => self.stop_scanning(),
            Command::StartAdvertising(identity) => {
                let identity = identity.unwrap_or_else(|| self.advertise_target.clone());
                self.start_advertising(identity);
            }
            Command::StopAdvertising => self.stop_advertising(),
            Command::Shutdown => return false,
        }
        true
    }

    /// Serializes every command and radio callback onto one task. Commands
    /// take priority so a stop is never overtaken by a queued delivery.
    pub async fn run_loop(
        mut self,
        mut commands: broadcast::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Ok(command) => {
                        debug!("Received command {:?}", command);
                        if !self.handle_command(command) {
                            info!("Shutting down");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        error!("Command receiver lagged, dropped {} commands", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Command channel closed");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Radio event stream closed");
                        break;
                    }
                },
            }
        }

        self.stop_scanning();
        self.stop_advertising();
        Ok(())
    }

    #[cfg(test)]
    fn scan_state(&self) -> &ScanState {
        &self.scan
    }

    #[cfg(test)]
    fn advertise_session(&self) -> Option<&AdvertiseSession> {
        self.advertise.as_ref()
    }

    #[cfg(test)]
    fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }
}
