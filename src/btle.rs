use std::time::Duration;

use btleplug::api::{Central as _, CentralEvent, CentralState, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::future::{BoxFuture, FutureExt as _, Shared};
use futures::StreamExt as _;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::messages::{
    AuthorizationStatus, BeaconIdentity, BeaconPayload, Generation, PowerState, ProximityLevel,
    RadioEvent, RangedBeacon,
};
use crate::provider::{AdvertiseHandle, CapabilityProvider, MonitoringKind};

/// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
const APPLE_COMPANY_ID: u16 = 0x004C;
const IBEACON_TYPE: [u8; 2] = [0x02, 0x15];
const IBEACON_LEN: usize = 23;

/// iBeacon body of an Apple manufacturer data record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IBeaconFrame {
    pub uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    pub measured_power: i8,
}

impl IBeaconFrame {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IBEACON_LEN || data[..2] != IBEACON_TYPE {
            return None;
        }
        Some(IBeaconFrame {
            uuid: Uuid::from_slice(&data[2..18]).ok()?,
            major: u16::from_be_bytes([data[18], data[19]]),
            minor: u16::from_be_bytes([data[20], data[21]]),
            measured_power: data[22] as i8,
        })
    }

    pub fn matches(&self, identity: &BeaconIdentity) -> bool {
        self.uuid == identity.uuid && self.major == identity.major && self.minor == identity.minor
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RangingParameters {
    pub interval: Duration,
    pub immediate_distance: f64,
    pub near_distance: f64,
    pub path_loss_exponent: f64,
}

impl From<&ScanConfig> for RangingParameters {
    fn from(config: &ScanConfig) -> Self {
        RangingParameters {
            interval: Duration::from_secs(config.ranging_interval_seconds.unwrap_or(1).max(1)),
            immediate_distance: config.immediate_distance_meters.unwrap_or(0.5),
            near_distance: config.near_distance_meters.unwrap_or(3.0),
            path_loss_exponent: config.path_loss_exponent.unwrap_or(2.0),
        }
    }
}

impl RangingParameters {
    /// Log-distance path loss estimate, bucketed. An RSSI of 0 means the
    /// stack had no reading.
    pub fn proximity(&self, rssi: Option<i16>, measured_power: i8) -> ProximityLevel {
        let Some(rssi) = rssi.filter(|r| *r != 0) else {
            return ProximityLevel::Unknown;
        };
        let exponent =
            (f64::from(measured_power) - f64::from(rssi)) / (10.0 * self.path_loss_exponent);
        let distance = 10f64.powf(exponent);
        if distance < self.immediate_distance {
            ProximityLevel::Immediate
        } else if distance < self.near_distance {
            ProximityLevel::Near
        } else {
            ProximityLevel::Far
        }
    }
}

fn power_state(state: CentralState) -> PowerState {
    match state {
        CentralState::PoweredOn => PowerState::PoweredOn,
        CentralState::PoweredOff => PowerState::PoweredOff,
        _ => PowerState::Unknown,
    }
}

/// Capability provider backed by a btleplug central adapter.
///
/// Desktop stacks gate Bluetooth access per adapter rather than per app, so
/// authorization is always granted. btleplug has no peripheral role, so
/// advertising sessions are tracked but nothing is put on the air.
pub struct BtleProvider {
    adapter: Adapter,
    events: mpsc::UnboundedSender<RadioEvent>,
    ranging: RangingParameters,
    power: watch::Receiver<PowerState>,
    range_task: Option<JoinHandle<()>>,
    /// Most recent `stop_scan`. Every later ranging task waits on it before
    /// starting its own scan.
    last_stop: Option<PendingStop>,
    power_task: JoinHandle<()>,
    last_handle: u64,
}

impl BtleProvider {
    pub async fn new(
        adapter: Adapter,
        events: mpsc::UnboundedSender<RadioEvent>,
        ranging: RangingParameters,
    ) -> Result<Self, btleplug::Error> {
        let initial = power_state(adapter.adapter_state().await?);
        info!("Bluetooth adapter is {:?}", initial);

        let (power_tx, power) = watch::channel(initial);
        let adapter_events = adapter.events().await?;
        let power_task = tokio::spawn(watch_power(adapter_events, power_tx, events.clone()));

        Ok(BtleProvider {
            adapter,
            events,
            ranging,
            power,
            range_task: None,
            last_stop: None,
            power_task,
            last_handle: 0,
        })
    }

    fn abort_ranging(&mut self) -> bool {
        match self.range_task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for BtleProvider {
    fn drop(&mut self) {
        self.abort_ranging();
        self.power_task.abort();
    }
}

impl CapabilityProvider for BtleProvider {
    fn authorization_status(&self) -> AuthorizationStatus {
        AuthorizationStatus::AuthorizedAlways
    }

    fn request_authorization(&mut self) {
        if let Err(err) = self.events.send(RadioEvent::AuthorizationChanged(
            AuthorizationStatus::AuthorizedAlways,
        )) {
            error!("Error delivering authorization: {:?}", err);
        }
    }

    fn monitoring_available(&self, kind: MonitoringKind) -> bool {
        match kind {
            MonitoringKind::BeaconRegion => true,
        }
    }

    fn ranging_available(&self) -> bool {
        true
    }

    fn begin_monitor_and_range(&mut self, identity: &BeaconIdentity, generation: Generation) {
        // A running scan is simply taken over by the new task.
        self.abort_ranging();

        let adapter = self.adapter.clone();
        let identity = identity.clone();
        let ranging = self.ranging;
        let events = self.events.clone();
        let pending = self.last_stop.clone();
        self.range_task = Some(tokio::spawn(async move {
            if let Some(stop) = pending {
                stop.await;
            }
            if let Err(err) = range(adapter, identity, generation, ranging, events).await {
                error!("Error ranging beacons (session {}): {:?}", generation, err);
            }
        }));
    }

    fn end_monitor_and_range(&mut self) {
        if !self.abort_ranging() {
            return;
        }
        let adapter = self.adapter.clone();
        let previous = self.last_stop.take();
        let stop = pending_stop(async move {
            if let Some(previous) = previous {
                previous.await;
            }
            if let Err(err) = adapter.stop_scan().await {
                warn!("Error stopping BLE scan: {:?}", err);
            }
        });
        self.last_stop = Some(stop.clone());
        tokio::spawn(stop);
    }

    fn radio_power(&self) -> PowerState {
        *self.power.borrow()
    }

    fn begin_advertise(
        &mut self,
        identity: &BeaconIdentity,
        payload: &BeaconPayload,
    ) -> AdvertiseHandle {
        self.last_handle += 1;
        let handle = AdvertiseHandle(self.last_handle);
        debug!("Advertisement {} requested for {}", handle, identity);
        warn!(
            "btleplug cannot act as a peripheral, {} (measured power {:?}) is not on the air",
            payload.identity, payload.measured_power
        );
        handle
    }

    fn end_advertise(&mut self, handle: AdvertiseHandle) {
        debug!("Released advertisement {}", handle);
    }
}

type PendingStop = Shared<BoxFuture<'static, ()>>;

fn pending_stop<F>(stop: F) -> PendingStop
where
    F: Future<Output = ()> + Send + 'static,
{
    stop.boxed().shared()
}

async fn watch_power(
    mut adapter_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    power_tx: watch::Sender<PowerState>,
    events: mpsc::UnboundedSender<RadioEvent>,
) {
    while let Some(event) = adapter_events.next().await {
        if let CentralEvent::StateUpdate(state) = event {
            let state = power_state(state);
            debug!("Adapter state changed to {:?}", state);
            power_tx.send_replace(state);
            if events.send(RadioEvent::PowerChanged(state)).is_err() {
                break;
            }
        }
    }
    debug!("Adapter state stream closed");
}

/// One delivery per interval, listing matching beacons in the order they were
/// first seen during that interval. Empty intervals are delivered too.
async fn range(
    adapter: Adapter,
    identity: BeaconIdentity,
    generation: Generation,
    ranging: RangingParameters,
    events: mpsc::UnboundedSender<RadioEvent>,
) -> Result<(), btleplug::Error> {
    let mut adapter_events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    let mut ticker = tokio::time::interval(ranging.interval);
    ticker.tick().await;

    let mut window: Vec<(PeripheralId, RangedBeacon)> = Vec::new();
    loop {
        tokio::select! {
            event = adapter_events.next() => match event {
                Some(
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. },
                ) => {
                    if let Some(beacon) = observe(&adapter, &id, &identity, &ranging).await {
                        record(&mut window, id, beacon);
                    }
                }
                Some(_) => {}
                None => {
                    debug!("No more adapter events");
                    break;
                }
            },
            _ = ticker.tick() => {
                let beacons = window.drain(..).map(|(_, beacon)| beacon).collect();
                if events.send(RadioEvent::Ranged { generation, beacons }).is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn observe(
    adapter: &Adapter,
    id: &PeripheralId,
    identity: &BeaconIdentity,
    ranging: &RangingParameters,
) -> Option<RangedBeacon> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            debug!("Peripheral {:?} went away: {:?}", id, err);
            return None;
        }
    };
    let properties = match peripheral.properties().await {
        Ok(properties) => properties?,
        Err(err) => {
            debug!("No properties for {:?}: {:?}", id, err);
            return None;
        }
    };

    let frame = properties
        .manufacturer_data
        .get(&APPLE_COMPANY_ID)
        .and_then(|data| IBeaconFrame::parse(data))?;
    if !frame.matches(identity) {
        return None;
    }

    Some(RangedBeacon {
        major: frame.major,
        minor: frame.minor,
        proximity: ranging.proximity(properties.rssi, frame.measured_power),
        rssi: properties.rssi,
    })
}

/// Keeps first-seen order; a repeat sighting refreshes the reading in place.
fn record<I: PartialEq>(window: &mut Vec<(I, RangedBeacon)>, id: I, beacon: RangedBeacon) {
    match window.iter_mut().find(|(seen, _)| *seen == id) {
        Some((_, existing)) => *existing = beacon,
        None => window.push((id, beacon)),
    }
}
