//! Scripted `Radio` / `Link` used by the unit tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, Service, ValueNotification, WriteType};
use futures::StreamExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::{sleep, Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::device::constants::{CUFF_PRESSURE_CHARACTERISTIC_UUID, CUFF_SERVICE_UUID};
use crate::device::radio::{Advertisement, AdvertisementStream, Link, NotificationStream, Radio};
use crate::device::types::Peripheral;
use crate::error::DeviceError;

pub fn cuff_service(properties: CharPropFlags) -> Service {
    let characteristic = Characteristic {
        uuid: CUFF_PRESSURE_CHARACTERISTIC_UUID,
        service_uuid: CUFF_SERVICE_UUID,
        properties,
        descriptors: BTreeSet::new(),
    };

    Service {
        uuid: CUFF_SERVICE_UUID,
        primary: true,
        characteristics: BTreeSet::from([characteristic]),
    }
}

#[derive(Debug, Clone)]
pub struct LinkProfile {
    pub services: Vec<Service>,
    pub fail_subscribe: bool,
    pub fail_writes: bool,
    pub discovery_delay: Duration,
    pub disconnect_delay: Duration,
}

impl LinkProfile {
    pub fn cuff() -> Self {
        LinkProfile {
            services: vec![cuff_service(CharPropFlags::READ | CharPropFlags::WRITE | CharPropFlags::NOTIFY)],
            fail_subscribe: false,
            fail_writes: false,
            discovery_delay: Duration::ZERO,
            disconnect_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectPlan {
    Link(LinkProfile),
    Fail,
    /// Never resolves
    Hang,
}

#[derive(Default)]
pub struct FakeRadio {
    scan_sender: Mutex<Option<UnboundedSender<Advertisement>>>,
    scan_failures: Mutex<VecDeque<DeviceError>>,
    start_scan_calls: AtomicUsize,
    stop_scan_calls: AtomicUsize,
    plans: Mutex<VecDeque<ConnectPlan>>,
    default_plan: Mutex<Option<ConnectPlan>>,
    connect_calls: Mutex<Vec<Instant>>,
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeRadio::default())
    }

    pub fn advertise(&self, name: &str, address: &str) {
        let sender = self.scan_sender.lock().unwrap();
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(Advertisement {
                peripheral: Peripheral {
                    id: address.to_string(),
                    address: address.to_string(),
                    name: name.to_string(),
                },
            });
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_sender.lock().unwrap().is_some()
    }

    pub fn fail_next_scan(&self, error: DeviceError) {
        self.scan_failures.lock().unwrap().push_back(error);
    }

    /// Plans used for the next connects, in order; afterwards `set_default_plan` applies.
    pub fn plan_connect(&self, plan: ConnectPlan) {
        self.plans.lock().unwrap().push_back(plan);
    }

    pub fn set_default_plan(&self, plan: ConnectPlan) {
        *self.default_plan.lock().unwrap() = Some(plan);
    }

    pub fn start_scan_calls(&self) -> usize {
        self.start_scan_calls.load(Ordering::SeqCst)
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.stop_scan_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> Vec<Instant> {
        self.connect_calls.lock().unwrap().clone()
    }

    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().unwrap().clone()
    }

    pub fn last_link(&self) -> Arc<FakeLink> {
        self.links.lock().unwrap().last().cloned().expect("no link was established")
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn start_scan(&self) -> Result<AdvertisementStream, DeviceError> {
        self.start_scan_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.scan_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let (sender, receiver) = unbounded_channel();
        *self.scan_sender.lock().unwrap() = Some(sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn stop_scan(&self) -> Result<(), DeviceError> {
        self.stop_scan_calls.fetch_add(1, Ordering::SeqCst);
        self.scan_sender.lock().unwrap().take();
        Ok(())
    }

    async fn connect(&self, _peripheral: &Peripheral) -> Result<Arc<dyn Link>, DeviceError> {
        self.connect_calls.lock().unwrap().push(Instant::now());

        let plan = self.plans.lock().unwrap().pop_front()
            .or_else(|| self.default_plan.lock().unwrap().clone())
            .unwrap_or_else(|| ConnectPlan::Link(LinkProfile::cuff()));

        match plan {
            ConnectPlan::Fail => Err(DeviceError::ConnectFailed { reason: String::from("link refused") }),
            ConnectPlan::Hang => std::future::pending::<Result<Arc<dyn Link>, DeviceError>>().await,
            ConnectPlan::Link(profile) => {
                let link = Arc::new(FakeLink::new(profile));
                self.links.lock().unwrap().push(link.clone());
                Ok(link)
            },
        }
    }
}

pub struct FakeLink {
    profile: LinkProfile,
    connected: AtomicBool,
    subscribed: AtomicBool,
    notification_sender: Mutex<Option<UnboundedSender<ValueNotification>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    disconnect_calls: AtomicUsize,
}

impl FakeLink {
    fn new(profile: LinkProfile) -> Self {
        FakeLink {
            profile,
            connected: AtomicBool::new(true),
            subscribed: AtomicBool::new(false),
            notification_sender: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            disconnect_calls: AtomicUsize::new(0),
        }
    }

    /// Pushes a notification of the pressure characteristic.
    pub fn notify(&self, value: &[u8]) {
        self.notify_from(CUFF_PRESSURE_CHARACTERISTIC_UUID, value);
    }

    pub fn notify_from(&self, uuid: uuid::Uuid, value: &[u8]) {
        if let Some(sender) = self.notification_sender.lock().unwrap().as_ref() {
            let _ = sender.send(ValueNotification { uuid, value: value.to_vec() });
        }
    }

    /// Simulates the peripheral going out of range.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for FakeLink {
    async fn discover_services(&self) -> Result<Vec<Service>, DeviceError> {
        sleep(self.profile.discovery_delay).await;
        Ok(self.profile.services.clone())
    }

    async fn subscribe(&self, _characteristic: &Characteristic) -> Result<(), DeviceError> {
        if self.profile.fail_subscribe {
            return Err(DeviceError::ConnectFailed { reason: String::from("descriptor write failed") });
        }

        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, _characteristic: &Characteristic, data: &[u8], _write_type: WriteType) -> Result<(), DeviceError> {
        if self.profile.fail_writes {
            return Err(DeviceError::ConnectFailed { reason: String::from("write rejected") });
        }

        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream, DeviceError> {
        let (sender, receiver) = unbounded_channel();
        *self.notification_sender.lock().unwrap() = Some(sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn is_connected(&self) -> Result<bool, DeviceError> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.profile.disconnect_delay).await;
        self.connected.store(false, Ordering::SeqCst);
        self.notification_sender.lock().unwrap().take();
        Ok(())
    }
}
