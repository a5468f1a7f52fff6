use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral as BtlePeripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::device::radio::{Advertisement, AdvertisementStream, Link, NotificationStream, Radio};
use crate::device::types::Peripheral;
use crate::error::DeviceError;

type KnownPeripherals = Arc<Mutex<HashMap<String, BtlePeripheral>>>;

/// `Radio` backed by the platform bluetooth stack through btleplug.
pub struct BtleRadio {
    manager: Manager,
    adapters: AsyncMutex<Option<Vec<Adapter>>>,
    // every peripheral seen during a scan, by `Peripheral::id`
    known: KnownPeripherals,
}

impl BtleRadio {
    pub async fn new() -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;

        Ok(BtleRadio {
            manager,
            adapters: AsyncMutex::new(None),
            known: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn adapters(&self) -> Result<Vec<Adapter>, DeviceError> {
        let mut adapters = self.adapters.lock().await;

        if let Some(adapters) = adapters.as_ref() {
            return Ok(adapters.clone());
        }

        let found = self.manager.adapters().await?;
        if found.is_empty() {
            return Err(DeviceError::RadioUnavailable);
        }

        *adapters = Some(found.clone());
        Ok(found)
    }
}

fn peripheral_key(id: &PeripheralId) -> String {
    format!("{:?}", id)
}

fn scan_error(err: btleplug::Error) -> DeviceError {
    match DeviceError::from(err) {
        DeviceError::Btle { source } => DeviceError::ScanFailed { reason: source.to_string() },
        err => err,
    }
}

async fn advertisement_from_event(adapter: &Adapter, known: &KnownPeripherals, event: CentralEvent) -> Option<Advertisement> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
        _ => return None,
    };

    let peripheral = match adapter.peripheral(&id).await {
        Ok(v) => v,
        Err(err) => {
            warn!("Failed to query BLE adapter for peripheral: {}", err);
            return None;
        },
    };

    let properties = match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            return None;
        },
        Ok(None) => {
            debug!("Peripheral has no properties");
            return None;
        },
        Ok(Some(properties)) => properties,
    };

    // advertisements without a name can never match the name filter
    let name = properties.local_name?;
    let key = peripheral_key(&id);

    known.lock().expect("Failed to lock known peripherals").insert(key.clone(), peripheral);

    Some(Advertisement {
        peripheral: Peripheral {
            id: key,
            address: properties.address.to_string(),
            name,
        },
    })
}

#[async_trait]
impl Radio for BtleRadio {
    async fn start_scan(&self) -> Result<AdvertisementStream, DeviceError> {
        let adapters = self.adapters().await?;
        let mut streams = Vec::with_capacity(adapters.len());

        for adapter in adapters {
            info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

            let events = adapter.events().await.map_err(scan_error)?;
            // the name filter is applied by the scanner, some environments ignore platform filters anyway
            adapter.start_scan(ScanFilter::default()).await.map_err(scan_error)?;

            let known = self.known.clone();
            let stream = events.filter_map(move |event| {
                let adapter = adapter.clone();
                let known = known.clone();
                async move { advertisement_from_event(&adapter, &known, event).await }
            });
            streams.push(stream.boxed());
        }

        Ok(futures::stream::select_all(streams).boxed())
    }

    async fn stop_scan(&self) -> Result<(), DeviceError> {
        let adapters = self.adapters.lock().await.clone().unwrap_or_default();

        for adapter in adapters {
            adapter.stop_scan().await?;
        }

        Ok(())
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<Arc<dyn Link>, DeviceError> {
        let found = self.known
            .lock()
            .expect("Failed to lock known peripherals")
            .get(&peripheral.id)
            .cloned();

        let Some(btle_peripheral) = found else {
            return Err(DeviceError::ConnectFailed { reason: format!("peripheral {} is no longer known", peripheral.address) });
        };

        info!("Connecting to peripheral {} {}...", peripheral.address, peripheral.name);
        btle_peripheral.connect().await?;

        Ok(Arc::new(BtleLink { peripheral: btle_peripheral }))
    }
}

struct BtleLink {
    peripheral: BtlePeripheral,
}

#[async_trait]
impl Link for BtleLink {
    async fn discover_services(&self) -> Result<Vec<Service>, DeviceError> {
        info!("Connected; Discovering services...");
        self.peripheral.discover_services().await?;
        Ok(self.peripheral.services().into_iter().collect())
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<(), DeviceError> {
        self.peripheral.subscribe(characteristic).await?;
        Ok(())
    }

    async fn write(&self, characteristic: &Characteristic, data: &[u8], write_type: WriteType) -> Result<(), DeviceError> {
        self.peripheral.write(characteristic, data, write_type).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream, DeviceError> {
        Ok(self.peripheral.notifications().await?)
    }

    async fn is_connected(&self) -> Result<bool, DeviceError> {
        Ok(self.peripheral.is_connected().await?)
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
