use std::sync::Arc;
use async_trait::async_trait;
use btleplug::api::{Characteristic, Service, ValueNotification, WriteType};
use futures::stream::BoxStream;

use crate::device::types::Peripheral;
use crate::error::DeviceError;

#[derive(Debug, Clone)]
pub struct Advertisement {
    pub peripheral: Peripheral,
}

pub type AdvertisementStream = BoxStream<'static, Advertisement>;
pub type NotificationStream = BoxStream<'static, ValueNotification>;

/// Discovery and connection capability of the host bluetooth stack.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Starts scanning and returns every advertisement seen from now on.
    ///
    /// Fails with `PermissionDenied` / `RadioUnavailable` before touching the radio when possible.
    async fn start_scan(&self) -> Result<AdvertisementStream, DeviceError>;

    async fn stop_scan(&self) -> Result<(), DeviceError>;

    /// Establishes a link with a peripheral previously reported by `start_scan`.
    async fn connect(&self, peripheral: &Peripheral) -> Result<Arc<dyn Link>, DeviceError>;
}

/// An established link with a single peripheral.
#[async_trait]
pub trait Link: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<Service>, DeviceError>;

    /// Enables notifications on the characteristic (CCCD write).
    async fn subscribe(&self, characteristic: &Characteristic) -> Result<(), DeviceError>;

    async fn write(&self, characteristic: &Characteristic, data: &[u8], write_type: WriteType) -> Result<(), DeviceError>;

    async fn notifications(&self) -> Result<NotificationStream, DeviceError>;

    async fn is_connected(&self) -> Result<bool, DeviceError>;

    async fn disconnect(&self) -> Result<(), DeviceError>;
}
