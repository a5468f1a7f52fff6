use std::sync::{Arc, Mutex};
use btleplug::api::{CharPropFlags, Characteristic, ValueNotification, WriteType};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::types::TelemetryRange;
use crate::device::codec;
use crate::device::constants::{CCCD_UUID, CUFF_PRESSURE_CHARACTERISTIC_UUID, CUFF_SERVICE_UUID, IS_CONNECTED_DEADLINE, WRITE_DEADLINE};
use crate::device::radio::{Link, NotificationStream};
use crate::device::store::StateStore;
use crate::device::types::{Command, TelemetryReading};
use crate::error::DeviceError;

/// Reported by the listener task of a connected bridge.
#[derive(Debug)]
pub enum LinkEvent {
    Notification(ValueNotification),
    Lost { reason: String },
}

type CharacteristicHandle = Arc<Mutex<Option<Characteristic>>>;

/// Negotiated access to the cuff's pressure characteristic over one link.
pub struct Bridge {
    link: Arc<dyn Link>,
    characteristic: CharacteristicHandle,
    write_type: WriteType,
    range: TelemetryRange,
    /// Opened right after subscribing; handed to the listener
    notifications: Option<NotificationStream>,
}

fn unsupported(reason: &str) -> DeviceError {
    DeviceError::UnsupportedDevice { reason: reason.to_string() }
}

impl Bridge {
    /// Locates the pressure characteristic, checks its capabilities and enables notifications.
    ///
    /// Every failure here is a validation failure; the link is left for the caller to tear down.
    pub async fn negotiate(link: Arc<dyn Link>, range: TelemetryRange) -> Result<Bridge, DeviceError> {
        let services = link.discover_services().await?;

        let service = services
            .iter()
            .find(|service| service.uuid == CUFF_SERVICE_UUID)
            .ok_or_else(|| unsupported("service not found"))?;

        let characteristic = service.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == CUFF_PRESSURE_CHARACTERISTIC_UUID)
            .ok_or_else(|| unsupported("characteristic not found"))?
            .clone();

        let properties = characteristic.properties;
        let write_type = if properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        }
        else if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        }
        else {
            return Err(unsupported("characteristic is not writable"));
        };

        if !properties.contains(CharPropFlags::NOTIFY) {
            return Err(unsupported("characteristic does not support notifications"));
        }

        info!("Subscribing to characteristic {:?} {:?} (descriptor {})", service.uuid, characteristic.uuid, CCCD_UUID);
        link.subscribe(&characteristic).await.map_err(|err| DeviceError::ConnectFailed {
            reason: format!("descriptor write failed: {}", err),
        })?;

        let notifications = link.notifications().await.map_err(|err| DeviceError::ConnectFailed {
            reason: format!("failed to read notifications: {}", err),
        })?;

        Ok(Bridge {
            link,
            characteristic: Arc::new(Mutex::new(Some(characteristic))),
            write_type,
            range,
            notifications: Some(notifications),
        })
    }

    pub fn writer(&self) -> CommandWriter {
        CommandWriter {
            link: self.link.clone(),
            characteristic: self.characteristic.clone(),
            write_type: self.write_type,
        }
    }

    /// Decodes a notification and publishes it if it is a valid reading.
    ///
    /// Malformed and out of range frames are logged and dropped without touching the store.
    pub fn handle_notification(&self, store: &StateStore, notification: &ValueNotification) -> Option<TelemetryReading> {
        if notification.uuid != CUFF_PRESSURE_CHARACTERISTIC_UUID {
            debug!("Ignoring notification from {:?}", notification.uuid);
            return None;
        }

        match self.validate(&notification.value) {
            Ok(value) => {
                let reading = TelemetryReading::received(value);
                store.publish_reading(reading);
                Some(reading)
            },
            Err(err) => {
                store.log(err.to_string());
                None
            },
        }
    }

    fn validate(&self, frame: &[u8]) -> Result<i32, DeviceError> {
        let value = codec::decode(frame).ok_or_else(|| DeviceError::MalformedTelemetry {
            frame: String::from_utf8_lossy(frame).trim().to_string(),
        })?;

        if !self.range.contains(value) {
            return Err(DeviceError::TelemetryOutOfRange { value, min: self.range.min, max: self.range.max });
        }

        Ok(value)
    }

    /// Forwards notifications and detects link loss until `cancel` is cancelled.
    /// Every event is tagged with `session`. A bridge can only be listened to once.
    pub fn listen(&mut self, session: u64, events: UnboundedSender<(u64, LinkEvent)>, cancel: CancellationToken, poll_delay: Duration) -> JoinHandle<()> {
        let link = self.link.clone();
        let notifications = self.notifications.take();

        spawn(async move {
            let mut notifications = match notifications {
                Some(v) => v,
                None => {
                    let _ = events.send((session, LinkEvent::Lost { reason: String::from("notifications already taken") }));
                    return;
                },
            };

            let mut poll = interval(poll_delay);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    notification = notifications.next() => match notification {
                        Some(notification) => {
                            let _ = events.send((session, LinkEvent::Notification(notification)));
                        },
                        None => {
                            let _ = events.send((session, LinkEvent::Lost { reason: String::from("notification stream closed") }));
                            break 'mainloop;
                        },
                    },
                    _ = poll.tick() => {
                        let lost = match timeout(Duration::from_millis(IS_CONNECTED_DEADLINE), link.is_connected()).await {
                            Err(_) => Some(String::from("checking for connection status took too long")),
                            Ok(Err(err)) => Some(format!("error checking for connection state: {}", err)),
                            Ok(Ok(false)) => Some(String::from("connection lost")),
                            Ok(Ok(true)) => None,
                        };

                        if let Some(reason) = lost {
                            let _ = events.send((session, LinkEvent::Lost { reason }));
                            break 'mainloop;
                        }
                    },
                }
            }
        })
    }

    /// Clears the characteristic handle and hands back the link so it can be disconnected.
    ///
    /// Writers obtained earlier fail with `NotConnected` from now on.
    pub fn teardown(self) -> Arc<dyn Link> {
        self.characteristic.lock().expect("Failed to lock characteristic handle").take();
        self.link
    }
}

/// Writes commands to the characteristic of one bridge; usable outside the manager task.
#[derive(Clone)]
pub struct CommandWriter {
    link: Arc<dyn Link>,
    characteristic: CharacteristicHandle,
    write_type: WriteType,
}

impl CommandWriter {
    pub async fn write(&self, command: Command) -> Result<(), DeviceError> {
        let characteristic = self.characteristic
            .lock()
            .expect("Failed to lock characteristic handle")
            .clone()
            .ok_or(DeviceError::NotConnected)?;

        let fut = self.link.write(&characteristic, codec::encode(command), self.write_type);

        match timeout(Duration::from_millis(WRITE_DEADLINE), fut).await {
            Err(_) => {
                warn!("Sending to data characteristic took too long");
                Err(DeviceError::CommandWriteFailed { command, reason: String::from("write timed out") })
            },
            Ok(Err(err)) => {
                warn!("Failed to send to data characteristic: {:?}", err);
                Err(DeviceError::CommandWriteFailed { command, reason: err.to_string() })
            },
            Ok(Ok(())) => Ok(()),
        }
    }
}
