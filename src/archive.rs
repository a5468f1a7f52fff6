//! Fire-and-forget save events for the remote reading archive.
//!
//! The connection core only ever calls `Archiver::record_*`; it never waits for a save and
//! never retries one. A full queue drops the event.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::spawn;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::types::TelemetryReading;
use crate::error::ArchiveError;

pub const ARCHIVE_QUEUE_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Record {
    Pressure { pressure: i32 },
    #[serde(rename_all = "camelCase")]
    WaterIntake { millilitres: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveEvent {
    pub identity: String,
    #[serde(flatten)]
    pub record: Record,
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
}

fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct Archiver {
    identity: String,
    sender: Sender<SaveEvent>,
}

impl Archiver {
    pub fn new(identity: String, capacity: usize) -> (Archiver, Receiver<SaveEvent>) {
        let (sender, receiver) = channel(capacity);
        (Archiver { identity, sender }, receiver)
    }

    pub fn record_pressure(&self, reading: &TelemetryReading) {
        let at = reading.received_at.unwrap_or_else(SystemTime::now);
        self.submit(Record::Pressure { pressure: reading.value }, at);
    }

    pub fn record_water_intake(&self, millilitres: u32) {
        self.submit(Record::WaterIntake { millilitres }, SystemTime::now());
    }

    fn submit(&self, record: Record, at: SystemTime) {
        let event = SaveEvent {
            identity: self.identity.clone(),
            record,
            timestamp: epoch_millis(at),
        };

        match self.sender.try_send(event) {
            Ok(()) => {},
            Err(TrySendError::Full(event)) => warn!("Archive queue is full, dropping {:?}", event.record),
            Err(TrySendError::Closed(event)) => debug!("Archive is not running, dropping {:?}", event.record),
        }
    }
}

/// Appends every save event as one JSON line to `path` until cancelled.
pub fn json_lines_sink(path: PathBuf, mut receiver: Receiver<SaveEvent>, cancel: CancellationToken) -> JoinHandle<Result<(), ArchiveError>> {
    spawn(async move {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!("Archiving readings to {}", path.to_string_lossy());

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = receiver.recv() => match event {
                    None => break 'mainloop,
                    Some(event) => {
                        let mut line = serde_json::to_string(&event)?;
                        line.push('\n');
                        file.write_all(line.as_bytes()).await?;
                    },
                },
            }
        }

        file.flush().await?;
        Ok(())
    })
}
