use std::sync::Arc;
use log::info;
use tokio::sync::watch;

use crate::device::types::{ConnectionState, Peripheral, ScanState, TelemetryReading};

/// Everything an observer can see, published as one value so fields never mix generations.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub connection: ConnectionState,
    pub scan: ScanState,
    pub reading: TelemetryReading,
    /// Failed attempts of the current connection attempt sequence
    pub retries: u32,
    pub peripheral: Option<Peripheral>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            connection: ConnectionState::Disconnected,
            scan: ScanState::Idle,
            reading: TelemetryReading::baseline(),
            retries: 0,
            peripheral: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub seq: u64,
    pub text: String,
}

/// Latest-value store observed by collaborators.
///
/// Writers are the connection manager, the scanner and the bridge; everything else only
/// subscribes.
#[derive(Clone)]
pub struct StateStore {
    state: Arc<watch::Sender<Snapshot>>,
    log: Arc<watch::Sender<Option<LogMessage>>>,
}

impl StateStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Snapshot::default());
        let (log, _) = watch::channel(None);

        StateStore {
            state: Arc::new(state),
            log: Arc::new(log),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    pub fn subscribe_log(&self) -> watch::Receiver<Option<LogMessage>> {
        self.log.subscribe()
    }

    pub fn latest_log(&self) -> Option<LogMessage> {
        self.log.borrow().clone()
    }

    /// Applies `modify` and notifies subscribers only if the snapshot actually changed.
    pub(crate) fn update<F>(&self, modify: F) -> bool
    where
        F: FnOnce(&mut Snapshot),
    {
        self.state.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            modify(snapshot);
            *snapshot != before
        })
    }

    pub(crate) fn set_scan(&self, scan: ScanState) -> bool {
        self.update(|snapshot| snapshot.scan = scan)
    }

    pub(crate) fn publish_reading(&self, reading: TelemetryReading) -> bool {
        self.update(|snapshot| snapshot.reading = reading)
    }

    /// Publishes a user facing log message and mirrors it to the log facade.
    pub(crate) fn log(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);

        self.log.send_modify(|latest| {
            let seq = latest.as_ref().map_or(0, |message| message.seq + 1);
            *latest = Some(LogMessage { seq, text });
        });
    }
}

impl Default for StateStore {
    fn default() -> Self {
        StateStore::new()
    }
}
