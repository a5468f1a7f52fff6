use std::sync::Arc;
use futures::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::spawn;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::device::radio::Radio;
use crate::device::store::StateStore;
use crate::device::types::{Peripheral, ScanState};
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NameMatch {
    /// Case-insensitive substring of the advertised name
    Contains,
    Exact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter {
    pub pattern: String,
    pub mode: NameMatch,
}

impl NameFilter {
    pub fn matches(&self, name: &str) -> bool {
        match self.mode {
            NameMatch::Contains => name.to_lowercase().contains(&self.pattern.to_lowercase()),
            NameMatch::Exact => name == self.pattern,
        }
    }
}

#[derive(Debug)]
pub enum ScanEvent {
    Started { scan: u64 },
    Found { scan: u64, peripheral: Peripheral },
    Failed { scan: u64, error: DeviceError },
    /// The radio stopped delivering advertisements on its own
    Ended { scan: u64 },
}

struct ScanSession {
    id: u64,
    started: bool,
    cancel: CancellationToken,
}

/// Runs at most one scan session at a time and reports at most one candidate per session.
///
/// The scan task only reports `ScanEvent`s; all ScanState changes happen in the methods
/// below, which the connection manager calls from its own task.
pub struct Scanner {
    radio: Arc<dyn Radio>,
    store: StateStore,
    filter: NameFilter,
    events: UnboundedSender<ScanEvent>,
    session: Option<ScanSession>,
    next_id: u64,
}

impl Scanner {
    pub fn new(radio: Arc<dyn Radio>, store: StateStore, filter: NameFilter, events: UnboundedSender<ScanEvent>) -> Self {
        Scanner {
            radio,
            store,
            filter,
            events,
            session: None,
            next_id: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Starts a scan session unless one is already running. Returns its id.
    pub fn start(&mut self) -> Option<u64> {
        if self.session.is_some() {
            debug!("Scan already active");
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;

        let cancel = CancellationToken::new();
        self.session = Some(ScanSession { id, started: false, cancel: cancel.clone() });
        self.store.log("Starting scan...");

        spawn(scan_task(id, self.radio.clone(), self.filter.clone(), self.events.clone(), cancel));
        Some(id)
    }

    /// Cancels the running scan session. Returns false if there was none.
    pub fn stop(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                session.cancel.cancel();
                self.store.set_scan(ScanState::Idle);
                self.store.log("Scan stopped");
                true
            },
            None => false,
        }
    }

    fn take_current(&mut self, scan: u64) -> Option<ScanSession> {
        match &self.session {
            Some(session) if session.id == scan => self.session.take(),
            _ => None,
        }
    }

    /// Returns true if the event belongs to the current session and the radio accepted the scan.
    pub fn on_started(&mut self, scan: u64) -> bool {
        match &mut self.session {
            Some(session) if session.id == scan && !session.started => {
                session.started = true;
                self.store.set_scan(ScanState::Scanning);
                true
            },
            _ => false,
        }
    }

    /// Returns the candidate if it is the first one of the current session.
    pub fn on_found(&mut self, scan: u64, peripheral: Peripheral) -> Option<Peripheral> {
        self.take_current(scan)?;
        self.store.set_scan(ScanState::Idle);
        self.store.log(format!("Found device: {}", peripheral.name));
        Some(peripheral)
    }

    /// Returns true if the current session ended because of this failure.
    pub fn on_failed(&mut self, scan: u64, error: &DeviceError) -> bool {
        if self.take_current(scan).is_none() {
            return false;
        }

        self.store.set_scan(ScanState::Idle);
        match error {
            DeviceError::PermissionDenied => self.store.log("Permissions not granted"),
            DeviceError::RadioUnavailable => self.store.log("Bluetooth is disabled"),
            error => self.store.log(format!("Scan failed with error: {}", error)),
        }
        true
    }

    pub fn on_ended(&mut self, scan: u64) -> bool {
        if self.take_current(scan).is_none() {
            return false;
        }

        self.store.set_scan(ScanState::Idle);
        self.store.log("Scan stopped");
        true
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
        }
    }
}

async fn stop_radio_scan(radio: &Arc<dyn Radio>) {
    if let Err(err) = radio.stop_scan().await {
        warn!("Error stopping scan: {}", err);
    }
}

async fn scan_task(scan: u64, radio: Arc<dyn Radio>, filter: NameFilter, events: UnboundedSender<ScanEvent>, cancel: CancellationToken) {
    let started = tokio::select! {
        _ = cancel.cancelled() => None,
        result = radio.start_scan() => Some(result),
    };

    let mut advertisements = match started {
        None => return,
        Some(Err(error)) => {
            let _ = events.send(ScanEvent::Failed { scan, error });
            return;
        },
        Some(Ok(stream)) => stream,
    };

    if cancel.is_cancelled() {
        stop_radio_scan(&radio).await;
        return;
    }
    let _ = events.send(ScanEvent::Started { scan });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                stop_radio_scan(&radio).await;
                return;
            },
            advertisement = advertisements.next() => match advertisement {
                None => {
                    let _ = events.send(ScanEvent::Ended { scan });
                    return;
                },
                Some(advertisement) => {
                    if !filter.matches(&advertisement.peripheral.name) {
                        debug!("Ignoring advertisement from {:?}", advertisement.peripheral.name);
                        continue;
                    }

                    stop_radio_scan(&radio).await;
                    let _ = events.send(ScanEvent::Found { scan, peripheral: advertisement.peripheral });
                    return;
                },
            },
        }
    }
}
