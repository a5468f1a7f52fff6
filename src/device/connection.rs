use std::sync::Arc;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::archive::Archiver;
use crate::config::types::{Config, TelemetryRange};
use crate::device::bridge::{Bridge, LinkEvent};
use crate::device::constants::DISCONNECT_DEADLINE;
use crate::device::radio::{Link, Radio};
use crate::device::scanner::{NameFilter, ScanEvent, Scanner};
use crate::device::store::StateStore;
use crate::device::timers::{Scheduler, TimerFired, TimerKind};
use crate::device::types::{Command, ConnectionState, Peripheral, TelemetryReading};
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionPolicy {
    pub name_filter: NameFilter,
    pub telemetry_range: TelemetryRange,
    pub scan_timeout: Duration,
    /// Retries after the first failed attempt, before falling back to rescanning
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub rescan_initial_delay: Duration,
    pub rescan_interval: Duration,
    pub connect_deadline: Duration,
    pub link_poll_delay: Duration,
}

impl From<&Config> for ConnectionPolicy {
    fn from(config: &Config) -> Self {
        ConnectionPolicy {
            name_filter: NameFilter {
                pattern: config.name_filter.clone(),
                mode: config.name_match,
            },
            telemetry_range: config.telemetry_range,
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
            max_retries: config.connect_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            rescan_initial_delay: Duration::from_millis(config.rescan_initial_delay_ms),
            rescan_interval: Duration::from_millis(config.rescan_interval_ms),
            connect_deadline: Duration::from_millis(config.connect_deadline_ms),
            link_poll_delay: Duration::from_millis(config.link_poll_delay_ms),
        }
    }
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        ConnectionPolicy::from(&Config::default())
    }
}

enum Request {
    StartScan,
    StopScan,
    Disconnect,
    SendCommand {
        command: Command,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
}

enum AttemptOutcome {
    Connected(Bridge),
    Failed(DeviceError),
    Cancelled,
}

/// Results of work spawned on behalf of a session, tagged with the session id.
enum SessionEvent {
    AttemptFinished {
        session: u64,
        outcome: AttemptOutcome,
    },
    TeardownComplete {
        session: u64,
    },
    WriteFinished {
        session: u64,
        command: Command,
        result: Result<(), DeviceError>,
        reply: oneshot::Sender<Result<(), DeviceError>>,
    },
}

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Session {
    id: u64,
    peripheral: Peripheral,
    retries: u32,
    /// Cancels the attempt that is in flight, if any
    attempt: Option<CancellationToken>,
    bridge: Option<Bridge>,
    listener: Option<Listener>,
}

impl Session {
    fn stop_listener(&mut self) -> Option<JoinHandle<()>> {
        self.listener.take().map(|listener| {
            listener.cancel.cancel();
            listener.handle
        })
    }
}

async fn disconnect_link(link: Arc<dyn Link>) {
    match timeout(Duration::from_millis(DISCONNECT_DEADLINE), link.disconnect()).await {
        Err(_) => warn!("Disconnecting took too long"),
        Ok(Err(err)) => warn!("Error while disconnecting: {}", err),
        Ok(Ok(())) => debug!("Link disconnected"),
    }
}

/// Connects and negotiates within `deadline`. A link that was established but not handed
/// over in a bridge is disconnected before returning.
async fn attempt_connection(
    radio: Arc<dyn Radio>,
    peripheral: Peripheral,
    range: TelemetryRange,
    deadline: Instant,
    cancel: CancellationToken,
) -> AttemptOutcome {
    let mut established: Option<Arc<dyn Link>> = None;

    let result = {
        let work = async {
            let link = radio.connect(&peripheral).await?;
            established = Some(link.clone());
            let bridge = Bridge::negotiate(link, range).await?;
            Ok::<_, DeviceError>(bridge)
        };

        tokio::select! {
            _ = cancel.cancelled() => None,
            result = timeout_at(deadline, work) => Some(result),
        }
    };

    let failure = match result {
        None => None,
        Some(Ok(Ok(bridge))) => return AttemptOutcome::Connected(bridge),
        Some(Ok(Err(err))) => Some(err),
        Some(Err(_)) => Some(DeviceError::ConnectFailed { reason: String::from("connection attempt took too long") }),
    };

    if let Some(link) = established {
        disconnect_link(link).await;
    }

    match failure {
        None => AttemptOutcome::Cancelled,
        Some(err) => AttemptOutcome::Failed(err),
    }
}

struct Inbox {
    requests: UnboundedReceiver<Request>,
    scan_events: UnboundedReceiver<ScanEvent>,
    timer_events: UnboundedReceiver<TimerFired>,
    session_events: UnboundedReceiver<SessionEvent>,
    link_events: UnboundedReceiver<(u64, LinkEvent)>,
}

/// Owns the state machine. Every handler runs on the actor task; anything that has to wait
/// on the radio is spawned and reports back through the inbox.
struct Actor {
    radio: Arc<dyn Radio>,
    policy: ConnectionPolicy,
    store: StateStore,
    scanner: Scanner,
    timers: Scheduler,
    archive: Option<Archiver>,
    state: ConnectionState,
    session: Option<Session>,
    next_session: u64,
    session_events: UnboundedSender<SessionEvent>,
    link_events: UnboundedSender<(u64, LinkEvent)>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut inbox: Inbox) {
        let cancel = self.cancel.clone();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                request = inbox.requests.recv() => match request {
                    None => break 'mainloop,
                    Some(request) => self.on_request(request),
                },
                Some(event) = inbox.scan_events.recv() => self.on_scan_event(event),
                Some(fired) = inbox.timer_events.recv() => self.on_timer(fired),
                Some(event) = inbox.session_events.recv() => self.on_session_event(event),
                Some((session, event)) = inbox.link_events.recv() => self.on_link_event(session, event),
            }
        }

        self.shutdown().await;
    }

    /// Publishes the connection state together with the session fields. Any change of state
    /// resets the reading to the baseline.
    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        self.state = to;

        let retries = self.session.as_ref().map_or(0, |session| session.retries);
        let peripheral = self.session.as_ref().map(|session| session.peripheral.clone());

        self.store.update(|snapshot| {
            snapshot.connection = to;
            snapshot.retries = retries;
            snapshot.peripheral = peripheral;
            if from != to {
                snapshot.reading = TelemetryReading::baseline();
            }
        });

        if from != to {
            info!("Connection state {} -> {}", from, to);
        }
    }

    fn is_current(&self, session: u64) -> bool {
        self.session.as_ref().map_or(false, |current| current.id == session)
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::StartScan => self.start_scan(),
            Request::StopScan => self.stop_scan(),
            Request::Disconnect => self.disconnect(),
            Request::SendCommand { command, reply } => self.send_command(command, reply),
        }
    }

    fn start_scan(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {},
            ConnectionState::Scanning => {
                debug!("Scan already active");
                return;
            },
            state => {
                debug!("Not scanning while {}", state);
                return;
            },
        }

        // Scanning is published once the radio accepted the scan
        if self.scanner.start().is_some() {
            self.timers.schedule(TimerKind::ScanTimeout, self.policy.scan_timeout);
        }
    }

    fn stop_scan(&mut self) {
        // stopping also ends the periodic rescan cycle
        self.timers.cancel(TimerKind::Rescan);

        if !self.scanner.stop() {
            return;
        }

        self.timers.cancel(TimerKind::ScanTimeout);
        if self.state == ConnectionState::Scanning {
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn disconnect(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {
                // a pending rescan must not bring the link back
                self.timers.cancel_all();
                self.scanner.stop();
            },
            ConnectionState::Disconnecting => {
                debug!("Disconnect already in progress");
            },
            ConnectionState::Scanning => {
                self.timers.cancel_all();
                self.scanner.stop();
                self.transition(ConnectionState::Disconnected);
            },
            ConnectionState::Connecting => {
                self.timers.cancel_all();

                let (id, in_flight) = match self.session.as_mut() {
                    Some(session) => {
                        let in_flight = match session.attempt.take() {
                            Some(cancel) => {
                                cancel.cancel();
                                true
                            },
                            None => false,
                        };
                        (session.id, in_flight)
                    },
                    None => {
                        self.transition(ConnectionState::Disconnected);
                        return;
                    },
                };

                self.transition(ConnectionState::Disconnecting);
                self.store.log("Disconnecting...");

                // without an attempt in flight no link exists, so teardown is already complete
                if !in_flight {
                    let _ = self.session_events.send(SessionEvent::TeardownComplete { session: id });
                }
            },
            ConnectionState::Connected => {
                self.timers.cancel_all();

                let (id, bridge) = match self.session.as_mut() {
                    Some(session) => {
                        session.stop_listener();
                        (session.id, session.bridge.take())
                    },
                    None => {
                        self.transition(ConnectionState::Disconnected);
                        return;
                    },
                };

                self.transition(ConnectionState::Disconnecting);
                self.store.log("Disconnecting...");

                match bridge {
                    Some(bridge) => self.teardown_in_background(id, bridge),
                    None => {
                        let _ = self.session_events.send(SessionEvent::TeardownComplete { session: id });
                    },
                }
            },
        }
    }

    fn send_command(&mut self, command: Command, reply: oneshot::Sender<Result<(), DeviceError>>) {
        let writer = match (self.state, self.session.as_ref()) {
            (ConnectionState::Connected, Some(session)) => session.bridge
                .as_ref()
                .map(|bridge| (session.id, bridge.writer())),
            _ => None,
        };

        let (id, writer) = match writer {
            Some(v) => v,
            None => {
                let err = DeviceError::NotConnected;
                self.store.log(err.to_string());
                let _ = reply.send(Err(err));
                return;
            },
        };

        let events = self.session_events.clone();
        spawn(async move {
            let result = writer.write(command).await;
            let _ = events.send(SessionEvent::WriteFinished { session: id, command, result, reply });
        });
    }

    fn on_scan_event(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::Started { scan } => {
                if self.scanner.on_started(scan) && self.state == ConnectionState::Disconnected {
                    self.transition(ConnectionState::Scanning);
                }
            },
            ScanEvent::Found { scan, peripheral } => {
                if let Some(peripheral) = self.scanner.on_found(scan, peripheral) {
                    self.timers.cancel(TimerKind::ScanTimeout);
                    self.begin_session(peripheral);
                }
            },
            ScanEvent::Failed { scan, error } => {
                if !self.scanner.on_failed(scan, &error) {
                    return;
                }

                self.timers.cancel(TimerKind::ScanTimeout);
                if error.needs_remediation() {
                    // rescanning can not succeed until the user fixes the radio
                    self.timers.cancel(TimerKind::Rescan);
                }

                if self.state == ConnectionState::Scanning {
                    self.transition(ConnectionState::Disconnected);
                }
            },
            ScanEvent::Ended { scan } => {
                if self.scanner.on_ended(scan) {
                    self.timers.cancel(TimerKind::ScanTimeout);
                    if self.state == ConnectionState::Scanning {
                        self.transition(ConnectionState::Disconnected);
                    }
                }
            },
        }
    }

    fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.fire(fired) {
            debug!("Ignoring stale {:?} timer", fired.kind);
            return;
        }

        match fired.kind {
            TimerKind::ScanTimeout => {
                if self.scanner.stop() {
                    self.store.log("Device not found after scan timeout");
                    if self.state == ConnectionState::Scanning {
                        self.transition(ConnectionState::Disconnected);
                    }
                }
            },
            TimerKind::RetryAttempt => {
                if self.state == ConnectionState::Connecting {
                    self.start_attempt();
                }
            },
            TimerKind::Rescan => match self.state {
                ConnectionState::Connected => debug!("Connected; periodic scan stopped"),
                ConnectionState::Disconnected => {
                    self.timers.schedule(TimerKind::Rescan, self.policy.rescan_interval);
                    self.store.log("Connection lost. Starting periodic scan...");
                    self.start_scan();
                },
                _ => self.timers.schedule(TimerKind::Rescan, self.policy.rescan_interval),
            },
        }
    }

    fn begin_session(&mut self, peripheral: Peripheral) {
        if self.session.is_some() {
            warn!("Ignoring candidate {}; a session already exists", peripheral.address);
            return;
        }

        let id = self.next_session;
        self.next_session += 1;

        self.session = Some(Session {
            id,
            peripheral,
            retries: 0,
            attempt: None,
            bridge: None,
            listener: None,
        });
        self.transition(ConnectionState::Connecting);
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };

        if session.attempt.is_some() {
            debug!("Connection attempt already in flight");
            return;
        }

        let cancel = self.cancel.child_token();
        session.attempt = Some(cancel.clone());
        info!(
            "Connecting to {} {} (attempt {})",
            session.peripheral.name,
            session.peripheral.address,
            session.retries + 1,
        );

        let id = session.id;
        let radio = self.radio.clone();
        let peripheral = session.peripheral.clone();
        let range = self.policy.telemetry_range;
        let deadline = Instant::now() + self.policy.connect_deadline;
        let events = self.session_events.clone();

        spawn(async move {
            let outcome = attempt_connection(radio, peripheral, range, deadline, cancel).await;
            let _ = events.send(SessionEvent::AttemptFinished { session: id, outcome });
        });
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::AttemptFinished { session, outcome } => self.on_attempt_finished(session, outcome),
            SessionEvent::TeardownComplete { session } => self.on_teardown_complete(session),
            SessionEvent::WriteFinished { session, command, result, reply } => {
                match &result {
                    Ok(()) => self.store.log(format!("Command sent: {}", command)),
                    Err(err) => self.store.log(err.to_string()),
                }
                debug!("Write of {} for session #{} finished", command, session);
                let _ = reply.send(result);
            },
        }
    }

    fn on_attempt_finished(&mut self, id: u64, outcome: AttemptOutcome) {
        if !self.is_current(id) {
            debug!("Ignoring outcome of attempt for session #{}", id);
            if let AttemptOutcome::Connected(bridge) = outcome {
                spawn(disconnect_link(bridge.teardown()));
            }
            return;
        }

        if let Some(session) = self.session.as_mut() {
            session.attempt = None;
        }

        match (self.state, outcome) {
            (ConnectionState::Connecting, AttemptOutcome::Connected(bridge)) => self.on_connected(bridge),
            (ConnectionState::Connecting, AttemptOutcome::Failed(err)) => self.on_attempt_failed(err),
            (ConnectionState::Disconnecting, AttemptOutcome::Connected(bridge)) => self.teardown_in_background(id, bridge),
            // the attempt task already disconnected whatever link it had
            (ConnectionState::Disconnecting, _) => self.on_teardown_complete(id),
            (state, AttemptOutcome::Connected(bridge)) => {
                warn!("Unexpected connection while {}", state);
                spawn(disconnect_link(bridge.teardown()));
            },
            (state, _) => debug!("Ignoring attempt outcome while {}", state),
        }
    }

    fn on_connected(&mut self, mut bridge: Bridge) {
        self.timers.cancel(TimerKind::RetryAttempt);
        self.timers.cancel(TimerKind::Rescan);

        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };

        session.retries = 0;
        let cancel = self.cancel.child_token();
        let handle = bridge.listen(session.id, self.link_events.clone(), cancel.clone(), self.policy.link_poll_delay);
        session.listener = Some(Listener { cancel, handle });
        session.bridge = Some(bridge);
        let name = session.peripheral.name.clone();

        self.transition(ConnectionState::Connected);
        self.store.log(format!("Connected to {}", name));
    }

    fn on_attempt_failed(&mut self, err: DeviceError) {
        let max_retries = self.policy.max_retries;
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };

        if session.retries < max_retries {
            session.retries += 1;
            warn!("Connection attempt failed: {}; retrying ({}/{})", err, session.retries, max_retries);
            self.timers.schedule(TimerKind::RetryAttempt, self.policy.retry_delay);
            // publishes the retry counter
            self.transition(ConnectionState::Connecting);
            return;
        }

        self.session = None;
        self.timers.cancel(TimerKind::RetryAttempt);
        self.transition(ConnectionState::Disconnected);
        self.store.log(format!("Failed to connect: {}", err));
        self.timers.schedule(TimerKind::Rescan, self.policy.rescan_initial_delay);
    }

    fn on_link_event(&mut self, id: u64, event: LinkEvent) {
        if self.state != ConnectionState::Connected || !self.is_current(id) {
            debug!("Ignoring link event of session #{}", id);
            return;
        }

        match event {
            LinkEvent::Notification(notification) => {
                let bridge = match self.session.as_ref().and_then(|session| session.bridge.as_ref()) {
                    Some(bridge) => bridge,
                    None => return,
                };

                if let Some(reading) = bridge.handle_notification(&self.store, &notification) {
                    if let Some(archive) = &self.archive {
                        archive.record_pressure(&reading);
                    }
                }
            },
            LinkEvent::Lost { reason } => self.on_link_lost(reason),
        }
    }

    fn on_link_lost(&mut self, reason: String) {
        if let Some(mut session) = self.session.take() {
            session.stop_listener();
            if let Some(bridge) = session.bridge.take() {
                spawn(disconnect_link(bridge.teardown()));
            }
        }

        self.transition(ConnectionState::Disconnected);
        self.store.log(format!("Disconnected: {}", reason));
        self.timers.schedule(TimerKind::Rescan, self.policy.rescan_initial_delay);
    }

    fn teardown_in_background(&self, id: u64, bridge: Bridge) {
        let link = bridge.teardown();
        let events = self.session_events.clone();

        spawn(async move {
            disconnect_link(link).await;
            let _ = events.send(SessionEvent::TeardownComplete { session: id });
        });
    }

    fn on_teardown_complete(&mut self, id: u64) {
        if self.state != ConnectionState::Disconnecting || !self.is_current(id) {
            debug!("Ignoring teardown of session #{}", id);
            return;
        }

        self.session = None;
        self.transition(ConnectionState::Disconnected);
        self.store.log("Disconnected");
    }

    async fn shutdown(mut self) {
        self.scanner.stop();
        self.timers.cancel_all();

        if let Some(mut session) = self.session.take() {
            if let Some(cancel) = session.attempt.take() {
                cancel.cancel();
            }

            if let Some(handle) = session.stop_listener() {
                info!("Waiting for link listener to stop");
                let _ = handle.await;
            }

            if let Some(bridge) = session.bridge.take() {
                disconnect_link(bridge.teardown()).await;
            }
        }

        self.transition(ConnectionState::Disconnected);
        info!("Connection manager stopped");
    }
}

/// Handle to the connection manager task. Cheap to clone; every method only enqueues.
#[derive(Clone)]
pub struct ConnectionManager {
    requests: UnboundedSender<Request>,
    store: StateStore,
}

impl ConnectionManager {
    /// Spawns the manager task. It runs until `cancel` is cancelled or every handle is dropped.
    pub fn spawn(
        radio: Arc<dyn Radio>,
        policy: ConnectionPolicy,
        archive: Option<Archiver>,
        cancel: CancellationToken,
    ) -> (ConnectionManager, JoinHandle<()>) {
        let store = StateStore::new();

        let (requests_sender, requests) = unbounded_channel();
        let (scan_sender, scan_events) = unbounded_channel();
        let (timer_sender, timer_events) = unbounded_channel();
        let (session_sender, session_events) = unbounded_channel();
        let (link_sender, link_events) = unbounded_channel();

        let scanner = Scanner::new(radio.clone(), store.clone(), policy.name_filter.clone(), scan_sender);

        let actor = Actor {
            radio,
            policy,
            store: store.clone(),
            scanner,
            timers: Scheduler::new(timer_sender),
            archive,
            state: ConnectionState::Disconnected,
            session: None,
            next_session: 0,
            session_events: session_sender,
            link_events: link_sender,
            cancel,
        };

        let inbox = Inbox {
            requests,
            scan_events,
            timer_events,
            session_events,
            link_events,
        };

        let handle = spawn(actor.run(inbox));
        (ConnectionManager { requests: requests_sender, store }, handle)
    }

    pub fn store(&self) -> StateStore {
        self.store.clone()
    }

    fn request(&self, request: Request) -> Result<(), DeviceError> {
        self.requests.send(request).map_err(|_| DeviceError::ManagerStopped)
    }

    pub fn start_scan(&self) -> Result<(), DeviceError> {
        self.request(Request::StartScan)
    }

    pub fn stop_scan(&self) -> Result<(), DeviceError> {
        self.request(Request::StopScan)
    }

    pub fn disconnect(&self) -> Result<(), DeviceError> {
        self.request(Request::Disconnect)
    }

    /// Resolves once the command was written, or immediately with `NotConnected`.
    pub async fn send_command(&self, command: Command) -> Result<(), DeviceError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::SendCommand { command, reply })?;
        response.await.map_err(|_| DeviceError::ManagerStopped)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;
    use crate::archive::Record;
    use crate::device::fake::{ConnectPlan, FakeRadio, LinkProfile};
    use crate::device::store::Snapshot;
    use crate::device::types::ScanState;

    fn start(radio: &Arc<FakeRadio>) -> (ConnectionManager, StateStore) {
        start_with(radio, None)
    }

    fn start_with(radio: &Arc<FakeRadio>, archive: Option<Archiver>) -> (ConnectionManager, StateStore) {
        let (manager, _task) = ConnectionManager::spawn(radio.clone(), ConnectionPolicy::default(), archive, CancellationToken::new());
        let store = manager.store();
        (manager, store)
    }

    async fn wait_for<F>(store: &StateStore, predicate: F) -> Snapshot
    where
        F: Fn(&Snapshot) -> bool,
    {
        let mut receiver = store.subscribe();
        let snapshot = timeout(Duration::from_secs(60), receiver.wait_for(|snapshot| predicate(snapshot)))
            .await
            .expect("timed out waiting for the state store")
            .expect("state store closed")
            .clone();
        snapshot
    }

    async fn wait_for_log(store: &StateStore, text: &str) {
        let mut receiver = store.subscribe_log();
        timeout(Duration::from_secs(60), receiver.wait_for(|message| {
            message.as_ref().map_or(false, |message| message.text == text)
        }))
            .await
            .expect("timed out waiting for log message")
            .expect("state store closed");
    }

    fn being(state: ConnectionState) -> impl Fn(&Snapshot) -> bool {
        move |snapshot| snapshot.connection == state
    }

    async fn scanning(radio: &Arc<FakeRadio>, manager: &ConnectionManager) {
        manager.start_scan().unwrap();
        wait_for(&manager.store(), |snapshot| snapshot.scan == ScanState::Scanning).await;
        assert!(radio.is_scanning());
    }

    async fn connected(radio: &Arc<FakeRadio>, manager: &ConnectionManager) -> Snapshot {
        scanning(radio, manager).await;
        radio.advertise("XIAO-BLE", "AA:01");
        wait_for(&manager.store(), being(ConnectionState::Connected)).await
    }

    #[tokio::test(start_paused = true)]
    async fn connects_to_first_matching_advertisement() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);

        scanning(&radio, &manager).await;
        assert_eq!(store.snapshot().connection, ConnectionState::Scanning);

        radio.advertise("Heart rate", "AA:00");
        radio.advertise("XIAO-BLE", "AA:01");
        let snapshot = wait_for(&store, being(ConnectionState::Connected)).await;

        assert_eq!(snapshot.scan, ScanState::Idle);
        assert_eq!(snapshot.retries, 0);
        assert_eq!(snapshot.peripheral.unwrap().address, "AA:01");
        assert_eq!(radio.stop_scan_calls(), 1);
        assert_eq!(radio.connect_calls().len(), 1);
        assert!(radio.last_link().is_subscribed());
        assert_eq!(store.latest_log().unwrap().text, "Connected to XIAO-BLE");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_retry_then_rescan() {
        let radio = FakeRadio::new();
        radio.set_default_plan(ConnectPlan::Fail);
        let (manager, store) = start(&radio);

        scanning(&radio, &manager).await;
        radio.advertise("XIAO-BLE", "AA:01");
        let snapshot = wait_for(&store, being(ConnectionState::Disconnected)).await;

        assert_eq!(snapshot.reading, TelemetryReading::baseline());
        assert!(snapshot.peripheral.is_none());
        assert_eq!(store.latest_log().unwrap().text, "Failed to connect: Connecting to peripheral failed: link refused");

        let calls = radio.connect_calls();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(100));
        }

        // periodic rescans keep going while scans fail
        for _ in 0..3 {
            radio.fail_next_scan(DeviceError::ScanFailed { reason: String::from("busy") });
        }
        assert_eq!(radio.start_scan_calls(), 1);
        sleep(Duration::from_millis(4_999)).await;
        assert_eq!(radio.start_scan_calls(), 1);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(radio.start_scan_calls(), 2);
        sleep(Duration::from_millis(1_498)).await;
        assert_eq!(radio.start_scan_calls(), 2);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(radio.start_scan_calls(), 3);
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(radio.start_scan_calls(), 4);
        assert_eq!(store.snapshot().scan, ScanState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_a_retry_succeeds() {
        let radio = FakeRadio::new();
        radio.plan_connect(ConnectPlan::Fail);
        radio.plan_connect(ConnectPlan::Fail);
        let (manager, store) = start(&radio);

        scanning(&radio, &manager).await;
        radio.advertise("XIAO-BLE", "AA:01");
        wait_for(&store, |snapshot| snapshot.retries == 2).await;
        let snapshot = wait_for(&store, being(ConnectionState::Connected)).await;

        assert_eq!(snapshot.retries, 0);
        assert_eq!(radio.connect_calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_hits_connect_deadline() {
        let radio = FakeRadio::new();
        radio.plan_connect(ConnectPlan::Hang);
        let (manager, store) = start(&radio);

        scanning(&radio, &manager).await;
        radio.advertise("XIAO-BLE", "AA:01");
        wait_for(&store, being(ConnectionState::Connected)).await;

        let calls = radio.connect_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1] - calls[0], Duration::from_millis(10_000 + 100));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_keeps_last_reading() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);
        connected(&radio, &manager).await;

        radio.last_link().notify(b"57\n");
        let snapshot = wait_for(&store, |snapshot| snapshot.reading.value == 57).await;
        assert!(!snapshot.reading.is_baseline());

        radio.last_link().notify(b"xx");
        wait_for_log(&store, "Invalid pressure data: \"xx\"").await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.reading.value, 57);
        assert_eq!(snapshot.connection, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_readings_are_archived() {
        let radio = FakeRadio::new();
        let (archiver, mut saved) = Archiver::new(String::from("nurse@example.com"), 8);
        let (manager, store) = start_with(&radio, Some(archiver));
        connected(&radio, &manager).await;

        radio.last_link().notify(b"42");
        radio.last_link().notify(b"-3");
        wait_for(&store, |snapshot| snapshot.reading.value == 42).await;
        sleep(Duration::from_millis(10)).await;

        let event = saved.try_recv().unwrap();
        assert_eq!(event.identity, "nurse@example.com");
        assert_eq!(event.record, Record::Pressure { pressure: 42 });
        assert!(saved.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn command_while_disconnected_fails_without_radio() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);

        let result = manager.send_command(Command::Inflate).await;
        assert!(matches!(result, Err(DeviceError::NotConnected)));
        assert!(radio.links().is_empty());
        assert!(radio.connect_calls().is_empty());
        assert_eq!(store.latest_log().unwrap().text, "Not connected");
    }

    #[tokio::test(start_paused = true)]
    async fn command_is_written_when_connected() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);
        connected(&radio, &manager).await;

        manager.send_command(Command::Inflate).await.unwrap();
        manager.send_command(Command::Calibrate).await.unwrap();

        assert_eq!(radio.last_link().writes(), vec![b"INFLATE".to_vec(), b"CALIBRATE".to_vec()]);
        assert_eq!(store.latest_log().unwrap().text, "Command sent: CALIBRATE");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_keeps_connection() {
        let radio = FakeRadio::new();
        radio.set_default_plan(ConnectPlan::Link(LinkProfile { fail_writes: true, ..LinkProfile::cuff() }));
        let (manager, store) = start(&radio);
        connected(&radio, &manager).await;

        let result = manager.send_command(Command::EmergencyStop).await;
        assert!(matches!(result, Err(DeviceError::CommandWriteFailed { command: Command::EmergencyStop, .. })));
        assert_eq!(store.snapshot().connection, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_waiting_for_retry_cancels_it() {
        let radio = FakeRadio::new();
        radio.set_default_plan(ConnectPlan::Fail);
        let (manager, store) = start(&radio);

        scanning(&radio, &manager).await;
        radio.advertise("XIAO-BLE", "AA:01");
        wait_for(&store, |snapshot| snapshot.retries == 1).await;

        manager.disconnect().unwrap();
        let snapshot = wait_for(&store, being(ConnectionState::Disconnected)).await;
        assert_eq!(snapshot.retries, 0);
        assert_eq!(store.latest_log().unwrap().text, "Disconnected");

        sleep(Duration::from_secs(10)).await;
        assert_eq!(radio.connect_calls().len(), 1);
        assert_eq!(radio.start_scan_calls(), 1);
        assert_eq!(store.snapshot().connection, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_attempt_tears_down_first() {
        let radio = FakeRadio::new();
        radio.plan_connect(ConnectPlan::Fail);
        radio.plan_connect(ConnectPlan::Link(LinkProfile {
            discovery_delay: Duration::from_secs(1),
            disconnect_delay: Duration::from_millis(200),
            ..LinkProfile::cuff()
        }));
        let (manager, store) = start(&radio);

        scanning(&radio, &manager).await;
        radio.advertise("XIAO-BLE", "AA:01");
        wait_for(&store, |snapshot| snapshot.retries == 1).await;
        // the second attempt is now discovering services
        sleep(Duration::from_millis(150)).await;
        assert_eq!(radio.connect_calls().len(), 2);

        manager.disconnect().unwrap();
        let snapshot = wait_for(&store, being(ConnectionState::Disconnecting)).await;
        assert!(snapshot.reading.is_baseline());
        wait_for(&store, being(ConnectionState::Disconnected)).await;

        assert_eq!(radio.last_link().disconnect_calls(), 1);
        assert!(!radio.last_link().is_subscribed());
        sleep(Duration::from_secs(10)).await;
        assert_eq!(radio.connect_calls().len(), 2);
        assert_eq!(store.snapshot().connection, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_when_connected_reports_disconnecting() {
        let radio = FakeRadio::new();
        radio.set_default_plan(ConnectPlan::Link(LinkProfile {
            disconnect_delay: Duration::from_millis(200),
            ..LinkProfile::cuff()
        }));
        let (manager, store) = start(&radio);
        connected(&radio, &manager).await;

        radio.last_link().notify(b"30");
        wait_for(&store, |snapshot| snapshot.reading.value == 30).await;

        manager.disconnect().unwrap();
        let snapshot = wait_for(&store, being(ConnectionState::Disconnecting)).await;
        assert!(snapshot.reading.is_baseline());

        wait_for(&store, being(ConnectionState::Disconnected)).await;
        assert_eq!(radio.last_link().disconnect_calls(), 1);
        assert!(matches!(manager.send_command(Command::Deflate).await, Err(DeviceError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_resets_reading_and_rescans() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);
        connected(&radio, &manager).await;

        radio.last_link().notify(b"57");
        wait_for(&store, |snapshot| snapshot.reading.value == 57).await;

        radio.last_link().drop_link();
        let snapshot = wait_for(&store, being(ConnectionState::Disconnected)).await;
        assert!(snapshot.reading.is_baseline());
        assert_eq!(store.latest_log().unwrap().text, "Disconnected: connection lost");

        sleep(Duration::from_millis(4_999)).await;
        assert_eq!(radio.start_scan_calls(), 1);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(radio.start_scan_calls(), 2);
        assert_eq!(store.snapshot().connection, ConnectionState::Scanning);

        radio.advertise("XIAO-BLE", "AA:01");
        wait_for(&store, being(ConnectionState::Connected)).await;
        assert_eq!(radio.connect_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_when_stopped_publishes_nothing() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);
        let mut receiver = store.subscribe();
        receiver.borrow_and_update();

        manager.stop_scan().unwrap();
        manager.disconnect().unwrap();
        manager.stop_scan().unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(!receiver.has_changed().unwrap());
        assert!(store.latest_log().is_none());
        assert_eq!(radio.start_scan_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_scan_returns_to_disconnected() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);
        scanning(&radio, &manager).await;

        manager.stop_scan().unwrap();
        let snapshot = wait_for(&store, being(ConnectionState::Disconnected)).await;
        assert_eq!(snapshot.scan, ScanState::Idle);

        sleep(Duration::from_millis(10)).await;
        assert!(!radio.is_scanning());
        radio.advertise("XIAO-BLE", "AA:01");
        sleep(Duration::from_secs(20)).await;
        assert!(radio.connect_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_times_out() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);
        scanning(&radio, &manager).await;

        wait_for_log(&store, "Device not found after scan timeout").await;
        let snapshot = store.snapshot();
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);
        assert_eq!(snapshot.scan, ScanState::Idle);

        sleep(Duration::from_millis(10)).await;
        assert!(!radio.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_request_is_ignored_while_connected() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);
        connected(&radio, &manager).await;

        manager.start_scan().unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(radio.start_scan_calls(), 1);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scan, ScanState::Idle);
        assert_eq!(snapshot.connection, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_device_is_retried_and_released() {
        let radio = FakeRadio::new();
        radio.set_default_plan(ConnectPlan::Link(LinkProfile { services: vec![], ..LinkProfile::cuff() }));
        let (manager, store) = start(&radio);

        scanning(&radio, &manager).await;
        radio.advertise("XIAO-BLE", "AA:01");
        wait_for(&store, being(ConnectionState::Disconnected)).await;

        let links = radio.links();
        assert_eq!(links.len(), 4);
        assert!(links.iter().all(|link| link.disconnect_calls() == 1));
        assert_eq!(store.latest_log().unwrap().text, "Failed to connect: Unsupported device: service not found");
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_not_retried() {
        let radio = FakeRadio::new();
        radio.fail_next_scan(DeviceError::PermissionDenied);
        let (manager, store) = start(&radio);

        manager.start_scan().unwrap();
        wait_for_log(&store, "Permissions not granted").await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.scan, ScanState::Idle);
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(radio.start_scan_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_never_reports_scanning() {
        let radio = FakeRadio::new();
        radio.fail_next_scan(DeviceError::PermissionDenied);
        let (manager, store) = start(&radio);
        let mut receiver = store.subscribe();
        receiver.borrow_and_update();

        manager.start_scan().unwrap();
        wait_for_log(&store, "Permissions not granted").await;
        sleep(Duration::from_millis(10)).await;

        assert!(!receiver.has_changed().unwrap());
        assert_eq!(store.snapshot().connection, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn radio_unavailable_ends_rescan_cycle() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);
        connected(&radio, &manager).await;

        radio.fail_next_scan(DeviceError::RadioUnavailable);
        radio.last_link().drop_link();
        wait_for(&store, being(ConnectionState::Disconnected)).await;

        sleep(Duration::from_millis(5_001)).await;
        assert_eq!(radio.start_scan_calls(), 2);
        wait_for_log(&store, "Bluetooth is disabled").await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.scan, ScanState::Idle);
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(radio.start_scan_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_scan_failure_is_not_retried() {
        let radio = FakeRadio::new();
        radio.fail_next_scan(DeviceError::ScanFailed { reason: String::from("busy") });
        let (manager, store) = start(&radio);

        manager.start_scan().unwrap();
        wait_for_log(&store, "Scan failed with error: Scan failed: busy").await;

        sleep(Duration::from_secs(20)).await;
        assert_eq!(radio.start_scan_calls(), 1);
        assert_eq!(store.snapshot().connection, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_scan_ends_rescan_cycle() {
        let radio = FakeRadio::new();
        let (manager, store) = start(&radio);
        connected(&radio, &manager).await;

        radio.last_link().drop_link();
        wait_for(&store, being(ConnectionState::Disconnected)).await;
        sleep(Duration::from_millis(5_001)).await;
        assert_eq!(store.snapshot().connection, ConnectionState::Scanning);

        manager.stop_scan().unwrap();
        wait_for(&store, being(ConnectionState::Disconnected)).await;

        sleep(Duration::from_secs(20)).await;
        assert_eq!(radio.start_scan_calls(), 2);
        assert_eq!(store.snapshot().connection, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_disconnects_the_link() {
        let radio = FakeRadio::new();
        let cancel = CancellationToken::new();
        let (manager, task) = ConnectionManager::spawn(radio.clone(), ConnectionPolicy::default(), None, cancel.clone());
        connected(&radio, &manager).await;

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(radio.last_link().disconnect_calls(), 1);
        assert_eq!(manager.store().snapshot().connection, ConnectionState::Disconnected);
        assert!(matches!(manager.start_scan(), Err(DeviceError::ManagerStopped)));
    }
}
