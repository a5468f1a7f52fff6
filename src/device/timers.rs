use std::collections::HashMap;
use log::debug;
use tokio::spawn;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ScanTimeout,
    RetryAttempt,
    Rescan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub id: u64,
}

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

/// One pending timer per purpose; scheduling a purpose again replaces the previous timer.
pub struct Scheduler {
    sender: UnboundedSender<TimerFired>,
    pending: HashMap<TimerKind, PendingTimer>,
    next_id: u64,
}

impl Scheduler {
    pub fn new(sender: UnboundedSender<TimerFired>) -> Self {
        Scheduler {
            sender,
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);

        let id = self.next_id;
        self.next_id += 1;

        let sender = self.sender.clone();
        let handle = spawn(async move {
            sleep(delay).await;
            // the receiver is gone when the owner shut down, nothing left to notify
            let _ = sender.send(TimerFired { kind, id });
        });

        debug!("Scheduled {:?} timer #{} in {:?}", kind, id, delay);
        self.pending.insert(kind, PendingTimer { id, handle });
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.pending.remove(&kind) {
            Some(timer) => {
                timer.handle.abort();
                debug!("Cancelled {:?} timer #{}", kind, timer.id);
                true
            },
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.pending.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.pending.contains_key(&kind)
    }

    /// Accepts a fired timer. Returns false for a timer that was cancelled or replaced
    /// after it had already fired.
    pub fn fire(&mut self, fired: TimerFired) -> bool {
        match self.pending.get(&fired.kind) {
            Some(timer) if timer.id == fired.id => {
                self.pending.remove(&fired.kind);
                true
            },
            _ => false,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
