//! Per-run log fan-out.
//!
//! Each run owns a group with a broadcast sender and a capped history.
//! Publishing and joining happen under the same lock, so a new subscriber
//! gets the history and then exactly the messages published after it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

const LIVE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    BuildLog,
    Log,
}

impl LogChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogChannel::BuildLog => "build_log",
            LogChannel::Log => "log",
        }
    }
}

impl fmt::Display for LogChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogMessage {
    pub seq: u64,
    pub channel: LogChannel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogItem {
    Message(LogMessage),
    /// The subscriber fell behind and this many messages were dropped.
    Lagged(u64),
}

struct Group {
    sender: Option<broadcast::Sender<LogMessage>>,
    history: VecDeque<LogMessage>,
    next_seq: u64,
    closed_at: Option<Instant>,
}

impl Group {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            sender: Some(sender),
            history: VecDeque::new(),
            next_seq: 0,
            closed_at: None,
        }
    }
}

#[derive(Clone)]
pub struct LogBroadcaster {
    groups: Arc<Mutex<HashMap<String, Group>>>,
    history_limit: usize,
    retention: Duration,
}

impl fmt::Debug for LogBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBroadcaster")
            .field("history_limit", &self.history_limit)
            .field("retention", &self.retention)
            .finish()
    }
}

impl LogBroadcaster {
    pub fn new(history_limit: usize, retention: Duration) -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            history_limit,
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Group>> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates the group for a run. Reopening a closed group starts it over.
    pub fn open(&self, run_id: &str) {
        let mut groups = self.lock();
        let reopen = groups
            .get(run_id)
            .map(|group| group.closed_at.is_some())
            .unwrap_or(true);
        if reopen {
            groups.insert(run_id.to_string(), Group::new());
        }
    }

    /// Delivers a message to every current subscriber of the run. Never
    /// blocks; returns `false` when the run has no open group.
    pub fn publish(&self, run_id: &str, channel: LogChannel, message: impl Into<String>) -> bool {
        let mut groups = self.lock();
        let Some(group) = groups.get_mut(run_id) else {
            return false;
        };
        let Some(sender) = group.sender.as_ref() else {
            return false;
        };

        let entry = LogMessage {
            seq: group.next_seq,
            channel,
            message: message.into(),
        };
        group.next_seq += 1;
        // No receivers is fine; the history still records the message.
        let _ = sender.send(entry.clone());
        group.history.push_back(entry);
        while group.history.len() > self.history_limit {
            group.history.pop_front();
        }
        true
    }

    /// Replays the history and, while the run is live, follows new messages.
    pub fn join(&self, run_id: &str) -> Option<Subscription> {
        let groups = self.lock();
        let group = groups.get(run_id)?;
        Some(Subscription {
            backlog: group.history.iter().cloned().collect(),
            live: group.sender.as_ref().map(|sender| sender.subscribe()),
        })
    }

    pub fn history(&self, run_id: &str) -> Vec<LogMessage> {
        self.lock()
            .get(run_id)
            .map(|group| group.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_group(&self, run_id: &str) -> bool {
        self.lock().contains_key(run_id)
    }

    /// Ends live delivery for a run. History stays available until the
    /// retention window passes.
    pub fn close(&self, run_id: &str) {
        let mut groups = self.lock();
        if let Some(group) = groups.get_mut(run_id) {
            if group.sender.take().is_some() {
                group.closed_at = Some(Instant::now());
                debug!(run = %run_id, "log group closed");
            }
        }
    }

    /// Drops closed groups whose retention has expired.
    pub fn sweep(&self) -> usize {
        let retention = self.retention;
        let mut groups = self.lock();
        let before = groups.len();
        groups.retain(|_, group| match group.closed_at {
            Some(closed) => closed.elapsed() < retention,
            None => true,
        });
        before - groups.len()
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let broadcaster = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = broadcaster.sweep();
                if removed > 0 {
                    debug!(removed, "expired log groups swept");
                }
            }
        })
    }
}

/// One observer's view of a run's log group.
#[derive(Debug)]
pub struct Subscription {
    backlog: VecDeque<LogMessage>,
    live: Option<broadcast::Receiver<LogMessage>>,
}

impl Subscription {
    /// Next replayed or live item; `None` once the group is closed and the
    /// backlog drained.
    pub async fn recv(&mut self) -> Option<LogItem> {
        if let Some(message) = self.backlog.pop_front() {
            return Some(LogItem::Message(message));
        }
        let live = self.live.as_mut()?;
        match live.recv().await {
            Ok(message) => Some(LogItem::Message(message)),
            Err(RecvError::Lagged(missed)) => Some(LogItem::Lagged(missed)),
            Err(RecvError::Closed) => {
                self.live = None;
                None
            }
        }
    }
}
