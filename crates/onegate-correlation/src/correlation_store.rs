//! In-memory, time-bounded correlation tables shared by the inbound recorder
//! and outbound reply resolution.
//!
//! Expiry is lazy: reads never check age, records disappear only when a sweep
//! runs. Writers schedule a sweep on a detached task at most once per sweep
//! interval, so the write path never waits on it. Every operation takes the
//! single table lock for a short, I/O-free critical section and none of them
//! fail; a miss is `None`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use onegate_core::{is_older_than, Clock, ConversationKind, SystemClock};

const DEFAULT_RETENTION: Duration = Duration::from_secs(600);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Retention and sweep cadence for correlation records.
pub struct CorrelationStoreConfig {
    /// Records older than this are dropped by the next sweep. Passive replies
    /// are accepted for five minutes upstream; the default keeps twice that.
    pub retention: Duration,
    /// Minimum spacing between writer-triggered sweeps.
    pub sweep_interval: Duration,
}

impl Default for CorrelationStoreConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One not-yet-answered group message, queued in arrival order.
pub struct PendingMessage {
    pub user_id: i64,
    pub message_id: String,
    pub created_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub messages_removed: usize,
    pub types_removed: usize,
    pub message_users_removed: usize,
    pub latest_users_removed: usize,
    pub pending_removed: usize,
    pub pending_groups_removed: usize,
}

impl SweepReport {
    pub fn total_removed(&self) -> usize {
        self.messages_removed
            + self.types_removed
            + self.message_users_removed
            + self.latest_users_removed
            + self.pending_removed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStoreStats {
    pub messages: usize,
    pub types: usize,
    pub message_users: usize,
    pub group_latest_users: usize,
    pub pending_groups: usize,
    pub pending_messages: usize,
}

#[derive(Debug, Clone)]
struct Timed<T> {
    value: T,
    created_unix_ms: u64,
}

#[derive(Debug, Default)]
struct CorrelationTables {
    messages: HashMap<String, Timed<String>>,
    types: HashMap<String, Timed<ConversationKind>>,
    message_users: HashMap<String, Timed<i64>>,
    group_latest_users: HashMap<i64, Timed<i64>>,
    group_pending: HashMap<i64, VecDeque<PendingMessage>>,
    last_sweep_unix_ms: u64,
}

struct CorrelationStoreShared {
    config: CorrelationStoreConfig,
    clock: Arc<dyn Clock>,
    tables: Mutex<CorrelationTables>,
}

impl CorrelationStoreShared {
    fn lock(&self) -> MutexGuard<'_, CorrelationTables> {
        // A panic under the lock can not leave a table half-written, so the
        // data is still usable.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> u64 {
        self.clock.now_unix_ms()
    }

    fn retention_ms(&self) -> u64 {
        u64::try_from(self.config.retention.as_millis()).unwrap_or(u64::MAX)
    }

    fn sweep_interval_ms(&self) -> u64 {
        u64::try_from(self.config.sweep_interval.as_millis()).unwrap_or(u64::MAX)
    }

    fn sweep(&self) -> SweepReport {
        let now = self.now();
        let retention_ms = self.retention_ms();
        let expired = |created: u64| is_older_than(created, retention_ms, now);
        let mut report = SweepReport::default();
        let mut tables = self.lock();

        let before = tables.messages.len();
        tables
            .messages
            .retain(|_, record| !expired(record.created_unix_ms));
        report.messages_removed = before - tables.messages.len();

        let before = tables.types.len();
        tables
            .types
            .retain(|_, record| !expired(record.created_unix_ms));
        report.types_removed = before - tables.types.len();

        let before = tables.message_users.len();
        tables
            .message_users
            .retain(|_, record| !expired(record.created_unix_ms));
        report.message_users_removed = before - tables.message_users.len();

        let before = tables.group_latest_users.len();
        tables
            .group_latest_users
            .retain(|_, record| !expired(record.created_unix_ms));
        report.latest_users_removed = before - tables.group_latest_users.len();

        let groups_before = tables.group_pending.len();
        let mut pending_removed = 0;
        tables.group_pending.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|pending| !expired(pending.created_unix_ms));
            pending_removed += before - queue.len();
            !queue.is_empty()
        });
        report.pending_removed = pending_removed;
        report.pending_groups_removed = groups_before - tables.group_pending.len();

        tables.last_sweep_unix_ms = now;
        report
    }
}

#[derive(Clone)]
/// Handle to one shared set of correlation tables. Clones share state.
pub struct CorrelationStore {
    shared: Arc<CorrelationStoreShared>,
}

impl std::fmt::Debug for CorrelationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationStore")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new(CorrelationStoreConfig::default())
    }
}

impl CorrelationStore {
    pub fn new(config: CorrelationStoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CorrelationStoreConfig, clock: Arc<dyn Clock>) -> Self {
        let tables = CorrelationTables {
            last_sweep_unix_ms: clock.now_unix_ms(),
            ..CorrelationTables::default()
        };
        Self {
            shared: Arc::new(CorrelationStoreShared {
                config,
                clock,
                tables: Mutex::new(tables),
            }),
        }
    }

    pub fn config(&self) -> CorrelationStoreConfig {
        self.shared.config
    }

    /// Binds `key` (numeric key or opaque token) to an upstream message id.
    pub fn put_message(&self, key: &str, message_id: &str) {
        let now = self.shared.now();
        let sweep_due = {
            let mut tables = self.shared.lock();
            tables.messages.insert(
                key.to_string(),
                Timed {
                    value: message_id.to_string(),
                    created_unix_ms: now,
                },
            );
            if now.saturating_sub(tables.last_sweep_unix_ms) > self.shared.sweep_interval_ms() {
                tables.last_sweep_unix_ms = now;
                true
            } else {
                false
            }
        };
        if sweep_due {
            self.schedule_sweep();
        }
    }

    pub fn get_message(&self, key: &str) -> Option<String> {
        self.shared
            .lock()
            .messages
            .get(key)
            .map(|record| record.value.clone())
    }

    pub fn put_type(&self, key: &str, kind: ConversationKind) {
        let now = self.shared.now();
        self.shared.lock().types.insert(
            key.to_string(),
            Timed {
                value: kind,
                created_unix_ms: now,
            },
        );
    }

    pub fn get_type(&self, key: &str) -> Option<ConversationKind> {
        self.shared
            .lock()
            .types
            .get(key)
            .map(|record| record.value)
    }

    pub fn put_user_for_message(&self, message_id: &str, user_id: i64) {
        let now = self.shared.now();
        self.shared.lock().message_users.insert(
            message_id.to_string(),
            Timed {
                value: user_id,
                created_unix_ms: now,
            },
        );
    }

    pub fn get_user_for_message(&self, message_id: &str) -> Option<i64> {
        self.shared
            .lock()
            .message_users
            .get(message_id)
            .map(|record| record.value)
    }

    /// Last-write-wins record of who spoke most recently in a group. Only a
    /// fallback: under concurrent senders it can name the wrong user.
    pub fn set_group_latest_user(&self, group_id: i64, user_id: i64) {
        let now = self.shared.now();
        self.shared.lock().group_latest_users.insert(
            group_id,
            Timed {
                value: user_id,
                created_unix_ms: now,
            },
        );
    }

    pub fn get_group_latest_user(&self, group_id: i64) -> Option<i64> {
        self.shared
            .lock()
            .group_latest_users
            .get(&group_id)
            .map(|record| record.value)
    }

    pub fn push_pending(&self, group_id: i64, user_id: i64, message_id: &str) {
        let now = self.shared.now();
        self.shared
            .lock()
            .group_pending
            .entry(group_id)
            .or_default()
            .push_back(PendingMessage {
                user_id,
                message_id: message_id.to_string(),
                created_unix_ms: now,
            });
    }

    /// Removes and returns the oldest pending message of `group_id`. The
    /// group's queue is dropped once it empties.
    pub fn pop_pending(&self, group_id: i64) -> Option<PendingMessage> {
        let mut tables = self.shared.lock();
        let queue = tables.group_pending.get_mut(&group_id)?;
        let pending = queue.pop_front();
        if queue.is_empty() {
            tables.group_pending.remove(&group_id);
        }
        pending
    }

    pub fn pending_len(&self, group_id: i64) -> usize {
        self.shared
            .lock()
            .group_pending
            .get(&group_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Drops every record older than the retention window, synchronously.
    pub fn sweep(&self) -> SweepReport {
        self.shared.sweep()
    }

    pub fn stats(&self) -> CorrelationStoreStats {
        let tables = self.shared.lock();
        CorrelationStoreStats {
            messages: tables.messages.len(),
            types: tables.types.len(),
            message_users: tables.message_users.len(),
            group_latest_users: tables.group_latest_users.len(),
            pending_groups: tables.group_pending.len(),
            pending_messages: tables.group_pending.values().map(VecDeque::len).sum(),
        }
    }

    fn schedule_sweep(&self) {
        let shared = Arc::clone(&self.shared);
        let run = move || {
            let report = shared.sweep();
            if report.total_removed() > 0 {
                tracing::debug!(
                    messages = report.messages_removed,
                    types = report.types_removed,
                    message_users = report.message_users_removed,
                    latest_users = report.latest_users_removed,
                    pending = report.pending_removed,
                    pending_groups = report.pending_groups_removed,
                    "correlation sweep removed expired records"
                );
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { run() });
            }
            Err(_) => {
                std::thread::spawn(run);
            }
        }
    }
}
