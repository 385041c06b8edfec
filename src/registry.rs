//! Connection Registry
//!
//! Concurrency-safe map from remote endpoint (`ip:port`) to the
//! [`ConnectionRecord`] of the connection accepted from it.
//!
//! Lifecycle of a record:
//! - pushed at accept time (see [`crate::metered::MeteredListener`])
//! - found during authentication, which arms its finalizer
//! - finalized exactly once when the connection closes; the finalizer pops
//!   the record and optionally reports the byte totals
//!
//! Lookups on unknown identities are not errors: they mean "this traffic is
//! not under byte accounting" and callers carry on without it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Callback fired once when a connection closes
pub type Finalizer = Box<dyn FnOnce(ConnectionTotals) + Send + 'static>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Final byte counts of a closed connection, already adjusted for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionTotals {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// One accepted network connection under byte accounting
pub struct ConnectionRecord {
    id: u64,
    remote: String,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    requested: AtomicBool,
    responded: AtomicBool,
    finalized: AtomicBool,
    finalizer: Mutex<Option<Finalizer>>,
}

impl ConnectionRecord {
    /// Create a record for the given remote endpoint identity
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote: remote.into(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            requested: AtomicBool::new(false),
            responded: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            finalizer: Mutex::new(None),
        }
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote endpoint identity (registry key)
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Raw bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    /// Raw bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub(crate) fn add_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::AcqRel);
    }

    pub(crate) fn add_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::AcqRel);
    }

    /// Mark that a request was observed on this connection
    pub fn mark_requested(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// Mark that a response was observed on this connection
    pub fn mark_responded(&self) {
        self.responded.store(true, Ordering::Release);
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Totals as they would be reported right now
    ///
    /// Reads are billed only once a request was observed, writes only once a
    /// response was observed.
    pub fn billable_totals(&self) -> ConnectionTotals {
        ConnectionTotals {
            bytes_read: if self.requested() { self.bytes_read() } else { 0 },
            bytes_written: if self.responded() {
                self.bytes_written()
            } else {
                0
            },
        }
    }

    /// Arm the close callback, replacing any previously armed one
    ///
    /// Arming after the record was finalized has no effect.
    pub fn on_finalize(&self, finalizer: Finalizer) {
        let mut slot = lock(&self.finalizer);
        if self.is_finalized() {
            debug!(remote = %self.remote, "Finalizer armed after close, ignoring");
            return;
        }
        *slot = Some(finalizer);
    }

    /// Fire the armed finalizer with the billable totals
    ///
    /// Runs at most once; later calls are no-ops.
    pub fn finalize(&self) {
        let finalizer = {
            let mut slot = lock(&self.finalizer);
            if self.finalized.swap(true, Ordering::AcqRel) {
                return;
            }
            slot.take()
        };

        let totals = self.billable_totals();
        debug!(
            remote = %self.remote,
            conn_id = self.id,
            bytes_read = totals.bytes_read,
            bytes_written = totals.bytes_written,
            "Connection closed"
        );

        if let Some(finalizer) = finalizer {
            finalizer(totals);
        }
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("bytes_read", &self.bytes_read())
            .field("bytes_written", &self.bytes_written())
            .field("requested", &self.requested())
            .field("responded", &self.responded())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

/// Registry of live connections keyed by remote endpoint identity
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    conns: Arc<Mutex<HashMap<String, Arc<ConnectionRecord>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record under its remote identity, replacing any stale entry
    pub fn push(&self, record: Arc<ConnectionRecord>) {
        debug!(remote = %record.remote(), conn_id = record.id(), "Registry push");
        let mut conns = lock(&self.conns);
        conns.insert(record.remote().to_string(), record);
    }

    /// Remove and return the record for `remote`
    pub fn pop(&self, remote: &str) -> Option<Arc<ConnectionRecord>> {
        debug!(remote = %remote, "Registry pop");
        let mut conns = lock(&self.conns);
        conns.remove(remote)
    }

    /// Return the record for `remote` without removing it
    pub fn find(&self, remote: &str) -> Option<Arc<ConnectionRecord>> {
        debug!(remote = %remote, "Registry find");
        let conns = lock(&self.conns);
        conns.get(remote).cloned()
    }

    /// Pop `remote` only if it still maps to connection `id`
    ///
    /// Finalizers use this so a closing connection never removes a newer
    /// connection that reused the same endpoint.
    pub fn pop_matching(&self, remote: &str, id: u64) -> Option<Arc<ConnectionRecord>> {
        let mut conns = lock(&self.conns);
        match conns.get(remote) {
            Some(record) if record.id() == id => {
                debug!(remote = %remote, conn_id = id, "Registry pop");
                conns.remove(remote)
            }
            Some(record) => {
                debug!(
                    remote = %remote,
                    conn_id = id,
                    current_id = record.id(),
                    "Registry entry belongs to a newer connection, leaving it"
                );
                None
            }
            None => None,
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        lock(&self.conns).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.conns).is_empty()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
