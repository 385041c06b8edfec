use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::auth::BandwidthReport;
use crate::hooks::SizeHook;

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        debug!("Tracing subscriber already installed");
    }
}

/// One bandwidth report with the time it was recorded
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub timestamp: String, // ISO8601 format
    pub user: String,
    pub remote: String,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl From<&BandwidthReport> for LedgerEntry {
    fn from(report: &BandwidthReport) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            user: report.user.clone(),
            remote: report.remote.clone(),
            bytes_read: report.bytes_read,
            bytes_written: report.bytes_written,
        }
    }
}

/// Running totals for one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UserTotals {
    pub connections: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Serialize)]
struct LedgerBatch<'a> {
    flushed_at: String,
    entries: &'a [LedgerEntry],
}

#[derive(Debug, Default)]
struct LedgerState {
    pending: Vec<LedgerEntry>,
    totals: HashMap<String, UserTotals>,
}

/// Size-report sink that batches reports into the log and keeps per-user
/// totals
#[derive(Debug)]
pub struct BandwidthLedger {
    batch_size: usize,
    flush_interval: Duration,
    state: Mutex<LedgerState>,
}

impl BandwidthLedger {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            batch_size: batch_size.max(1),
            flush_interval,
            state: Mutex::new(LedgerState::default()),
        })
    }

    /// Start background task that periodically flushes pending entries
    pub fn start_background_flush(self: &Arc<Self>) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(ledger.flush_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                ledger.flush();
            }
        })
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a report to the batch, flushing when the batch is full
    pub fn record(&self, report: &BandwidthReport) {
        let mut state = self.state();
        let totals = state.totals.entry(report.user.clone()).or_default();
        totals.connections += 1;
        totals.bytes_read += report.bytes_read;
        totals.bytes_written += report.bytes_written;
        state.pending.push(LedgerEntry::from(report));

        if state.pending.len() >= self.batch_size {
            let batch = std::mem::take(&mut state.pending);
            drop(state);

            debug!("Batch full ({} entries), flushing ledger", batch.len());
            emit(&batch);
        }
    }

    /// Write out every pending entry; returns how many were flushed
    pub fn flush(&self) -> usize {
        let batch = std::mem::take(&mut self.state().pending);
        if !batch.is_empty() {
            debug!("Flushing {} pending entries", batch.len());
            emit(&batch);
        }
        batch.len()
    }

    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    pub fn totals_for(&self, user: &str) -> Option<UserTotals> {
        self.state().totals.get(user).copied()
    }

    /// Adapt the ledger into an engine size hook
    ///
    /// Finalizers run inside `Drop`; the report is recorded before the hook
    /// returns.
    pub fn into_hook(self: Arc<Self>) -> SizeHook {
        Arc::new(move |report: &BandwidthReport| self.record(report))
    }
}

fn emit(batch: &[LedgerEntry]) {
    let bytes_read: u64 = batch.iter().map(|e| e.bytes_read).sum();
    let bytes_written: u64 = batch.iter().map(|e| e.bytes_written).sum();
    let payload = serde_json::to_string(&LedgerBatch {
        flushed_at: Utc::now().to_rfc3339(),
        entries: batch,
    })
    .unwrap_or_default();

    info!(
        entries = batch.len(),
        bytes_read,
        bytes_written,
        batch = %payload,
        "Bandwidth ledger flushed"
    );
}
