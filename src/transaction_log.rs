use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::{AuctionOutcome, TransactionAction, TransactionLog};

/// Destination of audit records. Entries are write-once.
pub trait TransactionSink: Send + Sync {
    fn record(&self, entry: TransactionLog);

    /// Bumps the retry count of an existing entry. Returns false if unknown.
    fn append_retry(&self, entry_id: &str) -> bool;
}

/// Builder-style constructor for a log entry.
pub struct LogEntry {
    entry: TransactionLog,
}

impl LogEntry {
    pub fn new(action: TransactionAction, lead_id: &str, buyer_id: &str, status: &str) -> Self {
        Self {
            entry: TransactionLog {
                id: Uuid::new_v4().to_string(),
                auction_id: None,
                lead_id: lead_id.to_string(),
                buyer_id: buyer_id.to_string(),
                action_type: action,
                status: status.to_string(),
                bid_amount: None,
                http_status: None,
                response_time_ms: 0,
                error_message: None,
                outcome: AuctionOutcome::None,
                retry_count: 0,
                created_at: Utc::now(),
            },
        }
    }

    pub fn auction(mut self, auction_id: Option<&str>) -> Self {
        self.entry.auction_id = auction_id.map(str::to_string);
        self
    }

    pub fn bid(mut self, amount: Option<f64>) -> Self {
        self.entry.bid_amount = amount;
        self
    }

    pub fn http_status(mut self, status: Option<u16>) -> Self {
        self.entry.http_status = status;
        self
    }

    pub fn response_time(mut self, ms: u64) -> Self {
        self.entry.response_time_ms = ms;
        self
    }

    pub fn error(mut self, message: Option<String>) -> Self {
        self.entry.error_message = message;
        self
    }

    pub fn outcome(mut self, outcome: AuctionOutcome) -> Self {
        self.entry.outcome = outcome;
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.entry.retry_count = count;
        self
    }

    pub fn build(self) -> TransactionLog {
        self.entry
    }
}

/// Process-local sink, used by the server and by tests.
#[derive(Default)]
pub struct InMemoryTransactionLog {
    entries: RwLock<Vec<TransactionLog>>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TransactionLog> {
        self.entries.read().clone()
    }

    pub fn for_lead(&self, lead_id: &str) -> Vec<TransactionLog> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.lead_id == lead_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl TransactionSink for InMemoryTransactionLog {
    fn record(&self, entry: TransactionLog) {
        tracing::debug!(
            "Transaction {:?} lead={} buyer={} status={} outcome={:?}",
            entry.action_type,
            entry.lead_id,
            entry.buyer_id,
            entry.status,
            entry.outcome
        );
        self.entries.write().push(entry);
    }

    fn append_retry(&self, entry_id: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.id == entry_id) {
            Some(entry) => {
                entry.retry_count += 1;
                true
            }
            None => false,
        }
    }
}
