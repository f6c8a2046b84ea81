//! Instrumentation of the hand-off to the downstream consumer
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{field, Instrument};

use crate::logs::{ConsumerError, Logs, LogsConsumer};

/// The format reported for every batch of this receiver
pub const FORMAT: &str = "k8sobjects";

/// Wraps consumer calls in a `receive_logs` span and counts their outcome
///
/// The span records the number of records handed over (`items`) and, when the consumer
/// refused them, its error (`error`).
#[derive(Debug)]
pub struct ObsReport {
    receiver: String,
    transport: &'static str,
    accepted: AtomicU64,
    refused: AtomicU64,
}

impl ObsReport {
    #[must_use]
    pub fn new(receiver: impl Into<String>, transport: &'static str) -> Self {
        Self {
            receiver: receiver.into(),
            transport,
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Hands `logs` to `consumer`, recording `items` records under the current span
    ///
    /// # Errors
    /// Returns the consumer's error unchanged.
    pub async fn consume(
        &self,
        consumer: &dyn LogsConsumer,
        logs: Logs,
        items: usize,
    ) -> Result<(), ConsumerError> {
        let span = tracing::info_span!(
            "receive_logs",
            receiver = %self.receiver,
            transport = self.transport,
            format = FORMAT,
            items,
            error = field::Empty,
        );
        let res = consumer.consume_logs(logs).instrument(span.clone()).await;
        let items = items as u64;
        match &res {
            Ok(()) => {
                self.accepted.fetch_add(items, Ordering::Relaxed);
            }
            Err(err) => {
                span.record("error", field::display(err));
                self.refused.fetch_add(items, Ordering::Relaxed);
                tracing::warn!(parent: &span, error = %err, "consumer refused log records");
            }
        }
        res
    }

    /// Records successfully handed to the consumer so far
    pub fn accepted_log_records(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Records the consumer returned an error for so far
    pub fn refused_log_records(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}
