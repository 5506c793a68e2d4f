//! Retry bookkeeping for writes that must eventually reach the backend or the store.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::ClockHandle;
use crate::config::RetryPolicy;
use crate::error::{CacheError, CacheResult};
use crate::metrics;
use crate::model::{PendingKind, PendingOperation, PendingStatus};

const MAX_FAILED_KEPT: usize = 256;

pub struct PendingQueue {
    policy: RetryPolicy,
    clock: ClockHandle,
    ops: Mutex<HashMap<String, PendingOperation>>,
}

impl PendingQueue {
    pub fn new(policy: RetryPolicy, clock: ClockHandle) -> Self {
        Self {
            policy,
            clock,
            ops: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts the retry policy. The operation
    /// stays visible in [`snapshot`](Self::snapshot) while in flight and after a terminal failure.
    pub async fn run<T, F, Fut>(
        &self,
        kind: PendingKind,
        payload: serde_json::Value,
        mut op: F,
    ) -> CacheResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let record = PendingOperation::new(kind, payload, self.clock.now_ms());
        let op_id = record.id.clone();
        self.ops.lock().insert(op_id.clone(), record);

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.mark(&op_id, PendingStatus::Executing, attempt - 1);
            let err = match op().await {
                Ok(value) => {
                    self.ops.lock().remove(&op_id);
                    metrics::PENDING_OUTCOMES
                        .with_label_values(&["succeeded"])
                        .inc();
                    if attempt > 1 {
                        info!(op = %op_id, ?kind, attempt, "pending operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.transience().is_retryable() {
                self.fail(&op_id, attempt - 1);
                warn!(op = %op_id, ?kind, error = %err, "pending operation failed permanently");
                return Err(err);
            }
            if attempt >= max_attempts {
                self.fail(&op_id, attempt - 1);
                warn!(op = %op_id, ?kind, attempts = attempt, error = %err, "pending operation exhausted retries");
                return Err(CacheError::RetriesExhausted {
                    op_id,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.delay_for(attempt);
            self.mark(&op_id, PendingStatus::Pending, attempt);
            metrics::PENDING_OUTCOMES
                .with_label_values(&["retried"])
                .inc();
            debug!(op = %op_id, ?kind, attempt, ?delay, error = %err, "retrying pending operation");
            tokio::time::sleep(delay).await;
        }
    }

    fn mark(&self, op_id: &str, status: PendingStatus, retry_count: u32) {
        if let Some(op) = self.ops.lock().get_mut(op_id) {
            op.status = status;
            op.retry_count = retry_count;
        }
    }

    fn fail(&self, op_id: &str, retry_count: u32) {
        self.mark(op_id, PendingStatus::Failed, retry_count);
        metrics::PENDING_OUTCOMES
            .with_label_values(&["failed"])
            .inc();
        let mut ops = self.ops.lock();
        let failed = ops
            .values()
            .filter(|op| op.status == PendingStatus::Failed)
            .count();
        if failed > MAX_FAILED_KEPT {
            let oldest = ops
                .values()
                .filter(|op| op.status == PendingStatus::Failed)
                .min_by_key(|op| op.created_at_ms)
                .map(|op| op.id.clone());
            if let Some(oldest) = oldest {
                ops.remove(&oldest);
            }
        }
    }

    /// In-flight and failed operations, oldest first.
    pub fn snapshot(&self) -> Vec<PendingOperation> {
        let mut ops: Vec<PendingOperation> = self.ops.lock().values().cloned().collect();
        ops.sort_by_key(|op| op.created_at_ms);
        ops
    }

    /// Remove and return operations that failed terminally.
    pub fn take_failed(&self) -> Vec<PendingOperation> {
        let mut ops = self.ops.lock();
        let failed: Vec<String> = ops
            .values()
            .filter(|op| op.status == PendingStatus::Failed)
            .map(|op| op.id.clone())
            .collect();
        failed.iter().filter_map(|id| ops.remove(id)).collect()
    }
}
