//! Move operations and their completion handles.
//!
//! Every `move_to` creates one [`MoveOperation`]. Its outcome starts as
//! `Pending` and is settled exactly once, to `Succeeded`, `TimedOut` or
//! `Failed`; later settlement attempts are ignored. [`MoveStatus`] is the
//! caller-facing handle: it can be awaited, waited on from a plain thread,
//! polled, or cancelled. Dropping a handle does not stop the motion monitor.

use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Outcome of a move.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    /// Still moving
    Pending,
    /// Device reported completion
    Succeeded,
    /// Deadline passed, or the server reported the move timed out
    TimedOut(BridgeError),
    /// Server rejected the move, a status query failed, or the move was cancelled
    Failed(BridgeError),
}

impl MoveOutcome {
    /// Whether the outcome is still open.
    pub fn is_pending(&self) -> bool {
        matches!(self, MoveOutcome::Pending)
    }

    /// Settled outcome for an error: timeouts map to `TimedOut`, everything
    /// else to `Failed`.
    pub fn from_error(error: BridgeError) -> Self {
        match error {
            BridgeError::Timeout { .. } => MoveOutcome::TimedOut(error),
            other => MoveOutcome::Failed(other),
        }
    }

    /// `Ok` for success, the carried error otherwise.
    ///
    /// A pending outcome reads as `Ok`; callers check `is_pending` first.
    pub fn into_result(self) -> Result<()> {
        match self {
            MoveOutcome::Pending | MoveOutcome::Succeeded => Ok(()),
            MoveOutcome::TimedOut(e) | MoveOutcome::Failed(e) => Err(e),
        }
    }
}

/// State of one commanded move.
#[derive(Debug)]
pub struct MoveOperation {
    device: String,
    target: f64,
    started_at: Instant,
    deadline: Option<Instant>,
    last_observed_position: Mutex<Option<f64>>,
    move_complete: AtomicBool,
    outcome: watch::Sender<MoveOutcome>,
}

impl MoveOperation {
    /// New pending operation toward `target`, expiring `timeout` from now.
    pub fn new(device: impl Into<String>, target: f64, timeout: Option<Duration>) -> Self {
        let started_at = Instant::now();
        let (outcome, _) = watch::channel(MoveOutcome::Pending);
        Self {
            device: device.into(),
            target,
            started_at,
            deadline: timeout.map(|t| started_at + t),
            last_observed_position: Mutex::new(None),
            move_complete: AtomicBool::new(false),
            outcome,
        }
    }

    /// Device being moved.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Commanded position.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// When the move was commanded.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Settlement deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Most recent position seen by the monitor.
    pub fn last_observed_position(&self) -> Option<f64> {
        *self.last_observed_position.lock()
    }

    /// Most recent completion flag seen by the monitor.
    pub fn move_complete(&self) -> bool {
        self.move_complete.load(Ordering::Acquire)
    }

    /// Record one status poll.
    pub(crate) fn observe(&self, position: Option<f64>, complete: bool) {
        if let Some(position) = position {
            *self.last_observed_position.lock() = Some(position);
        }
        self.move_complete.store(complete, Ordering::Release);
    }

    /// Current outcome.
    pub fn outcome(&self) -> MoveOutcome {
        self.outcome.borrow().clone()
    }

    /// Settle if still pending. Returns whether this call settled it.
    pub(crate) fn settle(&self, outcome: MoveOutcome) -> bool {
        if outcome.is_pending() {
            return false;
        }
        self.outcome.send_if_modified(|current| {
            if current.is_pending() {
                *current = outcome;
                true
            } else {
                false
            }
        })
    }

    /// Whether the outcome has been settled.
    pub fn is_settled(&self) -> bool {
        !self.outcome.borrow().is_pending()
    }

    /// Time elapsed since the move was commanded.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Caller-facing handle to a [`MoveOperation`]. Cheap to clone.
#[derive(Clone)]
pub struct MoveStatus {
    operation: Arc<MoveOperation>,
    bridge: Bridge,
}

impl MoveStatus {
    pub(crate) fn new(operation: Arc<MoveOperation>, bridge: Bridge) -> Self {
        Self { operation, bridge }
    }

    /// The underlying operation.
    pub fn operation(&self) -> &Arc<MoveOperation> {
        &self.operation
    }

    /// Current outcome without waiting.
    pub fn outcome(&self) -> MoveOutcome {
        self.operation.outcome()
    }

    /// Whether the move has settled.
    pub fn done(&self) -> bool {
        self.operation.is_settled()
    }

    /// Whether the move settled successfully.
    pub fn success(&self) -> bool {
        matches!(self.outcome(), MoveOutcome::Succeeded)
    }

    /// Wait for settlement.
    pub async fn wait(&self) -> Result<()> {
        let mut outcome = self.operation.outcome.subscribe();
        // The sender lives in `operation`, which we hold, so this cannot close.
        let settled = outcome
            .wait_for(|o| !o.is_pending())
            .await
            .map(|o| o.clone())
            .map_err(|_| BridgeError::Runtime("move outcome channel closed".into()))?;
        settled.into_result()
    }

    /// Wait for settlement, giving up after `limit`. Giving up leaves the move
    /// running.
    pub async fn wait_timeout(&self, limit: Duration) -> Result<()> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                context: format!("waiting for move of '{}'", self.operation.device),
                waited: limit,
            }),
        }
    }

    /// Block the calling thread until settlement.
    pub fn wait_blocking(&self) -> Result<()> {
        let status = self.clone();
        self.bridge.block_on(async move { status.wait().await })
    }

    /// Abandon the move: settles it as `Failed(Cancelled)` if still pending.
    /// No stop command is sent; the monitor notices and exits.
    pub fn cancel(&self) -> bool {
        self.operation.settle(MoveOutcome::Failed(BridgeError::Cancelled {
            target: self.operation.device.clone(),
        }))
    }
}

impl std::fmt::Debug for MoveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveStatus")
            .field("device", &self.operation.device)
            .field("target", &self.operation.target)
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_settlement_wins() {
        let op = MoveOperation::new("Motor3", 1.0, None);
        assert!(!op.settle(MoveOutcome::Pending));
        assert!(op.settle(MoveOutcome::Succeeded));
        assert!(!op.settle(MoveOutcome::Failed(BridgeError::Cancelled {
            target: "Motor3".into()
        })));
        assert_eq!(op.outcome(), MoveOutcome::Succeeded);
    }

    #[test]
    fn deadline_is_relative_to_start() {
        let op = MoveOperation::new("Motor3", 1.0, Some(Duration::from_millis(50)));
        assert!(!op.is_expired(op.started_at()));
        assert!(op.is_expired(op.started_at() + Duration::from_millis(50)));

        let unbounded = MoveOperation::new("Motor3", 1.0, None);
        assert!(!unbounded.is_expired(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn timeout_errors_map_to_timed_out() {
        let outcome = MoveOutcome::from_error(BridgeError::Timeout {
            context: "MoveMotor(Motor3)".into(),
            waited: Duration::from_millis(5),
        });
        assert!(matches!(outcome, MoveOutcome::TimedOut(_)));
        let outcome = MoveOutcome::from_error(BridgeError::NotFound {
            target: "Motor3".into(),
        });
        assert!(matches!(outcome, MoveOutcome::Failed(_)));
    }

    #[test]
    fn observe_keeps_last_known_position() {
        let op = MoveOperation::new("Motor3", 1.0, None);
        op.observe(Some(0.5), false);
        op.observe(None, true);
        assert_eq!(op.last_observed_position(), Some(0.5));
        assert!(op.move_complete());
    }

    #[tokio::test]
    async fn waiters_see_settlement() {
        let bridge = tokio::task::spawn_blocking(Bridge::start).await.unwrap().unwrap();
        let status = MoveStatus::new(Arc::new(MoveOperation::new("Motor3", 1.0, None)), bridge);

        let waiter = {
            let status = status.clone();
            tokio::spawn(async move { status.wait().await })
        };
        assert!(status.wait_timeout(Duration::from_millis(20)).await.is_err());
        assert!(!status.done());

        assert!(status.cancel());
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Cancelled { .. })));
        assert!(!status.success());
    }
}
