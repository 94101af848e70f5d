use crate::planning::ExecutionResult;
use crate::state::clock::{Clock, SystemClock};
use crate::state::error::StateError;
use crate::state::kv::{KvStore, RecordKind};
use crate::state::records::*;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_RESUME_WINDOW_SECS: i64 = 300;
pub const DEFAULT_ACTIVITY_WINDOW_SECS: i64 = 60;

/// Typed access to every record that lets one plan run span several
/// process invocations.
///
/// Expiry is checked on read against the stored timestamps; an expired
/// record is deleted and reported as absent. For a given plan path, at most
/// one of the active marker and the cancellation record is ever stored.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    resume_window: Duration,
    activity_window: Duration,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("resume_window", &self.resume_window)
            .field("activity_window", &self.activity_window)
            .finish()
    }
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            clock: Arc::new(SystemClock),
            resume_window: Duration::seconds(DEFAULT_RESUME_WINDOW_SECS),
            activity_window: Duration::seconds(DEFAULT_ACTIVITY_WINDOW_SECS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_windows(mut self, resume_window: Duration, activity_window: Duration) -> Self {
        self.resume_window = resume_window;
        self.activity_window = activity_window;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn resume_window(&self) -> Duration {
        self.resume_window
    }

    /// How often a live run refreshes its marker while blocked on a model
    /// or tool call.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        (self.activity_window / 3)
            .to_std()
            .unwrap_or_default()
            .max(std::time::Duration::from_secs(1))
    }

    fn read<T: DeserializeOwned>(
        &self,
        plan_path: &str,
        kind: RecordKind,
    ) -> Result<Option<T>, StateError> {
        match self.kv.get(plan_path, kind)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(
        &self,
        plan_path: &str,
        kind: RecordKind,
        value: &T,
    ) -> Result<(), StateError> {
        let raw = serde_json::to_string_pretty(value)?;
        self.kv.put(plan_path, kind, &raw)
    }

    // ---- execution state ------------------------------------------------

    pub fn load_execution_state(
        &self,
        plan_path: &str,
    ) -> Result<Option<ExecutionState>, StateError> {
        self.read(plan_path, RecordKind::ExecutionState)
    }

    pub fn save_execution_state(&self, state: &mut ExecutionState) -> Result<(), StateError> {
        state.saved_at = self.now();
        debug!(
            plan = %state.plan_path,
            index = state.current_task_index,
            paused = state.paused_at_checkpoint,
            "saving execution state"
        );
        self.write(&state.plan_path, RecordKind::ExecutionState, &*state)
    }

    pub fn clear_execution_state(&self, plan_path: &str) -> Result<(), StateError> {
        self.kv.delete(plan_path, RecordKind::ExecutionState)
    }

    // ---- cancellation record -------------------------------------------

    /// Records a cancelled run and retires its active marker.
    pub fn save_cancelled(
        &self,
        plan_path: &str,
        paused_task_index: usize,
        results_so_far: Vec<ExecutionResult>,
    ) -> Result<CancelledExecutionInfo, StateError> {
        let now = self.now();
        let info = CancelledExecutionInfo {
            plan_path: plan_path.to_string(),
            paused_task_index,
            results_so_far,
            cancelled_at: now,
            expires_at: now + self.resume_window,
        };
        self.kv.delete(plan_path, RecordKind::ActiveMarker)?;
        self.write(plan_path, RecordKind::Cancelled, &info)?;
        info!(plan = %plan_path, index = paused_task_index, "run cancelled, resume window open");
        Ok(info)
    }

    /// The cancellation record if still inside its resume window. An
    /// expired record takes the paused execution state with it.
    pub fn load_cancelled(
        &self,
        plan_path: &str,
    ) -> Result<Option<CancelledExecutionInfo>, StateError> {
        let Some(info) = self.read::<CancelledExecutionInfo>(plan_path, RecordKind::Cancelled)?
        else {
            return Ok(None);
        };
        if info.is_valid_at(self.now()) {
            return Ok(Some(info));
        }
        warn!(plan = %plan_path, expired_at = %info.expires_at, "cancellation record expired");
        self.kv.delete(plan_path, RecordKind::Cancelled)?;
        self.kv.delete(plan_path, RecordKind::PendingContext)?;
        if let Some(state) = self.load_execution_state(plan_path)?
            && !state.paused_at_checkpoint
        {
            self.clear_execution_state(plan_path)?;
        }
        Ok(None)
    }

    pub fn take_cancelled(
        &self,
        plan_path: &str,
    ) -> Result<Option<CancelledExecutionInfo>, StateError> {
        let info = self.load_cancelled(plan_path)?;
        if info.is_some() {
            self.kv.delete(plan_path, RecordKind::Cancelled)?;
        }
        Ok(info)
    }

    // ---- active marker --------------------------------------------------

    /// Marks the run live; any cancellation record is superseded.
    pub fn mark_active(&self, plan_path: &str) -> Result<ActiveExecutionMarker, StateError> {
        let now = self.now();
        let marker = ActiveExecutionMarker {
            plan_path: plan_path.to_string(),
            pid: std::process::id(),
            started_at: now,
            last_activity_at: now,
        };
        self.kv.delete(plan_path, RecordKind::Cancelled)?;
        self.write(plan_path, RecordKind::ActiveMarker, &marker)?;
        Ok(marker)
    }

    pub fn touch_active(&self, plan_path: &str) -> Result<(), StateError> {
        let marker = match self.read::<ActiveExecutionMarker>(plan_path, RecordKind::ActiveMarker)? {
            Some(mut m) => {
                m.last_activity_at = self.now();
                m
            }
            None => return self.mark_active(plan_path).map(|_| ()),
        };
        self.write(plan_path, RecordKind::ActiveMarker, &marker)
    }

    /// The marker if it saw activity within the activity window.
    pub fn load_active(
        &self,
        plan_path: &str,
    ) -> Result<Option<ActiveExecutionMarker>, StateError> {
        let Some(marker) = self.read::<ActiveExecutionMarker>(plan_path, RecordKind::ActiveMarker)?
        else {
            return Ok(None);
        };
        if self.now() - marker.last_activity_at < self.activity_window {
            return Ok(Some(marker));
        }
        debug!(plan = %plan_path, "active marker is stale");
        self.kv.delete(plan_path, RecordKind::ActiveMarker)?;
        Ok(None)
    }

    pub fn clear_active(&self, plan_path: &str) -> Result<(), StateError> {
        self.kv.delete(plan_path, RecordKind::ActiveMarker)
    }

    // ---- pending context ------------------------------------------------

    /// Stashes text for the next prompt. Text stashed while an earlier stash
    /// is still unread is appended to it.
    pub fn stash_pending_context(&self, plan_path: &str, text: &str) -> Result<(), StateError> {
        let now = self.now();
        let merged = match self.read::<PendingExecutionContext>(plan_path, RecordKind::PendingContext)? {
            Some(existing) => format!("{}\n\n{}", existing.text, text),
            None => text.to_string(),
        };
        let pending = PendingExecutionContext {
            plan_path: plan_path.to_string(),
            text: merged,
            stashed_at: now,
        };
        self.write(plan_path, RecordKind::PendingContext, &pending)
    }

    /// Puts back context a task consumed but could not finish with, ahead
    /// of anything stashed since.
    pub fn restore_pending_context(&self, plan_path: &str, text: &str) -> Result<(), StateError> {
        let merged = match self.take_pending_context(plan_path)? {
            Some(newer) => format!("{text}\n\n{newer}"),
            None => text.to_string(),
        };
        self.stash_pending_context(plan_path, &merged)
    }

    pub fn peek_pending_context(&self, plan_path: &str) -> Result<Option<String>, StateError> {
        Ok(self
            .read::<PendingExecutionContext>(plan_path, RecordKind::PendingContext)?
            .map(|p| p.text))
    }

    pub fn take_pending_context(&self, plan_path: &str) -> Result<Option<String>, StateError> {
        let pending = self.peek_pending_context(plan_path)?;
        if pending.is_some() {
            self.kv.delete(plan_path, RecordKind::PendingContext)?;
        }
        Ok(pending)
    }

    // ---- cross-process cancel requests ---------------------------------

    pub fn request_cancel(&self, plan_path: &str) -> Result<(), StateError> {
        let req = CancelRequest {
            plan_path: plan_path.to_string(),
            requested_at: self.now(),
        };
        self.write(plan_path, RecordKind::CancelRequest, &req)
    }

    pub fn take_cancel_request(&self, plan_path: &str) -> Result<bool, StateError> {
        let found = self
            .read::<CancelRequest>(plan_path, RecordKind::CancelRequest)?
            .is_some();
        if found {
            self.kv.delete(plan_path, RecordKind::CancelRequest)?;
        }
        Ok(found)
    }

    /// Drops every record for the plan; used once a run completes.
    pub fn clear_all(&self, plan_path: &str) -> Result<(), StateError> {
        for kind in RecordKind::ALL {
            self.kv.delete(plan_path, kind)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionMode;
    use crate::state::clock::ManualClock;
    use crate::state::kv::{FileKvStore, MemoryKvStore};
    use tempfile::tempdir;

    const PLAN: &str = "/work/.planning/03-02-PLAN.md";

    fn store() -> (StateStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = StateStore::new(Arc::new(MemoryKvStore::new())).with_clock(clock.clone());
        (store, clock)
    }

    fn both_valid(store: &StateStore) -> bool {
        store.load_active(PLAN).unwrap().is_some() && store.load_cancelled(PLAN).unwrap().is_some()
    }

    #[test]
    fn execution_state_roundtrip_on_disk() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(Arc::new(FileKvStore::new(dir.path()).unwrap()));
        let mut state = ExecutionState::new(PLAN, ExecutionMode::Guided, store.now());
        state.decisions_made.insert(2, "redis".into());
        state.settle_current(crate::planning::TaskStatus::Completed, None);
        store.save_execution_state(&mut state).unwrap();

        let loaded = store.load_execution_state(PLAN).unwrap().unwrap();
        assert_eq!(loaded, state);
        store.clear_execution_state(PLAN).unwrap();
        assert!(store.load_execution_state(PLAN).unwrap().is_none());
    }

    #[test]
    fn cancelled_record_expires_after_window() {
        let (store, clock) = store();
        store.save_cancelled(PLAN, 1, vec![]).unwrap();

        clock.advance(Duration::seconds(299));
        assert_eq!(store.load_cancelled(PLAN).unwrap().unwrap().paused_task_index, 1);

        clock.advance(Duration::seconds(1));
        assert!(store.load_cancelled(PLAN).unwrap().is_none());
        // Gone for good, even if the clock were wound back.
        assert!(store.take_cancelled(PLAN).unwrap().is_none());
    }

    #[test]
    fn expired_cancellation_drops_unpaused_state() {
        let (store, clock) = store();
        let mut state = ExecutionState::new(PLAN, ExecutionMode::Yolo, store.now());
        store.save_execution_state(&mut state).unwrap();
        store.save_cancelled(PLAN, 0, vec![]).unwrap();

        clock.advance(Duration::minutes(6));
        assert!(store.load_cancelled(PLAN).unwrap().is_none());
        assert!(store.load_execution_state(PLAN).unwrap().is_none());
    }

    #[test]
    fn active_marker_goes_stale() {
        let (store, clock) = store();
        store.mark_active(PLAN).unwrap();
        clock.advance(Duration::seconds(59));
        assert!(store.load_active(PLAN).unwrap().is_some());

        store.touch_active(PLAN).unwrap();
        clock.advance(Duration::seconds(59));
        assert!(store.load_active(PLAN).unwrap().is_some());

        clock.advance(Duration::seconds(1));
        assert!(store.load_active(PLAN).unwrap().is_none());
    }

    #[test]
    fn active_and_cancelled_are_never_both_valid() {
        let (store, clock) = store();

        store.mark_active(PLAN).unwrap();
        assert!(!both_valid(&store));
        store.save_cancelled(PLAN, 0, vec![]).unwrap();
        assert!(!both_valid(&store));
        assert!(store.load_active(PLAN).unwrap().is_none());

        store.mark_active(PLAN).unwrap();
        assert!(!both_valid(&store));
        assert!(store.load_cancelled(PLAN).unwrap().is_none());

        clock.advance(Duration::seconds(30));
        store.touch_active(PLAN).unwrap();
        store.save_cancelled(PLAN, 2, vec![]).unwrap();
        assert!(!both_valid(&store));
    }

    #[test]
    fn pending_context_is_consumed_once() {
        let (store, _) = store();
        store.stash_pending_context(PLAN, "use retries=5").unwrap();
        store.stash_pending_context(PLAN, "and log them").unwrap();

        assert_eq!(
            store.take_pending_context(PLAN).unwrap().as_deref(),
            Some("use retries=5\n\nand log them")
        );
        assert_eq!(store.take_pending_context(PLAN).unwrap(), None);
    }

    #[test]
    fn heartbeat_runs_well_inside_the_activity_window() {
        let (store, _) = store();
        assert_eq!(store.heartbeat_interval(), std::time::Duration::from_secs(20));
        let tiny = store.with_windows(Duration::seconds(300), Duration::zero());
        assert_eq!(tiny.heartbeat_interval(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn restored_context_goes_ahead_of_newer_input() {
        let (store, _) = store();
        store.stash_pending_context(PLAN, "typed after the failure").unwrap();
        store.restore_pending_context(PLAN, "use retries=5").unwrap();
        assert_eq!(
            store.take_pending_context(PLAN).unwrap().as_deref(),
            Some("use retries=5\n\ntyped after the failure")
        );
    }

    #[test]
    fn cancel_request_is_one_shot() {
        let (store, _) = store();
        assert!(!store.take_cancel_request(PLAN).unwrap());
        store.request_cancel(PLAN).unwrap();
        assert!(store.take_cancel_request(PLAN).unwrap());
        assert!(!store.take_cancel_request(PLAN).unwrap());
    }

    #[test]
    fn clear_all_removes_everything() {
        let (store, _) = store();
        let mut state = ExecutionState::new(PLAN, ExecutionMode::Manual, store.now());
        store.save_execution_state(&mut state).unwrap();
        store.save_cancelled(PLAN, 0, vec![]).unwrap();
        store.stash_pending_context(PLAN, "x").unwrap();

        store.clear_all(PLAN).unwrap();
        assert!(store.load_execution_state(PLAN).unwrap().is_none());
        assert!(store.load_cancelled(PLAN).unwrap().is_none());
        assert!(store.peek_pending_context(PLAN).unwrap().is_none());
    }
}
