// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side view of one goal.
//!
//! Each goal sent by an [`ActionClient`](super::ActionClient) is tracked by a
//! `GoalEntry` that walks the [`CommState`] table as status arrays, results
//! and cancel timeouts arrive. User callbacks always run after the entry
//! lock is released.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::comm_state::{transition, CommState, Transition};
use super::msgs::{Action, ActionFeedback, ActionResult, GoalID, GoalStatus, StatusCode};
use crate::error::Result;
use crate::message::Time;

/// Called once per state entered, in order.
pub type TransitionCallback<A> = Arc<dyn Fn(&ClientGoalHandle<A>, CommState) + Send + Sync>;

/// Called for every feedback message addressed to the goal.
pub type FeedbackCallback<A> =
    Arc<dyn Fn(&ClientGoalHandle<A>, &<A as Action>::Feedback) + Send + Sync>;

/// Publishes a cancel request.
pub(crate) type CancelSink = Arc<dyn Fn(GoalID) -> Result<()> + Send + Sync>;

/// How a goal finished, as seen by the client.
#[derive(Clone, Debug, PartialEq)]
pub enum GoalOutcome<R> {
    Succeeded(R),
    /// Finished PREEMPTED.
    Cancelled,
    /// Any other terminal status, LOST included.
    Failed { status: StatusCode, text: String },
}

struct GoalInner<A: Action> {
    state: CommState,
    latest_status: Option<GoalStatus>,
    latest_result: Option<A::Result>,
    outcome: Option<GoalOutcome<A::Result>>,
    cancel_generation: u64,
}

pub(crate) struct GoalEntry<A: Action> {
    goal_id: GoalID,
    inner: Mutex<GoalInner<A>>,
    done: Condvar,
    on_transition: Option<TransitionCallback<A>>,
    on_feedback: Option<FeedbackCallback<A>>,
    cancel_sink: CancelSink,
    preempt_timeout: Duration,
}

impl<A: Action> GoalEntry<A> {
    pub(crate) fn new(
        goal_id: GoalID,
        on_transition: Option<TransitionCallback<A>>,
        on_feedback: Option<FeedbackCallback<A>>,
        cancel_sink: CancelSink,
        preempt_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            goal_id,
            inner: Mutex::new(GoalInner {
                state: CommState::WaitingForGoalAck,
                latest_status: None,
                latest_result: None,
                outcome: None,
                cancel_generation: 0,
            }),
            done: Condvar::new(),
            on_transition,
            on_feedback,
            cancel_sink,
            preempt_timeout,
        })
    }

    pub(crate) fn goal_id(&self) -> &GoalID {
        &self.goal_id
    }

    // ========================================================================
    // Driven by the action client
    // ========================================================================

    /// Reconcile with one status array. `None` means the goal was absent.
    pub(crate) fn update_status(self: &Arc<Self>, status: Option<&GoalStatus>) {
        let mut steps = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                return;
            }
            match status {
                Some(status) => self.apply_locked(&mut inner, status, &mut steps),
                None => match inner.state {
                    CommState::WaitingForGoalAck | CommState::WaitingForResult | CommState::Done => {}
                    state => {
                        log::debug!(
                            "[action] goal {} missing from status array while {}, marking LOST",
                            self.goal_id.id,
                            state
                        );
                        self.lose_locked(&mut inner, &mut steps);
                    }
                },
            }
        }
        self.fire(&steps);
    }

    pub(crate) fn update_result(self: &Arc<Self>, result: &ActionResult<A>) {
        let mut steps = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                log::error!(
                    "[action] BUG: got a result for goal {} which is already DONE",
                    self.goal_id.id
                );
                return;
            }
            inner.latest_result = Some(result.result.clone());
            self.apply_locked(&mut inner, &result.status, &mut steps);
            self.finish_locked(&mut inner, &mut steps);
        }
        self.fire(&steps);
    }

    pub(crate) fn update_feedback(self: &Arc<Self>, feedback: &ActionFeedback<A>) {
        if let Some(cb) = &self.on_feedback {
            cb(&ClientGoalHandle { entry: self.clone() }, &feedback.feedback);
        }
    }

    /// Force the goal to DONE with status LOST.
    pub(crate) fn mark_lost(self: &Arc<Self>) {
        let mut steps = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                return;
            }
            self.lose_locked(&mut inner, &mut steps);
        }
        self.fire(&steps);
    }

    fn cancel(self: &Arc<Self>) -> Result<()> {
        let generation;
        let mut steps = Vec::new();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CommState::WaitingForGoalAck
                | CommState::Pending
                | CommState::Active
                | CommState::WaitingForCancelAck => {}
                state => {
                    log::debug!(
                        "[action] ignoring cancel of goal {} while {}",
                        self.goal_id.id,
                        state
                    );
                    return Ok(());
                }
            }
            if inner.state != CommState::WaitingForCancelAck {
                inner.state = CommState::WaitingForCancelAck;
                steps.push(CommState::WaitingForCancelAck);
            }
            inner.cancel_generation += 1;
            generation = inner.cancel_generation;
        }

        let sent = (self.cancel_sink)(GoalID {
            stamp: Time::ZERO,
            id: self.goal_id.id.clone(),
        });
        self.fire(&steps);
        self.arm_cancel_timer(generation);
        sent
    }

    fn arm_cancel_timer(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let timeout = self.preempt_timeout;
        let spawned = thread::Builder::new()
            .name("rosnode-cancel-timer".into())
            .spawn(move || {
                thread::sleep(timeout);
                if let Some(entry) = weak.upgrade() {
                    entry.cancel_timed_out(generation);
                }
            });
        if let Err(e) = spawned {
            log::warn!("[action] failed to start cancel timer: {}", e);
        }
    }

    fn cancel_timed_out(self: &Arc<Self>, generation: u64) {
        let mut steps = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.cancel_generation != generation || inner.state != CommState::WaitingForCancelAck {
                return;
            }
            log::warn!(
                "[action] cancel of goal {} not acknowledged within {:?}, marking LOST",
                self.goal_id.id,
                self.preempt_timeout
            );
            self.lose_locked(&mut inner, &mut steps);
        }
        self.fire(&steps);
    }

    // ========================================================================
    // Locked helpers
    // ========================================================================

    fn apply_locked(&self, inner: &mut GoalInner<A>, status: &GoalStatus, steps: &mut Vec<CommState>) {
        inner.latest_status = Some(status.clone());
        let Some(code) = status.code() else {
            log::error!(
                "[action] BUG: goal {} got out-of-range status {}",
                self.goal_id.id,
                status.status
            );
            return;
        };
        match transition(inner.state, code) {
            Transition::NoChange => {}
            Transition::Chain(chain) => {
                for &next in chain {
                    inner.state = next;
                    steps.push(next);
                }
            }
            Transition::Invalid => log::error!(
                "[action] BUG: invalid transition for goal {}: status {} while {}",
                self.goal_id.id,
                code,
                inner.state
            ),
            Transition::UnknownStatus => log::error!(
                "[action] BUG: got an unknown status from the action server for goal {}: {}",
                self.goal_id.id,
                code
            ),
        }
    }

    fn lose_locked(&self, inner: &mut GoalInner<A>, steps: &mut Vec<CommState>) {
        inner.latest_status = Some(GoalStatus::new(self.goal_id.clone(), StatusCode::Lost));
        self.finish_locked(inner, steps);
    }

    /// Enter DONE and resolve the outcome. Later calls keep the first outcome.
    fn finish_locked(&self, inner: &mut GoalInner<A>, steps: &mut Vec<CommState>) {
        inner.state = CommState::Done;
        steps.push(CommState::Done);
        if inner.outcome.is_none() {
            let (code, text) = match &inner.latest_status {
                Some(s) => (s.code().unwrap_or(StatusCode::Lost), s.text.clone()),
                None => (StatusCode::Lost, String::new()),
            };
            inner.outcome = Some(match code {
                StatusCode::Succeeded => {
                    GoalOutcome::Succeeded(inner.latest_result.clone().unwrap_or_default())
                }
                StatusCode::Preempted => GoalOutcome::Cancelled,
                status => GoalOutcome::Failed { status, text },
            });
        }
        self.done.notify_all();
    }

    fn fire(self: &Arc<Self>, steps: &[CommState]) {
        if steps.is_empty() {
            return;
        }
        if let Some(cb) = &self.on_transition {
            let handle = ClientGoalHandle { entry: self.clone() };
            for &state in steps {
                cb(&handle, state);
            }
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to a goal sent by an action client. Clones refer to the same goal;
/// once every handle is dropped the client stops tracking it.
pub struct ClientGoalHandle<A: Action> {
    entry: Arc<GoalEntry<A>>,
}

impl<A: Action> Clone for ClientGoalHandle<A> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl<A: Action> PartialEq for ClientGoalHandle<A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl<A: Action> ClientGoalHandle<A> {
    pub(crate) fn new(entry: Arc<GoalEntry<A>>) -> Self {
        Self { entry }
    }

    pub fn goal_id(&self) -> &GoalID {
        self.entry.goal_id()
    }

    pub fn comm_state(&self) -> CommState {
        self.entry.inner.lock().state
    }

    /// Last status reported for this goal (LOST once given up on).
    pub fn goal_status(&self) -> Option<GoalStatus> {
        self.entry.inner.lock().latest_status.clone()
    }

    pub fn result(&self) -> Option<A::Result> {
        self.entry.inner.lock().latest_result.clone()
    }

    /// Set once the goal reaches DONE.
    pub fn outcome(&self) -> Option<GoalOutcome<A::Result>> {
        self.entry.inner.lock().outcome.clone()
    }

    pub fn is_done(&self) -> bool {
        self.comm_state().is_done()
    }

    /// Ask the server to cancel this goal. If the server does not
    /// acknowledge within the preempt timeout the goal is marked LOST.
    pub fn cancel(&self) -> Result<()> {
        self.entry.cancel()
    }

    /// Block until the goal is DONE. `None` waits forever; on timeout
    /// returns `None`.
    pub fn wait_for_result(&self, timeout: Option<Duration>) -> Option<GoalOutcome<A::Result>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.entry.inner.lock();
        while inner.outcome.is_none() {
            match deadline {
                Some(d) => {
                    if self.entry.done.wait_until(&mut inner, d).timed_out() {
                        break;
                    }
                }
                None => self.entry.done.wait(&mut inner),
            }
        }
        inner.outcome.clone()
    }
}

impl<A: Action> fmt::Debug for ClientGoalHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientGoalHandle")
            .field("goal_id", &self.entry.goal_id.id)
            .field("state", &self.comm_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actionlib::test_support::TestAction;
    use crate::message::MsgHeader;
    use crate::msgs::StringMsg;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry_with(
        preempt: Duration,
    ) -> (
        Arc<GoalEntry<TestAction>>,
        Arc<Mutex<Vec<CommState>>>,
        Arc<AtomicUsize>,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancels = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let cancels_cb = cancels.clone();
        let entry = GoalEntry::new(
            GoalID {
                stamp: Time::new(1, 0),
                id: "goal-1".into(),
            },
            Some(Arc::new(move |_: &ClientGoalHandle<TestAction>, s: CommState| {
                seen_cb.lock().push(s)
            })),
            None,
            Arc::new(move |_| {
                cancels_cb.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            preempt,
        );
        (entry, seen, cancels)
    }

    fn status(code: StatusCode) -> GoalStatus {
        GoalStatus::new(
            GoalID {
                stamp: Time::new(1, 0),
                id: "goal-1".into(),
            },
            code,
        )
    }

    fn result(code: StatusCode, data: &str) -> ActionResult<TestAction> {
        ActionResult {
            header: MsgHeader::default(),
            status: status(code),
            result: StringMsg::new(data),
        }
    }

    #[test]
    fn test_success_path() {
        let (entry, seen, _) = entry_with(Duration::from_secs(3));
        let handle = ClientGoalHandle::new(entry.clone());
        entry.update_status(Some(&status(StatusCode::Active)));
        assert_eq!(handle.comm_state(), CommState::Active);
        entry.update_result(&result(StatusCode::Succeeded, "42"));
        assert_eq!(
            *seen.lock(),
            vec![CommState::Active, CommState::WaitingForResult, CommState::Done]
        );
        assert_eq!(
            handle.wait_for_result(Some(Duration::from_millis(10))),
            Some(GoalOutcome::Succeeded(StringMsg::new("42")))
        );
    }

    #[test]
    fn test_done_is_terminal_and_resolves_once() {
        let (entry, seen, _) = entry_with(Duration::from_secs(3));
        let handle = ClientGoalHandle::new(entry.clone());
        entry.update_result(&result(StatusCode::Preempted, ""));
        assert_eq!(handle.outcome(), Some(GoalOutcome::Cancelled));

        entry.update_result(&result(StatusCode::Succeeded, "late"));
        entry.update_status(Some(&status(StatusCode::Active)));
        entry.update_status(None);
        entry.mark_lost();

        assert_eq!(handle.outcome(), Some(GoalOutcome::Cancelled));
        let done = seen.lock().iter().filter(|s| **s == CommState::Done).count();
        assert_eq!(done, 1);
    }

    #[test]
    fn test_cancel_timeout_marks_lost_once() {
        let (entry, seen, cancels) = entry_with(Duration::from_millis(30));
        let handle = ClientGoalHandle::new(entry.clone());
        entry.update_status(Some(&status(StatusCode::Active)));
        handle.cancel().unwrap();
        handle.cancel().unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 2);
        assert_eq!(handle.comm_state(), CommState::WaitingForCancelAck);

        let outcome = handle.wait_for_result(Some(Duration::from_secs(2)));
        assert_eq!(
            outcome,
            Some(GoalOutcome::Failed {
                status: StatusCode::Lost,
                text: String::new()
            })
        );
        thread::sleep(Duration::from_millis(100));
        let done = seen.lock().iter().filter(|s| **s == CommState::Done).count();
        assert_eq!(done, 1);

        // Cancel after DONE is ignored.
        handle.cancel().unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_acknowledged_cancel_does_not_time_out() {
        let (entry, _, _) = entry_with(Duration::from_millis(20));
        let handle = ClientGoalHandle::new(entry.clone());
        entry.update_status(Some(&status(StatusCode::Pending)));
        handle.cancel().unwrap();
        entry.update_status(Some(&status(StatusCode::Recalling)));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(handle.comm_state(), CommState::Recalling);
        assert!(handle.outcome().is_none());
    }

    #[test]
    fn test_missing_from_status_array() {
        let (entry, _, _) = entry_with(Duration::from_secs(3));
        let handle = ClientGoalHandle::new(entry.clone());
        // Not acknowledged yet: absence is expected.
        entry.update_status(None);
        assert_eq!(handle.comm_state(), CommState::WaitingForGoalAck);

        entry.update_status(Some(&status(StatusCode::Active)));
        entry.update_status(None);
        assert_eq!(handle.comm_state(), CommState::Done);
        assert_eq!(handle.goal_status().and_then(|s| s.code()), Some(StatusCode::Lost));
    }

    #[test]
    fn test_invalid_transition_is_ignored() {
        let (entry, _, _) = entry_with(Duration::from_secs(3));
        let handle = ClientGoalHandle::new(entry.clone());
        entry.update_status(Some(&status(StatusCode::Active)));
        entry.update_status(Some(&status(StatusCode::Pending)));
        assert_eq!(handle.comm_state(), CommState::Active);
    }
}
