// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Action server.
//!
//! ```text
//!   client ──► <ns>/goal   ──► process_goal   ──► goal callback
//!   client ──► <ns>/cancel ──► process_cancel ──► cancel callback
//!
//!   ServerGoalHandle::set_* ──► status array (+ result when terminal)
//!   status timer            ──► status array, purge of expired goals
//! ```
//!
//! One lock guards the goal trackers and the last cancel stamp. Publishing
//! happens under that lock so status arrays never go out of order; user
//! callbacks run after it is released.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::msgs::{
    Action, ActionFeedback, ActionGoal, ActionResult, GoalID, GoalStatus, GoalStatusArray,
    StatusCode,
};
use super::server_goal_handle::ServerGoalHandle;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::message::{MsgHeader, Time};
use crate::node::{Node, Publisher, Subscriber};

pub type GoalCallback<A> = Arc<dyn Fn(ServerGoalHandle<A>) + Send + Sync>;
pub type CancelCallback<A> = Arc<dyn Fn(ServerGoalHandle<A>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ActionServerConfig {
    pub queue_size: usize,
    /// Status array publish rate (Hz).
    pub status_frequency: f64,
    /// How long a finished goal stays in the status array.
    pub status_list_timeout: Duration,
}

impl Default for ActionServerConfig {
    fn default() -> Self {
        Self {
            queue_size: 50,
            status_frequency: 5.0,
            status_list_timeout: Duration::from_secs(5),
        }
    }
}

impl ActionServerConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        Self {
            status_frequency: config.action_status_frequency,
            status_list_timeout: config.action_status_list_timeout,
            ..Self::default()
        }
    }

    fn status_period(&self) -> Duration {
        if self.status_frequency.is_finite() && self.status_frequency > 0.0 {
            Duration::from_secs_f64(1.0 / self.status_frequency)
        } else {
            Duration::from_millis(200)
        }
    }
}

// ============================================================================
// Output seam
// ============================================================================

/// Where the server's outgoing messages go.
pub(crate) trait ServerSink<A: Action>: Send + Sync {
    fn status(&self, array: GoalStatusArray);
    fn result(&self, result: ActionResult<A>);
    fn feedback(&self, feedback: ActionFeedback<A>);
}

struct TopicSink<A: Action> {
    status_pub: Publisher<GoalStatusArray>,
    result_pub: Publisher<ActionResult<A>>,
    feedback_pub: Publisher<ActionFeedback<A>>,
}

impl<A: Action> ServerSink<A> for TopicSink<A> {
    fn status(&self, array: GoalStatusArray) {
        if let Err(e) = self.status_pub.publish(array) {
            log::debug!("[action] status publish on {} failed: {}", self.status_pub.topic(), e);
        }
    }

    fn result(&self, result: ActionResult<A>) {
        if let Err(e) = self.result_pub.publish(result) {
            log::debug!("[action] result publish on {} failed: {}", self.result_pub.topic(), e);
        }
    }

    fn feedback(&self, feedback: ActionFeedback<A>) {
        if let Err(e) = self.feedback_pub.publish(feedback) {
            log::debug!(
                "[action] feedback publish on {} failed: {}",
                self.feedback_pub.topic(),
                e
            );
        }
    }
}

// ============================================================================
// Core
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ServerOp {
    Accept,
    Reject,
    Cancel,
    Abort,
    Succeed,
}

impl ServerOp {
    fn target(self, current: StatusCode) -> Option<StatusCode> {
        use StatusCode as S;
        match (self, current) {
            (ServerOp::Accept, S::Pending) => Some(S::Active),
            (ServerOp::Accept, S::Recalling) => Some(S::Preempting),
            (ServerOp::Reject, S::Pending | S::Recalling) => Some(S::Rejected),
            (ServerOp::Cancel, S::Pending | S::Recalling) => Some(S::Recalled),
            (ServerOp::Cancel, S::Active | S::Preempting) => Some(S::Preempted),
            (ServerOp::Abort, S::Active | S::Preempting) => Some(S::Aborted),
            (ServerOp::Succeed, S::Active | S::Preempting) => Some(S::Succeeded),
            _ => None,
        }
    }
}

fn cancel_request_target(current: StatusCode) -> Option<StatusCode> {
    match current {
        StatusCode::Pending => Some(StatusCode::Recalling),
        StatusCode::Active => Some(StatusCode::Preempting),
        _ => None,
    }
}

struct StatusTracker<A: Action> {
    status: GoalStatus,
    /// `None` for placeholders created by a cancel that came first.
    goal: Option<Arc<A::Goal>>,
    /// Set on the terminal transition (or placeholder creation); the tracker
    /// is purged `status_list_timeout` after it.
    destruction_time: Option<Instant>,
}

impl<A: Action> StatusTracker<A> {
    fn code(&self) -> StatusCode {
        self.status.code().unwrap_or(StatusCode::Lost)
    }
}

struct ServerState<A: Action> {
    trackers: Vec<StatusTracker<A>>,
    last_cancel: Time,
}

pub(crate) struct ServerCore<A: Action> {
    state: Mutex<ServerState<A>>,
    sink: Box<dyn ServerSink<A>>,
    goal_cb: GoalCallback<A>,
    cancel_cb: CancelCallback<A>,
    status_list_timeout: Duration,
    weak_self: Weak<ServerCore<A>>,
}

impl<A: Action> ServerCore<A> {
    pub(crate) fn new(
        sink: Box<dyn ServerSink<A>>,
        goal_cb: GoalCallback<A>,
        cancel_cb: CancelCallback<A>,
        status_list_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(ServerState {
                trackers: Vec::new(),
                last_cancel: Time::ZERO,
            }),
            sink,
            goal_cb,
            cancel_cb,
            status_list_timeout,
            weak_self: weak.clone(),
        })
    }

    fn handle(&self, goal_id: &GoalID, goal: &Arc<A::Goal>) -> ServerGoalHandle<A> {
        ServerGoalHandle::new(self.weak_self.clone(), goal_id.clone(), goal.clone())
    }

    pub(crate) fn status_of(&self, id: &str) -> Option<StatusCode> {
        let state = self.state.lock();
        state
            .trackers
            .iter()
            .find(|t| t.status.goal_id.id == id)
            .map(StatusTracker::code)
    }

    pub(crate) fn num_goals(&self) -> usize {
        self.state.lock().trackers.len()
    }

    // ========================================================================
    // Incoming goal / cancel
    // ========================================================================

    pub(crate) fn process_goal(&self, msg: &ActionGoal<A>) {
        let handle = {
            let mut state = self.state.lock();

            if let Some(tracker) = state
                .trackers
                .iter_mut()
                .find(|t| t.status.goal_id.id == msg.goal_id.id)
            {
                if tracker.code() == StatusCode::Recalling {
                    log::debug!("[action] goal {} was canceled before it arrived", msg.goal_id.id);
                    tracker.status.set(StatusCode::Recalled);
                    tracker.goal = Some(Arc::new(msg.goal.clone()));
                    tracker.destruction_time = Some(Instant::now());
                    self.sink.result(ActionResult {
                        header: MsgHeader::default(),
                        status: tracker.status.clone(),
                        result: A::Result::default(),
                    });
                    self.publish_status_locked(&state);
                } else {
                    log::debug!("[action] ignoring duplicate goal {}", msg.goal_id.id);
                }
                return;
            }

            let mut goal_id = msg.goal_id.clone();
            if goal_id.stamp.is_zero() {
                goal_id.stamp = Time::now();
            }
            let goal = Arc::new(msg.goal.clone());
            state.trackers.push(StatusTracker {
                status: GoalStatus::new(goal_id.clone(), StatusCode::Pending),
                goal: Some(goal.clone()),
                destruction_time: None,
            });

            if goal_id.stamp <= state.last_cancel {
                let text = "This goal was canceled because its timestamp is before the last cancel request";
                if let Err(e) = self.apply_locked(&mut state, &goal_id.id, ServerOp::Cancel, None, text) {
                    log::error!("[action] BUG: {}", e);
                }
                return;
            }

            self.publish_status_locked(&state);
            self.handle(&goal_id, &goal)
        };
        (self.goal_cb)(handle);
    }

    pub(crate) fn process_cancel(&self, cancel: &GoalID) {
        let notify = {
            let mut state = self.state.lock();
            let everything = cancel.id.is_empty() && cancel.stamp.is_zero();
            let mut found = false;
            let mut changed = false;
            let mut notify = Vec::new();

            for tracker in state.trackers.iter_mut() {
                let same_id = tracker.status.goal_id.id == cancel.id;
                let covered = !cancel.stamp.is_zero() && tracker.status.goal_id.stamp <= cancel.stamp;
                if !(everything || same_id || covered) {
                    continue;
                }
                found |= same_id;
                if let Some(next) = cancel_request_target(tracker.code()) {
                    tracker.status.set(next);
                    changed = true;
                    if let Some(goal) = &tracker.goal {
                        notify.push(self.handle(&tracker.status.goal_id, goal));
                    }
                }
            }

            if !cancel.id.is_empty() && !found {
                log::debug!("[action] cancel for unknown goal {}, keeping a placeholder", cancel.id);
                let mut goal_id = cancel.clone();
                if goal_id.stamp.is_zero() {
                    goal_id.stamp = Time::now();
                }
                state.trackers.push(StatusTracker {
                    status: GoalStatus::new(goal_id, StatusCode::Recalling),
                    goal: None,
                    destruction_time: Some(Instant::now()),
                });
                changed = true;
            }

            if cancel.stamp > state.last_cancel {
                state.last_cancel = cancel.stamp;
            }
            if changed {
                self.publish_status_locked(&state);
            }
            notify
        };
        for handle in notify {
            (self.cancel_cb)(handle);
        }
    }

    // ========================================================================
    // Driven by goal handles
    // ========================================================================

    pub(crate) fn apply(&self, id: &str, op: ServerOp, result: Option<A::Result>, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        self.apply_locked(&mut state, id, op, result, text)
    }

    fn apply_locked(
        &self,
        state: &mut ServerState<A>,
        id: &str,
        op: ServerOp,
        result: Option<A::Result>,
        text: &str,
    ) -> Result<()> {
        let tracker = state
            .trackers
            .iter_mut()
            .find(|t| t.status.goal_id.id == id)
            .ok_or_else(|| Error::InvalidTransition(format!("goal {} is no longer tracked", id)))?;
        let current = tracker.code();
        let Some(next) = op.target(current) else {
            log::error!(
                "[action] {:?} is not allowed for goal {} in status {}",
                op,
                id,
                current
            );
            return Err(Error::InvalidTransition(format!(
                "{:?} on goal {} in status {}",
                op, id, current
            )));
        };

        log::debug!("[action] goal {}: {} -> {}", id, current, next);
        tracker.status.set(next);
        tracker.status.text = text.to_string();
        if next.is_terminal() {
            tracker.destruction_time = Some(Instant::now());
            self.sink.result(ActionResult {
                header: MsgHeader::default(),
                status: tracker.status.clone(),
                result: result.unwrap_or_default(),
            });
        }
        self.publish_status_locked(state);
        Ok(())
    }

    pub(crate) fn request_cancel(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(tracker) = state.trackers.iter_mut().find(|t| t.status.goal_id.id == id) else {
            return false;
        };
        match cancel_request_target(tracker.code()) {
            Some(next) => {
                tracker.status.set(next);
                self.publish_status_locked(&state);
                true
            }
            None => false,
        }
    }

    pub(crate) fn feedback(&self, id: &str, feedback: A::Feedback) -> Result<()> {
        let state = self.state.lock();
        let tracker = state
            .trackers
            .iter()
            .find(|t| t.status.goal_id.id == id)
            .ok_or_else(|| Error::InvalidTransition(format!("goal {} is no longer tracked", id)))?;
        self.sink.feedback(ActionFeedback {
            header: MsgHeader::default(),
            status: tracker.status.clone(),
            feedback,
        });
        Ok(())
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn publish_status_locked(&self, state: &ServerState<A>) {
        self.sink.status(GoalStatusArray {
            header: MsgHeader::default(),
            status_list: state.trackers.iter().map(|t| t.status.clone()).collect(),
        });
    }

    /// Purge expired trackers, then publish the status array.
    pub(crate) fn publish_status(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let timeout = self.status_list_timeout;
        state.trackers.retain(|t| match t.destruction_time {
            Some(at) => at + timeout > now,
            None => true,
        });
        self.publish_status_locked(&state);
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct ActionServer<A: Action> {
    namespace: String,
    core: Arc<ServerCore<A>>,
    _goal_sub: Subscriber,
    _cancel_sub: Subscriber,
    stop: Option<Sender<()>>,
    timer: Option<JoinHandle<()>>,
}

impl<A: Action> ActionServer<A> {
    /// Serve `namespace` (resolved by the node). Status publishing starts
    /// immediately.
    pub fn new<G, C>(node: &Arc<Node>, namespace: &str, on_goal: G, on_cancel: C) -> Result<Self>
    where
        G: Fn(ServerGoalHandle<A>) + Send + Sync + 'static,
        C: Fn(ServerGoalHandle<A>) + Send + Sync + 'static,
    {
        let config = ActionServerConfig::from_node(node.config());
        Self::with_config(node, namespace, config, Arc::new(on_goal), Arc::new(on_cancel))
    }

    pub fn with_config(
        node: &Arc<Node>,
        namespace: &str,
        config: ActionServerConfig,
        on_goal: GoalCallback<A>,
        on_cancel: CancelCallback<A>,
    ) -> Result<Self> {
        let namespace = node.resolve_name(namespace)?;
        let topic = |leaf: &str| format!("{}/{}", namespace.trim_end_matches('/'), leaf);

        let sink = TopicSink {
            status_pub: node.advertise::<GoalStatusArray>(&topic("status"), config.queue_size, true)?,
            result_pub: node.advertise::<ActionResult<A>>(&topic("result"), config.queue_size, false)?,
            feedback_pub: node.advertise::<ActionFeedback<A>>(&topic("feedback"), config.queue_size, false)?,
        };
        let core = ServerCore::new(Box::new(sink), on_goal, on_cancel, config.status_list_timeout);

        let weak = Arc::downgrade(&core);
        let goal_sub = node.subscribe::<ActionGoal<A>, _>(&topic("goal"), config.queue_size, move |goal| {
            if let Some(core) = weak.upgrade() {
                core.process_goal(&goal);
            }
        })?;
        let weak = Arc::downgrade(&core);
        let cancel_sub = node.subscribe::<GoalID, _>(&topic("cancel"), config.queue_size, move |cancel| {
            if let Some(core) = weak.upgrade() {
                core.process_cancel(&cancel);
            }
        })?;

        core.publish_status();
        let (stop, stop_rx) = channel::bounded::<()>(1);
        let weak = Arc::downgrade(&core);
        let period = config.status_period();
        let timer = thread::Builder::new()
            .name("rosnode-action-status".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => match weak.upgrade() {
                        Some(core) => core.publish_status(),
                        None => break,
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(Error::Io)?;

        log::info!("[action] server {} ({}) started", namespace, A::action_type());
        Ok(Self {
            namespace,
            core,
            _goal_sub: goal_sub,
            _cancel_sub: cancel_sub,
            stop: Some(stop),
            timer: Some(timer),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Goals currently listed in the status array.
    pub fn num_goals(&self) -> usize {
        self.core.num_goals()
    }
}

impl<A: Action> Drop for ActionServer<A> {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

impl<A: Action> std::fmt::Debug for ActionServer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionServer")
            .field("namespace", &self.namespace)
            .field("type", &A::action_type())
            .finish()
    }
}
