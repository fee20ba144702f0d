// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Action client.
//!
//! ```text
//!   ActionClient ──goal──────► <ns>/goal    ──► server
//!                ──cancel────► <ns>/cancel  ──► server
//!                ◄──status──── <ns>/status  ◄── server  (reconciles every goal)
//!                ◄──feedback── <ns>/feedback◄── server
//!                ◄──result──── <ns>/result  ◄── server
//! ```
//!
//! Goals are tracked weakly: once every [`ClientGoalHandle`] of a goal is
//! dropped the client forgets it. Subscription callbacks run on the node's
//! callback queue, so the node must be spun for goals to progress.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::client_goal_handle::{
    CancelSink, ClientGoalHandle, FeedbackCallback, GoalEntry, TransitionCallback,
};
use super::goal_id::GoalIdGenerator;
use super::msgs::{Action, ActionFeedback, ActionGoal, ActionResult, GoalID, GoalStatusArray};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::message::{MsgHeader, Time};
use crate::node::{Node, Publisher, Subscriber};
use crate::topic::{PeerCallback, PeerPublisher, SubscriberStatusCallbacks};

/// Longest single wait inside [`ActionClient::wait_for_server`] before the
/// node state is checked again.
const SERVER_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ActionClientConfig {
    /// Queue size of the five action topics.
    pub queue_size: usize,
    /// How long a cancel may stay unacknowledged before the goal is LOST.
    pub preempt_timeout: Duration,
}

impl Default for ActionClientConfig {
    fn default() -> Self {
        Self {
            queue_size: 10,
            preempt_timeout: Duration::from_millis(3000),
        }
    }
}

impl ActionClientConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        Self {
            preempt_timeout: config.action_preempt_timeout,
            ..Self::default()
        }
    }
}

// ============================================================================
// Server connection tracking
// ============================================================================

#[derive(Default)]
struct ServerState {
    /// Subscriber caller id -> connection count, per client publisher.
    goal_subscribers: HashMap<String, usize>,
    cancel_subscribers: HashMap<String, usize>,
    /// Caller id of the node publishing status, once a status was seen.
    status_caller_id: Option<String>,
    last_seq: Option<u32>,
}

/// What the client knows about the action server, behind one lock.
#[derive(Default)]
pub(crate) struct ServerTracker {
    state: Mutex<ServerState>,
    changed: Condvar,
}

impl ServerTracker {
    fn peer_callbacks(self: &Arc<Self>, cancel_topic: bool) -> SubscriberStatusCallbacks {
        let on_connect: PeerCallback = {
            let tracker = self.clone();
            Arc::new(move |peer: &PeerPublisher| tracker.peer_changed(cancel_topic, peer.subscriber_name(), true))
        };
        let on_disconnect: PeerCallback = {
            let tracker = self.clone();
            Arc::new(move |peer: &PeerPublisher| tracker.peer_changed(cancel_topic, peer.subscriber_name(), false))
        };
        SubscriberStatusCallbacks {
            on_connect: Some(on_connect),
            on_disconnect: Some(on_disconnect),
        }
    }

    fn peer_changed(&self, cancel_topic: bool, caller_id: &str, connected: bool) {
        {
            let mut state = self.state.lock();
            let map = if cancel_topic {
                &mut state.cancel_subscribers
            } else {
                &mut state.goal_subscribers
            };
            if connected {
                *map.entry(caller_id.to_string()).or_insert(0) += 1;
            } else if let Some(count) = map.get_mut(caller_id) {
                *count -= 1;
                if *count == 0 {
                    map.remove(caller_id);
                }
            } else {
                log::error!(
                    "[action] BUG: disconnect from {} which was never counted as connected",
                    caller_id
                );
            }
        }
        self.changed.notify_all();
    }

    /// Record a status array; true if its sequence number went backwards.
    fn record_status(&self, seq: u32, caller_id: &str) -> bool {
        let regressed = {
            let mut state = self.state.lock();
            match state.status_caller_id.as_deref() {
                Some(prev) if prev != caller_id => {
                    log::warn!(
                        "[action] status now comes from {} instead of {}",
                        caller_id,
                        prev
                    );
                    state.status_caller_id = Some(caller_id.to_string());
                }
                None => {
                    log::debug!("[action] first status from {}", caller_id);
                    state.status_caller_id = Some(caller_id.to_string());
                }
                Some(_) => {}
            }
            let regressed = matches!(state.last_seq, Some(last) if seq < last);
            state.last_seq = Some(seq);
            regressed
        };
        self.changed.notify_all();
        regressed
    }

    /// Status seen, and the status publisher subscribes to goal and cancel.
    fn is_connected(&self) -> bool {
        let state = self.state.lock();
        match &state.status_caller_id {
            Some(server) => {
                state.goal_subscribers.contains_key(server)
                    && state.cancel_subscribers.contains_key(server)
            }
            None => false,
        }
    }

    fn wait_changed(&self, timeout: Duration) {
        let mut state = self.state.lock();
        let _ = self.changed.wait_for(&mut state, timeout);
    }
}

// ============================================================================
// Goal list
// ============================================================================

pub(crate) struct GoalList<A: Action> {
    goals: Mutex<Vec<Weak<GoalEntry<A>>>>,
}

impl<A: Action> GoalList<A> {
    pub(crate) fn new() -> Self {
        Self {
            goals: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, entry: &Arc<GoalEntry<A>>) {
        self.goals.lock().push(Arc::downgrade(entry));
    }

    /// Live entries; forgotten goals are pruned on the way.
    pub(crate) fn live(&self) -> Vec<Arc<GoalEntry<A>>> {
        let mut goals = self.goals.lock();
        let mut live = Vec::with_capacity(goals.len());
        goals.retain(|weak| match weak.upgrade() {
            Some(entry) => {
                live.push(entry);
                true
            }
            None => false,
        });
        live
    }

    fn find(&self, id: &str) -> Option<Arc<GoalEntry<A>>> {
        self.live().into_iter().find(|e| e.goal_id().id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.live().len()
    }

    /// Reconcile every goal with one status array.
    pub(crate) fn process_status(&self, server: &ServerTracker, array: &GoalStatusArray, caller_id: &str) {
        let goals = self.live();
        if server.record_status(array.header.seq, caller_id) {
            log::warn!(
                "[action] status sequence went backwards (now {}), marking {} goal(s) LOST",
                array.header.seq,
                goals.len()
            );
            for goal in goals {
                goal.mark_lost();
            }
            return;
        }
        for goal in goals {
            let status = array
                .status_list
                .iter()
                .find(|s| s.goal_id.id == goal.goal_id().id);
            goal.update_status(status);
        }
    }

    pub(crate) fn process_result(&self, result: &ActionResult<A>) {
        if let Some(goal) = self.find(&result.status.goal_id.id) {
            goal.update_result(result);
        }
    }

    pub(crate) fn process_feedback(&self, feedback: &ActionFeedback<A>) {
        if let Some(goal) = self.find(&feedback.status.goal_id.id) {
            goal.update_feedback(feedback);
        }
    }
}

// ============================================================================
// Client
// ============================================================================

struct ClientCore<A: Action> {
    namespace: String,
    ids: GoalIdGenerator,
    goals: GoalList<A>,
    server: Arc<ServerTracker>,
    goal_pub: Publisher<ActionGoal<A>>,
    cancel_pub: Publisher<GoalID>,
    preempt_timeout: Duration,
}

pub struct ActionClient<A: Action> {
    core: Arc<ClientCore<A>>,
    node: Weak<Node>,
    _status_sub: Subscriber,
    feedback_sub: Subscriber,
    result_sub: Subscriber,
}

impl<A: Action> ActionClient<A> {
    /// Client for the action server at `namespace` (resolved by the node).
    pub fn new(node: &Arc<Node>, namespace: &str) -> Result<Self> {
        Self::with_config(node, namespace, ActionClientConfig::from_node(node.config()))
    }

    pub fn with_config(node: &Arc<Node>, namespace: &str, config: ActionClientConfig) -> Result<Self> {
        let namespace = node.resolve_name(namespace)?;
        let topic = |leaf: &str| format!("{}/{}", namespace.trim_end_matches('/'), leaf);

        let server = Arc::new(ServerTracker::default());
        let goal_pub = node.advertise_with_callbacks::<ActionGoal<A>>(
            &topic("goal"),
            config.queue_size,
            false,
            server.peer_callbacks(false),
        )?;
        let cancel_pub = node.advertise_with_callbacks::<GoalID>(
            &topic("cancel"),
            config.queue_size,
            false,
            server.peer_callbacks(true),
        )?;

        let core = Arc::new(ClientCore {
            namespace: namespace.clone(),
            ids: GoalIdGenerator::new(node.name()),
            goals: GoalList::new(),
            server,
            goal_pub,
            cancel_pub,
            preempt_timeout: config.preempt_timeout,
        });

        let weak = Arc::downgrade(&core);
        let status_sub = node.subscribe_with_publisher::<GoalStatusArray, _>(
            &topic("status"),
            config.queue_size,
            move |array, caller_id| {
                if let Some(core) = weak.upgrade() {
                    core.goals.process_status(&core.server, &array, caller_id);
                }
            },
        )?;
        let weak = Arc::downgrade(&core);
        let feedback_sub = node.subscribe::<ActionFeedback<A>, _>(
            &topic("feedback"),
            config.queue_size,
            move |feedback| {
                if let Some(core) = weak.upgrade() {
                    core.goals.process_feedback(&feedback);
                }
            },
        )?;
        let weak = Arc::downgrade(&core);
        let result_sub = node.subscribe::<ActionResult<A>, _>(
            &topic("result"),
            config.queue_size,
            move |result| {
                if let Some(core) = weak.upgrade() {
                    core.goals.process_result(&result);
                }
            },
        )?;

        log::debug!("[action] client for {} ({}) ready", namespace, A::action_type());
        Ok(Self {
            core,
            node: Arc::downgrade(node),
            _status_sub: status_sub,
            feedback_sub,
            result_sub,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.core.namespace
    }

    /// The server publishes status, listens to goal and cancel, and publishes
    /// feedback and result.
    pub fn is_server_connected(&self) -> bool {
        self.core.server.is_connected()
            && self.feedback_sub.num_publishers() > 0
            && self.result_sub.num_publishers() > 0
    }

    /// Block until the server is connected. `None` waits forever. Returns
    /// false on timeout or node shutdown.
    pub fn wait_for_server(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_server_connected() {
                return true;
            }
            match self.node.upgrade() {
                Some(node) if !node.is_shutdown() => {}
                _ => return false,
            }
            let wait = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    (d - now).min(SERVER_POLL)
                }
                None => SERVER_POLL,
            };
            self.core.server.wait_changed(wait);
        }
    }

    /// Send a goal. The callbacks run on the node's callback queue.
    pub fn send_goal(
        &self,
        goal: A::Goal,
        on_transition: Option<TransitionCallback<A>>,
        on_feedback: Option<FeedbackCallback<A>>,
    ) -> Result<ClientGoalHandle<A>> {
        let goal_id = self.core.ids.generate();
        let weak = Arc::downgrade(&self.core);
        let sink: CancelSink = Arc::new(move |id| match weak.upgrade() {
            Some(core) => core.cancel_pub.publish(id),
            None => Err(Error::Shutdown),
        });
        let entry = GoalEntry::new(
            goal_id.clone(),
            on_transition,
            on_feedback,
            sink,
            self.core.preempt_timeout,
        );
        self.core.goals.add(&entry);

        log::debug!("[action] sending goal {} to {}", goal_id.id, self.core.namespace);
        self.core.goal_pub.publish(ActionGoal {
            header: MsgHeader {
                stamp: goal_id.stamp,
                ..MsgHeader::default()
            },
            goal_id,
            goal,
        })?;
        Ok(ClientGoalHandle::new(entry))
    }

    /// Cancel every goal on the server, including other clients' goals.
    pub fn cancel_all_goals(&self) -> Result<()> {
        self.core.cancel_pub.publish(GoalID {
            stamp: Time::ZERO,
            id: String::new(),
        })
    }

    /// Cancel every goal stamped at or before `time`.
    pub fn cancel_goals_at_and_before_time(&self, time: Time) -> Result<()> {
        self.core.cancel_pub.publish(GoalID {
            stamp: time,
            id: String::new(),
        })
    }

    /// Goals still referenced by at least one handle.
    pub fn num_tracked_goals(&self) -> usize {
        self.core.goals.len()
    }
}

impl<A: Action> std::fmt::Debug for ActionClient<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionClient")
            .field("namespace", &self.core.namespace)
            .field("type", &A::action_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actionlib::msgs::{GoalStatus, StatusCode};
    use crate::actionlib::test_support::TestAction;
    use crate::actionlib::CommState;

    fn entry(id: &str) -> Arc<GoalEntry<TestAction>> {
        GoalEntry::new(
            GoalID {
                stamp: Time::new(5, 0),
                id: id.into(),
            },
            None,
            None,
            Arc::new(|_| Ok(())),
            Duration::from_secs(3),
        )
    }

    fn array(seq: u32, ids: &[(&str, StatusCode)]) -> GoalStatusArray {
        GoalStatusArray {
            header: MsgHeader {
                seq,
                ..MsgHeader::default()
            },
            status_list: ids
                .iter()
                .map(|(id, code)| {
                    GoalStatus::new(
                        GoalID {
                            stamp: Time::new(5, 0),
                            id: id.to_string(),
                        },
                        *code,
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_status_sequence_regression_loses_all_goals() {
        let server = ServerTracker::default();
        let goals = GoalList::new();
        let a = entry("a");
        let b = entry("b");
        goals.add(&a);
        goals.add(&b);

        goals.process_status(
            &server,
            &array(42, &[("a", StatusCode::Active), ("b", StatusCode::Pending)]),
            "/server",
        );
        let ha = ClientGoalHandle::new(a.clone());
        let hb = ClientGoalHandle::new(b.clone());
        assert_eq!(ha.comm_state(), CommState::Active);
        assert_eq!(hb.comm_state(), CommState::Pending);

        goals.process_status(
            &server,
            &array(10, &[("a", StatusCode::Active), ("b", StatusCode::Pending)]),
            "/server",
        );
        for h in [&ha, &hb] {
            assert_eq!(h.comm_state(), CommState::Done);
            assert_eq!(h.goal_status().and_then(|s| s.code()), Some(StatusCode::Lost));
        }
    }

    #[test]
    fn test_dropped_handles_are_forgotten() {
        let goals = GoalList::<TestAction>::new();
        let a = entry("a");
        goals.add(&a);
        goals.add(&entry("b"));
        assert_eq!(goals.len(), 1);
        drop(a);
        assert_eq!(goals.len(), 0);
    }

    #[test]
    fn test_server_connection_tracking() {
        let server = Arc::new(ServerTracker::default());
        assert!(!server.is_connected());
        server.peer_changed(false, "/server", true);
        server.peer_changed(true, "/server", true);
        assert!(!server.is_connected());
        server.record_status(0, "/server");
        assert!(server.is_connected());
        server.peer_changed(true, "/server", false);
        assert!(!server.is_connected());
    }

    #[test]
    fn test_result_routed_by_goal_id() {
        let goals = GoalList::<TestAction>::new();
        let a = entry("a");
        let b = entry("b");
        goals.add(&a);
        goals.add(&b);
        goals.process_result(&ActionResult {
            header: MsgHeader::default(),
            status: GoalStatus::new(
                GoalID {
                    stamp: Time::new(5, 0),
                    id: "b".into(),
                },
                StatusCode::Aborted,
            ),
            result: Default::default(),
        });
        assert_eq!(ClientGoalHandle::new(a).comm_state(), CommState::WaitingForGoalAck);
        assert_eq!(ClientGoalHandle::new(b).comm_state(), CommState::Done);
    }
}
