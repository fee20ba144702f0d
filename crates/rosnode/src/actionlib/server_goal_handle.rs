// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side handle to one goal.

use std::fmt;
use std::sync::{Arc, Weak};

use super::action_server::{ServerCore, ServerOp};
use super::msgs::{Action, GoalID, StatusCode};
use crate::error::{Error, Result};

/// Handed to the goal and cancel callbacks. The user drives the goal through
/// its status by calling the `set_*` methods; terminal ones publish the
/// result.
///
/// | call            | from                  | to                     |
/// |-----------------|-----------------------|------------------------|
/// | `set_accepted`  | PENDING / RECALLING   | ACTIVE / PREEMPTING    |
/// | `set_rejected`  | PENDING, RECALLING    | REJECTED               |
/// | `set_canceled`  | PENDING, RECALLING    | RECALLED               |
/// |                 | ACTIVE, PREEMPTING    | PREEMPTED              |
/// | `set_aborted`   | ACTIVE, PREEMPTING    | ABORTED                |
/// | `set_succeeded` | ACTIVE, PREEMPTING    | SUCCEEDED              |
pub struct ServerGoalHandle<A: Action> {
    core: Weak<ServerCore<A>>,
    goal_id: GoalID,
    goal: Arc<A::Goal>,
}

impl<A: Action> Clone for ServerGoalHandle<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            goal_id: self.goal_id.clone(),
            goal: self.goal.clone(),
        }
    }
}

impl<A: Action> PartialEq for ServerGoalHandle<A> {
    fn eq(&self, other: &Self) -> bool {
        self.goal_id.id == other.goal_id.id && Weak::ptr_eq(&self.core, &other.core)
    }
}

impl<A: Action> ServerGoalHandle<A> {
    pub(crate) fn new(core: Weak<ServerCore<A>>, goal_id: GoalID, goal: Arc<A::Goal>) -> Self {
        Self { core, goal_id, goal }
    }

    pub fn goal_id(&self) -> &GoalID {
        &self.goal_id
    }

    pub fn goal(&self) -> &A::Goal {
        &self.goal
    }

    fn core(&self) -> Result<Arc<ServerCore<A>>> {
        self.core.upgrade().ok_or(Error::Shutdown)
    }

    /// Current status; `None` once the server forgot the goal.
    pub fn status(&self) -> Option<StatusCode> {
        self.core.upgrade()?.status_of(&self.goal_id.id)
    }

    /// True while a cancel request is pending (RECALLING or PREEMPTING).
    pub fn is_cancel_requested(&self) -> bool {
        matches!(
            self.status(),
            Some(StatusCode::Recalling) | Some(StatusCode::Preempting)
        )
    }

    pub fn set_accepted(&self, text: &str) -> Result<()> {
        self.core()?.apply(&self.goal_id.id, ServerOp::Accept, None, text)
    }

    pub fn set_rejected(&self, result: A::Result, text: &str) -> Result<()> {
        self.core()?
            .apply(&self.goal_id.id, ServerOp::Reject, Some(result), text)
    }

    pub fn set_canceled(&self, result: A::Result, text: &str) -> Result<()> {
        self.core()?
            .apply(&self.goal_id.id, ServerOp::Cancel, Some(result), text)
    }

    pub fn set_aborted(&self, result: A::Result, text: &str) -> Result<()> {
        self.core()?
            .apply(&self.goal_id.id, ServerOp::Abort, Some(result), text)
    }

    pub fn set_succeeded(&self, result: A::Result, text: &str) -> Result<()> {
        self.core()?
            .apply(&self.goal_id.id, ServerOp::Succeed, Some(result), text)
    }

    /// PENDING -> RECALLING, ACTIVE -> PREEMPTING. False in any other state.
    pub fn set_cancel_requested(&self) -> bool {
        match self.core.upgrade() {
            Some(core) => core.request_cancel(&self.goal_id.id),
            None => false,
        }
    }

    pub fn publish_feedback(&self, feedback: A::Feedback) -> Result<()> {
        self.core()?.feedback(&self.goal_id.id, feedback)
    }
}

impl<A: Action> fmt::Debug for ServerGoalHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerGoalHandle")
            .field("goal_id", &self.goal_id.id)
            .field("status", &self.status())
            .finish()
    }
}
