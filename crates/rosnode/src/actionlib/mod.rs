// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! actionlib: long-running goals over five topics.
//!
//! ```text
//!          ActionClient                          ActionServer
//!   ┌──────────────────────┐  goal / cancel  ┌──────────────────────┐
//!   │ ClientGoalHandle     │ ──────────────► │ ServerGoalHandle     │
//!   │   CommState table    │                 │   GoalStatus driven  │
//!   │                      │ ◄────────────── │   by set_* calls     │
//!   └──────────────────────┘ status/feedback └──────────────────────┘
//!                                /result
//! ```
//!
//! Action types implement [`Action`]; the `*ActionGoal`, `*ActionResult` and
//! `*ActionFeedback` envelopes are generic over it.

mod action_client;
mod action_server;
mod client_goal_handle;
mod comm_state;
mod goal_id;
mod msgs;
mod server_goal_handle;

pub use action_client::{ActionClient, ActionClientConfig};
pub use action_server::{ActionServer, ActionServerConfig, CancelCallback, GoalCallback};
pub use client_goal_handle::{ClientGoalHandle, FeedbackCallback, GoalOutcome, TransitionCallback};
pub use comm_state::{transition, CommState, Transition};
pub use goal_id::GoalIdGenerator;
pub use msgs::{
    Action, ActionFeedback, ActionGoal, ActionResult, GoalID, GoalStatus, GoalStatusArray,
    StatusCode,
};
pub use server_goal_handle::ServerGoalHandle;

#[cfg(test)]
pub(crate) mod test_support {
    use super::Action;
    use crate::message::RosMessage;
    use crate::msgs::StringMsg;

    /// String goal, result and feedback.
    pub struct TestAction;

    impl Action for TestAction {
        type Goal = StringMsg;
        type Result = StringMsg;
        type Feedback = StringMsg;

        fn action_type() -> String {
            "test_msgs/Echo".to_string()
        }
        fn goal_md5sum() -> String {
            StringMsg::md5sum()
        }
        fn result_md5sum() -> String {
            StringMsg::md5sum()
        }
        fn feedback_md5sum() -> String {
            StringMsg::md5sum()
        }
    }
}
