// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `actionlib_msgs` types and the goal / result / feedback envelopes.

use std::fmt;

use crate::error::Result;
use crate::message::{MsgHeader, RosMessage, RosReader, RosWriter, Time};

// ============================================================================
// Status codes
// ============================================================================

/// `actionlib_msgs/GoalStatus` status values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Pending = 0,
    Active = 1,
    Preempted = 2,
    Succeeded = 3,
    Aborted = 4,
    Rejected = 5,
    Preempting = 6,
    Recalling = 7,
    Recalled = 8,
    Lost = 9,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => StatusCode::Pending,
            1 => StatusCode::Active,
            2 => StatusCode::Preempted,
            3 => StatusCode::Succeeded,
            4 => StatusCode::Aborted,
            5 => StatusCode::Rejected,
            6 => StatusCode::Preempting,
            7 => StatusCode::Recalling,
            8 => StatusCode::Recalled,
            9 => StatusCode::Lost,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Server-side terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusCode::Preempted
                | StatusCode::Succeeded
                | StatusCode::Aborted
                | StatusCode::Rejected
                | StatusCode::Recalled
                | StatusCode::Lost
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Pending => "PENDING",
            StatusCode::Active => "ACTIVE",
            StatusCode::Preempted => "PREEMPTED",
            StatusCode::Succeeded => "SUCCEEDED",
            StatusCode::Aborted => "ABORTED",
            StatusCode::Rejected => "REJECTED",
            StatusCode::Preempting => "PREEMPTING",
            StatusCode::Recalling => "RECALLING",
            StatusCode::Recalled => "RECALLED",
            StatusCode::Lost => "LOST",
        };
        f.write_str(name)
    }
}

// ============================================================================
// actionlib_msgs
// ============================================================================

/// `actionlib_msgs/GoalID`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GoalID {
    pub stamp: Time,
    pub id: String,
}

impl RosMessage for GoalID {
    fn msg_type() -> String {
        "actionlib_msgs/GoalID".to_string()
    }

    fn md5sum() -> String {
        "302881f31927c1df708a2dbab0e80ee8".to_string()
    }

    fn msg_definition() -> String {
        "time stamp\nstring id\n".to_string()
    }

    fn encode(&self, w: &mut RosWriter) {
        w.write_time(self.stamp);
        w.write_string(&self.id);
    }

    fn decode(r: &mut RosReader<'_>) -> Result<Self> {
        Ok(Self {
            stamp: r.read_time()?,
            id: r.read_string()?,
        })
    }
}

/// `actionlib_msgs/GoalStatus`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GoalStatus {
    pub goal_id: GoalID,
    pub status: u8,
    pub text: String,
}

impl GoalStatus {
    pub fn new(goal_id: GoalID, status: StatusCode) -> Self {
        Self {
            goal_id,
            status: status.as_u8(),
            text: String::new(),
        }
    }

    /// `None` for values outside the known range.
    pub fn code(&self) -> Option<StatusCode> {
        StatusCode::from_u8(self.status)
    }

    pub fn set(&mut self, code: StatusCode) {
        self.status = code.as_u8();
    }
}

impl RosMessage for GoalStatus {
    fn msg_type() -> String {
        "actionlib_msgs/GoalStatus".to_string()
    }

    fn md5sum() -> String {
        "d388f9b87b3c471f784434d671988d4a".to_string()
    }

    fn encode(&self, w: &mut RosWriter) {
        self.goal_id.encode(w);
        w.write_u8(self.status);
        w.write_string(&self.text);
    }

    fn decode(r: &mut RosReader<'_>) -> Result<Self> {
        Ok(Self {
            goal_id: GoalID::decode(r)?,
            status: r.read_u8()?,
            text: r.read_string()?,
        })
    }
}

/// `actionlib_msgs/GoalStatusArray`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GoalStatusArray {
    pub header: MsgHeader,
    pub status_list: Vec<GoalStatus>,
}

impl RosMessage for GoalStatusArray {
    fn msg_type() -> String {
        "actionlib_msgs/GoalStatusArray".to_string()
    }

    fn md5sum() -> String {
        "8b2b82f13216d0a8ea88bd3af735e619".to_string()
    }

    fn has_header() -> bool {
        true
    }

    fn encode(&self, w: &mut RosWriter) {
        self.header.encode(w);
        w.write_seq(&self.status_list);
    }

    fn decode(r: &mut RosReader<'_>) -> Result<Self> {
        Ok(Self {
            header: MsgHeader::decode(r)?,
            status_list: r.read_seq()?,
        })
    }

    fn header_mut(&mut self) -> Option<&mut MsgHeader> {
        Some(&mut self.header)
    }
}

// ============================================================================
// Action envelopes
// ============================================================================

/// An action definition: goal, result and feedback types plus the md5sums
/// of the generated `*ActionGoal`, `*ActionResult` and `*ActionFeedback`
/// envelopes.
pub trait Action: Send + Sync + 'static {
    type Goal: RosMessage + Clone + fmt::Debug;
    type Result: RosMessage + Clone + Default + fmt::Debug;
    type Feedback: RosMessage + Clone + Default + fmt::Debug;

    /// Base type name, e.g. `actionlib_tutorials/Fibonacci`.
    fn action_type() -> String;
    fn goal_md5sum() -> String;
    fn result_md5sum() -> String;
    fn feedback_md5sum() -> String;
}

/// `<Action>ActionGoal`.
pub struct ActionGoal<A: Action> {
    pub header: MsgHeader,
    pub goal_id: GoalID,
    pub goal: A::Goal,
}

/// `<Action>ActionResult`.
pub struct ActionResult<A: Action> {
    pub header: MsgHeader,
    pub status: GoalStatus,
    pub result: A::Result,
}

/// `<Action>ActionFeedback`.
pub struct ActionFeedback<A: Action> {
    pub header: MsgHeader,
    pub status: GoalStatus,
    pub feedback: A::Feedback,
}

impl<A: Action> Clone for ActionGoal<A> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            goal_id: self.goal_id.clone(),
            goal: self.goal.clone(),
        }
    }
}

impl<A: Action> Clone for ActionResult<A> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            status: self.status.clone(),
            result: self.result.clone(),
        }
    }
}

impl<A: Action> Clone for ActionFeedback<A> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            status: self.status.clone(),
            feedback: self.feedback.clone(),
        }
    }
}

impl<A: Action> fmt::Debug for ActionGoal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionGoal")
            .field("goal_id", &self.goal_id)
            .field("goal", &self.goal)
            .finish()
    }
}

impl<A: Action> fmt::Debug for ActionResult<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionResult")
            .field("status", &self.status)
            .field("result", &self.result)
            .finish()
    }
}

impl<A: Action> fmt::Debug for ActionFeedback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionFeedback")
            .field("status", &self.status)
            .field("feedback", &self.feedback)
            .finish()
    }
}

impl<A: Action> RosMessage for ActionGoal<A> {
    fn msg_type() -> String {
        format!("{}ActionGoal", A::action_type())
    }

    fn md5sum() -> String {
        A::goal_md5sum()
    }

    fn has_header() -> bool {
        true
    }

    fn encode(&self, w: &mut RosWriter) {
        self.header.encode(w);
        self.goal_id.encode(w);
        self.goal.encode(w);
    }

    fn decode(r: &mut RosReader<'_>) -> Result<Self> {
        Ok(Self {
            header: MsgHeader::decode(r)?,
            goal_id: GoalID::decode(r)?,
            goal: A::Goal::decode(r)?,
        })
    }

    fn header_mut(&mut self) -> Option<&mut MsgHeader> {
        Some(&mut self.header)
    }
}

impl<A: Action> RosMessage for ActionResult<A> {
    fn msg_type() -> String {
        format!("{}ActionResult", A::action_type())
    }

    fn md5sum() -> String {
        A::result_md5sum()
    }

    fn has_header() -> bool {
        true
    }

    fn encode(&self, w: &mut RosWriter) {
        self.header.encode(w);
        self.status.encode(w);
        self.result.encode(w);
    }

    fn decode(r: &mut RosReader<'_>) -> Result<Self> {
        Ok(Self {
            header: MsgHeader::decode(r)?,
            status: GoalStatus::decode(r)?,
            result: A::Result::decode(r)?,
        })
    }

    fn header_mut(&mut self) -> Option<&mut MsgHeader> {
        Some(&mut self.header)
    }
}

impl<A: Action> RosMessage for ActionFeedback<A> {
    fn msg_type() -> String {
        format!("{}ActionFeedback", A::action_type())
    }

    fn md5sum() -> String {
        A::feedback_md5sum()
    }

    fn has_header() -> bool {
        true
    }

    fn encode(&self, w: &mut RosWriter) {
        self.header.encode(w);
        self.status.encode(w);
        self.feedback.encode(w);
    }

    fn decode(r: &mut RosReader<'_>) -> Result<Self> {
        Ok(Self {
            header: MsgHeader::decode(r)?,
            status: GoalStatus::decode(r)?,
            feedback: A::Feedback::decode(r)?,
        })
    }

    fn header_mut(&mut self) -> Option<&mut MsgHeader> {
        Some(&mut self.header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_values() {
        for v in 0..=9u8 {
            assert_eq!(StatusCode::from_u8(v).map(StatusCode::as_u8), Some(v));
        }
        assert_eq!(StatusCode::from_u8(10), None);
        assert_eq!(StatusCode::Recalled.to_string(), "RECALLED");
        assert!(StatusCode::Lost.is_terminal());
        assert!(!StatusCode::Recalling.is_terminal());
    }

    #[test]
    fn test_goal_status_array_layout() {
        let array = GoalStatusArray {
            header: MsgHeader {
                seq: 42,
                ..Default::default()
            },
            status_list: vec![GoalStatus::new(
                GoalID {
                    stamp: Time::new(1, 2),
                    id: "g".into(),
                },
                StatusCode::Active,
            )],
        };
        let bytes = array.to_bytes();
        // header(4 + 8 + 4) + count(4) + stamp(8) + id(4 + 1) + status(1) + text(4)
        assert_eq!(bytes.len(), 16 + 4 + 8 + 5 + 1 + 4);
        assert_eq!(GoalStatusArray::from_bytes(&bytes).unwrap(), array);
    }
}
