// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Goal id generation.

use std::sync::atomic::{AtomicU32, Ordering};

use super::msgs::GoalID;
use crate::message::Time;

/// Shared by every generator in the process so ids stay unique across
/// clients of one node.
static GOAL_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Produces ids of the form `<node>-<counter>-<sec>.<nsec>` (hex fields).
#[derive(Debug, Clone)]
pub struct GoalIdGenerator {
    name: String,
}

impl GoalIdGenerator {
    pub fn new(node_name: &str) -> Self {
        Self {
            name: node_name.to_string(),
        }
    }

    pub fn generate(&self) -> GoalID {
        let stamp = Time::now();
        let counter = GOAL_COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        GoalID {
            id: format!(
                "{}-{:08x}-{:08x}.{:08x}",
                self.name, counter, stamp.sec, stamp.nsec
            ),
            stamp,
        }
    }
}
