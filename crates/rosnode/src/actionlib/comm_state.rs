// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side goal communication state and its transition table.
//!
//! ```text
//!   WAITING_FOR_GOAL_ACK ──► PENDING ──► ACTIVE ──► WAITING_FOR_RESULT ──► DONE
//!            │                 │           │                ▲
//!            │                 ▼           ▼                │
//!            │             RECALLING ──► PREEMPTING ────────┘
//!            ▼
//!   WAITING_FOR_CANCEL_ACK (entered locally by cancel())
//! ```
//!
//! A status update may skip states; the table lists the full chain of
//! states walked so every intermediate transition is reported.

use std::fmt;

use super::msgs::StatusCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommState {
    WaitingForGoalAck,
    Pending,
    Active,
    WaitingForResult,
    WaitingForCancelAck,
    Recalling,
    Preempting,
    Done,
}

impl CommState {
    pub const ALL: [CommState; 8] = [
        CommState::WaitingForGoalAck,
        CommState::Pending,
        CommState::Active,
        CommState::WaitingForResult,
        CommState::WaitingForCancelAck,
        CommState::Recalling,
        CommState::Preempting,
        CommState::Done,
    ];

    pub fn is_done(self) -> bool {
        self == CommState::Done
    }
}

impl fmt::Display for CommState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommState::WaitingForGoalAck => "WAITING_FOR_GOAL_ACK",
            CommState::Pending => "PENDING",
            CommState::Active => "ACTIVE",
            CommState::WaitingForResult => "WAITING_FOR_RESULT",
            CommState::WaitingForCancelAck => "WAITING_FOR_CANCEL_ACK",
            CommState::Recalling => "RECALLING",
            CommState::Preempting => "PREEMPTING",
            CommState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Outcome of feeding one server status into the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Status is consistent with the current state.
    NoChange,
    /// Walk these states in order.
    Chain(&'static [CommState]),
    /// The server reported a status that cannot follow the current state.
    Invalid,
    /// Status value the client does not act on (LOST).
    UnknownStatus,
}

use CommState as C;

const PENDING: &[CommState] = &[C::Pending];
const ACTIVE: &[CommState] = &[C::Active];
const WFR: &[CommState] = &[C::WaitingForResult];
const RECALLING: &[CommState] = &[C::Recalling];
const PREEMPTING: &[CommState] = &[C::Preempting];
const PENDING_WFR: &[CommState] = &[C::Pending, C::WaitingForResult];
const PENDING_RECALLING: &[CommState] = &[C::Pending, C::Recalling];
const ACTIVE_WFR: &[CommState] = &[C::Active, C::WaitingForResult];
const ACTIVE_PREEMPTING: &[CommState] = &[C::Active, C::Preempting];
const ACTIVE_PREEMPTING_WFR: &[CommState] = &[C::Active, C::Preempting, C::WaitingForResult];
const RECALLING_WFR: &[CommState] = &[C::Recalling, C::WaitingForResult];
const PREEMPTING_WFR: &[CommState] = &[C::Preempting, C::WaitingForResult];

/// Transition taken by a goal in `state` when the server reports `status`.
pub fn transition(state: CommState, status: StatusCode) -> Transition {
    use StatusCode as S;
    use Transition::{Chain, Invalid, NoChange};

    match state {
        C::WaitingForGoalAck => match status {
            S::Pending => Chain(PENDING),
            S::Active => Chain(ACTIVE),
            S::Rejected => Chain(PENDING_WFR),
            S::Recalling => Chain(PENDING_RECALLING),
            S::Recalled => Chain(PENDING_WFR),
            S::Preempted => Chain(ACTIVE_PREEMPTING_WFR),
            S::Succeeded | S::Aborted => Chain(ACTIVE_WFR),
            S::Preempting => Chain(ACTIVE_PREEMPTING),
            S::Lost => Transition::UnknownStatus,
        },
        C::Pending => match status {
            S::Pending => NoChange,
            S::Active => Chain(ACTIVE),
            S::Rejected => Chain(WFR),
            S::Recalling => Chain(RECALLING),
            S::Recalled => Chain(RECALLING_WFR),
            S::Preempted => Chain(ACTIVE_PREEMPTING_WFR),
            S::Succeeded | S::Aborted => Chain(ACTIVE_WFR),
            S::Preempting => Chain(ACTIVE_PREEMPTING),
            S::Lost => Transition::UnknownStatus,
        },
        C::Active => match status {
            S::Pending => Invalid,
            S::Active => NoChange,
            S::Rejected | S::Recalling | S::Recalled => Invalid,
            S::Preempted => Chain(PREEMPTING_WFR),
            S::Succeeded | S::Aborted => Chain(WFR),
            S::Preempting => Chain(PREEMPTING),
            S::Lost => Transition::UnknownStatus,
        },
        C::WaitingForResult => match status {
            S::Pending | S::Recalling | S::Preempting => Invalid,
            S::Active | S::Rejected | S::Recalled | S::Preempted => NoChange,
            S::Succeeded | S::Aborted => NoChange,
            S::Lost => Transition::UnknownStatus,
        },
        C::WaitingForCancelAck => match status {
            S::Pending | S::Active => NoChange,
            S::Rejected => Chain(WFR),
            S::Recalling => Chain(RECALLING),
            S::Recalled => Chain(RECALLING_WFR),
            S::Preempted | S::Succeeded | S::Aborted => Chain(PREEMPTING_WFR),
            S::Preempting => Chain(PREEMPTING),
            S::Lost => Transition::UnknownStatus,
        },
        C::Recalling => match status {
            S::Pending | S::Active => Invalid,
            S::Rejected | S::Recalled => Chain(WFR),
            S::Recalling => NoChange,
            S::Preempted | S::Succeeded | S::Aborted => Chain(PREEMPTING_WFR),
            S::Preempting => Chain(PREEMPTING),
            S::Lost => Transition::UnknownStatus,
        },
        C::Preempting => match status {
            S::Pending | S::Active | S::Rejected | S::Recalling | S::Recalled => Invalid,
            S::Preempted | S::Succeeded | S::Aborted => Chain(WFR),
            S::Preempting => NoChange,
            S::Lost => Transition::UnknownStatus,
        },
        C::Done => match status {
            S::Pending | S::Active | S::Recalling | S::Preempting => Invalid,
            S::Rejected | S::Recalled | S::Preempted | S::Succeeded | S::Aborted => NoChange,
            S::Lost => Transition::UnknownStatus,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUSES: [StatusCode; 10] = [
        StatusCode::Pending,
        StatusCode::Active,
        StatusCode::Preempted,
        StatusCode::Succeeded,
        StatusCode::Aborted,
        StatusCode::Rejected,
        StatusCode::Preempting,
        StatusCode::Recalling,
        StatusCode::Recalled,
        StatusCode::Lost,
    ];

    #[test]
    fn test_table_is_total() {
        for state in CommState::ALL {
            for status in STATUSES {
                let t = transition(state, status);
                if status == StatusCode::Lost {
                    assert_eq!(t, Transition::UnknownStatus);
                    continue;
                }
                assert_ne!(t, Transition::UnknownStatus, "{} / {}", state, status);
                if let Transition::Chain(chain) = t {
                    assert!(!chain.is_empty());
                    // Chains never skip straight to DONE; a result does that.
                    assert!(!chain.contains(&CommState::Done));
                }
            }
        }
    }

    /// Every (state, status) cell, one row per state in `CommState::ALL`
    /// order. Columns: PENDING ACTIVE REJECTED RECALLING RECALLED PREEMPTED
    /// SUCCEEDED ABORTED PREEMPTING. `-` is no change, `ERR` is invalid.
    const TABLE: [[&str; 9]; 8] = [
        ["PENDING", "ACTIVE", "PENDING,WFR", "PENDING,RECALLING", "PENDING,WFR", "ACTIVE,PREEMPTING,WFR", "ACTIVE,WFR", "ACTIVE,WFR", "ACTIVE,PREEMPTING"],
        ["-", "ACTIVE", "WFR", "RECALLING", "RECALLING,WFR", "ACTIVE,PREEMPTING,WFR", "ACTIVE,WFR", "ACTIVE,WFR", "ACTIVE,PREEMPTING"],
        ["ERR", "-", "ERR", "ERR", "ERR", "PREEMPTING,WFR", "WFR", "WFR", "PREEMPTING"],
        ["ERR", "-", "-", "ERR", "-", "-", "-", "-", "ERR"],
        ["-", "-", "WFR", "RECALLING", "RECALLING,WFR", "PREEMPTING,WFR", "PREEMPTING,WFR", "PREEMPTING,WFR", "PREEMPTING"],
        ["ERR", "ERR", "WFR", "-", "WFR", "PREEMPTING,WFR", "PREEMPTING,WFR", "PREEMPTING,WFR", "PREEMPTING"],
        ["ERR", "ERR", "ERR", "ERR", "ERR", "WFR", "WFR", "WFR", "-"],
        ["ERR", "ERR", "-", "ERR", "-", "-", "-", "-", "ERR"],
    ];

    const COLUMNS: [StatusCode; 9] = [
        StatusCode::Pending,
        StatusCode::Active,
        StatusCode::Rejected,
        StatusCode::Recalling,
        StatusCode::Recalled,
        StatusCode::Preempted,
        StatusCode::Succeeded,
        StatusCode::Aborted,
        StatusCode::Preempting,
    ];

    fn parse_state(name: &str) -> CommState {
        match name {
            "PENDING" => CommState::Pending,
            "ACTIVE" => CommState::Active,
            "WFR" => CommState::WaitingForResult,
            "RECALLING" => CommState::Recalling,
            "PREEMPTING" => CommState::Preempting,
            other => panic!("bad table entry {}", other),
        }
    }

    #[test]
    fn test_every_cell_matches_table() {
        for (row, state) in TABLE.iter().zip(CommState::ALL) {
            for (cell, status) in row.iter().zip(COLUMNS) {
                let got = transition(state, status);
                match *cell {
                    "-" => assert_eq!(got, Transition::NoChange, "{} / {}", state, status),
                    "ERR" => assert_eq!(got, Transition::Invalid, "{} / {}", state, status),
                    chain => {
                        let expected: Vec<CommState> = chain.split(',').map(parse_state).collect();
                        match got {
                            Transition::Chain(c) => assert_eq!(c, expected.as_slice(), "{} / {}", state, status),
                            other => panic!("{} / {}: expected chain, got {:?}", state, status, other),
                        }
                    }
                }
            }
            assert_eq!(transition(state, StatusCode::Lost), Transition::UnknownStatus);
        }
    }

    #[test]
    fn test_done_never_leaves() {
        for status in STATUSES {
            assert!(!matches!(
                transition(CommState::Done, status),
                Transition::Chain(_)
            ));
        }
    }

    #[test]
    fn test_selected_cells() {
        assert_eq!(
            transition(CommState::WaitingForGoalAck, StatusCode::Preempted),
            Transition::Chain(&[
                CommState::Active,
                CommState::Preempting,
                CommState::WaitingForResult
            ])
        );
        assert_eq!(
            transition(CommState::Pending, StatusCode::Recalled),
            Transition::Chain(&[CommState::Recalling, CommState::WaitingForResult])
        );
        assert_eq!(
            transition(CommState::Active, StatusCode::Pending),
            Transition::Invalid
        );
        assert_eq!(
            transition(CommState::WaitingForCancelAck, StatusCode::Succeeded),
            Transition::Chain(&[CommState::Preempting, CommState::WaitingForResult])
        );
        assert_eq!(
            transition(CommState::WaitingForResult, StatusCode::Succeeded),
            Transition::NoChange
        );
        assert_eq!(
            transition(CommState::Recalling, StatusCode::Rejected),
            Transition::Chain(&[CommState::WaitingForResult])
        );
    }
}
