// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Built-in `std_msgs` types the runtime itself depends on.

use crate::error::Result;
use crate::message::{MsgHeader, RosMessage, RosReader, RosWriter};

impl RosMessage for MsgHeader {
    fn msg_type() -> String {
        "std_msgs/Header".to_string()
    }

    fn md5sum() -> String {
        "2176decaecbce78abc3b96ef049fabed".to_string()
    }

    fn msg_definition() -> String {
        "uint32 seq\ntime stamp\nstring frame_id\n".to_string()
    }

    fn encode(&self, w: &mut RosWriter) {
        w.write_u32(self.seq);
        w.write_time(self.stamp);
        w.write_string(&self.frame_id);
    }

    fn decode(r: &mut RosReader<'_>) -> Result<Self> {
        Ok(Self {
            seq: r.read_u32()?,
            stamp: r.read_time()?,
            frame_id: r.read_string()?,
        })
    }
}

/// `std_msgs/String`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StringMsg {
    pub data: String,
}

impl StringMsg {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl RosMessage for StringMsg {
    fn msg_type() -> String {
        "std_msgs/String".to_string()
    }

    fn md5sum() -> String {
        "992ce8a1687cec8c8bd883ec73ca41d1".to_string()
    }

    fn msg_definition() -> String {
        "string data\n".to_string()
    }

    fn encode(&self, w: &mut RosWriter) {
        w.write_string(&self.data);
    }

    fn decode(r: &mut RosReader<'_>) -> Result<Self> {
        Ok(Self {
            data: r.read_string()?,
        })
    }
}

/// `std_msgs/Empty`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmptyMsg;

impl RosMessage for EmptyMsg {
    fn msg_type() -> String {
        "std_msgs/Empty".to_string()
    }

    fn md5sum() -> String {
        "d41d8cd98f00b204e9800998ecf8427e".to_string()
    }

    fn encode(&self, _w: &mut RosWriter) {}

    fn decode(_r: &mut RosReader<'_>) -> Result<Self> {
        Ok(EmptyMsg)
    }
}
