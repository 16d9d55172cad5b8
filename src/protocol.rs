// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Control-protocol data types: the JSON request/reply pair exchanged on the
//! command channel and the device-defined wire constants.

use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::handle::NodeId;

/// TCP control port on the device.
pub const COMMAND_PORT: u16 = 5001;
/// UDP data port on the device.
pub const UDP_PORT: u16 = 5002;

/// Control frame header: an 8-byte little-endian length, both directions.
pub const CONTROL_HEADER_SIZE: usize = 8;
/// TCP data frame header: `u64 size`, `u32 event_count`, `u8 aligned`.
pub const DATA_HEADER_SIZE: usize = 13;

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 6;
pub const VERSION_PATCH: u32 = 1;
/// Packed as major*10000 + minor*100 + patch; the patch digits are ignored by
/// the version handshake.
pub const VERSION: u32 = VERSION_MAJOR * 10000 + VERSION_MINOR * 100 + VERSION_PATCH;
pub const VERSION_PATCH_MODULUS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "getDeviceTree")]
    GetDeviceTree,
    #[serde(rename = "getChildHandles")]
    GetChildHandles,
    #[serde(rename = "getHandle")]
    GetHandle,
    #[serde(rename = "getParentHandle")]
    GetParentHandle,
    #[serde(rename = "getPath")]
    GetPath,
    #[serde(rename = "getNodeProperties")]
    GetNodeProperties,
    #[serde(rename = "getValue")]
    GetValue,
    #[serde(rename = "multiGetValue")]
    MultiGetValue,
    #[serde(rename = "setValue")]
    SetValue,
    #[serde(rename = "multiSetValue")]
    MultiSetValue,
    #[serde(rename = "sendCommand")]
    SendCommand,
}

/// Acquisition side effect requested by a `sendCommand` reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyFlag {
    #[serde(rename = "ARM")]
    Arm,
    #[serde(rename = "DISARM")]
    Disarm,
    #[serde(rename = "CLEAR")]
    Clear,
    #[serde(rename = "RESET")]
    Reset,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "PARAMETER")]
    Parameter,
    #[serde(rename = "COMMAND")]
    Command,
    #[serde(rename = "FEATURE")]
    Feature,
    #[serde(rename = "ATTRIBUTE")]
    Attribute,
    #[serde(rename = "ENDPOINT")]
    Endpoint,
    #[serde(rename = "CHANNEL")]
    Channel,
    #[serde(rename = "DIGITIZER")]
    Digitizer,
    #[serde(rename = "FOLDER")]
    Folder,
    #[serde(rename = "GROUP")]
    Group,
    #[serde(rename = "LVDS")]
    Lvds,
    #[serde(rename = "VGA")]
    Vga,
    #[serde(rename = "HV_CHANNEL")]
    HvChannel,
    #[serde(rename = "MONOUT")]
    MonOut,
    #[serde(rename = "VTRACE")]
    VirtualTrace,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub cmd: Command,
    pub handle: NodeId,
    pub query: String,
    pub value: String,
    #[serde(rename = "multipleQuery", skip_serializing_if = "Option::is_none")]
    pub multiple_query: Option<Vec<String>>,
    #[serde(rename = "multipleValue", skip_serializing_if = "Option::is_none")]
    pub multiple_value: Option<Vec<String>>,
}

impl Request {
    pub fn new(cmd: Command, handle: NodeId, query: impl Into<String>) -> Self {
        Self {
            cmd,
            handle,
            query: query.into(),
            value: String::new(),
            multiple_query: None,
            multiple_value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_multiple_query(mut self, queries: Vec<String>) -> Self {
        self.multiple_query = Some(queries);
        self
    }

    pub fn with_multiple_value(mut self, values: Vec<String>) -> Self {
        self.multiple_value = Some(values);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reply {
    pub cmd: Command,
    #[serde(default)]
    pub result: bool,
    #[serde(default)]
    pub flag: ReplyFlag,
    #[serde(default)]
    pub value: Vec<String>,
}
