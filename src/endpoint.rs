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

//! Endpoints: the streaming data paths attached to device-tree nodes.
//!
//! One hardware endpoint (TCP or UDP) receives the raw byte stream; the
//! software endpoints (decoders) are fed by the hardware endpoint's decoder
//! thread and hand decoded records to consumers through per-decoder rings.

pub mod aggregate;
pub mod dpp;
pub mod dppzle;
pub mod events;
pub mod hw;
pub mod opendpp;
pub mod raw;
pub mod rawudp;
pub mod scope;
pub mod stats;
pub mod sw;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::handle::NodeId;
use crate::prelude::*;
use crate::sink::Slot;

/// What decoders need from the session: configuration lookups on the
/// digitizer node plus the session constants read at connect time. Kept as a
/// trait so the decode paths can be exercised without a live control channel.
pub trait Params: Send + Sync {
    fn n_channels(&self) -> usize;
    fn sampling_period_ns(&self) -> f64;
    /// `getValue` on the digitizer node.
    fn value(&self, path: &str) -> Result<String>;
    /// `getValue` with an argument (register reads).
    fn value_with_arg(&self, path: &str, arg: &str) -> Result<String>;
    /// Name of the currently active endpoint (`/endpoint/par/activeendpoint`).
    fn active_endpoint(&self) -> Result<String>;
}

/// The uniform consumer-facing endpoint surface.
pub trait Endpoint: Send + Sync {
    /// Server node id this endpoint answers for.
    fn node(&self) -> NodeId;

    /// Replace the projection schema. Only legal between acquisitions.
    fn set_data_format(&self, json: &str) -> Result<()>;

    /// Wait up to `timeout` (`None` = forever) for the next record and
    /// project it into `slots` per the active schema.
    fn read_data(&self, timeout: Option<Duration>, slots: &mut [Slot<'_>]) -> Result<()>;

    /// Wait up to `timeout` for a record without consuming it.
    fn has_data(&self, timeout: Option<Duration>) -> Result<()>;

    fn clear_data(&self) -> Result<()>;
}

/// A decoder fed by the hardware endpoint's decoder thread.
pub trait SwEndpoint: Endpoint {
    /// Pre-reserve record buffers for the configured acquisition, called from
    /// the arm sequence.
    fn resize(&self) -> Result<()>;

    /// Offer one event (header included). Decoders not matching the event's
    /// format code return without writing.
    fn decode(&self, event: &[u8]) -> Result<()>;

    /// Enqueue the end-of-stream sentinel.
    fn stop(&self) -> Result<()>;
}

/// The endpoint owning the socket and the receiver/decoder threads.
pub trait HwEndpoint: Endpoint {
    fn register_sw_endpoint(&self, endpoint: Arc<dyn SwEndpoint>);

    fn arm_acquisition(&self) -> Result<()>;
    fn disarm_acquisition(&self) -> Result<()>;

    /// Flag latched by the events decoder when a stop event is seen; the
    /// dispatcher drains it after every event.
    fn pending_stop_flag(&self) -> Arc<AtomicBool>;

    fn set_max_size_getter(&self, getter: SizeGetter);
    fn set_is_decoded_getter(&self, getter: BoolGetter);
}

pub type SizeGetter = Box<dyn Fn() -> Result<usize> + Send + Sync>;
pub type BoolGetter = Box<dyn Fn() -> Result<bool> + Send + Sync>;

/// Decoding is disabled whenever a raw pipeline is the active endpoint: the
/// decoders free their buffers instead of reserving them.
pub(crate) fn decode_disabled(params: &dyn Params) -> Result<bool> {
    let active = params.active_endpoint()?;
    Ok(active == "raw" || active == "rawudp")
}

pub(crate) fn channel_enabled(params: &dyn Params, channel: usize) -> Result<bool> {
    let enabled = params.value(&format!("/ch/{channel}/par/chenable"))?;
    Ok(enabled.eq_ignore_ascii_case("true"))
}
