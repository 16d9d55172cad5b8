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

//! The implicit special-events decoder. It consumes the start/stop framing
//! events of the acquisition; `stop` latches the pending-stop flag that makes
//! the dispatcher fan an end-of-stream sentinel out to every sibling decoder.
//! It is never exposed to the user.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::endpoint::SwEndpoint;
use crate::endpoint::sw::EventFormat;
use crate::handle::INVALID_NODE;
use crate::handle::NodeId;
use crate::prelude::*;
use crate::sink::Slot;
use crate::wire;
use crate::wire::BitField;
use crate::wire::Cursor;

const EVENT_ID_START: u8 = 0b0000;
const EVENT_ID_STOP: u8 = 0b0010;

const HEADER_TYPE_SIZE_48: u8 = 0b0000_0000;
const HEADER_TYPE_SIZE_32: u8 = 0b0000_0001;
const HEADER_TYPE_ACQ_WIDTH: u8 = 0b0000_0010;

/// Acquisition-wide metadata from the start event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartInfo {
    pub decimation_factor_log2: u8,
    pub n_traces: u8,
    pub acq_width: u32,
    pub ch_mask: u64,
}

/// Final counters from the stop event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopInfo {
    pub timestamp: u64,
    pub dead_time: u32,
}

pub struct SpecialEvents {
    stop_pending: Arc<AtomicBool>,
    last_start: Mutex<Option<StartInfo>>,
    last_stop: Mutex<Option<StopInfo>>,
}

impl SpecialEvents {
    /// `stop_pending` is the hardware endpoint's pending-stop flag.
    pub fn new(stop_pending: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            stop_pending,
            last_start: Mutex::new(None),
            last_stop: Mutex::new(None),
        })
    }

    pub fn last_start(&self) -> Option<StartInfo> {
        *self.last_start.lock().unwrap()
    }

    pub fn last_stop(&self) -> Option<StopInfo> {
        *self.last_stop.lock().unwrap()
    }

    fn decode_event(&self, event: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(event);

        let mut word = BitField(cursor.read_word()?);
        let format = word.high(4) as u8;
        if format != EventFormat::SpecialEvent as u8 {
            return Ok(());
        }
        let event_id = word.high(4) as u8;
        word.skip_high(16);
        let n_additional_headers = word.high(8) as usize;
        let n_words = word.high(32) as u32;
        debug_assert!(word.exhausted());

        debug_assert_eq!(event.len(), n_words as usize * wire::WORD_SIZE);
        if n_additional_headers + 1 > n_words as usize {
            return Err(Error::Internal(format!(
                "special event with {n_additional_headers} additional headers in {n_words} words"
            )));
        }

        let mut headers = [(0u8, 0u64); 8];
        if n_additional_headers > headers.len() {
            return Err(Error::Internal(format!(
                "special event with {n_additional_headers} additional headers"
            )));
        }
        for header in headers.iter_mut().take(n_additional_headers) {
            let mut word = BitField(cursor.read_word()?);
            let data = word.low(56);
            let header_type = word.low(8) as u8;
            debug_assert!(word.exhausted());
            *header = (header_type, data);
        }
        let headers = &headers[..n_additional_headers];

        match event_id {
            EVENT_ID_START => {
                if headers.len() != 3 {
                    return Err(Error::Internal(format!(
                        "start event with {} additional headers",
                        headers.len()
                    )));
                }
                debug_assert_eq!(headers[0].0, HEADER_TYPE_ACQ_WIDTH);
                debug_assert_eq!(headers[1].0, HEADER_TYPE_SIZE_32);
                debug_assert_eq!(headers[2].0, HEADER_TYPE_SIZE_32);

                let mut info = StartInfo::default();
                let mut data = BitField(headers[0].1);
                info.acq_width = data.low(25) as u32;
                info.n_traces = data.low(2) as u8;
                info.decimation_factor_log2 = data.low(5) as u8;

                let mut data = BitField(headers[1].1);
                let mask_low = data.low(32);
                let mut data = BitField(headers[2].1);
                let mask_high = data.low(32);
                info.ch_mask = mask_low | (mask_high << 32);

                debug!(?info, "acquisition start");
                *self.last_start.lock().unwrap() = Some(info);
            }
            EVENT_ID_STOP => {
                if headers.len() != 2 {
                    return Err(Error::Internal(format!(
                        "stop event with {} additional headers",
                        headers.len()
                    )));
                }
                debug_assert_eq!(headers[0].0, HEADER_TYPE_SIZE_48);
                debug_assert_eq!(headers[1].0, HEADER_TYPE_SIZE_32);

                let mut info = StopInfo::default();
                let mut data = BitField(headers[0].1);
                info.timestamp = data.low(48);
                let mut data = BitField(headers[1].1);
                info.dead_time = data.low(32) as u32;

                debug!(?info, "acquisition stop");
                *self.last_stop.lock().unwrap() = Some(info);
                self.stop_pending.store(true, Ordering::Release);
            }
            other => {
                warn!("unsupported special event id {other}");
            }
        }

        Ok(())
    }
}

impl Endpoint for SpecialEvents {
    fn node(&self) -> NodeId {
        INVALID_NODE
    }

    fn set_data_format(&self, _json: &str) -> Result<()> {
        Err(Error::NotYetImplemented("set_data_format on events"))
    }

    fn read_data(&self, _timeout: Option<Duration>, _slots: &mut [Slot<'_>]) -> Result<()> {
        Err(Error::NotYetImplemented("read_data on events"))
    }

    fn has_data(&self, _timeout: Option<Duration>) -> Result<()> {
        Err(Error::NotYetImplemented("has_data on events"))
    }

    fn clear_data(&self) -> Result<()> {
        Ok(())
    }
}

impl SwEndpoint for SpecialEvents {
    fn resize(&self) -> Result<()> {
        Ok(())
    }

    fn decode(&self, event: &[u8]) -> Result<()> {
        self.decode_event(event)
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::endpoint::sw::testing::*;

    use super::*;

    pub fn start_event(info: &StartInfo) -> Vec<u8> {
        let implementation_defined =
            (u64::from(EVENT_ID_START) << 24) | 3; // event id, 3 additional headers
        let ah0 = u64::from(info.acq_width)
            | (u64::from(info.n_traces) << 25)
            | (u64::from(info.decimation_factor_log2) << 27)
            | (u64::from(HEADER_TYPE_ACQ_WIDTH) << 56);
        let ah1 = (info.ch_mask & 0xFFFF_FFFF) | (u64::from(HEADER_TYPE_SIZE_32) << 56);
        let ah2 = (info.ch_mask >> 32) | (u64::from(HEADER_TYPE_SIZE_32) << 56);
        to_bytes(&[
            header_word(0b0011, implementation_defined, 4),
            ah0,
            ah1,
            ah2,
        ])
    }

    pub fn stop_event(info: &StopInfo) -> Vec<u8> {
        let implementation_defined =
            (u64::from(EVENT_ID_STOP) << 24) | 2;
        let ah0 = info.timestamp | (u64::from(HEADER_TYPE_SIZE_48) << 56);
        let ah1 = u64::from(info.dead_time) | (u64::from(HEADER_TYPE_SIZE_32) << 56);
        to_bytes(&[header_word(0b0011, implementation_defined, 3), ah0, ah1])
    }
}
