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

//! Oscilloscope-mode decoder: one event per trigger carrying the raw
//! waveform of every enabled channel, 16-bit samples packed four per word,
//! words distributed round-robin across the participating channels.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::endpoint::Params;
use crate::endpoint::SwEndpoint;
use crate::endpoint::channel_enabled;
use crate::endpoint::decode_disabled;
use crate::endpoint::sw::EventFormat;
use crate::format::FormatField;
use crate::format::Schema;
use crate::format::WireType;
use crate::handle::NodeId;
use crate::prelude::*;
use crate::ring::Ring;
use crate::sink::ArraySrc;
use crate::sink::Projector;
use crate::sink::Scalar;
use crate::sink::Slot;
use crate::wire;
use crate::wire::BitField;
use crate::wire::Cursor;

const RING_SLOTS: usize = 4;
const HEADER_WORDS: usize = 3;
pub const SAMPLES_PER_WORD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeField {
    Timestamp,
    TimestampNs,
    TriggerId,
    Waveform,
    WaveformSize,
    Flags,
    SamplesOverlapped,
    BoardFail,
    EventSize,
}

impl FormatField for ScopeField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "TIMESTAMP" => Some(Self::Timestamp),
            "TIMESTAMP_NS" => Some(Self::TimestampNs),
            "TRIGGER_ID" => Some(Self::TriggerId),
            "WAVEFORM" => Some(Self::Waveform),
            "WAVEFORM_SIZE" => Some(Self::WaveformSize),
            "FLAGS" => Some(Self::Flags),
            "SAMPLES_OVERLAPPED" => Some(Self::SamplesOverlapped),
            "BOARD_FAIL" => Some(Self::BoardFail),
            "EVENT_SIZE" => Some(Self::EventSize),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Timestamp => "TIMESTAMP",
            Self::TimestampNs => "TIMESTAMP_NS",
            Self::TriggerId => "TRIGGER_ID",
            Self::Waveform => "WAVEFORM",
            Self::WaveformSize => "WAVEFORM_SIZE",
            Self::Flags => "FLAGS",
            Self::SamplesOverlapped => "SAMPLES_OVERLAPPED",
            Self::BoardFail => "BOARD_FAIL",
            Self::EventSize => "EVENT_SIZE",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::WaveformSize => 1,
            Self::Waveform => 2,
            _ => 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScopeEvent {
    pub board_fail: bool,
    pub trigger_id: u32,
    pub flags: u16,
    pub samples_overlapped: u8,
    pub timestamp: u64,
    pub ch_mask: u64,
    pub waveforms: Vec<Vec<u16>>,
    pub event_size: usize,
    pub fake_stop_event: bool,
}

pub struct Scope {
    node: NodeId,
    params: Arc<dyn Params>,
    ring: Ring<ScopeEvent>,
    schema: Mutex<Schema<ScopeField>>,
}

impl Scope {
    pub fn new(node: NodeId, params: Arc<dyn Params>) -> Arc<Self> {
        let ring: Ring<ScopeEvent> = Ring::new(RING_SLOTS);
        let n_channels = params.n_channels();
        ring.apply_all(|event| event.waveforms.resize(n_channels, Vec::new()));
        Arc::new(Self {
            node,
            params,
            ring,
            schema: Mutex::new(Self::default_schema()),
        })
    }

    pub fn default_schema() -> Schema<ScopeField> {
        Schema::of(&[
            (ScopeField::Timestamp, WireType::U64),
            (ScopeField::TriggerId, WireType::U32),
            (ScopeField::Waveform, WireType::U16),
            (ScopeField::WaveformSize, WireType::U32),
        ])
    }

    fn decode_event(&self, event: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(event);

        // Decode the format before touching the ring: events for other
        // decoders must not cost a slot acquisition.
        let mut word = BitField(cursor.read_word()?);
        let format = word.high(4) as u8;
        if format != EventFormat::CommonTrigger as u8 {
            return Ok(());
        }

        if event.len() < HEADER_WORDS * wire::WORD_SIZE {
            return Err(Error::Internal(format!(
                "scope event too small (size={})",
                event.len()
            )));
        }

        let mut slot = self.ring.acquire_write();
        let event_out = &mut *slot;
        event_out.fake_stop_event = false;

        word.skip_high(3);
        event_out.board_fail = word.high_flag();
        event_out.trigger_id = word.high(24) as u32;
        let n_words = word.high(32) as u32;
        debug_assert!(word.exhausted());

        if event.len() != n_words as usize * wire::WORD_SIZE {
            return Err(Error::Internal(format!(
                "scope event size mismatch (n_words={n_words}, size={})",
                event.len()
            )));
        }

        let mut word = BitField(cursor.read_word()?);
        event_out.timestamp = word.low(48);
        event_out.samples_overlapped = word.low(3) as u8;
        event_out.flags = word.low(13) as u16;
        debug_assert!(word.exhausted());

        event_out.ch_mask = cursor.read_word()?;

        let participating = event_out.ch_mask.count_ones() as usize;
        if participating > event_out.waveforms.len() {
            return Err(Error::Internal(format!(
                "channel mask selects {participating} channels of {}",
                event_out.waveforms.len()
            )));
        }

        let waveform_words = n_words as usize - HEADER_WORDS;
        let n_samples = if participating == 0 {
            0
        } else {
            let total = waveform_words * SAMPLES_PER_WORD;
            if total % participating != 0 {
                return Err(Error::Internal(format!(
                    "waveform of {total} samples not divisible by {participating} channels"
                )));
            }
            total / participating
        };

        let mut ch_list = Vec::with_capacity(participating);
        for (channel, waveform) in event_out.waveforms.iter_mut().enumerate() {
            if event_out.ch_mask & (1u64 << channel) != 0 {
                wire::resize_in_place(waveform, n_samples);
                ch_list.push(channel);
            } else {
                waveform.clear();
            }
        }

        if participating == 0 && waveform_words != 0 {
            return Err(Error::Internal(format!(
                "{waveform_words} waveform words with an empty channel mask"
            )));
        }

        // Words are interleaved round-robin across the participating
        // channels: word k belongs to channel ch_list[k % n] starting at
        // sample (k / n) * 4.
        for index in 0..waveform_words {
            let word = cursor.read_word()?;
            let channel = ch_list[index % participating];
            let first_sample = index / participating * SAMPLES_PER_WORD;
            let samples =
                &mut event_out.waveforms[channel][first_sample..first_sample + SAMPLES_PER_WORD];
            wire::unpack_u16_samples(word, samples);
        }

        debug_assert!(cursor.is_empty());
        event_out.event_size = event.len();

        slot.commit();
        Ok(())
    }
}

impl Endpoint for Scope {
    fn node(&self) -> NodeId {
        self.node
    }

    fn set_data_format(&self, json: &str) -> Result<()> {
        *self.schema.lock().unwrap() = Schema::parse(json)?;
        Ok(())
    }

    fn read_data(&self, timeout: Option<Duration>, slots: &mut [Slot<'_>]) -> Result<()> {
        let slot = self.ring.acquire_read(timeout).ok_or(Error::Timeout)?;
        if slot.fake_stop_event {
            slot.commit();
            return Err(Error::Stop);
        }
        let schema = self.schema.lock().unwrap();
        let mut projector = Projector::new(&schema, slots)?;
        let event = &*slot;
        while let Some(field) = projector.next_field() {
            match field {
                ScopeField::Timestamp => projector.put_scalar(event.timestamp)?,
                ScopeField::TimestampNs => projector.put_scalar(
                    event.timestamp as f64 * self.params.sampling_period_ns(),
                )?,
                ScopeField::TriggerId => projector.put_scalar(event.trigger_id)?,
                ScopeField::Waveform => {
                    projector.put_matrix(event.waveforms.iter().map(ArraySrc::from))?
                }
                ScopeField::WaveformSize => projector
                    .put_array_iter(event.waveforms.iter().map(|w| Scalar::U64(w.len() as u64)))?,
                ScopeField::Flags => projector.put_scalar(event.flags)?,
                ScopeField::SamplesOverlapped => {
                    projector.put_scalar(event.samples_overlapped)?
                }
                ScopeField::BoardFail => projector.put_scalar(event.board_fail)?,
                ScopeField::EventSize => projector.put_scalar(event.event_size)?,
            }
        }
        drop(schema);
        slot.commit();
        Ok(())
    }

    fn has_data(&self, timeout: Option<Duration>) -> Result<()> {
        let slot = self.ring.acquire_read(timeout).ok_or(Error::Timeout)?;
        if slot.fake_stop_event {
            return Err(Error::Stop);
        }
        Ok(())
    }

    fn clear_data(&self) -> Result<()> {
        self.ring.invalidate();
        Ok(())
    }
}

impl SwEndpoint for Scope {
    fn resize(&self) -> Result<()> {
        if decode_disabled(&*self.params)? {
            // Free the waveform storage while a raw pipeline is active.
            self.ring.apply_all(|event| {
                for waveform in &mut event.waveforms {
                    *waveform = Vec::new();
                }
            });
            return Ok(());
        }

        let n_channels = self.params.n_channels();
        let mut enabled = Vec::with_capacity(n_channels);
        for channel in 0..n_channels {
            enabled.push(channel_enabled(&*self.params, channel)?);
        }
        let record_length: usize = self
            .params
            .value("/par/recordlengths")?
            .parse()
            .map_err(|err| Error::Command(format!("invalid record length: {err}")))?;

        self.ring.apply_all(|event| {
            for (waveform, &enabled) in itertools::zip_eq(&mut event.waveforms, &enabled) {
                if enabled {
                    wire::reserve_total(waveform, record_length);
                } else {
                    *waveform = Vec::new();
                }
            }
        });
        Ok(())
    }

    fn decode(&self, event: &[u8]) -> Result<()> {
        self.decode_event(event)
    }

    fn stop(&self) -> Result<()> {
        let mut slot = self.ring.acquire_write();
        slot.fake_stop_event = true;
        slot.commit();
        Ok(())
    }
}
