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

//! Open-DPP decoder: the user-programmable DPP flavor. Same aggregate/hit
//! envelope as PHA/PSD, plus up to four 63-bit user info words between the
//! hit header and the waveform, and a plain 16-bit sample waveform instead of
//! the packed probe format.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::endpoint::Params;
use crate::endpoint::SwEndpoint;
use crate::endpoint::aggregate::AggregateHeader;
use crate::endpoint::aggregate::ClearFlag;
use crate::endpoint::aggregate::decode_aggregate_header;
use crate::endpoint::channel_enabled;
use crate::endpoint::decode_disabled;
use crate::format::FormatField;
use crate::format::Schema;
use crate::format::WireType;
use crate::handle::NodeId;
use crate::prelude::*;
use crate::ring::Ring;
use crate::sink::ArraySrc;
use crate::sink::Projector;
use crate::sink::Slot;
use crate::wire;
use crate::wire::BitField;
use crate::wire::Cursor;

const RING_SLOTS: usize = 4096;

pub const MAX_USER_INFO_WORDS: usize = 4;
pub const SAMPLES_PER_WORD: usize = 4;
pub const MAX_WAVEFORM_WORDS: usize = 4095;
pub const MAX_WAVEFORM_SAMPLES: usize = MAX_WAVEFORM_WORDS * SAMPLES_PER_WORD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenDppField {
    Channel,
    Timestamp,
    TimestampNs,
    FineTimestamp,
    Energy,
    FlagsB,
    FlagsA,
    Psd,
    SpecialEvent,
    UserInfo,
    UserInfoSize,
    Truncated,
    Waveform,
    WaveformSize,
    BoardFail,
    AggregateCounter,
    Flush,
    EventSize,
}

impl FormatField for OpenDppField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "CHANNEL" => Some(Self::Channel),
            "TIMESTAMP" => Some(Self::Timestamp),
            "TIMESTAMP_NS" => Some(Self::TimestampNs),
            "FINE_TIMESTAMP" => Some(Self::FineTimestamp),
            "ENERGY" => Some(Self::Energy),
            "FLAGS_B" => Some(Self::FlagsB),
            "FLAGS_A" => Some(Self::FlagsA),
            "PSD" => Some(Self::Psd),
            "SPECIAL_EVENT" => Some(Self::SpecialEvent),
            "USER_INFO" => Some(Self::UserInfo),
            "USER_INFO_SIZE" => Some(Self::UserInfoSize),
            "TRUNCATED" => Some(Self::Truncated),
            "WAVEFORM" => Some(Self::Waveform),
            "WAVEFORM_SIZE" => Some(Self::WaveformSize),
            "BOARD_FAIL" => Some(Self::BoardFail),
            "AGGREGATE_COUNTER" => Some(Self::AggregateCounter),
            "FLUSH" => Some(Self::Flush),
            "EVENT_SIZE" => Some(Self::EventSize),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Channel => "CHANNEL",
            Self::Timestamp => "TIMESTAMP",
            Self::TimestampNs => "TIMESTAMP_NS",
            Self::FineTimestamp => "FINE_TIMESTAMP",
            Self::Energy => "ENERGY",
            Self::FlagsB => "FLAGS_B",
            Self::FlagsA => "FLAGS_A",
            Self::Psd => "PSD",
            Self::SpecialEvent => "SPECIAL_EVENT",
            Self::UserInfo => "USER_INFO",
            Self::UserInfoSize => "USER_INFO_SIZE",
            Self::Truncated => "TRUNCATED",
            Self::Waveform => "WAVEFORM",
            Self::WaveformSize => "WAVEFORM_SIZE",
            Self::BoardFail => "BOARD_FAIL",
            Self::AggregateCounter => "AGGREGATE_COUNTER",
            Self::Flush => "FLUSH",
            Self::EventSize => "EVENT_SIZE",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::UserInfo | Self::Waveform => 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct OpenDppHit {
    pub channel: u8,
    pub special_event: bool,
    pub info: u8,
    pub timestamp: u64,
    pub flags_b: u16,
    pub flags_a: u8,
    pub psd: u16,
    pub fine_timestamp: u16,
    pub energy: u16,
    pub user_info: Vec<u64>,
    pub truncated: bool,
    pub waveform: Vec<u16>,
    pub event_size: usize,
    pub board_fail: bool,
    pub flush: bool,
    pub aggregate_counter: u32,
    pub fake_stop_event: bool,
}

pub struct OpenDpp {
    node: NodeId,
    params: Arc<dyn Params>,
    ring: Ring<OpenDppHit>,
    schema: Mutex<Schema<OpenDppField>>,
    clear_flag: ClearFlag,
}

impl OpenDpp {
    pub fn new(node: NodeId, params: Arc<dyn Params>) -> Arc<Self> {
        Arc::new(Self {
            node,
            params,
            ring: Ring::new(RING_SLOTS),
            schema: Mutex::new(Self::default_schema()),
            clear_flag: ClearFlag::default(),
        })
    }

    pub fn default_schema() -> Schema<OpenDppField> {
        Schema::of(&[
            (OpenDppField::Channel, WireType::U8),
            (OpenDppField::Timestamp, WireType::U64),
            (OpenDppField::FineTimestamp, WireType::U16),
            (OpenDppField::Energy, WireType::U16),
        ])
    }

    fn decode_event(&self, event: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(event);
        let Some(aggregate) = decode_aggregate_header(&mut cursor)? else {
            return Ok(());
        };
        debug_assert_eq!(event.len(), aggregate.n_words as usize * wire::WORD_SIZE);

        while !cursor.is_empty() {
            if self.clear_flag.take() {
                self.ring.notify();
                return Ok(());
            }
            self.decode_hit(&mut cursor, &aggregate)?;
        }

        self.ring.notify();
        Ok(())
    }

    fn decode_hit(&self, cursor: &mut Cursor<'_>, aggregate: &AggregateHeader) -> Result<()> {
        let hit_begin = cursor.position();

        let mut slot = self.ring.acquire_write();
        let hit = &mut *slot;

        hit.board_fail = aggregate.board_fail;
        hit.flush = aggregate.flush;
        hit.aggregate_counter = aggregate.counter;
        hit.fake_stop_event = false;
        hit.user_info.clear();

        let mut has_waveform = false;

        let mut word = BitField(cursor.read_word()?);
        let mut is_last_word = word.high_flag();
        hit.channel = word.high(7) as u8;

        if is_last_word {
            // Compact single-word hit.
            hit.flags_a = word.high(8) as u8;
            hit.timestamp = word.high(32);
            hit.energy = word.high(16) as u16;
            debug_assert!(word.exhausted());
            hit.special_event = false;
            hit.info = 0;
            hit.flags_b = 0;
            hit.psd = 0;
            hit.fine_timestamp = 0;
            hit.truncated = false;
        } else {
            hit.special_event = word.high_flag();
            hit.info = word.high(7) as u8;
            hit.timestamp = word.high(48);
            debug_assert!(word.exhausted());

            let mut word = BitField(cursor.read_word()?);
            hit.energy = word.low(16) as u16;
            hit.fine_timestamp = word.low(10) as u16;
            hit.psd = word.low(16) as u16;
            hit.flags_a = word.low(8) as u8;
            hit.flags_b = word.low(12) as u16;
            has_waveform = word.low_flag();
            is_last_word = word.low_flag();
            debug_assert!(word.exhausted());

            while !is_last_word {
                let mut word = BitField(cursor.read_word()?);
                hit.user_info.push(word.low(63));
                is_last_word = word.low_flag();
                debug_assert!(word.exhausted());
            }
        }

        if has_waveform {
            let mut word = BitField(cursor.read_word()?);
            let waveform_words = word.low(12) as usize;
            word.skip_low(51);
            hit.truncated = word.low_flag();
            debug_assert!(word.exhausted());

            if hit.truncated {
                warn!("unexpected truncated waveform");
            }

            let n_samples = waveform_words * SAMPLES_PER_WORD;
            wire::resize_in_place(&mut hit.waveform, n_samples);
            for index in 0..waveform_words {
                let word = cursor.read_word()?;
                let first = index * SAMPLES_PER_WORD;
                wire::unpack_u16_samples(word, &mut hit.waveform[first..first + SAMPLES_PER_WORD]);
            }
        } else {
            hit.waveform.clear();
        }

        hit.event_size = cursor.position() - hit_begin;

        slot.commit_relaxed();
        Ok(())
    }
}

impl Endpoint for OpenDpp {
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
        let hit = &*slot;
        while let Some(field) = projector.next_field() {
            match field {
                OpenDppField::Channel => projector.put_scalar(hit.channel)?,
                OpenDppField::Timestamp => projector.put_scalar(hit.timestamp)?,
                OpenDppField::TimestampNs => projector
                    .put_scalar(hit.timestamp as f64 * self.params.sampling_period_ns())?,
                OpenDppField::FineTimestamp => projector.put_scalar(hit.fine_timestamp)?,
                OpenDppField::Energy => projector.put_scalar(hit.energy)?,
                OpenDppField::FlagsB => projector.put_scalar(hit.flags_b)?,
                OpenDppField::FlagsA => projector.put_scalar(hit.flags_a)?,
                OpenDppField::Psd => projector.put_scalar(hit.psd)?,
                OpenDppField::SpecialEvent => projector.put_scalar(hit.special_event)?,
                OpenDppField::UserInfo => projector.put_array(ArraySrc::from(&hit.user_info))?,
                OpenDppField::UserInfoSize => projector.put_scalar(hit.user_info.len())?,
                OpenDppField::Truncated => projector.put_scalar(hit.truncated)?,
                OpenDppField::Waveform => projector.put_array(ArraySrc::from(&hit.waveform))?,
                OpenDppField::WaveformSize => projector.put_scalar(hit.waveform.len())?,
                OpenDppField::BoardFail => projector.put_scalar(hit.board_fail)?,
                OpenDppField::AggregateCounter => {
                    projector.put_scalar(hit.aggregate_counter)?
                }
                OpenDppField::Flush => projector.put_scalar(hit.flush)?,
                OpenDppField::EventSize => projector.put_scalar(hit.event_size)?,
            }
        }
        drop(schema);
        slot.commit_relaxed();
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
        self.clear_flag.request();
        self.ring.invalidate();
        Ok(())
    }
}

impl SwEndpoint for OpenDpp {
    fn resize(&self) -> Result<()> {
        if decode_disabled(&*self.params)? {
            self.ring.apply_all(|hit| {
                hit.user_info = Vec::new();
                hit.waveform = Vec::new();
            });
            self.clear_flag.take();
            return Ok(());
        }

        let n_channels = self.params.n_channels();
        let mut any_enabled = false;
        for channel in 0..n_channels {
            if channel_enabled(&*self.params, channel)? {
                any_enabled = true;
                break;
            }
        }

        self.ring.apply_all(|hit| {
            if any_enabled {
                wire::reserve_total(&mut hit.user_info, MAX_USER_INFO_WORDS);
                wire::reserve_total(&mut hit.waveform, MAX_WAVEFORM_SAMPLES);
            } else {
                hit.user_info = Vec::new();
                hit.waveform = Vec::new();
            }
        });

        self.clear_flag.take();
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

#[cfg(test)]
mod tests {
    use crate::endpoint::stats::testing::*;
    use crate::endpoint::sw::testing::*;

    use super::*;

    fn open_dpp() -> Arc<OpenDpp> {
        OpenDpp::new(
            21,
            stub(StubParams {
                n_channels: 4,
                sampling_period_ns: 8.0,
                active_endpoint: "opendpp".to_owned(),
                ..Default::default()
            }),
        )
    }

    fn aggregate_event(hit_words: &[u64]) -> Vec<u8> {
        let n_words = (1 + hit_words.len()) as u32;
        let mut words = vec![header_word(0b0010, 0x00_0001, n_words)];
        words.extend_from_slice(hit_words);
        to_bytes(&words)
    }

    fn standard_first_word(channel: u8, special: bool, info: u8, timestamp: u64) -> u64 {
        (u64::from(channel) << 56)
            | (u64::from(special) << 55)
            | (u64::from(info) << 48)
            | timestamp
    }

    /// LSB-first: energy(16), fine(10), psd(16), flags_a(8), flags_b(12),
    /// has_waveform(1), last_word(1).
    fn standard_second_word(
        energy: u16,
        fine: u16,
        psd: u16,
        flags_a: u8,
        flags_b: u16,
        has_waveform: bool,
        last_word: bool,
    ) -> u64 {
        u64::from(energy)
            | (u64::from(fine) << 16)
            | (u64::from(psd) << 26)
            | (u64::from(flags_a) << 42)
            | (u64::from(flags_b) << 50)
            | (u64::from(has_waveform) << 62)
            | (u64::from(last_word) << 63)
    }

    fn user_info_word(data: u64, last_word: bool) -> u64 {
        data | (u64::from(last_word) << 63)
    }

    fn pack4(samples: [u16; 4]) -> u64 {
        samples
            .iter()
            .enumerate()
            .fold(0u64, |word, (i, &s)| word | (u64::from(s) << (16 * i)))
    }

    #[test]
    fn test_standard_hit_with_user_info_and_waveform() {
        let endpoint = open_dpp();
        let event = aggregate_event(&[
            standard_first_word(3, false, 0x5, 0xABCDEF),
            standard_second_word(0x1111, 5, 0x2222, 0xAA, 0x333, true, false),
            user_info_word(42, false),
            user_info_word(43, true),
            // waveform size word: 1 word, not truncated
            1,
            pack4([10, 20, 30, 40]),
        ]);
        endpoint.decode(&event).unwrap();

        endpoint
            .set_data_format(
                r#"[
                    {"name":"CHANNEL","type":"U8"},
                    {"name":"TIMESTAMP","type":"U64"},
                    {"name":"ENERGY","type":"U16"},
                    {"name":"PSD","type":"U16"},
                    {"name":"FLAGS_A","type":"U8"},
                    {"name":"FLAGS_B","type":"U16"},
                    {"name":"USER_INFO","type":"U64","dim":1},
                    {"name":"USER_INFO_SIZE","type":"SIZE_T"},
                    {"name":"WAVEFORM","type":"U16","dim":1},
                    {"name":"WAVEFORM_SIZE","type":"SIZE_T"}
                ]"#,
            )
            .unwrap();

        let mut channel = 0u8;
        let mut timestamp = 0u64;
        let mut energy = 0u16;
        let mut psd = 0u16;
        let mut flags_a = 0u8;
        let mut flags_b = 0u16;
        let mut user_info: Vec<u64> = Vec::new();
        let mut user_info_size = 0usize;
        let mut waveform: Vec<u16> = Vec::new();
        let mut waveform_size = 0usize;
        let mut slots = [
            Slot::u8(&mut channel),
            Slot::u64(&mut timestamp),
            Slot::u16(&mut energy),
            Slot::u16(&mut psd),
            Slot::u8(&mut flags_a),
            Slot::u16(&mut flags_b),
            Slot::arr_u64(&mut user_info),
            Slot::size(&mut user_info_size),
            Slot::arr_u16(&mut waveform),
            Slot::size(&mut waveform_size),
        ];
        endpoint
            .read_data(Some(Duration::ZERO), &mut slots)
            .unwrap();

        assert_eq!(channel, 3);
        assert_eq!(timestamp, 0xABCDEF);
        assert_eq!(energy, 0x1111);
        assert_eq!(psd, 0x2222);
        assert_eq!(flags_a, 0xAA);
        assert_eq!(flags_b, 0x333);
        assert_eq!(user_info, vec![42, 43]);
        assert_eq!(user_info_size, 2);
        assert_eq!(waveform, vec![10, 20, 30, 40]);
        assert_eq!(waveform_size, 4);
    }

    #[test]
    fn test_compact_hit() {
        let endpoint = open_dpp();
        let compact = (1u64 << 63)
            | (2u64 << 56)      // channel
            | (0x55u64 << 48)   // flags_a
            | (0x1234u64 << 16) // reduced timestamp
            | 0x99;             // energy
        endpoint.decode(&aggregate_event(&[compact])).unwrap();

        let mut channel = 0u8;
        let mut timestamp = 0u64;
        let mut fine = 0u16;
        let mut energy = 0u16;
        let mut slots = [
            Slot::u8(&mut channel),
            Slot::u64(&mut timestamp),
            Slot::u16(&mut fine),
            Slot::u16(&mut energy),
        ];
        endpoint
            .read_data(Some(Duration::ZERO), &mut slots)
            .unwrap();
        assert_eq!(channel, 2);
        assert_eq!(timestamp, 0x1234);
        assert_eq!(fine, 0);
        assert_eq!(energy, 0x99);
    }

    #[test]
    fn test_special_event_is_delivered_with_flag() {
        let endpoint = open_dpp();
        let event = aggregate_event(&[
            standard_first_word(0, true, 0, 7),
            standard_second_word(0, 0, 0, 0, 0, false, true),
        ]);
        endpoint.decode(&event).unwrap();

        endpoint
            .set_data_format(r#"[{"name":"SPECIAL_EVENT","type":"BOOL"}]"#)
            .unwrap();
        let mut special = false;
        let mut slots = [Slot::boolean(&mut special)];
        endpoint
            .read_data(Some(Duration::ZERO), &mut slots)
            .unwrap();
        assert!(special);
    }
}
