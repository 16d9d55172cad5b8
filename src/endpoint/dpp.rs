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

//! Aggregate DPP decoder, shared by the PHA and PSD firmware flavors.
//!
//! Both flavors emit the same hit envelope (compact single-word hits,
//! two-word standard hits, typed extra words, bit-packed probe waveforms)
//! and differ only in what the probe type codes mean. Special (time-info /
//! counter-info) hits feed the sibling per-channel stats endpoint and are not
//! delivered to the consumer.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use num_enum::IntoPrimitive;

use crate::endpoint::Endpoint;
use crate::endpoint::Params;
use crate::endpoint::SwEndpoint;
use crate::endpoint::aggregate::AggregateHeader;
use crate::endpoint::aggregate::ClearFlag;
use crate::endpoint::aggregate::decode_aggregate_header;
use crate::endpoint::channel_enabled;
use crate::endpoint::decode_disabled;
use crate::endpoint::stats::ChannelStats;
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

pub const N_ANALOG_PROBES: usize = 2;
pub const N_DIGITAL_PROBES: usize = 4;
/// 2 x 14-bit analog + 4 x 1-bit digital samples per word.
pub const ANALOG_SAMPLE_BITS: u32 = 14;
pub const SAMPLES_PER_WORD: usize = 2;
pub const MAX_WAVEFORM_WORDS: usize = 4095;
pub const MAX_WAVEFORM_SAMPLES: usize = MAX_WAVEFORM_WORDS * SAMPLES_PER_WORD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Pha,
    Psd,
}

/// Firmware-independent analog probe designation; the wire codes are flavor
/// specific.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum AnalogProbeType {
    AdcInput = 0b0000,
    TimeFilter = 0b0001,
    EnergyFilter = 0b0010,
    EnergyFilterBaseline = 0b0011,
    EnergyFilterMinusBaseline = 0b0100,
    Baseline = 0b1001,
    Cfd = 0b1010,
    #[default]
    Unknown = 0xff,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum DigitalProbeType {
    Trigger = 0b00000,
    TimeFilterArmed = 0b00001,
    ReTriggerGuard = 0b00010,
    EnergyFilterBaselineFreeze = 0b00011,
    EnergyFilterPeaking = 0b00100,
    EnergyFilterPeakReady = 0b00101,
    EnergyFilterPileUpGuard = 0b00110,
    EventPileUp = 0b00111,
    AdcSaturation = 0b01000,
    AdcSaturationProtection = 0b01001,
    PostSaturationEvent = 0b01010,
    EnergyFilterSaturation = 0b01011,
    SignalInhibit = 0b01100,
    OverThreshold = 0b10100,
    ChargeReady = 0b10101,
    LongGate = 0b10110,
    ShortGate = 0b11000,
    InputSaturation = 0b11001,
    ChargeOverRange = 0b11010,
    NegativeOverThreshold = 0b11011,
    #[default]
    Unknown = 0xff,
}

fn decode_analog_type(flavor: Flavor, code: u8) -> AnalogProbeType {
    match flavor {
        Flavor::Pha => match code {
            0b000 => AnalogProbeType::AdcInput,
            0b001 => AnalogProbeType::TimeFilter,
            0b010 => AnalogProbeType::EnergyFilter,
            0b011 => AnalogProbeType::EnergyFilterBaseline,
            0b100 => AnalogProbeType::EnergyFilterMinusBaseline,
            _ => AnalogProbeType::Unknown,
        },
        Flavor::Psd => match code {
            0b000 => AnalogProbeType::AdcInput,
            0b001 => AnalogProbeType::Baseline,
            0b010 => AnalogProbeType::Cfd,
            _ => AnalogProbeType::Unknown,
        },
    }
}

fn decode_digital_type(flavor: Flavor, code: u8) -> DigitalProbeType {
    match (flavor, code) {
        (_, 0b0000) => DigitalProbeType::Trigger,
        (_, 0b0001) => DigitalProbeType::TimeFilterArmed,
        (_, 0b0010) => DigitalProbeType::ReTriggerGuard,
        (_, 0b0011) => DigitalProbeType::EnergyFilterBaselineFreeze,
        (_, 0b0111) => DigitalProbeType::EventPileUp,
        (Flavor::Pha, 0b0100) => DigitalProbeType::EnergyFilterPeaking,
        (Flavor::Pha, 0b0101) => DigitalProbeType::EnergyFilterPeakReady,
        (Flavor::Pha, 0b0110) => DigitalProbeType::EnergyFilterPileUpGuard,
        (Flavor::Pha, 0b1000) => DigitalProbeType::AdcSaturation,
        (Flavor::Pha, 0b1001) => DigitalProbeType::AdcSaturationProtection,
        (Flavor::Pha, 0b1010) => DigitalProbeType::PostSaturationEvent,
        (Flavor::Pha, 0b1011) => DigitalProbeType::EnergyFilterSaturation,
        (Flavor::Pha, 0b1100) => DigitalProbeType::SignalInhibit,
        (Flavor::Psd, 0b0100) => DigitalProbeType::OverThreshold,
        (Flavor::Psd, 0b0101) => DigitalProbeType::ChargeReady,
        (Flavor::Psd, 0b0110) => DigitalProbeType::LongGate,
        (Flavor::Psd, 0b1000) => DigitalProbeType::ShortGate,
        (Flavor::Psd, 0b1001) => DigitalProbeType::InputSaturation,
        (Flavor::Psd, 0b1010) => DigitalProbeType::ChargeOverRange,
        (Flavor::Psd, 0b1011) => DigitalProbeType::NegativeOverThreshold,
        _ => DigitalProbeType::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtraType {
    WaveInfo,
    TimeInfo,
    CounterInfo,
    Other(u8),
}

impl From<u8> for ExtraType {
    fn from(code: u8) -> Self {
        match code {
            0b000 => Self::WaveInfo,
            0b001 => Self::TimeInfo,
            0b010 => Self::CounterInfo,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Default)]
pub struct AnalogProbe {
    pub probe_type: AnalogProbeType,
    pub is_signed: bool,
    pub mul_factor: i32,
    pub data: Vec<u16>,
    pub decoded_data: Vec<i32>,
}

#[derive(Debug, Default)]
pub struct DigitalProbe {
    pub probe_type: DigitalProbeType,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct DppHit {
    pub channel: u8,
    pub timestamp: u64,
    pub fine_timestamp: u16,
    pub energy: u16,
    pub flags_low_priority: u16,
    pub flags_high_priority: u8,
    pub trigger_thr: u16,
    pub time_resolution: u8,
    pub analog_probes: [AnalogProbe; N_ANALOG_PROBES],
    pub digital_probes: [DigitalProbe; N_DIGITAL_PROBES],
    pub event_size: usize,
    pub board_fail: bool,
    pub flush: bool,
    pub aggregate_counter: u32,
    pub fake_stop_event: bool,
}

impl DppHit {
    fn for_each_probe_vec(&mut self, mut f: impl FnMut(ProbeVec<'_>)) {
        for probe in &mut self.analog_probes {
            f(ProbeVec::U16(&mut probe.data));
            f(ProbeVec::I32(&mut probe.decoded_data));
        }
        for probe in &mut self.digital_probes {
            f(ProbeVec::U8(&mut probe.data));
        }
    }
}

enum ProbeVec<'a> {
    U8(&'a mut Vec<u8>),
    U16(&'a mut Vec<u16>),
    I32(&'a mut Vec<i32>),
}

impl ProbeVec<'_> {
    fn clear(self) {
        match self {
            Self::U8(v) => v.clear(),
            Self::U16(v) => v.clear(),
            Self::I32(v) => v.clear(),
        }
    }

    fn free(self) {
        match self {
            Self::U8(v) => *v = Vec::new(),
            Self::U16(v) => *v = Vec::new(),
            Self::I32(v) => *v = Vec::new(),
        }
    }

    fn reserve(self, capacity: usize) {
        match self {
            Self::U8(v) => wire::reserve_total(v, capacity),
            Self::U16(v) => wire::reserve_total(v, capacity),
            Self::I32(v) => wire::reserve_total(v, capacity),
        }
    }

    fn resize(self, len: usize) {
        match self {
            Self::U8(v) => wire::resize_in_place(v, len),
            Self::U16(v) => wire::resize_in_place(v, len),
            Self::I32(v) => wire::resize_in_place(v, len),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DppField {
    Channel,
    Timestamp,
    TimestampNs,
    FineTimestamp,
    Energy,
    FlagsLowPriority,
    FlagsHighPriority,
    TriggerThr,
    TimeResolution,
    AnalogProbe1,
    AnalogProbe1Type,
    AnalogProbe2,
    AnalogProbe2Type,
    DigitalProbe1,
    DigitalProbe1Type,
    DigitalProbe2,
    DigitalProbe2Type,
    DigitalProbe3,
    DigitalProbe3Type,
    DigitalProbe4,
    DigitalProbe4Type,
    WaveformSize,
    BoardFail,
    AggregateCounter,
    Flush,
    EventSize,
}

impl FormatField for DppField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "CHANNEL" => Some(Self::Channel),
            "TIMESTAMP" => Some(Self::Timestamp),
            "TIMESTAMP_NS" => Some(Self::TimestampNs),
            "FINE_TIMESTAMP" => Some(Self::FineTimestamp),
            "ENERGY" => Some(Self::Energy),
            "FLAGS_LOW_PRIORITY" => Some(Self::FlagsLowPriority),
            "FLAGS_HIGH_PRIORITY" => Some(Self::FlagsHighPriority),
            "TRIGGER_THR" => Some(Self::TriggerThr),
            "TIME_RESOLUTION" => Some(Self::TimeResolution),
            "ANALOG_PROBE_1" => Some(Self::AnalogProbe1),
            "ANALOG_PROBE_1_TYPE" => Some(Self::AnalogProbe1Type),
            "ANALOG_PROBE_2" => Some(Self::AnalogProbe2),
            "ANALOG_PROBE_2_TYPE" => Some(Self::AnalogProbe2Type),
            "DIGITAL_PROBE_1" => Some(Self::DigitalProbe1),
            "DIGITAL_PROBE_1_TYPE" => Some(Self::DigitalProbe1Type),
            "DIGITAL_PROBE_2" => Some(Self::DigitalProbe2),
            "DIGITAL_PROBE_2_TYPE" => Some(Self::DigitalProbe2Type),
            "DIGITAL_PROBE_3" => Some(Self::DigitalProbe3),
            "DIGITAL_PROBE_3_TYPE" => Some(Self::DigitalProbe3Type),
            "DIGITAL_PROBE_4" => Some(Self::DigitalProbe4),
            "DIGITAL_PROBE_4_TYPE" => Some(Self::DigitalProbe4Type),
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
            Self::FlagsLowPriority => "FLAGS_LOW_PRIORITY",
            Self::FlagsHighPriority => "FLAGS_HIGH_PRIORITY",
            Self::TriggerThr => "TRIGGER_THR",
            Self::TimeResolution => "TIME_RESOLUTION",
            Self::AnalogProbe1 => "ANALOG_PROBE_1",
            Self::AnalogProbe1Type => "ANALOG_PROBE_1_TYPE",
            Self::AnalogProbe2 => "ANALOG_PROBE_2",
            Self::AnalogProbe2Type => "ANALOG_PROBE_2_TYPE",
            Self::DigitalProbe1 => "DIGITAL_PROBE_1",
            Self::DigitalProbe1Type => "DIGITAL_PROBE_1_TYPE",
            Self::DigitalProbe2 => "DIGITAL_PROBE_2",
            Self::DigitalProbe2Type => "DIGITAL_PROBE_2_TYPE",
            Self::DigitalProbe3 => "DIGITAL_PROBE_3",
            Self::DigitalProbe3Type => "DIGITAL_PROBE_3_TYPE",
            Self::DigitalProbe4 => "DIGITAL_PROBE_4",
            Self::DigitalProbe4Type => "DIGITAL_PROBE_4_TYPE",
            Self::WaveformSize => "WAVEFORM_SIZE",
            Self::BoardFail => "BOARD_FAIL",
            Self::AggregateCounter => "AGGREGATE_COUNTER",
            Self::Flush => "FLUSH",
            Self::EventSize => "EVENT_SIZE",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::AnalogProbe1
            | Self::AnalogProbe2
            | Self::DigitalProbe1
            | Self::DigitalProbe2
            | Self::DigitalProbe3
            | Self::DigitalProbe4 => 1,
            _ => 0,
        }
    }
}

pub struct DppEndpoint {
    node: NodeId,
    flavor: Flavor,
    params: Arc<dyn Params>,
    ring: Ring<DppHit>,
    schema: Mutex<Schema<DppField>>,
    clear_flag: ClearFlag,
    stats: Arc<ChannelStats>,
}

impl DppEndpoint {
    pub fn new(
        flavor: Flavor,
        node: NodeId,
        stats: Arc<ChannelStats>,
        params: Arc<dyn Params>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            flavor,
            params,
            ring: Ring::new(RING_SLOTS),
            schema: Mutex::new(Self::default_schema()),
            clear_flag: ClearFlag::default(),
            stats,
        })
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn stats_endpoint(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }

    pub fn default_schema() -> Schema<DppField> {
        Schema::of(&[
            (DppField::Channel, WireType::U8),
            (DppField::Timestamp, WireType::U64),
            (DppField::FineTimestamp, WireType::U16),
            (DppField::Energy, WireType::U16),
            (DppField::AnalogProbe1, WireType::I32),
            (DppField::AnalogProbe2, WireType::I32),
            (DppField::DigitalProbe1, WireType::U8),
            (DppField::DigitalProbe2, WireType::U8),
            (DppField::DigitalProbe3, WireType::U8),
            (DppField::DigitalProbe4, WireType::U8),
            (DppField::WaveformSize, WireType::SizeT),
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
                // A clear raced with this aggregate: drop its remainder.
                self.ring.notify();
                return Ok(());
            }
            self.decode_hit(&mut cursor, &aggregate)?;
        }

        // One wakeup per aggregate covers the relaxed per-hit commits.
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

        let mut special_event = false;
        let mut has_waveform = false;
        let mut stats_dead_time: Option<u64> = None;
        let mut stats_counters: Option<(u32, u32)> = None;

        let mut word = BitField(cursor.read_word()?);
        let mut is_last_word = word.high_flag();
        hit.channel = word.high(7) as u8;

        if is_last_word {
            // Compact single-word hit: reduced timestamp, high-priority flags
            // and energy only. The fields the compact form cannot carry read
            // as zero.
            hit.flags_high_priority = word.high(8) as u8;
            hit.timestamp = word.high(32);
            hit.energy = word.high(16) as u16;
            debug_assert!(word.exhausted());
            hit.flags_low_priority = 0;
            hit.fine_timestamp = 0;
        } else {
            special_event = word.high_flag();
            word.skip_high(7);
            hit.timestamp = word.high(48);
            debug_assert!(word.exhausted());

            let mut word = BitField(cursor.read_word()?);
            hit.energy = word.low(16) as u16;
            hit.fine_timestamp = word.low(10) as u16;
            word.skip_low(16);
            hit.flags_high_priority = word.low(8) as u8;
            hit.flags_low_priority = word.low(12) as u16;
            has_waveform = word.low_flag();
            is_last_word = word.low_flag();
            debug_assert!(word.exhausted());

            while !is_last_word {
                let mut word = BitField(cursor.read_word()?);
                let mut extra_data = BitField(word.low(60));
                let extra_type = ExtraType::from(word.low(3) as u8);
                is_last_word = word.low_flag();
                debug_assert!(word.exhausted());

                match extra_type {
                    ExtraType::WaveInfo => {
                        for probe in &mut hit.analog_probes {
                            let type_code = extra_data.low(3) as u8;
                            probe.probe_type = decode_analog_type(self.flavor, type_code);
                            probe.is_signed = extra_data.low_flag();
                            probe.mul_factor = match extra_data.low(2) {
                                0b00 => 1,
                                0b01 => 4,
                                0b10 => 8,
                                _ => 16,
                            };
                        }
                        for probe in &mut hit.digital_probes {
                            let type_code = extra_data.low(4) as u8;
                            probe.probe_type = decode_digital_type(self.flavor, type_code);
                        }
                        hit.trigger_thr = extra_data.low(16) as u16;
                        hit.time_resolution = extra_data.low(2) as u8;
                    }
                    ExtraType::TimeInfo => {
                        stats_dead_time = Some(extra_data.low(48));
                    }
                    ExtraType::CounterInfo => {
                        let saved_event_cnt = extra_data.low(24) as u32;
                        let trigger_cnt = extra_data.low(24) as u32;
                        stats_counters = Some((trigger_cnt, saved_event_cnt));
                    }
                    ExtraType::Other(code) => {
                        warn!("unsupported extra word type {code}");
                    }
                }
            }
        }

        if has_waveform {
            self.decode_hit_waveform(cursor, hit)?;
        } else {
            hit.for_each_probe_vec(|vec| vec.clear());
        }

        hit.event_size = cursor.position() - hit_begin;

        if special_event {
            self.stats.update(
                usize::from(hit.channel),
                hit.timestamp,
                stats_dead_time,
                stats_counters,
            )?;
            // Special hits update statistics only; the slot is abandoned.
            return Ok(());
        }

        slot.commit_relaxed();
        Ok(())
    }

    fn decode_hit_waveform(&self, cursor: &mut Cursor<'_>, hit: &mut DppHit) -> Result<()> {
        let mut word = BitField(cursor.read_word()?);
        let waveform_words = word.low(12) as usize;
        word.skip_low(51);
        let truncated = word.low_flag();
        debug_assert!(word.exhausted());

        if truncated {
            warn!("unexpected truncated waveform");
        }

        let n_samples = waveform_words * SAMPLES_PER_WORD;
        hit.for_each_probe_vec(|vec| vec.resize(n_samples));

        for index in 0..waveform_words {
            let mut word = BitField(cursor.read_word()?);
            for offset in 0..SAMPLES_PER_WORD {
                let sample = index * SAMPLES_PER_WORD + offset;
                hit.analog_probes[0].data[sample] = word.low(ANALOG_SAMPLE_BITS) as u16;
                hit.digital_probes[0].data[sample] = word.low(1) as u8;
                hit.digital_probes[1].data[sample] = word.low(1) as u8;
                hit.analog_probes[1].data[sample] = word.low(ANALOG_SAMPLE_BITS) as u16;
                hit.digital_probes[2].data[sample] = word.low(1) as u8;
                hit.digital_probes[3].data[sample] = word.low(1) as u8;
            }
            debug_assert!(word.exhausted());
        }

        for probe in &mut hit.analog_probes {
            let mul = probe.mul_factor;
            let is_signed = probe.is_signed;
            probe.decoded_data.clear();
            probe.decoded_data.extend(probe.data.iter().map(|&raw| {
                let value = if is_signed {
                    wire::sign_extend(u64::from(raw), ANALOG_SAMPLE_BITS) as i32
                } else {
                    i32::from(raw)
                };
                value * mul
            }));
        }

        Ok(())
    }
}

impl Endpoint for DppEndpoint {
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
                DppField::Channel => projector.put_scalar(hit.channel)?,
                DppField::Timestamp => projector.put_scalar(hit.timestamp)?,
                DppField::TimestampNs => projector
                    .put_scalar(hit.timestamp as f64 * self.params.sampling_period_ns())?,
                DppField::FineTimestamp => projector.put_scalar(hit.fine_timestamp)?,
                DppField::Energy => projector.put_scalar(hit.energy)?,
                DppField::FlagsLowPriority => projector.put_scalar(hit.flags_low_priority)?,
                DppField::FlagsHighPriority => projector.put_scalar(hit.flags_high_priority)?,
                DppField::TriggerThr => projector.put_scalar(hit.trigger_thr)?,
                DppField::TimeResolution => projector.put_scalar(hit.time_resolution)?,
                DppField::AnalogProbe1 => {
                    projector.put_array(ArraySrc::from(&hit.analog_probes[0].decoded_data))?
                }
                DppField::AnalogProbe1Type => {
                    projector.put_scalar(u8::from(hit.analog_probes[0].probe_type))?
                }
                DppField::AnalogProbe2 => {
                    projector.put_array(ArraySrc::from(&hit.analog_probes[1].decoded_data))?
                }
                DppField::AnalogProbe2Type => {
                    projector.put_scalar(u8::from(hit.analog_probes[1].probe_type))?
                }
                DppField::DigitalProbe1 => {
                    projector.put_array(ArraySrc::from(&hit.digital_probes[0].data))?
                }
                DppField::DigitalProbe1Type => {
                    projector.put_scalar(u8::from(hit.digital_probes[0].probe_type))?
                }
                DppField::DigitalProbe2 => {
                    projector.put_array(ArraySrc::from(&hit.digital_probes[1].data))?
                }
                DppField::DigitalProbe2Type => {
                    projector.put_scalar(u8::from(hit.digital_probes[1].probe_type))?
                }
                DppField::DigitalProbe3 => {
                    projector.put_array(ArraySrc::from(&hit.digital_probes[2].data))?
                }
                DppField::DigitalProbe3Type => {
                    projector.put_scalar(u8::from(hit.digital_probes[2].probe_type))?
                }
                DppField::DigitalProbe4 => {
                    projector.put_array(ArraySrc::from(&hit.digital_probes[3].data))?
                }
                DppField::DigitalProbe4Type => {
                    projector.put_scalar(u8::from(hit.digital_probes[3].probe_type))?
                }
                DppField::WaveformSize => {
                    // All probes share one length.
                    projector.put_scalar(hit.analog_probes[0].data.len())?
                }
                DppField::BoardFail => projector.put_scalar(hit.board_fail)?,
                DppField::AggregateCounter => projector.put_scalar(hit.aggregate_counter)?,
                DppField::Flush => projector.put_scalar(hit.flush)?,
                DppField::EventSize => projector.put_scalar(hit.event_size)?,
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
        self.stats.clear_data()
    }
}

impl SwEndpoint for DppEndpoint {
    fn resize(&self) -> Result<()> {
        if decode_disabled(&*self.params)? {
            self.ring
                .apply_all(|hit| hit.for_each_probe_vec(|vec| vec.free()));
            self.clear_flag.take();
            return Ok(());
        }

        // The per-channel record lengths only matter for channels that are
        // enabled and have a wave trigger configured.
        let n_channels = self.params.n_channels();
        let mut max_record_length = 0usize;
        for channel in 0..n_channels {
            if !channel_enabled(&*self.params, channel)? {
                continue;
            }
            let trigger_source = self
                .params
                .value(&format!("/ch/{channel}/par/wavetriggersource"))?;
            if trigger_source.eq_ignore_ascii_case("disabled") {
                continue;
            }
            let record_length: usize = self
                .params
                .value(&format!("/ch/{channel}/par/chrecordlengths"))?
                .parse()
                .map_err(|err| Error::Command(format!("invalid record length: {err}")))?;
            max_record_length = max_record_length.max(record_length);
        }

        if max_record_length > MAX_WAVEFORM_SAMPLES {
            return Err(Error::Command(format!(
                "record length {max_record_length} exceeds {MAX_WAVEFORM_SAMPLES} samples"
            )));
        }

        self.ring
            .apply_all(|hit| hit.for_each_probe_vec(|vec| vec.reserve(max_record_length)));

        // Arm follows a clear; drop any stale clear request.
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
