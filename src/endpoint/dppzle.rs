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

//! Zero-length-encoding decoder. A ZLE event is a sequence of per-channel
//! sub-events, each carrying run-length counters that alternate between
//! "good" (recorded signal) and "bad" (zero-suppressed) chunks, plus the
//! packed samples of the good chunks. The sub-events of one trigger are
//! merged into a single record, committed when the sub-event flagged
//! `last_channel` arrives; the suppressed stretches of the reconstructed
//! waveform are filled with the channel's default value.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
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
use crate::sink::Scalar;
use crate::sink::Slot;
use crate::wire;
use crate::wire::BitField;
use crate::wire::Cursor;

const RING_SLOTS: usize = 4;

pub const SAMPLES_PER_WORD: usize = 4;
pub const MAX_N_COUNTERS: usize = 1023;
pub const MAX_WAVEFORM_WORDS: usize = 4095;
pub const MAX_WAVEFORM_SAMPLES: usize = MAX_WAVEFORM_WORDS * SAMPLES_PER_WORD;

const SAMPLE_BAD: u8 = 0;
const SAMPLE_GOOD: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZleField {
    Timestamp,
    TimestampNs,
    RecordLength,
    TruncateWave,
    TruncateParam,
    WaveformDefvalue,
    ChunkNumber,
    ChunkTime,
    ChunkSize,
    ChunkBegin,
    Waveform,
    ReconstructedWaveform,
    SampleType,
    ReconstructedWaveformSize,
    BoardFail,
    AggregateCounter,
    Flush,
    EventSize,
}

impl FormatField for ZleField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "TIMESTAMP" => Some(Self::Timestamp),
            "TIMESTAMP_NS" => Some(Self::TimestampNs),
            "RECORD_LENGTH" => Some(Self::RecordLength),
            "TRUNCATE_WAVE" => Some(Self::TruncateWave),
            "TRUNCATE_PARAM" => Some(Self::TruncateParam),
            "WAVEFORM_DEFVALUE" => Some(Self::WaveformDefvalue),
            "CHUNK_NUMBER" => Some(Self::ChunkNumber),
            "CHUNK_TIME" => Some(Self::ChunkTime),
            "CHUNK_SIZE" => Some(Self::ChunkSize),
            "CHUNK_BEGIN" => Some(Self::ChunkBegin),
            "WAVEFORM" => Some(Self::Waveform),
            "RECONSTRUCTED_WAVEFORM" => Some(Self::ReconstructedWaveform),
            "SAMPLE_TYPE" => Some(Self::SampleType),
            "RECONSTRUCTED_WAVEFORM_SIZE" => Some(Self::ReconstructedWaveformSize),
            "BOARD_FAIL" => Some(Self::BoardFail),
            "AGGREGATE_COUNTER" => Some(Self::AggregateCounter),
            "FLUSH" => Some(Self::Flush),
            "EVENT_SIZE" => Some(Self::EventSize),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Timestamp => "TIMESTAMP",
            Self::TimestampNs => "TIMESTAMP_NS",
            Self::RecordLength => "RECORD_LENGTH",
            Self::TruncateWave => "TRUNCATE_WAVE",
            Self::TruncateParam => "TRUNCATE_PARAM",
            Self::WaveformDefvalue => "WAVEFORM_DEFVALUE",
            Self::ChunkNumber => "CHUNK_NUMBER",
            Self::ChunkTime => "CHUNK_TIME",
            Self::ChunkSize => "CHUNK_SIZE",
            Self::ChunkBegin => "CHUNK_BEGIN",
            Self::Waveform => "WAVEFORM",
            Self::ReconstructedWaveform => "RECONSTRUCTED_WAVEFORM",
            Self::SampleType => "SAMPLE_TYPE",
            Self::ReconstructedWaveformSize => "RECONSTRUCTED_WAVEFORM_SIZE",
            Self::BoardFail => "BOARD_FAIL",
            Self::AggregateCounter => "AGGREGATE_COUNTER",
            Self::Flush => "FLUSH",
            Self::EventSize => "EVENT_SIZE",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Timestamp
            | Self::TimestampNs
            | Self::RecordLength
            | Self::BoardFail
            | Self::AggregateCounter
            | Self::Flush
            | Self::EventSize => 0,
            Self::TruncateWave
            | Self::TruncateParam
            | Self::WaveformDefvalue
            | Self::ChunkNumber
            | Self::ReconstructedWaveformSize => 1,
            Self::ChunkTime
            | Self::ChunkSize
            | Self::ChunkBegin
            | Self::Waveform
            | Self::ReconstructedWaveform
            | Self::SampleType => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    last: bool,
    wave_truncated: bool,
    counters_truncated: bool,
    size: u32,
    is_good: bool,
}

#[derive(Debug, Default)]
pub struct ZleChannel {
    pub truncate_wave: bool,
    pub truncate_param: bool,
    pub waveform_defvalue: u16,
    pub chunk_time: Vec<usize>,
    pub chunk_size: Vec<usize>,
    pub chunk_begin: Vec<usize>,
    pub waveform: Vec<u16>,
    pub reconstructed_waveform: Vec<u16>,
    pub sample_type: Vec<u8>,
}

impl ZleChannel {
    fn clear(&mut self) {
        self.chunk_time.clear();
        self.chunk_size.clear();
        self.chunk_begin.clear();
        self.waveform.clear();
        self.reconstructed_waveform.clear();
        self.sample_type.clear();
    }

    fn free(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
pub struct ZleEvent {
    pub timestamp: u64,
    pub record_length: usize,
    pub channel_data: Vec<ZleChannel>,
    pub event_size: usize,
    pub board_fail: bool,
    pub flush: bool,
    pub aggregate_counter: u32,
    pub fake_stop_event: bool,
    counters: Vec<Counter>,
}

pub struct DppZle {
    node: NodeId,
    params: Arc<dyn Params>,
    ring: Ring<ZleEvent>,
    schema: Mutex<Schema<ZleField>>,
    clear_flag: ClearFlag,
    /// Set between triggers: the next sub-event starts a fresh record.
    new_event: AtomicBool,
}

impl DppZle {
    pub fn new(node: NodeId, params: Arc<dyn Params>) -> Arc<Self> {
        let ring: Ring<ZleEvent> = Ring::new(RING_SLOTS);
        let n_channels = params.n_channels();
        ring.apply_all(|event| {
            event
                .channel_data
                .resize_with(n_channels, ZleChannel::default)
        });
        Arc::new(Self {
            node,
            params,
            ring,
            schema: Mutex::new(Self::default_schema()),
            clear_flag: ClearFlag::default(),
            new_event: AtomicBool::new(true),
        })
    }

    pub fn default_schema() -> Schema<ZleField> {
        Schema::of(&[
            (ZleField::Timestamp, WireType::U64),
            (ZleField::ReconstructedWaveform, WireType::U16),
            (ZleField::ReconstructedWaveformSize, WireType::SizeT),
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
            self.decode_sub_event(&mut cursor, &aggregate)?;
        }

        self.ring.notify();
        Ok(())
    }

    fn decode_sub_event(&self, cursor: &mut Cursor<'_>, aggregate: &AggregateHeader) -> Result<()> {
        let sub_event_begin = cursor.position();

        let mut slot = self.ring.acquire_write();
        let event = &mut *slot;

        if self.new_event.swap(false, Ordering::AcqRel) {
            // Cleared vectors mark the channels that do not participate.
            for channel in &mut event.channel_data {
                channel.clear();
            }
            event.board_fail = false;
            event.flush = false;
            event.event_size = 0;
            // A trigger may span several aggregates; the counter comes from
            // the first one.
            event.aggregate_counter = aggregate.counter;
            event.fake_stop_event = false;
        }

        event.board_fail |= aggregate.board_fail;
        event.flush |= aggregate.flush;

        let mut word = BitField(cursor.read_word()?);
        event.timestamp = word.low(48);
        word.skip_low(7);
        let last_channel = word.low_flag();
        let channel = word.low(7) as usize;
        let is_last_word = word.low_flag();
        debug_assert!(word.exhausted());

        if is_last_word {
            return Err(Error::Internal(
                "ZLE sub-event terminated by its first word".into(),
            ));
        }
        if channel >= event.channel_data.len() {
            return Err(Error::Internal(format!(
                "ZLE sub-event for channel {channel} of {}",
                event.channel_data.len()
            )));
        }

        event.counters.clear();

        // Second word: first counter in the low half, channel flags in the
        // high half.
        let mut word = BitField(cursor.read_word()?);
        let mut first_counter = Counter {
            size: word.low(28) as u32,
            counters_truncated: word.low_flag(),
            wave_truncated: word.low_flag(),
            last: word.low_flag(),
            is_good: false,
        };
        word.skip_low(1);
        let even_counters_good = word.low_flag();
        word.skip_low(3);
        let waveform_defvalue = word.low(16) as u16;
        word.skip_low(10);
        let has_waveform = word.low_flag();
        let mut is_last_word = word.low_flag();
        debug_assert!(word.exhausted());

        // Counters alternate good/bad starting from the parity of the first.
        first_counter.is_good = even_counters_good;
        event.counters.push(first_counter);

        while !is_last_word {
            if event.counters.len() + 2 > MAX_N_COUNTERS + 1 {
                return Err(Error::Internal("ZLE counter stream too long".into()));
            }
            let mut word = BitField(cursor.read_word()?);
            let low = Counter {
                size: word.low(28) as u32,
                counters_truncated: word.low_flag(),
                wave_truncated: word.low_flag(),
                last: word.low_flag(),
                is_good: !even_counters_good,
            };
            word.skip_low(1);
            let low_is_last = low.last;
            event.counters.push(low);
            if low_is_last {
                word.skip_low(31);
            } else {
                let high = Counter {
                    size: word.low(28) as u32,
                    counters_truncated: word.low_flag(),
                    wave_truncated: word.low_flag(),
                    last: word.low_flag(),
                    is_good: even_counters_good,
                };
                event.counters.push(high);
            }
            is_last_word = word.low_flag();
            debug_assert!(word.exhausted());
            if is_last_word != event.counters.last().map(|c| c.last).unwrap_or(false) {
                return Err(Error::Internal(
                    "ZLE counter stream end flags disagree".into(),
                ));
            }
        }

        let record_length = event.record_length;
        let last_counter = *event.counters.last().expect("at least one counter");
        let ZleEvent {
            counters,
            channel_data,
            ..
        } = &mut *event;
        let counters = &*counters;
        let channel_data = &mut channel_data[channel];
        channel_data.truncate_wave = last_counter.wave_truncated;
        channel_data.truncate_param = last_counter.counters_truncated;
        channel_data.waveform_defvalue = waveform_defvalue;

        if has_waveform {
            Self::decode_waveform(cursor, &mut channel_data.waveform)?;
        } else if !channel_data.waveform.is_empty() {
            return Err(Error::Internal(
                "ZLE sub-event without waveform on a dirty channel".into(),
            ));
        }

        // Reconstruct the full record: good chunks come from the packed
        // waveform, suppressed chunks read as the default value.
        wire::resize_in_place(&mut channel_data.reconstructed_waveform, record_length);
        wire::resize_in_place(&mut channel_data.sample_type, record_length);

        let mut waveform_pos = 0usize;
        let mut reconstructed_pos = 0usize;
        let mut accumulated_good = 0usize;

        for counter in counters {
            let chunk_size = counter.size as usize;
            if reconstructed_pos + chunk_size > record_length {
                return Err(Error::Internal(format!(
                    "ZLE chunks overrun the record length ({} > {record_length})",
                    reconstructed_pos + chunk_size
                )));
            }
            let sample_type = if counter.is_good {
                channel_data.chunk_size.push(chunk_size);
                channel_data.chunk_time.push(reconstructed_pos);
                channel_data.chunk_begin.push(accumulated_good);
                if waveform_pos + chunk_size > channel_data.waveform.len() {
                    return Err(Error::Internal(
                        "ZLE good chunks exceed the packed waveform".into(),
                    ));
                }
                channel_data.reconstructed_waveform
                    [reconstructed_pos..reconstructed_pos + chunk_size]
                    .copy_from_slice(
                        &channel_data.waveform[waveform_pos..waveform_pos + chunk_size],
                    );
                waveform_pos += chunk_size;
                accumulated_good += chunk_size;
                if counter.counters_truncated {
                    SAMPLE_BAD
                } else {
                    SAMPLE_GOOD
                }
            } else {
                channel_data.reconstructed_waveform
                    [reconstructed_pos..reconstructed_pos + chunk_size]
                    .fill(waveform_defvalue);
                SAMPLE_BAD
            };
            channel_data.sample_type[reconstructed_pos..reconstructed_pos + chunk_size]
                .fill(sample_type);
            reconstructed_pos += chunk_size;
        }

        // The packed waveform is padded to a word boundary; drop the padding.
        if channel_data.waveform.len() - waveform_pos >= SAMPLES_PER_WORD {
            return Err(Error::Internal(
                "ZLE packed waveform longer than its good chunks".into(),
            ));
        }
        channel_data.waveform.truncate(waveform_pos);

        // A truncated wave ends before the nominal record length.
        if channel_data.truncate_wave != (reconstructed_pos < record_length) {
            return Err(Error::Internal(
                "ZLE truncation flag disagrees with the chunk sizes".into(),
            ));
        }
        if channel_data.truncate_wave {
            channel_data.reconstructed_waveform.truncate(reconstructed_pos);
            channel_data.sample_type.truncate(reconstructed_pos);
        }

        event.event_size += cursor.position() - sub_event_begin;

        if last_channel {
            slot.commit();
            self.new_event.store(true, Ordering::Release);
        }
        // Sub-events before the last keep writing into the same slot: the
        // guard drop leaves the cursor in place.
        Ok(())
    }

    fn decode_waveform(cursor: &mut Cursor<'_>, waveform: &mut Vec<u16>) -> Result<()> {
        let mut word = BitField(cursor.read_word()?);
        let waveform_words = word.low(12) as usize;
        word.skip_low(51);
        let truncated = word.low_flag();
        debug_assert!(word.exhausted());

        if truncated {
            warn!("unexpected truncated waveform");
        }

        let n_samples = waveform_words * SAMPLES_PER_WORD;
        wire::resize_in_place(waveform, n_samples);
        for index in 0..waveform_words {
            let word = cursor.read_word()?;
            let first = index * SAMPLES_PER_WORD;
            wire::unpack_u16_samples(word, &mut waveform[first..first + SAMPLES_PER_WORD]);
        }
        Ok(())
    }
}

impl Endpoint for DppZle {
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
        let channels = &event.channel_data;
        while let Some(field) = projector.next_field() {
            match field {
                ZleField::Timestamp => projector.put_scalar(event.timestamp)?,
                ZleField::TimestampNs => projector
                    .put_scalar(event.timestamp as f64 * self.params.sampling_period_ns())?,
                ZleField::RecordLength => projector.put_scalar(event.record_length)?,
                ZleField::TruncateWave => projector
                    .put_array_iter(channels.iter().map(|c| Scalar::Bool(c.truncate_wave)))?,
                ZleField::TruncateParam => projector
                    .put_array_iter(channels.iter().map(|c| Scalar::Bool(c.truncate_param)))?,
                ZleField::WaveformDefvalue => projector.put_array_iter(
                    channels.iter().map(|c| Scalar::U64(c.waveform_defvalue.into())),
                )?,
                ZleField::ChunkNumber => projector.put_array_iter(
                    channels.iter().map(|c| Scalar::U64(c.chunk_size.len() as u64)),
                )?,
                ZleField::ChunkTime => {
                    projector.put_matrix(channels.iter().map(|c| ArraySrc::from(&c.chunk_time)))?
                }
                ZleField::ChunkSize => {
                    projector.put_matrix(channels.iter().map(|c| ArraySrc::from(&c.chunk_size)))?
                }
                ZleField::ChunkBegin => {
                    projector.put_matrix(channels.iter().map(|c| ArraySrc::from(&c.chunk_begin)))?
                }
                ZleField::Waveform => {
                    projector.put_matrix(channels.iter().map(|c| ArraySrc::from(&c.waveform)))?
                }
                ZleField::ReconstructedWaveform => projector.put_matrix(
                    channels.iter().map(|c| ArraySrc::from(&c.reconstructed_waveform)),
                )?,
                ZleField::SampleType => {
                    projector.put_matrix(channels.iter().map(|c| ArraySrc::from(&c.sample_type)))?
                }
                ZleField::ReconstructedWaveformSize => projector.put_array_iter(
                    channels
                        .iter()
                        .map(|c| Scalar::U64(c.reconstructed_waveform.len() as u64)),
                )?,
                ZleField::BoardFail => projector.put_scalar(event.board_fail)?,
                ZleField::AggregateCounter => projector.put_scalar(event.aggregate_counter)?,
                ZleField::Flush => projector.put_scalar(event.flush)?,
                ZleField::EventSize => projector.put_scalar(event.event_size)?,
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
        self.clear_flag.request();
        self.new_event.store(true, Ordering::Release);
        self.ring.invalidate();
        Ok(())
    }
}

impl SwEndpoint for DppZle {
    fn resize(&self) -> Result<()> {
        if decode_disabled(&*self.params)? {
            self.ring.apply_all(|event| {
                event.counters = Vec::new();
                for channel in &mut event.channel_data {
                    channel.free();
                }
            });
            self.clear_flag.take();
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
            event.record_length = record_length;
            wire::reserve_total(&mut event.counters, MAX_N_COUNTERS);
            for (channel, &enabled) in itertools::zip_eq(&mut event.channel_data, &enabled) {
                if enabled {
                    wire::reserve_total(&mut channel.chunk_time, MAX_N_COUNTERS / 2 + 1);
                    wire::reserve_total(&mut channel.chunk_size, MAX_N_COUNTERS / 2 + 1);
                    wire::reserve_total(&mut channel.chunk_begin, MAX_N_COUNTERS / 2 + 1);
                    wire::reserve_total(&mut channel.waveform, MAX_WAVEFORM_SAMPLES);
                    wire::reserve_total(&mut channel.reconstructed_waveform, record_length);
                    wire::reserve_total(&mut channel.sample_type, record_length);
                } else {
                    channel.free();
                }
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

    fn zle(n_channels: usize, record_length: usize) -> Arc<DppZle> {
        let endpoint = DppZle::new(
            31,
            stub(StubParams {
                n_channels,
                sampling_period_ns: 8.0,
                active_endpoint: "dppzle".to_owned(),
                ..Default::default()
            }),
        );
        endpoint
            .ring
            .apply_all(|event| event.record_length = record_length);
        endpoint
    }

    fn aggregate_event(words: &[u64]) -> Vec<u8> {
        let n_words = (1 + words.len()) as u32;
        let mut all = vec![header_word(0b0010, 0x00_0001, n_words)];
        all.extend_from_slice(words);
        to_bytes(&all)
    }

    /// First sub-event word, LSB-first: timestamp(48), tbd(7),
    /// last_channel(1), channel(7), last_word(1)=0.
    fn first_word(timestamp: u64, last_channel: bool, channel: u8) -> u64 {
        timestamp | (u64::from(last_channel) << 55) | (u64::from(channel) << 56)
    }

    fn counter_bits(size: u32, counters_truncated: bool, wave_truncated: bool, last: bool) -> u64 {
        u64::from(size)
            | (u64::from(counters_truncated) << 28)
            | (u64::from(wave_truncated) << 29)
            | (u64::from(last) << 30)
    }

    /// Second sub-event word: first counter(32 incl. tbd), then
    /// even_counters_good(1), tbd(3), defvalue(16), tbd(10),
    /// has_waveform(1), last_word(1).
    fn second_word(
        counter: u64,
        even_counters_good: bool,
        defvalue: u16,
        has_waveform: bool,
        last_word: bool,
    ) -> u64 {
        counter
            | (u64::from(even_counters_good) << 32)
            | (u64::from(defvalue) << 36)
            | (u64::from(has_waveform) << 62)
            | (u64::from(last_word) << 63)
    }

    fn counters_word(low: u64, high: Option<u64>, last_word: bool) -> u64 {
        low | high.map_or(0, |h| h << 32) | (u64::from(last_word) << 63)
    }

    fn pack4(samples: [u16; 4]) -> u64 {
        samples
            .iter()
            .enumerate()
            .fold(0u64, |word, (i, &s)| word | (u64::from(s) << (16 * i)))
    }

    fn read_record(
        endpoint: &DppZle,
    ) -> (u64, Vec<Vec<u16>>, Vec<Vec<u8>>, Vec<Vec<usize>>, Vec<Vec<usize>>) {
        endpoint
            .set_data_format(
                r#"[
                    {"name":"TIMESTAMP","type":"U64"},
                    {"name":"RECONSTRUCTED_WAVEFORM","type":"U16","dim":2},
                    {"name":"SAMPLE_TYPE","type":"U8","dim":2},
                    {"name":"CHUNK_SIZE","type":"SIZE_T","dim":2},
                    {"name":"CHUNK_TIME","type":"SIZE_T","dim":2}
                ]"#,
            )
            .unwrap();
        let mut timestamp = 0u64;
        let mut reconstructed: Vec<Vec<u16>> = Vec::new();
        let mut sample_type: Vec<Vec<u8>> = Vec::new();
        let mut chunk_size: Vec<Vec<usize>> = Vec::new();
        let mut chunk_time: Vec<Vec<usize>> = Vec::new();
        {
            let mut slots = [
                Slot::u64(&mut timestamp),
                Slot::mat_u16(&mut reconstructed),
                Slot::mat_u8(&mut sample_type),
                Slot::mat_size(&mut chunk_size),
                Slot::mat_size(&mut chunk_time),
            ];
            endpoint
                .read_data(Some(Duration::ZERO), &mut slots)
                .unwrap();
        }
        (timestamp, reconstructed, sample_type, chunk_size, chunk_time)
    }

    #[test]
    fn test_good_bad_reconstruction() {
        // Record length 8: good chunk of 4 samples, then a suppressed chunk
        // of 4 filled with the default value.
        let endpoint = zle(1, 8);
        let event = aggregate_event(&[
            first_word(0x77, true, 0),
            second_word(
                counter_bits(4, false, false, false),
                true, // even counters (0th, ...) are good
                0xAAAA,
                true,
                false,
            ),
            counters_word(counter_bits(4, false, false, true), None, true),
            // waveform: one word, 4 samples
            1,
            pack4([10, 20, 30, 40]),
        ]);
        endpoint.decode(&event).unwrap();

        let (timestamp, reconstructed, sample_type, chunk_size, chunk_time) =
            read_record(&endpoint);
        assert_eq!(timestamp, 0x77);
        assert_eq!(
            reconstructed[0],
            vec![10, 20, 30, 40, 0xAAAA, 0xAAAA, 0xAAAA, 0xAAAA]
        );
        assert_eq!(sample_type[0], vec![1, 1, 1, 1, 0, 0, 0, 0]);
        assert_eq!(chunk_size[0], vec![4]);
        assert_eq!(chunk_time[0], vec![0]);
    }

    #[test]
    fn test_good_chunk_sum_matches_reconstruction() {
        // Bad 4, good 4: odd counters good.
        let endpoint = zle(1, 8);
        let event = aggregate_event(&[
            first_word(1, true, 0),
            second_word(
                counter_bits(4, false, false, false),
                false, // odd counters are the good ones
                0x1111,
                true,
                false,
            ),
            counters_word(counter_bits(4, false, false, true), None, true),
            1,
            pack4([5, 6, 7, 8]),
        ]);
        endpoint.decode(&event).unwrap();

        let (_, reconstructed, sample_type, chunk_size, chunk_time) = read_record(&endpoint);
        assert_eq!(
            reconstructed[0],
            vec![0x1111, 0x1111, 0x1111, 0x1111, 5, 6, 7, 8]
        );
        assert_eq!(sample_type[0], vec![0, 0, 0, 0, 1, 1, 1, 1]);
        let good_total: usize = chunk_size[0].iter().sum();
        assert_eq!(good_total, 4);
        assert_eq!(chunk_time[0], vec![4]);
    }

    #[test]
    fn test_multi_channel_commit_on_last_channel() {
        let endpoint = zle(2, 4);
        let sub_event = |channel: u8, last: bool, sample: u16| {
            vec![
                first_word(9, last, channel),
                second_word(counter_bits(4, false, false, true), true, 0, true, true),
                1,
                pack4([sample; 4]),
            ]
        };
        // First sub-event alone does not commit.
        endpoint
            .decode(&aggregate_event(&sub_event(0, false, 1)))
            .unwrap();
        assert!(matches!(
            endpoint.has_data(Some(Duration::ZERO)),
            Err(Error::Timeout)
        ));
        // The last-channel sub-event completes the record.
        endpoint
            .decode(&aggregate_event(&sub_event(1, true, 2)))
            .unwrap();
        let (_, reconstructed, ..) = read_record(&endpoint);
        assert_eq!(reconstructed[0], vec![1, 1, 1, 1]);
        assert_eq!(reconstructed[1], vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_truncated_counters_demote_samples_to_bad() {
        let endpoint = zle(1, 4);
        let event = aggregate_event(&[
            first_word(0, true, 0),
            second_word(
                counter_bits(4, true, false, true),
                true,
                0,
                true,
                true,
            ),
            1,
            pack4([1, 2, 3, 4]),
        ]);
        endpoint.decode(&event).unwrap();
        let (_, reconstructed, sample_type, ..) = read_record(&endpoint);
        assert_eq!(reconstructed[0], vec![1, 2, 3, 4]);
        // Good chunk, but its counters were truncated.
        assert_eq!(sample_type[0], vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_wave_truncation_shortens_reconstruction() {
        // Record length 8, but the only chunk covers 4 samples and carries
        // the wave-truncated flag.
        let endpoint = zle(1, 8);
        let event = aggregate_event(&[
            first_word(0, true, 0),
            second_word(
                counter_bits(4, false, true, true),
                true,
                0,
                true,
                true,
            ),
            1,
            pack4([1, 2, 3, 4]),
        ]);
        endpoint.decode(&event).unwrap();
        let (_, reconstructed, sample_type, ..) = read_record(&endpoint);
        assert_eq!(reconstructed[0], vec![1, 2, 3, 4]);
        assert_eq!(sample_type[0].len(), 4);
    }

    #[test]
    fn test_chunk_overrun_is_an_error() {
        let endpoint = zle(1, 2);
        let event = aggregate_event(&[
            first_word(0, true, 0),
            second_word(counter_bits(4, false, false, true), true, 0, true, true),
            1,
            pack4([1, 2, 3, 4]),
        ]);
        assert!(endpoint.decode(&event).is_err());
    }
}
