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

//! Per-channel acquisition statistics, fed by the special (time/counter info)
//! hits of a DPP decoder and exposed as the decoder's `/stats` child
//! endpoint. Reads are snapshots; there is no ring and no blocking.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::endpoint::Params;
use crate::format::FormatField;
use crate::format::Schema;
use crate::format::WireType;
use crate::handle::NodeId;
use crate::prelude::*;
use crate::sink::Projector;
use crate::sink::Scalar;
use crate::sink::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsField {
    RealTime,
    RealTimeNs,
    DeadTime,
    DeadTimeNs,
    LiveTime,
    LiveTimeNs,
    TriggerCnt,
    SavedEventCnt,
}

impl FormatField for StatsField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "REAL_TIME" => Some(Self::RealTime),
            "REAL_TIME_NS" => Some(Self::RealTimeNs),
            "DEAD_TIME" => Some(Self::DeadTime),
            "DEAD_TIME_NS" => Some(Self::DeadTimeNs),
            "LIVE_TIME" => Some(Self::LiveTime),
            "LIVE_TIME_NS" => Some(Self::LiveTimeNs),
            "TRIGGER_CNT" => Some(Self::TriggerCnt),
            "SAVED_EVENT_CNT" => Some(Self::SavedEventCnt),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::RealTime => "REAL_TIME",
            Self::RealTimeNs => "REAL_TIME_NS",
            Self::DeadTime => "DEAD_TIME",
            Self::DeadTimeNs => "DEAD_TIME_NS",
            Self::LiveTime => "LIVE_TIME",
            Self::LiveTimeNs => "LIVE_TIME_NS",
            Self::TriggerCnt => "TRIGGER_CNT",
            Self::SavedEventCnt => "SAVED_EVENT_CNT",
        }
    }

    fn rank(self) -> u8 {
        1
    }
}

#[derive(Debug, Default)]
struct StatsData {
    real_time: Vec<u64>,
    dead_time: Vec<u64>,
    live_time: Vec<u64>,
    trigger_cnt: Vec<u32>,
    saved_event_cnt: Vec<u32>,
}

pub struct ChannelStats {
    node: NodeId,
    sampling_period_ns: f64,
    data: Mutex<StatsData>,
    schema: Mutex<Schema<StatsField>>,
}

impl ChannelStats {
    pub fn new(node: NodeId, params: &Arc<dyn Params>) -> Arc<Self> {
        let n_channels = params.n_channels();
        Arc::new(Self {
            node,
            sampling_period_ns: params.sampling_period_ns(),
            data: Mutex::new(StatsData {
                real_time: vec![0; n_channels],
                dead_time: vec![0; n_channels],
                live_time: vec![0; n_channels],
                trigger_cnt: vec![0; n_channels],
                saved_event_cnt: vec![0; n_channels],
            }),
            schema: Mutex::new(Self::default_schema()),
        })
    }

    pub fn default_schema() -> Schema<StatsField> {
        Schema::of(&[
            (StatsField::RealTime, WireType::U64),
            (StatsField::DeadTime, WireType::U64),
        ])
    }

    /// Fold one special hit into the per-channel counters. `timestamp` is the
    /// hit timestamp (the channel's real time).
    pub fn update(
        &self,
        channel: usize,
        timestamp: u64,
        dead_time: Option<u64>,
        counters: Option<(u32, u32)>,
    ) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if channel >= data.real_time.len() {
            return Err(Error::Internal(format!(
                "stats update for channel {channel} of {}",
                data.real_time.len()
            )));
        }
        data.real_time[channel] = timestamp;
        if let Some(dead_time) = dead_time {
            data.dead_time[channel] = dead_time;
            data.live_time[channel] = timestamp.saturating_sub(dead_time);
        }
        if let Some((trigger_cnt, saved_event_cnt)) = counters {
            data.trigger_cnt[channel] = trigger_cnt;
            data.saved_event_cnt[channel] = saved_event_cnt;
        }
        Ok(())
    }
}

impl Endpoint for ChannelStats {
    fn node(&self) -> NodeId {
        self.node
    }

    fn set_data_format(&self, json: &str) -> Result<()> {
        *self.schema.lock().unwrap() = Schema::parse(json)?;
        Ok(())
    }

    fn read_data(&self, _timeout: Option<Duration>, slots: &mut [Slot<'_>]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let schema = self.schema.lock().unwrap();
        let mut projector = Projector::new(&schema, slots)?;
        let period = self.sampling_period_ns;
        let to_ns = |ticks: &u64| Scalar::F64(*ticks as f64 * period);
        while let Some(field) = projector.next_field() {
            match field {
                StatsField::RealTime => projector.put_array(data.real_time.as_slice().into())?,
                StatsField::RealTimeNs => {
                    projector.put_array_iter(data.real_time.iter().map(to_ns))?
                }
                StatsField::DeadTime => projector.put_array(data.dead_time.as_slice().into())?,
                StatsField::DeadTimeNs => {
                    projector.put_array_iter(data.dead_time.iter().map(to_ns))?
                }
                StatsField::LiveTime => projector.put_array(data.live_time.as_slice().into())?,
                StatsField::LiveTimeNs => {
                    projector.put_array_iter(data.live_time.iter().map(to_ns))?
                }
                StatsField::TriggerCnt => {
                    projector.put_array(data.trigger_cnt.as_slice().into())?
                }
                StatsField::SavedEventCnt => {
                    projector.put_array(data.saved_event_cnt.as_slice().into())?
                }
            }
        }
        Ok(())
    }

    fn has_data(&self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn clear_data(&self) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.real_time.fill(0);
        data.dead_time.fill(0);
        data.live_time.fill(0);
        data.trigger_cnt.fill(0);
        data.saved_event_cnt.fill(0);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Fixed-configuration parameter source for decoder tests.
    pub struct StubParams {
        pub n_channels: usize,
        pub sampling_period_ns: f64,
        pub values: Vec<(String, String)>,
        pub active_endpoint: String,
    }

    impl Default for StubParams {
        fn default() -> Self {
            Self {
                n_channels: 2,
                sampling_period_ns: 8.0,
                values: Vec::new(),
                active_endpoint: "scope".to_owned(),
            }
        }
    }

    impl Params for StubParams {
        fn n_channels(&self) -> usize {
            self.n_channels
        }
        fn sampling_period_ns(&self) -> f64 {
            self.sampling_period_ns
        }
        fn value(&self, path: &str) -> Result<String> {
            self.values
                .iter()
                .find(|(key, _)| key == path)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| Error::Command(format!("no such parameter: {path}")))
        }
        fn value_with_arg(&self, path: &str, _arg: &str) -> Result<String> {
            self.value(path)
        }
        fn active_endpoint(&self) -> Result<String> {
            Ok(self.active_endpoint.clone())
        }
    }

    pub fn stub(params: StubParams) -> Arc<dyn Params> {
        Arc::new(params)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn stats() -> Arc<ChannelStats> {
        ChannelStats::new(
            7,
            &stub(StubParams {
                n_channels: 2,
                sampling_period_ns: 8.0,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_update_and_read() {
        let stats = stats();
        stats.update(1, 1000, Some(100), Some((5, 4))).unwrap();

        let mut real: Vec<u64> = Vec::new();
        let mut dead: Vec<u64> = Vec::new();
        let mut slots = [Slot::arr_u64(&mut real), Slot::arr_u64(&mut dead)];
        stats.read_data(None, &mut slots).unwrap();
        assert_eq!(real, vec![0, 1000]);
        assert_eq!(dead, vec![0, 100]);
    }

    #[test]
    fn test_live_time_and_ns_projection() {
        let stats = stats();
        stats.update(0, 1000, Some(250), None).unwrap();
        stats
            .set_data_format(
                r#"[{"name":"LIVE_TIME","type":"U64"},{"name":"REAL_TIME_NS","type":"DOUBLE"}]"#,
            )
            .unwrap();
        let mut live: Vec<u64> = Vec::new();
        let mut real_ns: Vec<f64> = Vec::new();
        let mut slots = [Slot::arr_u64(&mut live), Slot::arr_f64(&mut real_ns)];
        stats.read_data(None, &mut slots).unwrap();
        assert_eq!(live[0], 750);
        assert_eq!(real_ns[0], 8000.0);
    }

    #[test]
    fn test_clear_zeroes() {
        let stats = stats();
        stats.update(0, 1000, Some(250), Some((1, 1))).unwrap();
        stats.clear_data().unwrap();
        let mut real: Vec<u64> = Vec::new();
        let mut dead: Vec<u64> = Vec::new();
        let mut slots = [Slot::arr_u64(&mut real), Slot::arr_u64(&mut dead)];
        stats.read_data(None, &mut slots).unwrap();
        assert_eq!(real, vec![0, 0]);
        assert_eq!(dead, vec![0, 0]);
    }

    #[test]
    fn test_out_of_range_channel_rejected() {
        let stats = stats();
        assert!(stats.update(5, 0, None, None).is_err());
    }
}
