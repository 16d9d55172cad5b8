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

//! State machine and dispatcher shared by the TCP and UDP hardware
//! endpoints. The transports differ only in how bytes arrive; the run-state
//! coordination, the byte ring toward the decoder thread, and the
//! event-dispatch loop are identical.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;

use crate::endpoint::BoolGetter;
use crate::endpoint::SizeGetter;
use crate::endpoint::SwEndpoint;
use crate::endpoint::sw;
use crate::prelude::*;
use crate::ring::Ring;
use crate::wire;

/// Hardware endpoint run state.
///
/// `init` only exists between construction and the first barrier;
/// `clearing_receiver` discards socket data until the device's zero-length
/// barrier packet, which transitions to `idle`. The receiver only appends to
/// buffers in `ready` (or while draining in `clearing_receiver`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Init,
    Idle,
    ClearingReceiver,
    DecoderStarted,
    QuittingDecoder,
    Ready,
}

pub(crate) struct StateCell {
    state: Mutex<RunState>,
    cv: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Init),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self, state: RunState) {
        debug!(?state, "set state");
        *self.state.lock().unwrap() = state;
        self.cv.notify_all();
    }

    pub fn is(&self, state: RunState) -> bool {
        *self.state.lock().unwrap() == state
    }

    pub fn wait_until(&self, pred: impl Fn(RunState) -> bool) -> RunState {
        let mut state = self.state.lock().unwrap();
        while !pred(*state) {
            state = self.cv.wait(state).unwrap();
        }
        *state
    }
}

/// One buffer handed from the receiver to the decoder thread (or, for a raw
/// pipeline, directly to the consumer). `n_events` is only meaningful on the
/// TCP transport; the UDP transport carries `buffer_id`/`flush` instead.
#[derive(Debug, Default)]
pub struct RawBuffer {
    pub data: Vec<u8>,
    pub n_events: u32,
    pub buffer_id: u16,
    pub flush: bool,
}

impl RawBuffer {
    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.n_events = 0;
        self.buffer_id = 0;
        self.flush = false;
    }
}

/// State shared between the endpoint handle, its receiver thread and its
/// decoder thread.
pub(crate) struct HwShared {
    pub label: String,
    pub ring: Ring<RawBuffer>,
    pub state: StateCell,
    pub stop_pending: Arc<AtomicBool>,
    pub decoder_active: AtomicBool,
    pub shutting_down: AtomicBool,
    pub sw_endpoints: Mutex<Vec<Arc<dyn SwEndpoint>>>,
}

impl HwShared {
    pub fn new(label: impl Into<String>, ring_slots: usize) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            ring: Ring::new(ring_slots),
            state: StateCell::new(),
            stop_pending: Arc::new(AtomicBool::new(false)),
            decoder_active: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            sw_endpoints: Mutex::new(Vec::new()),
        })
    }

    pub fn register_sw_endpoint(&self, endpoint: Arc<dyn SwEndpoint>) {
        self.sw_endpoints.lock().unwrap().push(endpoint);
    }
}

/// Cancel primitive: stop the decoder thread (if any), discard everything
/// until the device's next barrier packet, and come back to `idle`.
pub(crate) fn clear_data(shared: &HwShared, decoder: &Mutex<Option<JoinHandle<()>>>) {
    close_decoder(shared, decoder);
    shared.stop_pending.store(false, Ordering::Release);
    shared.state.set(RunState::ClearingReceiver);
    // Wakes a receiver pending in a ring commit.
    shared.ring.invalidate();
    debug!(label = %shared.label, "waiting for idle");
    shared.state.wait_until(|state| state == RunState::Idle);
    debug!(label = %shared.label, "clear completed");
}

/// Arm sequence: clear, pre-reserve every buffer from the device
/// configuration, start the decoder thread when a decoded endpoint is the
/// active one, then go `ready`.
pub(crate) fn arm_acquisition(
    shared: &Arc<HwShared>,
    decoder: &Mutex<Option<JoinHandle<()>>>,
    max_size_getter: &Mutex<Option<SizeGetter>>,
    is_decoded_getter: &Mutex<Option<BoolGetter>>,
) -> Result<()> {
    clear_data(shared, decoder);

    let max_size = match &*max_size_getter.lock().unwrap() {
        Some(getter) => getter()?,
        None => 0,
    };
    shared.ring.apply_all(|buffer| {
        wire::reserve_total(&mut buffer.data, max_size);
        buffer.reset();
    });
    let endpoints = shared.sw_endpoints.lock().unwrap().clone();
    for endpoint in &endpoints {
        endpoint.resize()?;
    }

    let is_decoded = match &*is_decoded_getter.lock().unwrap() {
        Some(getter) => getter()?,
        None => false,
    };
    if is_decoded {
        start_decoder(shared, decoder);
    }

    shared.state.set(RunState::Ready);
    Ok(())
}

fn start_decoder(shared: &Arc<HwShared>, decoder: &Mutex<Option<JoinHandle<()>>>) {
    let mut decoder = decoder.lock().unwrap();
    assert!(decoder.is_none(), "decoder thread already running");

    shared.decoder_active.store(true, Ordering::Release);
    let thread_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("{}-decoder", shared.label))
        .spawn(move || {
            if let Err(err) = decoder_loop(&thread_shared) {
                error!(label = %thread_shared.label, "decoder failed: {err}");
            }
            debug!(label = %thread_shared.label, "decoder thread done");
        })
        .expect("spawning decoder thread");
    *decoder = Some(handle);

    shared
        .state
        .wait_until(|state| state == RunState::DecoderStarted);

    // A consumer may still be blocked in a raw read_data from before the
    // decoder became active. Unblock it with a fake empty buffer; from now on
    // the decoder-active check rejects raw reads up front.
    if shared.ring.is_read_pending() {
        debug!(label = %shared.label, "unblocking a pending raw read with an empty buffer");
        shared.ring.fake_write(RawBuffer::reset);
        shared.ring.wait_empty();
    }
}

/// Join the decoder thread: move to `quitting_decoder`, wake commits pending
/// in the decoder rings, and feed the decoder a fake empty buffer so its ring
/// wait returns.
pub(crate) fn close_decoder(shared: &HwShared, decoder: &Mutex<Option<JoinHandle<()>>>) {
    let Some(handle) = decoder.lock().unwrap().take() else {
        return;
    };

    shared.state.set(RunState::QuittingDecoder);

    let endpoints = shared.sw_endpoints.lock().unwrap().clone();
    for endpoint in &endpoints {
        if let Err(err) = endpoint.clear_data() {
            warn!("clear_data during decoder shutdown failed: {err}");
        }
    }

    shared.ring.fake_write(RawBuffer::reset);

    if handle.join().is_err() {
        error!(label = %shared.label, "decoder thread panicked");
    }
    shared.decoder_active.store(false, Ordering::Release);
}

/// The decoder thread: drain the byte ring, dispatch each self-describing
/// event to every software endpoint, and fan out stop sentinels when the
/// events decoder saw a stop.
pub(crate) fn decoder_loop(shared: &HwShared) -> Result<()> {
    shared.state.set(RunState::DecoderStarted);
    shared
        .state
        .wait_until(|state| matches!(state, RunState::Ready | RunState::QuittingDecoder));

    let endpoints = shared.sw_endpoints.lock().unwrap().clone();

    'outer: loop {
        if shared.state.is(RunState::QuittingDecoder) {
            break;
        }

        let buffer = shared
            .ring
            .acquire_read(None)
            .expect("infinite acquire_read");

        if buffer.data.is_empty() {
            // Fake buffers wake the thread for state changes.
            buffer.commit();
            continue;
        }

        let data = &buffer.data;
        let mut offset = 0;
        let mut dispatched = 0u32;
        while offset < data.len() {
            if shared.state.is(RunState::QuittingDecoder) {
                break 'outer;
            }
            let remaining = data.len() - offset;
            if remaining < wire::WORD_SIZE {
                return Err(Error::Internal(format!(
                    "not enough bytes for an event header ({remaining} left)"
                )));
            }
            let header = sw::peek_header(&data[offset..])?;
            if header.n_words == 0 {
                return Err(Error::Internal("event with zero length".into()));
            }
            let event_size = sw::event_byte_len(&header);
            if event_size > remaining {
                return Err(Error::Internal(format!(
                    "event of {event_size} bytes overruns buffer ({remaining} left)"
                )));
            }

            let event = &data[offset..offset + event_size];
            for endpoint in &endpoints {
                endpoint.decode(event)?;
            }

            // The events endpoint may have latched a stop during decode.
            if shared.stop_pending.swap(false, Ordering::AcqRel) {
                debug!(label = %shared.label, "fanning out stop to all decoders");
                for endpoint in &endpoints {
                    endpoint.stop()?;
                }
            }

            offset += event_size;
            dispatched += 1;
        }

        if buffer.n_events != 0 && dispatched != buffer.n_events {
            return Err(Error::Internal(format!(
                "buffer advertised {} events, dispatched {dispatched}",
                buffer.n_events
            )));
        }

        buffer.commit();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::endpoint::Endpoint;
    use crate::endpoint::events::SpecialEvents;
    use crate::endpoint::events::StopInfo;
    use crate::endpoint::events::testing::stop_event;
    use crate::endpoint::sw::testing::*;
    use crate::handle::INVALID_NODE;
    use crate::handle::NodeId;
    use crate::sink::Slot;

    use super::*;

    /// Records every event offered to it.
    #[derive(Default)]
    struct RecordingEndpoint {
        events: Mutex<Vec<Vec<u8>>>,
        stops: AtomicUsize,
    }

    impl Endpoint for RecordingEndpoint {
        fn node(&self) -> NodeId {
            INVALID_NODE
        }
        fn set_data_format(&self, _json: &str) -> Result<()> {
            Ok(())
        }
        fn read_data(&self, _timeout: Option<Duration>, _slots: &mut [Slot<'_>]) -> Result<()> {
            Ok(())
        }
        fn has_data(&self, _timeout: Option<Duration>) -> Result<()> {
            Ok(())
        }
        fn clear_data(&self) -> Result<()> {
            Ok(())
        }
    }

    impl SwEndpoint for RecordingEndpoint {
        fn resize(&self) -> Result<()> {
            Ok(())
        }
        fn decode(&self, event: &[u8]) -> Result<()> {
            self.events.lock().unwrap().push(event.to_vec());
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn run_decoder_on(shared: &Arc<HwShared>, buffers: Vec<Vec<u8>>) {
        let decoder: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
        {
            let mut slot = decoder.lock().unwrap();
            let thread_shared = Arc::clone(shared);
            *slot = Some(
                thread::Builder::new()
                    .spawn(move || {
                        if let Err(err) = decoder_loop(&thread_shared) {
                            error!("decoder failed: {err}");
                        }
                    })
                    .unwrap(),
            );
        }
        shared
            .state
            .wait_until(|state| state == RunState::DecoderStarted);
        shared.state.set(RunState::Ready);

        for data in buffers {
            let mut slot = shared.ring.acquire_write();
            slot.data.clear();
            slot.data.extend_from_slice(&data);
            slot.n_events = 0;
            slot.commit();
        }
        shared.ring.wait_empty();
        close_decoder(shared, &decoder);
    }

    #[test]
    fn test_dispatcher_advances_by_event_length() {
        let shared = HwShared::new("test", 3);
        let recorder = Arc::new(RecordingEndpoint::default());
        shared.register_sw_endpoint(recorder.clone());

        // Two events of different lengths in one buffer.
        let event_a = to_bytes(&[header_word(0b0001, 0, 2), 0xAAAA]);
        let event_b = to_bytes(&[header_word(0b0010, 0, 1)]);
        let mut buffer = event_a.clone();
        buffer.extend_from_slice(&event_b);

        run_decoder_on(&shared, vec![buffer]);

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], event_a);
        assert_eq!(events[1], event_b);
    }

    #[test]
    fn test_stop_event_fans_out_once() {
        let shared = HwShared::new("test", 3);
        let recorder = Arc::new(RecordingEndpoint::default());
        let events = SpecialEvents::new(Arc::clone(&shared.stop_pending));
        shared.register_sw_endpoint(recorder.clone());
        shared.register_sw_endpoint(events);

        let stop = stop_event(&StopInfo {
            timestamp: 42,
            dead_time: 1,
        });
        run_decoder_on(&shared, vec![stop]);

        assert_eq!(recorder.stops.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_zero_length_event_stops_decoding() {
        let shared = HwShared::new("test", 3);
        let recorder = Arc::new(RecordingEndpoint::default());
        shared.register_sw_endpoint(recorder.clone());

        let bad = to_bytes(&[header_word(0b0001, 0, 0)]);

        let decoder: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
        let thread_shared = Arc::clone(&shared);
        *decoder.lock().unwrap() = Some(
            thread::Builder::new()
                .spawn(move || {
                    assert!(decoder_loop(&thread_shared).is_err());
                })
                .unwrap(),
        );
        shared
            .state
            .wait_until(|state| state == RunState::DecoderStarted);
        shared.state.set(RunState::Ready);

        let mut slot = shared.ring.acquire_write();
        slot.data.extend_from_slice(&bad);
        slot.commit();

        decoder.lock().unwrap().take().unwrap().join().unwrap();
        assert!(recorder.events.lock().unwrap().is_empty());
    }
}
