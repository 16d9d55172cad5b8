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

//! UDP streaming receiver ("rawudp" endpoint). Each datagram carries payload
//! words plus an 8-byte trailer with a buffer id, a rolling hash and
//! aligned/last flags. UDP gives no ordering or delivery guarantee; the
//! trailer's implicit datagram counter, salted into a DJB2a hash of the
//! payload, provides ordering verification and loss detection without
//! retransmits.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::endpoint::BoolGetter;
use crate::endpoint::Endpoint;
use crate::endpoint::HwEndpoint;
use crate::endpoint::Params;
use crate::endpoint::SizeGetter;
use crate::endpoint::SwEndpoint;
use crate::endpoint::hw;
use crate::endpoint::hw::HwShared;
use crate::endpoint::hw::RunState;
use crate::format::FormatField;
use crate::format::Schema;
use crate::format::WireType;
use crate::handle::NodeId;
use crate::prelude::*;
use crate::sink::ArraySrc;
use crate::sink::Projector;
use crate::sink::Slot;
use crate::url::UrlData;
use crate::wire;
use crate::wire::BitField;

const RING_SLOTS: usize = 4;

pub const TRAILER_SIZE: usize = 8;
/// Largest datagram the device may emit; payloads are further limited to a
/// whole number of 64-bit words.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

const DATAGRAM_ID_MASK: u32 = (1 << 24) - 1;
const RECV_POLL: Duration = Duration::from_millis(100);

/// Register polled at construction until the device has latched our UDP
/// source port.
const PORT_LATCH_REGISTER: &str = "0x8014";
const PORT_LATCH_ATTEMPTS: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawUdpField {
    Data,
    Size,
    BufferId,
    Flush,
}

impl FormatField for RawUdpField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "DATA" => Some(Self::Data),
            "SIZE" => Some(Self::Size),
            "BUFFER_ID" => Some(Self::BufferId),
            "FLUSH" => Some(Self::Flush),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Data => "DATA",
            Self::Size => "SIZE",
            Self::BufferId => "BUFFER_ID",
            Self::Flush => "FLUSH",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Data => 1,
            _ => 0,
        }
    }
}

/// Decoded datagram trailer. Bit layout from the LSB: `last:1`,
/// `n_words:13`, `aligned:1`, `hash:32`, `reserved:1`, `buffer_id:16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Trailer {
    pub buffer_id: u16,
    pub hash: u32,
    pub aligned: bool,
    pub n_words: u16,
    pub last: bool,
}

pub(crate) fn parse_trailer(raw: u64) -> Trailer {
    let mut word = BitField(raw);
    let last = word.low_flag();
    let n_words = word.low(13) as u16;
    let aligned = word.low_flag();
    let hash = word.low(32) as u32;
    word.skip_low(1);
    let buffer_id = word.low(16) as u16;
    debug_assert!(word.exhausted());
    Trailer {
        buffer_id,
        hash,
        aligned,
        n_words,
        last,
    }
}

/// What the receiver should do with an assessed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Lost or corrupted mid-buffer datagram that cannot be salvaged.
    Discard,
    Accept {
        /// The partial accumulation belongs to a buffer whose tail was lost.
        drop_partial: bool,
        /// Complete the current buffer even though this datagram is not
        /// flagged `last`.
        flush: bool,
    },
}

/// Ordering/loss bookkeeping across datagrams of one socket.
#[derive(Debug, Default)]
pub(crate) struct DatagramTracker {
    last_accepted: Option<(Trailer, u32)>,
}

impl DatagramTracker {
    /// Hash of the expected datagram counter followed by the high 32-bit
    /// half-word of every payload word.
    fn hash_matches(payload: &[u8], counter: u32, expected: u32) -> bool {
        debug_assert_eq!(payload.len() % wire::WORD_SIZE, 0);
        let halves = payload.chunks_exact(wire::WORD_SIZE).map(|word| {
            u32::from_le_bytes([word[4], word[5], word[6], word[7]])
        });
        wire::djb2a(std::iter::once(counter).chain(halves)) == expected
    }

    /// Assess one datagram. `pending_clear` tells whether the receiver is
    /// already going to reset its accumulation.
    pub fn assess(&mut self, payload: &[u8], pending_clear: bool, trailer: Trailer) -> Verdict {
        let mut drop_partial = false;
        let mut flush = false;
        let mut expected_id = 0u32;

        match &self.last_accepted {
            Some((last, last_id)) => {
                let expected_buffer = if last.last {
                    last.buffer_id.wrapping_add(1)
                } else {
                    last.buffer_id
                };
                if trailer.buffer_id == expected_buffer {
                    expected_id = if last.last {
                        0
                    } else {
                        (last_id + 1) & DATAGRAM_ID_MASK
                    };
                } else {
                    // The tail of the previous buffer was lost; restart.
                    debug!(
                        buffer_id = trailer.buffer_id,
                        expected_buffer, "datagrams of the previous buffer lost"
                    );
                    drop_partial = true;
                }
                if !last.last
                    && last.aligned
                    && payload.is_empty()
                    && !pending_clear
                    && !drop_partial
                {
                    // The previous datagram completed an aligned buffer that
                    // was never flagged last; an empty follow-up flushes it.
                    debug!("flushing aligned buffer on empty datagram");
                    flush = true;
                }
            }
            None => {
                drop_partial = true;
            }
        }

        if !Self::hash_matches(payload, expected_id, trailer.hash) {
            if trailer.buffer_id == 0 && Self::hash_matches(payload, 0, trailer.hash) {
                // Counters restarted from zero: a device-side clear happened
                // mid-stream.
                debug!("counters reset, accepting as mid-stream reset");
                expected_id = 0;
            } else if payload.is_empty() {
                // Unverifiable empty datagram; keep it with the counter
                // forced to zero so the clearing handshake still sees it.
                expected_id = 0;
            } else {
                debug!(
                    buffer_id = trailer.buffer_id,
                    expected_id, "datagram lost or bad hash, discarding"
                );
                return Verdict::Discard;
            }
        }

        self.last_accepted = Some((trailer, expected_id));
        Verdict::Accept {
            drop_partial,
            flush,
        }
    }
}

pub struct RawUdpEndpoint {
    node: NodeId,
    shared: Arc<HwShared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    decoder: Mutex<Option<JoinHandle<()>>>,
    max_size_getter: Mutex<Option<SizeGetter>>,
    is_decoded_getter: Mutex<Option<BoolGetter>>,
    schema: Mutex<Schema<RawUdpField>>,
}

impl RawUdpEndpoint {
    /// Bind and "connect" the UDP socket, expose the local port to the
    /// device, and consume the first barrier with a clear.
    pub fn new(
        node: NodeId,
        address: IpAddr,
        port: u16,
        options: &UrlData,
        params: &Arc<dyn Params>,
        label: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let label = label.into();
        if address.is_ipv6() {
            return Err(Error::InvalidArgument(
                "rawudp endpoint does not support IPv6".into(),
            ));
        }

        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(SocketAddr::new(address, port))?;
        socket.set_read_timeout(Some(RECV_POLL))?;

        if let Some(rcvbuf) = options.rcvbuf {
            let sock_ref = socket2::SockRef::from(&socket);
            debug!(rcvbuf, "overriding socket receive buffer size");
            sock_ref.set_recv_buffer_size(rcvbuf)?;
        }

        let shared = HwShared::new(label.clone(), RING_SLOTS);

        let endpoint = Arc::new(Self {
            node,
            shared: Arc::clone(&shared),
            receiver: Mutex::new(None),
            decoder: Mutex::new(None),
            max_size_getter: Mutex::new(None),
            is_decoded_getter: Mutex::new(None),
            schema: Mutex::new(Self::default_schema()),
        });

        let affinity = options.receiver_thread_affinity;
        let thread_socket = socket.try_clone()?;
        let receiver = thread::Builder::new()
            .name(format!("{label}-receiver"))
            .spawn(move || {
                if let Some(cpu) = affinity {
                    set_thread_affinity(cpu);
                }
                if let Err(err) = receiver_loop(thread_socket, &shared) {
                    if shared.shutting_down.load(Ordering::Acquire) {
                        debug!(label = %shared.label, "receiver stopped: {err}");
                    } else {
                        error!(label = %shared.label, "receiver failed: {err}");
                    }
                }
            })
            .expect("spawning receiver thread");
        *endpoint.receiver.lock().unwrap() = Some(receiver);

        // The device learns our source address from traffic: send empty
        // datagrams until it reports the latched port.
        let mut latched = false;
        for _ in 0..PORT_LATCH_ATTEMPTS {
            socket.send(&[])?;
            thread::sleep(Duration::from_millis(10));
            if params.value_with_arg("/par/registermisc", PORT_LATCH_REGISTER)? != "0" {
                latched = true;
                break;
            }
        }
        if !latched {
            return Err(Error::Communication(
                "device did not latch the UDP data port".into(),
            ));
        }

        hw::clear_data(&endpoint.shared, &endpoint.decoder);

        Ok(endpoint)
    }

    pub fn default_schema() -> Schema<RawUdpField> {
        Schema::of(&[
            (RawUdpField::Data, WireType::U8),
            (RawUdpField::Size, WireType::SizeT),
        ])
    }
}

#[cfg(target_os = "linux")]
fn set_thread_affinity(cpu: usize) {
    let mut set = nix::sched::CpuSet::new();
    if set.set(cpu).is_ok() {
        if let Err(err) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
            warn!("setting receiver thread affinity failed: {err}");
        } else {
            debug!(cpu, "receiver thread affinity set");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_affinity(_cpu: usize) {
    warn!("receiver thread affinity is only supported on Linux");
}

fn receiver_loop(socket: UdpSocket, shared: &HwShared) -> Result<()> {
    let mut datagram = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut tracker = DatagramTracker::default();
    let mut clear_buffer = false;

    loop {
        if shared.shutting_down.load(Ordering::Acquire) {
            return Ok(());
        }
        let received = match socket.recv(&mut datagram) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if received < TRAILER_SIZE {
            warn!(received, "runt datagram");
            continue;
        }

        let trailer = parse_trailer(u64::from_le_bytes(
            datagram[received - TRAILER_SIZE..received].try_into().unwrap(),
        ));
        trace!(?trailer, received, "datagram");

        let data_size = usize::from(trailer.n_words) * wire::WORD_SIZE;
        if data_size > received - TRAILER_SIZE {
            return Err(Error::Communication(format!(
                "datagram advertises {data_size} payload bytes in {received}"
            )));
        }
        let payload = &datagram[..data_size];

        let verdict = tracker.assess(payload, clear_buffer, trailer);
        let flush = match verdict {
            Verdict::Discard => continue,
            Verdict::Accept {
                drop_partial,
                flush,
            } => {
                if drop_partial {
                    clear_buffer = true;
                }
                flush
            }
        };

        // An empty datagram is the firmware's end-of-data/clear marker.
        if data_size == 0 {
            if shared.state.is(RunState::ClearingReceiver) {
                debug!(label = %shared.label, "barrier datagram");
                clear_buffer = true;
                shared.state.set(RunState::Idle);
                continue;
            }
            if !flush {
                continue;
            }
        }

        shared.state.wait_until(|state| {
            matches!(state, RunState::Ready | RunState::ClearingReceiver)
        });

        let mut slot = shared.ring.acquire_write();
        if std::mem::take(&mut clear_buffer) {
            slot.reset();
        }

        if !payload.is_empty() {
            let offset = slot.data.len();
            wire::resize_in_place(&mut slot.data, offset + payload.len());
            slot.data[offset..].copy_from_slice(payload);
        }

        if trailer.last || flush {
            if shared.state.is(RunState::ClearingReceiver) {
                debug!(label = %shared.label, "discarding buffer received while clearing");
                clear_buffer = true;
                continue;
            }
            slot.buffer_id = trailer.buffer_id;
            slot.flush = flush;
            slot.n_events = 0;
            debug!(label = %shared.label, size = slot.data.len(), "buffer completed");
            slot.commit();
            clear_buffer = true;
        }
    }
}

impl Endpoint for RawUdpEndpoint {
    fn node(&self) -> NodeId {
        self.node
    }

    fn set_data_format(&self, json: &str) -> Result<()> {
        *self.schema.lock().unwrap() = Schema::parse(json)?;
        Ok(())
    }

    fn read_data(&self, timeout: Option<Duration>, slots: &mut [Slot<'_>]) -> Result<()> {
        if self.shared.decoder_active.load(Ordering::Acquire) {
            return Err(Error::NotEnabled);
        }
        let slot = self.shared.ring.acquire_read(timeout).ok_or(Error::Timeout)?;
        let schema = self.schema.lock().unwrap();
        let mut projector = Projector::new(&schema, slots)?;
        while let Some(field) = projector.next_field() {
            match field {
                RawUdpField::Data => projector.put_array(ArraySrc::from(&slot.data))?,
                RawUdpField::Size => projector.put_scalar(slot.data.len())?,
                RawUdpField::BufferId => projector.put_scalar(slot.buffer_id)?,
                RawUdpField::Flush => projector.put_scalar(slot.flush)?,
            }
        }
        drop(schema);
        slot.commit();
        Ok(())
    }

    fn has_data(&self, timeout: Option<Duration>) -> Result<()> {
        let _slot = self.shared.ring.acquire_read(timeout).ok_or(Error::Timeout)?;
        Ok(())
    }

    fn clear_data(&self) -> Result<()> {
        hw::clear_data(&self.shared, &self.decoder);
        Ok(())
    }
}

impl HwEndpoint for RawUdpEndpoint {
    fn register_sw_endpoint(&self, endpoint: Arc<dyn SwEndpoint>) {
        self.shared.register_sw_endpoint(endpoint);
    }

    fn arm_acquisition(&self) -> Result<()> {
        hw::arm_acquisition(
            &self.shared,
            &self.decoder,
            &self.max_size_getter,
            &self.is_decoded_getter,
        )
    }

    fn disarm_acquisition(&self) -> Result<()> {
        Ok(())
    }

    fn pending_stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.stop_pending)
    }

    fn set_max_size_getter(&self, getter: SizeGetter) {
        *self.max_size_getter.lock().unwrap() = Some(getter);
    }

    fn set_is_decoded_getter(&self, getter: BoolGetter) {
        *self.is_decoded_getter.lock().unwrap() = Some(getter);
    }
}

impl Drop for RawUdpEndpoint {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        hw::close_decoder(&self.shared, &self.decoder);
        self.shared.state.set(RunState::ClearingReceiver);
        self.shared.ring.invalidate();
        if let Some(receiver) = self.receiver.lock().unwrap().take() {
            if receiver.join().is_err() {
                error!("receiver thread panicked");
            }
        }
    }
}
