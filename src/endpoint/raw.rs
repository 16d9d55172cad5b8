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

//! TCP streaming receiver ("raw" endpoint). The device frames each burst
//! with a 13-byte little-endian header (payload size, event count, aligned
//! flag) and delimits acquisitions with zero-length barrier packets.
//! Bursts accumulate into one ring buffer until a frame arrives with the
//! aligned flag set, which completes the buffer toward the decoder thread
//! (or the raw consumer).

use std::io::Read;
use std::net::IpAddr;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpStream;
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
use crate::protocol;
use crate::sink::ArraySrc;
use crate::sink::Projector;
use crate::sink::Slot;
use crate::url::UrlData;
use crate::wire::Cursor;

const RING_SLOTS: usize = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawField {
    Data,
    Size,
    NEvents,
}

impl FormatField for RawField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "DATA" => Some(Self::Data),
            "SIZE" => Some(Self::Size),
            "N_EVENTS" => Some(Self::NEvents),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Data => "DATA",
            Self::Size => "SIZE",
            Self::NEvents => "N_EVENTS",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Data => 1,
            Self::Size | Self::NEvents => 0,
        }
    }
}

impl std::fmt::Debug for RawEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawEndpoint").field("node", &self.node).finish_non_exhaustive()
    }
}

pub struct RawEndpoint {
    node: NodeId,
    shared: Arc<HwShared>,
    socket: TcpStream,
    receiver: Mutex<Option<JoinHandle<()>>>,
    decoder: Mutex<Option<JoinHandle<()>>>,
    max_size_getter: Mutex<Option<SizeGetter>>,
    is_decoded_getter: Mutex<Option<BoolGetter>>,
    schema: Mutex<Schema<RawField>>,
}

impl RawEndpoint {
    /// Connect the data socket and start the receiver. The server injects a
    /// barrier right after connect; the constructor runs a clear to consume
    /// it, so a freshly built endpoint is `idle`.
    pub fn new(
        node: NodeId,
        address: IpAddr,
        port: u16,
        options: &UrlData,
        label: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let label = label.into();
        let addr = SocketAddr::new(address, port);
        let socket = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|err| Error::DeviceNotFound(err.to_string()))?;

        if let Some(rcvbuf) = options.rcvbuf {
            let sock_ref = socket2::SockRef::from(&socket);
            debug!(rcvbuf, "overriding socket receive buffer size");
            sock_ref.set_recv_buffer_size(rcvbuf)?;
        }

        let shared = HwShared::new(label.clone(), RING_SLOTS);

        let endpoint = Arc::new(Self {
            node,
            shared: Arc::clone(&shared),
            socket: socket.try_clone()?,
            receiver: Mutex::new(None),
            decoder: Mutex::new(None),
            max_size_getter: Mutex::new(None),
            is_decoded_getter: Mutex::new(None),
            schema: Mutex::new(Self::default_schema()),
        });

        let receiver = thread::Builder::new()
            .name(format!("{label}-receiver"))
            .spawn(move || {
                if let Err(err) = receiver_loop(socket, &shared) {
                    if shared.shutting_down.load(Ordering::Acquire) {
                        debug!(label = %shared.label, "receiver stopped: {err}");
                    } else {
                        error!(label = %shared.label, "receiver failed: {err}");
                    }
                }
            })
            .expect("spawning receiver thread");
        *endpoint.receiver.lock().unwrap() = Some(receiver);

        // Consume the post-connect barrier.
        hw::clear_data(&endpoint.shared, &endpoint.decoder);

        Ok(endpoint)
    }

    pub fn default_schema() -> Schema<RawField> {
        Schema::of(&[
            (RawField::Data, WireType::U8),
            (RawField::Size, WireType::SizeT),
        ])
    }
}

fn receiver_loop(mut socket: TcpStream, shared: &HwShared) -> Result<()> {
    let mut header = [0u8; protocol::DATA_HEADER_SIZE];
    let mut clear_buffer = false;

    loop {
        socket.read_exact(&mut header)?;

        let mut cursor = Cursor::new(&header);
        let size = cursor.read_u64()?;
        let n_events = cursor.read_u32()?;
        let aligned = cursor.read_u8()? != 0;

        trace!(size, n_events, aligned, "frame header");

        // A zero-length frame is the barrier acknowledging a clear.
        if size == 0 {
            debug!(label = %shared.label, "barrier packet");
            shared
                .state
                .wait_until(|state| state == RunState::ClearingReceiver);
            clear_buffer = true;
            shared.state.set(RunState::Idle);
            continue;
        }

        let size = usize::try_from(size)
            .map_err(|_| Error::Communication(format!("frame of {size} bytes")))?;

        shared.state.wait_until(|state| {
            matches!(state, RunState::Ready | RunState::ClearingReceiver)
        });

        let mut slot = shared.ring.acquire_write();
        if std::mem::take(&mut clear_buffer) {
            slot.reset();
        }

        let offset = slot.data.len();
        crate::wire::resize_in_place(&mut slot.data, offset + size);
        socket.read_exact(&mut slot.data[offset..])?;
        slot.n_events += n_events;

        if aligned {
            if shared.state.is(RunState::ClearingReceiver) {
                debug!(label = %shared.label, "discarding buffer received while clearing");
                clear_buffer = true;
                continue; // the guard drop aborts the write
            }
            debug!(label = %shared.label, size = slot.data.len(), n_events = slot.n_events, "buffer completed");
            slot.commit();
            clear_buffer = true;
        }
        // Unaligned frames keep accumulating into the same slot: the guard
        // drop leaves the write cursor in place.
    }
}

impl Endpoint for RawEndpoint {
    fn node(&self) -> NodeId {
        self.node
    }

    fn set_data_format(&self, json: &str) -> Result<()> {
        *self.schema.lock().unwrap() = Schema::parse(json)?;
        Ok(())
    }

    fn read_data(&self, timeout: Option<Duration>, slots: &mut [Slot<'_>]) -> Result<()> {
        // While the decoder thread owns the ring the raw surface is disabled.
        if self.shared.decoder_active.load(Ordering::Acquire) {
            return Err(Error::NotEnabled);
        }
        let slot = self.shared.ring.acquire_read(timeout).ok_or(Error::Timeout)?;
        let schema = self.schema.lock().unwrap();
        let mut projector = Projector::new(&schema, slots)?;
        while let Some(field) = projector.next_field() {
            match field {
                RawField::Data => projector.put_array(ArraySrc::from(&slot.data))?,
                RawField::Size => projector.put_scalar(slot.data.len())?,
                RawField::NEvents => projector.put_scalar(slot.n_events)?,
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

impl HwEndpoint for RawEndpoint {
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
        // Nothing to wait for, nothing to do.
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

impl Drop for RawEndpoint {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            debug!("socket shutdown: {err}");
        }
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

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;

    use super::*;

    fn frame(payload: &[u8], n_events: u32, aligned: bool) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frame.extend_from_slice(&n_events.to_le_bytes());
        frame.push(aligned as u8);
        frame.extend_from_slice(payload);
        frame
    }

    fn barrier() -> Vec<u8> {
        frame(&[], 0, false)
    }

    /// A fake device data server: accepts one connection and plays the given
    /// frames, pausing between them.
    fn spawn_device(frames: Vec<Vec<u8>>) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for frame in frames {
                stream.write_all(&frame).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
            // Keep the socket open until the client goes away.
            let mut sink = [0u8; 1];
            let _ = stream.read(&mut sink);
        });
        (addr, handle)
    }

    #[test]
    fn test_raw_endpoint_end_to_end() {
        let payload_a = vec![1u8; 16];
        let payload_b = vec![2u8; 8];
        let (addr, device) = spawn_device(vec![
            barrier(), // post-connect barrier
            barrier(), // barrier for the clear inside arm
            frame(&payload_a, 1, false),
            frame(&payload_b, 1, true),
        ]);

        let endpoint =
            RawEndpoint::new(1, addr.ip(), addr.port(), &UrlData::default(), "raw-test").unwrap();
        endpoint.set_max_size_getter(Box::new(|| Ok(1024)));
        endpoint.set_is_decoded_getter(Box::new(|| Ok(false)));
        endpoint.arm_acquisition().unwrap();

        let mut data: Vec<u8> = Vec::new();
        let mut size = 0usize;
        let mut n_events = 0u32;
        endpoint
            .set_data_format(
                r#"[
                    {"name":"DATA","type":"U8","dim":1},
                    {"name":"SIZE","type":"SIZE_T"},
                    {"name":"N_EVENTS","type":"U32"}
                ]"#,
            )
            .unwrap();
        let mut slots = [
            Slot::arr_u8(&mut data),
            Slot::size(&mut size),
            Slot::u32(&mut n_events),
        ];
        endpoint
            .read_data(Some(Duration::from_secs(5)), &mut slots)
            .unwrap();

        // The two frames accumulate into one aligned buffer.
        let mut expected = vec![1u8; 16];
        expected.extend_from_slice(&vec![2u8; 8]);
        assert_eq!(data, expected);
        assert_eq!(size, 24);
        assert_eq!(n_events, 2);

        drop(endpoint);
        device.join().unwrap();
    }

    #[test]
    fn test_read_data_times_out_when_idle() {
        let (addr, device) = spawn_device(vec![barrier()]);
        let endpoint =
            RawEndpoint::new(1, addr.ip(), addr.port(), &UrlData::default(), "raw-test").unwrap();
        let mut slots = [];
        let schemaless: Schema<RawField> = Schema::of(&[]);
        endpoint.set_data_format(&schemaless.to_json()).unwrap();
        assert!(matches!(
            endpoint.read_data(Some(Duration::from_millis(20)), &mut slots),
            Err(Error::Timeout)
        ));
        drop(endpoint);
        device.join().unwrap();
    }

    #[test]
    fn test_nothing_listening_is_device_not_found() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = RawEndpoint::new(1, addr.ip(), addr.port(), &UrlData::default(), "raw-test")
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }
}
