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

//! The TCP command channel: length-prefixed JSON request/reply, serialized by
//! a session-scoped lock. Steady-state commands block until the reply.

use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use crate::prelude::*;
use crate::protocol::Reply;
use crate::protocol::Request;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Hard cap on a reply body; a larger length prefix means we lost framing.
const MAX_REPLY_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug)]
pub struct CommandChannel {
    stream: Mutex<TcpStream>,
}

impl CommandChannel {
    /// Open the control connection. Connection failures surface as
    /// `DeviceNotFound`: this is the probe that tells whether anything is
    /// listening at all.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|err| Error::DeviceNotFound(err.to_string()))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    pub fn stream(&self) -> std::sync::MutexGuard<'_, TcpStream> {
        self.stream.lock().unwrap()
    }

    /// One request/reply exchange. The reply must echo the request's command;
    /// `result == false` surfaces as a command error carrying the joined
    /// reply values.
    pub fn exchange(&self, request: &Request) -> Result<Reply> {
        let body = serde_json::to_vec(request)
            .map_err(|err| Error::Internal(format!("request encoding failed: {err}")))?;

        debug!(cmd = ?request.cmd, handle = request.handle, query = %request.query, "sending command");

        let mut stream = self.stream.lock().unwrap();

        stream.write_all(&(body.len() as u64).to_le_bytes())?;
        stream.write_all(&body)?;

        let mut header = [0u8; size_of::<u64>()];
        stream.read_exact(&mut header)?;
        let size = u64::from_le_bytes(header);
        if size > MAX_REPLY_SIZE {
            return Err(Error::Communication(format!(
                "implausible reply length {size}"
            )));
        }

        let mut body = vec![0u8; size as usize];
        stream.read_exact(&mut body)?;
        drop(stream);

        debug!(size, "reply received");

        let reply: Reply = serde_json::from_slice(&body)
            .map_err(|err| Error::Command(format!("JSON error: {err}")))?;

        if reply.cmd != request.cmd {
            return Err(Error::Communication(format!(
                "reply for {:?} while waiting for {:?}",
                reply.cmd, request.cmd
            )));
        }

        if !reply.result {
            let message = format!("digitizer error: {}", reply.value.join(" "));
            error!("{message}");
            return Err(Error::Command(message));
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use crate::protocol::Command;

    use super::*;

    /// Serve one framed JSON reply per element of `replies`, echoing nothing.
    fn spawn_server(replies: Vec<String>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for reply in replies {
                // Drain the request frame first.
                let mut header = [0u8; 8];
                stream.read_exact(&mut header).unwrap();
                let mut body = vec![0u8; u64::from_le_bytes(header) as usize];
                stream.read_exact(&mut body).unwrap();
                // Requests must themselves be valid JSON.
                serde_json::from_slice::<serde_json::Value>(&body).unwrap();

                stream
                    .write_all(&(reply.len() as u64).to_le_bytes())
                    .unwrap();
                stream.write_all(reply.as_bytes()).unwrap();
            }
        });
        addr
    }

    #[test]
    fn test_exchange_roundtrip() {
        let addr = spawn_server(vec![
            r#"{"cmd":"getValue","result":true,"value":["64"]}"#.to_owned(),
        ]);
        let channel = CommandChannel::connect(addr).unwrap();
        let reply = channel
            .exchange(&Request::new(Command::GetValue, 1, "/par/numch"))
            .unwrap();
        assert_eq!(reply.value, vec!["64"]);
    }

    #[test]
    fn test_result_false_is_command_error() {
        let addr = spawn_server(vec![
            r#"{"cmd":"setValue","result":false,"value":["no","such","node"]}"#.to_owned(),
        ]);
        let channel = CommandChannel::connect(addr).unwrap();
        let err = channel
            .exchange(&Request::new(Command::SetValue, 1, "/par/bogus").with_value("1"))
            .unwrap_err();
        match err {
            Error::Command(msg) => assert!(msg.contains("no such node")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_command_is_rejected() {
        let addr = spawn_server(vec![
            r#"{"cmd":"getPath","result":true,"value":["/"]}"#.to_owned(),
        ]);
        let channel = CommandChannel::connect(addr).unwrap();
        let err = channel
            .exchange(&Request::new(Command::GetValue, 1, "/x"))
            .unwrap_err();
        assert!(matches!(err, Error::Communication(_)));
    }

    #[test]
    fn test_malformed_json_is_command_error() {
        let addr = spawn_server(vec!["{not json".to_owned()]);
        let channel = CommandChannel::connect(addr).unwrap();
        let err = channel
            .exchange(&Request::new(Command::GetValue, 1, "/x"))
            .unwrap_err();
        assert!(matches!(err, Error::Command(_)));
    }

    #[test]
    fn test_connection_loss_is_communication_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });
        let channel = CommandChannel::connect(addr).unwrap();
        let err = channel
            .exchange(&Request::new(Command::GetValue, 1, "/x"))
            .unwrap_err();
        assert!(matches!(err, Error::Communication(_)));
    }

    #[test]
    fn test_nothing_listening_is_device_not_found() {
        // Bind-then-drop to get a port with nothing behind it.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = CommandChannel::connect(addr).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }
}
