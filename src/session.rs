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

//! The session table: up to 256 concurrently open sessions, addressed by the
//! top 8 bits of every handle. It is a plain value owned by the embedding
//! application (typically one per process) rather than a process-wide
//! global.

use std::sync::Arc;

use crate::client::Client;
use crate::handle::Handle;
use crate::handle::MAX_SESSIONS;
use crate::handle::NodeId;
use crate::logging;
use crate::prelude::*;

pub struct SessionTable {
    slots: Vec<Option<Arc<Client>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        logging::init();
        Self {
            slots: vec![None; MAX_SESSIONS],
        }
    }

    /// Open a session and return the digitizer's full handle.
    pub fn open(&mut self, url: &str) -> Result<Handle> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyDevices)?;
        let client = Client::open(url)?;
        let digitizer = client.digitizer();
        self.slots[index] = Some(Arc::new(client));
        Ok(Handle::new(index as u8, digitizer))
    }

    /// Close the session a handle belongs to. Any handle of the session is
    /// accepted, not just the digitizer's.
    pub fn close(&mut self, handle: Handle) -> Result<()> {
        let slot = self
            .slots
            .get_mut(usize::from(handle.session()))
            .ok_or(Error::InvalidHandle(handle.raw()))?;
        if slot.take().is_none() {
            return Err(Error::InvalidHandle(handle.raw()));
        }
        Ok(())
    }

    /// Resolve a raw handle to its session and node id.
    pub fn resolve(&self, raw: u32) -> Result<(Arc<Client>, NodeId)> {
        let handle = Handle::from(raw);
        let client = self
            .slots
            .get(usize::from(handle.session()))
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidHandle(raw))?;
        Ok((Arc::clone(client), handle.node()))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_unknown_handle() {
        let table = SessionTable::new();
        let err = table.resolve(0x0100_0001).unwrap_err();
        assert!(matches!(err, Error::InvalidHandle(_)));
    }

    #[test]
    fn test_close_unknown_handle() {
        let mut table = SessionTable::new();
        let err = table.close(Handle::new(3, 7)).unwrap_err();
        assert!(matches!(err, Error::InvalidHandle(_)));
    }

    #[test]
    fn test_open_unresolvable_device() {
        let mut table = SessionTable::new();
        let err = table.open("dig2://256.256.256.256").unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
        assert!(table.is_empty());
    }
}
