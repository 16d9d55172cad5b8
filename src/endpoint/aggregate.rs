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

//! Shared machinery of the aggregate (DPP) decoders: the one-word aggregate
//! header preceding the hit stream, and the asynchronous clear request polled
//! between hits.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::endpoint::sw::EventFormat;
use crate::prelude::*;
use crate::wire::BitField;
use crate::wire::Cursor;

pub const AGGREGATE_COUNTER_BITS: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateHeader {
    pub flush: bool,
    pub board_fail: bool,
    pub counter: u32,
    pub n_words: u32,
}

/// Decode the aggregate header, or `None` when the event is not an
/// individual-trigger (DPP) event and belongs to another decoder.
pub fn decode_aggregate_header(cursor: &mut Cursor<'_>) -> Result<Option<AggregateHeader>> {
    let mut word = BitField(cursor.read_word()?);
    let format = word.high(4) as u8;
    if format != EventFormat::IndividualTrigger as u8 {
        return Ok(None);
    }
    let flush = word.high_flag();
    word.skip_high(2);
    let board_fail = word.high_flag();
    let counter = word.high(AGGREGATE_COUNTER_BITS) as u32;
    let n_words = word.high(32) as u32;
    debug_assert!(word.exhausted());
    Ok(Some(AggregateHeader {
        flush,
        board_fail,
        counter,
        n_words,
    }))
}

/// Clear request raised by `clear_data` while the decoder thread may be in
/// the middle of an aggregate; the decoder polls it between hits and drops
/// the remainder of the aggregate when set.
#[derive(Debug, Default)]
pub struct ClearFlag(AtomicBool);

impl ClearFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// True when a clear was requested since the last call; resets the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use crate::endpoint::sw::testing::*;

    use super::*;

    #[test]
    fn test_decode_aggregate_header() {
        // format=2, flush=1, tbd=00, board_fail=1, counter=0xABCDEF.
        let implementation_defined =
            (1u64 << 27) | (1 << 24) | 0xABCDEF;
        let bytes = to_bytes(&[header_word(0b0010, implementation_defined, 7)]);
        let mut cursor = Cursor::new(&bytes);
        let header = decode_aggregate_header(&mut cursor).unwrap().unwrap();
        assert!(header.flush);
        assert!(header.board_fail);
        assert_eq!(header.counter, 0xABCDEF);
        assert_eq!(header.n_words, 7);
        assert_eq!(cursor.position(), 8);
    }

    #[test]
    fn test_foreign_format_is_skipped() {
        let bytes = to_bytes(&[header_word(0b0001, 0, 3)]);
        let mut cursor = Cursor::new(&bytes);
        assert!(decode_aggregate_header(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_clear_flag_take_resets() {
        let flag = ClearFlag::default();
        assert!(!flag.take());
        flag.request();
        assert!(flag.take());
        assert!(!flag.take());
    }
}
