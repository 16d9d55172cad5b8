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

//! Common event-stream grammar shared by every decoder: the self-describing
//! event header carried by the first 64-bit word of each event.

use num_enum::TryFromPrimitive;

use crate::prelude::*;
use crate::wire;
use crate::wire::BitField;
use crate::wire::Cursor;

/// Top 4 bits of every event's first word; routes events to decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum EventFormat {
    Unused = 0b0000,
    CommonTrigger = 0b0001,
    IndividualTrigger = 0b0010,
    SpecialEvent = 0b0011,
    SpecialTimeEvent = 0b0100,
}

pub const FORMAT_BITS: u32 = 4;
pub const IMPLEMENTATION_DEFINED_BITS: u32 = 28;
pub const N_WORDS_BITS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    /// Raw format code; may be outside [`EventFormat`].
    pub format: u8,
    /// Total event length in 64-bit words, this header included.
    pub n_words: u32,
}

/// Decode the event header without consuming the event.
pub fn peek_header(event: &[u8]) -> Result<EventHeader> {
    let mut cursor = Cursor::new(event);
    let mut word = BitField(cursor.read_word()?);
    let n_words = word.low(N_WORDS_BITS) as u32;
    word.skip_low(IMPLEMENTATION_DEFINED_BITS);
    let format = word.low(FORMAT_BITS) as u8;
    debug_assert!(word.exhausted());
    Ok(EventHeader { format, n_words })
}

/// Byte length of an event from its header.
pub fn event_byte_len(header: &EventHeader) -> usize {
    header.n_words as usize * wire::WORD_SIZE
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_peek_header() {
        let bytes = to_bytes(&[header_word(0b0011, 0x123_4567, 42)]);
        let header = peek_header(&bytes).unwrap();
        assert_eq!(header.format, 0b0011);
        assert_eq!(header.n_words, 42);
        assert_eq!(event_byte_len(&header), 336);
    }

    #[test]
    fn test_peek_header_short_buffer() {
        assert!(peek_header(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_format_codes() {
        assert_eq!(EventFormat::try_from(0b0001), Ok(EventFormat::CommonTrigger));
        assert_eq!(
            EventFormat::try_from(0b0010),
            Ok(EventFormat::IndividualTrigger)
        );
        assert!(EventFormat::try_from(0b1111).is_err());
    }
}
