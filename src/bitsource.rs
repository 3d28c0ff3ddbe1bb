// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte and bit sources used by the decoder.

use std::io;
use std::io::Read;

use crate::constant::panic_msg;

/// Trait for reading an LSB-first WavPack bitstream.
///
/// Reads never fail. After the underlying data is used up, a `BitSource`
/// keeps yielding 1-bits and reports it via [`BitSource::is_exhausted`].
pub trait BitSource {
    /// Reads `bits` bits (at most 32) as an unsigned integer.
    ///
    /// The first bit read becomes the least significant bit of the result.
    fn read_bits(&mut self, bits: u32) -> u32;

    /// Returns true if a read went past the end of the available data.
    fn is_exhausted(&self) -> bool;

    /// Reads a single bit.
    fn read_bit(&mut self) -> bool {
        self.read_bits(1) != 0
    }

    /// Counts consecutive 1-bits, stopping after `limit` of them.
    ///
    /// The terminating 0-bit is consumed unless `limit` is reached.
    fn read_ones(&mut self, limit: u32) -> u32 {
        let mut count = 0;
        while count < limit && self.read_bit() {
            count += 1;
        }
        count
    }

    /// Reads the variable-length code used for run lengths and long prefixes.
    ///
    /// The code is a unary bit-length `n` followed by the `n - 1` lower bits
    /// of the value (the top bit is implicit). Returns `None` for the
    /// 33-ones escape that has no valid value.
    fn read_escape(&mut self) -> Option<u32> {
        let cbits = self.read_ones(33);
        if cbits == 33 {
            None
        } else if cbits < 2 {
            Some(cbits)
        } else {
            let top = 1u32 << (cbits - 1);
            Some(self.read_bits(cbits - 1) | top)
        }
    }
}

/// Owned state of a [`BitReader`]: the byte buffer and the bit accumulator.
///
/// The state is kept separately from the byte source so that the decoder
/// can own both and lend them together for one decoding call.
#[derive(Clone, Debug)]
pub struct BitBuffer {
    buf: Vec<u8>,
    head: usize,
    end: usize,
    acc: u64,
    acc_bits: u32,
    bytes_left: u64,
    exhausted: bool,
}

impl BitBuffer {
    /// Creates an empty buffer refilled at most `capacity` bytes at a time.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)],
            head: 0,
            end: 0,
            acc: 0,
            acc_bits: 0,
            bytes_left: 0,
            exhausted: false,
        }
    }

    /// Discards buffered bits and allows `budget` more bytes to be read.
    pub fn reset(&mut self, budget: u64) {
        self.head = 0;
        self.end = 0;
        self.acc = 0;
        self.acc_bits = 0;
        self.bytes_left = budget;
        self.exhausted = false;
    }

    /// Returns the number of budgeted bytes not yet pulled from the source.
    pub const fn unread_budget(&self) -> u64 {
        self.bytes_left
    }

    /// Returns true if a read went past the end of the budget.
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Gets the next byte, refilling the buffer from `source` if needed.
    fn next_byte<R: Read>(&mut self, source: &mut R) -> u8 {
        if self.head == self.end && !self.exhausted {
            self.refill(source);
        }
        if self.head < self.end {
            let b = self.buf[self.head];
            self.head += 1;
            b
        } else {
            0xFF
        }
    }

    fn refill<R: Read>(&mut self, source: &mut R) {
        self.head = 0;
        self.end = 0;
        #[allow(clippy::cast_possible_truncation)]
        let want = self.bytes_left.min(self.buf.len() as u64) as usize;
        if want == 0 {
            self.exhausted = true;
            return;
        }
        loop {
            match source.read(&mut self.buf[..want]) {
                Ok(0) => {
                    self.exhausted = true;
                    return;
                }
                Ok(n) => {
                    self.end = n;
                    self.bytes_left -= n as u64;
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!(
                        target: "wvdec::bitsource",
                        "{{ msg: \"read error inside bitstream\", error: \"{e}\" }}"
                    );
                    self.exhausted = true;
                    return;
                }
            }
        }
    }
}

impl Default for BitBuffer {
    fn default() -> Self {
        Self::new(crate::constant::DEFAULT_BITSTREAM_BUFFER_SIZE)
    }
}

/// `BitSource` that reads from a borrowed [`BitBuffer`] and byte source.
pub struct BitReader<'a, R> {
    state: &'a mut BitBuffer,
    source: &'a mut R,
}

impl<'a, R: Read> BitReader<'a, R> {
    /// Creates a reader that continues from the given state.
    pub fn new(state: &'a mut BitBuffer, source: &'a mut R) -> Self {
        Self { state, source }
    }
}

impl<R: Read> BitSource for BitReader<'_, R> {
    #[inline]
    fn read_bits(&mut self, bits: u32) -> u32 {
        debug_assert!(bits <= 32, "{}", panic_msg::TOO_MANY_BITS);
        let bits = bits.min(32);
        if bits == 0 {
            return 0;
        }
        while self.state.acc_bits < bits {
            let b = self.state.next_byte(self.source);
            self.state.acc |= u64::from(b) << self.state.acc_bits;
            self.state.acc_bits += 8;
        }
        let mask = (1u64 << bits) - 1;
        #[allow(clippy::cast_possible_truncation)]
        let ret = (self.state.acc & mask) as u32;
        self.state.acc >>= bits;
        self.state.acc_bits -= bits;
        ret
    }

    fn is_exhausted(&self) -> bool {
        self.state.exhausted
    }
}

/// `Read` adaptor that tracks the number of bytes consumed so far.
///
/// The position is used for locating errors and for skipping the unread
/// tail of a block.
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read> CountingReader<R> {
    /// Wraps `inner`, starting the byte count at zero.
    pub const fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    /// Returns the number of bytes read from the wrapped source.
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Reads and drops `n` bytes. Returns the number of bytes actually skipped.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors other than end-of-file.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        io::copy(&mut self.by_ref().take(n), &mut io::sink())
    }

    /// Unwraps the source.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}
