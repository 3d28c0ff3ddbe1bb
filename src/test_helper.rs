// Copyright 2022-2024 Google LLC
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

//! Writers for synthesizing WavPack streams in tests.

#![allow(clippy::missing_panics_doc)]

use std::io::Write;

use rand::distributions::Distribution;
use rand::distributions::Uniform;
use rand::Rng;
use tempfile::NamedTempFile;

use super::constant::entropy::LIMIT_ONES;
use super::constant::entropy::MEDIAN_DIVISORS;
use super::constant::header::COUNTED_HEADER_BYTES;
use super::constant::metadata_id;
use super::header::BlockFlags;

/// Flags of a 16-bit, 44.1kHz, single-block-per-frame stereo stream.
pub const DEFAULT_FLAGS: u32 = 0x1 | 0x800 | 0x1000 | (15 << 18) | (9 << 23);

/// LSB-first bit writer: the inverse of [`crate::bitsource::BitReader`].
#[derive(Clone, Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    acc_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bits(&mut self, value: u32, bits: u32) {
        assert!(bits <= 32);
        if bits == 0 {
            return;
        }
        let mask = if bits == 32 { u64::from(u32::MAX) } else { (1u64 << bits) - 1 };
        self.acc |= (u64::from(value) & mask) << self.acc_bits;
        self.acc_bits += bits;
        while self.acc_bits >= 8 {
            self.bytes.push((self.acc & 0xFF) as u8);
            self.acc >>= 8;
            self.acc_bits -= 8;
        }
    }

    pub fn put_bit(&mut self, bit: bool) {
        self.put_bits(u32::from(bit), 1);
    }

    /// Writes `count` ones followed by a zero.
    pub fn put_unary(&mut self, count: u32) {
        for _ in 0..count {
            self.put_bit(true);
        }
        self.put_bit(false);
    }

    /// Writes the run-length code read by `BitSource::read_escape`.
    pub fn put_escape(&mut self, value: u32) {
        if value < 2 {
            self.put_unary(value);
        } else {
            let cbits = 32 - value.leading_zeros();
            self.put_unary(cbits);
            self.put_bits(value, cbits - 1);
        }
    }

    /// Writes `value` in `0..=maxcode` with the truncated binary code.
    pub fn put_code(&mut self, value: u32, maxcode: u32) {
        assert!(value <= maxcode);
        let bitcount = 32 - maxcode.leading_zeros();
        if bitcount == 0 {
            return;
        }
        let extras = ((1u64 << bitcount) - u64::from(maxcode) - 1) as u32;
        if value < extras {
            self.put_bits(value, bitcount - 1);
        } else {
            let v = u64::from(value) + u64::from(extras);
            self.put_bits((v >> 1) as u32, bitcount - 1);
            self.put_bit(v & 1 == 1);
        }
    }

    /// Flushes the pending bits, padding with zeros to a byte boundary.
    pub fn into_bytes(mut self) -> Vec<u8> {
        if self.acc_bits > 0 {
            self.bytes.push((self.acc & 0xFF) as u8);
        }
        self.bytes
    }
}

/// Code bits that follow the unary prefix of a residual.
#[derive(Clone, Copy, Debug)]
struct Tail {
    code: u32,
    maxcode: u32,
    negative: bool,
}

impl Tail {
    fn write(self, w: &mut BitWriter) {
        w.put_code(self.code, self.maxcode);
        w.put_bit(self.negative);
    }
}

/// Lossless residual encoder with its own copy of the adaptive state.
///
/// The state handling mirrors the decoder so that the produced bitstream
/// decodes back to the given residuals.
#[derive(Clone, Debug, Default)]
pub struct ResidualWriter {
    median: [[u32; 3]; 2],
    holding_one: bool,
    holding_zero: bool,
    zeros_acc: u32,
}

impl ResidualWriter {
    /// Creates a writer whose medians start at the given values.
    pub fn with_medians(median: [[u32; 3]; 2]) -> Self {
        Self {
            median,
            ..Self::default()
        }
    }

    fn bucket(&self, ch: usize, i: usize) -> u32 {
        (self.median[ch][i] >> 4) + 1
    }

    fn inc(&mut self, ch: usize, i: usize) {
        let div = MEDIAN_DIVISORS[i];
        self.median[ch][i] += (self.median[ch][i] + div) / div * 5;
    }

    fn dec(&mut self, ch: usize, i: usize) {
        let div = MEDIAN_DIVISORS[i];
        self.median[ch][i] -= (self.median[ch][i] + div - 2) / div * 2;
    }

    /// Returns the ones count and the rest of the code of `value`, updating
    /// the medians of `ch`.
    fn code_value(&mut self, ch: usize, value: i32) -> (u32, Tail) {
        let mid = if value < 0 { !value } else { value } as u32;
        let (b0, b1) = (self.bucket(ch, 0), self.bucket(ch, 1));
        let ones = if mid < b0 {
            0
        } else if mid < b0 + b1 {
            1
        } else {
            2 + (mid - b0 - b1) / self.bucket(ch, 2)
        };

        let (low, high) = match ones {
            0 => {
                let high = self.bucket(ch, 0) - 1;
                self.dec(ch, 0);
                (0, high)
            }
            1 => {
                let low = self.bucket(ch, 0);
                self.inc(ch, 0);
                let high = low + self.bucket(ch, 1) - 1;
                self.dec(ch, 1);
                (low, high)
            }
            2 => {
                let low = self.bucket(ch, 0);
                self.inc(ch, 0);
                let low = low + self.bucket(ch, 1);
                self.inc(ch, 1);
                let high = low + self.bucket(ch, 2) - 1;
                self.dec(ch, 2);
                (low, high)
            }
            n => {
                let low = self.bucket(ch, 0);
                self.inc(ch, 0);
                let low = low + self.bucket(ch, 1);
                self.inc(ch, 1);
                let low = low + (n - 2) * self.bucket(ch, 2);
                let high = low + self.bucket(ch, 2) - 1;
                self.inc(ch, 2);
                (low, high)
            }
        };
        assert!(low <= mid && mid <= high);
        (
            ones,
            Tail {
                code: mid - low,
                maxcode: high - low,
                negative: value < 0,
            },
        )
    }

    fn write_ones(w: &mut BitWriter, raw: u32) {
        if raw < LIMIT_ONES {
            w.put_unary(raw);
        } else {
            w.put_unary(LIMIT_ONES);
            w.put_escape(raw - LIMIT_ONES);
        }
    }

    /// Encodes interleaved `residuals` (one block) and returns the bitstream.
    pub fn encode(&mut self, residuals: &[i32], mono: bool) -> Vec<u8> {
        let mut w = BitWriter::new();
        let mut pending: Option<(u32, Tail)> = None;

        for (i, &value) in residuals.iter().enumerate() {
            let ch = if mono { 0 } else { i & 1 };

            if pending.is_none()
                && self.median[0][0] < 2
                && self.median[1][0] < 2
                && !self.holding_zero
                && !self.holding_one
            {
                if self.zeros_acc > 0 {
                    self.zeros_acc -= 1;
                    if self.zeros_acc > 0 {
                        assert_eq!(value, 0);
                        continue;
                    }
                } else {
                    let run = residuals[i..].iter().take_while(|&&x| x == 0).count() as u32;
                    w.put_escape(run);
                    self.zeros_acc = run;
                    if run > 0 {
                        self.median = [[0; 3]; 2];
                        continue;
                    }
                }
            }

            let (ones, tail) = self.code_value(ch, value);

            if let Some((half, prev_tail)) = pending.take() {
                let parity = u32::from(ones > 0);
                Self::write_ones(&mut w, half * 2 + parity);
                prev_tail.write(&mut w);
                self.holding_one = parity == 1;
                self.holding_zero = parity == 0;
            }

            if self.holding_zero {
                assert_eq!(ones, 0);
                self.holding_zero = false;
                tail.write(&mut w);
            } else {
                let half = ones - u32::from(self.holding_one);
                pending = Some((half, tail));
            }
        }

        if let Some((half, prev_tail)) = pending.take() {
            Self::write_ones(&mut w, half * 2);
            prev_tail.write(&mut w);
            self.holding_one = false;
            self.holding_zero = true;
        }
        w.into_bytes()
    }
}

/// Computes the block checksum of interleaved decoded samples.
pub fn checksum(samples: &[i32], mono: bool) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    if mono {
        for &s in samples {
            crc = crc.wrapping_mul(3).wrapping_add(s as u32);
        }
    } else {
        for f in samples.chunks_exact(2) {
            crc = crc.wrapping_mul(3).wrapping_add(f[0] as u32);
            crc = crc.wrapping_mul(3).wrapping_add(f[1] as u32);
        }
    }
    crc
}

/// Converts left/right samples to the mid/side form decoded by joint stereo.
pub fn joint_stereo_residuals(samples: &[i32]) -> Vec<i32> {
    let mut ret = Vec::with_capacity(samples.len());
    for f in samples.chunks_exact(2) {
        let a = f[0] - f[1];
        ret.push(a);
        ret.push(f[1] + (a >> 1));
    }
    ret
}

/// Builder of the 32-byte block header.
#[derive(Clone, Debug)]
pub struct HeaderBuilder {
    block_size: u32,
    version: u16,
    total_samples: Option<u32>,
    block_index: u32,
    block_samples: u32,
    flags: u32,
    crc: u32,
}

impl Default for HeaderBuilder {
    fn default() -> Self {
        Self {
            block_size: COUNTED_HEADER_BYTES,
            version: 0x407,
            total_samples: None,
            block_index: 0,
            block_samples: 0,
            flags: DEFAULT_FLAGS,
            crc: 0,
        }
    }
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub const fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub const fn total_samples(mut self, total_samples: Option<u32>) -> Self {
        self.total_samples = total_samples;
        self
    }

    #[must_use]
    pub const fn block_index(mut self, block_index: u32) -> Self {
        self.block_index = block_index;
        self
    }

    #[must_use]
    pub const fn block_samples(mut self, block_samples: u32) -> Self {
        self.block_samples = block_samples;
        self
    }

    #[must_use]
    pub const fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn crc(mut self, crc: u32) -> Self {
        self.crc = crc;
        self
    }

    pub fn build(&self) -> [u8; 32] {
        let mut ret = [0u8; 32];
        ret[..4].copy_from_slice(b"wvpk");
        ret[4..8].copy_from_slice(&self.block_size.to_le_bytes());
        ret[8..10].copy_from_slice(&self.version.to_le_bytes());
        ret[12..16].copy_from_slice(&self.total_samples.unwrap_or(u32::MAX).to_le_bytes());
        ret[16..20].copy_from_slice(&self.block_index.to_le_bytes());
        ret[20..24].copy_from_slice(&self.block_samples.to_le_bytes());
        ret[24..28].copy_from_slice(&self.flags.to_le_bytes());
        ret[28..32].copy_from_slice(&self.crc.to_le_bytes());
        ret
    }
}

/// Serializes a metadata sub-block, choosing the small or large size form.
pub fn sub_block(id: u8, data: &[u8]) -> Vec<u8> {
    let odd = data.len() % 2 == 1;
    let words = (data.len() + 1) / 2;
    let mut id = id;
    if odd {
        id |= metadata_id::ODD_SIZE;
    }
    let mut ret = vec![];
    if words > 0xFF {
        ret.push(id | metadata_id::LARGE);
        ret.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
    } else {
        ret.push(id);
        ret.push(words as u8);
    }
    ret.extend_from_slice(data);
    if odd {
        ret.push(0);
    }
    ret
}

/// Builder of a complete block: header, metadata and bitstream.
#[derive(Clone, Debug, Default)]
pub struct BlockBuilder {
    header: HeaderBuilder,
    body: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a lossless block of `samples` without decorrelation passes.
    ///
    /// `samples` are the values before the final left shift; they are
    /// interleaved for stereo. The checksum is set to the correct value.
    pub fn pcm(samples: &[i32], mono: bool, joint: bool) -> Self {
        let frames = if mono { samples.len() } else { samples.len() / 2 };
        let mut flags = DEFAULT_FLAGS;
        if mono {
            flags |= BlockFlags::MONO.bits();
        }
        if joint {
            flags |= BlockFlags::JOINT_STEREO.bits();
        }
        let residuals = if joint {
            joint_stereo_residuals(samples)
        } else {
            samples.to_vec()
        };
        let bitstream = ResidualWriter::default().encode(&residuals, mono);
        Self::new()
            .header(|h| {
                h.flags(flags)
                    .block_samples(frames as u32)
                    .crc(checksum(samples, mono))
            })
            .sub_block(metadata_id::DECORR_TERMS, &[])
            .sub_block(metadata_id::ENTROPY_VARS, &vec![0u8; if mono { 6 } else { 12 }])
            .sub_block(metadata_id::WV_BITSTREAM, &bitstream)
    }

    #[must_use]
    pub fn header(mut self, f: impl FnOnce(HeaderBuilder) -> HeaderBuilder) -> Self {
        self.header = f(self.header);
        self
    }

    #[must_use]
    pub fn sub_block(mut self, id: u8, data: &[u8]) -> Self {
        self.body.extend_from_slice(&sub_block(id, data));
        self
    }

    /// Inserts a sub-block before the already added ones.
    #[must_use]
    pub fn prepend_sub_block(mut self, id: u8, data: &[u8]) -> Self {
        let mut body = sub_block(id, data);
        body.extend_from_slice(&self.body);
        self.body = body;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let size = COUNTED_HEADER_BYTES + self.body.len() as u32;
        let mut ret = self.header.clone().block_size(size).build().to_vec();
        ret.extend_from_slice(&self.body);
        ret
    }
}

/// Concatenates blocks into a stream.
pub fn stream(blocks: &[BlockBuilder]) -> Vec<u8> {
    blocks.iter().flat_map(BlockBuilder::build).collect()
}

/// Generates random samples in `-amplitude..=amplitude`.
pub fn random_samples<R: Rng>(rng: &mut R, len: usize, amplitude: i32) -> Vec<i32> {
    let dist = Uniform::from(-amplitude..=amplitude);
    (0..len).map(|_| dist.sample(rng)).collect()
}

/// Writes `bytes` into a temporary file.
pub fn write_temp_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file.");
    file.write_all(bytes).expect("Failed to write temp file.");
    file.flush().expect("Failed to flush temp file.");
    file
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_block_size_forms() {
        assert_eq!(sub_block(0x05, &[1, 2, 3]), vec![0x45, 2, 1, 2, 3, 0]);
        let large = sub_block(0x0a, &vec![0u8; 1000]);
        assert_eq!(&large[..4], &[0x8a, 0xF4, 0x01, 0x00]);
        assert_eq!(large.len(), 1004);
    }

    #[test]
    fn checksum_of_empty_block() {
        assert_eq!(checksum(&[], true), 0xFFFF_FFFF);
        assert_eq!(checksum(&[1], true), 0xFFFF_FFFFu32.wrapping_mul(3).wrapping_add(1));
    }
}
