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

//! Adaptive residual decoder.
//!
//! Residuals are coded with a Golomb-like code whose breakpoints are three
//! running medians per channel. Long runs of zeros are coded as run lengths
//! when the medians are small. In hybrid mode, the code is truncated to an
//! error limit derived from the bitrate (and the noise level if
//! [`BlockFlags::HYBRID_BITRATE`] is set).

use crate::bitsource::BitSource;
use crate::constant::entropy::LIMIT_ONES;
use crate::constant::entropy::MEDIAN_DIVISORS;
use crate::constant::entropy::SLOW_LEVEL_OFFSET;
use crate::constant::entropy::SLOW_LEVEL_SHIFT;
use crate::header::BlockFlags;

/// Mantissas of `2^(x/256)` for the fractional part `x`.
const EXP2_TABLE: [u8; 256] = [
    0x00, 0x01, 0x01, 0x02, 0x03, 0x03, 0x04, 0x05, 0x06, 0x06, 0x07, 0x08, 0x08, 0x09, 0x0a, 0x0b,
    0x0b, 0x0c, 0x0d, 0x0e, 0x0e, 0x0f, 0x10, 0x10, 0x11, 0x12, 0x13, 0x13, 0x14, 0x15, 0x16, 0x16,
    0x17, 0x18, 0x19, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1d, 0x1e, 0x1f, 0x20, 0x20, 0x21, 0x22, 0x23,
    0x24, 0x24, 0x25, 0x26, 0x27, 0x28, 0x28, 0x29, 0x2a, 0x2b, 0x2c, 0x2c, 0x2d, 0x2e, 0x2f, 0x30,
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x3a, 0x3b, 0x3c, 0x3d,
    0x3e, 0x3f, 0x40, 0x41, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x48, 0x49, 0x4a, 0x4b,
    0x4c, 0x4d, 0x4e, 0x4f, 0x50, 0x51, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a,
    0x5b, 0x5c, 0x5d, 0x5e, 0x5e, 0x5f, 0x60, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x6b, 0x6c, 0x6d, 0x6e, 0x6f, 0x70, 0x71, 0x72, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79,
    0x7a, 0x7b, 0x7c, 0x7d, 0x7e, 0x7f, 0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x87, 0x88, 0x89, 0x8a,
    0x8b, 0x8c, 0x8d, 0x8e, 0x8f, 0x90, 0x91, 0x92, 0x93, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0x9b,
    0x9c, 0x9d, 0x9f, 0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa8, 0xa9, 0xaa, 0xab, 0xac, 0xad,
    0xaf, 0xb0, 0xb1, 0xb2, 0xb3, 0xb4, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xbc, 0xbd, 0xbe, 0xbf, 0xc0,
    0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc8, 0xc9, 0xca, 0xcb, 0xcd, 0xce, 0xcf, 0xd0, 0xd2, 0xd3, 0xd4,
    0xd6, 0xd7, 0xd8, 0xd9, 0xdb, 0xdc, 0xdd, 0xde, 0xe0, 0xe1, 0xe2, 0xe4, 0xe5, 0xe6, 0xe8, 0xe9,
    0xea, 0xec, 0xed, 0xee, 0xf0, 0xf1, 0xf2, 0xf4, 0xf5, 0xf6, 0xf8, 0xf9, 0xfa, 0xfc, 0xfd, 0xff,
];

/// Fractional parts of `log2(1 + x/256)` in 1/256 units.
const LOG2_TABLE: [u8; 256] = [
    0x00, 0x01, 0x03, 0x04, 0x06, 0x07, 0x09, 0x0a, 0x0b, 0x0d, 0x0e, 0x10, 0x11, 0x12, 0x14, 0x15,
    0x16, 0x18, 0x19, 0x1a, 0x1c, 0x1d, 0x1e, 0x20, 0x21, 0x22, 0x24, 0x25, 0x26, 0x28, 0x29, 0x2a,
    0x2c, 0x2d, 0x2e, 0x2f, 0x31, 0x32, 0x33, 0x34, 0x36, 0x37, 0x38, 0x39, 0x3b, 0x3c, 0x3d, 0x3e,
    0x3f, 0x41, 0x42, 0x43, 0x44, 0x45, 0x47, 0x48, 0x49, 0x4a, 0x4b, 0x4d, 0x4e, 0x4f, 0x50, 0x51,
    0x52, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x5c, 0x5d, 0x5e, 0x5f, 0x60, 0x61, 0x62, 0x63,
    0x64, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x6b, 0x6c, 0x6d, 0x6e, 0x6f, 0x70, 0x71, 0x72, 0x74, 0x75,
    0x76, 0x77, 0x78, 0x79, 0x7a, 0x7b, 0x7c, 0x7d, 0x7e, 0x7f, 0x80, 0x81, 0x82, 0x83, 0x84, 0x85,
    0x86, 0x87, 0x88, 0x89, 0x8a, 0x8b, 0x8c, 0x8d, 0x8e, 0x8f, 0x90, 0x91, 0x92, 0x93, 0x94, 0x95,
    0x96, 0x97, 0x98, 0x99, 0x9a, 0x9b, 0x9b, 0x9c, 0x9d, 0x9e, 0x9f, 0xa0, 0xa1, 0xa2, 0xa3, 0xa4,
    0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xa9, 0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf, 0xb0, 0xb1, 0xb2, 0xb2,
    0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xb9, 0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf, 0xc0, 0xc0,
    0xc1, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xcb, 0xcb, 0xcc, 0xcd, 0xce,
    0xcf, 0xd0, 0xd0, 0xd1, 0xd2, 0xd3, 0xd4, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd8, 0xd9, 0xda, 0xdb,
    0xdc, 0xdc, 0xdd, 0xde, 0xdf, 0xe0, 0xe0, 0xe1, 0xe2, 0xe3, 0xe4, 0xe4, 0xe5, 0xe6, 0xe7, 0xe7,
    0xe8, 0xe9, 0xea, 0xea, 0xeb, 0xec, 0xed, 0xee, 0xee, 0xef, 0xf0, 0xf1, 0xf1, 0xf2, 0xf3, 0xf4,
    0xf4, 0xf5, 0xf6, 0xf7, 0xf7, 0xf8, 0xf9, 0xf9, 0xfa, 0xfb, 0xfc, 0xfc, 0xfd, 0xfe, 0xff, 0xff,
];

/// Converts a signed 8.8 fixed-point log2 value back to linear.
///
/// # Examples
///
/// ```
/// # use wvdec::entropy::exp2s;
/// assert_eq!(exp2s(0), 0);
/// assert_eq!(exp2s(0x800), 128);
/// assert_eq!(exp2s(-0x800), -128);
/// assert_eq!(exp2s(0x900), 256);
/// ```
#[allow(clippy::cast_possible_wrap)]
pub fn exp2s(log: i32) -> i32 {
    if log < 0 {
        return exp2s(log.saturating_neg()).wrapping_neg();
    }
    let value = u32::from(EXP2_TABLE[(log & 0xff) as usize]) | 0x100;
    let exp = (log >> 8) as u32;
    if exp <= 9 {
        (value >> (9 - exp)) as i32
    } else {
        value.wrapping_shl(exp - 9) as i32
    }
}

/// Approximates `log2(value)` as an 8.8 fixed-point number.
///
/// This is the inverse of [`exp2s`] for positive values, used for tracking
/// the noise level in hybrid mode.
///
/// # Examples
///
/// ```
/// # use wvdec::entropy::mylog2;
/// assert_eq!(mylog2(0), 0);
/// assert_eq!(mylog2(1), 0x100);
/// assert_eq!(mylog2(256), 0x900);
/// ```
pub fn mylog2(value: u32) -> i32 {
    let v = value.wrapping_add(value >> 9);
    let dbits = 32 - v.leading_zeros();
    let frac = if v < 256 {
        LOG2_TABLE[((v << (9 - dbits)) & 0xff) as usize]
    } else {
        LOG2_TABLE[((v >> (dbits - 9)) & 0xff) as usize]
    };
    #[allow(clippy::cast_possible_wrap)]
    let ret = ((dbits << 8) + u32::from(frac)) as i32;
    ret
}

/// Per-channel adaptive state of the residual code.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelWords {
    /// Running medians for the three code breakpoints.
    pub median: [u32; 3],
    /// Noise level in the log domain (hybrid bitrate mode).
    pub slow_level: u32,
    /// Current maximum allowed error in hybrid mode. Zero means lossless.
    pub error_limit: u32,
    /// Bitrate accumulator in 16.16 fixed-point.
    pub bitrate_acc: u32,
    /// Per-sample increment of `bitrate_acc`.
    pub bitrate_delta: u32,
}

impl ChannelWords {
    /// Returns the width of the `i`-th median bucket.
    #[inline]
    const fn bucket(&self, i: usize) -> u32 {
        (self.median[i] >> 4) + 1
    }

    #[inline]
    fn inc_median(&mut self, i: usize) {
        let div = MEDIAN_DIVISORS[i];
        self.median[i] = self
            .median[i]
            .wrapping_add(self.median[i].wrapping_add(div) / div * 5);
    }

    #[inline]
    fn dec_median(&mut self, i: usize) {
        let div = MEDIAN_DIVISORS[i];
        self.median[i] = self
            .median[i]
            .wrapping_sub(self.median[i].wrapping_add(div - 2) / div * 2);
    }

    #[inline]
    fn decay_slow_level(&mut self) {
        self.slow_level = self
            .slow_level
            .wrapping_sub(self.slow_level.wrapping_add(SLOW_LEVEL_OFFSET) >> SLOW_LEVEL_SHIFT);
    }

    /// Returns the slow level in the 8.8 log domain.
    #[allow(clippy::cast_possible_wrap)]
    const fn slow_log(&self) -> i32 {
        (self.slow_level.wrapping_add(SLOW_LEVEL_OFFSET) >> SLOW_LEVEL_SHIFT) as i32
    }

    /// Advances the bitrate accumulator and returns the integer bitrate.
    #[allow(clippy::cast_possible_wrap)]
    fn step_bitrate(&mut self) -> i32 {
        self.bitrate_acc = self.bitrate_acc.wrapping_add(self.bitrate_delta);
        (self.bitrate_acc >> 16) as i32
    }
}

/// Adaptive state of the residual decoder for one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WordsState {
    /// Channel states. Only the first one is used for mono data.
    pub c: [ChannelWords; 2],
    holding_one: bool,
    holding_zero: bool,
    zeros_acc: u32,
}

impl WordsState {
    /// Recomputes the error limits of the hybrid mode.
    #[allow(clippy::cast_sign_loss)]
    fn update_error_limit(&mut self, flags: BlockFlags) {
        let mut bitrate_0 = self.c[0].step_bitrate();

        if flags.is_mono_data() {
            self.c[0].error_limit = if flags.contains(BlockFlags::HYBRID_BITRATE) {
                limit_from_levels(self.c[0].slow_log(), bitrate_0)
            } else {
                exp2s(bitrate_0) as u32
            };
            return;
        }

        let mut bitrate_1 = self.c[1].step_bitrate();
        if flags.contains(BlockFlags::HYBRID_BITRATE) {
            let slow_log_0 = self.c[0].slow_log();
            let slow_log_1 = self.c[1].slow_log();

            if flags.contains(BlockFlags::HYBRID_BALANCE) {
                let balance = (slow_log_1 - slow_log_0 + bitrate_1 + 1) >> 1;
                if balance > bitrate_0 {
                    bitrate_1 = bitrate_0 * 2;
                    bitrate_0 = 0;
                } else if -balance > bitrate_0 {
                    bitrate_0 *= 2;
                    bitrate_1 = 0;
                } else {
                    bitrate_1 = bitrate_0 + balance;
                    bitrate_0 -= balance;
                }
            }

            self.c[0].error_limit = limit_from_levels(slow_log_0, bitrate_0);
            self.c[1].error_limit = limit_from_levels(slow_log_1, bitrate_1);
        } else {
            self.c[0].error_limit = exp2s(bitrate_0) as u32;
            self.c[1].error_limit = exp2s(bitrate_1) as u32;
        }
    }

    /// Reads up to `frames` frames of residuals into `buffer`.
    ///
    /// Stereo residuals are interleaved. Returns the number of complete
    /// frames read; fewer than `frames` means the bitstream is corrupted.
    pub fn get_words<B: BitSource>(
        &mut self,
        bits: &mut B,
        flags: BlockFlags,
        buffer: &mut [i32],
        frames: usize,
    ) -> usize {
        let mono = flags.is_mono_data();
        let hybrid = flags.contains(BlockFlags::HYBRID);
        let hybrid_bitrate = flags.contains(BlockFlags::HYBRID_BITRATE);
        let width = if mono { 1 } else { 2 };
        let total = frames * width;

        let mut csample = 0;
        while csample < total {
            let ch = if mono { 0 } else { csample & 1 };

            if self.c[0].median[0] < 2
                && self.c[1].median[0] < 2
                && !self.holding_zero
                && !self.holding_one
            {
                if self.zeros_acc > 0 {
                    self.zeros_acc -= 1;
                    if self.zeros_acc > 0 {
                        self.c[ch].decay_slow_level();
                        buffer[csample] = 0;
                        csample += 1;
                        continue;
                    }
                } else {
                    let Some(run) = bits.read_escape() else {
                        break;
                    };
                    self.zeros_acc = run;
                    if run > 0 {
                        self.c[ch].decay_slow_level();
                        self.c[0].median = [0; 3];
                        self.c[1].median = [0; 3];
                        buffer[csample] = 0;
                        csample += 1;
                        continue;
                    }
                }
            }

            let ones_count = if self.holding_zero {
                self.holding_zero = false;
                0
            } else {
                let mut ones = bits.read_ones(LIMIT_ONES + 1);
                if ones == LIMIT_ONES + 1 {
                    break;
                }
                if ones == LIMIT_ONES {
                    let Some(extra) = bits.read_escape() else {
                        break;
                    };
                    ones = extra.wrapping_add(LIMIT_ONES);
                }

                let held = self.holding_one;
                self.holding_one = ones & 1 != 0;
                ones = if held { (ones >> 1) + 1 } else { ones >> 1 };
                self.holding_zero = !self.holding_one;
                ones
            };

            if hybrid && (mono || csample & 1 == 0) {
                self.update_error_limit(flags);
            }

            let c = &mut self.c[ch];
            let (low, high) = match ones_count {
                0 => {
                    let high = c.bucket(0) - 1;
                    c.dec_median(0);
                    (0, high)
                }
                1 => {
                    let low = c.bucket(0);
                    c.inc_median(0);
                    let high = low.wrapping_add(c.bucket(1)).wrapping_sub(1);
                    c.dec_median(1);
                    (low, high)
                }
                2 => {
                    let low = c.bucket(0);
                    c.inc_median(0);
                    let low = low.wrapping_add(c.bucket(1));
                    c.inc_median(1);
                    let high = low.wrapping_add(c.bucket(2)).wrapping_sub(1);
                    c.dec_median(2);
                    (low, high)
                }
                n => {
                    let low = c.bucket(0);
                    c.inc_median(0);
                    let low = low.wrapping_add(c.bucket(1));
                    c.inc_median(1);
                    let low = low.wrapping_add((n - 2).wrapping_mul(c.bucket(2)));
                    let high = low.wrapping_add(c.bucket(2)).wrapping_sub(1);
                    c.inc_median(2);
                    (low, high)
                }
            };

            let mid = if c.error_limit == 0 {
                read_code(bits, high.wrapping_sub(low)).wrapping_add(low)
            } else {
                let (mut low, mut high) = (low, high);
                let mut mid = mid_point(low, high);
                while high.wrapping_sub(low) > c.error_limit {
                    if bits.read_bit() {
                        low = mid;
                    } else {
                        high = mid.wrapping_sub(1);
                    }
                    mid = mid_point(low, high);
                }
                mid
            };

            #[allow(clippy::cast_possible_wrap)]
            let value = if bits.read_bit() {
                !(mid as i32)
            } else {
                mid as i32
            };
            buffer[csample] = value;

            if hybrid_bitrate {
                #[allow(clippy::cast_sign_loss)]
                let log = mylog2(mid) as u32;
                c.decay_slow_level();
                c.slow_level = c.slow_level.wrapping_add(log);
            }
            csample += 1;
        }

        csample / width
    }
}

#[inline]
fn mid_point(low: u32, high: u32) -> u32 {
    ((u64::from(low) + u64::from(high) + 1) >> 1) as u32
}

#[allow(clippy::cast_sign_loss)]
fn limit_from_levels(slow_log: i32, bitrate: i32) -> u32 {
    if slow_log - bitrate > -0x100 {
        exp2s(slow_log - bitrate + 0x100) as u32
    } else {
        0
    }
}

/// Reads a value in `0..=maxcode` with a truncated binary code.
pub fn read_code<B: BitSource>(bits: &mut B, maxcode: u32) -> u32 {
    let bitcount = 32 - maxcode.leading_zeros();
    if bitcount == 0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation)]
    let extras = ((1u64 << bitcount) - u64::from(maxcode) - 1) as u32;
    let mut code = bits.read_bits(bitcount - 1);
    if code >= extras {
        code = (code << 1).wrapping_sub(extras);
        if bits.read_bit() {
            code += 1;
        }
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitsource::BitBuffer;
    use crate::bitsource::BitReader;
    use crate::test_helper::BitWriter;

    use std::io::Cursor;

    use rstest::rstest;

    fn decode(
        words: &mut WordsState,
        flags: BlockFlags,
        bytes: Vec<u8>,
        frames: usize,
    ) -> (Vec<i32>, usize, bool) {
        let mut state = BitBuffer::new(64);
        state.reset(bytes.len() as u64);
        let mut src = Cursor::new(bytes);
        let mut reader = BitReader::new(&mut state, &mut src);
        let mut buffer = vec![0i32; frames * 2];
        let n = words.get_words(&mut reader, flags, &mut buffer, frames);
        let exhausted = reader.is_exhausted();
        (buffer, n, exhausted)
    }

    #[rstest]
    #[case(0, 0)]
    #[case(0x100, 1)]
    #[case(0x800, 128)]
    #[case(0x900, 256)]
    #[case(0x180, 1)]
    #[case(0x880, 181)]
    #[case(0xA00, 512)]
    fn exp2s_values(#[case] log: i32, #[case] expected: i32) {
        assert_eq!(exp2s(log), expected);
        assert_eq!(exp2s(-log), -expected);
    }

    #[test]
    fn exp2s_and_mylog2_are_roughly_inverse() {
        for v in [1u32, 2, 3, 100, 1000, 12345, 1 << 20] {
            let back = exp2s(mylog2(v));
            #[allow(clippy::cast_possible_wrap)]
            let v = v as i32;
            assert!((back - v).abs() <= v / 16 + 1, "v={v}, back={back}");
        }
    }

    #[test]
    fn extreme_log_does_not_panic() {
        let _ = exp2s(i32::MIN);
        let _ = exp2s(i32::MAX);
        let _ = mylog2(u32::MAX);
    }

    #[rstest]
    fn truncated_binary_code(#[values(1, 2, 5, 7, 8, 100)] maxcode: u32) {
        for value in 0..=maxcode {
            let mut w = BitWriter::new();
            w.put_code(value, maxcode);
            w.put_bits(0x5, 3);
            let bytes = w.into_bytes();
            let mut state = BitBuffer::new(8);
            state.reset(bytes.len() as u64);
            let mut src = Cursor::new(bytes);
            let mut reader = BitReader::new(&mut state, &mut src);
            assert_eq!(read_code(&mut reader, maxcode), value);
            assert_eq!(reader.read_bits(3), 0x5);
        }
    }

    #[test]
    fn read_code_of_zero_range_reads_nothing() {
        let mut state = BitBuffer::new(8);
        state.reset(0);
        let mut src = Cursor::new(Vec::<u8>::new());
        let mut reader = BitReader::new(&mut state, &mut src);
        assert_eq!(read_code(&mut reader, 0), 0);
        assert!(!reader.is_exhausted());
    }

    #[test]
    fn zero_run_with_zero_medians() {
        // Run length 5 for the whole stream, coded as escape(5).
        let mut w = BitWriter::new();
        w.put_escape(5);
        let mut words = WordsState::default();
        let (buffer, n, exhausted) = decode(&mut words, BlockFlags::MONO, w.into_bytes(), 4);
        assert_eq!(n, 4);
        assert!(!exhausted);
        assert_eq!(&buffer[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn single_values_with_known_medians() {
        let mut words = WordsState::default();
        // A median of 128 gives buckets of width 9.
        words.c[0].median = [128, 128, 128];

        // ones_count 0 (prefix "0"), value 7 in 0..=8, positive.
        let mut w = BitWriter::new();
        w.put_bit(false);
        w.put_code(7, 8);
        w.put_bit(false);
        let (buffer, n, _) = decode(&mut words, BlockFlags::MONO, w.into_bytes(), 1);
        assert_eq!(n, 1);
        assert_eq!(buffer[0], 7);
        // DEC: 128 - ((128 + 126) / 128) * 2 = 126.
        assert_eq!(words.c[0].median[0], 126);
    }

    #[test]
    fn negative_value_is_ones_complement() {
        let mut words = WordsState::default();
        words.c[0].median = [128, 128, 128];
        let mut w = BitWriter::new();
        w.put_bit(false);
        w.put_code(3, 8);
        w.put_bit(true);
        let (buffer, n, _) = decode(&mut words, BlockFlags::MONO, w.into_bytes(), 1);
        assert_eq!(n, 1);
        assert_eq!(buffer[0], -4);
    }

    #[test]
    fn second_bucket_and_holding_one() {
        let mut words = WordsState::default();
        words.c[0].median = [128, 128, 128];
        // Prefix "110": two ones, halved to one with a held one.
        let mut w = BitWriter::new();
        w.put_bits(0b11, 2);
        w.put_bit(false);
        w.put_code(2, 8);
        w.put_bit(false);
        let (buffer, n, _) = decode(&mut words, BlockFlags::MONO, w.into_bytes(), 1);
        assert_eq!(n, 1);
        // low = 9 (first bucket), value = 9 + 2.
        assert_eq!(buffer[0], 11);
        assert!(!words.holding_one);
        assert!(words.holding_zero);
        // INC: 128 + ((128 + 128) / 128) * 5 = 138.
        assert_eq!(words.c[0].median[0], 138);
    }

    #[test]
    fn stereo_channels_alternate_states() {
        let mut words = WordsState::default();
        words.c[0].median = [128, 128, 128];
        words.c[1].median = [256, 256, 256];
        let mut w = BitWriter::new();
        // Left: bucket 0 of width 9.
        w.put_bit(false);
        w.put_code(8, 8);
        w.put_bit(false);
        // Right: the held zero stands for the prefix, bucket 0 of width 17.
        w.put_code(16, 16);
        w.put_bit(true);
        let (buffer, n, _) = decode(&mut words, BlockFlags::empty(), w.into_bytes(), 1);
        assert_eq!(n, 1);
        assert_eq!(&buffer[..2], &[8, -17]);
        assert_eq!(words.c[0].median[0], 126);
        assert_eq!(words.c[1].median[0], 252);
    }

    #[test]
    fn premature_end_reports_short_count() {
        let mut words = WordsState::default();
        words.c[0].median = [128, 128, 128];
        // Empty bitstream reads all ones: the unary prefix overflows.
        let (_, n, exhausted) = decode(&mut words, BlockFlags::MONO, vec![], 8);
        assert_eq!(n, 0);
        assert!(exhausted);
    }

    #[test]
    fn hybrid_error_limit_from_bitrate() {
        let mut words = WordsState::default();
        words.c[0].bitrate_acc = 0x800 << 16;
        words.update_error_limit(BlockFlags::MONO | BlockFlags::HYBRID);
        assert_eq!(words.c[0].error_limit, 128);
    }

    #[test]
    fn hybrid_balance_moves_bitrate_between_channels() {
        let mut words = WordsState::default();
        words.c[0].bitrate_acc = 0x400 << 16;
        words.c[1].bitrate_acc = 0x400 << 16;
        words.c[0].slow_level = 0x400 << SLOW_LEVEL_SHIFT;
        words.c[1].slow_level = 0x400 << SLOW_LEVEL_SHIFT;
        let flags = BlockFlags::HYBRID | BlockFlags::HYBRID_BITRATE | BlockFlags::HYBRID_BALANCE;
        words.update_error_limit(flags);
        // balance = (0 + 0x400 + 1) >> 1 = 0x200; bitrates become 0x200/0x600.
        assert_eq!(words.c[0].error_limit, exp2s(0x400 - 0x200 + 0x100) as u32);
        assert_eq!(words.c[1].error_limit, 0);
    }
}
