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

//! Sample reconstruction within a single block.

use std::io::Read;

use crate::bitsource::BitBuffer;
use crate::bitsource::BitReader;
use crate::bitsource::BitSource;
use crate::bitsource::CountingReader;
use crate::error::DecodeError;
use crate::error::FormatError;
use crate::header::BlockFlags;
use crate::header::BlockHeader;
use crate::metadata::read_block_metadata;
use crate::metadata::BlockParams;
use crate::metadata::FloatInfo;
use crate::metadata::StreamProps;

const FLOAT_INT_MIN: i32 = -8_388_608;
const FLOAT_INT_MAX: i32 = 8_388_607;

/// Decoding state of the block currently being unpacked.
#[derive(Clone, Debug)]
pub struct BlockUnpacker {
    header: Option<BlockHeader>,
    params: BlockParams,
    bits: BitBuffer,
    /// Block bytes after the bitstream that are still in the source.
    trailing: u64,
    crc: u32,
    mute_error: bool,
    crc_checked: bool,
    scratch: Vec<i32>,
}

impl BlockUnpacker {
    /// Creates an unpacker whose bit reader buffers `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            header: None,
            params: BlockParams::default(),
            bits: BitBuffer::new(buffer_size),
            trailing: 0,
            crc: 0xFFFF_FFFF,
            mute_error: false,
            crc_checked: false,
            scratch: vec![],
        }
    }

    /// Returns the header of the initialized block, if any.
    pub const fn header(&self) -> Option<&BlockHeader> {
        self.header.as_ref()
    }

    /// Returns the decoding parameters of the initialized block.
    pub const fn params(&self) -> &BlockParams {
        &self.params
    }

    /// Reads the metadata of the block that starts with `header` and
    /// prepares for unpacking its samples.
    ///
    /// The source must be positioned just after `header`.
    ///
    /// # Errors
    ///
    /// Propagates metadata errors. An audio block without a bitstream is a
    /// format error.
    pub fn init_block<R: Read>(
        &mut self,
        source: &mut CountingReader<R>,
        header: BlockHeader,
        props: &mut StreamProps,
    ) -> Result<(), DecodeError> {
        self.header = None;
        self.bits.reset(0);
        self.trailing = 0;

        let at = source.position();
        let span = read_block_metadata(source, &header, &mut self.params, props)?;
        match span {
            Some(span) => {
                self.bits.reset(span.len);
                self.trailing = span.trailing;
            }
            None if header.block_samples > 0 => {
                return Err(FormatError::new(at, "audio block without bitstream").into());
            }
            None => {}
        }

        self.crc = 0xFFFF_FFFF;
        self.mute_error = false;
        self.crc_checked = false;
        self.header = Some(header);
        log::debug!(
            target: "wvdec::unpack",
            "{{ msg: \"block initialized\", block_index: {}, passes: {}, bitstream_bytes: {} }}",
            header.block_index,
            self.params.passes.len(),
            self.bits.unread_budget()
        );
        Ok(())
    }

    /// Forgets the current block and marks the payload of `header` for
    /// discarding.
    ///
    /// The source must be positioned just after `header`.
    pub fn skip_block(&mut self, header: &BlockHeader) {
        self.header = None;
        self.bits.reset(0);
        self.trailing = u64::from(header.payload_size());
    }

    /// Drops the unread part of the current block from the source, leaving
    /// it positioned at the next header.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors other than end-of-file.
    pub fn discard_rest<R: Read>(
        &mut self,
        source: &mut CountingReader<R>,
    ) -> Result<(), DecodeError> {
        let n = self.bits.unread_budget() + self.trailing;
        self.bits.reset(0);
        self.trailing = 0;
        if n > 0 {
            source.skip(n).map_err(DecodeError::from_io)?;
        }
        Ok(())
    }

    /// Returns true if the current block can't be restored exactly without
    /// a correction stream.
    pub fn is_lossy(&self) -> bool {
        let Some(header) = self.header else {
            return false;
        };
        let flags = header.flags;
        flags.contains(BlockFlags::HYBRID)
            || (flags.contains(BlockFlags::INT32_DATA) && self.params.int32_info.sent_bits > 0)
            || (flags.contains(BlockFlags::FLOAT_DATA) && self.params.float_info.is_lossy())
    }

    /// Returns the number of channels [`Self::unpack`] produces per frame.
    pub fn block_width(&self) -> usize {
        match self.header {
            Some(header) if header.flags.contains(BlockFlags::MONO) => 1,
            _ => 2,
        }
    }

    /// Decodes the next `frames` frames of the current block.
    ///
    /// Returns interleaved samples, [`Self::block_width`] per frame. If the
    /// bitstream turns out to be corrupted, the output is silenced for the
    /// rest of the block.
    pub fn unpack<R: Read>(&mut self, source: &mut CountingReader<R>, frames: usize) -> &[i32] {
        let out_width = self.block_width();
        self.scratch.clear();
        self.scratch.resize(frames * 2, 0);
        let Some(header) = self.header else {
            return &self.scratch[..frames * out_width];
        };
        if self.mute_error {
            return &self.scratch[..frames * out_width];
        }

        let flags = header.flags;
        let mono_data = flags.is_mono_data();
        let data_width = if mono_data { 1 } else { 2 };
        let buf = &mut self.scratch[..frames * data_width];

        let mut reader = BitReader::new(&mut self.bits, source);
        let decoded = self.params.words.get_words(&mut reader, flags, buf, frames);
        let exhausted = reader.is_exhausted();

        for pass in &mut self.params.passes {
            if mono_data {
                pass.decorr_mono(buf);
            } else {
                pass.decorr_stereo(buf);
            }
        }

        if !mono_data && flags.contains(BlockFlags::JOINT_STEREO) {
            for f in buf.chunks_exact_mut(2) {
                f[1] = f[1].wrapping_sub(f[0] >> 1);
                f[0] = f[0].wrapping_add(f[1]);
            }
        }

        for &s in buf.iter() {
            self.crc = self.crc.wrapping_mul(3).wrapping_add(s as u32);
        }

        let limit = mute_limit(flags);
        let overflow = buf.iter().any(|&s| i64::from(s).abs() > limit);
        if decoded < frames || exhausted || overflow {
            log::warn!(
                target: "wvdec::unpack",
                "{{ msg: \"corrupted bitstream, muting block\", block_index: {}, decoded: {decoded}, requested: {frames}, overflow: {overflow} }}",
                header.block_index
            );
            buf.fill(0);
            self.mute_error = true;
        } else {
            fixup(flags, &self.params, buf);
        }

        if data_width == 1 && out_width == 2 {
            for i in (0..frames).rev() {
                let s = self.scratch[i];
                self.scratch[2 * i] = s;
                self.scratch[2 * i + 1] = s;
            }
        }
        &self.scratch[..frames * out_width]
    }

    /// Compares the running checksum with the header once per block.
    ///
    /// Returns `None` if there's no block or it was already checked.
    pub fn verify_checksum(&mut self) -> Option<bool> {
        let header = self.header?;
        if self.crc_checked {
            return None;
        }
        self.crc_checked = true;
        Some(self.crc == header.crc)
    }
}

impl Default for BlockUnpacker {
    fn default() -> Self {
        Self::new(crate::constant::DEFAULT_BITSTREAM_BUFFER_SIZE)
    }
}

/// Largest plausible absolute value of a decoded sample.
fn mute_limit(flags: BlockFlags) -> i64 {
    let limit = (1i64 << flags.magnitude()) + 2;
    if flags.contains(BlockFlags::HYBRID) {
        limit * 2
    } else {
        limit
    }
}

fn shl(value: i32, shift: u32) -> i32 {
    value.checked_shl(shift).unwrap_or(0)
}

/// Restores the original sample format from the decorrelated values.
fn fixup(flags: BlockFlags, params: &BlockParams, buf: &mut [i32]) {
    if flags.contains(BlockFlags::FLOAT_DATA) {
        float_values(&params.float_info, buf);
        return;
    }

    let mut shift = flags.shift();
    if flags.contains(BlockFlags::INT32_DATA) {
        let info = params.int32_info;
        let sent = u32::from(info.sent_bits);
        let zeros = u32::from(info.zeros);
        let ones = u32::from(info.ones);
        let dups = u32::from(info.dups);

        if !flags.contains(BlockFlags::HYBRID) && sent == 0 && zeros + ones + dups > 0 {
            for v in buf.iter_mut() {
                if zeros > 0 {
                    *v = shl(*v, zeros);
                } else if ones > 0 {
                    *v = shl(v.wrapping_add(1), ones).wrapping_sub(1);
                } else {
                    let lsb = *v & 1;
                    *v = shl(v.wrapping_add(lsb), dups).wrapping_sub(lsb);
                }
            }
        } else {
            shift += zeros + sent + ones + dups;
        }
    }

    if flags.contains(BlockFlags::HYBRID) {
        let (min, max) = match flags.bytes_stored() {
            1 => (-128, 127),
            2 => (-32_768, 32_767),
            3 => (-8_388_608, 8_388_607),
            _ => (i32::MIN, i32::MAX),
        };
        let s = shift.min(31);
        let (min, max) = (min >> s, max >> s);
        for v in buf.iter_mut() {
            *v = shl((*v).clamp(min, max), shift);
        }
    } else if shift > 0 {
        for v in buf.iter_mut() {
            *v = shl(*v, shift);
        }
    }
}

/// Scales integer-coded float data to 24-bit integers.
///
/// The shift is done in 32 bits and may wrap before the result is
/// saturated, as the reference decoder does for out-of-range exponents.
fn float_values(info: &FloatInfo, buf: &mut [i32]) {
    let shift = (i32::from(info.max_exp) - i32::from(info.norm_exp) + i32::from(info.shift))
        .clamp(-32, 32);
    for v in buf.iter_mut() {
        let x = if shift >= 0 {
            v.wrapping_shl(shift as u32)
        } else {
            v.wrapping_shr(shift.unsigned_abs())
        };
        *v = x.clamp(FLOAT_INT_MIN, FLOAT_INT_MAX);
    }
}
