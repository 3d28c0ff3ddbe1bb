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

//! Block header locator and parser.

use std::io::Read;

use bitflags::bitflags;
use nom::bytes::complete::tag;
use nom::error::ParseError;
use nom::number::complete::le_u16;
use nom::number::complete::le_u32;
use nom::number::complete::le_u8;
use nom::IResult;

use crate::bitsource::CountingReader;
use crate::constant::header::COUNTED_HEADER_BYTES;
use crate::constant::header::HEADER_SIZE;
use crate::constant::header::MAGIC;
use crate::constant::header::MAX_STREAM_VERSION;
use crate::constant::header::MIN_STREAM_VERSION;
use crate::constant::header::UNKNOWN_TOTAL_SAMPLES;
use crate::error::DecodeError;
use crate::error::FormatError;

bitflags! {
    /// Flags word of a block header.
    ///
    /// Besides the single-bit flags, the word packs several small integer
    /// fields that are exposed through dedicated accessors.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BlockFlags: u32 {
        /// Mono block (otherwise stereo).
        const MONO = 0x4;
        /// Hybrid (lossy) mode.
        const HYBRID = 0x8;
        /// Left/right channels are stored as mid/side.
        const JOINT_STEREO = 0x10;
        /// Cross-channel decorrelation is enabled.
        const CROSS_DECORR = 0x20;
        /// Noise shaping in hybrid mode.
        const HYBRID_SHAPE = 0x40;
        /// The samples are IEEE floats reduced to integers.
        const FLOAT_DATA = 0x80;
        /// The samples are 32-bit integers with special bit handling.
        const INT32_DATA = 0x100;
        /// Hybrid mode with a bitrate controlled by the noise level.
        const HYBRID_BITRATE = 0x200;
        /// Hybrid mode with balanced noise between channels.
        const HYBRID_BALANCE = 0x400;
        /// First block of a multichannel set.
        const INITIAL_BLOCK = 0x800;
        /// Last block of a multichannel set.
        const FINAL_BLOCK = 0x1000;
        /// Stereo block carrying identical channels as mono data.
        const FALSE_STEREO = 0x4000_0000;

        const _ = !0;
    }
}

impl BlockFlags {
    const BYTES_STORED_MASK: u32 = 0x3;
    const SHIFT_LSB: u32 = 13;
    const MAG_LSB: u32 = 18;
    const SRATE_LSB: u32 = 23;

    /// Returns the number of bytes per sample in the original data (1-4).
    pub const fn bytes_stored(self) -> u32 {
        (self.bits() & Self::BYTES_STORED_MASK) + 1
    }

    /// Returns the number of low-order zero bits removed before encoding.
    pub const fn shift(self) -> u32 {
        (self.bits() >> Self::SHIFT_LSB) & 0x1f
    }

    /// Returns the maximum magnitude of decoded values in bits.
    pub const fn magnitude(self) -> u32 {
        (self.bits() >> Self::MAG_LSB) & 0x1f
    }

    /// Returns the 4-bit sample rate code (15 means "custom or unknown").
    pub const fn sample_rate_code(self) -> usize {
        ((self.bits() >> Self::SRATE_LSB) & 0xf) as usize
    }

    /// Returns true if the block stores a single channel of residuals.
    pub fn is_mono_data(self) -> bool {
        self.intersects(Self::MONO | Self::FALSE_STEREO)
    }
}

/// Decoded 32-byte block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Size of the block excluding the magic and this field.
    pub block_size: u32,
    /// Stream version (0x402-0x410).
    pub version: u16,
    pub track_no: u8,
    pub index_no: u8,
    /// Total number of samples in the stream, if recorded.
    pub total_samples: Option<u32>,
    /// Index of the first sample of this block.
    pub block_index: u32,
    /// Number of samples in this block. Zero for metadata-only blocks.
    pub block_samples: u32,
    pub flags: BlockFlags,
    /// Checksum of the decoded samples.
    pub crc: u32,
}

impl BlockHeader {
    /// Returns the number of bytes following the 32-byte header.
    pub const fn payload_size(&self) -> u32 {
        self.block_size.saturating_sub(COUNTED_HEADER_BYTES)
    }

    /// Returns the index of the first sample after this block.
    pub fn end_index(&self) -> u64 {
        u64::from(self.block_index) + u64::from(self.block_samples)
    }

    /// Returns true if the header starts a multichannel set.
    pub fn is_initial(&self) -> bool {
        self.flags.contains(BlockFlags::INITIAL_BLOCK)
    }
}

/// Checks the fixed header fields that identify a decodable block.
fn is_valid_header(buf: &[u8; HEADER_SIZE]) -> bool {
    buf[..4] == MAGIC
        && buf[4] & 1 == 0
        && buf[6] < 16
        && buf[7] == 0
        && buf[9] == (MIN_STREAM_VERSION >> 8) as u8
        && buf[8] >= (MIN_STREAM_VERSION & 0xff) as u8
        && buf[8] <= (MAX_STREAM_VERSION & 0xff) as u8
}

/// Recognizes [`BlockHeader`].
///
/// # Errors
///
/// Same as other nom parsers, this returns [`nom::Err`] if `input` doesn't conforms the format.
pub fn block_header<'a, E>(input: &'a [u8]) -> IResult<&'a [u8], BlockHeader, E>
where
    E: ParseError<&'a [u8]>,
{
    let remaining_input = input;
    let (remaining_input, _) = tag(&MAGIC[..])(remaining_input)?;
    let (remaining_input, block_size) = le_u32(remaining_input)?;
    let (remaining_input, version) = le_u16(remaining_input)?;
    let (remaining_input, track_no) = le_u8(remaining_input)?;
    let (remaining_input, index_no) = le_u8(remaining_input)?;
    let (remaining_input, total_samples) = le_u32(remaining_input)?;
    let (remaining_input, block_index) = le_u32(remaining_input)?;
    let (remaining_input, block_samples) = le_u32(remaining_input)?;
    let (remaining_input, flags) = le_u32(remaining_input)?;
    let (remaining_input, crc) = le_u32(remaining_input)?;

    let total_samples = (total_samples != UNKNOWN_TOTAL_SAMPLES).then_some(total_samples);
    Ok((
        remaining_input,
        BlockHeader {
            block_size,
            version,
            track_no,
            index_no,
            total_samples,
            block_index,
            block_samples,
            flags: BlockFlags::from_bits_retain(flags),
            crc,
        },
    ))
}

/// Reads from `source` until a valid block header is found.
///
/// Junk before the header is skipped one byte at a time, jumping ahead to
/// the next `w` in the 32-byte window. No byte after the header is read.
///
/// # Errors
///
/// Returns [`DecodeError::StreamEnded`] when the source ends, or a format
/// error when more than `resync_limit` bytes were skipped.
pub fn read_next_header<R: Read>(
    source: &mut CountingReader<R>,
    resync_limit: usize,
) -> Result<BlockHeader, DecodeError> {
    let mut window = [0u8; HEADER_SIZE];
    let mut filled = 0usize;
    let mut skipped = 0usize;
    let start = source.position();

    loop {
        source
            .read_exact(&mut window[filled..])
            .map_err(DecodeError::from_io)?;

        if is_valid_header(&window) {
            let (_, header) = block_header::<nom::error::Error<&[u8]>>(&window).map_err(|_e| {
                FormatError::new(source.position() - HEADER_SIZE as u64, "broken block header")
            })?;
            if skipped > 0 {
                log::warn!(
                    target: "wvdec::header",
                    "{{ msg: \"resynchronized\", skipped_bytes: {skipped}, from: {start} }}"
                );
            }
            log::debug!(
                target: "wvdec::header",
                "{{ block_index: {}, block_samples: {}, block_size: {}, flags: {:#010x} }}",
                header.block_index,
                header.block_samples,
                header.block_size,
                header.flags.bits()
            );
            return Ok(header);
        }

        let mut drop = 1;
        while drop < HEADER_SIZE && window[drop] != MAGIC[0] {
            drop += 1;
        }
        window.copy_within(drop.., 0);
        filled = HEADER_SIZE - drop;
        skipped += drop;

        if skipped > resync_limit {
            return Err(FormatError::new(
                source.position(),
                "no valid block header found within the resync limit",
            )
            .into());
        }
    }
}
