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

//! Stream-level decoder: opening a stream and pulling samples from it.

use std::io::Read;

use bitflags::bitflags;

use crate::bitsource::CountingReader;
use crate::config;
use crate::constant::config_flags;
use crate::constant::panic_msg;
use crate::constant::DEFAULT_SAMPLE_RATE;
use crate::constant::MAX_DECODED_CHANNELS;
use crate::constant::SAMPLE_RATES;
use crate::error::DecodeError;
use crate::error::Verified;
use crate::error::Verify;
use crate::header::read_next_header;
use crate::header::BlockFlags;
use crate::header::BlockHeader;
use crate::metadata::BlockParams;
use crate::metadata::StreamProps;
use crate::unpack::BlockUnpacker;

bitflags! {
    /// Encoding mode of a stream.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Mode: u32 {
        const LOSSLESS = 0x2;
        const HYBRID = 0x4;
        const FLOAT = 0x8;
        const HIGH = 0x20;
        const FAST = 0x40;
    }
}

/// Stream properties fixed when the stream is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    sample_rate: u32,
    channels: u32,
    channel_mask: u32,
    reduced_channels: Option<u32>,
    bits_per_sample: u32,
    bytes_per_sample: u32,
    total_samples: Option<u64>,
    config_flags: u32,
    float_norm_exp: u8,
    md5_digest: Option<[u8; 16]>,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 2,
            channel_mask: 3,
            reduced_channels: None,
            bits_per_sample: 16,
            bytes_per_sample: 2,
            total_samples: None,
            config_flags: 0,
            float_norm_exp: 0,
            md5_digest: None,
        }
    }
}

impl StreamInfo {
    /// Returns the properties of `decoder`, or the defaults if there is none.
    ///
    /// # Examples
    ///
    /// ```
    /// # use wvdec::decoder::{Decoder, StreamInfo};
    /// let info = StreamInfo::of::<std::io::Empty>(None);
    /// assert_eq!(info.sample_rate(), 44100);
    /// assert_eq!(info.channels(), 2);
    /// assert_eq!(info.bits_per_sample(), 16);
    /// assert_eq!(info.total_samples(), None);
    /// ```
    pub fn of<R: Read>(decoder: Option<&Decoder<R>>) -> Self {
        decoder.map_or_else(Self::default, |d| d.info.clone())
    }

    /// Derives the properties from the first audio block.
    fn from_first_block(header: &BlockHeader, props: &StreamProps, params: &BlockParams) -> Self {
        let flags = header.flags;
        let config_flags = (props.config_flags.unwrap_or(0) & !0xff) | (flags.bits() & 0xff);

        let (bytes_per_sample, bits_per_sample) = if config_flags & config_flags::FLOAT_DATA != 0
        {
            (3, 24)
        } else {
            let bytes = flags.bytes_stored();
            (bytes, (bytes * 8).saturating_sub(flags.shift()))
        };

        let sample_rate = props.sample_rate.unwrap_or_else(|| {
            SAMPLE_RATES
                .get(flags.sample_rate_code())
                .copied()
                .unwrap_or(DEFAULT_SAMPLE_RATE)
        });

        let mono_channels = if flags.contains(BlockFlags::MONO) { 1 } else { 2 };
        let (channels, channel_mask) = match props.channel_info {
            Some(info) if info.channels > 0 => (info.channels, info.mask),
            _ => (mono_channels, 5 - mono_channels),
        };
        let reduced_channels =
            (!flags.contains(BlockFlags::FINAL_BLOCK)).then_some(mono_channels);

        Self {
            sample_rate,
            channels,
            channel_mask,
            reduced_channels,
            bits_per_sample,
            bytes_per_sample,
            total_samples: header.total_samples.map(u64::from),
            config_flags,
            float_norm_exp: params.float_info.norm_exp,
            md5_digest: props.md5_digest,
        }
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns the number of channels of the original stream.
    pub const fn channels(&self) -> u32 {
        self.channels
    }

    /// Returns the speaker mask (`WAVEFORMATEXTENSIBLE` layout).
    pub const fn channel_mask(&self) -> u32 {
        self.channel_mask
    }

    /// Returns the number of channels carried by the first block set.
    ///
    /// This is less than [`Self::channels`] for multichannel streams, where
    /// only the first channel pair is decoded.
    pub fn reduced_channels(&self) -> u32 {
        self.reduced_channels.unwrap_or(self.channels)
    }

    /// Returns the number of samples per frame written by
    /// [`Decoder::unpack_samples`].
    pub fn output_channels(&self) -> usize {
        (self.reduced_channels() as usize).clamp(1, MAX_DECODED_CHANNELS)
    }

    pub const fn bits_per_sample(&self) -> u32 {
        self.bits_per_sample
    }

    pub const fn bytes_per_sample(&self) -> u32 {
        self.bytes_per_sample
    }

    /// Returns the number of frames in the stream, if recorded.
    pub const fn total_samples(&self) -> Option<u64> {
        self.total_samples
    }

    /// Returns the encoder configuration word.
    pub const fn config_flags(&self) -> u32 {
        self.config_flags
    }

    /// Returns the exponent that normalizes float data (127 for +/-1.0).
    pub const fn float_norm_exp(&self) -> u8 {
        self.float_norm_exp
    }

    /// Returns the MD5 digest of the original audio data if stored.
    pub const fn md5_digest(&self) -> Option<&[u8; 16]> {
        self.md5_digest.as_ref()
    }

    /// Returns the encoding mode declared by the encoder configuration.
    pub fn mode(&self) -> Mode {
        let mut mode = Mode::empty();
        if self.config_flags & config_flags::HYBRID != 0 {
            mode |= Mode::HYBRID;
        } else if self.config_flags & config_flags::LOSSY_MODE == 0 {
            mode |= Mode::LOSSLESS;
        }
        if self.config_flags & config_flags::FLOAT_DATA != 0 {
            mode |= Mode::FLOAT;
        }
        if self.config_flags & config_flags::HIGH != 0 {
            mode |= Mode::HIGH;
        }
        if self.config_flags & config_flags::FAST != 0 {
            mode |= Mode::FAST;
        }
        mode
    }
}

/// WavPack stream decoder.
///
/// # Examples
///
/// ```no_run
/// # use wvdec::decoder::Decoder;
/// let file = std::fs::File::open("input.wv").unwrap();
/// let mut decoder = Decoder::open(std::io::BufReader::new(file)).unwrap();
/// let width = decoder.info().output_channels();
/// let mut buffer = vec![0i32; 4096 * width];
/// loop {
///     let n = decoder.unpack_samples(&mut buffer, 4096);
///     if n == 0 {
///         break;
///     }
///     // `buffer[..n * width]` holds the decoded samples.
/// }
/// ```
#[derive(Debug)]
pub struct Decoder<R> {
    source: CountingReader<R>,
    config: Verified<config::Decoder>,
    info: StreamInfo,
    props: StreamProps,
    unpacker: BlockUnpacker,
    sample_index: u64,
    checksum_errors: u64,
    lossy_blocks: u64,
    error: Option<DecodeError>,
}

impl<R: Read> Decoder<R> {
    /// Opens a stream with the default configuration.
    ///
    /// # Errors
    ///
    /// Same as [`Decoder::open_with_config`].
    pub fn open(source: R) -> Result<Self, DecodeError> {
        Self::open_with_config(source, &config::Decoder::default())
    }

    /// Opens a stream, reading up to and including the metadata of the first
    /// block that carries audio.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Config`] if `config` is invalid, and any error
    /// that occurs before the first audio block is ready.
    pub fn open_with_config(source: R, config: &config::Decoder) -> Result<Self, DecodeError> {
        let config = config.clone().into_verified().map_err(|(_, e)| e)?;
        let mut source = CountingReader::new(source);
        let mut unpacker = BlockUnpacker::new(config.bitstream_buffer_size);
        let mut props = StreamProps::default();

        let header = loop {
            unpacker.discard_rest(&mut source)?;
            let header = read_next_header(&mut source, config.resync_limit)?;
            unpacker.init_block(&mut source, header, &mut props)?;
            if header.block_samples > 0 {
                break header;
            }
        };

        let info = StreamInfo::from_first_block(&header, &props, unpacker.params());
        log::debug!(
            target: "wvdec::decoder",
            "{{ msg: \"stream opened\", sample_rate: {}, channels: {}, bits_per_sample: {}, total_samples: {:?}, mode: {:?} }}",
            info.sample_rate,
            info.channels,
            info.bits_per_sample,
            info.total_samples,
            info.mode()
        );
        let lossy_blocks = u64::from(unpacker.is_lossy());

        Ok(Self {
            source,
            config,
            info,
            props,
            unpacker,
            sample_index: u64::from(header.block_index),
            checksum_errors: 0,
            lossy_blocks,
            error: None,
        })
    }

    /// Returns the stream properties.
    pub const fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Returns the index of the next frame to be produced.
    pub const fn sample_index(&self) -> u64 {
        self.sample_index
    }

    /// Returns the number of blocks whose checksum didn't match.
    pub const fn checksum_errors(&self) -> u64 {
        self.checksum_errors
    }

    /// Returns the number of lossy blocks read so far.
    pub const fn lossy_blocks(&self) -> u64 {
        self.lossy_blocks
    }

    /// Returns the error that stopped decoding, if any.
    ///
    /// [`DecodeError::StreamEnded`] here is the normal end of a stream with
    /// unknown length.
    pub const fn error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    /// Returns the encoding mode, taking the blocks read so far into account.
    pub fn mode(&self) -> Mode {
        let mode = self.info.mode();
        if self.lossy_blocks > 0 {
            mode - Mode::LOSSLESS
        } else {
            mode
        }
    }

    /// Returns the latest MD5 digest seen in the stream.
    pub const fn md5_digest(&self) -> Option<&[u8; 16]> {
        self.props.md5_digest.as_ref()
    }

    /// Unwraps the source.
    pub fn into_inner(self) -> R {
        self.source.into_inner()
    }

    /// Decodes up to `frames` frames into `dest`.
    ///
    /// Samples are interleaved with [`StreamInfo::output_channels`] samples
    /// per frame, right-justified in `i32`. Returns the number of frames
    /// written; fewer than `frames` means the stream has ended or a fatal
    /// error occurred (see [`Decoder::error`]).
    ///
    /// # Panics
    ///
    /// Panics if `dest` is shorter than `frames` frames.
    pub fn unpack_samples(&mut self, dest: &mut [i32], frames: usize) -> usize {
        let width = self.info.output_channels();
        assert!(dest.len() >= frames * width, "{}", panic_msg::DEST_TOO_SHORT);
        if self.error.is_some() {
            return 0;
        }

        let mut done = 0;
        while done < frames {
            let mut remaining = frames - done;
            if let Some(total) = self.info.total_samples {
                if self.sample_index >= total {
                    break;
                }
                remaining = clamp_to_usize(remaining, total - self.sample_index);
            }

            let Some(header) = self.active_header() else {
                if let Err(e) = self.advance_block() {
                    if e.is_stream_ended() {
                        log::debug!(target: "wvdec::decoder", "{{ msg: \"end of stream\", sample_index: {} }}", self.sample_index);
                    } else {
                        log::warn!(target: "wvdec::decoder", "{{ msg: \"decoding stopped\", sample_index: {}, error: \"{e}\" }}", self.sample_index);
                    }
                    self.error = Some(e);
                    break;
                }
                continue;
            };

            let block_index = u64::from(header.block_index);
            if self.sample_index < block_index {
                let gap = clamp_to_usize(remaining, block_index - self.sample_index);
                dest[done * width..(done + gap) * width].fill(0);
                done += gap;
                self.sample_index += gap as u64;
                continue;
            }

            let n = clamp_to_usize(remaining, header.end_index() - self.sample_index);
            let block_width = self.unpacker.block_width();
            let samples = self.unpacker.unpack(&mut self.source, n);
            copy_frames(samples, block_width, &mut dest[done * width..(done + n) * width], width);
            done += n;
            self.sample_index += n as u64;

            if self.sample_index == header.end_index() {
                self.finish_block(&header);
            }
        }
        done
    }

    /// Returns the header of the current block if it still has frames to
    /// produce.
    fn active_header(&self) -> Option<BlockHeader> {
        self.unpacker.header().copied().filter(|h| {
            h.block_samples > 0 && h.is_initial() && self.sample_index < h.end_index()
        })
    }

    /// Moves to the next block header and initializes it if it is decodable.
    fn advance_block(&mut self) -> Result<(), DecodeError> {
        self.unpacker.discard_rest(&mut self.source)?;
        let header = read_next_header(&mut self.source, self.config.resync_limit)?;

        if header.block_samples == 0 {
            return self
                .unpacker
                .init_block(&mut self.source, header, &mut self.props);
        }
        if !header.is_initial() {
            log::debug!(
                target: "wvdec::decoder",
                "{{ msg: \"skipping non-initial block\", block_index: {} }}",
                header.block_index
            );
            self.unpacker.skip_block(&header);
            return Ok(());
        }
        if header.end_index() <= self.sample_index {
            log::warn!(
                target: "wvdec::decoder",
                "{{ msg: \"skipping block behind the cursor\", block_index: {}, sample_index: {} }}",
                header.block_index,
                self.sample_index
            );
            self.unpacker.skip_block(&header);
            return Ok(());
        }

        self.unpacker
            .init_block(&mut self.source, header, &mut self.props)?;
        if self.unpacker.is_lossy() {
            self.lossy_blocks += 1;
        }

        let overlap = self.sample_index.saturating_sub(u64::from(header.block_index));
        if overlap > 0 {
            log::warn!(
                target: "wvdec::decoder",
                "{{ msg: \"dropping frames behind the cursor\", block_index: {}, frames: {overlap} }}",
                header.block_index
            );
            self.drop_frames(overlap);
        }
        Ok(())
    }

    /// Decodes and discards the first `frames` frames of the current block.
    fn drop_frames(&mut self, frames: u64) {
        let mut left = frames;
        while left > 0 {
            let n = clamp_to_usize(DROP_CHUNK_FRAMES, left);
            self.unpacker.unpack(&mut self.source, n);
            left -= n as u64;
        }
    }

    fn finish_block(&mut self, header: &BlockHeader) {
        if !self.config.verify_checksums {
            return;
        }
        if self.unpacker.verify_checksum() == Some(false) {
            self.checksum_errors += 1;
            log::warn!(
                target: "wvdec::decoder",
                "{{ msg: \"checksum mismatch\", block_index: {}, block_samples: {} }}",
                header.block_index,
                header.block_samples
            );
        }
    }
}

/// Number of frames decoded per step when dropping frames.
const DROP_CHUNK_FRAMES: usize = 4096;

fn clamp_to_usize(value: usize, bound: u64) -> usize {
    usize::try_from(bound).map_or(value, |b| value.min(b))
}

/// Copies interleaved frames, converting between mono and stereo.
fn copy_frames(src: &[i32], src_width: usize, dest: &mut [i32], dest_width: usize) {
    if src_width == dest_width {
        dest.copy_from_slice(src);
        return;
    }
    for (s, d) in src
        .chunks_exact(src_width)
        .zip(dest.chunks_exact_mut(dest_width))
    {
        for (ch, v) in d.iter_mut().enumerate() {
            *v = s[ch.min(src_width - 1)];
        }
    }
}
