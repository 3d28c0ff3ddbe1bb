// Copyright 2022 Google LLC
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

//! Format constants

#![allow(dead_code)] // it's okay if some WavPack-format constants are not used.

// Constance sorted in an alphabetical-order.  Top-level constants first, and
// then sub-modules. Constants that are used only in a specific sub-module or
// its caller should be placed in the corresponding submodule.

/// Default size of the byte buffer used by the bitstream reader.
pub const DEFAULT_BITSTREAM_BUFFER_SIZE: usize = 1024;

/// Default number of bytes that may be skipped while searching a header.
pub const DEFAULT_RESYNC_LIMIT: usize = 1_048_576;

/// Sampling rate reported when the stream doesn't specify one.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Maximum number of channels reconstructed from a stream.
pub const MAX_DECODED_CHANNELS: usize = 2;

/// Sampling rates indexed by the 4-bit rate code in the block flags.
pub const SAMPLE_RATES: [u32; 15] = [
    6000, 8000, 9600, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 88200, 96000,
    192_000,
];

/// Sub-module containing constants related to build-time information.
pub mod build_info {
    pub const CRATE_VERSION: &str = match option_env!("CARGO_PKG_VERSION") {
        Some(v) => v,
        None => "unknown",
    };
}

/// Bits of the encoder configuration word.
///
/// Bits 0-7 mirror the block flags of the first audio block; the rest are
/// supplied by the config sub-block.
pub mod config_flags {
    pub const HYBRID: u32 = 0x8;
    pub const FLOAT_DATA: u32 = 0x80;
    pub const FAST: u32 = 0x200;
    pub const HIGH: u32 = 0x800;
    pub const LOSSY_MODE: u32 = 0x0100_0000;
}

/// Constants related to the 32-byte block header.
pub mod header {
    /// Size of the block header in bytes.
    pub const HEADER_SIZE: usize = 32;

    /// Magic bytes at the beginning of every block.
    pub const MAGIC: [u8; 4] = *b"wvpk";

    /// Number of header bytes counted in `block_size` (everything after
    /// the magic and the size field itself).
    pub const COUNTED_HEADER_BYTES: u32 = 24;

    /// Lowest stream version decodable.
    pub const MIN_STREAM_VERSION: u16 = 0x402;

    /// Highest stream version decodable.
    pub const MAX_STREAM_VERSION: u16 = 0x410;

    /// Value of `total_samples` meaning "unknown".
    pub const UNKNOWN_TOTAL_SAMPLES: u32 = u32::MAX;
}

/// Constants related to the decorrelation passes.
pub mod decorr {
    /// Maximum history length of a delay term.
    pub const MAX_TERM: usize = 8;

    /// Maximum number of passes in a block.
    pub const MAX_NTERMS: usize = 16;

    /// Absolute bound for the weights of cross-channel terms.
    pub const CROSS_WEIGHT_LIMIT: i32 = 1024;

    /// Absolute bound for the weights of single-channel terms.
    pub const WEIGHT_LIMIT: i32 = 32767;
}

/// Constants related to the residual entropy coding.
pub mod entropy {
    /// Maximum number of consecutive ones sent for a unary prefix.
    pub const LIMIT_ONES: u32 = 16;

    /// Time constant (in bits) of the slow level used in hybrid mode.
    pub const SLOW_LEVEL_SHIFT: u32 = 8;

    /// Rounding offset for `SLOW_LEVEL_SHIFT`.
    pub const SLOW_LEVEL_OFFSET: u32 = 1 << (SLOW_LEVEL_SHIFT - 1);

    /// Divisors for the three median breakpoints.
    pub const MEDIAN_DIVISORS: [u32; 3] = [128, 64, 32];
}

/// Identifiers of metadata sub-blocks.
pub mod metadata_id {
    pub const UNIQUE: u8 = 0x3f;
    pub const OPTIONAL_DATA: u8 = 0x20;
    pub const ODD_SIZE: u8 = 0x40;
    pub const LARGE: u8 = 0x80;

    pub const DUMMY: u8 = 0x00;
    pub const ENCODER_INFO: u8 = 0x01;
    pub const DECORR_TERMS: u8 = 0x02;
    pub const DECORR_WEIGHTS: u8 = 0x03;
    pub const DECORR_SAMPLES: u8 = 0x04;
    pub const ENTROPY_VARS: u8 = 0x05;
    pub const HYBRID_PROFILE: u8 = 0x06;
    pub const SHAPING_WEIGHTS: u8 = 0x07;
    pub const FLOAT_INFO: u8 = 0x08;
    pub const INT32_INFO: u8 = 0x09;
    pub const WV_BITSTREAM: u8 = 0x0a;
    pub const WVC_BITSTREAM: u8 = 0x0b;
    pub const WVX_BITSTREAM: u8 = 0x0c;
    pub const CHANNEL_INFO: u8 = 0x0d;

    pub const RIFF_HEADER: u8 = 0x21;
    pub const RIFF_TRAILER: u8 = 0x22;
    pub const REPLAY_GAIN: u8 = 0x23;
    pub const CUESHEET: u8 = 0x24;
    pub const CONFIG_BLOCK: u8 = 0x25;
    pub const MD5_CHECKSUM: u8 = 0x26;
    pub const SAMPLE_RATE: u8 = 0x27;
}

/// Flags carried in the float-info sub-block.
pub mod float_flags {
    pub const SHIFT_ONES: u8 = 0x01;
    pub const SHIFT_SAME: u8 = 0x02;
    pub const SHIFT_SENT: u8 = 0x04;
    pub const ZEROS_SENT: u8 = 0x08;
    pub const NEG_ZEROS: u8 = 0x10;
    pub const EXCEPTIONS: u8 = 0x20;
}

/// Module for internal error messages.
///
/// Use `panic!` and those messages only for caller contract violations.
pub(crate) mod panic_msg {
    pub const DEST_TOO_SHORT: &str =
        "Destination buffer is shorter than the requested number of frames.";
    pub const TOO_MANY_BITS: &str = "INTERNAL ERROR: More than 32 bits requested at once.";
}
