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

//! Decoder configuration structs.

#[cfg(feature = "serde")]
use serde::Deserialize;
#[cfg(feature = "serde")]
use serde::Serialize;

use super::constant::DEFAULT_BITSTREAM_BUFFER_SIZE;
use super::constant::DEFAULT_RESYNC_LIMIT;
use super::error::verify_range;
use super::error::verify_true;
use super::error::Verify;
use super::error::VerifyError;

/// Configuration for decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Decoder {
    /// Number of bytes that may be skipped while searching for the next
    /// block header before the stream is regarded as broken.
    pub resync_limit: usize,
    /// Size of the byte buffer that backs the bitstream reader.
    pub bitstream_buffer_size: usize,
    /// If set to false, per-block checksums are not compared and the
    /// checksum-error counter stays at zero.
    pub verify_checksums: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            resync_limit: DEFAULT_RESYNC_LIMIT,
            bitstream_buffer_size: DEFAULT_BITSTREAM_BUFFER_SIZE,
            verify_checksums: true,
        }
    }
}

impl Verify for Decoder {
    fn verify(&self) -> Result<(), VerifyError> {
        verify_true!(
            "resync_limit",
            self.resync_limit > 0,
            "must be a positive number of bytes"
        )?;
        // 8 bytes is the minimum needed to top the accumulator up in one step.
        verify_range!("bitstream_buffer_size", self.bitstream_buffer_size, 8..)?;
        Ok(())
    }
}
