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

#![no_main]

use std::io::Cursor;

use arbitrary::Arbitrary;
use arbitrary::Unstructured;
use libfuzzer_sys::fuzz_target;

use wvdec::config;
use wvdec::Decoder;

fn arbitrary_config(u: &mut Unstructured) -> Result<config::Decoder, arbitrary::Error> {
    let mut config = config::Decoder::default();
    config.resync_limit = u.int_in_range(1..=1 << 16)?;
    config.bitstream_buffer_size = u.int_in_range(8..=4096)?;
    config.verify_checksums = bool::arbitrary(u)?;
    Ok(config)
}

#[derive(Debug)]
struct FuzzInput {
    config: config::Decoder,
    chunk_frames: usize,
    bytes: Vec<u8>,
}

impl<'a> Arbitrary<'a> for FuzzInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> Result<Self, arbitrary::Error> {
        let config = arbitrary_config(u)?;
        let chunk_frames = u.int_in_range(1..=8192)?;
        let bytes = u.take_rest().to_vec();
        Ok(Self {
            config,
            chunk_frames,
            bytes,
        })
    }
}

fuzz_target!(|input: FuzzInput| {
    let Ok(mut decoder) = Decoder::open_with_config(Cursor::new(input.bytes), &input.config)
    else {
        return;
    };
    let width = decoder.info().output_channels();
    assert!(width == 1 || width == 2);

    let mut buffer = vec![0i32; input.chunk_frames * width];
    let mut prev_index = decoder.sample_index();
    let mut prev_errors = 0;
    loop {
        let n = decoder.unpack_samples(&mut buffer, input.chunk_frames);
        assert!(n <= input.chunk_frames);
        assert!(decoder.sample_index() >= prev_index + n as u64);
        assert!(decoder.checksum_errors() >= prev_errors);
        prev_index = decoder.sample_index();
        prev_errors = decoder.checksum_errors();
        if n == 0 {
            break;
        }
    }
});
