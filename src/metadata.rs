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

//! Metadata sub-block reader.
//!
//! Every block header is followed by a sequence of sub-blocks. Those that
//! precede the bitstream sub-block configure the decoder for the block; the
//! bitstream itself is left in the source for the bit reader.

use std::io::Read;

use nom::combinator::eof;
use nom::error::ParseError;
use nom::multi::count;
use nom::number::complete::le_i16;
use nom::number::complete::le_u16;
use nom::number::complete::le_u8;
use nom::sequence::tuple;
use nom::IResult;

use crate::bitsource::CountingReader;
use crate::constant::decorr::MAX_NTERMS;
use crate::constant::float_flags;
use crate::constant::header::MIN_STREAM_VERSION;
use crate::constant::metadata_id;
use crate::decorr::restore_weight;
use crate::decorr::DecorrPass;
use crate::decorr::Term;
use crate::entropy::exp2s;
use crate::entropy::WordsState;
use crate::error::DecodeError;
use crate::error::FormatError;
use crate::header::BlockFlags;
use crate::header::BlockHeader;

type NomError<'a> = nom::error::Error<&'a [u8]>;

/// Largest sub-block that is loaded into memory for parsing.
const MAX_PARSED_SUB_BLOCK_SIZE: u64 = 1024;

/// Parameters for reconstructing floating-point data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FloatInfo {
    pub flags: u8,
    pub shift: u8,
    pub max_exp: u8,
    pub norm_exp: u8,
}

impl FloatInfo {
    /// Returns true if the integer approximation drops information that
    /// only the extension stream could restore.
    pub const fn is_lossy(&self) -> bool {
        self.flags
            & (float_flags::EXCEPTIONS
                | float_flags::ZEROS_SENT
                | float_flags::SHIFT_SENT
                | float_flags::SHIFT_SAME)
            != 0
    }
}

/// Parameters for reconstructing 32-bit integer data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Int32Info {
    /// Number of low bits moved to the extension stream.
    pub sent_bits: u8,
    /// Number of low bits that are always zero.
    pub zeros: u8,
    /// Number of low bits that are always one.
    pub ones: u8,
    /// Number of low bits that duplicate the lowest stored bit.
    pub dups: u8,
}

/// Channel count and speaker mask of the whole stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channels: u32,
    pub mask: u32,
}

/// Decoding parameters of the current block.
#[derive(Clone, Debug, Default)]
pub struct BlockParams {
    /// Decorrelation passes in the order they are applied.
    pub passes: heapless::Vec<DecorrPass, MAX_NTERMS>,
    pub words: WordsState,
    pub float_info: FloatInfo,
    pub int32_info: Int32Info,
}

/// Stream-level properties that may be carried by any block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamProps {
    pub channel_info: Option<ChannelInfo>,
    /// Encoder configuration bits 8-31.
    pub config_flags: Option<u32>,
    /// Sample rate not representable by the header's rate code.
    pub sample_rate: Option<u32>,
    pub md5_digest: Option<[u8; 16]>,
}

/// Location of the bitstream sub-block relative to the current position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitstreamSpan {
    /// Number of bitstream bytes starting at the current position.
    pub len: u64,
    /// Number of block bytes after the bitstream.
    pub trailing: u64,
}

#[derive(Clone, Copy, Debug)]
struct SubBlockHeader {
    id: u8,
    data_len: u64,
    padded_len: u64,
}

impl SubBlockHeader {
    const fn function(&self) -> u8 {
        self.id & metadata_id::UNIQUE
    }

    const fn is_optional(&self) -> bool {
        self.id & metadata_id::OPTIONAL_DATA != 0
    }
}

fn read_sub_block_header<R: Read>(
    source: &mut CountingReader<R>,
    payload_left: &mut u64,
) -> Result<SubBlockHeader, DecodeError> {
    let at = source.position();
    let truncated = || FormatError::new(at, "truncated metadata sub-block");

    if *payload_left < 2 {
        return Err(truncated().into());
    }
    let mut head = [0u8; 4];
    source
        .read_exact(&mut head[..2])
        .map_err(DecodeError::from_io)?;
    *payload_left -= 2;

    let id = head[0];
    let mut words = u64::from(head[1]);
    if id & metadata_id::LARGE != 0 {
        if *payload_left < 2 {
            return Err(truncated().into());
        }
        source
            .read_exact(&mut head[2..])
            .map_err(DecodeError::from_io)?;
        *payload_left -= 2;
        words |= u64::from(head[2]) << 8 | u64::from(head[3]) << 16;
    }

    let padded_len = words * 2;
    let data_len = if id & metadata_id::ODD_SIZE != 0 {
        padded_len.saturating_sub(1)
    } else {
        padded_len
    };
    if padded_len > *payload_left {
        return Err(truncated().into());
    }
    Ok(SubBlockHeader {
        id,
        data_len,
        padded_len,
    })
}

/// Reads the sub-blocks of a block up to its bitstream.
///
/// `params` is overwritten with the block's decoding parameters, and the
/// stream-level sub-blocks found are recorded in `props`. Returns the span of
/// the bitstream sub-block if one was found; the source is then positioned
/// at its first byte.
///
/// # Errors
///
/// Returns a format error for malformed or unknown mandatory sub-blocks, and
/// propagates source errors.
pub fn read_block_metadata<R: Read>(
    source: &mut CountingReader<R>,
    header: &BlockHeader,
    params: &mut BlockParams,
    props: &mut StreamProps,
) -> Result<Option<BitstreamSpan>, DecodeError> {
    *params = BlockParams::default();
    let mono = header.flags.is_mono_data();
    let mut payload_left = u64::from(header.payload_size());

    while payload_left > 0 {
        let at = source.position();
        let sub = read_sub_block_header(source, &mut payload_left)?;
        payload_left -= sub.padded_len;

        let function = sub.function();
        match function {
            metadata_id::WV_BITSTREAM => {
                return Ok(Some(BitstreamSpan {
                    len: sub.data_len,
                    trailing: payload_left + (sub.padded_len - sub.data_len),
                }));
            }
            metadata_id::DECORR_TERMS
            | metadata_id::DECORR_WEIGHTS
            | metadata_id::DECORR_SAMPLES
            | metadata_id::ENTROPY_VARS
            | metadata_id::HYBRID_PROFILE
            | metadata_id::FLOAT_INFO
            | metadata_id::INT32_INFO
            | metadata_id::CHANNEL_INFO
            | metadata_id::CONFIG_BLOCK
            | metadata_id::SAMPLE_RATE
            | metadata_id::MD5_CHECKSUM => {
                if sub.padded_len > MAX_PARSED_SUB_BLOCK_SIZE {
                    if sub.is_optional() {
                        skip_exact(source, sub.padded_len)?;
                        continue;
                    }
                    return Err(FormatError::new(at, "oversized metadata sub-block").into());
                }
                let mut data = vec![0u8; sub.padded_len as usize];
                source.read_exact(&mut data).map_err(DecodeError::from_io)?;
                data.truncate(sub.data_len as usize);

                apply_sub_block(function, &data, header, mono, params, props)
                    .map_err(|msg| FormatError::new(at, msg))?;
            }
            metadata_id::DUMMY
            | metadata_id::ENCODER_INFO
            | metadata_id::SHAPING_WEIGHTS
            | metadata_id::WVC_BITSTREAM
            | metadata_id::WVX_BITSTREAM => {
                skip_exact(source, sub.padded_len)?;
            }
            _ if sub.is_optional() => {
                skip_exact(source, sub.padded_len)?;
            }
            _ => {
                log::warn!(
                    target: "wvdec::metadata",
                    "{{ msg: \"unknown sub-block\", id: {:#04x}, offset: {at} }}",
                    sub.id
                );
                return Err(FormatError::new(at, "unknown metadata sub-block").into());
            }
        }
    }
    Ok(None)
}

fn skip_exact<R: Read>(source: &mut CountingReader<R>, n: u64) -> Result<(), DecodeError> {
    let skipped = source.skip(n).map_err(DecodeError::from_io)?;
    if skipped < n {
        return Err(DecodeError::stream_ended());
    }
    Ok(())
}

fn apply_sub_block(
    function: u8,
    data: &[u8],
    header: &BlockHeader,
    mono: bool,
    params: &mut BlockParams,
    props: &mut StreamProps,
) -> Result<(), &'static str> {
    match function {
        metadata_id::DECORR_TERMS => read_decorr_terms(data, mono, &mut params.passes),
        metadata_id::DECORR_WEIGHTS => read_decorr_weights(data, mono, &mut params.passes),
        metadata_id::DECORR_SAMPLES => {
            read_decorr_samples(data, mono, header, &mut params.passes)
        }
        metadata_id::ENTROPY_VARS => read_entropy_vars(data, mono, &mut params.words),
        metadata_id::HYBRID_PROFILE => {
            read_hybrid_profile(data, mono, header.flags, &mut params.words)
        }
        metadata_id::FLOAT_INFO => {
            params.float_info = parse_all(data, float_info::<NomError>, "invalid float info")?;
            Ok(())
        }
        metadata_id::INT32_INFO => {
            params.int32_info = parse_all(data, int32_info::<NomError>, "invalid int32 info")?;
            Ok(())
        }
        metadata_id::CHANNEL_INFO => {
            props.channel_info = Some(read_channel_info(data)?);
            Ok(())
        }
        metadata_id::CONFIG_BLOCK => {
            if data.len() >= 3 {
                props.config_flags = Some(
                    u32::from(data[0]) << 8 | u32::from(data[1]) << 16 | u32::from(data[2]) << 24,
                );
            }
            Ok(())
        }
        metadata_id::SAMPLE_RATE => {
            if data.len() == 3 || data.len() == 4 {
                let mut rate =
                    u32::from(data[0]) | u32::from(data[1]) << 8 | u32::from(data[2]) << 16;
                if data.len() == 4 {
                    rate |= u32::from(data[3] & 0x7f) << 24;
                }
                props.sample_rate = Some(rate);
            }
            Ok(())
        }
        metadata_id::MD5_CHECKSUM => {
            if let Ok(digest) = <[u8; 16]>::try_from(data) {
                props.md5_digest = Some(digest);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Runs `parser` on the whole of `data`, mapping any failure to `msg`.
fn parse_all<'a, T, P>(data: &'a [u8], mut parser: P, msg: &'static str) -> Result<T, &'static str>
where
    P: FnMut(&'a [u8]) -> IResult<&'a [u8], T, NomError<'a>>,
{
    let (remaining_input, value) = parser(data).map_err(|_e| msg)?;
    eof::<_, NomError>(remaining_input).map_err(|_e| msg)?;
    Ok(value)
}

fn read_decorr_terms(
    data: &[u8],
    mono: bool,
    passes: &mut heapless::Vec<DecorrPass, MAX_NTERMS>,
) -> Result<(), &'static str> {
    if data.len() > MAX_NTERMS {
        return Err("too many decorrelation terms");
    }
    passes.clear();
    // The last stored term is applied first.
    for &b in data.iter().rev() {
        let code = i32::from(b & 0x1f) - 5;
        let delta = i32::from((b >> 5) & 0x7);
        let term = Term::from_code(code).ok_or("invalid decorrelation term")?;
        if mono && term.is_cross() {
            return Err("cross-channel decorrelation term in mono block");
        }
        passes
            .push(DecorrPass::new(term, delta))
            .map_err(|_pass| "too many decorrelation terms")?;
    }
    Ok(())
}

fn read_decorr_weights(
    data: &[u8],
    mono: bool,
    passes: &mut [DecorrPass],
) -> Result<(), &'static str> {
    let per_pass = if mono { 1 } else { 2 };
    let termcnt = data.len() / per_pass;
    if termcnt > passes.len() {
        return Err("more decorrelation weights than terms");
    }
    for pass in passes.iter_mut() {
        pass.weight_a = 0;
        pass.weight_b = 0;
    }
    for (pass, w) in passes
        .iter_mut()
        .rev()
        .zip(data.chunks_exact(per_pass))
    {
        pass.weight_a = restore_weight(i8::from_le_bytes([w[0]]));
        if !mono {
            pass.weight_b = restore_weight(i8::from_le_bytes([w[1]]));
        }
    }
    Ok(())
}

fn read_decorr_samples(
    data: &[u8],
    mono: bool,
    header: &BlockHeader,
    passes: &mut [DecorrPass],
) -> Result<(), &'static str> {
    for pass in passes.iter_mut() {
        pass.clear_history();
    }

    let mut remaining_input = data;
    // Hybrid blocks of the oldest version lead with the noise shaping
    // errors, one 16-bit value per channel.
    if header.version == MIN_STREAM_VERSION && header.flags.contains(BlockFlags::HYBRID) {
        let skip = if mono { 2 } else { 4 };
        remaining_input = remaining_input
            .get(skip..)
            .ok_or("truncated decorrelation samples")?;
    }
    for pass in passes.iter_mut().rev() {
        if remaining_input.is_empty() {
            break;
        }
        let history = pass.term.history_len();
        let per_channel = if mono || pass.term.is_cross() { 1 } else { 2 };
        let values = if pass.term.is_cross() { 2 } else { history * per_channel };

        let (rest, raw) = count(le_i16::<_, NomError>, values)(remaining_input)
            .map_err(|_e| "truncated decorrelation samples")?;
        remaining_input = rest;

        let mut it = raw.into_iter().map(|v| exp2s(i32::from(v)));
        match pass.term {
            Term::CrossLeft | Term::CrossRight | Term::CrossBoth => {
                pass.samples_a[0] = it.next().unwrap_or(0);
                pass.samples_b[0] = it.next().unwrap_or(0);
            }
            Term::Linear | Term::Damped => {
                for v in &mut pass.samples_a[..2] {
                    *v = it.next().unwrap_or(0);
                }
                if !mono {
                    for v in &mut pass.samples_b[..2] {
                        *v = it.next().unwrap_or(0);
                    }
                }
            }
            Term::Delay(_) => {
                for m in 0..history {
                    pass.samples_a[m] = it.next().unwrap_or(0);
                    if !mono {
                        pass.samples_b[m] = it.next().unwrap_or(0);
                    }
                }
            }
        }
    }

    if remaining_input.is_empty() {
        Ok(())
    } else {
        Err("excess decorrelation samples")
    }
}

#[allow(clippy::cast_sign_loss)]
fn read_entropy_vars(data: &[u8], mono: bool, words: &mut WordsState) -> Result<(), &'static str> {
    let channels = if mono { 1 } else { 2 };
    let medians = parse_all(
        data,
        count(le_u16::<_, NomError>, 3 * channels),
        "invalid entropy variables",
    )?;
    for (c, m) in words.c.iter_mut().zip(medians.chunks_exact(3)) {
        for i in 0..3 {
            c.median[i] = exp2s(i32::from(m[i])) as u32;
        }
    }
    Ok(())
}

#[allow(clippy::cast_sign_loss)]
fn read_hybrid_profile(
    data: &[u8],
    mono: bool,
    flags: BlockFlags,
    words: &mut WordsState,
) -> Result<(), &'static str> {
    const TRUNCATED: &str = "truncated hybrid profile";
    let channels = if mono { 1 } else { 2 };
    let mut remaining_input = data;

    if flags.contains(BlockFlags::HYBRID_BITRATE) {
        let (rest, levels) =
            count(le_u16::<_, NomError>, channels)(remaining_input)
                .map_err(|_e| TRUNCATED)?;
        remaining_input = rest;
        for (c, level) in words.c.iter_mut().zip(levels) {
            c.slow_level = exp2s(i32::from(level)) as u32;
        }
    }

    let (rest, accs) = count(le_u16::<_, NomError>, channels)(remaining_input)
        .map_err(|_e| TRUNCATED)?;
    remaining_input = rest;
    for (c, acc) in words.c.iter_mut().zip(accs) {
        c.bitrate_acc = u32::from(acc) << 16;
    }

    if remaining_input.is_empty() {
        for c in &mut words.c {
            c.bitrate_delta = 0;
        }
        return Ok(());
    }

    let deltas = parse_all(
        remaining_input,
        count(le_i16::<_, NomError>, channels),
        "invalid hybrid bitrate deltas",
    )?;
    for (c, delta) in words.c.iter_mut().zip(deltas) {
        c.bitrate_delta = exp2s(i32::from(delta)) as u32;
    }
    Ok(())
}

fn float_info<'a, E>(input: &'a [u8]) -> IResult<&'a [u8], FloatInfo, E>
where
    E: ParseError<&'a [u8]>,
{
    let (remaining_input, (flags, shift, max_exp, norm_exp)) =
        tuple((le_u8, le_u8, le_u8, le_u8))(input)?;
    Ok((
        remaining_input,
        FloatInfo {
            flags,
            shift,
            max_exp,
            norm_exp,
        },
    ))
}

fn int32_info<'a, E>(input: &'a [u8]) -> IResult<&'a [u8], Int32Info, E>
where
    E: ParseError<&'a [u8]>,
{
    let (remaining_input, (sent_bits, zeros, ones, dups)) =
        tuple((le_u8, le_u8, le_u8, le_u8))(input)?;
    Ok((
        remaining_input,
        Int32Info {
            sent_bits,
            zeros,
            ones,
            dups,
        },
    ))
}

fn read_channel_info(data: &[u8]) -> Result<ChannelInfo, &'static str> {
    if data.is_empty() || data.len() > 5 {
        return Err("invalid channel info");
    }
    let mut mask = 0u32;
    for (i, &b) in data[1..].iter().enumerate() {
        mask |= u32::from(b) << (8 * i);
    }
    Ok(ChannelInfo {
        channels: u32::from(data[0]),
        mask,
    })
}
