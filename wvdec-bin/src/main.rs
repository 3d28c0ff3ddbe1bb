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

#![doc = include_str!("../README.md")]
// Note that clippy attributes should be in sync with those declared in "lib.rs"
#![warn(clippy::all, clippy::nursery, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate
)]
// Some from restriction lint-group
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::create_dir,
    clippy::dbg_macro,
    clippy::empty_structs_with_brackets,
    clippy::exit,
    clippy::if_then_some_else_none,
    clippy::impl_trait_in_params,
    clippy::lossy_float_literal,
    clippy::multiple_inherent_impl,
    clippy::print_stdout,
    clippy::rc_buffer,
    clippy::rc_mutex,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::separated_literal_suffix,
    clippy::str_to_string,
    clippy::string_add,
    clippy::string_to_string,
    clippy::try_err,
    clippy::unnecessary_self_imports,
    clippy::wildcard_enum_match_arm
)]

use std::fs::File;
use std::io::BufReader;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::info;

use termcolor::Color;
use termcolor::ColorChoice;
use termcolor::ColorSpec;
use termcolor::StandardStream;
use termcolor::WriteColor;

use wvdec::config;
use wvdec::error::Verify;
use wvdec::Decoder;

/// Version of the decoder binary.
const CRATE_VERSION: &str = match option_env!("CARGO_PKG_VERSION") {
    Some(v) => v,
    None => "unknown",
};

/// Number of frames decoded per call.
const CHUNK_FRAMES: usize = 4096;

/// WavPack decoder.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path for the output WAV file.
    #[clap(short, long)]
    output: String,
    /// If set, load config from the specified file.
    #[clap(short, long)]
    config: Option<String>,
    /// Path for the input WavPack file.
    source: String,
}

/// Exit codes of the decoder process.
enum ExitCode {
    #[allow(dead_code)]
    Normal = 0,
    InvalidConfig = -1,
    OpenFailed = -2,
    DecodeFailed = -3,
    SampleCountMismatch = -4,
    ChecksumMismatch = -5,
}

/// Obtains `termcolor::StandardStream` for the default outputs.
fn terminal_output() -> Arc<termcolor::StandardStream> {
    Arc::new(StandardStream::stderr(ColorChoice::Auto))
}

/// Shows program banner.
///
/// # Errors
///
/// Propagates unknown I/O errors.
pub fn show_banner() -> Result<(), std::io::Error> {
    let termout = terminal_output();
    let mut termout = termout.lock();
    termout.set_color(ColorSpec::new().set_bold(true))?;
    write!(termout, "\n{:>10} ", "wvdec")?;
    termout.reset()?;
    writeln!(
        termout,
        "(decCLI v{}, engine v{})",
        CRATE_VERSION,
        wvdec::constant::build_info::CRATE_VERSION,
    )?;
    termout.reset()
}

/// Shows a one-line summary of the decoding result.
///
/// # Errors
///
/// Propagates unknown I/O errors.
fn show_summary(frames: u64, checksum_errors: u64, secs: f64) -> Result<(), std::io::Error> {
    let termout = terminal_output();
    let mut termout = termout.lock();
    let (label, color) = if checksum_errors == 0 {
        ("Done", Color::Green)
    } else {
        ("Corrupted", Color::Red)
    };
    termout.set_color(ColorSpec::new().set_bold(true).set_fg(Some(color)))?;
    write!(termout, "{label:>10} ")?;
    termout.reset()?;
    writeln!(
        termout,
        "{frames} frames, {checksum_errors} checksum error(s), {secs:.3} secs"
    )?;
    termout.reset()
}

#[allow(clippy::expect_used, clippy::let_underscore_must_use)]
fn main_body(args: Args) -> Result<(), i32> {
    let _ = show_banner();

    let decoder_config = args.config.map_or_else(config::Decoder::default, |path| {
        let conf_str = std::fs::read_to_string(path).expect("Config file read error.");
        toml::from_str(&conf_str).expect("Config file syntax error.")
    });
    if let Err(e) = decoder_config.verify() {
        eprintln!("Error: {}", e.within("decoder_config"));
        return Err(ExitCode::InvalidConfig as i32);
    }

    let file = File::open(&args.source).expect("Could not open the input file.");
    let mut decoder = match Decoder::open_with_config(BufReader::new(file), &decoder_config) {
        Ok(decoder) => decoder,
        Err(e) => {
            eprintln!("Error: {e}");
            return Err(ExitCode::OpenFailed as i32);
        }
    };

    let info = decoder.info().clone();
    let width = info.output_channels();
    info!(
        target: "wvdec-bin::stream_info",
        "{{ sample_rate: {}, channels: {}, output_channels: {}, bits_per_sample: {}, total_samples: {:?}, mode: {:?} }}",
        info.sample_rate(),
        info.channels(),
        width,
        info.bits_per_sample(),
        info.total_samples(),
        info.mode(),
    );

    let mut writer = hound::WavWriter::create(
        args.output,
        hound::WavSpec {
            channels: width as u16,
            sample_rate: info.sample_rate(),
            bits_per_sample: (info.bytes_per_sample() * 8) as u16,
            sample_format: hound::SampleFormat::Int,
        },
    )
    .expect("Failed to create writer");

    let decode_start = Instant::now();
    let mut buffer = vec![0i32; CHUNK_FRAMES * width];
    let mut frames = 0u64;
    loop {
        let n = decoder.unpack_samples(&mut buffer, CHUNK_FRAMES);
        if n == 0 {
            break;
        }
        for v in &buffer[..n * width] {
            writer.write_sample(*v).expect("internal decoding error.");
        }
        frames += n as u64;
    }
    writer.finalize().expect("Failed to finalize the output.");

    let _ = show_summary(
        frames,
        decoder.checksum_errors(),
        decode_start.elapsed().as_secs_f64(),
    );

    if let Some(e) = decoder.error() {
        if !e.is_stream_ended() {
            eprintln!("Error: {e}");
            return Err(ExitCode::DecodeFailed as i32);
        }
    }
    if let Some(total) = info.total_samples() {
        if total != frames {
            eprintln!("Error: expected {total} frames, decoded {frames}.");
            return Err(ExitCode::SampleCountMismatch as i32);
        }
    }
    if decoder.checksum_errors() > 0 {
        return Err(ExitCode::ChecksumMismatch as i32);
    }
    Ok(())
}

fn main() -> Result<(), i32> {
    env_logger::Builder::from_env("WVDEC_LOG")
        .format_timestamp(None)
        .init();
    main_body(Args::parse())
}
