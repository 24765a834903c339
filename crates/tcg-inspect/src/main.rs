//! Offline decoder for TCG Storage device traces.
//!
//! Reads a captured Level 0 Discovery blob or a captured ComPacket from a
//! file, binary or hex text, and prints what the wire layer makes of it.
//!
//! ```text
//! tcg-inspect discovery dump.bin
//! tcg-inspect payload reply.hex --hex --com-id 0x07FE
//! ```
//!
//! Set `RUST_LOG=debug` for parser diagnostics on stderr.

mod render;

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Args, Parser, Subcommand};
use tcg_core::TcgError;
use tcg_proto::DiscoveredCapabilities;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a Level 0 Discovery response
    Discovery {
        #[command(flatten)]
        input: Input,
    },
    /// Validate a ComPacket and list its token stream
    Payload {
        #[command(flatten)]
        input: Input,
        /// Extended ComID the ComPacket must carry; values below 0x10000
        /// are taken as a base ComID. Defaults to the one in the header.
        #[arg(long, value_parser = parse_com_id)]
        com_id: Option<u32>,
    },
}

#[derive(Args)]
struct Input {
    /// Captured bytes
    file: PathBuf,
    /// File holds hex text instead of raw bytes
    #[arg(long)]
    hex: bool,
}

impl Input {
    fn read(&self) -> Result<Vec<u8>, InspectError> {
        let raw = fs::read(&self.file).map_err(|source| InspectError::Read { path: self.file.clone(), source })?;
        let bytes = if self.hex {
            let text: Vec<u8> = raw.into_iter().filter(|byte| !byte.is_ascii_whitespace()).collect();
            hex::decode(text)?
        } else {
            raw
        };
        debug!(path = %self.file.display(), len = bytes.len(), "input read");
        Ok(bytes)
    }
}

/// Failures of one inspector run.
#[derive(Debug, Error)]
enum InspectError {
    #[error("cannot read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid hex input: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Decode(#[from] TcgError),

    #[error("cannot write output: {0}")]
    Output(#[from] io::Error),
}

fn parse_com_id(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => value.parse(),
    }
    .map_err(|err| format!("invalid ComID {value:?}: {err}"))?;
    Ok(if parsed <= 0xFFFF { parsed << 16 } else { parsed })
}

fn run(cli: &Cli) -> Result<(), InspectError> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match &cli.command {
        Command::Discovery { input } => {
            let blob = input.read()?;
            let capabilities = DiscoveredCapabilities::parse(&blob).map_err(TcgError::from)?;
            render::discovery(&mut out, &capabilities)?;
        },
        Command::Payload { input, com_id } => {
            let data = input.read()?;
            render::payload(&mut out, &data, *com_id)?;
        },
    }

    out.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = writeln!(io::stderr().lock(), "error: {err}");
            ExitCode::FAILURE
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn com_id_forms() {
        assert_eq!(parse_com_id("0x07FE"), Ok(0x07FE_0000));
        assert_eq!(parse_com_id("0x07FE0000"), Ok(0x07FE_0000));
        assert_eq!(parse_com_id("4096"), Ok(0x1000_0000));
        assert!(parse_com_id("07FE").is_err());
    }

    #[test]
    fn cli_parses_payload_flags() {
        let cli = Cli::try_parse_from(["tcg-inspect", "payload", "reply.hex", "--hex", "--com-id", "0x0FFE"]).unwrap();
        let Command::Payload { input, com_id } = cli.command else {
            panic!("expected payload subcommand");
        };
        assert!(input.hex);
        assert_eq!(input.file, PathBuf::from("reply.hex"));
        assert_eq!(com_id, Some(0x0FFE_0000));
    }
}
