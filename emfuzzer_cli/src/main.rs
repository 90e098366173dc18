mod logging;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use emfuzzer_core::{FuzzerConfig, RunArgs, fuzz};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

/// Fuzzer for embedded applications (with CoAP support)
#[derive(Parser, Debug)]
#[clap(name = "emfuzzer", author, version, about, long_about = None)]
struct Cli {
    /// Files containing binary data to send to the target
    #[clap(required = true, num_args = 1.., value_parser = existing_file)]
    data: Vec<PathBuf>,

    /// Prefix for the run's outputs (log and report); a timestamp is appended
    #[clap(long, default_value = "emfuzzer")]
    output_prefix: String,

    /// Path to the configuration file (TOML, or JSON by extension)
    #[clap(long, default_value = "default-config.toml")]
    config: PathBuf,
}

fn existing_file(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("Specified path is not a file: {value}"))
    }
}

impl Cli {
    fn into_run_args(self) -> RunArgs {
        RunArgs {
            data: self.data,
            output_prefix: format!(
                "{}-{}",
                self.output_prefix,
                Local::now().format("%Y%m%d-%H%M%S")
            ),
            config: self.config,
        }
    }
}

/// Error counts above 255 saturate the process exit code.
fn exit_code(total_errors: usize) -> u8 {
    u8::try_from(total_errors).unwrap_or(u8::MAX)
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Cli::parse().into_run_args();

    let _guard = logging::init_logging(&args.output_prefix)
        .with_context(|| format!("Failed to set up logging for {}", args.output_prefix))?;
    info!("Started instance ({})", env!("CARGO_PKG_VERSION"));

    let config = FuzzerConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    let total_errors = fuzz(&args, &config)?;
    Ok(ExitCode::from(exit_code(total_errors)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_saturates() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(3), 3);
        assert_eq!(exit_code(1000), 255);
    }

    #[test]
    fn output_prefix_gets_timestamp() {
        let cli =
            Cli::try_parse_from(["emfuzzer", "--output-prefix", "run", "Cargo.toml"]).unwrap();
        let args = cli.into_run_args();
        assert!(args.output_prefix.starts_with("run-"));
        assert_eq!(args.output_prefix.len(), "run-20250101-120000".len());
        assert_eq!(args.config, PathBuf::from("default-config.toml"));
    }

    #[test]
    fn missing_data_file_is_rejected() {
        assert!(Cli::try_parse_from(["emfuzzer", "/nonexistent/case.bin"]).is_err());
        assert!(Cli::try_parse_from(["emfuzzer"]).is_err());
    }
}
