//! CLI argument definitions

use clap::{Parser, Subcommand, ValueEnum};
use pulse_common::{EmissionMode, DEFAULT_SAMPLE_FREQUENCY_HZ};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pulse",
    version,
    about = "Sample call stacks and time function calls with eBPF",
    after_help = "\
EXAMPLES:
    sudo pulse sample my-app                          Folded stacks for 30s at 99 Hz
    sudo pulse sample --pid 1234 -o out.folded        Write folded stacks to a file
    sudo pulse trace --pid 1234 --function handle     Time every call of `handle`"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sample user and kernel stacks at a fixed frequency
    Sample(SampleArgs),
    /// Measure entry-to-return time of one function
    Trace(TraceArgs),
}

/// Which process to attach to
#[derive(clap::Args, Debug, Clone)]
pub struct TargetArgs {
    /// Process name (auto-detects PID and binary)
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID (binary path auto-detected from /proc)
    #[arg(short, long)]
    pub pid: Option<u32>,

    /// Path to binary for symbol resolution (optional, auto-detected if omitted)
    #[arg(short, long)]
    pub target: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct SampleArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Sampling frequency in Hz (1-1000)
    #[arg(short, long, default_value_t = DEFAULT_SAMPLE_FREQUENCY_HZ)]
    pub frequency: u64,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(short, long, default_value = "30")]
    pub duration: u64,

    /// Write folded stacks to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Print raw addresses instead of function names
    #[arg(long)]
    pub no_symbols: bool,
}

#[derive(clap::Args, Debug)]
pub struct TraceArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Symbol to instrument (mangled or plain C name)
    #[arg(short, long)]
    pub function: String,

    /// How entry and return are reported
    #[arg(short, long, value_enum, default_value_t = ModeArg::Split)]
    pub mode: ModeArg,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(short, long, default_value = "0")]
    pub duration: u64,

    /// Write every event as a JSON line to FILE
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    /// Entry and exit records, duration on exit
    Split,
    /// One completion record per call
    Combined,
}

impl From<ModeArg> for EmissionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Split => EmissionMode::Split,
            ModeArg::Combined => EmissionMode::Combined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_defaults() {
        let args = Args::try_parse_from(["pulse", "sample", "--pid", "42"]).unwrap();
        let Command::Sample(sample) = args.command else {
            panic!("expected sample subcommand");
        };
        assert_eq!(sample.target.pid, Some(42));
        assert_eq!(sample.frequency, 99);
        assert_eq!(sample.duration, 30);
        assert!(sample.output.is_none());
        assert!(!args.quiet);
    }

    #[test]
    fn test_trace_mode_parsing() {
        let args = Args::try_parse_from([
            "pulse", "trace", "my-app", "--function", "handle", "--mode", "combined", "-q",
        ])
        .unwrap();
        let Command::Trace(trace) = args.command else {
            panic!("expected trace subcommand");
        };
        assert_eq!(trace.target.process.as_deref(), Some("my-app"));
        assert_eq!(EmissionMode::from(trace.mode), EmissionMode::Combined);
        assert_eq!(trace.duration, 0);
        assert!(args.quiet);
    }

    #[test]
    fn test_trace_requires_function() {
        assert!(Args::try_parse_from(["pulse", "trace", "--pid", "1"]).is_err());
    }
}
