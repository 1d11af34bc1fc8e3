//! # pulse - Main Entry Point
//!
//! - **sample**: attach the stack sampler, wait, print folded stacks
//! - **trace**: attach function probes, stream timing events until stopped

#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use aya::Ebpf;
use clap::Parser;
use log::{info, warn};
use pulse_common::EmissionMode;
use std::fs::File;
use std::io::{self, BufWriter};
use std::time::{Duration, Instant};

use pulse::cli::{Args, Command, SampleArgs, TargetArgs, TraceArgs};
use pulse::domain::Pid;
use pulse::preflight::{check_proc_access, check_process_exists, run_preflight_checks};
use pulse::process_lookup::resolve_target;
use pulse::profiling::{
    attach_function_probes, attach_stack_sampler, configure, init_ebpf_logger, load_ebpf_program,
    print_drop_diagnostics, read_drop_counters, take_event_ring, validate_frequency,
    EventCollector, StackCollector,
};
use pulse::symbolization::{FrameNames, ProcessSymbols, RawAddresses};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument")
        || msg.contains("cannot use process argument")
        || msg.contains("sample frequency")
    {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Why the wait loop ended
#[derive(Clone, Copy)]
enum StopReason {
    Interrupted,
    DurationReached,
    ProcessExited,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            StopReason::Interrupted => "interrupted",
            StopReason::DurationReached => "duration limit reached",
            StopReason::ProcessExited => "process exited",
        }
    }
}

/// Tick every 100ms until the duration passes, the target exits or Ctrl+C
///
/// `on_tick` runs on every iteration (the trace command drains events there).
async fn wait_until_stopped(pid: Pid, duration_secs: u64, mut on_tick: impl FnMut()) -> StopReason {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let start = Instant::now();
    let limit = (duration_secs > 0).then(|| Duration::from_secs(duration_secs));
    let proc_path = format!("/proc/{}", pid.0);

    loop {
        on_tick();

        if limit.is_some_and(|limit| start.elapsed() >= limit) {
            return StopReason::DurationReached;
        }
        if !std::path::Path::new(&proc_path).exists() {
            return StopReason::ProcessExited;
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => return StopReason::Interrupted,
        }
    }
}

fn print_drops(bpf: &Ebpf, quiet: bool) {
    if quiet {
        return;
    }
    match read_drop_counters(bpf) {
        Ok(counters) => print_drop_diagnostics(&counters),
        Err(e) => warn!("Could not read drop counters: {e}"),
    }
}

/// Load, configure and check the target; shared by both commands
fn prepare(target: &TargetArgs, mode: EmissionMode, quiet: bool) -> Result<(Pid, String, Ebpf)> {
    let (pid, target_path) = resolve_target(target)?;

    run_preflight_checks(&target_path, quiet)?;
    check_process_exists(pid)?;
    check_proc_access(pid)?;

    if !quiet {
        println!("pulse v{}", env!("CARGO_PKG_VERSION"));
        println!("target: {target_path}");
        println!("pid: {}", pid.0);
    }

    let mut bpf = load_ebpf_program()?;
    init_ebpf_logger(&mut bpf);
    configure(&mut bpf, pid, mode)?;
    Ok((pid, target_path, bpf))
}

async fn run_sample(args: SampleArgs, quiet: bool) -> Result<()> {
    validate_frequency(args.frequency)?;
    let (pid, target_path, mut bpf) = prepare(&args.target, EmissionMode::default(), quiet)?;

    let threads = attach_stack_sampler(&mut bpf, pid, args.frequency)?;
    if !quiet {
        println!("sampling: {} threads at {} Hz", threads, args.frequency);
    }

    let reason = wait_until_stopped(pid, args.duration, || {}).await;
    info!("Stopped sampling: {}", reason.as_str());

    let mut collector = StackCollector::new(&mut bpf)?;
    let profile = collector.drain()?;

    if !quiet {
        eprintln!(
            "\n{}: {} samples, {} stacks, {} unresolved",
            reason.as_str(),
            profile.total_samples,
            profile.samples.len(),
            profile.unresolved_samples
        );
    }

    let names: Box<dyn FrameNames> = if args.no_symbols {
        Box::new(RawAddresses)
    } else {
        Box::new(ProcessSymbols::load(pid.0, &target_path))
    };

    match args.output {
        Some(ref path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            profile.write_folded(&mut BufWriter::new(file), names.as_ref())?;
            if !quiet {
                println!("saved: {}", path.display());
            }
        }
        None => profile.write_folded(&mut io::stdout().lock(), names.as_ref())?,
    }

    print_drops(&bpf, quiet);
    Ok(())
}

async fn run_trace(args: TraceArgs, quiet: bool) -> Result<()> {
    let mode = EmissionMode::from(args.mode);
    let (pid, target_path, mut bpf) = prepare(&args.target, mode, quiet)?;

    attach_function_probes(&mut bpf, &target_path, &args.function, Some(pid))?;
    let mut ring = take_event_ring(&mut bpf)?;

    let export = args
        .export
        .as_ref()
        .map(|path| {
            File::create(path)
                .map(BufWriter::new)
                .with_context(|| format!("Failed to create {}", path.display()))
        })
        .transpose()?;
    let mut collector = EventCollector::new(mode, export);

    if !quiet {
        println!("tracing: {} ({mode:?} mode)", args.function);
        if let Some(ref path) = args.export {
            println!("export: {}", path.display());
        }
    }

    let reason = wait_until_stopped(pid, args.duration, || {
        collector.drain_ring(&mut ring);
    })
    .await;
    collector.drain_ring(&mut ring);

    let malformed = collector.malformed();
    let stats = collector.finish()?;
    if !quiet {
        eprintln!("\n{}", reason.as_str());
        stats.print_summary(&args.function);
        if malformed > 0 {
            println!("   malformed records: {malformed}");
        }
    }

    print_drops(&bpf, quiet);
    Ok(())
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Sample(sample) => run_sample(sample, args.quiet).await,
        Command::Trace(trace) => run_trace(trace, args.quiet).await,
    }
}
