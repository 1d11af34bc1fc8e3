//! # eBPF Program Loading and Attachment
//!
//! Loads compiled eBPF bytecode and attaches programs to kernel hook points.
//!
//! ## Functions
//!
//! - [`load_ebpf_program()`] - Load eBPF bytecode from embedded binary
//! - [`configure()`] - Write target PID and emission mode to `CONFIG`
//! - [`attach_stack_sampler()`] - One task-clock perf event per thread
//! - [`attach_function_probes()`] - uprobe/uretprobe pair on one symbol
//!
//! ## Attachment Points
//!
//! - **Perf Event**: `PERF_COUNT_SW_TASK_CLOCK`, sampled at a fixed frequency
//! - **Uprobe / Uretprobe**: entry and return of the traced function

use anyhow::{Context, Result};
use aya::{
    include_bytes_aligned,
    maps::{HashMap, MapData, RingBuf},
    programs::{perf_event, PerfEvent, UProbe},
    Ebpf,
};
use aya_log::EbpfLogger;
use log::{info, warn};
use pulse_common::{EmissionMode, CONFIG_EMISSION_MODE, CONFIG_TARGET_PID, MAX_SAMPLE_FREQUENCY_HZ};

use crate::domain::{Pid, ProfilerError};
use crate::profiling::list_threads;

/// Load the eBPF program binary
///
/// Always uses the release build: debug builds pull in formatting code that
/// the BPF target cannot link.
///
/// # Errors
/// Returns an error if the eBPF program binary cannot be loaded
pub fn load_ebpf_program() -> Result<Ebpf> {
    let bpf = Ebpf::load(include_bytes_aligned!("../../../target/bpfel-unknown-none/release/pulse"))
        .map_err(|e| ProfilerError::EbpfLoadFailed(e.to_string()))?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Write the runtime configuration read by every program
///
/// # Errors
/// Returns an error if the `CONFIG` map cannot be accessed
pub fn configure(bpf: &mut Ebpf, pid: Pid, mode: EmissionMode) -> Result<()> {
    let mut config: HashMap<_, u32, u64> =
        HashMap::try_from(bpf.map_mut("CONFIG").context("CONFIG map not found")?)?;
    config.insert(CONFIG_TARGET_PID, u64::from(pid.0), 0)?;
    config.insert(CONFIG_EMISSION_MODE, mode.as_raw(), 0)?;
    info!("✓ Set target PID: {}", pid.0);
    Ok(())
}

/// Reject frequencies the kernel would throttle or refuse
///
/// # Errors
/// [`ProfilerError::InvalidFrequency`] outside `1..=1000` Hz
pub fn validate_frequency(frequency_hz: u64) -> Result<u64, ProfilerError> {
    if (1..=MAX_SAMPLE_FREQUENCY_HZ).contains(&frequency_hz) {
        Ok(frequency_hz)
    } else {
        Err(ProfilerError::InvalidFrequency(frequency_hz))
    }
}

/// Attach the stack sampler to every thread of `pid`
///
/// Threads that exit before their perf event is opened are skipped. Returns
/// the number of threads attached.
///
/// # Errors
/// Returns an error for an invalid frequency, if the program cannot be
/// loaded, or if no thread accepted a perf event
pub fn attach_stack_sampler(bpf: &mut Ebpf, pid: Pid, frequency_hz: u64) -> Result<usize> {
    let frequency_hz = validate_frequency(frequency_hz)?;

    let program: &mut PerfEvent =
        bpf.program_mut("sample_stacks").context("sample_stacks program not found")?.try_into()?;
    program.load()?;

    let threads = list_threads(pid)?;
    let mut attached = 0;
    for thread in &threads {
        match program.attach(
            perf_event::PerfTypeId::Software,
            perf_event::perf_sw_ids::PERF_COUNT_SW_TASK_CLOCK as u64,
            perf_event::PerfEventScope::OneProcessAnyCpu { pid: thread.tid.0 },
            perf_event::SamplePolicy::Frequency(frequency_hz),
            true,
        ) {
            Ok(_) => attached += 1,
            Err(e) => {
                warn!("⚠️  Could not attach sampler to {} ({}): {e}", thread.tid, thread.comm);
            }
        }
    }

    if attached == 0 {
        return Err(ProfilerError::NoThreadsAttached(pid).into());
    }

    info!(
        "✓ Attached perf_event sampler to {attached}/{} threads at {frequency_hz} Hz",
        threads.len()
    );
    Ok(attached)
}

fn attach_uprobe(
    bpf: &mut Ebpf,
    program_name: &'static str,
    symbol: &str,
    target: &str,
    pid: Option<i32>,
) -> Result<()> {
    let program: &mut UProbe = bpf
        .program_mut(program_name)
        .ok_or_else(|| ProfilerError::EbpfLoadFailed(format!("{program_name} program not found")))?
        .try_into()?;
    program.load()?;
    program.attach(Some(symbol), 0, target, pid).map_err(|e| ProfilerError::ProbeAttachFailed {
        probe: program_name.to_string(),
        binary: target.to_string(),
        error: e.to_string(),
    })?;
    info!("✓ Attached {program_name}: {symbol}");
    Ok(())
}

/// Attach entry and return probes to `symbol` in `target`
///
/// `pid` restricts the probes to one process; `None` traces every process
/// that maps the binary.
///
/// # Errors
/// Returns an error if either probe cannot be loaded or attached
pub fn attach_function_probes(
    bpf: &mut Ebpf,
    target: &str,
    symbol: &str,
    pid: Option<Pid>,
) -> Result<()> {
    let pid = pid.map(i32::from);
    attach_uprobe(bpf, "probe_entry", symbol, target, pid)?;
    attach_uprobe(bpf, "probe_exit", symbol, target, pid)?;
    Ok(())
}

/// Take the event ring buffer out of the loaded object
///
/// # Errors
/// Returns an error if the `EVENTS` map is missing or is not a ring buffer
pub fn take_event_ring(bpf: &mut Ebpf) -> Result<RingBuf<MapData>, ProfilerError> {
    let map = bpf.take_map("EVENTS").ok_or(ProfilerError::MapNotFound("EVENTS"))?;
    Ok(RingBuf::try_from(map)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_bounds() {
        assert_eq!(validate_frequency(99).unwrap(), 99);
        assert_eq!(validate_frequency(1).unwrap(), 1);
        assert_eq!(validate_frequency(1000).unwrap(), 1000);
        assert!(matches!(validate_frequency(0), Err(ProfilerError::InvalidFrequency(0))));
        assert!(matches!(validate_frequency(1001), Err(ProfilerError::InvalidFrequency(1001))));
    }
}
