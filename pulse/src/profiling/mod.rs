//! Profiling core modules
//!
//! - eBPF program loading, configuration and attachment
//! - Thread enumeration for per-thread perf events
//! - Stack profile collection and folded output
//! - Function timing event decoding and statistics
//! - Drop diagnostics

pub mod diagnostics;
pub mod ebpf_setup;
pub mod event_collector;
pub mod stack_collector;
pub mod threads;

pub use diagnostics::{print_drop_diagnostics, read_drop_counters, DropCounters};
pub use ebpf_setup::{
    attach_function_probes, attach_stack_sampler, configure, init_ebpf_logger, load_ebpf_program,
    take_event_ring, validate_frequency,
};
pub use event_collector::{decode_event, CallStats, EventCollector, ProbeEvent};
pub use stack_collector::{Profile, StackCollector, StackSample};
pub use threads::{list_threads, ThreadInfo};
