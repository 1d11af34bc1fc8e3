//! # pulse - eBPF Stack Sampling and Function Timing
//!
//! pulse attaches small eBPF programs to a running process and collects two
//! kinds of data without stopping it:
//!
//! - **Stack samples**: a task-clock perf event fires at a fixed frequency on
//!   every thread of the target. Each firing captures the user and kernel
//!   stacks and increments a per-(pid, user stack, kernel stack) counter.
//! - **Function timings**: a uprobe/uretprobe pair on one symbol records the
//!   entry time per thread and reports the duration on return.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Target Process                            │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ perf events, uprobes
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 eBPF Programs (pulse-ebpf)                      │
//! │  • sample_stacks → STACK_TRACES + SAMPLE_COUNTS                 │
//! │  • probe_entry / probe_exit → ENTRY_TIMESTAMPS + EVENTS          │
//! │  • every drop → DIAGNOSTICS                                     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ map reads, ring buffer
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     pulse (This Crate)                          │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Profiling   │──▶│  Collectors  │──▶│ Folded / JSON│         │
//! │  │   (attach)   │   │              │   │    output    │         │
//! │  └──────────────┘   └──────┬───────┘   └──────────────┘         │
//! │                            ▼                                    │
//! │                     ┌──────────────┐                            │
//! │                     │ Symbolizer   │                            │
//! │                     └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`profiling`]: load and attach the eBPF programs, drain stack samples
//!   into a [`profiling::Profile`], decode timing events
//! - [`maps`]: lock-free host-side versions of the kernel maps. The trigger
//!   logic from `pulse_common` runs against them unchanged, which is how the
//!   concurrency properties are tested without a kernel.
//! - [`symbolization`]: DWARF / symbol table / kallsyms name lookup
//! - [`domain`]: newtypes and error enums
//! - [`cli`], [`preflight`], [`process_lookup`]: binary plumbing
//!
//! ## Typical Usage
//!
//! ```bash
//! # 30 seconds of folded stacks, ready for flamegraph.pl or inferno
//! sudo ./pulse sample --pid <PID> > out.folded
//!
//! # Time every call of one function until Ctrl+C
//! sudo ./pulse trace --pid <PID> --function my_handler --export calls.jsonl
//! ```

pub mod cli;
pub mod domain;
pub mod maps;
pub mod preflight;
pub mod process_lookup;
pub mod profiling;
pub mod symbolization;
