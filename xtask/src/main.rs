use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

const EBPF_PACKAGE: &str = "pulse-ebpf";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the kernel object embedded by the pulse binary
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
}

fn main() -> Result<()> {
    match Args::parse().command {
        Cmd::BuildEbpf { target } => build_ebpf(&target),
    }
}

/// Always a release build: debug builds pull in formatting code the BPF
/// linker rejects.
fn build_ebpf(target: &str) -> Result<()> {
    let status = Command::new("cargo")
        .args(["+nightly", "build", "--package", EBPF_PACKAGE, "--target", target])
        .args(["-Z", "build-std=core", "--release"])
        .status()
        .context("Failed to run cargo for the eBPF build")?;

    if !status.success() {
        bail!("Failed to build {EBPF_PACKAGE}");
    }

    let object: PathBuf = ["target", target, "release", "pulse"].iter().collect();
    println!("✓ eBPF object built: {}", object.display());
    Ok(())
}
