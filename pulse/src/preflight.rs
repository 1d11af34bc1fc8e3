//! Pre-flight checks for pulse
//!
//! Validates system requirements before attempting to load eBPF programs.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection};
use std::path::Path;

use crate::domain::Pid;

/// Ring buffer maps arrived in 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns the first failed check with an actionable message
pub fn run_preflight_checks(target_path: &str, quiet: bool) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_binary_exists(target_path)?;
    check_debug_symbols(target_path, quiet)?;
    Ok(())
}

fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would also do; root is the only setup we check
    bail!(
        "Permission denied: pulse requires root privileges to load eBPF programs.\n\n\
         Run with: sudo pulse ..."
    );
}

/// Parse `major.minor` out of a release string such as `6.1.0-arch1-1`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 5.15.0-generic ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some((major, minor)) = parse_kernel_release(release) else {
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             pulse requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }
    Ok(())
}

fn check_binary_exists(target_path: &str) -> Result<()> {
    let path = Path::new(target_path);
    if !path.exists() {
        bail!(
            "Binary not found: {target_path}\n\n\
             Make sure the path is correct and the binary exists."
        );
    }
    if !path.is_file() {
        bail!(
            "Not a file: {target_path}\n\n\
             --target must point to an executable file, not a directory."
        );
    }
    Ok(())
}

/// Warn when frames will come out as raw addresses
fn check_debug_symbols(target_path: &str, quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let file_data = std::fs::read(target_path)
        .with_context(|| format!("Failed to read binary: {target_path}"))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        return Ok(());
    };

    let has_debug_info = obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);
    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);

    if !has_debug_info && !has_symtab {
        eprintln!("warning: binary stripped, user frames will show addresses only");
    } else if !has_debug_info {
        eprintln!("warning: no DWARF debug info, inlined frames will be missing");
    }
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` does not exist
pub fn check_process_exists(pid: Pid) -> Result<()> {
    if !Path::new(&format!("/proc/{}", pid.0)).exists() {
        bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}

/// Check that the thread list is readable
///
/// # Errors
/// Returns an error if `/proc/<pid>/task` cannot be listed
pub fn check_proc_access(pid: Pid) -> Result<()> {
    let task_path = format!("/proc/{}/task", pid.0);
    std::fs::read_dir(&task_path).with_context(|| {
        format!(
            "Cannot read {task_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {})\n\
             - Permission denied (run with sudo)\n\
             - /proc is not mounted",
            pid.0
        )
    })?;
    Ok(())
}
