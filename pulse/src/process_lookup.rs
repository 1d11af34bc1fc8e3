//! Resolve the process to attach to from a name or PID.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cli::TargetArgs;
use crate::domain::Pid;

#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub exe_path: PathBuf,
    pub command: String,
}

/// Find exactly one process whose command or executable matches `name`.
///
/// # Errors
/// Fails when no process, or more than one process, matches
pub fn find_process_by_name(name: &str) -> Result<ProcessInfo> {
    let mut matches: Vec<ProcessInfo> = Vec::new();
    let own_pid = std::process::id();

    for entry in fs::read_dir("/proc").context("Failed to read /proc")?.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        // Kernel threads have no exe link
        let Ok(exe_path) = fs::read_link(format!("/proc/{pid}/exe")) else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        let Ok(command) = extract_comm(&stat) else {
            continue;
        };

        if is_match(&command, &exe_path, name) {
            matches.push(ProcessInfo { pid: Pid(pid), exe_path, command });
        }
    }

    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> =
                matches.iter().map(|m| format!("  {} ({})", m.pid.0, m.command)).collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: pulse <COMMAND> --pid <PID>",
                list.join("\n")
            )
        }
    }
}

/// Binary of a running process via `/proc/<pid>/exe`.
///
/// # Errors
/// Fails if the link cannot be read
pub fn resolve_exe_path(pid: Pid) -> Result<PathBuf> {
    let exe_link = format!("/proc/{}/exe", pid.0);
    fs::read_link(&exe_link).with_context(|| format!("Cannot read {exe_link}"))
}

/// PID and binary path from the target arguments.
///
/// - `pulse sample my-app`: find process by name, auto-detect binary
/// - `pulse sample --pid 1234`: auto-detect binary from /proc
/// - `pulse sample --pid 1234 --target ./app`: both explicit
///
/// # Errors
/// Fails on conflicting or missing arguments and on failed lookups
pub fn resolve_target(args: &TargetArgs) -> Result<(Pid, String)> {
    if let Some(ref name) = args.process {
        if args.pid.is_some() || args.target.is_some() {
            bail!(
                "Cannot use PROCESS argument with --pid or --target.\n\n\
                 Use either:\n  \
                 pulse sample my-app        (auto-detect)\n  \
                 pulse sample --pid 1234    (explicit PID)"
            );
        }
        let info = find_process_by_name(name)?;
        return Ok((info.pid, info.exe_path.to_string_lossy().into_owned()));
    }

    if let Some(pid) = args.pid.map(Pid) {
        let target = match args.target {
            Some(ref t) => {
                fs::canonicalize(t).with_context(|| format!("Failed to resolve path: {t}"))?
            }
            None => resolve_exe_path(pid)?,
        };
        return Ok((pid, target.to_string_lossy().into_owned()));
    }

    bail!(
        "Missing required argument: PROCESS or --pid\n\n\
         Run 'pulse --help' for usage"
    )
}

/// Command name from `/proc/<pid>/stat`: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

fn is_match(command: &str, exe_path: &Path, pattern: &str) -> bool {
    let exe_basename = exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let pattern_basename =
        Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    command == pattern_basename
        || exe_basename == pattern_basename
        || command.contains(pattern)
        || exe_basename.contains(pattern)
}
