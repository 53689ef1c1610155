//! Linux-specific process utilities

use std::fs;
use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

/// Kill a process and all its descendants
/// Uses SIGTERM first, then SIGKILL once `grace` has passed
pub fn kill_process_tree(pid: u32, grace: Duration) {
    // Collect the tree up front; children get reparented once their parent dies
    let mut pids_to_kill = vec![pid];
    collect_descendants(pid, &mut pids_to_kill);

    debug!(
        pid,
        descendants = ?pids_to_kill,
        "Killing process tree"
    );

    signal_all(&pids_to_kill, Signal::SIGTERM);
    std::thread::sleep(grace);

    let survivors: Vec<u32> = pids_to_kill
        .iter()
        .copied()
        .filter(|&p| process_exists(p))
        .collect();
    if !survivors.is_empty() {
        debug!(?survivors, "Processes survived SIGTERM, sending SIGKILL");
        signal_all(&survivors, Signal::SIGKILL);
    }
}

/// Children first, then parents
fn signal_all(pids: &[u32], signal: Signal) {
    for &p in pids.iter().rev() {
        let _ = kill(Pid::from_raw(p as i32), signal);
    }
}

/// Recursively collect all descendant PIDs of a process
fn collect_descendants(pid: u32, pids: &mut Vec<u32>) {
    let Ok(entries) = fs::read_dir("/proc") else {
        return;
    };

    for entry in entries.flatten() {
        let Ok(child_pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };

        let Ok(content) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };

        if parse_stat_field(&content, 3) == Some(pid as i64) {
            pids.push(child_pid);
            collect_descendants(child_pid, pids);
        }
    }
}

/// Zombies still have a /proc entry but can't be signalled further
fn process_exists(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(content) => !matches!(parse_stat_state(&content), Some('Z') | Some('X')),
        Err(_) => Path::new(&format!("/proc/{}", pid)).exists(),
    }
}

/// Parse a specific field from /proc/[pid]/stat
/// Fields are space-separated but comm (field 2) can contain spaces and is in parens
fn parse_stat_field(content: &str, field_idx: usize) -> Option<i64> {
    let fields = fields_after_comm(content)?;
    // Fields after comm start at index 2 (state)
    fields.get(field_idx.checked_sub(2)?)?.parse().ok()
}

fn parse_stat_state(content: &str) -> Option<char> {
    fields_after_comm(content)?.first()?.chars().next()
}

fn fields_after_comm(content: &str) -> Option<Vec<&str>> {
    let close_paren = content.rfind(')')?;
    let after_comm = content.get(close_paren + 1..)?;
    Some(after_comm.split_whitespace().collect())
}
