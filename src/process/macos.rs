//! macOS-specific process utilities

use std::collections::HashMap;
use std::process::Command;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

/// Kill a process and all its descendants
/// Uses SIGTERM first, then SIGKILL once `grace` has passed
pub fn kill_process_tree(pid: u32, grace: Duration) {
    let children_map = build_children_map();

    let mut pids_to_kill = vec![pid];
    collect_descendants_from_map(pid, &children_map, &mut pids_to_kill);

    debug!(
        pid,
        descendants = ?pids_to_kill,
        "Killing process tree"
    );

    for &p in pids_to_kill.iter().rev() {
        let _ = kill(Pid::from_raw(p as i32), Signal::SIGTERM);
    }

    std::thread::sleep(grace);

    for &p in pids_to_kill.iter().rev() {
        if process_exists(p) {
            debug!(pid = p, "Process survived SIGTERM, sending SIGKILL");
            let _ = kill(Pid::from_raw(p as i32), Signal::SIGKILL);
        }
    }
}

/// Parent PID -> child PIDs, from a single `ps` listing
fn build_children_map() -> HashMap<u32, Vec<u32>> {
    let Ok(output) = Command::new("ps").args(["-o", "pid=,ppid=", "-A"]).output() else {
        return HashMap::new();
    };
    if !output.status.success() {
        return HashMap::new();
    }
    parse_ps_listing(&String::from_utf8_lossy(&output.stdout))
}

fn parse_ps_listing(listing: &str) -> HashMap<u32, Vec<u32>> {
    let mut children_map: HashMap<u32, Vec<u32>> = HashMap::new();
    for line in listing.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(Ok(child_pid)), Some(Ok(ppid))) = (
            parts.next().map(str::parse::<u32>),
            parts.next().map(str::parse::<u32>),
        ) {
            children_map.entry(ppid).or_default().push(child_pid);
        }
    }
    children_map
}

fn collect_descendants_from_map(
    pid: u32,
    children_map: &HashMap<u32, Vec<u32>>,
    pids: &mut Vec<u32>,
) {
    if let Some(children) = children_map.get(&pid) {
        for &child_pid in children {
            pids.push(child_pid);
            collect_descendants_from_map(child_pid, children_map, pids);
        }
    }
}

/// EPERM means the process exists but belongs to someone else
fn process_exists(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps_listing() {
        let listing = "  100     1\n  101   100\n  102   100\n  103   101\ngarbage\n";
        let map = parse_ps_listing(listing);
        assert_eq!(map.get(&100), Some(&vec![101, 102]));
        assert_eq!(map.get(&101), Some(&vec![103]));
        assert_eq!(map.get(&1), Some(&vec![100]));
    }

    #[test]
    fn test_collect_descendants_from_map_nested() {
        let mut children_map = HashMap::new();
        children_map.insert(100, vec![101, 102]);
        children_map.insert(101, vec![103]);

        let mut pids = vec![100];
        collect_descendants_from_map(100, &children_map, &mut pids);
        assert_eq!(pids, vec![100, 101, 103, 102]);
    }

    #[test]
    fn test_collect_descendants_unrelated_processes() {
        let mut children_map = HashMap::new();
        children_map.insert(200, vec![201]);

        let mut pids = vec![100];
        collect_descendants_from_map(100, &children_map, &mut pids);
        assert_eq!(pids, vec![100]);
    }
}
