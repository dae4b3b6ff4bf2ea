//! Process termination.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg};
use nix::unistd::Pid;

use crate::error::EngineError;
use crate::plan::ShutdownSignal;

/// Delivers termination signals.
///
/// Abstracted so escalation can be observed in tests.
pub trait ProcessTerminator: Send + Sync {
    /// Signals `pid`, and its descendants too when `destroy_tree` is set.
    ///
    /// A process that has already gone away is not an error.
    fn terminate(
        &self,
        pid: u32,
        signal: ShutdownSignal,
        destroy_tree: bool,
    ) -> Result<(), EngineError>;
}

/// Signals a process and, optionally, its whole tree.
///
/// The tree is covered twice: once through the process group (children are
/// started as group leaders) and once through a walk of `/proc` for
/// descendants that moved to another group.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeAwareTerminator;

impl ProcessTerminator for TreeAwareTerminator {
    fn terminate(
        &self,
        pid: u32,
        signal: ShutdownSignal,
        destroy_tree: bool,
    ) -> Result<(), EngineError> {
        let sig = signal.to_nix();
        if destroy_tree {
            // Collect before signalling; reparenting hides children once the root dies.
            let descendants = descendants_of(pid);
            if let Err(e) = killpg(Pid::from_raw(pid as i32), sig) {
                tracing::trace!(pid, error = %e, "process group signal not delivered");
            }
            for child in descendants.into_iter().rev() {
                if let Err(e) = deliver(child, signal) {
                    tracing::debug!(pid = child, error = %e, "failed to signal descendant");
                }
            }
        }
        deliver(pid, signal)
    }
}

fn deliver(pid: u32, signal: ShutdownSignal) -> Result<(), EngineError> {
    match kill(Pid::from_raw(pid as i32), signal.to_nix()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(EngineError::Signal {
            pid,
            signal,
            source,
        }),
    }
}

/// All live descendants of `root`, breadth first.
#[cfg(target_os = "linux")]
pub fn descendants_of(root: u32) -> Vec<u32> {
    use std::collections::{HashMap, VecDeque};

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if let Some(ppid) = parent_pid(pid) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                found.push(kid);
                queue.push_back(kid);
            }
        }
    }
    found
}

#[cfg(not(target_os = "linux"))]
pub fn descendants_of(_root: u32) -> Vec<u32> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn parent_pid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // "pid (comm) state ppid ..."; comm may itself contain ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::time::Duration;

    #[test]
    fn test_missing_process_is_not_an_error() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        TreeAwareTerminator
            .terminate(pid, ShutdownSignal::Kill, false)
            .unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descendants_found_through_proc() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30 & wait")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();

        // Give the shell a moment to fork.
        let mut descendants = Vec::new();
        for _ in 0..50 {
            descendants = descendants_of(pid);
            if descendants.len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(descendants.len() >= 2, "found {descendants:?}");

        TreeAwareTerminator
            .terminate(pid, ShutdownSignal::Kill, true)
            .unwrap();
        child.wait().unwrap();

        // Killed grandchildren linger as zombies until init reaps them.
        for _ in 0..50 {
            let alive = descendants.iter().filter(|d| is_running(**d)).count();
            if alive == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("descendants survived tree kill: {descendants:?}");
    }

    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let rest = &stat[stat.rfind(')')? + 1..];
                rest.split_whitespace().next().map(|s| s != "Z")
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parent_pid_of_self() {
        let me = std::process::id();
        let parent = parent_pid(me).unwrap();
        assert!(parent > 0);
        assert_ne!(parent, me);
    }
}
