//! Cancellation: tree-wide kills and reclassifying failures of cancelled work

use std::collections::{HashMap, HashSet};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::ProcessError;

/// Collect `root` and every process descending from it.
fn process_tree(root: u32) -> Vec<Pid> {
    let root = Pid::from_u32(root);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut stack = vec![root];
    let mut seen: HashSet<Pid> = HashSet::new();
    let mut order = Vec::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        order.push(current);
        if let Some(kids) = children.get(&current) {
            stack.extend(kids.iter().filter(|kid| !seen.contains(*kid)));
        }
    }
    order
}

/// Force-kill `pid`, its process group and every descendant.
///
/// Descendants are collected before anything is signalled so that orphaned
/// grandchildren are still found through their original parent.
pub fn kill_process_tree(pid: u32) {
    let tree = process_tree(pid);
    tracing::debug!("Killing process tree rooted at {pid} ({} processes)", tree.len());

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid as NixPid;

        // Children spawned with process_group(0) lead their own group.
        if let Err(e) = signal::killpg(NixPid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::trace!("killpg({pid}) failed: {e}");
        }
        for member in tree {
            let _ = signal::kill(NixPid::from_raw(member.as_u32() as i32), Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&tree), true);
        for member in tree {
            if let Some(process) = system.process(member) {
                if !process.kill() {
                    tracing::warn!("Failed to kill process {member}");
                }
            }
        }
    }
}

/// [`kill_process_tree`] on the blocking pool; the process-table refresh
/// must not stall a runtime worker thread.
pub async fn kill_process_tree_off_runtime(pid: u32) {
    if let Err(e) = tokio::task::spawn_blocking(move || kill_process_tree(pid)).await {
        tracing::warn!("Killing process tree of {pid} did not finish: {e}");
    }
}

/// Links a cancellation token to a tree-wide kill of one process for as long
/// as the hook is alive.
pub struct CancelHook {
    task: Option<JoinHandle<()>>,
}

impl CancelHook {
    pub fn arm(token: Option<&CancellationToken>, pid: Option<u32>) -> Self {
        let task = match (token, pid) {
            (Some(token), Some(pid)) => {
                let token = token.clone();
                Some(tokio::spawn(async move {
                    token.cancelled().await;
                    tracing::debug!("Cancellation requested, killing process {pid}");
                    kill_process_tree_off_runtime(pid).await;
                }))
            }
            _ => None,
        };
        Self { task }
    }

}

impl Drop for CancelHook {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) fn cancelled(silent: bool) -> ProcessError {
    ProcessError::Cancelled {
        message: "Cancelled".to_string(),
        silent,
    }
}

/// A failure caught while the token is cancelled becomes a cancellation.
pub fn classify_failure(
    error: ProcessError,
    token: Option<&CancellationToken>,
    silent: bool,
) -> ProcessError {
    match token {
        Some(token) if token.is_cancelled() && !error.is_cancellation() => {
            tracing::debug!("Reporting failure as cancellation: {error}");
            cancelled(silent)
        }
        _ => error,
    }
}
