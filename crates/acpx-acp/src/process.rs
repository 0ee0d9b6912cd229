//! Process liveness and termination helpers (unix).

use std::path::Path;
use std::time::Duration;

/// True when a process with `pid` exists (signal 0 probe).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // 0 and out-of-range values would address process groups, not processes.
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // ESRCH means gone; EPERM means alive but not ours.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM, poll for exit up to 1500 ms at 50 ms, then SIGKILL and poll
/// again. Returns true once the process is gone.
pub async fn terminate_process(pid: u32) -> bool {
    if !pid_alive(pid) {
        return true;
    }
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    if wait_for_exit(pid, Duration::from_millis(1500)).await {
        return true;
    }
    tracing::warn!(pid, "process ignored SIGTERM, escalating to SIGKILL");
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    wait_for_exit(pid, Duration::from_millis(1500)).await
}

async fn wait_for_exit(pid: u32, total: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + total;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !pid_alive(pid)
}

/// Whether the running process plausibly is the recorded agent: its cmdline
/// must mention the basename of the agent command's first token. Linux only;
/// elsewhere liveness is the best signal available.
pub fn pid_command_matches(pid: u32, agent_command: &str) -> bool {
    let Some(first) = shell_words::split(agent_command)
        .ok()
        .and_then(|tokens| tokens.into_iter().next())
    else {
        return false;
    };
    let basename = Path::new(&first)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(first);

    let cmdline_path = format!("/proc/{pid}/cmdline");
    match std::fs::read(&cmdline_path) {
        Ok(bytes) => {
            let cmdline = String::from_utf8_lossy(&bytes);
            cmdline.split('\0').any(|token| {
                Path::new(token)
                    .file_name()
                    .map(|n| n.to_string_lossy() == basename.as_str())
                    .unwrap_or(false)
            })
        }
        // No procfs: fall back to liveness only.
        Err(_) => pid_alive(pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn absurd_pid_is_dead() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(u32::MAX - 1));
    }

    #[tokio::test]
    async fn terminating_a_dead_pid_is_immediate() {
        assert!(terminate_process(u32::MAX - 1).await);
    }
}
