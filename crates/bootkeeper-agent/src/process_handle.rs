use std::{process::Stdio, time::Duration};

use anyhow::Context;
use bootkeeper_process::SlotId;
use chrono::{DateTime, Utc};
#[cfg(not(unix))]
use tokio::process::ChildStdout;
use tokio::{
    process::{ChildStdin, Command},
    sync::watch,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

#[cfg(unix)]
type OutputReader = tokio::net::unix::pipe::Receiver;
#[cfg(not(unix))]
type OutputReader = ChildStdout;

/// Read end of the single pipe a freshly spawned process writes both stdout
/// and stderr into, handed to its pump.
#[derive(Debug)]
pub struct ProcessOutput {
    pub(crate) reader: OutputReader,
}

/// A pipe whose write end is shared by the child's stdout and stderr, so the
/// two streams interleave in the order the child wrote them.
#[cfg(unix)]
fn merged_pipe() -> std::io::Result<(std::fs::File, std::fs::File)> {
    use std::os::fd::{FromRawFd, OwnedFd};

    let mut fds = [0 as libc::c_int; 2];
    #[cfg(target_os = "linux")]
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(target_os = "linux"))]
    for fd in fds {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok((std::fs::File::from(read), std::fs::File::from(write)))
}

/// A running `<shell> -c` command in its own session/process group.
///
/// The child itself is owned by an exit watcher task that reaps it and
/// publishes its exit status; the handle only observes that status and
/// signals the group.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    pgid: i32,
    started_at: DateTime<Utc>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    // Kept open so children reading stdin do not see EOF.
    _stdin: Option<ChildStdin>,
    #[cfg(not(unix))]
    kill_tx: tokio::sync::mpsc::UnboundedSender<()>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

impl ProcessHandle {
    pub fn spawn(
        slot: SlotId,
        shell: &str,
        shell_command: &str,
    ) -> anyhow::Result<(Self, ProcessOutput)> {
        let mut cmd = Command::new(shell);
        cmd.arg("-c").stdin(Stdio::piped());

        #[cfg(unix)]
        let reader = {
            let (read, write) = merged_pipe().context("create output pipe")?;
            let write_err = write.try_clone().context("duplicate output pipe")?;
            cmd.arg(shell_command)
                .stdout(Stdio::from(write))
                .stderr(Stdio::from(write_err));
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            read
        };

        // No shareable async pipe here; let the shell fold stderr into stdout.
        #[cfg(not(unix))]
        cmd.arg(format!("exec 2>&1\n{shell_command}"))
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let spawned = cmd
            .spawn()
            .with_context(|| format!("spawn {shell} for slot {slot}"));
        // The command holds the parent's copies of the write end; the pump
        // only sees EOF once they are closed.
        drop(cmd);
        let mut child = spawned?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("slot {slot}: child exited before its pid was read"))?;
        let pgid = pid as i32;

        let stdin = child.stdin.take();

        #[cfg(unix)]
        let reader = tokio::net::unix::pipe::Receiver::from_file(reader)
            .context("register output pipe")?;
        #[cfg(not(unix))]
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("slot {slot}: stdout was not captured"))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let started = tokio::time::Instant::now();

        #[cfg(not(unix))]
        let (kill_tx, mut kill_rx) = tokio::sync::mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            #[cfg(unix)]
            let res = child.wait().await;
            #[cfg(not(unix))]
            let res = tokio::select! {
                res = child.wait() => res,
                Some(()) = kill_rx.recv() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let info = match res {
                Ok(status) => ExitInfo::from(status),
                Err(e) => {
                    tracing::warn!(slot = %slot, pid, error = %e, "wait on child failed");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            tracing::info!(
                slot = %slot,
                pid,
                exit_code = ?info.code,
                signal = ?info.signal,
                runtime_ms = started.elapsed().as_millis() as u64,
                "process exited"
            );
            let _ = exit_tx.send(Some(info));
        });

        let handle = Self {
            pid,
            pgid,
            started_at: Utc::now(),
            exit_rx,
            _stdin: stdin,
            #[cfg(not(unix))]
            kill_tx,
        };
        Ok((handle, ProcessOutput { reader }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// A receiver that resolves once the process has been reaped.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Waits up to `timeout` for the process to exit; true if it did.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        wait_exited(self.exit_rx.clone(), timeout).await
    }

    /// Signals the whole process group. A group that no longer exists is not
    /// an error.
    #[cfg(unix)]
    pub fn signal(&self, sig: Signal) -> std::io::Result<()> {
        let signo = match sig {
            Signal::Interrupt => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(-self.pgid, signo) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Without process groups there is no graceful phase; only the forceful
    /// kill reaches the direct child.
    #[cfg(not(unix))]
    pub fn signal(&self, sig: Signal) -> std::io::Result<()> {
        if sig == Signal::Kill {
            let _ = self.kill_tx.send(());
        }
        Ok(())
    }
}

pub(crate) async fn wait_exited(
    mut rx: watch::Receiver<Option<ExitInfo>>,
    timeout: Duration,
) -> bool {
    match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_some())).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Whether any process of the group is still present.
#[cfg(unix)]
pub fn group_alive(pgid: i32) -> bool {
    let rc = unsafe { libc::kill(-pgid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_command_exits_with_its_code() {
        let (handle, _out) = ProcessHandle::spawn(SlotId(1), "bash", "exit 3").unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        assert!(!handle.is_alive());
        assert_eq!(handle.exit_info().and_then(|i| i.code), Some(3));
    }

    #[tokio::test]
    async fn failing_init_step_skips_main_command() {
        let (handle, _out) = ProcessHandle::spawn(SlotId(1), "bash", "false && sleep 30").unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        assert_eq!(handle.exit_info().and_then(|i| i.code), Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_reaches_the_group_leader() {
        let (handle, _out) = ProcessHandle::spawn(SlotId(2), "bash", "sleep 30").unwrap();
        assert!(handle.is_alive());
        assert_eq!(handle.pgid(), handle.pid() as i32);
        assert!(group_alive(handle.pgid()));

        handle.signal(Signal::Kill).unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        assert_eq!(handle.exit_info().and_then(|i| i.signal), Some(libc::SIGKILL));
        assert!(!group_alive(handle.pgid()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_stops_a_cooperative_process() {
        let (handle, _out) = ProcessHandle::spawn(SlotId(2), "bash", "sleep 30").unwrap();
        handle.signal(Signal::Interrupt).unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        assert_eq!(handle.exit_info().and_then(|i| i.signal), Some(libc::SIGINT));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signalling_an_exited_group_is_not_an_error() {
        let (handle, _out) = ProcessHandle::spawn(SlotId(3), "bash", "true").unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.signal(Signal::Interrupt).unwrap();
        handle.signal(Signal::Kill).unwrap();
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let err = ProcessHandle::spawn(SlotId(4), "/nonexistent/bootkeeper-shell", "true")
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/bootkeeper-shell"));
    }
}
