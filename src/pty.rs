use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tempfile::TempDir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to create working directory {0}: {1}")]
    Workdir(PathBuf, #[source] std::io::Error),

    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to write shell rc files: {0}")]
    RcFiles(#[source] std::io::Error),

    #[error("failed to spawn shell: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pty descriptor already closed")]
    Closed,
}

/// Everything needed to launch a shell inside a fresh PTY.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Working directory for the shell. Created if missing; launch fails
    /// atomically (nothing allocated) if creation fails.
    pub cwd: PathBuf,
    /// Shell program to execute. `None` means `$SHELL`, falling back to
    /// `/bin/bash`.
    pub shell: Option<String>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            cwd: std::env::temp_dir(),
            shell: None,
            rows: 24,
            cols: 80,
        }
    }
}

/// A running shell attached to a newly allocated pseudo-terminal.
///
/// Owns the master side of the PTY and the child process handle. The read
/// and write halves are one-shot: `take_reader()` / `take_writer()` each
/// succeed once, which is how the engine guarantees a single reader and a
/// single (lock-guarded) writer at the type level.
pub struct PtyProcess {
    // `None` once the descriptor has been closed; closing is idempotent.
    master: Option<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    pid: Option<u32>,
    // Holds the synthesized rc files for the lifetime of the shell.
    rc_dir: Option<TempDir>,
}

impl PtyProcess {
    /// Allocate a PTY and spawn the requested shell inside it.
    ///
    /// The child runs as a session leader with the PTY slave as its
    /// controlling terminal (portable-pty arranges both), in `spec.cwd`,
    /// with an environment that forces color output and a synthesized rc
    /// file that sources the user's own shell configuration before setting
    /// a colored prompt.
    pub fn launch(spec: &LaunchSpec) -> Result<Self, PtyError> {
        std::fs::create_dir_all(&spec.cwd)
            .map_err(|e| PtyError::Workdir(spec.cwd.clone(), e))?;

        let shell = spec
            .shell
            .clone()
            .unwrap_or_else(|| std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()));

        let (cmd, rc_dir) = build_shell_command(&shell, &spec.cwd)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::OpenPty)?;

        // A spawn failure drops `pair` here, closing both descriptors --
        // nothing leaks into the parent.
        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        let pid = child.process_id();

        let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;

        Ok(Self {
            master: Some(pair.master),
            child,
            reader: Some(reader),
            writer: Some(writer),
            pid,
            rc_dir,
        })
    }

    /// Take the read half. Succeeds exactly once.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    /// Take the write half. Succeeds exactly once.
    pub fn take_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.writer.take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Set the PTY window size and notify the child's process group.
    ///
    /// portable-pty spawns the child via setsid, so the child leads its own
    /// process group and a negative-pid kill reaches the whole group.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let master = self.master.as_ref().ok_or(PtyError::Closed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)?;
        self.signal(libc::SIGWINCH);
        Ok(())
    }

    /// Close the master descriptor and discard the synthesized rc files.
    ///
    /// Idempotent: the descriptor is dropped exactly once, further calls are
    /// no-ops. The child handle stays available for signaling and reaping.
    pub fn close(&mut self) {
        self.master = None;
        self.writer = None;
        self.rc_dir = None;
    }

    pub fn is_closed(&self) -> bool {
        self.master.is_none()
    }

    /// Send `sig` to the child's process group. Best-effort: delivery to an
    /// already-exited process is swallowed.
    pub fn signal(&self, sig: i32) {
        if let Some(pid) = self.pid {
            if pid == 0 || pid > i32::MAX as u32 {
                tracing::warn!(pid, "pid out of range, cannot send signal");
                return;
            }
            #[cfg(unix)]
            unsafe {
                libc::kill(-(pid as i32), sig);
            }
        }
    }

    /// Non-blocking reap poll. Returns `true` if the child has exited (and
    /// has now been reaped).
    pub fn try_reap(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            // No such child / already reaped elsewhere: treat as exited.
            Err(_) => true,
        }
    }
}

/// Build the shell command: color-forcing environment plus a synthesized
/// rc file that sources the user's normal configuration and then guarantees
/// a colored, informative prompt.
fn build_shell_command(shell: &str, cwd: &Path) -> Result<(CommandBuilder, Option<TempDir>), PtyError> {
    let mut cmd = CommandBuilder::new(shell);
    cmd.cwd(cwd);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd.env("CLICOLOR", "1");
    cmd.env("CLICOLOR_FORCE", "1");
    cmd.env("FORCE_COLOR", "1");
    cmd.env("LSCOLORS", "GxFxCxDxBxegedabagaced");

    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    let home = home.display();

    let shell_name = Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell);

    let rc_dir = tempfile::Builder::new()
        .prefix("termhub-rc-")
        .tempdir()
        .map_err(PtyError::RcFiles)?;

    if shell_name == "zsh" {
        std::fs::write(
            rc_dir.path().join(".zshrc"),
            format!(
                "[ -f \"{home}/.zshrc\" ] && source \"{home}/.zshrc\"\n\
                 export PROMPT=\"%F{{green}}%n@%m%f %F{{blue}}%1~%f %# \"\n\
                 export CLICOLOR=1\n"
            ),
        )
        .map_err(PtyError::RcFiles)?;
        std::fs::write(
            rc_dir.path().join(".zshenv"),
            format!("[ -f \"{home}/.zshenv\" ] && source \"{home}/.zshenv\"\n"),
        )
        .map_err(PtyError::RcFiles)?;
        cmd.env("ZDOTDIR", rc_dir.path());
    } else if shell_name == "bash" {
        let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .map(|h| h.split('.').next().unwrap_or("").to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let rc_path = rc_dir.path().join(".bashrc");
        std::fs::write(
            &rc_path,
            format!(
                "[ -f \"{home}/.bashrc\" ] && source \"{home}/.bashrc\"\n\
                 export PS1=\"\\[\\033[01;32m\\]{user}@{host}\\[\\033[00m\\] \\[\\033[01;34m\\]\\W\\[\\033[00m\\] \\$ \"\n"
            ),
        )
        .map_err(PtyError::RcFiles)?;
        cmd.arg("--rcfile");
        cmd.arg(rc_path);
    }
    // Other shells run with their own startup files; the color environment
    // above still applies.

    Ok((cmd, Some(rc_dir)))
}

/// The write half of a session's PTY, wrapped so that closing it is
/// idempotent and writes after teardown report failure instead of erroring.
///
/// Held behind the session's async mutex: holding that lock is the only way
/// to reach this writer, which is what serializes concurrent client input.
pub struct PtyWriter {
    inner: Option<Box<dyn Write + Send>>,
}

impl PtyWriter {
    pub fn new(inner: Box<dyn Write + Send>) -> Self {
        Self { inner: Some(inner) }
    }

    /// A writer with no underlying handle; every write reports failure.
    pub fn detached() -> Self {
        Self { inner: None }
    }

    /// Write raw bytes to the PTY. Returns `false` if the writer was closed
    /// or the OS write failed.
    pub fn write(&mut self, data: &[u8]) -> bool {
        match self.inner.as_mut() {
            Some(w) => w.write_all(data).and_then(|()| w.flush()).is_ok(),
            None => false,
        }
    }

    /// Drop the underlying handle. Safe to call more than once.
    pub fn close(&mut self) {
        self.inner = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh_spec(dir: &Path) -> LaunchSpec {
        LaunchSpec {
            cwd: dir.to_path_buf(),
            shell: Some("/bin/sh".to_string()),
            rows: 24,
            cols: 80,
        }
    }

    #[test]
    fn launch_creates_missing_workdir() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = tmp.path().join("nested/workdir");
        let mut pty = PtyProcess::launch(&sh_spec(&cwd)).expect("launch should succeed");
        assert!(cwd.is_dir());
        assert!(pty.pid().is_some());
        pty.signal(libc::SIGKILL);
        while !pty.try_reap() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn reader_and_writer_are_one_shot() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pty = PtyProcess::launch(&sh_spec(tmp.path())).unwrap();
        assert!(pty.take_reader().is_some());
        assert!(pty.take_reader().is_none());
        assert!(pty.take_writer().is_some());
        assert!(pty.take_writer().is_none());
        pty.signal(libc::SIGKILL);
    }

    #[test]
    fn echo_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pty = PtyProcess::launch(&sh_spec(tmp.path())).unwrap();
        let mut reader = pty.take_reader().unwrap();
        let mut writer = PtyWriter::new(pty.take_writer().unwrap());

        assert!(writer.write(b"echo termhub-ok\n"));

        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&collected).contains("termhub-ok") {
                        break;
                    }
                }
            }
        }
        assert!(
            String::from_utf8_lossy(&collected).contains("termhub-ok"),
            "expected echoed output, got: {:?}",
            String::from_utf8_lossy(&collected)
        );
        pty.signal(libc::SIGKILL);
    }

    #[test]
    fn resize_running_shell_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let pty = PtyProcess::launch(&sh_spec(tmp.path())).unwrap();
        pty.resize(40, 120).expect("resize should succeed");
        pty.signal(libc::SIGKILL);
    }

    #[test]
    fn try_reap_reports_exit_after_kill() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pty = PtyProcess::launch(&sh_spec(tmp.path())).unwrap();
        assert!(!pty.try_reap(), "freshly launched shell should be alive");

        pty.signal(libc::SIGKILL);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut reaped = false;
        while Instant::now() < deadline {
            if pty.try_reap() {
                reaped = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(reaped, "child should be reapable after SIGKILL");
    }

    #[test]
    fn spawn_failure_is_atomic() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            shell: Some("/definitely/not/a/shell".to_string()),
            ..sh_spec(tmp.path())
        };
        // portable-pty surfaces exec failure either as a spawn error or as a
        // child that exits immediately, depending on platform. Both are
        // acceptable; `launch` returns a Result, never a half-built value.
        match PtyProcess::launch(&spec) {
            Ok(mut pty) => {
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline && !pty.try_reap() {
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
            Err(e) => {
                assert!(matches!(e, PtyError::SpawnCommand(_)), "unexpected error: {e}");
            }
        }
    }

    #[test]
    fn close_is_idempotent_and_resize_fails_after() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pty = PtyProcess::launch(&sh_spec(tmp.path())).unwrap();
        pty.signal(libc::SIGKILL);
        pty.close();
        pty.close();
        assert!(pty.is_closed());
        assert!(matches!(pty.resize(30, 90), Err(PtyError::Closed)));
        while !pty.try_reap() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn writer_close_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pty = PtyProcess::launch(&sh_spec(tmp.path())).unwrap();
        let mut writer = PtyWriter::new(pty.take_writer().unwrap());
        writer.close();
        writer.close();
        assert!(writer.is_closed());
        assert!(!writer.write(b"after close"));
        pty.signal(libc::SIGKILL);
    }
}
