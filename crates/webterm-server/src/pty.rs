//! Pseudo-terminal backed shell processes.
//!
//! [`PtyProcess::spawn`] forks a child attached to a fresh PTY and starts an
//! I/O task for it. The task owns the master side: it relays output as
//! [`PtyEvent::Data`], writes queued input, reaps the child and finishes with
//! exactly one [`PtyEvent::Exited`].

use std::ffi::{CStr, CString};
use std::io::Read as _;
use std::os::fd::{AsRawFd as _, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf as _, Bytes, BytesMut};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::sync::{Notify, mpsc};

const IO_BUFFER_SIZE: usize = 4096;
/// Output chunks in flight per process. When full the master is not read, so
/// the kernel's PTY buffer throttles the shell.
const EVENT_CAPACITY: usize = 64;
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EXEC_FAILED_STATUS: i32 = 127;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("empty command")]
    EmptyCommand,
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("argument contains a NUL byte")]
    Nul(#[from] std::ffi::NulError),
    #[error(transparent)]
    InvalidDimensions(#[from] InvalidDimensions),
    #[error("openpty failed: {0}")]
    Pty(nix::Error),
    #[error("fork failed: {0}")]
    Fork(nix::Error),
    #[error("failed to exec {program}: {source}")]
    Exec {
        program: String,
        source: std::io::Error,
    },
    #[error("session limit of {0} reached")]
    LimitReached(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A resize to a zero-sized grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid terminal dimensions {cols}x{rows}")]
pub struct InvalidDimensions {
    pub cols: u16,
    pub rows: u16,
}

/// Terminal size in character cells. Never zero in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    cols: u16,
    rows: u16,
}

impl Dimensions {
    pub fn new(cols: u16, rows: u16) -> Result<Self, InvalidDimensions> {
        if cols == 0 || rows == 0 {
            return Err(InvalidDimensions { cols, rows });
        }
        Ok(Self { cols, rows })
    }

    #[must_use]
    pub fn cols(&self) -> u16 {
        self.cols
    }

    #[must_use]
    pub fn rows(&self) -> u16 {
        self.rows
    }

    fn winsize(self) -> nix::pty::Winsize {
        nix::pty::Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// Everything needed to start a shell.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: PathBuf,
    /// Environment for the child. TERM is overridden by `term`.
    pub env: Vec<(std::ffi::OsString, std::ffi::OsString)>,
    pub term: String,
    /// Time between SIGHUP and SIGKILL when the process is destroyed.
    pub kill_grace: Duration,
}

impl SpawnOptions {
    /// Options for `command` inheriting this process's environment.
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            cols: webterm_protocol::DEFAULT_COLS,
            rows: webterm_protocol::DEFAULT_ROWS,
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            env: std::env::vars_os().collect(),
            term: "xterm-color".to_string(),
            kill_grace: Duration::from_secs(2),
        }
    }

    /// Spawn options described by the server configuration.
    #[must_use]
    pub fn from_config(config: &webterm_config::Config) -> Self {
        Self {
            command: webterm_config::shell_command(&config.shell),
            cols: config.sessions.cols,
            rows: config.sessions.rows,
            cwd: webterm_config::shell_cwd(&config.shell),
            env: std::env::vars_os().collect(),
            term: config.shell.term.clone(),
            kill_grace: config.sessions.kill_grace(),
        }
    }
}

/// Events produced by a running PTY process, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of output. Chunk boundaries carry no meaning.
    Data(Bytes),
    /// The foreground process changed.
    TitleChanged(String),
    /// The process is gone. Always the last event.
    Exited { code: i32 },
}

pub type PtyEvents = mpsc::Receiver<PtyEvent>;

#[derive(Debug, Default)]
struct ChildState {
    exit_code: Option<i32>,
    destroyed: bool,
}

/// The forked child. Signals are only delivered while it is unreaped, so a
/// recycled pid is never hit.
#[derive(Debug)]
struct Child {
    pid: Pid,
    state: parking_lot::Mutex<ChildState>,
}

impl Child {
    fn signal_group(&self, signal: Signal) {
        let state = self.state.lock();
        if state.exit_code.is_some() {
            return;
        }
        // The child called setsid(), so its pid is also its process group id.
        if let Err(e) = nix::sys::signal::killpg(self.pid, signal) {
            tracing::debug!(pid = %self.pid, "killpg {signal} failed: {e}");
        }
    }

    fn try_reap(&self) -> Option<i32> {
        let mut state = self.state.lock();
        if state.exit_code.is_some() {
            return state.exit_code;
        }
        let code = match nix::sys::wait::waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
            Ok(_) | Err(nix::errno::Errno::EINTR) => return None,
            Err(e) => {
                tracing::warn!(pid = %self.pid, "waitpid failed: {e}");
                1
            }
        };
        state.exit_code = Some(code);
        Some(code)
    }

    fn is_done(&self) -> bool {
        let state = self.state.lock();
        state.destroyed || state.exit_code.is_some()
    }
}

/// Handle to one shell running on a PTY.
///
/// Dropping the handle destroys the process.
#[derive(Debug)]
pub struct PtyProcess {
    child: Arc<Child>,
    /// Duplicate of the master used for window-size and process-group queries.
    control: OwnedFd,
    input_tx: mpsc::UnboundedSender<Bytes>,
    shutdown: Arc<Notify>,
    program: String,
}

impl PtyProcess {
    /// Start `options.command` on a new PTY.
    pub fn spawn(options: SpawnOptions) -> Result<(Self, PtyEvents), SpawnError> {
        let dimensions = Dimensions::new(options.cols, options.rows)?;
        let name = options.command.first().ok_or(SpawnError::EmptyCommand)?;
        let program_path = resolve_program(name)?;
        let program = program_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());

        // Everything the child touches is prepared before fork.
        let c_program = CString::new(program_path.as_os_str().as_bytes())?;
        let c_cwd = CString::new(options.cwd.as_os_str().as_bytes())?;
        let c_args = options
            .command
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let c_env = build_env(&options.env, &options.term)?;
        let argv = null_terminated(&c_args);
        let envp = null_terminated(&c_env);

        let nix::pty::OpenptyResult { master, slave } =
            nix::pty::openpty(Some(&dimensions.winsize()), None).map_err(SpawnError::Pty)?;
        set_cloexec(master.as_raw_fd());
        set_cloexec(slave.as_raw_fd());
        let (err_read, err_write) = exec_error_pipe()?;

        let exec = ExecParams {
            master: master.as_raw_fd(),
            slave: slave.as_raw_fd(),
            err_fd: err_write.as_raw_fd(),
            cwd: &c_cwd,
            program: &c_program,
            argv: &argv,
            envp: &envp,
        };

        // SAFETY: the child only makes async-signal-safe libc calls on data
        // prepared above before it execs or exits.
        let pid = match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Child) => unsafe { exec_child(&exec) },
            Ok(nix::unistd::ForkResult::Parent { child }) => child,
            Err(e) => return Err(SpawnError::Fork(e)),
        };

        // Close slave and the pipe's write end in the parent
        drop(slave);
        drop(err_write);

        let child = Arc::new(Child {
            pid,
            state: parking_lot::Mutex::new(ChildState::default()),
        });

        if let Some(errno) = read_exec_error(err_read)? {
            let _ = nix::sys::wait::waitpid(pid, None);
            return Err(SpawnError::Exec {
                program: program_path.display().to_string(),
                source: std::io::Error::from_raw_os_error(errno),
            });
        }

        set_nonblocking(master.as_raw_fd());
        let control = master.try_clone()?;
        let master = AsyncFd::new(std::fs::File::from(master))?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let shutdown = Arc::new(Notify::new());

        tracing::debug!(%pid, program, "spawned pty process");

        tokio::spawn(
            IoLoop {
                master,
                child: child.clone(),
                input_rx,
                event_tx,
                shutdown: shutdown.clone(),
                kill_grace: options.kill_grace,
                program: program.clone(),
            }
            .run(),
        );

        Ok((
            Self {
                child,
                control,
                input_tx,
                shutdown,
                program,
            },
            event_rx,
        ))
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.child.pid
    }

    /// Queue `data` for the PTY. Dropped with a log line once the process is gone.
    pub fn write(&self, data: Bytes) {
        if self.child.is_done() {
            tracing::debug!(pid = %self.child.pid, "write to finished process dropped");
            return;
        }
        if self.input_tx.send(data).is_err() {
            tracing::debug!(pid = %self.child.pid, "write after I/O loop ended dropped");
        }
    }

    /// Set the PTY window size. The kernel sends SIGWINCH to the foreground group.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), InvalidDimensions> {
        let ws = Dimensions::new(cols, rows)?.winsize();
        let ret = unsafe { nix::libc::ioctl(self.control.as_raw_fd(), nix::libc::TIOCSWINSZ, &ws) };
        if ret != 0 {
            tracing::warn!(
                pid = %self.child.pid,
                "TIOCSWINSZ failed: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }

    /// Current window size as the kernel sees it.
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        let mut ws: nix::pty::Winsize = unsafe { std::mem::zeroed() };
        unsafe {
            nix::libc::ioctl(self.control.as_raw_fd(), nix::libc::TIOCGWINSZ, &mut ws);
        }
        (ws.ws_col, ws.ws_row)
    }

    /// Name of the PTY's foreground process.
    #[must_use]
    pub fn process_name(&self) -> String {
        foreground_name(self.control.as_raw_fd()).unwrap_or_else(|| self.program.clone())
    }

    /// Hang up the process group and release the PTY. Calling it again does nothing.
    pub fn destroy(&self) {
        {
            let mut state = self.child.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        tracing::debug!(pid = %self.child.pid, "destroying pty process");
        self.child.signal_group(Signal::SIGHUP);
        self.shutdown.notify_one();
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct IoLoop {
    master: AsyncFd<std::fs::File>,
    child: Arc<Child>,
    input_rx: mpsc::UnboundedReceiver<Bytes>,
    event_tx: mpsc::Sender<PtyEvent>,
    shutdown: Arc<Notify>,
    kill_grace: Duration,
    program: String,
}

impl IoLoop {
    async fn run(mut self) {
        let mut sigchld =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!("failed to listen for SIGCHLD, polling instead: {e}");
                    None
                }
            };
        let mut reap_poll = tokio::time::interval(REAP_POLL_INTERVAL);
        reap_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; IO_BUFFER_SIZE];
        let mut pending = BytesMut::new();
        let mut eof = false;
        let mut kill_deadline: Option<tokio::time::Instant> = None;
        let mut title = self.program.clone();

        let code = loop {
            if let Some(code) = self.child.try_reap() {
                if !eof {
                    self.drain(&mut buf).await;
                }
                break code;
            }

            tokio::select! {
                guard = self.master.readable(), if !eof => {
                    let Ok(mut guard) = guard else {
                        eof = true;
                        continue;
                    };
                    let read = guard.try_io(|inner| std::io::Read::read(&mut inner.get_ref(), &mut buf));
                    drop(guard);
                    match read {
                        Ok(Ok(0)) => eof = true,
                        Ok(Ok(n)) => {
                            // Waits while the consumer is behind
                            let _ = self
                                .event_tx
                                .send(PtyEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                                .await;
                            if let Some(name) = foreground_name(self.master.as_raw_fd())
                                && name != title
                            {
                                title = name.clone();
                                let _ = self.event_tx.send(PtyEvent::TitleChanged(name)).await;
                            }
                        }
                        // EIO: every slave descriptor is closed
                        Ok(Err(e)) => {
                            tracing::debug!(pid = %self.child.pid, "master read ended: {e}");
                            eof = true;
                        }
                        Err(_would_block) => {}
                    }
                }
                guard = self.master.writable(), if !pending.is_empty() && !eof => {
                    let Ok(mut guard) = guard else {
                        pending.clear();
                        continue;
                    };
                    match guard.try_io(|inner| std::io::Write::write(&mut inner.get_ref(), &pending)) {
                        Ok(Ok(n)) => pending.advance(n),
                        Ok(Err(e)) => {
                            tracing::debug!(pid = %self.child.pid, "master write failed: {e}");
                            pending.clear();
                        }
                        Err(_would_block) => {}
                    }
                }
                Some(data) = self.input_rx.recv() => {
                    pending.extend_from_slice(&data);
                }
                _ = self.shutdown.notified(), if kill_deadline.is_none() => {
                    kill_deadline = Some(tokio::time::Instant::now() + self.kill_grace);
                }
                _ = sleep_until(kill_deadline) => {
                    tracing::debug!(pid = %self.child.pid, "grace period over, sending SIGKILL");
                    self.child.signal_group(Signal::SIGKILL);
                    kill_deadline = Some(tokio::time::Instant::now() + self.kill_grace);
                }
                _ = recv_signal(&mut sigchld) => {}
                _ = reap_poll.tick(), if eof || kill_deadline.is_some() || sigchld.is_none() => {}
            }
        };

        tracing::debug!(pid = %self.child.pid, code, "pty process exited");
        let _ = self.event_tx.send(PtyEvent::Exited { code }).await;
    }

    /// Forward whatever output is still buffered in the PTY.
    async fn drain(&self, buf: &mut [u8]) {
        loop {
            match std::io::Read::read(&mut self.master.get_ref(), buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if self
                        .event_tx
                        .send(PtyEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_signal(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(signal) => {
            signal.recv().await;
        }
        None => std::future::pending().await,
    }
}

struct ExecParams<'a> {
    master: RawFd,
    slave: RawFd,
    err_fd: RawFd,
    cwd: &'a CStr,
    program: &'a CStr,
    argv: &'a [*const nix::libc::c_char],
    envp: &'a [*const nix::libc::c_char],
}

/// Child side of the fork: make the slave our controlling terminal and stdio,
/// then exec. On failure errno is written to `err_fd`.
unsafe fn exec_child(params: &ExecParams<'_>) -> ! {
    use nix::libc;

    unsafe {
        libc::close(params.master);
        libc::setsid();
        libc::ioctl(params.slave, libc::TIOCSCTTY as _, 0);

        libc::dup2(params.slave, libc::STDIN_FILENO);
        libc::dup2(params.slave, libc::STDOUT_FILENO);
        libc::dup2(params.slave, libc::STDERR_FILENO);
        if params.slave > 2 {
            libc::close(params.slave);
        }

        // The Rust runtime ignores SIGPIPE; the shell should not inherit that.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        libc::chdir(params.cwd.as_ptr());
        libc::execve(
            params.program.as_ptr(),
            params.argv.as_ptr(),
            params.envp.as_ptr(),
        );

        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::ENOEXEC)
            .to_ne_bytes();
        libc::write(params.err_fd, errno.as_ptr().cast(), errno.len());
        libc::_exit(EXEC_FAILED_STATUS)
    }
}

/// Close-on-exec pipe the child reports exec failures through.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn exec_error_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn exec_error_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    set_cloexec(read.as_raw_fd());
    set_cloexec(write.as_raw_fd());
    Ok((read, write))
}

/// Read the child's exec error, if any. EOF means exec succeeded.
fn read_exec_error(pipe: OwnedFd) -> Result<Option<i32>, SpawnError> {
    let mut pipe = std::fs::File::from(pipe);
    let mut errno = [0u8; 4];
    match pipe.read_exact(&mut errno) {
        Ok(()) => Ok(Some(i32::from_ne_bytes(errno))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const nix::libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn build_env(
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    term: &str,
) -> Result<Vec<CString>, std::ffi::NulError> {
    let mut entries = Vec::with_capacity(env.len() + 1);
    for (key, value) in env {
        if key == "TERM" {
            continue;
        }
        let mut entry = key.as_bytes().to_vec();
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        entries.push(CString::new(entry)?);
    }
    entries.push(CString::new(format!("TERM={term}"))?);
    Ok(entries)
}

/// Find `name` the way execvp would, so a missing binary fails before fork.
fn resolve_program(name: &str) -> Result<PathBuf, SpawnError> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(SpawnError::NotFound(name.to_string()))
        };
    }

    let search_path = std::env::var_os("PATH").unwrap_or_else(|| "/usr/bin:/bin".into());
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| SpawnError::NotFound(name.to_string()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Name of the process group in the foreground of the terminal behind `fd`.
fn foreground_name(fd: RawFd) -> Option<String> {
    let pgid = unsafe { nix::libc::tcgetpgrp(fd) };
    if pgid <= 0 {
        return None;
    }
    let comm = std::fs::read_to_string(format!("/proc/{pgid}/comm")).ok()?;
    let name = comm.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn set_cloexec(fd: RawFd) {
    unsafe {
        nix::libc::fcntl(fd, nix::libc::F_SETFD, nix::libc::FD_CLOEXEC);
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = nix::libc::fcntl(fd, nix::libc::F_GETFL);
        nix::libc::fcntl(fd, nix::libc::F_SETFL, flags | nix::libc::O_NONBLOCK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn sh() -> SpawnOptions {
        let mut options = SpawnOptions::new(vec!["/bin/sh".to_string()]);
        options.cols = 80;
        options.rows = 30;
        options.kill_grace = Duration::from_millis(200);
        options
    }

    /// Collect output until `needle` shows up or the process exits.
    async fn read_until(events: &mut PtyEvents, needle: &str) -> String {
        let mut output = Vec::new();
        let result = tokio::time::timeout(TIMEOUT, async {
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Data(data) => {
                        output.extend_from_slice(&data);
                        if String::from_utf8_lossy(&output).contains(needle) {
                            return;
                        }
                    }
                    PtyEvent::TitleChanged(_) => {}
                    PtyEvent::Exited { .. } => return,
                }
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {needle:?}");
        String::from_utf8_lossy(&output).into_owned()
    }

    async fn wait_exit(events: &mut PtyEvents) -> (i32, usize) {
        let mut exits = 0;
        let mut code = -1;
        tokio::time::timeout(TIMEOUT, async {
            while let Some(event) = events.recv().await {
                if let PtyEvent::Exited { code: c } = event {
                    exits += 1;
                    code = c;
                }
            }
        })
        .await
        .expect("event stream did not close");
        (code, exits)
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert_eq!(
            Dimensions::new(0, 24),
            Err(InvalidDimensions { cols: 0, rows: 24 })
        );
        assert!(Dimensions::new(80, 0).is_err());
        assert!(Dimensions::new(80, 24).is_ok());
    }

    #[test]
    fn test_resolve_program() {
        assert!(resolve_program("sh").is_ok());
        assert!(matches!(
            resolve_program("webterm-no-such-binary"),
            Err(SpawnError::NotFound(_))
        ));
        assert!(matches!(
            resolve_program("/nonexistent/bin/sh"),
            Err(SpawnError::NotFound(_))
        ));
    }

    #[test]
    fn test_build_env_overrides_term() {
        let env = vec![
            ("TERM".into(), "dumb".into()),
            ("HOME".into(), "/home/test".into()),
        ];
        let entries = build_env(&env, "xterm-color").unwrap();
        let entries: Vec<_> = entries.iter().map(|e| e.to_str().unwrap()).collect();
        assert_eq!(entries, vec!["HOME=/home/test", "TERM=xterm-color"]);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let options = SpawnOptions::new(vec!["webterm-no-such-binary".to_string()]);
        assert!(matches!(
            PtyProcess::spawn(options),
            Err(SpawnError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_zero_size() {
        let mut options = sh();
        options.cols = 0;
        assert!(matches!(
            PtyProcess::spawn(options),
            Err(SpawnError::InvalidDimensions(_))
        ));
    }

    #[tokio::test]
    async fn test_output_round_trip() {
        let (pty, mut events) = PtyProcess::spawn(sh()).unwrap();
        // The tty echoes the command line itself, so look for the computed value.
        pty.write(Bytes::from_static(b"echo $((40 + 2))\n"));
        let output = read_until(&mut events, "42").await;
        assert!(output.contains("42"));
        pty.destroy();
    }

    #[tokio::test]
    async fn test_output_order_preserved() {
        let (pty, mut events) = PtyProcess::spawn(sh()).unwrap();
        // Quotes keep the echoed command line from matching the marker
        pty.write(Bytes::from_static(
            b"for i in 1 2 3 4 5; do echo line$i; done; echo DO\"\"NE\n",
        ));
        let output = read_until(&mut events, "DONE\r\n").await;
        let positions: Vec<_> = (1..=5)
            .map(|i| output.rfind(&format!("line{i}\r\n")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{output}");
        pty.destroy();
    }

    #[tokio::test]
    async fn test_resize() {
        let (pty, _events) = PtyProcess::spawn(sh()).unwrap();
        assert_eq!(pty.size(), (80, 30));

        assert_eq!(
            pty.resize(0, 24),
            Err(InvalidDimensions { cols: 0, rows: 24 })
        );
        assert_eq!(pty.size(), (80, 30));

        pty.resize(80, 24).unwrap();
        assert_eq!(pty.size(), (80, 24));
        pty.destroy();
    }

    #[tokio::test]
    async fn test_exit_code_reported_once() {
        let (pty, mut events) = PtyProcess::spawn(sh()).unwrap();
        pty.write(Bytes::from_static(b"exit 3\n"));
        let (code, exits) = wait_exit(&mut events).await;
        assert_eq!(code, 3);
        assert_eq!(exits, 1);

        // Writing to the exited process is silently dropped
        pty.write(Bytes::from_static(b"echo nope\n"));
        pty.destroy();
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (pty, mut events) = PtyProcess::spawn(sh()).unwrap();
        pty.destroy();
        pty.destroy();
        let (_code, exits) = wait_exit(&mut events).await;
        assert_eq!(exits, 1);
        pty.destroy();
    }

    #[tokio::test]
    async fn test_destroy_kills_process_ignoring_hangup() {
        let (pty, mut events) = PtyProcess::spawn(sh()).unwrap();
        pty.write(Bytes::from_static(b"trap '' HUP; echo REA\"\"DY\n"));
        read_until(&mut events, "READY\r\n").await;
        pty.destroy();
        let (code, exits) = wait_exit(&mut events).await;
        assert_eq!(exits, 1);
        assert_eq!(code, 128 + Signal::SIGKILL as i32);
    }

    #[tokio::test]
    async fn test_process_name() {
        let (pty, _events) = PtyProcess::spawn(sh()).unwrap();
        assert!(!pty.process_name().is_empty());
        pty.destroy();
    }
}
