//! Child supervisor: spawn, signal forwarding, graceful shutdown.
//!
//! A [`Supervisor`] wraps exactly one child command. The child inherits
//! the parent's stdio and environment, and every catchable signal the
//! parent receives is forwarded to it. Shutdown is either graceful
//! (`TERM`, then `KILL` after a timeout) or immediate (`KILL`). The
//! supervisor never kills the child implicitly: it must exit on its own
//! so its exit code can be observed and reported.

use crate::error::{CoreError, Result};
use crate::event::Trace;
use crate::shutdown::Shutdown;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Signals forwarded to the child while it runs.
///
/// `SIGCHLD` is deliberately absent: the child-exited notification is
/// meaningless to the child itself. `SIGKILL` and `SIGSTOP` cannot be
/// caught.
pub const FORWARDED_SIGNALS: &[libc::c_int] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGWINCH,
    libc::SIGALRM,
    libc::SIGPIPE,
    libc::SIGIO,
    libc::SIGURG,
    libc::SIGCONT,
];

#[derive(Default)]
struct State {
    pid: Option<i32>,
    exited: bool,
    shutdown_timer: Option<JoinHandle<()>>,
}

impl State {
    fn running(&self) -> bool {
        self.pid.is_some() && !self.exited
    }
}

/// Lifecycle manager for a single child process.
pub struct Supervisor {
    argv: Vec<String>,
    command: Mutex<Option<Command>>,
    child: Mutex<Option<Child>>,
    /// Guards start/shutdown transitions. `wait` is never awaited under it.
    state: Mutex<State>,
    signals: Shutdown,
    trace: Trace,
}

impl Supervisor {
    /// Build (but do not start) a supervisor for `name args...` with the
    /// current stdio and environment.
    pub fn new(name: impl Into<String>, args: &[String], trace: Trace) -> Self {
        let name = name.into();
        let mut command = Command::new(&name);
        command
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(name);
        argv.extend(args.iter().cloned());

        Self {
            argv,
            command: Mutex::new(Some(command)),
            child: Mutex::new(None),
            state: Mutex::new(State::default()),
            signals: Shutdown::new(),
            trace,
        }
    }

    /// Spawn the child and begin forwarding signals to it.
    ///
    /// A second call fails with [`CoreError::AlreadyStarted`].
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();

        self.trace.add_event(format!("Start: {self}"));
        let mut command = self
            .command
            .lock()
            .take()
            .ok_or(CoreError::AlreadyStarted)?;
        let child = command.spawn().map_err(CoreError::ChildStart)?;
        state.pid = child.id().map(|id| id as i32);
        *self.child.lock() = Some(child);
        drop(state);

        self.forward_signals()
    }

    /// Block until the child exits and return its exit status.
    ///
    /// On return, signal forwarding stops and any pending graceful
    /// shutdown timer is disarmed.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Err(CoreError::NotStarted);
        };

        let result = child.wait().await;

        self.signals.cancel();
        {
            let mut state = self.state.lock();
            state.exited = true;
            if let Some(timer) = state.shutdown_timer.take() {
                timer.abort();
            }
        }
        result.map_err(CoreError::ChildWait)
    }

    /// Send `TERM` to the child and arm a one-shot timer that escalates
    /// to [`Supervisor::shutdown_force`] when `timeout` expires.
    ///
    /// Returns immediately; does not wait for the child. A no-op when the
    /// child is not running. A second call while the timer is armed fails
    /// with [`CoreError::ShutdownInProgress`].
    pub fn shutdown_graceful(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if !state.running() {
            return Ok(());
        }
        if state.shutdown_timer.is_some() {
            return Err(CoreError::ShutdownInProgress);
        }
        let Some(pid) = state.pid else {
            return Ok(());
        };

        self.trace.add_event("Terminating child process");
        deliver(Pid::from_raw(pid), Signal::SIGTERM)?;

        let this = Arc::clone(self);
        state.shutdown_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(err) = this.shutdown_force() {
                this.trace.add_event(format!("Failed after timeout: {err}"));
            }
        }));
        Ok(())
    }

    /// Send `KILL` to the child. A no-op when the child is not running.
    pub fn shutdown_force(&self) -> Result<()> {
        let state = self.state.lock();
        if !state.running() {
            return Ok(());
        }
        let Some(pid) = state.pid else {
            return Ok(());
        };
        deliver(Pid::from_raw(pid), Signal::SIGKILL)
    }

    /// True iff the child has been spawned and not yet reaped.
    pub fn is_running(&self) -> bool {
        self.state.lock().running()
    }

    /// True iff [`Supervisor::start`] succeeded at some point.
    pub fn was_started(&self) -> bool {
        self.state.lock().pid.is_some()
    }

    /// Subscribe to every forwarded signal and relay each one to the
    /// child until the child exits or the subscription is cancelled.
    fn forward_signals(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for &signum in FORWARDED_SIGNALS {
            let mut stream = signal(SignalKind::from_raw(signum))?;
            let tx = tx.clone();
            let stop = self.signals.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        received = stream.recv() => match received {
                            Some(()) => {
                                if tx.send(signum).is_err() {
                                    return;
                                }
                            }
                            None => return,
                        },
                    }
                }
            });
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.signals.cancelled() => {
                        this.trace.add_event("Stop signal propagation");
                        return;
                    }
                    received = rx.recv() => match received {
                        None => return,
                        Some(signum) => {
                            // SIGURG fires constantly on some runtimes;
                            // forward it untraced
                            if signum != libc::SIGURG {
                                this.trace.add_event(format!(
                                    "Received signal: {}",
                                    signal_name(signum)
                                ));
                            }
                            if let Err(err) = this.signal(signum) {
                                this.trace
                                    .add_event(format!("Signal propagation failed: {err}"));
                            }
                        }
                    },
                }
            }
        });
        Ok(())
    }

    fn signal(&self, signum: libc::c_int) -> Result<()> {
        let pid = {
            let state = self.state.lock();
            if !state.running() {
                return Ok(());
            }
            state.pid
        };
        let Some(pid) = pid else {
            return Ok(());
        };
        let sig = Signal::try_from(signum).map_err(CoreError::ChildSignal)?;
        deliver(Pid::from_raw(pid), sig)
    }
}

impl fmt::Display for Supervisor {
    /// The command line, with double quotes around any element
    /// containing a space.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.contains(' ') {
                write!(f, "\"{arg}\"")?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Supervisor")
            .field("argv", &self.argv)
            .field("pid", &state.pid)
            .field("exited", &state.exited)
            .finish()
    }
}

fn deliver(pid: Pid, sig: Signal) -> Result<()> {
    match kill(pid, sig) {
        Ok(()) => Ok(()),
        // the child already exited; nothing left to signal
        Err(Errno::ESRCH) => Ok(()),
        // permission denied: the pid was likely reused after exit
        Err(Errno::EPERM) => Ok(()),
        Err(err) => Err(CoreError::ChildSignal(err)),
    }
}

fn signal_name(signum: libc::c_int) -> String {
    Signal::try_from(signum)
        .map(|sig| sig.to_string())
        .unwrap_or_else(|_| format!("signal {signum}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn supervisor(name: &str, args: &[&str]) -> Arc<Supervisor> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Arc::new(Supervisor::new(name, &args, Trace::new("supervisor")))
    }

    #[test]
    fn test_sigchld_is_never_forwarded() {
        assert!(!FORWARDED_SIGNALS.contains(&libc::SIGCHLD));
    }

    #[test]
    fn test_display_quotes_spaced_args() {
        let child = supervisor("echo", &["hello world", "plain"]);
        assert_eq!(child.to_string(), "echo \"hello world\" plain");
    }

    #[tokio::test]
    async fn test_start_and_wait_success() {
        let child = supervisor("true", &[]);
        assert!(!child.is_running());
        child.start().expect("start");
        assert!(child.was_started());
        let status = child.wait().await.expect("wait");
        assert!(status.success());
        assert!(!child.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let child = supervisor("true", &[]);
        child.start().expect("first start");
        let err = child.start().expect_err("second start");
        assert!(matches!(err, CoreError::AlreadyStarted));
        child.wait().await.expect("wait");
    }

    #[tokio::test]
    async fn test_wait_before_start_fails() {
        let child = supervisor("true", &[]);
        let err = child.wait().await.expect_err("not started");
        assert!(matches!(err, CoreError::NotStarted));
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let child = supervisor("kubexit-test-no-such-binary", &[]);
        let err = child.start().expect_err("missing binary");
        assert!(matches!(err, CoreError::ChildStart(_)));
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_noop() {
        let child = supervisor("true", &[]);
        child.shutdown_force().expect("force");
        child
            .shutdown_graceful(Duration::from_secs(1))
            .expect("graceful");
    }

    #[tokio::test]
    async fn test_graceful_shutdown_terminates_child() {
        let child = supervisor("sleep", &["30"]);
        child.start().expect("start");
        let started = Instant::now();
        child
            .shutdown_graceful(Duration::from_secs(10))
            .expect("graceful");
        let status = child.wait().await.expect("wait");
        assert!(!status.success());
        assert!(status.code().is_none(), "expected signal exit: {status}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_second_graceful_shutdown_is_rejected() {
        let child = supervisor("sleep", &["30"]);
        child.start().expect("start");
        child
            .shutdown_graceful(Duration::from_secs(30))
            .expect("first graceful");
        let err = child
            .shutdown_graceful(Duration::from_secs(30))
            .expect_err("second graceful");
        assert!(matches!(err, CoreError::ShutdownInProgress));
        child.wait().await.expect("wait");
    }

    #[tokio::test]
    async fn test_grace_timeout_escalates_to_kill() {
        // the child ignores TERM, so only the KILL escalation can end it
        let child = supervisor("sh", &["-c", "trap '' TERM; sleep 30"]);
        child.start().expect("start");
        let started = Instant::now();
        child
            .shutdown_graceful(Duration::from_millis(300))
            .expect("graceful");
        let status = child.wait().await.expect("wait");
        assert!(!status.success());
        assert!(status.code().is_none(), "expected signal exit: {status}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_shutdown_after_exit_is_noop() {
        let child = supervisor("true", &[]);
        child.start().expect("start");
        child.wait().await.expect("wait");
        child.shutdown_force().expect("force after exit");
        child
            .shutdown_graceful(Duration::from_secs(1))
            .expect("graceful after exit");
    }
}
