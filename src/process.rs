//! Coordination between the backend runner and the signal-handling task.
//!
//! The runner owns the child process; the signal task only ever sees its pid.
//! All state sits behind one mutex that is held for field reads and writes,
//! never across the progress stop callback (it joins a render thread).

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Callback that stops the progress indicator. Runs at most once.
pub type StopCallback = Box<dyn FnOnce() + Send>;

/// Signals the registry knows how to forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
}

impl Signal {
    /// Interrupt and terminate latch the interrupted flag and reach the whole
    /// process group; anything else goes to the registered process only.
    pub fn is_termination(self) -> bool {
        matches!(self, Self::Interrupt | Self::Terminate)
    }

    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Hangup => libc::SIGHUP,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    pid: Option<u32>,
    stop_progress: Option<StopCallback>,
    interrupted: bool,
}

/// Tracks the one backend process running for this invocation.
///
/// Built by the caller and shared (usually through an `Arc`) with the signal
/// handler, so nothing leaks between invocations or tests.
#[derive(Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a freshly spawned process group leader and its progress stop
    /// callback, replacing whatever a previous run left behind.
    ///
    /// The interrupted flag is a latch: if a signal arrived between launch and
    /// registration it was not delivered to anything, so it is forwarded to
    /// the new group now. Returns true when that happened.
    pub fn register(&self, pid: u32, stop_progress: Option<StopCallback>) -> bool {
        let interrupted = {
            let mut state = self.lock();
            state.pid = Some(pid);
            state.stop_progress = stop_progress;
            state.interrupted
        };
        if interrupted {
            tracing::debug!(pid, "interrupt latched before registration, forwarding");
            send_signal(pid, Signal::Interrupt);
        }
        interrupted
    }

    pub fn unregister(&self) {
        let mut state = self.lock();
        state.pid = None;
        state.stop_progress = None;
    }

    pub fn forward_signal(&self, signal: Signal) {
        let pid = {
            let mut state = self.lock();
            if signal.is_termination() {
                state.interrupted = true;
            }
            state.pid
        };
        let Some(pid) = pid else {
            return;
        };
        tracing::debug!(pid, ?signal, "forwarding signal to backend");
        send_signal(pid, signal);
    }

    pub fn stop_progress_if_set(&self) {
        let stop = self.lock().stop_progress.take();
        if let Some(stop) = stop {
            stop();
        }
    }

    pub fn was_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    pub fn registered_pid(&self) -> Option<u32> {
        self.lock().pid
    }
}

/// Send `signal` to the process group led by `pid`, or to `pid` alone when
/// the signal is not a termination signal or group delivery fails.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) {
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let raw = signal.as_raw();
    if signal.is_termination() {
        // SAFETY: kill(2) with a negative pid addresses the process group.
        let rc = unsafe { libc::kill(-raw_pid, raw) };
        if rc == 0 {
            return;
        }
        tracing::debug!(pid, "process group signal failed, signalling leader");
    }
    // SAFETY: plain kill(2) on a pid we spawned.
    unsafe {
        libc::kill(raw_pid, raw);
    }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: Signal) {
    tracing::warn!(pid, ?signal, "signal forwarding is not supported on this platform");
}

/// SIGKILL the whole group. Used when a run is abandoned mid-stream.
#[cfg(unix)]
pub fn kill_group(pid: u32) {
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid addresses the process group.
    unsafe {
        libc::kill(-raw_pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) {}
