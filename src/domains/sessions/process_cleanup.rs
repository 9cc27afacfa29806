use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Signals understood by [`send_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(target_family = "unix")]
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Delivers `signal` to `pid`. Returns `false` when the process is already gone.
#[cfg(target_family = "unix")]
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    let pid_t = pid as libc::pid_t;
    let result = unsafe { libc::kill(pid_t, signal.raw()) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => return false,
            Some(libc::EPERM) => warn!("Insufficient permissions to signal process {pid}"),
            _ => warn!("Failed to send {signal:?} to process {pid}: {err}"),
        }
        return false;
    }
    debug!("Sent {signal:?} to process {pid}");
    true
}

#[cfg(not(target_family = "unix"))]
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    debug!("Signals unsupported on this platform; ignoring {signal:?} for {pid}");
    false
}

#[cfg(target_family = "unix")]
pub fn process_alive(pid: u32) -> bool {
    unsafe {
        if libc::kill(pid as libc::pid_t, 0) == 0 {
            true
        } else {
            matches!(
                std::io::Error::last_os_error().raw_os_error(),
                Some(libc::EPERM)
            )
        }
    }
}

#[cfg(not(target_family = "unix"))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Sends SIGTERM now and SIGKILL after `grace` unless `exited` has been set by
/// whoever reaps the child. Must be called from within a tokio runtime.
pub fn terminate_with_grace(pid: u32, grace: Duration, exited: Arc<AtomicBool>) {
    if exited.load(Ordering::SeqCst) {
        return;
    }
    if !send_signal(pid, Signal::Terminate) {
        return;
    }
    tokio::spawn(async move {
        sleep(grace).await;
        if exited.load(Ordering::SeqCst) {
            return;
        }
        debug!("Process {pid} still running after {grace:?}; escalating to SIGKILL");
        send_signal(pid, Signal::Kill);
    });
}
