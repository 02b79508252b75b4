//! Child supervision with termination signal forwarding
//!
//! Whoever started the codec tool only knows this process, so termination
//! requests sent here are passed on to the child. For remote runs the remote
//! shell decides whether they reach the worker-side process.
//!
//! One [`SignalForwarder`] lives for a whole dispatch. Its listeners stay
//! registered between attempts, so a request that arrives while no child is
//! running is still seen and cancels the dispatch.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::future::poll_fn;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::task::{Context, Poll};
use tokio::process::Child;
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tracing::{debug, info, warn};

/// Signals forwarded to the running child
pub const FORWARDED_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGHUP,
];

fn kind_of(sig: Signal) -> SignalKind {
    SignalKind::from_raw(sig as i32)
}

pub struct SignalForwarder {
    streams: Vec<(Signal, SignalStream)>,
    received: Option<Signal>,
}

impl SignalForwarder {
    /// Register listeners for [`FORWARDED_SIGNALS`].
    ///
    /// A listener that cannot be registered is skipped; supervision then only
    /// waits for the child on that signal.
    pub fn install() -> Self {
        let streams = FORWARDED_SIGNALS
            .iter()
            .filter_map(|&sig| match signal(kind_of(sig)) {
                Ok(stream) => Some((sig, stream)),
                Err(e) => {
                    warn!(signal = %sig, error = %e, "failed to listen for signal");
                    None
                }
            })
            .collect();
        Self {
            streams,
            received: None,
        }
    }

    /// First termination request seen during this dispatch
    pub fn cancelled(&self) -> Option<Signal> {
        self.received
    }

    /// Pick up a request delivered while no child was running, without waiting
    pub async fn poll_pending(&mut self) -> Option<Signal> {
        let streams = &mut self.streams;
        let pending = poll_fn(|cx| {
            Poll::Ready(match poll_streams(streams, cx) {
                Poll::Ready(sig) => Some(sig),
                Poll::Pending => None,
            })
        })
        .await;
        if let Some(sig) = pending {
            self.record(sig);
        }
        self.received
    }

    /// Wait for `child` to exit, forwarding every request to it
    pub async fn wait(&mut self, child: &mut Child) -> io::Result<ExitStatus> {
        loop {
            let received = tokio::select! {
                status = child.wait() => return status,
                sig = poll_fn(|cx| poll_streams(&mut self.streams, cx)) => sig,
            };
            self.record(received);
            forward_signal(child, received);
        }
    }

    fn record(&mut self, sig: Signal) {
        if self.received.is_none() {
            info!(signal = %sig, "termination requested");
            self.received = Some(sig);
        }
    }
}

/// Ready with the first signal any stream has delivered. Closed streams are
/// never ready.
fn poll_streams(streams: &mut [(Signal, SignalStream)], cx: &mut Context<'_>) -> Poll<Signal> {
    for (sig, stream) in streams.iter_mut() {
        if let Poll::Ready(Some(())) = stream.poll_recv(cx) {
            return Poll::Ready(*sig);
        }
    }
    Poll::Pending
}

fn forward_signal(child: &Child, sig: Signal) {
    let Some(pid) = child.id() else {
        debug!(signal = %sig, "child already exited, not forwarding");
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "child pid out of range, not forwarding");
        return;
    };
    match kill(Pid::from_raw(raw), sig) {
        Ok(()) => info!(pid, signal = %sig, "forwarded signal to child"),
        Err(e) => warn!(pid, signal = %sig, error = %e, "failed to forward signal"),
    }
}

/// Exit code to report for `status`; a signal death maps to 128 + signal
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

/// Exit code for a dispatch cancelled by `sig` before any child ran
pub fn cancelled_exit_code(sig: Signal) -> i32 {
    128 + sig as i32
}

/// Serializes tests that install listeners or signal this process
#[cfg(test)]
pub(crate) fn serial_signal_tests() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Send `sig` to this test process after `delay`
#[cfg(test)]
pub(crate) fn signal_self_after(sig: Signal, delay: std::time::Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let pid = Pid::from_raw(std::process::id() as i32);
        kill(pid, sig).unwrap();
    });
}
