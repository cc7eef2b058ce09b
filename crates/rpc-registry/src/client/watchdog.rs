//! Reconnect supervisor for the client's single registry connection

use crate::sync::lock;
use async_channel::{Receiver, Sender};
use async_io::Timer;
use futures::FutureExt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Attempt count at which backoff stops growing
pub const MAX_BACKOFF_ATTEMPTS: u32 = 12;

/// Delay before the next reconnect: `2 << min(attempts, 12)` milliseconds
pub fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_millis(2u64 << attempts.min(MAX_BACKOFF_ATTEMPTS))
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// No connection and no attempt in flight
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Connection established
    Connected,
}

#[derive(Debug)]
struct Progress {
    state: WatchdogState,
    attempts: u32,
}

/// Connection state machine with exponential backoff
#[derive(Debug)]
pub struct Watchdog {
    progress: Mutex<Progress>,
    reconnect: AtomicBool,
    closed: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Watchdog {
    /// Create a disconnected watchdog
    pub fn new(reconnect: bool) -> Self {
        let (wake_tx, wake_rx) = async_channel::bounded(1);
        Self {
            progress: Mutex::new(Progress {
                state: WatchdogState::Disconnected,
                attempts: 0,
            }),
            reconnect: AtomicBool::new(reconnect),
            closed: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    /// Current state
    pub fn state(&self) -> WatchdogState {
        lock(&self.progress).state
    }

    /// Consecutive failed attempts, capped at [`MAX_BACKOFF_ATTEMPTS`]
    pub fn attempts(&self) -> u32 {
        lock(&self.progress).attempts
    }

    /// Whether retries are scheduled after failures
    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect.load(Ordering::SeqCst)
    }

    /// Enable or suppress future retries. Never closes a live connection.
    pub fn set_reconnect(&self, enabled: bool) {
        self.reconnect.store(enabled, Ordering::SeqCst);
        if enabled {
            self.wake();
        }
    }

    /// Stop supervising for good
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reconnect.store(false, Ordering::SeqCst);
        self.wake();
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// `DISCONNECTED -> CONNECTING`
    pub fn begin_connect(&self) {
        lock(&self.progress).state = WatchdogState::Connecting;
    }

    /// `CONNECTING -> CONNECTED`, resetting the attempt counter
    pub fn connected(&self) {
        let mut progress = lock(&self.progress);
        progress.state = WatchdogState::Connected;
        progress.attempts = 0;
    }

    /// `CONNECTING -> DISCONNECTED`; returns the retry delay if reconnect is on
    pub fn connect_failed(&self) -> Option<Duration> {
        self.schedule_retry()
    }

    /// `CONNECTED -> DISCONNECTED`; returns the retry delay if reconnect is on
    pub fn disconnected(&self) -> Option<Duration> {
        self.schedule_retry()
    }

    fn schedule_retry(&self) -> Option<Duration> {
        let mut progress = lock(&self.progress);
        progress.state = WatchdogState::Disconnected;
        if !self.reconnect_enabled() {
            return None;
        }
        let delay = backoff_delay(progress.attempts);
        progress.attempts = (progress.attempts + 1).min(MAX_BACKOFF_ATTEMPTS);
        debug!("Scheduling reconnect in {:?}", delay);
        Some(delay)
    }

    /// Wait out a retry delay, or indefinitely while reconnect is disabled.
    ///
    /// Wakeups raised before the call (such as enabling reconnect while
    /// still connected) do not cut the delay short.
    ///
    /// Returns false once the watchdog is closed.
    pub async fn wait(&self, mut delay: Option<Duration>) -> bool {
        while self.wake_rx.try_recv().is_ok() {}
        loop {
            if self.is_closed() {
                return false;
            }
            match delay {
                None if self.reconnect_enabled() => return true,
                Some(delay) => {
                    let timer = FutureExt::fuse(Timer::after(delay));
                    let woken = self.wake_rx.recv().fuse();
                    futures::pin_mut!(timer, woken);
                    futures::select! {
                        _ = timer => {}
                        _ = woken => {}
                    }
                }
                None => {
                    if self.wake_rx.recv().await.is_err() {
                        return false;
                    }
                }
            }
            if self.is_closed() {
                return false;
            }
            if self.reconnect_enabled() {
                return true;
            }
            delay = None;
        }
    }
}
