use std::sync::Arc;
use std::sync::Weak;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::KeyedLimiter;
use crate::LimitError;
use crate::SweepOptions;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a background thread that periodically evicts idle keys.
///
/// The thread only holds a weak reference to its limiter: it exits on its
/// own once the limiter is dropped. Dropping the handle (or calling
/// [`stop`](Sweeper::stop)) stops the thread and waits for it.
#[derive(Debug)]
pub struct Sweeper {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Stop sweeping and wait for the thread to finish.
    pub fn stop(self) {
        drop(self);
    }

    /// `true` while the sweeper thread is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The thread may already be gone; nothing to do then.
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep_once(limiter: &Weak<KeyedLimiter>, idle_timeout: Duration) -> bool {
    match limiter.upgrade() {
        Some(limiter) => {
            limiter.evict_idle(idle_timeout);
            true
        }
        None => false,
    }
}

impl KeyedLimiter {
    /// Start a background thread that calls
    /// [`evict_idle`](KeyedLimiter::evict_idle) every `options.interval`.
    ///
    /// The sweeper goes through the same registry locks as ordinary calls,
    /// so it is safe to run alongside live traffic. A key evicted while it is
    /// still in use simply starts again with a full bucket.
    ///
    /// # Errors
    ///
    /// Returns [`LimitError::Spawn`] if the OS refuses to create the thread.
    pub fn spawn_sweeper(self: &Arc<Self>, options: SweepOptions) -> Result<Sweeper, LimitError> {
        let limiter = Arc::downgrade(self);
        let interval = options.interval.max(MIN_INTERVAL);
        let idle_timeout = options.idle_timeout;
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("keyed-limit-sweeper".to_string())
            .spawn(move || {
                tracing::info!(?interval, ?idle_timeout, "sweeper started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if !sweep_once(&limiter, idle_timeout) {
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("sweeper stopped");
            })?;

        Ok(Sweeper {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

/// Handle to a tokio task that periodically evicts idle keys.
///
/// Dropping the handle aborts the task.
#[cfg(any(feature = "tokio", test))]
#[derive(Debug)]
pub struct SweeperTask {
    handle: tokio::task::JoinHandle<()>,
}

#[cfg(any(feature = "tokio", test))]
impl SweeperTask {
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[cfg(any(feature = "tokio", test))]
impl Drop for SweeperTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(any(feature = "tokio", test))]
impl KeyedLimiter {
    /// Like [`spawn_sweeper`](KeyedLimiter::spawn_sweeper), but runs on the
    /// current tokio runtime instead of a dedicated thread.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_sweeper_task(self: &Arc<Self>, options: SweepOptions) -> SweeperTask {
        let limiter = Arc::downgrade(self);
        let interval = options.interval.max(MIN_INTERVAL);
        let idle_timeout = options.idle_timeout;

        let handle = tokio::spawn(async move {
            tracing::info!(?interval, ?idle_timeout, "sweeper task started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !sweep_once(&limiter, idle_timeout) {
                    break;
                }
            }
            tracing::info!("sweeper task stopped");
        });

        SweeperTask { handle }
    }
}
