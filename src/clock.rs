//! Single-shot timer source for the switch loop.
//!
//! `SystemClock` sleeps on the tokio timer wheel. `FakeClock` keeps virtual
//! time that only moves when `advance` is called, so tests can drive the
//! switch through misses without real sleeps.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Source of single-shot timers.
pub trait Clock: Send + Sync + 'static {
    /// Arm a timer that completes once `duration` has elapsed.
    fn timer(&self, duration: Duration) -> Timer;
}

/// A pending single-shot timer. Await it for completion; cancel it (or drop
/// it) to disarm.
pub struct Timer {
    kind: TimerKind,
}

enum TimerKind {
    Sleep(Pin<Box<tokio::time::Sleep>>),
    #[cfg(test)]
    Manual {
        fired: tokio::sync::oneshot::Receiver<()>,
        _guard: fake::ManualGuard,
    },
}

impl Timer {
    /// Disarm the timer. A cancelled timer never completes.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Future for Timer {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.get_mut().kind {
            TimerKind::Sleep(sleep) => sleep.as_mut().poll(cx),
            #[cfg(test)]
            TimerKind::Manual { fired, .. } => match Pin::new(fired).poll(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(()),
                // Clock dropped: virtual time can never reach the deadline.
                Poll::Ready(Err(_)) => Poll::Pending,
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Wall-clock timers backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn timer(&self, duration: Duration) -> Timer {
        Timer {
            kind: TimerKind::Sleep(Box::pin(tokio::time::sleep(duration))),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{Clock, Timer, TimerKind};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Duration;
    use tokio::sync::{oneshot, watch};

    /// Virtual clock for deterministic tests.
    #[derive(Clone)]
    pub struct FakeClock {
        inner: Arc<Mutex<FakeInner>>,
        armed: watch::Sender<u64>,
    }

    #[derive(Default)]
    struct FakeInner {
        now: Duration,
        next_id: u64,
        pending: Vec<PendingTimer>,
    }

    struct PendingTimer {
        id: u64,
        deadline: Duration,
        fire: oneshot::Sender<()>,
    }

    /// Removes a manual timer from its clock when the timer is dropped.
    pub(super) struct ManualGuard {
        id: u64,
        inner: Arc<Mutex<FakeInner>>,
    }

    impl Drop for ManualGuard {
        fn drop(&mut self) {
            let mut inner = lock(&self.inner);
            inner.pending.retain(|t| t.id != self.id);
        }
    }

    fn lock(inner: &Mutex<FakeInner>) -> MutexGuard<'_, FakeInner> {
        inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    impl FakeClock {
        pub fn new() -> Self {
            let (armed, _) = watch::channel(0);
            Self {
                inner: Arc::new(Mutex::new(FakeInner::default())),
                armed,
            }
        }

        /// Current virtual time, measured from clock creation.
        pub fn now(&self) -> Duration {
            lock(&self.inner).now
        }

        /// Move virtual time forward and fire every timer whose deadline has
        /// been reached. Returns the number of timers fired.
        pub fn advance(&self, by: Duration) -> usize {
            let due = {
                let mut inner = lock(&self.inner);
                inner.now += by;
                let now = inner.now;
                let (due, pending): (Vec<_>, Vec<_>) =
                    inner.pending.drain(..).partition(|t| t.deadline <= now);
                inner.pending = pending;
                due
            };

            let fired = due.len();
            for timer in due {
                let _ = timer.fire.send(());
            }
            fired
        }

        /// Number of timers armed and not yet fired or cancelled.
        pub fn pending(&self) -> usize {
            lock(&self.inner).pending.len()
        }

        /// Total number of timers ever armed on this clock.
        pub fn armed(&self) -> u64 {
            *self.armed.borrow()
        }

        /// Wait until at least `count` timers have been armed in total.
        pub async fn wait_for_armed(&self, count: u64) {
            let mut rx = self.armed.subscribe();
            // The sender lives in `self`, so the channel cannot close here.
            let _ = rx.wait_for(|armed| *armed >= count).await;
        }
    }

    impl Default for FakeClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for FakeClock {
        fn timer(&self, duration: Duration) -> Timer {
            let (fire, fired) = oneshot::channel();
            let id = {
                let mut inner = lock(&self.inner);
                let id = inner.next_id;
                inner.next_id += 1;
                let deadline = inner.now + duration;
                inner.pending.push(PendingTimer { id, deadline, fire });
                id
            };
            self.armed.send_modify(|armed| *armed += 1);

            Timer {
                kind: TimerKind::Manual {
                    fired,
                    _guard: ManualGuard {
                        id,
                        inner: Arc::clone(&self.inner),
                    },
                },
            }
        }
    }
}
