use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Background task that is aborted when the guard is dropped.
///
/// Every timer the mesh arms is held in one of these, so replacing or
/// clearing the owning slot cancels the timer.
#[derive(Debug)]
pub struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Deliver `event` on `tx` once `delay` has elapsed.
    pub fn after<E>(delay: Duration, tx: mpsc::UnboundedSender<E>, event: E) -> Self
    where
        E: Send + 'static,
    {
        Self::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(event);
        })
    }

    /// Deliver a fresh event every `period`, first one after a full period.
    /// Stops once the receiving side is gone.
    pub fn every<E, F>(period: Duration, tx: mpsc::UnboundedSender<E>, make_event: F) -> Self
    where
        E: Send + 'static,
        F: Fn() -> E + Send + 'static,
    {
        Self::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make_event()).is_err() {
                    break;
                }
            }
        })
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
