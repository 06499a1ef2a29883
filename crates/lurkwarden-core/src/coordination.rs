//! Process-wide coordination between purges, sweeps and the event handler.
//!
//! Flags are held by RAII guards so they clear on every exit path, including
//! errors and panics unwinding through the holder.

use moka::future::Cache;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Default)]
struct SweepState {
    suspended: bool,
    sweeping: HashSet<i64>,
}

/// Shared coordination state.
pub struct Coordinator {
    purge_in_progress: AtomicBool,
    sweeps: Mutex<SweepState>,
    hall_passes: Cache<(i64, i64), ()>,
    drain_poll: Duration,
}

impl Coordinator {
    /// Create the coordinator.
    #[must_use]
    pub fn new(hall_pass_ttl: Duration, drain_poll: Duration) -> Self {
        Self {
            purge_in_progress: AtomicBool::new(false),
            sweeps: Mutex::new(SweepState::default()),
            hall_passes: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(hall_pass_ttl)
                .build(),
            drain_poll,
        }
    }

    fn sweeps(&self) -> MutexGuard<'_, SweepState> {
        self.sweeps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the purge lock and suspend sweeps. `None` if a purge already runs.
    #[must_use]
    pub fn try_begin_purge(self: &Arc<Self>) -> Option<PurgeGuard> {
        self.purge_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.sweeps().suspended = true;
        info!("Purge started, sweeps suspended");
        Some(PurgeGuard {
            coordinator: Arc::clone(self),
        })
    }

    /// Whether a purge currently holds the lock.
    #[must_use]
    pub fn purge_in_progress(&self) -> bool {
        self.purge_in_progress.load(Ordering::Acquire)
    }

    /// Whether new sweeps are refused.
    #[must_use]
    pub fn sweeps_suspended(&self) -> bool {
        self.sweeps().suspended
    }

    /// Mark a chat as being swept. `None` while suspended or already sweeping it.
    #[must_use]
    pub fn try_begin_sweep(self: &Arc<Self>, chat_id: i64) -> Option<SweepGuard> {
        let mut state = self.sweeps();
        if state.suspended || !state.sweeping.insert(chat_id) {
            return None;
        }
        Some(SweepGuard {
            coordinator: Arc::clone(self),
            chat_id,
        })
    }

    /// Chats with a sweep in flight.
    #[must_use]
    pub fn sweeping_chats(&self) -> Vec<i64> {
        let mut chats: Vec<i64> = self.sweeps().sweeping.iter().copied().collect();
        chats.sort_unstable();
        chats
    }

    /// Poll until no sweep is in flight.
    pub async fn wait_for_sweeps_to_drain(&self) {
        loop {
            let in_flight = self.sweeps().sweeping.len();
            if in_flight == 0 {
                return;
            }
            debug!(in_flight, "Waiting for sweeps to drain");
            tokio::time::sleep(self.drain_poll).await;
        }
    }

    /// Let the next leave of this user pass without ban-leavers firing.
    pub async fn grant_hall_pass(&self, chat_id: i64, user_id: i64) {
        self.hall_passes.insert((chat_id, user_id), ()).await;
    }

    /// Consume a hall pass; `true` if one was present.
    pub async fn take_hall_pass(&self, chat_id: i64, user_id: i64) -> bool {
        self.hall_passes.remove(&(chat_id, user_id)).await.is_some()
    }
}

/// Holds the purge lock; releases it and resumes sweeps on drop.
pub struct PurgeGuard {
    coordinator: Arc<Coordinator>,
}

impl Drop for PurgeGuard {
    fn drop(&mut self) {
        self.coordinator.sweeps().suspended = false;
        self.coordinator
            .purge_in_progress
            .store(false, Ordering::Release);
        info!("Purge finished, sweeps resumed");
    }
}

/// Marks one chat as being swept; unmarks it on drop.
pub struct SweepGuard {
    coordinator: Arc<Coordinator>,
    chat_id: i64,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.coordinator.sweeps().sweeping.remove(&self.chat_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Arc<Coordinator> {
        Arc::new(Coordinator::new(
            Duration::from_secs(60),
            Duration::from_millis(100),
        ))
    }

    #[test]
    fn test_single_purge_at_a_time() {
        let coordinator = coordinator();
        let guard = coordinator.try_begin_purge();
        assert!(guard.is_some());
        assert!(coordinator.try_begin_purge().is_none());
        assert!(coordinator.sweeps_suspended());
        drop(guard);
        assert!(!coordinator.purge_in_progress());
        assert!(!coordinator.sweeps_suspended());
        assert!(coordinator.try_begin_purge().is_some());
    }

    #[test]
    fn test_sweep_refused_while_suspended_or_running() {
        let coordinator = coordinator();
        let sweep = coordinator.try_begin_sweep(-1);
        assert!(sweep.is_some());
        assert!(coordinator.try_begin_sweep(-1).is_none());
        assert!(coordinator.try_begin_sweep(-2).is_some());

        let purge = coordinator.try_begin_purge();
        assert!(coordinator.try_begin_sweep(-3).is_none());
        drop(purge);
        drop(sweep);
        assert!(coordinator.sweeping_chats().is_empty());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let coordinator = coordinator();
        let inner = Arc::clone(&coordinator);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.try_begin_sweep(-1);
            panic!("sweep blew up");
        }));
        assert!(result.is_err());
        assert!(coordinator.sweeping_chats().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_waits_for_sweeps_to_drain() {
        let coordinator = coordinator();
        let sweep = coordinator.try_begin_sweep(-1);
        let _purge = coordinator.try_begin_purge();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.wait_for_sweeps_to_drain().await })
        };
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!waiter.is_finished());

        drop(sweep);
        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn test_hall_pass_consumed_once() {
        let coordinator = coordinator();
        coordinator.grant_hall_pass(-1, 7).await;
        assert!(!coordinator.take_hall_pass(-1, 8).await);
        assert!(coordinator.take_hall_pass(-1, 7).await);
        assert!(!coordinator.take_hall_pass(-1, 7).await);
    }
}
