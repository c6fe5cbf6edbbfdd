//! Resettable idle handshake between the batcher and the git syncer

use tokio::sync::watch;

/// Idle announcements as a generation counter
///
/// Each [`IdleSignal::signal`] closes the current cycle and opens the next
/// one; [`IdleSignal::wait`] only returns for a signal sent after it started
/// waiting, so a stale announcement never satisfies a new waiter.
#[derive(Debug)]
pub struct IdleSignal {
    generation: watch::Sender<u64>,
}

impl IdleSignal {
    /// Create a signal with no announcements yet
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { generation }
    }

    /// Announce that the batcher has no queued or in-flight work
    pub fn signal(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Wait for the next announcement
    pub async fn wait(&self) {
        let mut rx = self.generation.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.changed().await;
    }

    /// Number of announcements so far
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }
}

impl Default for IdleSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_ignores_earlier_signals() {
        let idle = IdleSignal::new();
        idle.signal();
        idle.signal();
        assert_eq!(idle.generation(), 2);

        let waited = tokio::time::timeout(Duration::from_millis(50), idle.wait()).await;
        assert!(waited.is_err(), "a signal sent before waiting must not count");
    }

    #[tokio::test]
    async fn test_wait_wakes_on_next_signal() {
        let idle = Arc::new(IdleSignal::new());
        let waiter = {
            let idle = Arc::clone(&idle);
            tokio::spawn(async move { idle.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        idle.signal();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
