use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic request counter paired with the latest published value.
///
/// Each recompute takes a ticket from [`Generation::begin`]; [`Generation::publish`] only
/// stores the result while that ticket is still the newest, so a slow stale fetch cannot
/// overwrite a newer one.
#[derive(Debug)]
pub struct Generation<T> {
    current: AtomicU64,
    latest: Mutex<Option<(u64, T)>>,
}

impl<T: Clone> Generation<T> {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
            latest: Mutex::new(None),
        }
    }

    pub fn begin(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, ticket: u64) -> bool {
        self.current() == ticket
    }

    /// Returns false (and drops `value`) if `ticket` has been superseded.
    pub fn publish(&self, ticket: u64, value: T) -> bool {
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the lock so a concurrent begin()+publish() pair can't interleave.
        if !self.is_current(ticket) {
            return false;
        }
        *latest = Some((ticket, value));
        true
    }

    /// Latest published value, tagged with the generation it was computed for.
    pub fn latest(&self) -> Option<(u64, T)> {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Latest value only if it belongs to the current generation.
    pub fn ready(&self) -> Option<T> {
        let cur = self.current();
        self.latest()
            .filter(|(g, _)| *g == cur)
            .map(|(_, v)| v)
    }
}

impl<T: Clone> Default for Generation<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_results_are_discarded() {
        let g: Generation<&str> = Generation::new();
        let first = g.begin();
        let second = g.begin();
        assert!(g.publish(second, "new"));
        assert!(!g.publish(first, "old"));
        assert_eq!(g.latest(), Some((second, "new")));
        assert_eq!(g.ready(), Some("new"));
    }

    #[test]
    fn default_starts_at_generation_zero() {
        let g: Generation<u32> = Generation::default();
        assert_eq!(g.current(), 0);
        assert_eq!(g.latest(), None);
        assert_eq!(g.begin(), 1);
    }

    #[test]
    fn ready_is_none_while_pending() {
        let g: Generation<u32> = Generation::new();
        let t = g.begin();
        assert!(g.publish(t, 7));
        g.begin();
        assert_eq!(g.ready(), None);
        assert_eq!(g.latest(), Some((t, 7)));
    }

    #[tokio::test]
    async fn out_of_order_completion_keeps_newest() {
        use std::sync::Arc;
        use std::time::Duration;

        let g: Arc<Generation<u64>> = Arc::new(Generation::new());
        let slow = g.begin();
        let fast = g.begin();

        let g1 = Arc::clone(&g);
        let slow_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            g1.publish(slow, slow)
        });
        let g2 = Arc::clone(&g);
        let fast_task = tokio::spawn(async move { g2.publish(fast, fast) });

        assert!(fast_task.await.unwrap());
        assert!(!slow_task.await.unwrap());
        assert_eq!(g.ready(), Some(fast));
    }
}
