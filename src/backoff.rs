use log::info;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct BackoffState {
    exponent: u32,
    until: Option<Instant>,
}

/// Outbound throttle armed by rate-limit signals. Each consecutive hit
/// doubles the delay up to `max`.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    state: Mutex<BackoffState>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            state: Mutex::new(BackoffState {
                exponent: 0,
                until: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BackoffState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arms the throttle and returns the delay applied.
    pub fn arm(&self) -> Duration {
        let mut state = self.state();
        let factor = 1u32.checked_shl(state.exponent).unwrap_or(u32::MAX);
        let delay = self.initial.saturating_mul(factor).min(self.max);
        if delay < self.max {
            state.exponent += 1;
        }
        state.until = Some(Instant::now() + delay);
        info!(target: "Client/Backoff", "Backing off for {delay:?} due to rate limit");
        delay
    }

    /// Forgets consecutive hits. A wait already armed still runs out.
    pub fn reset(&self) {
        self.state().exponent = 0;
    }

    pub fn remaining(&self) -> Option<Duration> {
        let until = self.state().until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// Sleeps until any armed delay has passed.
    pub async fn wait(&self) {
        let until = self.state().until;
        if let Some(until) = until {
            tokio::time::sleep_until(until).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delay_doubles_up_to_the_cap() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(30));
        let delays: Vec<u64> = (0..5).map(|_| backoff.arm().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.arm(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_expiry() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(30));
        let start = Instant::now();
        backoff.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        backoff.arm();
        assert!(backoff.remaining().is_some());
        backoff.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(backoff.remaining().is_none());
    }
}
