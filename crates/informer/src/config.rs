use std::time::Duration;

use backoff::ExponentialBackoff;

/// Per-informer tuning. Each watched resource type gets its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformerConfig {
    /// Resync period for handlers registered without their own; zero disables.
    pub resync: Duration,
    /// How often due resyncs are evaluated.
    pub resync_check: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed watch attempts before falling back to a full list.
    pub max_watch_retries: u32,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync: Duration::from_secs(3600),
            resync_check: Duration::from_secs(1),
            backoff_initial: Duration::from_millis(800),
            backoff_max: Duration::from_secs(30),
            max_watch_retries: 5,
        }
    }
}

impl InformerConfig {
    /// Read `TETHER_*` overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let num = |k: &str| lookup(k).and_then(|s| s.trim().parse::<u64>().ok());
        let d = Self::default();
        Self {
            resync: num("TETHER_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync),
            resync_check: num("TETHER_RESYNC_CHECK_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(d.resync_check),
            backoff_initial: num("TETHER_WATCH_BACKOFF_INITIAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.backoff_initial),
            backoff_max: num("TETHER_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            max_watch_retries: num("TETHER_WATCH_MAX_RETRIES")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(d.max_watch_retries),
        }
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_resync_check(mut self, check: Duration) -> Self {
        self.resync_check = check;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    pub fn with_max_watch_retries(mut self, n: u32) -> Self {
        self.max_watch_retries = n;
        self
    }

    /// Jittered doubling delay for list retries and watch reopens. Never
    /// gives up on its own; the reflector stops it through cancellation.
    pub fn watch_backoff(&self) -> ExponentialBackoff {
        let initial = self.backoff_initial.max(Duration::from_millis(1));
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: self.backoff_max.max(initial),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
