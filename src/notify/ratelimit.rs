//! Sliding-window send budget
//!
//! Each bucket remembers when it last let events through. An attempt is
//! allowed while fewer than `max_events` stamps are younger than `interval`.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;

use super::SinkType;
use crate::config::RateLimitConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    sink: Option<SinkType>,
    agent: Option<String>,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<BucketKey, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn try_acquire(&self, sink: SinkType, agent_id: &str) -> bool {
        self.try_acquire_at(sink, agent_id, Instant::now())
    }

    /// Record an attempt at `now` if the bucket has room
    pub fn try_acquire_at(&self, sink: SinkType, agent_id: &str, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }

        let key = BucketKey {
            sink: self.config.per_channel.then_some(sink),
            agent: self.config.per_agent.then(|| agent_id.to_string()),
        };

        let mut buckets = self.buckets.lock();
        let stamps = buckets.entry(key).or_default();
        while stamps
            .front()
            .is_some_and(|&stamp| now.saturating_duration_since(stamp) >= self.config.interval)
        {
            stamps.pop_front();
        }

        if stamps.len() < self.config.max_events {
            stamps.push_back(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn limiter(max_events: usize, per_channel: bool, per_agent: bool) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            interval: Duration::from_secs(60),
            max_events,
            per_channel,
            per_agent,
        })
    }

    #[test]
    fn third_event_in_window_is_dropped() {
        let limiter = limiter(2, true, false);
        let now = Instant::now();
        assert!(limiter.try_acquire_at(SinkType::Webhook, "A1", now));
        assert!(limiter.try_acquire_at(SinkType::Webhook, "A1", now));
        assert!(!limiter.try_acquire_at(SinkType::Webhook, "A1", now));
        // another sink has its own budget
        assert!(limiter.try_acquire_at(SinkType::Slack, "A1", now));
        // the window slides
        assert!(limiter.try_acquire_at(SinkType::Webhook, "A1", now + Duration::from_secs(60)));
    }

    #[test]
    fn shared_bucket_without_per_channel() {
        let limiter = limiter(1, false, false);
        let now = Instant::now();
        assert!(limiter.try_acquire_at(SinkType::Webhook, "A1", now));
        assert!(!limiter.try_acquire_at(SinkType::Slack, "A2", now));
    }

    #[test]
    fn per_agent_buckets() {
        let limiter = limiter(1, true, true);
        let now = Instant::now();
        assert!(limiter.try_acquire_at(SinkType::Webhook, "A1", now));
        assert!(limiter.try_acquire_at(SinkType::Webhook, "A2", now));
        assert!(!limiter.try_acquire_at(SinkType::Webhook, "A1", now));
    }

    #[test]
    fn disabled_allows_everything() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let now = Instant::now();
        assert!((0..1000).all(|_| limiter.try_acquire_at(SinkType::Email, "A1", now)));
    }

    proptest! {
        #[test]
        fn window_never_exceeds_budget(
            max_events in 1usize..6,
            gaps in proptest::collection::vec(0u64..30_000, 1..80),
        ) {
            let limiter = limiter(max_events, true, false);
            let start = Instant::now();
            let interval = Duration::from_secs(60);

            let mut offset = Duration::ZERO;
            let mut accepted = Vec::new();
            for gap in gaps {
                offset += Duration::from_millis(gap);
                if limiter.try_acquire_at(SinkType::Webhook, "A1", start + offset) {
                    accepted.push(offset);
                }
            }

            for (i, &from) in accepted.iter().enumerate() {
                let in_window = accepted[i..].iter().take_while(|&&t| t - from < interval).count();
                prop_assert!(in_window <= max_events);
            }
        }
    }
}
