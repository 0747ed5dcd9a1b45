// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Admission control for freshly handshaked devices.
//!
//! Two independent gates, both disabled by default:
//! - hold time: a device's first connection is refused and remembered, and
//!   it may only connect once the hold time has passed since then;
//! - rate limit: token bucket over completed handshakes per second.

use crate::protocol::DatapathId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Why a device was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// First sighting; connection time recorded.
    FirstConnection,
    /// Reconnected before the hold time elapsed.
    HoldTime { remaining: Duration },
    /// Rate limit exhausted.
    RateLimited,
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstConnection => write!(f, "first connection held back"),
            Self::HoldTime { remaining } => {
                write!(f, "connection hold time not elapsed ({:?} left)", remaining)
            }
            Self::RateLimited => write!(f, "connection rate limit exceeded"),
        }
    }
}

struct TokenBucket {
    rate: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: u32, now: Instant) -> Self {
        Self {
            rate: rate as f64,
            tokens: rate as f64,
            last: now,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct AdmissionControl {
    hold_time: Option<Duration>,
    first_seen: DashMap<DatapathId, Instant>,
    limiter: Option<Mutex<TokenBucket>>,
}

impl AdmissionControl {
    /// Zero disables the corresponding gate.
    pub fn new(hold_time: Duration, rate_per_sec: u32) -> Self {
        Self {
            hold_time: (!hold_time.is_zero()).then_some(hold_time),
            first_seen: DashMap::new(),
            limiter: (rate_per_sec > 0)
                .then(|| Mutex::new(TokenBucket::new(rate_per_sec, Instant::now()))),
        }
    }

    /// Everything allowed.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    pub fn check(&self, datapath_id: DatapathId, now: Instant) -> Result<(), Refusal> {
        if let Some(hold_time) = self.hold_time {
            match self.first_seen.get(&datapath_id).map(|t| *t) {
                None => {
                    self.first_seen.insert(datapath_id, now);
                    debug!(
                        "Initial connection attempt by {}, allowing after {:?}",
                        datapath_id, hold_time
                    );
                    return Err(Refusal::FirstConnection);
                }
                Some(first) => {
                    let open_at = first + hold_time;
                    if now < open_at {
                        return Err(Refusal::HoldTime {
                            remaining: open_at - now,
                        });
                    }
                }
            }
        }

        if let Some(limiter) = &self.limiter {
            if !limiter.lock().try_acquire(now) {
                return Err(Refusal::RateLimited);
            }
        }
        Ok(())
    }
}
