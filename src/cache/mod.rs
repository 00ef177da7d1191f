//! Parameter-addressed result cache.
//!
//! Synthesized artifacts are stored under a [`CacheKey`] derived from every
//! synthesis parameter plus the lane tag. Two consequences follow:
//!
//! - Identical requests on the same lane share one artifact.
//! - A free-lane (watermarked) artifact can never answer a priority-lane
//!   request, and vice versa, because the keys differ.
//!
//! The [`CacheStore`] is shared across lanes and sharded internally so that
//! unrelated keys do not contend on one lock.

pub mod key;
pub mod store;

pub use key::{CacheKey, KEY_PREFIX};
pub use store::{CacheEntry, CacheStats, CacheStore};

use std::time::Duration;

/// TTL for an artifact of `text_chars` characters on a lane with `lane_ttl`.
///
/// Long texts are rarely repeated verbatim, so they get at most
/// `long_text_max_ttl` regardless of the lane setting.
pub fn effective_ttl(
    lane_ttl: Duration,
    text_chars: usize,
    long_text_threshold: usize,
    long_text_max_ttl: Duration,
) -> Duration {
    if text_chars >= long_text_threshold {
        lane_ttl.min(long_text_max_ttl)
    } else {
        lane_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_keeps_lane_ttl() {
        let ttl = effective_ttl(
            Duration::from_secs(86_400),
            20,
            200,
            Duration::from_secs(7_200),
        );
        assert_eq!(ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn test_long_text_capped() {
        let ttl = effective_ttl(
            Duration::from_secs(86_400),
            200,
            200,
            Duration::from_secs(7_200),
        );
        assert_eq!(ttl, Duration::from_secs(7_200));

        // Cap never lengthens a shorter lane TTL.
        let ttl = effective_ttl(Duration::from_secs(60), 500, 200, Duration::from_secs(7_200));
        assert_eq!(ttl, Duration::from_secs(60));
    }
}
