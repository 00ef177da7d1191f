//! Lane classification.
//!
//! Maps an upstream-resolved identity onto one of the two traffic lanes and
//! the lane's immutable configuration. Unknown plan tags are rejected rather
//! than defaulted, so a misconfigured identity can never obtain priority
//! capacity.

use crate::config::{ConfigHandle, LaneConfig};
use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Lane
// ============================================================================

/// Isolated traffic class with its own capacity, rate limit and watermark
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Paying traffic. Never watermarked by default.
    Priority,
    /// Free-tier traffic. Isolated, throttled harder, watermarked.
    Free,
}

impl Lane {
    /// Every lane, in a fixed order. Used to size per-lane structures.
    pub const ALL: [Lane; 2] = [Lane::Priority, Lane::Free];

    /// Stable lowercase name for logs, metrics and cache-key tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Priority => "priority",
            Lane::Free => "free",
        }
    }

    /// Dense index into per-lane arrays.
    pub(crate) fn index(&self) -> usize {
        match self {
            Lane::Priority => 0,
            Lane::Free => 1,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-size container holding one value per lane.
///
/// Indexing is exhaustive over [`Lane`], so adding a lane is a compile error
/// everywhere a per-lane value is constructed.
#[derive(Debug, Clone, Default)]
pub struct PerLane<T> {
    slots: [T; 2],
}

impl<T> PerLane<T> {
    /// Build a value for every lane.
    pub fn from_fn(mut f: impl FnMut(Lane) -> T) -> Self {
        Self {
            slots: [f(Lane::Priority), f(Lane::Free)],
        }
    }

    /// Borrow the value for `lane`.
    pub fn get(&self, lane: Lane) -> &T {
        &self.slots[lane.index()]
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Identity as produced by the upstream authentication collaborator.
///
/// The gateway never authenticates; it trusts `api_key_id` and maps `plan`
/// through the configured plan table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Opaque API key identifier (rate-limit bucket key)
    pub api_key_id: String,
    /// Plan tag from the billing/auth system (e.g. "pro", "free")
    pub plan: String,
}

impl RequestIdentity {
    /// Create an identity from an API key id and plan tag.
    pub fn new(api_key_id: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            api_key_id: api_key_id.into(),
            plan: plan.into(),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Classifies requests into lanes against the current config snapshot.
#[derive(Clone)]
pub struct LaneRouter {
    config: Arc<ConfigHandle>,
}

impl LaneRouter {
    /// Create a router reading from the shared config handle.
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self { config }
    }

    /// Resolve the lane and lane configuration for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownLane`] when the plan tag is not in the
    /// configured plan table.
    pub fn classify(&self, identity: &RequestIdentity) -> GatewayResult<(Lane, LaneConfig)> {
        let snapshot = self.config.snapshot();
        let tag = identity.plan.trim().to_ascii_lowercase();

        let lane = snapshot
            .plans
            .get(&tag)
            .copied()
            .ok_or_else(|| GatewayError::UnknownLane {
                plan: identity.plan.clone(),
            })?;

        Ok((lane, snapshot.lanes.get(lane).clone()))
    }
}
