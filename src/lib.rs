//! LaneGate - two-lane admission and synthesis gateway.
//!
//! LaneGate sits in front of a single, expensive, GPU-bound speech synthesis
//! backend and decides, for every request, whether it runs now, waits, is
//! served from cache, or is turned away with a retry hint.
//!
//! # Lanes
//!
//! Traffic is split into two isolated lanes:
//!
//! - **Priority:** paying plans. More slots, higher rate limit, no watermark.
//! - **Free:** free tier. Fewer slots, lower rate limit, mandatory watermark.
//!
//! Lanes never borrow capacity from each other. The artifact cache is shared
//! for storage but partitioned by a lane tag in every key.
//!
//! # Request path
//!
//! [`gateway::Gateway::synthesize`] runs classification, rate limiting,
//! cache lookup, singleflight de-duplication, admission, the circuit breaker,
//! the backend call and watermark enforcement, in that order.

pub mod admission;
pub mod backend;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod lane;
pub mod logging;
pub mod metrics;
pub mod params;
pub mod rate_limiter;
pub mod timeout;
pub mod usage;
pub mod watermark;

pub use error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewayBuilder};
pub use lane::{Lane, RequestIdentity};
pub use params::SynthesisRequest;
