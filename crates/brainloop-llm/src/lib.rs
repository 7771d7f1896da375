//! The generation gateway, its token-bucket rate limiter, and the latency
//! histogram that records every call's round-trip time.

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod error;
pub mod gateway;
pub mod histogram;
pub mod ratelimit;

pub use error::{LlmError, LlmResult};
pub use gateway::{GenerationGateway, GenerationRequest, GenerationResponse, PromptKind};
pub use histogram::{BUCKET_BOUNDS_MS, LatencyHistogram};
pub use ratelimit::{RateLimiter, retry_with_backoff};
