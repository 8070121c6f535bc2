//! Token-bucket admission control, one bucket per client, tenant and
//! operation.

mod bucket;
mod limiter;
mod policy;

pub use bucket::{RateLimitDecision, TokenBucket};
pub use limiter::{RateLimiter, DEFAULT_IDLE_EVICTION};
pub use policy::{BucketKey, PolicyError, ProcedureKind, RateLimit, RateLimitPolicy};
