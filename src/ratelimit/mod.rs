//! Sliding-window rate limiting and per-key state management.

mod descriptor;
mod limiter;
mod rules;
mod state;

pub use descriptor::{LimitKey, RuleType, GLOBAL_KEY};
pub use limiter::{RateLimitOutcome, RateLimitVerdict, SlidingWindowLimiter};
pub use rules::{LimitsConfig, RateLimitRule, RuleSet};
pub use state::{RateLimitState, WindowOutcome};
