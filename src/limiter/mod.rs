mod bucket;

pub use bucket::{BucketConfig, LimitError, RateLimiter};
