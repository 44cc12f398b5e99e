//! Shared test utilities
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: Deterministic stream and group names (always available)
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let names = TestDataBuilder::from_test_name("my_redis_test");
//!     let dlq = names.stream("orders", "dlq");
//!
//!     assert_eq!(redis.stream_len(&dlq).await, 0);
//! }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test names with a deterministic seed
///
/// Tests sharing one Redis container stay apart by deriving their stream
/// names from the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (seed is the hash of the name)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_republish");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Unique name, e.g. `test-orders-12345-main`
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Unique stream name, e.g. `test.orders.12345.dlq`
    pub fn stream(&self, prefix: &str, suffix: &str) -> String {
        format!("test.{}.{}.{}", prefix, self.seed, suffix)
    }
}
