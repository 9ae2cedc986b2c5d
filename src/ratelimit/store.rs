//! Counter store trait for abstracting in-memory and remote backends.

use async_trait::async_trait;

use super::window::Window;
use crate::error::Result;

/// Trait for counter store implementations.
///
/// A counter store maps `(window, key)` pairs to event counts. The rate
/// limiter only relies on this contract, so a remote or shared backend can
/// be swapped in for the in-memory store without touching the rate math.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the count for `key` within `window` by one.
    ///
    /// Concurrent increments of the same pair must never be lost.
    async fn inc(&self, key: &str, window: Window) -> Result<()>;

    /// Get the counts for `key` in the previous and current windows.
    ///
    /// Missing entries read as zero.
    async fn get(&self, key: &str, previous: Window, current: Window) -> Result<(u64, u64)>;

    /// Get the number of distinct `(window, key)` entries currently retained.
    async fn size(&self) -> Result<usize>;
}
