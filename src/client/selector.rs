//! Shard selection functions.
//!
//! A selector maps `(shard_count, key)` to a shard index in `[0, shard_count)`.
//! Selectors must be pure: the same inputs always yield the same index.
//!
//! The default [`byte_sum`] selector adds up the key's bytes and takes the
//! remainder by the shard count. It distributes related keys poorly
//! (`"ab"` and `"ba"` always collide) and nearly every key moves when the
//! shard count changes. Deployments that rely on it must keep the shard
//! count stable or accept remapping.

use std::fmt;
use std::sync::Arc;

use crate::ShardIndex;

/// Signature of a selector function.
pub type SelectorFn = dyn Fn(usize, &str) -> ShardIndex + Send + Sync;

/// A named, shareable selector function.
#[derive(Clone)]
pub struct Selector {
    name: &'static str,
    func: Arc<SelectorFn>,
}

impl Selector {
    /// Wrap a custom selector function.
    pub fn new<F>(name: &'static str, func: F) -> Self
    where
        F: Fn(usize, &str) -> ShardIndex + Send + Sync + 'static,
    {
        Self {
            name,
            func: Arc::new(func),
        }
    }

    /// The default byte-sum-modulo selector.
    pub fn byte_sum() -> Self {
        Self::new("byte-sum", byte_sum)
    }

    /// Selector name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Select a shard for `key` among `shard_count` shards.
    ///
    /// Callers must not pass a zero shard count.
    pub fn select(&self, shard_count: usize, key: &str) -> ShardIndex {
        (self.func)(shard_count, key)
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::byte_sum()
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector").field("name", &self.name).finish()
    }
}

/// Sum of the key's bytes modulo `shard_count`.
///
/// Returns 0 when `shard_count` is 0.
///
/// # Examples
///
/// ```
/// use shard_keeper::client::selector::byte_sum;
///
/// // 'a' + 'b' + 'c' = 97 + 98 + 99 = 294
/// assert_eq!(byte_sum(2, "abc"), 0);
/// assert_eq!(byte_sum(5, "abc"), 4);
/// ```
pub fn byte_sum(shard_count: usize, key: &str) -> ShardIndex {
    if shard_count == 0 {
        return 0;
    }
    let sum: u64 = key.bytes().map(u64::from).sum();
    // Remainder is below shard_count, which is far below u32::MAX in practice.
    (sum % shard_count as u64) as ShardIndex
}
