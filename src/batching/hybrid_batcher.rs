// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Count/time batching for one write lane.
//!
//! The [`HybridBatcher`] collects items and hands them out as a batch when
//! either the item count reaches `flush_count` or the oldest pending item has
//! waited `flush_ms`. The wave clock starts when an item lands in an empty
//! buffer and stops when the buffer is taken.
//!
//! # Example
//!
//! ```
//! use consistency_oracle::{HybridBatcher, BatchConfig, FlushReason};
//!
//! let config = BatchConfig { flush_ms: 5_000, flush_count: 2 };
//! let mut batcher: HybridBatcher<&str> = HybridBatcher::new(config);
//!
//! assert!(batcher.push("a").is_none());
//! assert_eq!(batcher.push("b"), Some(FlushReason::Count));
//!
//! let batch = batcher.take_if_ready().unwrap();
//! assert_eq!(batch.items, vec!["a", "b"]);
//! assert!(batcher.is_empty());
//! ```

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Oldest item waited the full flush timeout
    Time,
    /// Item count threshold reached
    Count,
    /// Manual flush requested
    Manual,
    /// Shutdown flush
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for hybrid batching
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush once the oldest item is this old (even if batch is small)
    pub flush_ms: u64,
    /// Flush after this many items
    pub flush_count: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_ms: 5_000,
            flush_count: 100,
        }
    }
}

/// A batch of items ready for flush
#[derive(Debug)]
pub struct FlushBatch<T> {
    pub items: Vec<T>,
    pub reason: FlushReason,
    /// How long the first item waited
    pub age: Duration,
}

/// A batch of items pending flush
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    /// Set when the first item enters an empty batch
    pub started_at: Option<Instant>,
}

impl<T> Batch<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            started_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn age(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn push(&mut self, item: T) {
        if self.items.is_empty() {
            self.started_at = Some(Instant::now());
        }
        self.items.push(item);
    }

    pub fn take(&mut self) -> Vec<T> {
        self.started_at = None;
        std::mem::take(&mut self.items)
    }
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Batcher that flushes on count or age, whichever comes first.
pub struct HybridBatcher<T> {
    config: BatchConfig,
    batch: Batch<T>,
}

impl<T> HybridBatcher<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            batch: Batch::new(),
        }
    }

    /// Add an item to the batch, returns flush reason if the count threshold is hit
    pub fn push(&mut self, item: T) -> Option<FlushReason> {
        self.batch.push(item);

        if self.batch.len() >= self.config.flush_count {
            Some(FlushReason::Count)
        } else {
            None
        }
    }

    /// Check if time threshold exceeded
    #[must_use]
    pub fn should_flush_time(&self) -> bool {
        !self.batch.is_empty()
            && self.batch.age() >= Duration::from_millis(self.config.flush_ms)
    }

    /// Take the batch if any threshold is ready
    pub fn take_if_ready(&mut self) -> Option<FlushBatch<T>> {
        let reason = if self.batch.len() >= self.config.flush_count {
            Some(FlushReason::Count)
        } else if self.should_flush_time() {
            Some(FlushReason::Time)
        } else {
            None
        };

        reason.map(|r| self.take_with_reason(r))
    }

    /// Force flush regardless of thresholds (for manual flush or shutdown)
    pub fn force_flush_with_reason(&mut self, reason: FlushReason) -> Option<FlushBatch<T>> {
        if self.batch.is_empty() {
            return None;
        }
        Some(self.take_with_reason(reason))
    }

    fn take_with_reason(&mut self, reason: FlushReason) -> FlushBatch<T> {
        // Capture age BEFORE take() resets it
        let age = self.batch.age();
        let items = self.batch.take();
        debug!(count = items.len(), reason = %reason, "Batch taken for flush");
        FlushBatch { items, reason, age }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// Get current batch stats: (pending items, age of oldest)
    #[must_use]
    pub fn stats(&self) -> (usize, Duration) {
        (self.batch.len(), self.batch.age())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(flush_count: usize, flush_ms: u64) -> BatchConfig {
        BatchConfig { flush_ms, flush_count }
    }

    #[test]
    fn test_batch_empty_initially() {
        let batcher: HybridBatcher<u32> = HybridBatcher::new(BatchConfig::default());
        assert!(batcher.is_empty());
        let (count, age) = batcher.stats();
        assert_eq!(count, 0);
        assert_eq!(age, Duration::ZERO);
    }

    #[test]
    fn test_flush_on_count_threshold() {
        let mut batcher = HybridBatcher::new(config(3, 10_000));

        assert!(batcher.push(1).is_none());
        assert!(batcher.push(2).is_none());
        assert_eq!(batcher.push(3), Some(FlushReason::Count));
    }

    #[test]
    fn test_default_matches_flush_controller_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.flush_count, 100);
        assert_eq!(config.flush_ms, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_time_threshold() {
        let mut batcher = HybridBatcher::new(config(1000, 10));
        batcher.push(1);

        assert!(!batcher.should_flush_time());
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(batcher.should_flush_time());

        let batch = batcher.take_if_ready().unwrap();
        assert_eq!(batch.reason, FlushReason::Time);
        assert_eq!(batch.age, Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wave_clock_starts_on_first_item() {
        let mut batcher = HybridBatcher::new(config(1000, 100));

        // Idle time before the first item does not count
        tokio::time::advance(Duration::from_millis(500)).await;
        batcher.push(1);
        assert!(!batcher.should_flush_time());

        tokio::time::advance(Duration::from_millis(60)).await;
        batcher.push(2);
        let (_, age) = batcher.stats();
        assert_eq!(age, Duration::from_millis(60));
    }

    #[test]
    fn test_take_if_ready_returns_batch() {
        let mut batcher = HybridBatcher::new(config(2, 10_000));

        batcher.push("a");
        assert!(batcher.take_if_ready().is_none());

        batcher.push("b");
        let batch = batcher.take_if_ready().unwrap();
        assert_eq!(batch.items, vec!["a", "b"]);
        assert_eq!(batch.reason, FlushReason::Count);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_force_flush() {
        let mut batcher = HybridBatcher::new(BatchConfig::default());
        assert!(batcher.force_flush_with_reason(FlushReason::Manual).is_none());

        batcher.push(1);
        batcher.push(2);
        let batch = batcher.force_flush_with_reason(FlushReason::Shutdown).unwrap();
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.reason, FlushReason::Shutdown);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_take_resets_batch() {
        let mut batcher = HybridBatcher::new(BatchConfig::default());
        batcher.push(1);
        batcher.push(2);

        let batch = batcher.force_flush_with_reason(FlushReason::Manual).unwrap();
        assert_eq!(batch.items.len(), 2);

        let (count, age) = batcher.stats();
        assert_eq!(count, 0);
        assert_eq!(age, Duration::ZERO);
    }
}
