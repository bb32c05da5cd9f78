//! Changelog configuration.

use std::time::Duration;

/// When the active segment is fsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// After every appended record.
    EveryRecord,
    /// After every `n` appended records.
    EveryRecords(usize),
    /// Only when [`super::Log::sync`] is called, e.g. by a periodic task.
    Manual,
}

/// Configuration of a changelog log.
///
/// # Example
///
/// ```rust
/// use dsrepl_core::{LogConfig, SyncPolicy};
/// use std::time::Duration;
///
/// let config = LogConfig::default()
///     .with_max_segment_size(1024 * 1024)
///     .with_rotation_interval(Duration::from_secs(3600))
///     .with_sync_policy(SyncPolicy::Manual);
/// assert_eq!(config.max_segment_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// The head segment is sealed once it reaches this many bytes.
    pub max_segment_size: u64,
    /// The head segment is sealed once it is this old, if set.
    pub rotation_interval: Option<Duration>,
    /// When appends are made durable.
    pub sync_policy: SyncPolicy,
    /// Idle readers kept open per segment.
    pub max_idle_readers: usize,
    /// Idle readers kept open across all segments of a log.
    pub max_idle_total: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 10 * 1024 * 1024,
            rotation_interval: None,
            sync_policy: SyncPolicy::EveryRecord,
            max_idle_readers: 4,
            max_idle_total: 64,
        }
    }
}

impl LogConfig {
    /// Sets the size limit of a segment.
    #[must_use]
    pub fn with_max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    /// Seals the head segment after `interval`.
    #[must_use]
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = Some(interval);
        self
    }

    /// Sets the sync policy.
    #[must_use]
    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Sets how many idle readers are pooled per segment.
    #[must_use]
    pub fn with_max_idle_readers(mut self, count: usize) -> Self {
        self.max_idle_readers = count;
        self
    }

    /// Sets how many idle readers are pooled across all segments.
    #[must_use]
    pub fn with_max_idle_total(mut self, count: usize) -> Self {
        self.max_idle_total = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LogConfig::default();
        assert_eq!(config.max_segment_size, 10 * 1024 * 1024);
        assert_eq!(config.rotation_interval, None);
        assert_eq!(config.sync_policy, SyncPolicy::EveryRecord);
        assert_eq!(config.max_idle_total, 64);
    }

    #[test]
    fn builder_chain() {
        let config = LogConfig::default()
            .with_sync_policy(SyncPolicy::EveryRecords(16))
            .with_max_idle_readers(1);
        assert_eq!(config.sync_policy, SyncPolicy::EveryRecords(16));
        assert_eq!(config.max_idle_readers, 1);
    }
}
