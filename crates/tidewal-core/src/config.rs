//! Journal configuration.

use crate::error::JournalError;

/// Default capacity of each stage queue.
pub const DEFAULT_BUFFER_SIZE: usize = 8;

/// Default number of request slots (maximum concurrent in-flight writes).
pub const DEFAULT_MAX_REQUESTS: usize = 64;

/// Default prefix for stage worker thread names.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "tidewal";

/// Configuration for a [`Journal`](crate::Journal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalConfig {
    /// Capacity of each stage queue. A full queue blocks its producer.
    pub buffer_size: usize,
    /// Number of request slots. Valid write ids are `0..max_requests`.
    pub max_requests: usize,
    /// Prefix for stage worker thread names (`{prefix}-{stage}`).
    pub thread_name_prefix: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_requests: DEFAULT_MAX_REQUESTS,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl JournalConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> JournalConfigBuilder {
        JournalConfigBuilder::default()
    }

    /// Checks that the configuration can build a working pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidConfig`] if a queue or the slot table
    /// would have zero capacity.
    pub fn validate(&self) -> Result<(), JournalError> {
        if self.buffer_size == 0 {
            return Err(JournalError::InvalidConfig(
                "buffer_size must be at least 1".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(JournalError::InvalidConfig(
                "max_requests must be at least 1".to_string(),
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(JournalError::InvalidConfig(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for `JournalConfig`.
#[derive(Debug, Default)]
pub struct JournalConfigBuilder {
    buffer_size: Option<usize>,
    max_requests: Option<usize>,
    thread_name_prefix: Option<String>,
}

impl JournalConfigBuilder {
    /// Sets the stage queue capacity.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Sets the number of request slots.
    #[must_use]
    pub fn max_requests(mut self, count: usize) -> Self {
        self.max_requests = Some(count);
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> JournalConfig {
        JournalConfig {
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            max_requests: self.max_requests.unwrap_or(DEFAULT_MAX_REQUESTS),
            thread_name_prefix: self
                .thread_name_prefix
                .unwrap_or_else(|| DEFAULT_THREAD_NAME_PREFIX.to_string()),
        }
    }
}
