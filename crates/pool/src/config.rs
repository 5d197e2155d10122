//! Worker pool configuration.

/// Number of requests the remote service lets one user run at a time.
pub const REMOTE_CONCURRENCY_CAP: usize = 3;

/// Configuration for a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub max_workers: usize,
    /// Prefix for worker thread names
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            thread_name: "datafetch-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// Set the number of worker threads.
    pub fn with_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the worker thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Advisory findings about this configuration. None of them are enforced.
    pub fn validate(&self) -> Vec<PoolWarning> {
        let mut warnings = Vec::new();
        if self.max_workers > REMOTE_CONCURRENCY_CAP {
            warnings.push(PoolWarning::ConcurrencyCap {
                requested: self.max_workers,
                cap: REMOTE_CONCURRENCY_CAP,
            });
        }
        warnings
    }
}

/// Advisory warning produced while building a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolWarning {
    /// More workers than the remote service will run concurrently
    ConcurrencyCap {
        /// Configured worker count
        requested: usize,
        /// Remote per-user limit
        cap: usize,
    },
}

impl std::fmt::Display for PoolWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolWarning::ConcurrencyCap { requested, cap } => write!(
                f,
                "{} workers requested, but no more than {} (20) requests per user can be active (queued) at a time",
                requested, cap
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_no_warnings() {
        assert!(PoolConfig::default().validate().is_empty());
        assert!(PoolConfig::default().with_workers(3).validate().is_empty());
    }

    #[test]
    fn test_more_than_cap_warns() {
        let warnings = PoolConfig::default().with_workers(4).validate();
        assert_eq!(
            warnings,
            vec![PoolWarning::ConcurrencyCap { requested: 4, cap: 3 }]
        );
        assert!(warnings[0].to_string().contains("4 workers"));
    }
}
