//! Distributor configuration

/// Default number of concurrent per-sink deliveries
pub const DEFAULT_WORKERS: usize = 10;

/// Fan-out pipeline options
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Maximum sink writes in flight at once
    pub workers: usize,

    /// Label used in log lines
    pub label: String,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            label: "distributor".to_string(),
        }
    }
}

impl DistributorConfig {
    /// Set the worker count; zero is raised to one
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}
