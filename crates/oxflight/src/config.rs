//! Configuration for coalescer instances.

/// Default name attached to tracing events of a coalescer.
pub const DEFAULT_NAME: &str = "oxflight";

/// Configuration for a [`Coalescer`](crate::Coalescer) or
/// [`AsyncCoalescer`](crate::AsyncCoalescer).
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Name reported in tracing events, to tell instances apart in logs.
    pub name: String,
    /// Number of registry shards. Rounded up to a power of two, minimum 2.
    ///
    /// `None` lets the registry pick based on the available parallelism.
    pub shard_amount: Option<usize>,
    /// Registry capacity reserved up front.
    pub initial_capacity: usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            shard_amount: None,
            initial_capacity: 0,
        }
    }
}

impl CoalescerConfig {
    /// Set the instance name used in tracing events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of registry shards.
    #[must_use]
    pub fn with_shard_amount(mut self, shards: usize) -> Self {
        self.shard_amount = Some(shards);
        self
    }

    /// Reserve registry capacity for this many concurrent keys.
    #[must_use]
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Shard count actually handed to the registry, if one was requested.
    pub(crate) fn effective_shard_amount(&self) -> Option<usize> {
        self.shard_amount.map(|n| n.max(2).next_power_of_two())
    }

    pub(crate) fn build_registry<K, T>(&self) -> dashmap::DashMap<K, T>
    where
        K: std::hash::Hash + Eq,
    {
        match self.effective_shard_amount() {
            Some(shards) => {
                dashmap::DashMap::with_capacity_and_shard_amount(self.initial_capacity, shards)
            }
            None => dashmap::DashMap::with_capacity(self.initial_capacity),
        }
    }
}
