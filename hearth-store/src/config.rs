use std::sync::Arc;

use serde::Deserialize;

use crate::{backends::MemoryMessageStore, r#trait::MessageStore};

/// Configuration for the built-in store backends
///
/// Production deployments inject their own [`MessageStore`]; this enum only
/// selects between the backends shipped with this crate.
///
/// # Examples
///
/// Unlimited memory store in RON config:
/// ```ron
/// Hearth (
///     store: Memory(),
/// )
/// ```
///
/// Memory store with a capacity limit:
/// ```ron
/// Hearth (
///     store: Memory(
///         capacity: 1000,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    /// Memory-based store (development/testing)
    Memory {
        /// Maximum number of delivered messages to keep (omit for unlimited)
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory { capacity: None }
    }
}

impl StoreConfig {
    /// Build the configured backend
    #[must_use]
    pub fn into_store(self) -> Arc<dyn MessageStore> {
        match self {
            Self::Memory {
                capacity: Some(capacity),
            } => Arc::new(MemoryMessageStore::with_capacity(capacity)),
            Self::Memory { capacity: None } => Arc::new(MemoryMessageStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_config_parses() {
        let config: StoreConfig = ron::from_str("Memory(capacity: 10)").expect("valid config");
        let StoreConfig::Memory { capacity } = config;
        assert_eq!(capacity, Some(10));

        let config: StoreConfig = ron::from_str("Memory()").expect("valid config");
        let StoreConfig::Memory { capacity } = config;
        assert_eq!(capacity, None);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let result: Result<StoreConfig, _> = ron::from_str("Postgres(url: \"x\")");
        assert!(result.is_err());
    }
}
