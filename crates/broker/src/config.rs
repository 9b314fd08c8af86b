/// Configuration for the [`MemoryBroker`](crate::MemoryBroker).
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Deliveries after which a requeued message is dead-lettered instead.
    pub max_deliveries: u32,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self { max_deliveries: 5 }
    }
}

impl MemoryBrokerConfig {
    #[must_use]
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        assert_eq!(MemoryBrokerConfig::default().max_deliveries, 5);
        assert_eq!(
            MemoryBrokerConfig::default()
                .with_max_deliveries(0)
                .max_deliveries,
            1
        );
    }
}
