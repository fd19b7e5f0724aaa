//! Global broker state

use std::sync::Arc;

use tether_core::config::BrokerConfig;

use crate::connection::{ConnectionManager, ConnectionPool};
use crate::directory::Directory;
use crate::ratelimit::RateLimiter;
use crate::trust::TrustStore;
use crate::webhook::WebhookDispatcher;

/// Global state for the broker daemon
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// Machine directory
    pub directory: Arc<Directory>,
    /// Key fingerprint trust
    pub trust: Arc<TrustStore>,
    /// Live tunnels
    pub pool: Arc<ConnectionPool>,
    /// Tunnel lifecycle
    pub manager: Arc<ConnectionManager>,
    /// Warn-only rate limiting
    pub limiter: Arc<RateLimiter>,
    /// Event delivery
    pub webhooks: Arc<WebhookDispatcher>,
}

impl BrokerState {
    /// Build broker state around an existing directory (loaded or in-memory)
    pub fn new(config: BrokerConfig, directory: Directory) -> Self {
        let directory = Arc::new(directory);
        let trust = Arc::new(TrustStore::new(Arc::clone(&directory)));
        let pool = Arc::new(ConnectionPool::new());
        let webhooks = Arc::new(WebhookDispatcher::new(config.webhook.clone()));
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&directory),
            Arc::clone(&trust),
            Arc::clone(&pool),
            Arc::clone(&webhooks),
        ));

        Self {
            config,
            directory,
            trust,
            pool,
            manager,
            limiter: Arc::new(RateLimiter::new()),
            webhooks,
        }
    }

    /// In-memory state with defaults, for tests
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::new(BrokerConfig::default(), Directory::in_memory())
    }
}
