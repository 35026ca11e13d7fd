//! Application state shared across all handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::KeyManager;
use crate::db;
use crate::middleware::RateLimiter;
use crate::models::{AccountStore, ClientRegistry};
use crate::services::federation::ProviderRegistry;
use crate::services::{AuthCodeStore, OAuthStateStore, RefreshTokenStore};
use crate::storage::{PostgresGateway, SharedGateway};

/// How often the background sweeper runs.
const SWEEP_INTERVAL_SECS: u64 = 300;

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    gateway: SharedGateway,

    /// Process-global signing keys; re-initialized at startup.
    keys: Arc<KeyManager>,

    clients: ClientRegistry,
    accounts: AccountStore,
    codes: AuthCodeStore,
    refresh_tokens: RefreshTokenStore,
    oauth_state: OAuthStateStore,

    rate_limiter: Arc<RateLimiter>,
    providers: Arc<ProviderRegistry>,
}

impl AppState {
    /// Connect to PostgreSQL, run migrations, and build the state.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = db::create_pool(config)
            .await
            .context("failed to create database pool")?;
        db::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
        let gateway: SharedGateway = Arc::new(PostgresGateway::new(pool));
        Self::with_gateway(config.clone(), gateway)
    }

    /// Build state over an existing gateway (tests use the in-memory
    /// implementation here).
    pub fn with_gateway(config: Config, gateway: SharedGateway) -> Result<Self> {
        let keys = Arc::new(KeyManager::new());
        let initial = keys
            .initialize()
            .context("failed to initialize signing keys")?;
        info!(kid = %initial.pair.kid, "signing key ready");

        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::clone(&gateway),
            config.rate_limit_window_ms,
            config.rate_limit_max_requests,
        ));
        let providers = Arc::new(ProviderRegistry::from_config(&config));

        Ok(Self {
            inner: Arc::new(AppStateInner {
                clients: ClientRegistry::new(Arc::clone(&gateway)),
                accounts: AccountStore::new(Arc::clone(&gateway)),
                codes: AuthCodeStore::new(Arc::clone(&gateway)),
                refresh_tokens: RefreshTokenStore::new(Arc::clone(&gateway)),
                oauth_state: OAuthStateStore::new(Arc::clone(&gateway)),
                config,
                gateway,
                keys,
                rate_limiter,
                providers,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn gateway(&self) -> &SharedGateway {
        &self.inner.gateway
    }

    pub fn keys(&self) -> &KeyManager {
        &self.inner.keys
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.inner.clients
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.inner.accounts
    }

    pub fn codes(&self) -> &AuthCodeStore {
        &self.inner.codes
    }

    pub fn refresh_tokens(&self) -> &RefreshTokenStore {
        &self.inner.refresh_tokens
    }

    pub fn oauth_state(&self) -> &OAuthStateStore {
        &self.inner.oauth_state
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.rate_limiter
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    /// Start the periodic sweeper: expired TTL rows, expired keys, and
    /// stale rate-limit fallback counters.
    pub fn spawn_sweeper(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                match state.gateway().sweep_expired().await {
                    Ok(removed) if removed > 0 => {
                        debug!(rows = removed, "swept expired storage rows");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "storage sweep failed"),
                }
                let purged = state.keys().purge_expired();
                if purged > 0 {
                    info!(keys = purged, "purged expired signing keys");
                }
                state.rate_limiter().sweep_fallback();
            }
        });
    }
}
