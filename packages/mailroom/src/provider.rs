//! Store providers: who owns the set of active stores.
//!
//! A provider hands out [`StoreHandle`]s — a store plus the stable
//! identifier that every multi-store log line and metric carries. Three
//! variants:
//!
//! - [`ConfiguredProvider`] — built once from a static list; every call
//!   returns the same snapshot.
//! - [`DynamicProvider`] — wraps a [`Discovery`] collaborator and refreshes
//!   the set at a cadence, diffing by identifier: new entries are built via
//!   the [`StoreFactory`], missing entries are dropped, and an entry whose
//!   connection, schema, or table changed is rebuilt.
//! - [`PlatformProvider`] — dynamic semantics, sourcing from a platform-wide
//!   discovery service and excluding the control-plane database from
//!   work-item participation.
//!
//! The provider owns the store instances it creates; callers hold borrowed
//! `Arc`s and never dispose them. Removal drops the provider's `Arc`, and
//! the store's own drop tears down its pool once the last borrow is gone.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{MailroomError, Result};
use crate::store::WorkItemStore;

// ============================================================================
// Handles and configs
// ============================================================================

/// One active store plus its stable human-readable identifier.
#[derive(Clone)]
pub struct StoreHandle {
    identifier: String,
    store: Arc<dyn WorkItemStore>,
}

impl StoreHandle {
    pub fn new(identifier: impl Into<String>, store: Arc<dyn WorkItemStore>) -> Self {
        Self {
            identifier: identifier.into(),
            store,
        }
    }

    /// Stable name used in logs and metrics.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn store(&self) -> &Arc<dyn WorkItemStore> {
        &self.store
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// The logical description of one store, as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Stable identifier (tenant name, database label).
    pub identifier: String,
    /// Backend-specific connection spec.
    pub connection: String,
    /// Schema qualifying the table and derived names.
    pub schema: String,
    /// Base table name.
    pub table: String,
}

impl StoreConfig {
    /// True when the physical target changed and the store must be rebuilt.
    fn needs_rebuild(&self, other: &StoreConfig) -> bool {
        self.connection != other.connection
            || self.schema != other.schema
            || self.table != other.table
    }
}

/// Normalized connection identity used for control-plane comparison.
///
/// Two connection specs are the same database when host and database name
/// match case-insensitively, regardless of parameter order, credentials, or
/// other noise in the raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    host: String,
    database: String,
}

impl ConnectionIdentity {
    /// Parse a URL-style connection spec (`postgres://user@host:5432/name`).
    pub fn parse(connection: &str) -> Result<Self> {
        let after_scheme = connection
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(connection);
        let after_auth = after_scheme
            .rsplit_once('@')
            .map(|(_, rest)| rest)
            .unwrap_or(after_scheme);
        let (authority, path) = after_auth.split_once('/').unwrap_or((after_auth, ""));
        let host = authority.split(':').next().unwrap_or("").to_ascii_lowercase();
        let database = path
            .split(['?', '#'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        if host.is_empty() {
            return Err(MailroomError::Configuration(format!(
                "connection spec has no host: {connection}"
            )));
        }
        Ok(Self { host, database })
    }
}

// ============================================================================
// Provider contract
// ============================================================================

/// Source of the current set of active stores.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// The active stores, refreshed if the provider's cadence says so.
    async fn stores(&self) -> Result<Vec<StoreHandle>>;
}

/// External collaborator that reports the current logical store set.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<StoreConfig>>;
}

/// Builds a live store from its logical description.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn build(&self, config: &StoreConfig) -> Result<Arc<dyn WorkItemStore>>;
}

// ============================================================================
// Configured
// ============================================================================

/// A fixed store set, built once.
pub struct ConfiguredProvider {
    handles: Vec<StoreHandle>,
}

impl ConfiguredProvider {
    pub fn new(handles: Vec<StoreHandle>) -> Self {
        Self { handles }
    }

    /// Convenience for the single-store deployment.
    pub fn single(identifier: impl Into<String>, store: Arc<dyn WorkItemStore>) -> Self {
        Self::new(vec![StoreHandle::new(identifier, store)])
    }
}

#[async_trait]
impl StoreProvider for ConfiguredProvider {
    async fn stores(&self) -> Result<Vec<StoreHandle>> {
        Ok(self.handles.clone())
    }
}

// ============================================================================
// Dynamic discovery
// ============================================================================

struct CacheEntry {
    config: StoreConfig,
    handle: StoreHandle,
}

struct ProviderCache {
    entries: Vec<CacheEntry>,
    refreshed_at: Option<Instant>,
}

impl ProviderCache {
    fn snapshot(&self) -> Vec<StoreHandle> {
        self.entries.iter().map(|e| e.handle.clone()).collect()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        matches!(self.refreshed_at, Some(at) if at.elapsed() < ttl)
    }
}

/// Discovery-backed provider that refreshes its store set at a cadence.
///
/// Refresh is single-flight: the cache mutex is never held across I/O, and
/// concurrent callers that find the cache stale queue on the refresh gate;
/// whoever enters second finds the cache fresh again and returns the
/// in-flight result instead of refreshing twice.
pub struct DynamicProvider {
    discovery: Arc<dyn Discovery>,
    factory: Arc<dyn StoreFactory>,
    refresh_interval: Duration,
    cache: Mutex<ProviderCache>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl DynamicProvider {
    /// Default refresh cadence: 5 minutes.
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

    pub fn new(discovery: Arc<dyn Discovery>, factory: Arc<dyn StoreFactory>) -> Self {
        Self::with_refresh_interval(discovery, factory, Self::DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_refresh_interval(
        discovery: Arc<dyn Discovery>,
        factory: Arc<dyn StoreFactory>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            discovery,
            factory,
            refresh_interval,
            cache: Mutex::new(ProviderCache {
                entries: Vec::new(),
                refreshed_at: None,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    async fn refresh(&self) -> Result<Vec<StoreHandle>> {
        let _flight = self.refresh_gate.lock().await;

        // Another caller may have refreshed while we queued on the gate.
        {
            let cache = self.cache.lock().unwrap();
            if cache.is_fresh(self.refresh_interval) {
                return Ok(cache.snapshot());
            }
        }

        let discovered = self.discovery.discover().await?;

        // Snapshot the live entries so the cache lock is never held across
        // the factory's I/O.
        let current: Vec<(StoreConfig, StoreHandle)> = {
            let cache = self.cache.lock().unwrap();
            cache
                .entries
                .iter()
                .map(|e| (e.config.clone(), e.handle.clone()))
                .collect()
        };

        let mut next: Vec<CacheEntry> = Vec::with_capacity(discovered.len());
        for config in discovered {
            let existing = current.iter().find(|(c, _)| c.identifier == config.identifier);
            match existing {
                Some((known, handle)) if !known.needs_rebuild(&config) => {
                    next.push(CacheEntry {
                        config,
                        handle: handle.clone(),
                    });
                }
                Some(_) => {
                    info!(store = %config.identifier, "store configuration changed, rebuilding");
                    let store = self.factory.build(&config).await?;
                    next.push(CacheEntry {
                        handle: StoreHandle::new(config.identifier.clone(), store),
                        config,
                    });
                }
                None => {
                    info!(store = %config.identifier, "discovered new store");
                    let store = self.factory.build(&config).await?;
                    next.push(CacheEntry {
                        handle: StoreHandle::new(config.identifier.clone(), store),
                        config,
                    });
                }
            }
        }

        for (known, _) in &current {
            if !next.iter().any(|e| e.config.identifier == known.identifier) {
                info!(store = %known.identifier, "store no longer discovered, removing");
            }
        }

        let mut cache = self.cache.lock().unwrap();
        cache.entries = next;
        cache.refreshed_at = Some(Instant::now());
        debug!(count = cache.entries.len(), "store set refreshed");
        Ok(cache.snapshot())
    }
}

#[async_trait]
impl StoreProvider for DynamicProvider {
    async fn stores(&self) -> Result<Vec<StoreHandle>> {
        {
            let cache = self.cache.lock().unwrap();
            if cache.is_fresh(self.refresh_interval) {
                return Ok(cache.snapshot());
            }
        }
        self.refresh().await
    }
}

// ============================================================================
// Platform discovery
// ============================================================================

/// Filters a platform-wide discovery feed down to work-item participants.
///
/// The control-plane database is excluded by normalized connection identity
/// (host + database), not raw string equality, so credential or parameter
/// differences in the spec never sneak it back in.
pub struct ControlPlaneFilter {
    inner: Arc<dyn Discovery>,
    control_plane: ConnectionIdentity,
}

impl ControlPlaneFilter {
    pub fn new(inner: Arc<dyn Discovery>, control_plane_connection: &str) -> Result<Self> {
        Ok(Self {
            inner,
            control_plane: ConnectionIdentity::parse(control_plane_connection)?,
        })
    }
}

#[async_trait]
impl Discovery for ControlPlaneFilter {
    async fn discover(&self) -> Result<Vec<StoreConfig>> {
        let configs = self.inner.discover().await?;
        Ok(configs
            .into_iter()
            .filter(|config| match ConnectionIdentity::parse(&config.connection) {
                Ok(identity) => {
                    if identity == self.control_plane {
                        debug!(store = %config.identifier, "excluding control-plane database");
                        false
                    } else {
                        true
                    }
                }
                Err(e) => {
                    warn!(store = %config.identifier, error = %e, "unparseable connection spec, excluding");
                    false
                }
            })
            .collect())
    }
}

/// Platform variant: dynamic discovery sourced from the platform service,
/// minus the control plane.
pub struct PlatformProvider {
    inner: DynamicProvider,
}

impl PlatformProvider {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        factory: Arc<dyn StoreFactory>,
        control_plane_connection: &str,
        refresh_interval: Duration,
    ) -> Result<Self> {
        let filter = Arc::new(ControlPlaneFilter::new(discovery, control_plane_connection)?);
        Ok(Self {
            inner: DynamicProvider::with_refresh_interval(filter, factory, refresh_interval),
        })
    }
}

#[async_trait]
impl StoreProvider for PlatformProvider {
    async fn stores(&self) -> Result<Vec<StoreHandle>> {
        self.inner.stores().await
    }
}
