//! Cache key and restore-key resolution.

use crate::keys::resolve_key;
use crate::store::CacheStore;
use gantry_core::definition::{CacheKeySpec, RestorePolicy};
use gantry_core::interpolation::InterpolationContext;
use std::path::Path;
use tracing::{debug, warn};

/// A cache spec with all placeholders substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCacheKey {
    pub primary: String,
    pub restore_prefixes: Vec<String>,
}

/// Result of a restore attempt. A miss is not an error and a backend failure
/// degrades to a cold run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Exact match on the primary key.
    Exact(String),
    /// Prefix match on a restore key.
    Partial(String),
    Miss,
    /// The backend could not be reached; the job proceeds cold.
    Degraded,
}

impl RestoreOutcome {
    pub fn matched_key(&self) -> Option<&str> {
        match self {
            RestoreOutcome::Exact(key) | RestoreOutcome::Partial(key) => Some(key),
            _ => None,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, RestoreOutcome::Exact(_))
    }
}

/// Resolves cache specs and drives restore-key fallback against a store.
pub struct KeyResolver;

impl KeyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Substitute interpolation variables and content-hash placeholders in
    /// the primary key and every restore prefix.
    pub fn resolve(
        &self,
        spec: &CacheKeySpec,
        workspace: &Path,
        ctx: &InterpolationContext,
    ) -> ResolvedCacheKey {
        let primary = resolve_key(&ctx.interpolate(&spec.key), workspace);
        let restore_prefixes = spec
            .restore_keys
            .iter()
            .map(|k| resolve_key(&ctx.interpolate(k), workspace))
            .collect();
        ResolvedCacheKey {
            primary,
            restore_prefixes,
        }
    }

    /// Try the primary key exactly, then fall back per the restore policy.
    ///
    /// `prefix_order` tries each prefix in declared order and the first
    /// prefix with any match wins; recency only breaks ties within one
    /// prefix. `most_recent` takes the newest entry across all prefixes.
    pub async fn restore(
        &self,
        store: &dyn CacheStore,
        resolved: &ResolvedCacheKey,
        policy: RestorePolicy,
    ) -> RestoreOutcome {
        match store.lookup(&resolved.primary).await {
            Ok(Some(entry)) => {
                debug!(key = %entry.key, "cache hit");
                return RestoreOutcome::Exact(entry.key);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, key = %resolved.primary, "cache backend unreachable, running cold");
                return RestoreOutcome::Degraded;
            }
        }

        match policy {
            RestorePolicy::PrefixOrder => {
                for prefix in &resolved.restore_prefixes {
                    match store.lookup_by_prefix(prefix).await {
                        Ok(Some(entry)) => {
                            debug!(key = %entry.key, prefix = %prefix, "cache restore-key hit");
                            return RestoreOutcome::Partial(entry.key);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, prefix = %prefix, "cache backend unreachable, running cold");
                            return RestoreOutcome::Degraded;
                        }
                    }
                }
                RestoreOutcome::Miss
            }
            RestorePolicy::MostRecent => {
                let mut best = None;
                for prefix in &resolved.restore_prefixes {
                    match store.lookup_by_prefix(prefix).await {
                        Ok(Some(entry)) => {
                            let newer = best
                                .as_ref()
                                .is_none_or(|b: &crate::store::CacheEntry| {
                                    entry.created_at > b.created_at
                                });
                            if newer {
                                best = Some(entry);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, prefix = %prefix, "cache backend unreachable, running cold");
                            return RestoreOutcome::Degraded;
                        }
                    }
                }
                match best {
                    Some(entry) => RestoreOutcome::Partial(entry.key),
                    None => RestoreOutcome::Miss,
                }
            }
        }
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CacheEntry, MemoryStore};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use gantry_core::{Error, Result};

    fn resolved(primary: &str, prefixes: &[&str]) -> ResolvedCacheKey {
        ResolvedCacheKey {
            primary: primary.to_string(),
            restore_prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_exact_match_wins() {
        let store = MemoryStore::new();
        store.insert_at("cargo-abc", Utc::now());
        store.insert_at("cargo-zzz", Utc::now());

        let outcome = KeyResolver::new()
            .restore(&store, &resolved("cargo-abc", &["cargo-"]), RestorePolicy::PrefixOrder)
            .await;
        assert_eq!(outcome, RestoreOutcome::Exact("cargo-abc".to_string()));
    }

    #[tokio::test]
    async fn test_prefix_order_beats_recency_across_prefixes() {
        let store = MemoryStore::new();
        let base = Utc::now();
        // Prefix 2 has a more recent match, but prefix 1 has a match at all.
        store.insert_at("deps-v1-old", base - Duration::hours(10));
        store.insert_at("deps-fallback-new", base);

        let outcome = KeyResolver::new()
            .restore(
                &store,
                &resolved("deps-v1-exact", &["deps-v1-", "deps-fallback-"]),
                RestorePolicy::PrefixOrder,
            )
            .await;
        assert_eq!(outcome, RestoreOutcome::Partial("deps-v1-old".to_string()));
    }

    #[tokio::test]
    async fn test_recency_breaks_ties_within_one_prefix() {
        let store = MemoryStore::new();
        let base = Utc::now();
        store.insert_at("deps-v1-a", base - Duration::hours(5));
        store.insert_at("deps-v1-b", base - Duration::hours(1));

        let outcome = KeyResolver::new()
            .restore(&store, &resolved("deps-v1-exact", &["deps-v1-"]), RestorePolicy::PrefixOrder)
            .await;
        assert_eq!(outcome, RestoreOutcome::Partial("deps-v1-b".to_string()));
    }

    #[tokio::test]
    async fn test_most_recent_policy_spans_prefixes() {
        let store = MemoryStore::new();
        let base = Utc::now();
        store.insert_at("deps-v1-old", base - Duration::hours(10));
        store.insert_at("deps-fallback-new", base);

        let outcome = KeyResolver::new()
            .restore(
                &store,
                &resolved("deps-v1-exact", &["deps-v1-", "deps-fallback-"]),
                RestorePolicy::MostRecent,
            )
            .await;
        assert_eq!(
            outcome,
            RestoreOutcome::Partial("deps-fallback-new".to_string())
        );
    }

    #[tokio::test]
    async fn test_miss_is_not_an_error() {
        let store = MemoryStore::new();
        let outcome = KeyResolver::new()
            .restore(&store, &resolved("cargo-abc", &["cargo-"]), RestorePolicy::PrefixOrder)
            .await;
        assert_eq!(outcome, RestoreOutcome::Miss);
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn lookup(&self, _key: &str) -> Result<Option<CacheEntry>> {
            Err(Error::CacheBackend("connection refused".into()))
        }

        async fn lookup_by_prefix(&self, _prefix: &str) -> Result<Option<CacheEntry>> {
            Err(Error::CacheBackend("connection refused".into()))
        }

        async fn store(&self, _key: &str, _content: &[u8]) -> Result<CacheEntry> {
            Err(Error::CacheBackend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_cold_run() {
        let outcome = KeyResolver::new()
            .restore(
                &BrokenStore,
                &resolved("cargo-abc", &["cargo-"]),
                RestorePolicy::PrefixOrder,
            )
            .await;
        assert_eq!(outcome, RestoreOutcome::Degraded);
    }

    #[test]
    fn test_resolve_interpolates_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), b"lock").unwrap();

        let mut ctx = InterpolationContext::new();
        ctx.matrix.insert("os".to_string(), "linux".to_string());

        let spec = CacheKeySpec {
            key: "cargo-${{ matrix.os }}-${{ hashFiles('Cargo.lock') }}".to_string(),
            restore_keys: vec!["cargo-${{ matrix.os }}-".to_string()],
            paths: vec!["target".to_string()],
        };

        let resolved = KeyResolver::new().resolve(&spec, dir.path(), &ctx);
        assert!(resolved.primary.starts_with("cargo-linux-"));
        assert!(!resolved.primary.contains("hashFiles"));
        assert_eq!(resolved.restore_prefixes, vec!["cargo-linux-".to_string()]);
    }
}
