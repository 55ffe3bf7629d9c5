//! §4.3 Game-Name Resolver: a five-step pipeline from a free-form activity
//! name to `(gameId?, gameName)`, backed by a 10-minute name-keyed cache.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::clock::Clock;
use crate::model::DiscordId;
use crate::ports::GameRegistryStore;
use crate::utils::prelude::*;

const CACHE_TTL: Duration = Duration::from_secs(10 * 60);
const TRIGRAM_THRESHOLD: f64 = 0.3;

/// A resolved `(gameId?, gameName)` pair. `game_id = None` is the
/// "untitled" resolution §4.3 falls back to when every step misses.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub game_id: Option<i64>,
    pub game_name: String,
}

struct CacheEntry {
    cached_at: chrono::DateTime<chrono::Utc>,
    resolution: Resolution,
}

/// Resolves raw Discord activity-name strings to registry games, caching by
/// the *raw* name (§4.3: "cache key is the raw activity name ... to avoid
/// re-running the pipeline per activity").
pub struct GameResolver {
    registry: Arc<dyn GameRegistryStore>,
    clock: Arc<dyn Clock>,
    cache: DashMap<String, CacheEntry>,
    /// §9: checked once here, not on every `resolve` call.
    trigram_supported: bool,
}

impl GameResolver {
    pub fn new(registry: Arc<dyn GameRegistryStore>, clock: Arc<dyn Clock>) -> Self {
        let trigram_supported = registry.supports_trigram();
        Self {
            registry,
            clock,
            cache: DashMap::new(),
            trigram_supported,
        }
    }

    /// Resolve `activity_name` for `user_id`, running the manual-override
    /// step first since it depends on the requesting user.
    pub async fn resolve(&self, user_id: DiscordId, activity_name: &str) -> Resolution {
        if let Some(hit) = self.cached(activity_name) {
            return hit;
        }

        let resolution = self.run_pipeline(user_id, activity_name).await;

        self.cache.insert(
            activity_name.to_string(),
            CacheEntry {
                cached_at: self.clock.now(),
                resolution: resolution.clone(),
            },
        );

        resolution
    }

    fn cached(&self, activity_name: &str) -> Option<Resolution> {
        let entry = self.cache.get(activity_name)?;
        if self.clock.now() - entry.cached_at < CACHE_TTL {
            Some(entry.resolution.clone())
        } else {
            None
        }
    }

    async fn run_pipeline(&self, user_id: DiscordId, activity_name: &str) -> Resolution {
        // Step 1: per-user manual override, then continue the pipeline with
        // the override string in place of the raw activity name.
        let name = match self.registry.playing_override(user_id).await {
            Ok(Some(overridden)) => overridden,
            Ok(None) => activity_name.to_string(),
            Err(e) => {
                warn!("Manual-override lookup failed for user '{user_id}', ignoring: {e:#}");
                activity_name.to_string()
            },
        };

        // Step 2: admin-managed activity-name -> game mapping.
        match self.registry.mapped_game(&name).await {
            Ok(Some((game_id, game_name))) => {
                return Resolution {
                    game_id: Some(game_id),
                    game_name,
                };
            },
            Ok(None) => {},
            Err(e) => warn!("Activity mapping lookup failed for '{name}': {e:#}"),
        }

        // Step 3: exact match.
        match self.registry.exact_match(&name).await {
            Ok(Some((game_id, game_name))) => {
                return Resolution {
                    game_id: Some(game_id),
                    game_name,
                };
            },
            Ok(None) => {},
            Err(e) => warn!("Exact-match lookup failed for '{name}': {e:#}"),
        }

        // Step 4: case-insensitive match.
        match self.registry.case_insensitive_match(&name).await {
            Ok(Some((game_id, game_name))) => {
                return Resolution {
                    game_id: Some(game_id),
                    game_name,
                };
            },
            Ok(None) => {},
            Err(e) => warn!("Case-insensitive lookup failed for '{name}': {e:#}"),
        }

        // Step 5: trigram similarity. An unavailable index is a silent skip,
        // not a failure.
        if self.trigram_supported {
            match self.registry.trigram_match(&name, TRIGRAM_THRESHOLD).await {
                Ok(Some((game_id, game_name))) => {
                    return Resolution {
                        game_id: Some(game_id),
                        game_name,
                    };
                },
                Ok(None) => {},
                Err(e) => warn!("Trigram lookup failed for '{name}': {e:#}"),
            }
        } else {
            trace!("Trigram matching unsupported, skipping step 5");
        }

        Resolution {
            game_id: None,
            game_name: name,
        }
    }
}
