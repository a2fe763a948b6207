//! Engine configuration, read from the environment exactly once at boot.

use std::time::Duration;

use rustc_hash::FxHashMap;

/// Target of a lowered full-text `MATCH` clause: the real table and the
/// text column the virtual FTS table indexes.
#[derive(Debug, Clone)]
pub struct FtsTarget {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Backend host name or unix socket directory (`BACKEND_HOST`).
    pub backend_host: String,
    /// Backend database name (`BACKEND_DB`).
    pub backend_db: String,
    /// Backend role (`BACKEND_USER`).
    pub backend_user: String,
    /// Connections per logical database (`POOL_MAX`).
    pub pool_max: usize,
    /// How long a claim may wait on an exhausted pool before failing.
    pub claim_timeout: Duration,
    /// Remaining-stack bands in KB (`STACK_SOFT_KB` / `STACK_HARD_KB`).
    pub stack_soft_kb: usize,
    pub stack_hard_kb: usize,
    /// Extra headroom on-deck-class queries need on top of the hard band.
    pub stack_on_deck_extra_kb: usize,
    /// Prepare recursion ceiling (`RECURSION_LIMIT`).
    pub recursion_limit: u32,
    /// Rewriter cache capacity in entries (`REWRITER_CACHE_CAP`).
    pub rewriter_cache_cap: usize,
    /// Inputs longer than this bypass the rewriter cache.
    pub rewriter_cache_max_sql: usize,
    /// Schema that qualifies bare host tables (`SCHEMA`).
    pub schema: String,
    /// Column-text ring geometry (`COLBUF_SLOTS` / `COLBUF_SLOT_BYTES`).
    pub colbuf_slots: usize,
    pub colbuf_slot_bytes: usize,
    /// Host tables that get schema-qualified in table position.
    pub known_tables: Vec<String>,
    /// Virtual FTS tables and what their `MATCH` lowers to.
    pub fts_tables: FxHashMap<String, FtsTarget>,
    /// Substrings that classify a statement as an on-deck-style carousel
    /// query (§stack guard: these degrade to an empty result, not an error).
    pub on_deck_markers: Vec<String>,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("config: ignoring unparseable {key}={raw:?}");
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Config {
        let mut fts_tables = FxHashMap::default();
        fts_tables.insert(
            "fts4_metadata_titles".to_string(),
            FtsTarget {
                table: "metadata_items".to_string(),
                column: "title".to_string(),
            },
        );
        fts_tables.insert(
            "fts4_tag_titles".to_string(),
            FtsTarget {
                table: "tags".to_string(),
                column: "tag".to_string(),
            },
        );

        Config {
            backend_host: env_string("BACKEND_HOST", "localhost"),
            backend_db: env_string("BACKEND_DB", "plex"),
            backend_user: env_string("BACKEND_USER", "plex"),
            pool_max: env_parse("POOL_MAX", 16).max(1),
            claim_timeout: Duration::from_millis(env_parse("POOL_CLAIM_TIMEOUT_MS", 10_000)),
            stack_soft_kb: env_parse("STACK_SOFT_KB", 500),
            stack_hard_kb: env_parse("STACK_HARD_KB", 400),
            stack_on_deck_extra_kb: 100,
            recursion_limit: env_parse("RECURSION_LIMIT", 100),
            rewriter_cache_cap: env_parse("REWRITER_CACHE_CAP", 1024).max(1),
            rewriter_cache_max_sql: 64 * 1024,
            schema: env_string("SCHEMA", "plex"),
            colbuf_slots: env_parse("COLBUF_SLOTS", 64).max(8),
            colbuf_slot_bytes: env_parse("COLBUF_SLOT_BYTES", 8192).max(256),
            known_tables: DEFAULT_TABLES.iter().map(|t| t.to_string()).collect(),
            fts_tables,
            on_deck_markers: vec!["on_deck".to_string(), "ondeck".to_string()],
        }
    }

    /// libpq-style connection string for one logical database.
    pub fn conninfo(&self) -> String {
        format!(
            "host={} dbname={} user={} application_name=pgqlite",
            self.backend_host, self.backend_db, self.backend_user
        )
    }

    pub fn is_known_table(&self, name: &str) -> bool {
        self.known_tables.iter().any(|t| t.eq_ignore_ascii_case(name))
    }
}

/// The host tables observed in media-server traffic. Bare references to
/// these get schema-qualified by the rewriter.
const DEFAULT_TABLES: &[&str] = &[
    "accounts",
    "directories",
    "library_section_permissions",
    "library_sections",
    "media_items",
    "media_parts",
    "media_provider_resources",
    "media_streams",
    "metadata_item_settings",
    "metadata_item_views",
    "metadata_items",
    "metadata_relations",
    "play_queue_generators",
    "play_queue_items",
    "play_queues",
    "plugin_permissions",
    "plugins",
    "preferences",
    "statistics_media",
    "taggings",
    "tags",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = Config::from_env();
        assert_eq!(cfg.stack_soft_kb, 500);
        assert_eq!(cfg.stack_hard_kb, 400);
        assert!(cfg.is_known_table("metadata_items"));
        assert!(cfg.is_known_table("Metadata_Items"));
        assert!(!cfg.is_known_table("sqlite_master"));
        assert!(cfg.fts_tables.contains_key("fts4_metadata_titles"));
    }
}
