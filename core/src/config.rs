//! Engine configuration and logging setup.

use serde::Deserialize;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Everything the engine facade recognizes at construction time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run migrations for registered models during `initialize()`.
    pub auto_migrate: bool,
    /// The database schema is managed elsewhere; never migrate, only verify.
    pub existing_schema_mode: bool,
    /// Require tenant scoping on every multi-tenant model operation.
    pub multi_tenant: bool,
    pub log_config: LogConfig,
    pub cache: CacheConfig,
    pub pool: PoolSettings,
    pub migration: MigrationConfig,
    /// Aggressive resource cleanup after every operation.
    pub test_mode: bool,
    /// Rows per statement for bulk operations.
    pub bulk_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_migrate: true,
            existing_schema_mode: false,
            multi_tenant: false,
            log_config: LogConfig::default(),
            cache: CacheConfig::default(),
            pool: PoolSettings::default(),
            migration: MigrationConfig::default(),
            test_mode: false,
            bulk_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_connections: u64,
    pub max_connections: u64,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolSettings {
    pub(crate) fn to_pool_config(&self) -> dataflow_sql::pooled::PoolConfig {
        dataflow_sql::pooled::PoolConfig {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            acquire_timeout: self.acquire_timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub production: bool,
    pub verified_backup: bool,
    pub rename_detection: bool,
    pub rename_similarity_threshold: f64,
    pub lock_timeout: Duration,
    pub confirm_critical: bool,
    pub degradation_threshold: f64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            production: false,
            verified_backup: false,
            rename_detection: false,
            rename_similarity_threshold: 0.6,
            lock_timeout: Duration::from_secs(3600),
            confirm_critical: false,
            degradation_threshold: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPreset {
    Production,
    Development,
    Quiet,
}

/// Per-category log levels, layered as `tracing` targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub preset: LogPreset,
    /// Overall level; overrides the preset's default when set.
    pub level: Option<String>,
    pub node_execution_level: Option<String>,
    pub sql_generation_level: Option<String>,
    pub list_operations_level: Option<String>,
    pub migration_level: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            preset: LogPreset::Development,
            level: None,
            node_execution_level: None,
            sql_generation_level: None,
            list_operations_level: None,
            migration_level: None,
        }
    }
}

impl LogConfig {
    pub fn production() -> Self {
        Self {
            preset: LogPreset::Production,
            ..Default::default()
        }
    }

    pub fn development() -> Self {
        Self::default()
    }

    pub fn quiet() -> Self {
        Self {
            preset: LogPreset::Quiet,
            ..Default::default()
        }
    }

    /// Reads levels from the `DATAFLOW_*` environment.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Self {
            preset: LogPreset::Development,
            level: var("DATAFLOW_LOG_LEVEL"),
            node_execution_level: var("DATAFLOW_NODE_EXECUTION_LOG_LEVEL"),
            sql_generation_level: var("DATAFLOW_SQL_GENERATION_LOG_LEVEL"),
            list_operations_level: None,
            migration_level: var("DATAFLOW_MIGRATION_LOG_LEVEL"),
        }
    }

    fn base_level(&self) -> &str {
        if let Some(level) = &self.level {
            return level;
        }

        match self.preset {
            LogPreset::Production => "warn",
            LogPreset::Development => "info",
            LogPreset::Quiet => "error",
        }
    }

    /// The `EnvFilter` directive string for this configuration.
    pub fn directives(&self) -> String {
        let mut directives = vec![format!("dataflow={}", self.base_level())];

        let categories = [
            ("dataflow::node", &self.node_execution_level),
            ("dataflow::sql", &self.sql_generation_level),
            ("dataflow::list", &self.list_operations_level),
            ("dataflow::migration", &self.migration_level),
        ];

        for (target, level) in categories {
            if let Some(level) = level {
                directives.push(format!("{target}={level}"));
            }
        }

        directives.join(",")
    }

    /// Installs the global subscriber. A second call (or a subscriber set by
    /// the host application) wins silently.
    pub fn init(&self) {
        let filter = EnvFilter::try_new(self.directives())
            .unwrap_or_else(|_| EnvFilter::new("dataflow=info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_pick_base_levels() {
        assert_eq!(LogConfig::production().base_level(), "warn");
        assert_eq!(LogConfig::development().base_level(), "info");
        assert_eq!(LogConfig::quiet().base_level(), "error");
    }

    #[test]
    fn per_category_levels_become_target_directives() {
        let config = LogConfig {
            migration_level: Some("debug".to_owned()),
            sql_generation_level: Some("trace".to_owned()),
            ..Default::default()
        };

        let directives = config.directives();
        assert!(directives.contains("dataflow=info"));
        assert!(directives.contains("dataflow::migration=debug"));
        assert!(directives.contains("dataflow::sql=trace"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.bulk_batch_size, 1000);
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.cache.max_size, 10_000);
        assert_eq!(config.migration.lock_timeout, Duration::from_secs(3600));
        assert_eq!(config.migration.rename_similarity_threshold, 0.6);
    }
}
