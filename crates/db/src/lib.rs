// crates/db/src/lib.rs
//! SQLite-backed dashboard statistics engine.
//!
//! A [`Database`] owns a sqlx connection pool over the host application's
//! SQLite file plus this crate's own configuration tables (charts,
//! criteria, bindings, cached values — created by inline migrations).
//! Host data tables are described by a [`ModelRegistry`] rather than
//! introspected.
//!
//! The two entry points chart consumers care about are
//! [`Database::compute_series`] and [`Database::compute_series_cached`].

pub mod cache;
mod choices;
mod migrations;
pub mod models;
pub mod registry;
pub mod series;
mod sql;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono_tz::Tz;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use choices::ChoicesKey;
pub use cache::{filters_signature, get_gaps, RecalculateOptions, RecalculateReport};
pub use choices::{Choice, ChoiceFilter, SqlLiteral, Viewer};
pub use models::{BindingRole, CachedValue, Chart, Criteria, CriteriaBinding};
pub use registry::{FieldDef, FieldKind, ModelDef, ModelRegistry, RelationDef};
pub use series::{SeriesMap, SeriesRequest};

/// A chart-definition validation failure, tagged with the offending field
/// so an editing UI can show it inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// All validation failures for one chart definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldError {
            field,
            message: message.into(),
        });
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] dashstats_core::CoreError),

    #[error("Invalid criteria mapping: {0}")]
    Mapping(#[from] serde_json::Error),

    #[error("Invalid registry config: {0}")]
    RegistryConfig(#[from] toml::de::Error),

    #[error("No registered model '{name}'")]
    UnknownModel { name: String },

    #[error("Cannot resolve '{name}' into a field of '{model}'")]
    UnknownField { model: String, name: String },

    #[error("Invalid chart definition: {0}")]
    Validation(ValidationErrors),

    #[error("time_since is greater than time_until")]
    TimeRange,

    #[error("User field must be defined to enable charts for non-superusers")]
    UserFieldRequired,

    #[error("{what} with id {id} not found")]
    NotFound { what: &'static str, id: i64 },

    #[error("Bad chart configuration: {0}")]
    BadConfiguration(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Render the single human-readable error string shown at the chart
/// boundary (visible error box instead of a blank chart).
pub fn chart_error_message(chart: &Chart, err: &DbError) -> String {
    format!("{}: {}", chart.graph_title, err)
}

/// Main database handle: sqlx pool, model registry, charts timezone and
/// the in-memory criteria-choice memo.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    db_path: PathBuf,
    registry: Arc<ModelRegistry>,
    charts_tz: Tz,
    choices_cache: Arc<Mutex<HashMap<ChoicesKey, Arc<Vec<Choice>>>>>,
}

impl Database {
    /// Open (or create) the database at the given path and run migrations.
    ///
    /// All bucket truncation for this handle happens in `charts_tz`,
    /// independent of the server's local timezone.
    pub async fn new(path: &Path, registry: ModelRegistry, charts_tz: Tz) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            db_path: path.to_owned(),
            registry: Arc::new(registry),
            charts_tz,
            choices_cache: Arc::new(Mutex::new(HashMap::new())),
        };
        db.run_migrations().await?;

        info!(path = %path.display(), timezone = %charts_tz, "Database opened");
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    ///
    /// Uses `shared_cache(true)` so all pool connections share the same
    /// in-memory database; without it each connection would see its own
    /// empty database.
    pub async fn new_in_memory(registry: ModelRegistry, charts_tz: Tz) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .shared_cache(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            db_path: PathBuf::new(),
            registry: Arc::new(registry),
            charts_tz,
            choices_cache: Arc::new(Mutex::new(HashMap::new())),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn charts_timezone(&self) -> Tz {
        self.charts_tz
    }

    /// Run all inline migrations.
    ///
    /// Uses a `_migrations` table to track which migrations have already
    /// been applied, so non-idempotent statements run only once.
    async fn run_migrations(&self) -> DbResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (version INTEGER PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM _migrations")
            .fetch_one(&self.pool)
            .await?;
        let current_version = row.0 as usize;

        for (i, migration) in migrations::MIGRATIONS.iter().enumerate() {
            let version = i + 1; // 1-based
            if version > current_version {
                sqlx::query(migration).execute(&self.pool).await?;
                sqlx::query("INSERT INTO _migrations (version) VALUES (?1)")
                    .bind(version as i64)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}
