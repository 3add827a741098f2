use std::time::Duration;

use metrics::gauge;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::entities;
use crate::errors::CoreError;

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            url: config.database_url.clone(),
            max_connections: config.db_max_connections,
            min_connections: config.db_min_connections,
            ..Default::default()
        }
    }
}

/// Establishes a connection pool to the database.
///
/// # Errors
/// Returns a `CoreError` if the connection cannot be established.
pub async fn establish_connection(database_url: &str) -> Result<DbPool, CoreError> {
    let config = DbConfig {
        url: database_url.to_string(),
        ..Default::default()
    };

    establish_connection_with_config(&config).await
}

/// Establishes a connection pool to the database with custom configuration.
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, CoreError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());

    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(true);

    gauge!("ftz_db.max_connections", config.max_connections as f64);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let pool = Database::connect(opt).await?;
    Ok(pool)
}

/// Establishes a connection from the application configuration, creating
/// the schema when `auto_migrate` is set.
pub async fn establish_connection_from_app_config(
    config: &AppConfig,
) -> Result<DbPool, CoreError> {
    let db_config = DbConfig::from_app_config(config);
    let pool = establish_connection_with_config(&db_config).await?;

    if config.auto_migrate {
        init_schema(&pool).await?;
    }

    Ok(pool)
}

/// Creates the engine's tables from the entity definitions when they do
/// not already exist. Used for test databases and `auto_migrate` startup.
pub async fn init_schema(db: &DatabaseConnection) -> Result<(), CoreError> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut statements = vec![
        schema.create_table_from_entity(entities::lot::Entity),
        schema.create_table_from_entity(entities::ledger_transaction::Entity),
        schema.create_table_from_entity(entities::preshipment::Entity),
        schema.create_table_from_entity(entities::preshipment_item::Entity),
    ];

    for stmt in &mut statements {
        db.execute(backend.build(stmt.if_not_exists())).await?;
    }

    info!("Database schema initialized");
    Ok(())
}
