use crate::error::Result;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use std::fs;
use std::path::Path;
use tracing::{info, instrument};

const CREATE_TABLES: [&str; 4] = [
    r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            username TEXT NOT NULL UNIQUE,
            used_traffic INTEGER NOT NULL DEFAULT 0,
            lifetime_used_traffic INTEGER NOT NULL DEFAULT 0,
            data_limit INTEGER,
            online_at DATETIME
        )
    "#,
    r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            name TEXT NOT NULL,
            address TEXT NOT NULL,
            port INTEGER NOT NULL,
            usage_coefficient REAL NOT NULL DEFAULT 1.0,
            traffic_calculation_method VARCHAR(32) NOT NULL DEFAULT 'sum'
        )
    "#,
    r#"
        CREATE TABLE IF NOT EXISTS node_usages (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            node_id INTEGER NOT NULL,
            created_at DATETIME NOT NULL,
            uplink INTEGER NOT NULL DEFAULT 0,
            downlink INTEGER NOT NULL DEFAULT 0,
            UNIQUE (node_id, created_at)
        )
    "#,
    r#"
        CREATE TABLE IF NOT EXISTS node_user_usages (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            node_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            created_at DATETIME NOT NULL,
            used_traffic INTEGER NOT NULL DEFAULT 0,
            UNIQUE (node_id, user_id, created_at)
        )
    "#,
];

/// Opens the database and makes sure every table the recorder touches exists.
#[instrument]
pub async fn connect(database_url: &str) -> Result<DatabaseConnection> {
    if let Some(parent) = sqlite_file_path(database_url).and_then(|path| path.parent())
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let db = Database::connect(database_url).await?;
    ensure_schema(&db).await?;

    info!("Connected to database: {}", database_url);
    Ok(db)
}

pub async fn ensure_schema(db: &DatabaseConnection) -> Result<()> {
    for sql in CREATE_TABLES {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            sql.to_string(),
        ))
        .await?;
    }
    Ok(())
}

fn sqlite_file_path(database_url: &str) -> Option<&Path> {
    let rest = database_url.strip_prefix("sqlite:")?;
    let rest = rest.trim_start_matches("//");
    let path = rest.split('?').next()?;
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(Path::new(path))
}
