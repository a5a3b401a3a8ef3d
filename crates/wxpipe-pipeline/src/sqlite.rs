//! SQLite export of the loaded batch into `weather_data`.
//!
//! Each export replaces the table's contents with the current batch, so the
//! database always mirrors the most recent load.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use wxpipe_core::{CleanedReading, RunId};

use crate::error::ExportError;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS weather_data (\
     run_id TEXT NOT NULL, \
     city TEXT NOT NULL, \
     country TEXT NOT NULL, \
     timestamp TEXT NOT NULL, \
     date TEXT NOT NULL, \
     unit TEXT NOT NULL, \
     temperature REAL NOT NULL, \
     feels_like REAL, \
     temp_min REAL, \
     temp_max REAL, \
     pressure REAL, \
     humidity REAL, \
     wind_speed REAL, \
     wind_direction REAL, \
     condition TEXT NOT NULL, \
     description TEXT, \
     is_outlier INTEGER NOT NULL, \
     outlier_reason TEXT, \
     heat_index REAL, \
     dew_point REAL, \
     temp_range REAL)";

const CREATE_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_city ON weather_data (city)",
    "CREATE INDEX IF NOT EXISTS idx_date ON weather_data (date)",
];

/// Opens (creating if needed) the database file at `path`.
///
/// # Errors
///
/// Returns [`sqlx::Error`] if the file cannot be opened.
pub async fn connect(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Writes `records` to `weather_data` in `database`, replacing whatever the
/// table held. Returns the number of rows inserted.
///
/// # Errors
///
/// Returns [`ExportError::Io`] if the parent directory cannot be created and
/// [`ExportError::Sqlite`] if any statement fails; a failed export leaves
/// the previous contents in place.
pub async fn export_sqlite(
    database: &Path,
    run_id: &RunId,
    records: &[CleanedReading],
) -> Result<usize, ExportError> {
    if let Some(parent) = database.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let pool = connect(database).await?;
    let result = replace_rows(&pool, run_id, records).await;
    pool.close().await;
    let inserted = result?;

    tracing::info!(
        run_id = %run_id,
        database = %database.display(),
        rows = inserted,
        "sqlite export complete"
    );
    Ok(inserted)
}

async fn replace_rows(
    pool: &SqlitePool,
    run_id: &RunId,
    records: &[CleanedReading],
) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(CREATE_TABLE).execute(&mut *tx).await?;
    for statement in CREATE_INDEXES {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query("DELETE FROM weather_data")
        .execute(&mut *tx)
        .await?;

    for r in records {
        sqlx::query(
            "INSERT INTO weather_data (run_id, city, country, timestamp, date, unit, \
             temperature, feels_like, temp_min, temp_max, pressure, humidity, wind_speed, \
             wind_direction, condition, description, is_outlier, outlier_reason, \
             heat_index, dew_point, temp_range) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
             ?16, ?17, ?18, ?19, ?20, ?21)",
        )
        .bind(run_id.as_str())
        .bind(&r.city.name)
        .bind(&r.city.country)
        .bind(r.timestamp.to_rfc3339())
        .bind(r.timestamp.date_naive().to_string())
        .bind(r.unit.api_units())
        .bind(r.temperature)
        .bind(r.feels_like)
        .bind(r.temp_min)
        .bind(r.temp_max)
        .bind(r.pressure)
        .bind(r.humidity)
        .bind(r.wind_speed)
        .bind(r.wind_direction)
        .bind(&r.condition)
        .bind(r.description.as_deref())
        .bind(r.is_outlier)
        .bind(r.outlier_reason.as_deref())
        .bind(r.derived.get("heat_index").copied())
        .bind(r.derived.get("dew_point").copied())
        .bind(r.derived.get("temp_range").copied())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(records.len())
}
