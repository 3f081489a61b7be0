use std::fmt;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::macros::{datetime, format_description};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::debug;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Stored `lastpulled` value of a file that was never downloaded.
pub const NEVER_PULLED: &str = "1900-01-01 00:00:00";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("file is already tracked: {remote_name} -> {local_path}")]
    DuplicateKey {
        remote_name: String,
        local_path: String,
    },
    #[error("no tracked file matches {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid status code: {0}")]
    InvalidStatus(i64),
    #[error("invalid vendor code: {0}")]
    InvalidVendor(i64),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Vendor {
    GoogleDrive,
}

impl Vendor {
    pub const ALL: [Vendor; 1] = [Vendor::GoogleDrive];

    fn code(self) -> i64 {
        match self {
            Vendor::GoogleDrive => 0,
        }
    }

    fn from_code(code: i64) -> Result<Self, RegistryError> {
        match code {
            0 => Ok(Vendor::GoogleDrive),
            other => Err(RegistryError::InvalidVendor(other)),
        }
    }

    /// Directory under the sync dir holding this vendor's default local copies.
    pub fn dir_name(self) -> &'static str {
        match self {
            Vendor::GoogleDrive => "google-drive",
        }
    }

    pub fn token_file_name(self) -> &'static str {
        match self {
            Vendor::GoogleDrive => "google_token.json",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vendor::GoogleDrive => f.write_str("Google Drive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Error,
    Synced,
}

impl Status {
    fn code(self) -> i64 {
        match self {
            Status::Error => 0,
            Status::Synced => 1,
        }
    }

    fn from_code(code: i64) -> Result<Self, RegistryError> {
        match code {
            0 => Ok(Status::Error),
            1 => Ok(Status::Synced),
            other => Err(RegistryError::InvalidStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Error => f.write_str("Error"),
            Status::Synced => f.write_str("Synced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub id: i64,
    /// Empty until the file has been matched against a remote object.
    pub remote_id: String,
    pub remote_name: String,
    pub local_path: PathBuf,
    pub vendor: Vendor,
    pub status: Status,
    pub last_pulled: OffsetDateTime,
    /// Remote modification time of our last upload, or the never-pulled sentinel.
    pub last_pushed: OffsetDateTime,
    /// Digest of the local content as of the last download or upload.
    pub local_md5: Option<String>,
}

impl TrackedFile {
    pub fn never_pulled(&self) -> bool {
        self.last_pulled == never_pulled_at()
    }

    /// Remote changes up to this instant are already reflected locally,
    /// whether we downloaded them or uploaded them ourselves.
    pub fn synced_through(&self) -> OffsetDateTime {
        self.last_pulled.max(self.last_pushed)
    }
}

pub fn never_pulled_at() -> OffsetDateTime {
    datetime!(1900-01-01 00:00:00 UTC)
}

/// Formats `at` the way SQLite stores `DATETIME` text, rounding sub-second
/// precision up so the stored value never precedes `at`.
pub fn to_db_timestamp(at: OffsetDateTime) -> String {
    let mut at = at.to_offset(UtcOffset::UTC);
    if at.nanosecond() > 0 {
        at = at - time::Duration::nanoseconds(i64::from(at.nanosecond())) + time::Duration::SECOND;
    }
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

/// Accepts SQLite `DATETIME` text (UTC) or RFC 3339.
pub fn parse_db_timestamp(value: &str) -> Result<OffsetDateTime, RegistryError> {
    let value = value.trim();
    if let Ok(parsed) = PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    ) {
        return Ok(parsed.assume_utc());
    }
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|_| RegistryError::InvalidTimestamp(value.to_string()))
}

/// Durable set of tracked files.
#[derive(Clone)]
pub struct FileRegistry {
    pool: SqlitePool,
}

impl FileRegistry {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let registry = Self { pool };
        registry.init().await?;
        Ok(registry)
    }

    pub async fn in_memory() -> Result<Self, RegistryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let registry = Self { pool };
        registry.init().await?;
        Ok(registry)
    }

    pub async fn init(&self) -> Result<(), RegistryError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<TrackedFile>, RegistryError> {
        let rows = sqlx::query(
            "SELECT id, remoteid, remotename, localpath, status, vendor, lastpulled, lastpushed, localmd5 FROM files ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_file).collect()
    }

    pub async fn get(
        &self,
        remote_name: &str,
        vendor: Vendor,
    ) -> Result<Option<TrackedFile>, RegistryError> {
        let row = sqlx::query(
            "SELECT id, remoteid, remotename, localpath, status, vendor, lastpulled, lastpushed, localmd5 FROM files WHERE remotename = ?1 AND vendor = ?2",
        )
        .bind(remote_name)
        .bind(vendor.code())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_file).transpose()
    }

    pub async fn add(
        &self,
        remote_name: &str,
        local_path: &Path,
        vendor: Vendor,
    ) -> Result<TrackedFile, RegistryError> {
        if remote_name.trim().is_empty() {
            return Err(RegistryError::InvalidInput(
                "remote name must not be empty".into(),
            ));
        }
        if !local_path.is_absolute() {
            return Err(RegistryError::InvalidInput(format!(
                "local path must be absolute: {}",
                local_path.display()
            )));
        }
        let local = path_to_str(local_path)?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO files (remotename, localpath, status, vendor, lastpulled) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(remote_name)
        .bind(local)
        .bind(Status::Error.code())
        .bind(vendor.code())
        .bind(NEVER_PULLED)
        .execute(&mut *tx)
        .await;
        let id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(RegistryError::DuplicateKey {
                    remote_name: remote_name.to_string(),
                    local_path: local.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        tx.commit().await?;
        debug!(id, remote_name, local_path = local, %vendor, "tracked file added");

        Ok(TrackedFile {
            id,
            remote_id: String::new(),
            remote_name: remote_name.to_string(),
            local_path: local_path.to_path_buf(),
            vendor,
            status: Status::Error,
            last_pulled: never_pulled_at(),
            last_pushed: never_pulled_at(),
            local_md5: None,
        })
    }

    /// Deletes every record named `remote_name`, regardless of vendor.
    pub async fn remove(&self, remote_name: &str) -> Result<(), RegistryError> {
        let result = sqlx::query("DELETE FROM files WHERE remotename = ?1")
            .bind(remote_name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(remote_name.to_string()));
        }
        debug!(remote_name, "tracked file removed");
        Ok(())
    }

    /// Persists status, remote id and local digest. `pulled_at` advances
    /// `lastpulled` only when it is later than the stored value, and
    /// `file.last_pushed` advances `lastpushed` the same way. Both markers are
    /// refreshed from the row afterwards.
    pub async fn update(
        &self,
        file: &mut TrackedFile,
        pulled_at: Option<OffsetDateTime>,
    ) -> Result<(), RegistryError> {
        let pulled_at = pulled_at.map(to_db_timestamp);
        let pushed_at = to_db_timestamp(file.last_pushed);
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE files SET status = ?1, remoteid = ?2, \
             lastpulled = CASE WHEN ?3 IS NOT NULL AND ?3 > lastpulled THEN ?3 ELSE lastpulled END, \
             lastpushed = CASE WHEN ?4 > lastpushed THEN ?4 ELSE lastpushed END, \
             localmd5 = ?5 WHERE id = ?6",
        )
        .bind(file.status.code())
        .bind(&file.remote_id)
        .bind(pulled_at.as_deref())
        .bind(&pushed_at)
        .bind(file.local_md5.as_deref())
        .bind(file.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(file.remote_name.clone()));
        }
        let row = sqlx::query("SELECT lastpulled, lastpushed FROM files WHERE id = ?1")
            .bind(file.id)
            .fetch_one(&mut *tx)
            .await?;
        let last_pulled: String = row.try_get("lastpulled")?;
        let last_pushed: String = row.try_get("lastpushed")?;
        tx.commit().await?;
        file.last_pulled = parse_db_timestamp(&last_pulled)?;
        file.last_pushed = parse_db_timestamp(&last_pushed)?;
        Ok(())
    }
}

fn path_to_str(path: &Path) -> Result<&str, RegistryError> {
    path.to_str().ok_or_else(|| {
        RegistryError::InvalidInput(format!("local path is not valid UTF-8: {}", path.display()))
    })
}

fn row_to_file(row: &SqliteRow) -> Result<TrackedFile, RegistryError> {
    let local_path: String = row.try_get("localpath")?;
    let last_pulled: String = row.try_get("lastpulled")?;
    let last_pushed: String = row.try_get("lastpushed")?;
    Ok(TrackedFile {
        id: row.try_get("id")?,
        remote_id: row.try_get("remoteid")?,
        remote_name: row.try_get("remotename")?,
        local_path: PathBuf::from(local_path),
        vendor: Vendor::from_code(row.try_get("vendor")?)?,
        status: Status::from_code(row.try_get("status")?)?,
        last_pulled: parse_db_timestamp(&last_pulled)?,
        last_pushed: parse_db_timestamp(&last_pushed)?,
        local_md5: row.try_get("localmd5")?,
    })
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
