//! SQLite connections for the workflow store.
//!
//! Reads go through a small read-only pool. All writes share one connection,
//! which is what keeps event sequence numbers gap-free per execution: two
//! appends can never interleave their `MAX(sequence)` read and insert.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Database file name inside the data directory.
pub const DATABASE_FILE: &str = "swdl.db";

const READ_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only connections for listing and lookups.
    pub reader: SqlitePool,
    /// The single write connection.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Connect to `database_url`, creating the file if needed, and bring the
    /// schema up to date. WAL mode lets readers proceed while the writer holds
    /// a transaction.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        // Migrate before any reader connects so readers never see an old schema.
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READ_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url = database_url, "workflow store opened");
        Ok(Self { reader, writer })
    }

    /// Open the store that lives in `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, sqlx::Error> {
        Self::new(&database_url(data_dir)).await
    }

    /// Wait for in-flight queries, then drop every connection.
    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}

pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join(DATABASE_FILE).display())
}
