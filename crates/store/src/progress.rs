use proto::{ChallengeId, StoreError, UserId};
use sqlx::{Row, sqlite::SqlitePool};
use tracing::{debug, info};

/// SQLite-backed attempt/solve records.
pub struct ProgressStore {
    pool: SqlitePool,
}

impl ProgressStore {
    /// Open (or create) the SQLite database and run migrations
    pub async fn open(db_url: &str) -> Result<Self, StoreError> {
        // Expand ~ in path
        let url = if db_url.starts_with("~") {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            db_url.replacen("~", &home, 1)
        } else {
            db_url.to_string()
        };

        // Ensure parent directory exists
        if let Some(parent) = std::path::Path::new(&url).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{url}?mode=rwc"))
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        let migrations_dir =
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        let migrator = sqlx::migrate::Migrator::new(migrations_dir.as_path())
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        migrator
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!("Progress store opened: {url}");
        Ok(Self { pool })
    }

    /// Whether the user already has a solve row for this challenge.
    pub async fn has_solved(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM solves WHERE user_id = ? AND challenge_id = ?",
        )
        .bind(user_id)
        .bind(challenge_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        Ok(row.get::<i64, _>("n") > 0)
    }

    /// Record one validation run.
    ///
    /// Always appends an attempt row; on success additionally inserts the
    /// solve row unless one exists. Both writes happen in a single
    /// transaction, attempt first, so the records can never disagree.
    pub async fn record_validation(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        success: bool,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        sqlx::query(
            "INSERT INTO attempts (user_id, challenge_id, success, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(challenge_id)
        .bind(success)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        if success {
            sqlx::query(
                "INSERT OR IGNORE INTO solves (user_id, challenge_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(user_id)
            .bind(challenge_id)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        debug!("Recorded validation for user {user_id} challenge {challenge_id} (success: {success})");
        Ok(())
    }

    /// Number of attempt rows for this (user, challenge).
    pub async fn attempt_count(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM attempts WHERE user_id = ? AND challenge_id = ?",
        )
        .bind(user_id)
        .bind(challenge_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        Ok(row.get("n"))
    }

    /// Number of solve rows for this (user, challenge). Never exceeds one.
    pub async fn solve_count(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM solves WHERE user_id = ? AND challenge_id = ?",
        )
        .bind(user_id)
        .bind(challenge_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        Ok(row.get("n"))
    }

    /// Most recent attempt's success flag, if any attempt exists.
    pub async fn last_attempt_success(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> Result<Option<bool>, StoreError> {
        let row = sqlx::query(
            "SELECT success FROM attempts WHERE user_id = ? AND challenge_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(challenge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Sqlx(e.to_string()))?;

        Ok(row.map(|r| r.get::<bool, _>("success")))
    }
}
