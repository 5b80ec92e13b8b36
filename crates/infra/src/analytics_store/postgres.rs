//! Postgres-backed data and metrics stores.
//!
//! The store traits are synchronous because they are driven from worker
//! threads. Each call is bridged onto the tokio runtime captured at
//! construction with `Handle::block_on`, so callers must not be running on a
//! runtime thread themselves.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (check/foreign key violation) | `Malformed` |
//! | RowNotFound | `NotFound` |
//! | ColumnDecode / Decode | `Malformed` |
//! | Anything else | `Storage` (retryable) |
//!
//! ## Upserts
//!
//! Metrics rows are keyed by `(repository_id, snapshot_at)` and
//! `(user_id, repository_id, snapshot_at)`. A user snapshot that spans every
//! repository is stored under the nil UUID so the key stays non-null.

use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use devpulse_analytics::{
    CommitRecord, DataStore, MetricsStore, RepositoryCatalog, RepositoryRef, StoreError, TeamMetrics,
    TeamMetricsRecord, UserMetrics, UserMetricsRecord,
};
use devpulse_core::{RepositoryId, TimeRange, UserId};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS repositories (
        id UUID PRIMARY KEY,
        owner_id UUID NOT NULL,
        full_name TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS commits (
        repository_id UUID NOT NULL REFERENCES repositories (id),
        sha TEXT NOT NULL,
        author_id UUID NOT NULL,
        authored_at TIMESTAMPTZ NOT NULL,
        additions BIGINT NOT NULL CHECK (additions >= 0),
        deletions BIGINT NOT NULL CHECK (deletions >= 0),
        files TEXT[] NOT NULL DEFAULT '{}',
        PRIMARY KEY (repository_id, sha)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS commits_author_idx ON commits (author_id, authored_at)",
    r#"
    CREATE TABLE IF NOT EXISTS team_metrics (
        repository_id UUID NOT NULL,
        snapshot_at TIMESTAMPTZ NOT NULL,
        metrics JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (repository_id, snapshot_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_metrics (
        user_id UUID NOT NULL,
        repository_id UUID NOT NULL,
        snapshot_at TIMESTAMPTZ NOT NULL,
        metrics JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (user_id, repository_id, snapshot_at)
    )
    "#,
];

/// Repositories, commits and metric snapshots in one Postgres database.
#[derive(Debug, Clone)]
pub struct PostgresAnalyticsStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresAnalyticsStore {
    /// Capture the current tokio runtime; fails outside of one.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            StoreError::Storage(
                "PostgresAnalyticsStore must be created inside a tokio runtime".to_string(),
            )
        })?;
        Ok(Self::with_runtime(pool, runtime))
    }

    pub fn with_runtime(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create the tables if they are missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        debug!(tables = SCHEMA.len(), "analytics schema ready");
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    async fn fetch_commits(
        &self,
        operation: &'static str,
        author_id: Option<UserId>,
        repository_id: Option<RepositoryId>,
        time_range: TimeRange,
    ) -> Result<Vec<CommitRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT repository_id, sha, author_id, authored_at, additions, deletions, files
            FROM commits
            WHERE ($1::uuid IS NULL OR author_id = $1)
                AND ($2::uuid IS NULL OR repository_id = $2)
                AND authored_at >= $3
                AND authored_at < $4
            ORDER BY authored_at ASC
            "#,
        )
        .bind(author_id.map(Uuid::from))
        .bind(repository_id.map(Uuid::from))
        .bind(time_range.start())
        .bind(time_range.end())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter()
            .map(commit_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

impl RepositoryCatalog for PostgresAnalyticsStore {
    fn repository_list(&self) -> Result<Vec<RepositoryRef>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query("SELECT id, owner_id, full_name FROM repositories ORDER BY full_name")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("repository_list", e))?;

            rows.iter()
                .map(|row| {
                    Ok(RepositoryRef {
                        id: RepositoryId::from_uuid(row.try_get("id")?),
                        owner_id: UserId::from_uuid(row.try_get("owner_id")?),
                        full_name: row.try_get("full_name")?,
                    })
                })
                .collect::<Result<_, sqlx::Error>>()
                .map_err(|e| map_sqlx_error("repository_list", e))
        })
    }
}

impl DataStore for PostgresAnalyticsStore {
    #[instrument(skip(self, repository), fields(repository = %repository.full_name), err)]
    fn upsert_repository(&self, repository: &RepositoryRef) -> Result<(), StoreError> {
        self.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO repositories (id, owner_id, full_name, updated_at)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (id) DO UPDATE
                SET owner_id = EXCLUDED.owner_id,
                    full_name = EXCLUDED.full_name,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(*repository.id.as_uuid())
            .bind(*repository.owner_id.as_uuid())
            .bind(&repository.full_name)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("upsert_repository", e))?;
            Ok(())
        })
    }

    #[instrument(skip(self, commits), fields(commit_count = commits.len()), err)]
    fn store_commits(&self, commits: &[CommitRecord]) -> Result<usize, StoreError> {
        if commits.is_empty() {
            return Ok(0);
        }

        self.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("store_commits", e))?;

            let mut inserted = 0usize;
            for commit in commits {
                let result = sqlx::query(
                    r#"
                    INSERT INTO commits
                        (repository_id, sha, author_id, authored_at, additions, deletions, files)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (repository_id, sha) DO NOTHING
                    "#,
                )
                .bind(*commit.repository_id.as_uuid())
                .bind(&commit.sha)
                .bind(*commit.author_id.as_uuid())
                .bind(commit.authored_at)
                .bind(i64::from(commit.additions))
                .bind(i64::from(commit.deletions))
                .bind(&commit.files)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("store_commits", e))?;
                inserted += result.rows_affected() as usize;
            }

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("store_commits", e))?;
            Ok(inserted)
        })
    }

    fn latest_commit_at(
        &self,
        repository_id: RepositoryId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.block_on(async {
            let row = sqlx::query("SELECT MAX(authored_at) AS latest FROM commits WHERE repository_id = $1")
                .bind(*repository_id.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("latest_commit_at", e))?;
            row.try_get("latest")
                .map_err(|e| map_sqlx_error("latest_commit_at", e))
        })
    }

    fn repository_commits(
        &self,
        repository_id: RepositoryId,
        time_range: TimeRange,
    ) -> Result<Vec<CommitRecord>, StoreError> {
        self.block_on(self.fetch_commits("repository_commits", None, Some(repository_id), time_range))
    }

    fn author_commits(
        &self,
        author_id: UserId,
        repository_id: Option<RepositoryId>,
        time_range: TimeRange,
    ) -> Result<Vec<CommitRecord>, StoreError> {
        self.block_on(self.fetch_commits("author_commits", Some(author_id), repository_id, time_range))
    }
}

impl MetricsStore for PostgresAnalyticsStore {
    #[instrument(skip(self, metrics), fields(repository_id = %repository_id, %timestamp), err)]
    fn save_team_metrics(
        &self,
        repository_id: RepositoryId,
        timestamp: DateTime<Utc>,
        metrics: &TeamMetrics,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_value(metrics).map_err(|e| StoreError::Malformed(e.to_string()))?;
        self.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO team_metrics (repository_id, snapshot_at, metrics, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (repository_id, snapshot_at) DO UPDATE
                SET metrics = EXCLUDED.metrics,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(*repository_id.as_uuid())
            .bind(timestamp)
            .bind(json)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("save_team_metrics", e))?;
            Ok(())
        })
    }

    fn team_metrics(&self, repository_id: RepositoryId) -> Result<Vec<TeamMetricsRecord>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT snapshot_at, metrics, updated_at
                FROM team_metrics
                WHERE repository_id = $1
                ORDER BY snapshot_at ASC
                "#,
            )
            .bind(*repository_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("team_metrics", e))?;

            rows.iter()
                .map(|row| {
                    let (timestamp, metrics, updated_at) = snapshot_from_row::<TeamMetrics>(row)?;
                    Ok(TeamMetricsRecord {
                        repository_id,
                        timestamp,
                        metrics,
                        updated_at,
                    })
                })
                .collect()
        })
    }

    #[instrument(skip(self, metrics), fields(user_id = %user_id, %timestamp), err)]
    fn save_user_metrics(
        &self,
        user_id: UserId,
        repository_id: Option<RepositoryId>,
        timestamp: DateTime<Utc>,
        metrics: &UserMetrics,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_value(metrics).map_err(|e| StoreError::Malformed(e.to_string()))?;
        self.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO user_metrics (user_id, repository_id, snapshot_at, metrics, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id, repository_id, snapshot_at) DO UPDATE
                SET metrics = EXCLUDED.metrics,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(*user_id.as_uuid())
            .bind(repository_key(repository_id))
            .bind(timestamp)
            .bind(json)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("save_user_metrics", e))?;
            Ok(())
        })
    }

    fn user_metrics(&self, user_id: UserId) -> Result<Vec<UserMetricsRecord>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT repository_id, snapshot_at, metrics, updated_at
                FROM user_metrics
                WHERE user_id = $1
                ORDER BY snapshot_at ASC, repository_id ASC
                "#,
            )
            .bind(*user_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("user_metrics", e))?;

            rows.iter()
                .map(|row| {
                    let repository: Uuid = row
                        .try_get("repository_id")
                        .map_err(|e| map_sqlx_error("user_metrics", e))?;
                    let (timestamp, metrics, updated_at) = snapshot_from_row::<UserMetrics>(row)?;
                    Ok(UserMetricsRecord {
                        user_id,
                        repository_id: (!repository.is_nil()).then(|| RepositoryId::from_uuid(repository)),
                        timestamp,
                        metrics,
                        updated_at,
                    })
                })
                .collect()
        })
    }
}

fn repository_key(repository_id: Option<RepositoryId>) -> Uuid {
    repository_id.map(Uuid::from).unwrap_or(Uuid::nil())
}

fn commit_from_row(row: &PgRow) -> Result<CommitRecord, sqlx::Error> {
    let additions: i64 = row.try_get("additions")?;
    let deletions: i64 = row.try_get("deletions")?;
    Ok(CommitRecord {
        sha: row.try_get("sha")?,
        repository_id: RepositoryId::from_uuid(row.try_get("repository_id")?),
        author_id: UserId::from_uuid(row.try_get("author_id")?),
        authored_at: row.try_get("authored_at")?,
        additions: u32::try_from(additions).unwrap_or(u32::MAX),
        deletions: u32::try_from(deletions).unwrap_or(u32::MAX),
        files: row.try_get("files")?,
    })
}

fn snapshot_from_row<T: serde::de::DeserializeOwned>(
    row: &PgRow,
) -> Result<(DateTime<Utc>, T, DateTime<Utc>), StoreError> {
    let timestamp = row
        .try_get("snapshot_at")
        .map_err(|e| map_sqlx_error("snapshot", e))?;
    let updated_at = row
        .try_get("updated_at")
        .map_err(|e| map_sqlx_error("snapshot", e))?;
    let json: serde_json::Value = row
        .try_get("metrics")
        .map_err(|e| map_sqlx_error("snapshot", e))?;
    let metrics = serde_json::from_value(json).map_err(|e| StoreError::Malformed(e.to_string()))?;
    Ok((timestamp, metrics, updated_at))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // check and foreign key violations will not succeed on retry
                Some("23514") | Some("23503") => StoreError::Malformed(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("no row in {}", operation)),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Malformed(format!("undecodable row in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_repository_snapshots_use_the_nil_key() {
        assert!(repository_key(None).is_nil());
        let repo = RepositoryId::new();
        assert_eq!(repository_key(Some(repo)), *repo.as_uuid());
    }

    #[test]
    fn pool_errors_are_retryable_storage_errors() {
        let err = map_sqlx_error("repository_list", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Storage(_)));

        let err = map_sqlx_error("latest_commit_at", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    #[ignore = "requires DATABASE_URL"]
    fn upserts_against_a_live_database() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let pool = runtime.block_on(PgPool::connect(&url)).unwrap();
        let store = PostgresAnalyticsStore::with_runtime(pool, runtime.handle().clone());
        runtime.block_on(store.migrate()).unwrap();

        let repo = RepositoryRef {
            id: RepositoryId::new(),
            owner_id: UserId::new(),
            full_name: "acme/api".to_string(),
        };
        store.upsert_repository(&repo).unwrap();
        let commit = CommitRecord {
            sha: "abc".to_string(),
            repository_id: repo.id,
            author_id: repo.owner_id,
            authored_at: Utc::now(),
            additions: 1,
            deletions: 0,
            files: vec!["a.rs".to_string()],
        };
        assert_eq!(store.store_commits(&[commit.clone()]).unwrap(), 1);
        assert_eq!(store.store_commits(&[commit]).unwrap(), 0);
        assert!(store.latest_commit_at(repo.id).unwrap().is_some());
    }
}
