use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ActivityAction, ActivityId, LapId, StopwatchId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// Persisted stopwatch row. Exactly one of the two time fields is
/// authoritative at any instant: `start_time` while running, `elapsed_time`
/// while paused.
#[derive(Debug, Clone)]
pub struct StoredStopwatch {
    pub stopwatch_id: StopwatchId,
    pub is_running: bool,
    pub start_time: DateTime<Utc>,
    pub elapsed_time: i64,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct StoredLap {
    pub lap_id: LapId,
    pub time: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredActivity {
    pub activity_id: ActivityId,
    pub action: ActivityAction,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Loads the stopwatch row, inserting the paused default first if the key
    /// has never been seen. Concurrent callers race harmlessly: the insert is
    /// a no-op once the row exists.
    pub async fn ensure_stopwatch(&self, stopwatch_id: &StopwatchId) -> Result<StoredStopwatch> {
        sqlx::query(
            "INSERT INTO stopwatches (id, start_time) VALUES (?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(stopwatch_id.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.load_stopwatch(stopwatch_id)
            .await?
            .context("stopwatch row missing after ensure")
    }

    pub async fn load_stopwatch(
        &self,
        stopwatch_id: &StopwatchId,
    ) -> Result<Option<StoredStopwatch>> {
        let row = sqlx::query(
            "SELECT id, is_running, start_time, elapsed_time, version
             FROM stopwatches WHERE id = ?",
        )
        .bind(stopwatch_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredStopwatch {
            stopwatch_id: StopwatchId::new(r.get::<String, _>(0)),
            is_running: r.get::<bool, _>(1),
            start_time: r.get::<DateTime<Utc>, _>(2),
            elapsed_time: r.get::<i64, _>(3),
            version: r.get::<i64, _>(4),
        }))
    }

    /// Writes the running/paused state, guarded by the version read alongside
    /// the old state. Returns false without touching the row when another
    /// writer got there first.
    pub async fn write_state(
        &self,
        stopwatch_id: &StopwatchId,
        is_running: bool,
        start_time: DateTime<Utc>,
        elapsed_time: i64,
        expected_version: i64,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE stopwatches
             SET is_running = ?, start_time = ?, elapsed_time = ?, version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(is_running)
        .bind(start_time)
        .bind(elapsed_time)
        .bind(stopwatch_id.as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    pub async fn insert_lap(&self, stopwatch_id: &StopwatchId, time: i64) -> Result<LapId> {
        let rec = sqlx::query(
            "INSERT INTO laps (stopwatch_id, time, created_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(stopwatch_id.as_str())
        .bind(time)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(LapId(rec.get::<i64, _>(0)))
    }

    /// Laps newest first, the order the snapshot carries them.
    pub async fn list_laps(&self, stopwatch_id: &StopwatchId) -> Result<Vec<StoredLap>> {
        let rows = sqlx::query(
            "SELECT id, time, created_at FROM laps
             WHERE stopwatch_id = ?
             ORDER BY id DESC",
        )
        .bind(stopwatch_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredLap {
                lap_id: LapId(r.get::<i64, _>(0)),
                time: r.get::<i64, _>(1),
                created_at: r.get::<DateTime<Utc>, _>(2),
            })
            .collect())
    }

    /// Deletes all laps and zeroes the state as one transaction. A crash
    /// mid-reset never leaves laps orphaned against a zeroed row. Returns
    /// false and rolls back on a version mismatch.
    pub async fn reset_stopwatch(
        &self,
        stopwatch_id: &StopwatchId,
        now: DateTime<Utc>,
        expected_version: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM laps WHERE stopwatch_id = ?")
            .bind(stopwatch_id.as_str())
            .execute(&mut *tx)
            .await?;

        let updated = sqlx::query(
            "UPDATE stopwatches
             SET is_running = 0, start_time = ?, elapsed_time = 0, version = version + 1
             WHERE id = ? AND version = ?",
        )
        .bind(now)
        .bind(stopwatch_id.as_str())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn append_activity(
        &self,
        stopwatch_id: &StopwatchId,
        action: ActivityAction,
        details: Option<&str>,
    ) -> Result<ActivityId> {
        let rec = sqlx::query(
            "INSERT INTO activity_log (stopwatch_id, action, details, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(stopwatch_id.as_str())
        .bind(action.as_str())
        .bind(details)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(ActivityId(rec.get::<i64, _>(0)))
    }

    /// Activity entries newest first. The log survives resets; it is history,
    /// not state.
    pub async fn list_activity(&self, stopwatch_id: &StopwatchId) -> Result<Vec<StoredActivity>> {
        let rows = sqlx::query(
            "SELECT id, action, details, created_at FROM activity_log
             WHERE stopwatch_id = ?
             ORDER BY id DESC",
        )
        .bind(stopwatch_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for r in rows {
            let raw_action = r.get::<String, _>(1);
            let action = ActivityAction::from_str(&raw_action)
                .with_context(|| format!("unknown activity action in log: {raw_action}"))?;
            entries.push(StoredActivity {
                activity_id: ActivityId(r.get::<i64, _>(0)),
                action,
                details: r.get::<Option<String>, _>(2),
                created_at: r.get::<DateTime<Utc>, _>(3),
            });
        }
        Ok(entries)
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
