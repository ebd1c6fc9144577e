//! PostgreSQL-backed repository.
//!
//! Lock mutations are single conditional statements so two nodes can never
//! both win a claim; terminal status writes are guarded on the row still
//! being in `started`.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::config::RetentionPolicy;
use crate::model::{
    MasterLock, RunStatus, Schedule, ScheduleLogEntry, ScheduleRun, LOCK_VALIDITY_SECS,
};

use super::ScheduleRepository;

/// Repository backed by a PostgreSQL pool.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn stale_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(LOCK_VALIDITY_SECS)
}

#[async_trait]
impl ScheduleRepository for PostgresRepository {
    async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>> {
        let schedule = sqlx::query_as::<_, Schedule>(
            r#"
            SELECT name, active, overridden_cron, next_run, run_once, last_updated
            FROM schedule
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(schedule)
    }

    async fn upsert_schedule(
        &self,
        name: &str,
        default_cron: &str,
        initial_next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO schedule (name, active, overridden_cron, next_run, run_once, last_updated)
            VALUES ($1, TRUE, NULL, $2, FALSE, NOW())
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(initial_next_run)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::debug!(task = %name, cron = %default_cron, "created schedule row");
        }
        Ok(())
    }

    async fn set_active(&self, name: &str, active: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE schedule SET active = $2, last_updated = NOW() WHERE name = $1",
        )
        .bind(name)
        .bind(active)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("unknown schedule '{name}'");
        }
        Ok(())
    }

    async fn set_run_once(&self, name: &str, run_once: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE schedule SET run_once = $2, last_updated = NOW() WHERE name = $1",
        )
        .bind(name)
        .bind(run_once)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("unknown schedule '{name}'");
        }
        Ok(())
    }

    async fn update_next_run(
        &self,
        name: &str,
        overridden_cron: Option<&str>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE schedule
            SET overridden_cron = $2, next_run = $3, last_updated = NOW()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(overridden_cron)
        .bind(next_run)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("unknown schedule '{name}'");
        }
        Ok(())
    }

    async fn add_schedule_run(
        &self,
        name: &str,
        hostname: &str,
        run_start: DateTime<Utc>,
        initial_msg: &str,
    ) -> Result<i64> {
        let run_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO schedule_run
                (schedule_name, hostname, status, status_msg, run_start, status_time)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING run_id
            "#,
        )
        .bind(name)
        .bind(hostname)
        .bind(RunStatus::Started)
        .bind(initial_msg)
        .bind(run_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(run_id)
    }

    async fn set_status(
        &self,
        run_id: i64,
        status: RunStatus,
        status_time: DateTime<Utc>,
        msg: &str,
        stacktrace: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_run
            SET status = $2, status_msg = $3, status_stacktrace = $4, status_time = $5
            WHERE run_id = $1 AND status = $6
            "#,
        )
        .bind(run_id)
        .bind(status)
        .bind(msg)
        .bind(stacktrace)
        .bind(status_time)
        .bind(RunStatus::Started)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("run {run_id} not found or already terminal");
        }
        Ok(())
    }

    async fn add_log_entry(
        &self,
        run_id: i64,
        log_time: DateTime<Utc>,
        message: &str,
        stacktrace: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedule_log (run_id, log_time, message, stacktrace)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run_id)
        .bind(log_time)
        .bind(message)
        .bind(stacktrace)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_log_entries(&self, run_id: i64) -> Result<Vec<ScheduleLogEntry>> {
        let entries = sqlx::query_as::<_, ScheduleLogEntry>(
            r#"
            SELECT log_id, run_id, log_time, message, stacktrace
            FROM schedule_log
            WHERE run_id = $1
            ORDER BY log_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn get_last_run_for_schedule(&self, name: &str) -> Result<Option<ScheduleRun>> {
        let run = sqlx::query_as::<_, ScheduleRun>(
            r#"
            SELECT run_id, schedule_name, hostname, status, status_msg, status_stacktrace,
                   run_start, status_time
            FROM schedule_run
            WHERE schedule_name = $1
            ORDER BY run_start DESC, run_id DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    async fn get_schedule_runs_between(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRun>> {
        let runs = sqlx::query_as::<_, ScheduleRun>(
            r#"
            SELECT run_id, schedule_name, hostname, status, status_msg, status_stacktrace,
                   run_start, status_time
            FROM schedule_run
            WHERE schedule_name = $1 AND run_start >= $2 AND run_start <= $3
            ORDER BY run_start, run_id
            "#,
        )
        .bind(name)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    async fn get_schedule_run(&self, run_id: i64) -> Result<Option<ScheduleRun>> {
        let run = sqlx::query_as::<_, ScheduleRun>(
            r#"
            SELECT run_id, schedule_name, hostname, status, status_msg, status_stacktrace,
                   run_start, status_time
            FROM schedule_run
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    async fn count_runs_for_schedule(&self, name: &str) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM schedule_run WHERE schedule_name = $1",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn execute_retention_policy(
        &self,
        name: &str,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let horizon = now - policy.max_age;

        // Runs past the age horizon or beyond the newest-first count cap.
        let doomed = r#"
            SELECT run_id FROM schedule_run
            WHERE schedule_name = $1 AND run_start < $2
            UNION
            SELECT run_id FROM (
                SELECT run_id FROM schedule_run
                WHERE schedule_name = $1
                ORDER BY run_start DESC, run_id DESC
                OFFSET $3
            ) AS overflow
        "#;

        if policy.delete_logs {
            sqlx::query(&format!(
                "DELETE FROM schedule_log WHERE run_id IN ({doomed})"
            ))
            .bind(name)
            .bind(horizon)
            .bind(policy.max_runs)
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(&format!(
            "DELETE FROM schedule_run WHERE run_id IN ({doomed})"
        ))
        .bind(name)
        .bind(horizon)
        .bind(policy.max_runs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_all_schedules(&self) -> Result<HashMap<String, Schedule>> {
        let schedules = sqlx::query_as::<_, Schedule>(
            r#"
            SELECT name, active, overridden_cron, next_run, run_once, last_updated
            FROM schedule
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(schedules
            .into_iter()
            .map(|schedule| (schedule.name.clone(), schedule))
            .collect())
    }

    async fn try_acquire_lock(
        &self,
        lock_name: &str,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO master_lock (lock_name, node_name, lock_taken_time, lock_last_updated_time)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (lock_name) DO UPDATE
            SET node_name = EXCLUDED.node_name,
                lock_taken_time = EXCLUDED.lock_taken_time,
                lock_last_updated_time = EXCLUDED.lock_last_updated_time
            WHERE master_lock.lock_last_updated_time < $4
            "#,
        )
        .bind(lock_name)
        .bind(node_name)
        .bind(now)
        .bind(stale_cutoff(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn keep_lock(
        &self,
        lock_name: &str,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE master_lock
            SET lock_last_updated_time = $3
            WHERE lock_name = $1 AND node_name = $2 AND lock_last_updated_time >= $4
            "#,
        )
        .bind(lock_name)
        .bind(node_name)
        .bind(now)
        .bind(stale_cutoff(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_lock(&self, lock_name: &str) -> Result<Option<MasterLock>> {
        let lock = sqlx::query_as::<_, MasterLock>(
            r#"
            SELECT lock_name, node_name, lock_taken_time, lock_last_updated_time
            FROM master_lock
            WHERE lock_name = $1
            "#,
        )
        .bind(lock_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(lock)
    }

    async fn release_lock(&self, lock_name: &str, node_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM master_lock WHERE lock_name = $1 AND node_name = $2")
            .bind(lock_name)
            .bind(node_name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
