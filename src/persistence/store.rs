//! SQLite-based execution store
//!
//! Records are stored as JSON bodies next to the indexed columns the engine
//! queries by. Conditional updates compare the `version` column.

use super::{ExecutionStore, StoreError, StoreResult};
use crate::core::{Interrupt, InterruptFilter, NodeExecution, Plan, PlanExecution, Status};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// SQLite execution store
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Open (or create) a store; `:memory:` gives a private in-memory database
    pub async fn new(db_path: &str) -> Result<Self> {
        let in_memory = db_path == ":memory:";
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Open a store at a file path, creating parent directories
    pub async fn at_path(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create database directory {}", dir.display()))?;
        }
        let path = path
            .to_str()
            .with_context(|| format!("Database path is not valid UTF-8: {}", path.display()))?;
        Self::new(path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS plan_executions (
                id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS node_executions (
                id TEXT PRIMARY KEY,
                plan_execution_id TEXT NOT NULL,
                parent_id TEXT,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS callbacks (
                callback_id TEXT PRIMARY KEY,
                node_execution_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS interrupts (
                id TEXT PRIMARY KEY,
                plan_execution_id TEXT NOT NULL,
                state TEXT NOT NULL,
                interrupt_type TEXT NOT NULL,
                seq INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_plan_exec_created ON plan_executions(created_at);
            CREATE INDEX IF NOT EXISTS idx_node_plan ON node_executions(plan_execution_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_node_parent ON node_executions(parent_id);
            CREATE INDEX IF NOT EXISTS idx_node_status ON node_executions(status);
            CREATE INDEX IF NOT EXISTS idx_interrupt_plan ON interrupts(plan_execution_id, seq);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    fn micros(dt: DateTime<Utc>) -> i64 {
        dt.timestamp_micros()
    }

    fn encode<T: Serialize>(value: &T) -> StoreResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode<T: DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> StoreResult<T> {
        let body: String = row.get("body");
        Ok(serde_json::from_str(&body)?)
    }

    async fn exists(&self, table: &str, id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(&format!("SELECT 1 FROM {} WHERE id = ?1", table))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check record")?;
        Ok(row.is_some())
    }

    /// Turn a zero-row conditional update into the matching error
    async fn missed_update(&self, table: &str, entity: &'static str, id: Uuid) -> StoreError {
        match self.exists(table, id).await {
            Ok(true) => StoreError::Conflict { entity, id },
            Ok(false) => StoreError::NotFound { entity, id },
            Err(e) => e,
        }
    }

    async fn index_callbacks(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        execution: &NodeExecution,
    ) -> StoreResult<()> {
        for callback in execution
            .pending_callbacks
            .iter()
            .chain(execution.resolved_responses.keys())
        {
            sqlx::query("INSERT OR IGNORE INTO callbacks (callback_id, node_execution_id) VALUES (?1, ?2)")
                .bind(callback)
                .bind(execution.id.to_string())
                .execute(&mut **tx)
                .await
                .context("Failed to index callback")?;
        }
        Ok(())
    }

    async fn fetch_node_executions(&self, sql: &str, binds: &[String]) -> StoreResult<Vec<NodeExecution>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to query node executions")?;
        rows.iter().map(Self::decode).collect()
    }
}

#[async_trait::async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn save_plan(&self, plan: &Plan) -> StoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO plans (id, body) VALUES (?1, ?2)")
            .bind(&plan.id)
            .bind(Self::encode(plan)?)
            .execute(&self.pool)
            .await
            .context("Failed to save plan")?;
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> StoreResult<Option<Plan>> {
        let row = sqlx::query("SELECT body FROM plans WHERE id = ?1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load plan")?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn insert_plan_execution(&self, execution: &PlanExecution) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plan_executions (id, plan_id, status, created_at, version, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.plan_id)
        .bind(execution.status.to_string())
        .bind(Self::micros(execution.created_at))
        .bind(execution.version as i64)
        .bind(Self::encode(execution)?)
        .execute(&self.pool)
        .await
        .context("Failed to insert plan execution")?;
        Ok(())
    }

    async fn get_plan_execution(&self, id: Uuid) -> StoreResult<Option<PlanExecution>> {
        let row = sqlx::query("SELECT body FROM plan_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load plan execution")?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn update_plan_execution(&self, execution: &PlanExecution) -> StoreResult<PlanExecution> {
        let mut updated = execution.clone();
        updated.version += 1;

        let result = sqlx::query(
            r#"
            UPDATE plan_executions SET status = ?1, version = ?2, body = ?3
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(updated.status.to_string())
        .bind(updated.version as i64)
        .bind(Self::encode(&updated)?)
        .bind(execution.id.to_string())
        .bind(execution.version as i64)
        .execute(&self.pool)
        .await
        .context("Failed to update plan execution")?;

        if result.rows_affected() == 0 {
            return Err(self.missed_update("plan_executions", "plan execution", execution.id).await);
        }
        Ok(updated)
    }

    async fn list_plan_executions(&self, limit: usize) -> StoreResult<Vec<PlanExecution>> {
        let rows = sqlx::query("SELECT body FROM plan_executions ORDER BY created_at DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list plan executions")?;
        rows.iter().map(Self::decode).collect()
    }

    async fn insert_node_execution(&self, execution: &NodeExecution) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO node_executions (id, plan_execution_id, parent_id, status, created_at, version, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.plan_execution_id.to_string())
        .bind(execution.parent_id.map(|id| id.to_string()))
        .bind(execution.status.to_string())
        .bind(Self::micros(execution.created_at))
        .bind(execution.version as i64)
        .bind(Self::encode(execution)?)
        .execute(&mut *tx)
        .await
        .context("Failed to insert node execution")?;

        Self::index_callbacks(&mut tx, execution).await?;
        tx.commit().await.context("Failed to commit node execution")?;
        Ok(())
    }

    async fn get_node_execution(&self, id: Uuid) -> StoreResult<Option<NodeExecution>> {
        let row = sqlx::query("SELECT body FROM node_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load node execution")?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn update_node_execution(&self, execution: &NodeExecution) -> StoreResult<NodeExecution> {
        let mut updated = execution.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let result = sqlx::query(
            r#"
            UPDATE node_executions SET status = ?1, version = ?2, body = ?3
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(updated.status.to_string())
        .bind(updated.version as i64)
        .bind(Self::encode(&updated)?)
        .bind(execution.id.to_string())
        .bind(execution.version as i64)
        .execute(&mut *tx)
        .await
        .context("Failed to update node execution")?;

        if result.rows_affected() == 0 {
            tx.rollback().await.context("Failed to roll back")?;
            return Err(self.missed_update("node_executions", "node execution", execution.id).await);
        }

        Self::index_callbacks(&mut tx, &updated).await?;
        tx.commit().await.context("Failed to commit node execution")?;
        Ok(updated)
    }

    async fn find_node_execution_by_callback(&self, callback_id: &str) -> StoreResult<Option<NodeExecution>> {
        let row = sqlx::query(
            r#"
            SELECT n.body FROM callbacks c
            JOIN node_executions n ON n.id = c.node_execution_id
            WHERE c.callback_id = ?1
            "#,
        )
        .bind(callback_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up callback")?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn node_executions_for_plan(&self, plan_execution_id: Uuid) -> StoreResult<Vec<NodeExecution>> {
        self.fetch_node_executions(
            "SELECT body FROM node_executions WHERE plan_execution_id = ?1 ORDER BY created_at, rowid",
            &[plan_execution_id.to_string()],
        )
        .await
    }

    async fn node_executions_with_status(&self, statuses: &[Status]) -> StoreResult<Vec<NodeExecution>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT body FROM node_executions WHERE status IN ({}) ORDER BY created_at, rowid",
            placeholders
        );
        let binds: Vec<String> = statuses.iter().map(Status::to_string).collect();
        self.fetch_node_executions(&sql, &binds).await
    }

    async fn children_of(&self, parent_id: Uuid) -> StoreResult<Vec<NodeExecution>> {
        self.fetch_node_executions(
            "SELECT body FROM node_executions WHERE parent_id = ?1 ORDER BY created_at, rowid",
            &[parent_id.to_string()],
        )
        .await
    }

    async fn insert_interrupt(&self, interrupt: &Interrupt) -> StoreResult<Interrupt> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM interrupts WHERE plan_execution_id = ?1")
            .bind(interrupt.plan_execution_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context("Failed to read interrupt sequence")?;

        let mut stored = interrupt.clone();
        stored.seq = row.get::<i64, _>("seq") as u64 + 1;

        sqlx::query(
            r#"
            INSERT INTO interrupts (id, plan_execution_id, state, interrupt_type, seq, created_at, version, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(stored.id.to_string())
        .bind(stored.plan_execution_id.to_string())
        .bind(stored.state.to_string())
        .bind(stored.interrupt_type.to_string())
        .bind(stored.seq as i64)
        .bind(Self::micros(stored.created_at))
        .bind(stored.version as i64)
        .bind(Self::encode(&stored)?)
        .execute(&mut *tx)
        .await
        .context("Failed to insert interrupt")?;

        tx.commit().await.context("Failed to commit interrupt")?;
        Ok(stored)
    }

    async fn get_interrupt(&self, id: Uuid) -> StoreResult<Option<Interrupt>> {
        let row = sqlx::query("SELECT body FROM interrupts WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load interrupt")?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn update_interrupt(&self, interrupt: &Interrupt) -> StoreResult<Interrupt> {
        let mut updated = interrupt.clone();
        updated.version += 1;

        let result = sqlx::query(
            r#"
            UPDATE interrupts SET state = ?1, version = ?2, body = ?3
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(updated.state.to_string())
        .bind(updated.version as i64)
        .bind(Self::encode(&updated)?)
        .bind(interrupt.id.to_string())
        .bind(interrupt.version as i64)
        .execute(&self.pool)
        .await
        .context("Failed to update interrupt")?;

        if result.rows_affected() == 0 {
            return Err(self.missed_update("interrupts", "interrupt", interrupt.id).await);
        }
        Ok(updated)
    }

    async fn interrupts_for_plan(
        &self,
        plan_execution_id: Uuid,
        filter: &InterruptFilter,
    ) -> StoreResult<Vec<Interrupt>> {
        let rows = sqlx::query("SELECT body FROM interrupts WHERE plan_execution_id = ?1 ORDER BY seq DESC")
            .bind(plan_execution_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list interrupts")?;

        let interrupts = rows
            .iter()
            .map(Self::decode::<Interrupt>)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(interrupts.into_iter().filter(|i| filter.matches(i)).collect())
    }
}
