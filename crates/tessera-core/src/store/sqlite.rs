// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.
//!
//! All kinds share the `state_entities` table, keyed by `(kind, id)`. Lease
//! and version are real columns so that every lease operation is a single
//! conditional `UPDATE`; the entity itself is stored as JSON in `payload` and
//! filters on other fields go through `json_extract`.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::query::QueryAs;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePoolOptions};
use tracing::debug;

use super::memory::DEFAULT_LEASE_DURATION;
use super::query::{QuerySpec, SortOrder};
use super::{Criterion, Operator, StateEntityStore};
use crate::clock::{Clock, SystemClock, duration_millis};
use crate::entity::{Lease, StatefulEntity};
use crate::error::{StoreError, StoreResult};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const SELECT_COLUMNS: &str =
    "id, payload, lease_holder, lease_acquired_at, lease_expires_at, version";

/// Columns that mirror entity fields; every other path is read from JSON.
const NATIVE_COLUMNS: &[&str] = &[
    "id",
    "state",
    "state_timestamp",
    "pending",
    "correlation_id",
    "version",
];

/// SQLite store for entities of type `E`.
pub struct SqliteStateEntityStore<E> {
    pool: SqlitePool,
    holder: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
    _kind: PhantomData<fn() -> E>,
}

impl<E> Clone for SqliteStateEntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            holder: self.holder.clone(),
            lease_duration: self.lease_duration,
            clock: self.clock.clone(),
            _kind: PhantomData,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    payload: String,
    lease_holder: Option<String>,
    lease_acquired_at: Option<i64>,
    lease_expires_at: Option<i64>,
    version: i64,
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    lease_holder: Option<String>,
    lease_expires_at: Option<i64>,
    version: i64,
}

/// Positional bind value for dynamically built statements.
#[derive(Debug, Clone)]
enum Bind {
    Text(String),
    Int(i64),
    Real(f64),
}

impl<E: StatefulEntity> SqliteStateEntityStore<E> {
    /// Wrap an already migrated pool.
    pub fn new(pool: SqlitePool, holder: impl Into<String>) -> Self {
        Self {
            pool,
            holder: holder.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            clock: Arc::new(SystemClock),
            _kind: PhantomData,
        }
    }

    /// Run the schema migrations on `pool`.
    pub async fn migrate(pool: &SqlitePool) -> StoreResult<()> {
        MIGRATOR.run(pool).await?;
        Ok(())
    }

    /// Connect to `url`, run migrations and return a store.
    ///
    /// In-memory URLs get a single connection, since every SQLite connection
    /// to `:memory:` opens a separate database.
    pub async fn connect(url: &str, holder: impl Into<String>) -> StoreResult<Self> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self::new(pool, holder))
    }

    /// Create the database file (and parent directories) if needed, connect
    /// and migrate.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteStateEntityStore::<ContractNegotiation>::from_path(
    ///     ".data/connector.db",
    ///     "replica-1",
    /// )
    /// .await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>, holder: impl Into<String>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, holder).await
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_holder(&self, holder: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            ..self.clone()
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode(row: EntityRow) -> StoreResult<E> {
        let mut entity: E = serde_json::from_str(&row.payload)?;
        let meta = entity.meta_mut();
        meta.id = row.id;
        meta.version = row.version;
        meta.lease = match (row.lease_holder, row.lease_acquired_at, row.lease_expires_at) {
            (Some(holder), Some(acquired_at), Some(expires_at)) => Some(Lease {
                holder,
                acquired_at,
                expires_at,
            }),
            _ => None,
        };
        Ok(entity)
    }

    fn lease_window(&self, now: i64) -> (i64, i64) {
        (now, now.saturating_add(duration_millis(self.lease_duration)))
    }

    async fn lease_row(&self, id: &str) -> StoreResult<Option<LeaseRow>> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT lease_holder, lease_expires_at, version
            FROM state_entities
            WHERE kind = ? AND id = ?
            "#,
        )
        .bind(E::KIND)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Lease the single row selected by `target_sql`, which must evaluate to
    /// an id and consume `target_binds`.
    async fn lease_one(&self, target_sql: &str, target_binds: Vec<Bind>) -> StoreResult<Option<E>> {
        let now = self.clock.now_millis();
        let (acquired_at, expires_at) = self.lease_window(now);
        let sql = format!(
            r#"
            UPDATE state_entities
            SET lease_holder = ?, lease_acquired_at = ?, lease_expires_at = ?
            WHERE kind = ? AND id = {target}
              AND (lease_holder IS NULL OR lease_holder = ? OR lease_expires_at <= ?)
            RETURNING {columns}
            "#,
            target = target_sql,
            columns = SELECT_COLUMNS,
        );
        let mut binds = vec![
            Bind::Text(self.holder.clone()),
            Bind::Int(acquired_at),
            Bind::Int(expires_at),
            Bind::Text(E::KIND.to_string()),
        ];
        binds.extend(target_binds);
        binds.push(Bind::Text(self.holder.clone()));
        binds.push(Bind::Int(now));

        let row = bind_query_as(sqlx::query_as::<_, EntityRow>(&sql), binds)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::decode).transpose()
    }

    fn blocked_error(id: &str, row: Option<LeaseRow>) -> StoreError {
        match row.and_then(|r| r.lease_holder) {
            Some(holder) => StoreError::AlreadyLeased {
                id: id.to_string(),
                holder,
            },
            None => StoreError::not_found(id),
        }
    }
}

#[async_trait]
impl<E: StatefulEntity> StateEntityStore<E> for SqliteStateEntityStore<E> {
    fn lease_holder(&self) -> &str {
        &self.holder
    }

    fn for_holder(&self, holder: &str) -> Arc<dyn StateEntityStore<E>> {
        Arc::new(self.with_holder(holder))
    }

    async fn save(&self, entity: &E) -> StoreResult<E> {
        let now = self.clock.now_millis();
        let expected_version = entity.meta().version;

        let mut stored = entity.clone();
        let meta = stored.meta_mut();
        meta.lease = None;
        meta.version = expected_version + 1;
        meta.updated_at = now;
        let meta = stored.meta();
        let payload = serde_json::to_string(&stored)?;

        let updated = sqlx::query(
            r#"
            UPDATE state_entities
            SET state = ?, state_timestamp = ?, pending = ?, correlation_id = ?,
                lease_holder = NULL, lease_acquired_at = NULL, lease_expires_at = NULL,
                version = ?, payload = ?
            WHERE kind = ? AND id = ? AND version = ?
              AND (lease_holder IS NULL OR lease_holder = ? OR lease_expires_at <= ?)
            "#,
        )
        .bind(meta.state)
        .bind(meta.state_timestamp)
        .bind(meta.pending)
        .bind(stored.correlation_id())
        .bind(meta.version)
        .bind(&payload)
        .bind(E::KIND)
        .bind(&meta.id)
        .bind(expected_version)
        .bind(&self.holder)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(stored);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO state_entities
                (kind, id, state, state_timestamp, pending, correlation_id, version, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (kind, id) DO NOTHING
            "#,
        )
        .bind(E::KIND)
        .bind(&meta.id)
        .bind(meta.state)
        .bind(meta.state_timestamp)
        .bind(meta.pending)
        .bind(stored.correlation_id())
        .bind(meta.version)
        .bind(&payload)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(stored);
        }

        let reason = match self.lease_row(&meta.id).await? {
            Some(row) if row.version != expected_version => format!(
                "expected version {}, found {}",
                expected_version, row.version
            ),
            Some(LeaseRow {
                lease_holder: Some(holder),
                lease_expires_at,
                ..
            }) => format!("leased by '{}' until {:?}", holder, lease_expires_at),
            _ => "row changed during save".to_string(),
        };
        Err(StoreError::ConcurrentModification {
            id: meta.id.clone(),
            reason,
        })
    }

    async fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> StoreResult<Vec<E>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_millis();
        let (acquired_at, expires_at) = self.lease_window(now);

        let mut binds = vec![
            Bind::Text(self.holder.clone()),
            Bind::Int(acquired_at),
            Bind::Int(expires_at),
            Bind::Text(E::KIND.to_string()),
            Bind::Text(E::KIND.to_string()),
            Bind::Int(now),
        ];
        let filter = filter_sql(criteria, &mut binds)?;
        binds.push(Bind::Int(i64::try_from(max).unwrap_or(i64::MAX)));

        let sql = format!(
            r#"
            UPDATE state_entities
            SET lease_holder = ?, lease_acquired_at = ?, lease_expires_at = ?
            WHERE kind = ? AND id IN (
                SELECT id FROM state_entities
                WHERE kind = ?
                  AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
                  {filter}
                ORDER BY state_timestamp ASC, id ASC
                LIMIT ?
            )
            RETURNING {columns}
            "#,
            filter = filter,
            columns = SELECT_COLUMNS,
        );

        let rows = bind_query_as(sqlx::query_as::<_, EntityRow>(&sql), binds)
            .fetch_all(&self.pool)
            .await?;
        let mut entities = rows
            .into_iter()
            .map(Self::decode)
            .collect::<StoreResult<Vec<E>>>()?;
        entities.sort_by(|a, b| {
            a.meta()
                .state_timestamp
                .cmp(&b.meta().state_timestamp)
                .then_with(|| a.id().cmp(b.id()))
        });
        debug!(kind = E::KIND, leased = entities.len(), "Leased entities for processing");
        Ok(entities)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>> {
        let sql = format!(
            "SELECT {} FROM state_entities WHERE kind = ? AND id = ?",
            SELECT_COLUMNS
        );
        let row = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(E::KIND)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::decode).transpose()
    }

    async fn find_by_id_and_lease(&self, id: &str) -> StoreResult<E> {
        match self.lease_one("?", vec![Bind::Text(id.to_string())]).await? {
            Some(entity) => Ok(entity),
            None => Err(Self::blocked_error(id, self.lease_row(id).await?)),
        }
    }

    async fn find_by_correlation_id_and_lease(&self, correlation_id: &str) -> StoreResult<E> {
        let target = r#"(
                SELECT id FROM state_entities
                WHERE kind = ? AND correlation_id = ?
                ORDER BY state_timestamp ASC
                LIMIT 1
            )"#;
        let binds = vec![
            Bind::Text(E::KIND.to_string()),
            Bind::Text(correlation_id.to_string()),
        ];
        if let Some(entity) = self.lease_one(target, binds).await? {
            return Ok(entity);
        }

        let holder: Option<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, lease_holder FROM state_entities
            WHERE kind = ? AND correlation_id = ?
            ORDER BY state_timestamp ASC
            LIMIT 1
            "#,
        )
        .bind(E::KIND)
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        match holder {
            Some((id, Some(holder))) => Err(StoreError::AlreadyLeased { id, holder }),
            _ => Err(StoreError::not_found(correlation_id)),
        }
    }

    async fn break_lease(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let cleared = sqlx::query(
            r#"
            UPDATE state_entities
            SET lease_holder = NULL, lease_acquired_at = NULL, lease_expires_at = NULL
            WHERE kind = ? AND id = ?
              AND (lease_holder IS NULL OR lease_holder = ? OR lease_expires_at <= ?)
            "#,
        )
        .bind(E::KIND)
        .bind(id)
        .bind(&self.holder)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if cleared == 0 {
            return Err(Self::blocked_error(id, self.lease_row(id).await?));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now_millis();
        let deleted = sqlx::query(
            r#"
            DELETE FROM state_entities
            WHERE kind = ? AND id = ?
              AND (lease_holder IS NULL OR lease_holder = ? OR lease_expires_at <= ?)
            "#,
        )
        .bind(E::KIND)
        .bind(id)
        .bind(&self.holder)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted == 0 {
            return match self.lease_row(id).await? {
                Some(row) => Err(StoreError::IllegalState {
                    id: id.to_string(),
                    reason: format!("leased by '{}'", row.lease_holder.unwrap_or_default()),
                }),
                None => Err(StoreError::not_found(id)),
            };
        }
        Ok(())
    }

    async fn find_all(&self, query: &QuerySpec) -> StoreResult<Vec<E>> {
        query.validate()?;
        let mut binds = vec![Bind::Text(E::KIND.to_string())];
        let filter = filter_sql(&query.filter, &mut binds)?;
        let order = match &query.sort_field {
            Some(field) => {
                let direction = match query.sort_order {
                    SortOrder::Asc => "ASC",
                    SortOrder::Desc => "DESC",
                };
                format!("{} {}, id ASC", column_for(field, &mut binds), direction)
            }
            None => "json_extract(payload, '$.created_at') ASC, id ASC".to_string(),
        };
        let limit = query
            .limit
            .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        binds.push(Bind::Int(limit));
        binds.push(Bind::Int(i64::try_from(query.offset).unwrap_or(i64::MAX)));

        let sql = format!(
            "SELECT {} FROM state_entities WHERE kind = ? {} ORDER BY {} LIMIT ? OFFSET ?",
            SELECT_COLUMNS, filter, order
        );
        let rows = bind_query_as(sqlx::query_as::<_, EntityRow>(&sql), binds)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::decode).collect()
    }
}

fn bind_query_as<'q, O>(
    mut query: QueryAs<'q, Sqlite, O, SqliteArguments<'q>>,
    binds: Vec<Bind>,
) -> QueryAs<'q, Sqlite, O, SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(value) => query.bind(value),
            Bind::Int(value) => query.bind(value),
            Bind::Real(value) => query.bind(value),
        };
    }
    query
}

/// SQL expression for a field path, pushing any bind it needs.
fn column_for(path: &str, binds: &mut Vec<Bind>) -> String {
    if NATIVE_COLUMNS.contains(&path) {
        return path.to_string();
    }
    let mut json_path = String::from("$");
    for segment in path.split('.') {
        if segment.chars().all(|c| c.is_ascii_digit()) {
            json_path.push_str(&format!("[{}]", segment));
        } else {
            json_path.push('.');
            json_path.push_str(segment);
        }
    }
    binds.push(Bind::Text(json_path));
    "json_extract(payload, ?)".to_string()
}

fn scalar(value: &Value) -> StoreResult<Bind> {
    match value {
        Value::Bool(b) => Ok(Bind::Int(i64::from(*b))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Bind::Int(i)),
            None => n
                .as_f64()
                .map(Bind::Real)
                .ok_or_else(|| StoreError::InvalidQuery(format!("unsupported number {}", n))),
        },
        Value::String(s) => Ok(Bind::Text(s.clone())),
        other => Err(StoreError::InvalidQuery(format!(
            "unsupported operand {}",
            other
        ))),
    }
}

/// Translate a LIKE pattern into GLOB syntax so matching stays case-sensitive.
fn like_to_glob(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => glob.push('*'),
            '_' => glob.push('?'),
            '*' => glob.push_str("[*]"),
            '?' => glob.push_str("[?]"),
            '[' => glob.push_str("[[]"),
            other => glob.push(other),
        }
    }
    glob
}

fn criterion_sql(criterion: &Criterion, binds: &mut Vec<Bind>) -> StoreResult<String> {
    criterion.validate()?;
    let path = criterion.operand_left.as_str();
    let right = &criterion.operand_right;

    if right.is_null() {
        return Ok(match criterion.operator {
            Operator::Eq => format!("{} IS NULL", column_for(path, binds)),
            Operator::NotEq => format!("{} IS NOT NULL", column_for(path, binds)),
            _ => "0".to_string(),
        });
    }

    let sql = match criterion.operator {
        Operator::In => {
            let values: Vec<&Value> = right
                .as_array()
                .map(|items| items.iter().filter(|v| !v.is_null()).collect())
                .unwrap_or_default();
            if values.is_empty() {
                return Ok("0".to_string());
            }
            let column = column_for(path, binds);
            for value in &values {
                binds.push(scalar(value)?);
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            format!("{} IN ({})", column, placeholders)
        }
        Operator::Like => {
            let column = column_for(path, binds);
            let pattern = right.as_str().unwrap_or_default();
            binds.push(Bind::Text(like_to_glob(pattern)));
            format!("{} GLOB ?", column)
        }
        Operator::NotEq => {
            let first = column_for(path, binds);
            let second = column_for(path, binds);
            binds.push(scalar(right)?);
            format!("({} IS NULL OR {} != ?)", first, second)
        }
        op => {
            let column = column_for(path, binds);
            binds.push(scalar(right)?);
            format!("{} {} ?", column, op.as_str())
        }
    };
    Ok(sql)
}

/// `AND`-joined filter fragment, empty when there are no criteria.
fn filter_sql(criteria: &[Criterion], binds: &mut Vec<Bind>) -> StoreResult<String> {
    let mut sql = String::new();
    for criterion in criteria {
        sql.push_str(" AND ");
        sql.push_str(&criterion_sql(criterion, binds)?);
    }
    Ok(sql)
}
