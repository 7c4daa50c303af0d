use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable per-entity counters.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Add each delta to its entity's counter, all in one write. Entities
    /// without a row are ignored.
    async fn increment(&self, deltas: &HashMap<String, i64>) -> Result<(), StoreError>;
}

pub struct PgCounterStore {
    pool: PgPool,
    query: String,
}

impl PgCounterStore {
    /// Identifiers are interpolated into the statement and must already be
    /// validated, see `Config::validate`.
    pub fn new(pool: PgPool, table: &str, column: &str, id_column: &str, id_type: &str) -> Self {
        Self {
            pool,
            query: increment_query(table, column, id_column, id_type),
        }
    }
}

fn increment_query(table: &str, column: &str, id_column: &str, id_type: &str) -> String {
    format!(
        "UPDATE {table} AS t SET {column} = t.{column} + d.delta \
         FROM UNNEST($1::text[], $2::bigint[]) AS d(id, delta) \
         WHERE t.{id_column} = d.id::{id_type}"
    )
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment(&self, deltas: &HashMap<String, i64>) -> Result<(), StoreError> {
        if deltas.is_empty() {
            return Ok(());
        }

        let (ids, amounts): (Vec<String>, Vec<i64>) = deltas
            .iter()
            .map(|(id, delta)| (id.clone(), *delta))
            .unzip();

        let result = sqlx::query(&self.query)
            .bind(ids)
            .bind(amounts)
            .execute(&self.pool)
            .await?;

        debug!(
            entities = deltas.len(),
            rows = result.rows_affected(),
            "applied view increments"
        );
        Ok(())
    }
}
