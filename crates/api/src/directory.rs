//! Operational store access: client rows, doula assignments and the
//! identity cache.

use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value};
use sokana_contracts::fields::IdentityCacheUpdate;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("operational store unavailable")]
    Unavailable,
    #[error("operational store operation timed out")]
    Timeout,
    #[error("operational store query failed")]
    Query,
}

impl From<sqlx::Error> for DirectoryError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DirectoryError::Unavailable
            }
            _ => DirectoryError::Query,
        }
    }
}

pub trait ClientDirectory: Clone + Send + Sync + 'static {
    fn client_exists(
        &self,
        client_id: Uuid,
    ) -> impl Future<Output = Result<bool, DirectoryError>> + Send;

    /// The raw operational row, identity cache columns included.
    fn load_client(
        &self,
        client_id: Uuid,
    ) -> impl Future<Output = Result<Option<Map<String, Value>>, DirectoryError>> + Send;

    fn assigned_client_ids(
        &self,
        doula_id: &str,
    ) -> impl Future<Output = Result<Vec<Uuid>, DirectoryError>> + Send;

    /// Writes only the slots present in `update`; other cached columns are
    /// left as they are.
    fn update_identity_cache(
        &self,
        client_id: Uuid,
        update: &IdentityCacheUpdate,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<(), DirectoryError>> + Send;
}

#[derive(Debug, Clone)]
pub struct PgClientDirectory {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgClientDirectory {
    pub async fn connect(db_url: &str, query_timeout: Duration) -> Result<Self, DirectoryError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| DirectoryError::Timeout)??;

        Ok(Self::from_pool(pool, query_timeout))
    }

    pub fn from_pool(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl ClientDirectory for PgClientDirectory {
    async fn client_exists(&self, client_id: Uuid) -> Result<bool, DirectoryError> {
        let row = tokio::time::timeout(
            self.query_timeout,
            sqlx::query("SELECT EXISTS (SELECT 1 FROM clients WHERE id = $1) AS present")
                .bind(client_id)
                .fetch_one(&self.pool),
        )
        .await
        .map_err(|_| DirectoryError::Timeout)??;

        Ok(row.try_get::<bool, _>("present")?)
    }

    async fn load_client(
        &self,
        client_id: Uuid,
    ) -> Result<Option<Map<String, Value>>, DirectoryError> {
        let row = tokio::time::timeout(
            self.query_timeout,
            sqlx::query("SELECT to_jsonb(c) AS record FROM clients c WHERE c.id = $1")
                .bind(client_id)
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| DirectoryError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };
        match row.try_get::<Value, _>("record")? {
            Value::Object(record) => Ok(Some(record)),
            _ => Err(DirectoryError::Query),
        }
    }

    async fn assigned_client_ids(&self, doula_id: &str) -> Result<Vec<Uuid>, DirectoryError> {
        let rows = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "SELECT client_id FROM doula_assignments WHERE doula_id = $1 ORDER BY client_id",
            )
            .bind(doula_id)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| DirectoryError::Timeout)??;

        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("client_id").map_err(DirectoryError::from))
            .collect()
    }

    async fn update_identity_cache(
        &self,
        client_id: Uuid,
        update: &IdentityCacheUpdate,
    ) -> Result<(), DirectoryError> {
        let slot = |value: &Option<Option<String>>| (value.is_some(), value.clone().flatten());
        let (set_first, first_name) = slot(&update.first_name);
        let (set_last, last_name) = slot(&update.last_name);
        let (set_email, email) = slot(&update.email);
        let (set_phone, phone_number) = slot(&update.phone_number);

        tokio::time::timeout(
            self.query_timeout,
            sqlx::query(
                "UPDATE clients SET \
                 first_name = CASE WHEN $2 THEN $3 ELSE first_name END, \
                 last_name = CASE WHEN $4 THEN $5 ELSE last_name END, \
                 email = CASE WHEN $6 THEN $7 ELSE email END, \
                 phone_number = CASE WHEN $8 THEN $9 ELSE phone_number END, \
                 updated_at = now() \
                 WHERE id = $1",
            )
            .bind(client_id)
            .bind(set_first)
            .bind(first_name)
            .bind(set_last)
            .bind(last_name)
            .bind(set_email)
            .bind(email)
            .bind(set_phone)
            .bind(phone_number)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| DirectoryError::Timeout)??;

        Ok(())
    }

    async fn ping(&self) -> Result<(), DirectoryError> {
        tokio::time::timeout(
            self.query_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| DirectoryError::Timeout)??;
        Ok(())
    }
}
