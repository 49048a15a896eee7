use std::time::Duration;

use serde_json::Value;
use sokana_contracts::PhiData;
use sokana_contracts::fields::{ClientField, FieldKind, PhiPatch, PhiPartition};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::{PhiPool, PhiStoreError};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Reads and writes the three PHI partitions. Every call is bounded by
/// `query_timeout` and selects explicit columns only.
#[derive(Debug, Clone)]
pub struct PhiRepository {
    pool: PhiPool,
    query_timeout: Duration,
}

impl PhiRepository {
    pub fn new(pool: PhiPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    pub fn pool(&self) -> &PhiPool {
        &self.pool
    }

    /// Merged PHI for one client. Null columns and missing partition rows
    /// are omitted, so an unknown client reads as `{}`.
    pub async fn get_phi_by_client_id(&self, client_id: Uuid) -> Result<PhiData, PhiStoreError> {
        let pool = self.pool.get().await?;

        let read = async {
            let (clinical, demographic, pregnancy) = tokio::try_join!(
                fetch_partition(pool, PhiPartition::Clinical, client_id),
                fetch_partition(pool, PhiPartition::Demographic, client_id),
                fetch_partition(pool, PhiPartition::PregnancyIdentity, client_id),
            )?;

            let mut merged = PhiData::new();
            for part in [clinical, demographic, pregnancy] {
                merged.extend(part);
            }
            Ok::<_, PhiStoreError>(merged)
        };

        tokio::time::timeout(self.query_timeout, read)
            .await
            .map_err(|_| PhiStoreError::Timeout)?
    }

    /// Upserts the patch into whichever partitions it touches, in one
    /// transaction. Returns the stored values of the written fields.
    pub async fn update_phi(
        &self,
        client_id: Uuid,
        patch: &PhiPatch,
    ) -> Result<PhiData, PhiStoreError> {
        let pool = self.pool.get().await?;

        let write = async {
            let mut tx = pool.begin().await?;

            sqlx::query(
                "INSERT INTO phi_clients (client_id) VALUES ($1) ON CONFLICT (client_id) DO NOTHING",
            )
            .bind(client_id)
            .execute(&mut *tx)
            .await?;

            let mut written = PhiData::new();
            for partition in PhiPartition::ALL {
                let values = patch.partition(partition);
                if values.is_empty() {
                    continue;
                }

                let fields: Vec<ClientField> = values.iter().map(|(field, _)| *field).collect();
                let sql = upsert_sql(partition, &fields);
                let mut query = sqlx::query(&sql).bind(client_id);
                for (field, value) in &values {
                    query = bind_value(query, *field, value)?;
                }

                let row = query.fetch_one(&mut *tx).await?;
                written.extend(row_to_phi(&row, fields.iter().copied())?);
            }

            tx.commit().await?;
            Ok::<_, PhiStoreError>(written)
        };

        tokio::time::timeout(self.query_timeout, write)
            .await
            .map_err(|_| PhiStoreError::Timeout)?
    }
}

async fn fetch_partition(
    pool: &PgPool,
    partition: PhiPartition,
    client_id: Uuid,
) -> Result<PhiData, PhiStoreError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE client_id = $1",
        select_list(partition.fields()),
        partition.table()
    );

    let row = sqlx::query(&sql)
        .bind(client_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => row_to_phi(&row, partition.fields()),
        None => Ok(PhiData::new()),
    }
}

/// Dates come back as `YYYY-MM-DD` text so the wire shape matches what
/// callers send.
fn select_list(fields: impl Iterator<Item = ClientField>) -> String {
    fields
        .map(|field| match field.kind() {
            FieldKind::Date => format!("{0}::text AS {0}", field.name()),
            _ => field.name().to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn upsert_sql(partition: PhiPartition, fields: &[ClientField]) -> String {
    let columns = fields
        .iter()
        .map(|field| field.name())
        .collect::<Vec<_>>()
        .join(", ");

    let placeholders = fields
        .iter()
        .enumerate()
        .map(|(idx, field)| match field.kind() {
            FieldKind::Date => format!("${}::date", idx + 2),
            _ => format!("${}", idx + 2),
        })
        .collect::<Vec<_>>()
        .join(", ");

    let assignments = fields
        .iter()
        .map(|field| format!("{0} = EXCLUDED.{0}", field.name()))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {table} (client_id, {columns}) VALUES ($1, {placeholders}) \
         ON CONFLICT (client_id) DO UPDATE SET {assignments}, updated_at = now() \
         RETURNING {returning}",
        table = partition.table(),
        returning = select_list(fields.iter().copied()),
    )
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    field: ClientField,
    value: &Value,
) -> Result<Query<'q, Postgres, PgArguments>, PhiStoreError> {
    if !field.accepts(value) {
        return Err(PhiStoreError::InvalidValue {
            field: field.name(),
        });
    }

    Ok(match field.kind() {
        FieldKind::Text | FieldKind::Date => query.bind(value.as_str().map(str::to_string)),
        FieldKind::Integer => query.bind(value.as_i64().and_then(|n| i32::try_from(n).ok())),
        FieldKind::Boolean => query.bind(value.as_bool()),
    })
}

fn row_to_phi(
    row: &PgRow,
    fields: impl Iterator<Item = ClientField>,
) -> Result<PhiData, PhiStoreError> {
    let mut out = PhiData::new();
    for field in fields {
        let name = field.name();
        let value = match field.kind() {
            FieldKind::Text | FieldKind::Date => {
                row.try_get::<Option<String>, _>(name)?.map(Value::String)
            }
            FieldKind::Integer => row.try_get::<Option<i32>, _>(name)?.map(Value::from),
            FieldKind::Boolean => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
        };
        if let Some(value) = value {
            out.insert(name.to_string(), value);
        }
    }
    Ok(out)
}
