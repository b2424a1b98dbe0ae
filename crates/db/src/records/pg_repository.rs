use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use paysync_common::error::{PaysyncError, PaysyncResult};
use paysync_common::EntityKind;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::records::models::{NormalizedRecord, UpsertOutcome};
use crate::records::repositories::RecordRepository;

const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Clone)]
pub struct PgRecordRepository {
    pool: PgPool,
}

impl PgRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn reference_columns(kind: EntityKind) -> Vec<&'static str> {
        kind.references().iter().map(|r| r.column).collect()
    }

    /// Column list and `$n` placeholders shared by upsert and placeholder insert.
    fn insert_head(kind: EntityKind) -> String {
        let refs = Self::reference_columns(kind);
        let mut columns = vec!["id"];
        columns.extend(refs.iter().copied());
        columns.extend(["fields", "raw", "is_placeholder"]);
        let params: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        format!(
            "insert into {} as t ({}) values ({})",
            kind.table(),
            columns.join(", "),
            params.join(", ")
        )
    }

    /// Upsert statement for `kind`. Non-null incoming fields win, references are
    /// coalesced, and the `where` clause turns a no-op merge into zero rows.
    pub(crate) fn upsert_sql(kind: EntityKind) -> String {
        let refs = Self::reference_columns(kind);

        let mut sets: Vec<String> = refs
            .iter()
            .map(|c| format!("{c} = coalesce(excluded.{c}, t.{c})"))
            .collect();
        sets.push("fields = t.fields || jsonb_strip_nulls(excluded.fields)".to_string());
        sets.push("raw = coalesce(excluded.raw, t.raw)".to_string());
        sets.push("is_placeholder = t.is_placeholder and excluded.is_placeholder".to_string());
        sets.push("updated_at = now()".to_string());

        let mut changed: Vec<String> = refs
            .iter()
            .map(|c| format!("t.{c} is distinct from coalesce(excluded.{c}, t.{c})"))
            .collect();
        changed.push("t.fields is distinct from (t.fields || jsonb_strip_nulls(excluded.fields))".to_string());
        changed.push("t.raw is distinct from coalesce(excluded.raw, t.raw)".to_string());
        changed.push(
            "t.is_placeholder is distinct from (t.is_placeholder and excluded.is_placeholder)"
                .to_string(),
        );

        format!(
            "{} on conflict (id) do update set {} where {} returning (xmax = 0) as inserted",
            Self::insert_head(kind),
            sets.join(", "),
            changed.join(" or ")
        )
    }

    pub(crate) fn placeholder_sql(kind: EntityKind) -> String {
        format!("{} on conflict (id) do nothing", Self::insert_head(kind))
    }

    fn select_sql(kind: EntityKind) -> String {
        let mut columns = vec!["id"];
        columns.extend(Self::reference_columns(kind));
        columns.extend(["fields", "raw", "is_placeholder"]);
        format!(
            "select {} from {} where id = $1",
            columns.join(", "),
            kind.table()
        )
    }

    fn bind_record<'q>(
        sql: &'q str,
        record: &'q NormalizedRecord,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        let mut query = sqlx::query(sql).bind(&record.id);
        for reference in record.kind.references() {
            query = query.bind(record.references.get(reference.column));
        }
        query
            .bind(Value::Object(record.fields.clone()))
            .bind(&record.raw)
            .bind(record.is_placeholder)
    }

    fn map_row(kind: EntityKind, row: PgRow) -> PaysyncResult<NormalizedRecord> {
        let mut references = BTreeMap::new();
        for reference in kind.references() {
            let value: Option<String> = row
                .try_get(reference.column)
                .map_err(|e| PaysyncError::Database(e.to_string()))?;
            if let Some(v) = value {
                references.insert(reference.column.to_string(), v);
            }
        }

        let fields: Value = row.get("fields");
        Ok(NormalizedRecord {
            kind,
            id: row.get("id"),
            references,
            fields: match fields {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
            raw: row.get("raw"),
            is_placeholder: row.get("is_placeholder"),
        })
    }
}

/// Classify a sqlx error into the destination error taxonomy.
pub fn map_db_error(e: sqlx::Error) -> PaysyncError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
            PaysyncError::MissingParent(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PaysyncError::DatabaseUnavailable(e.to_string())
        }
        _ => PaysyncError::Database(e.to_string()),
    }
}

#[async_trait]
impl RecordRepository for PgRecordRepository {
    async fn upsert(&self, record: &NormalizedRecord) -> PaysyncResult<UpsertOutcome> {
        let sql = Self::upsert_sql(record.kind);
        let row = Self::bind_record(&sql, record)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;

        Ok(match row {
            None => UpsertOutcome::Unchanged,
            Some(r) if r.get::<bool, _>("inserted") => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
        })
    }

    async fn insert_placeholder(&self, record: &NormalizedRecord) -> PaysyncResult<bool> {
        let sql = Self::placeholder_sql(record.kind);
        let result = Self::bind_record(&sql, record)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn existing_ids(&self, kind: EntityKind, ids: &[String]) -> PaysyncResult<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(&format!(
            "select id from {} where id = any($1)",
            kind.table()
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }

    async fn get(&self, kind: EntityKind, id: &str) -> PaysyncResult<Option<NormalizedRecord>> {
        let row = sqlx::query(&Self::select_sql(kind))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;

        match row {
            Some(r) => Ok(Some(Self::map_row(kind, r)?)),
            None => Ok(None),
        }
    }

    async fn count(&self, kind: EntityKind) -> PaysyncResult<u64> {
        let row = sqlx::query(&format!("select count(*) as cnt from {}", kind.table()))
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;
    use crate::schema::ensure_schema;
    use serde_json::{json, Map};

    #[test]
    fn upsert_sql_coalesces_references() {
        let sql = PgRecordRepository::upsert_sql(EntityKind::Subscription);
        assert!(sql.starts_with(
            "insert into billing_subscriptions as t (id, customer_id, plan_id, fields, raw, is_placeholder) values ($1, $2, $3, $4, $5, $6)"
        ));
        assert!(sql.contains("customer_id = coalesce(excluded.customer_id, t.customer_id)"));
        assert!(sql.contains("plan_id = coalesce(excluded.plan_id, t.plan_id)"));
        assert!(sql.ends_with("returning (xmax = 0) as inserted"));
    }

    #[test]
    fn upsert_sql_without_references() {
        let sql = PgRecordRepository::upsert_sql(EntityKind::Transfer);
        assert!(sql.contains("(id, fields, raw, is_placeholder) values ($1, $2, $3, $4)"));
        assert!(!sql.contains("coalesce(excluded.customer_id"));
    }

    #[test]
    fn placeholder_sql_does_nothing_on_conflict() {
        let sql = PgRecordRepository::placeholder_sql(EntityKind::Plan);
        assert!(sql.ends_with("on conflict (id) do nothing"));
    }

    async fn test_repo() -> Option<PgRecordRepository> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.expect("db should connect");
        ensure_schema(&pool).await.ok()?;
        Some(PgRecordRepository::new(pool))
    }

    fn unique_id(prefix: &str) -> String {
        format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn upsert_insert_then_unchanged_then_updated() {
        let repo = match test_repo().await {
            Some(r) => r,
            None => return,
        };
        let mut plan = NormalizedRecord::placeholder(EntityKind::Plan, unique_id("plan"), Map::new());
        plan.is_placeholder = false;
        plan.fields.insert("name".to_string(), json!("Gold"));
        plan.raw = Some(json!({ "name": "Gold" }));

        assert_eq!(repo.upsert(&plan).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(repo.upsert(&plan).await.unwrap(), UpsertOutcome::Unchanged);

        plan.fields.insert("name".to_string(), json!("Platinum"));
        assert_eq!(repo.upsert(&plan).await.unwrap(), UpsertOutcome::Updated);
    }

    #[tokio::test]
    async fn upsert_maps_foreign_key_violation() {
        let repo = match test_repo().await {
            Some(r) => r,
            None => return,
        };
        let mut hints = Map::new();
        hints.insert("invoice_id".to_string(), json!(unique_id("in_missing")));
        let mut chargeback =
            NormalizedRecord::placeholder(EntityKind::Chargeback, unique_id("cb"), hints);
        chargeback.is_placeholder = false;

        let err = repo.upsert(&chargeback).await.unwrap_err();
        assert!(err.is_missing_parent(), "got: {err}");
    }

    #[tokio::test]
    async fn placeholder_insert_is_insert_if_absent() {
        let repo = match test_repo().await {
            Some(r) => r,
            None => return,
        };
        let id = unique_id("cus");
        let stub = NormalizedRecord::placeholder(EntityKind::Customer, id.clone(), Map::new());
        assert!(repo.insert_placeholder(&stub).await.unwrap());
        assert!(!repo.insert_placeholder(&stub).await.unwrap());

        let found = repo
            .existing_ids(EntityKind::Customer, &[id.clone(), unique_id("cus")])
            .await
            .unwrap();
        assert_eq!(found, HashSet::from([id.clone()]));

        let stored = repo.get(EntityKind::Customer, &id).await.unwrap().unwrap();
        assert!(stored.is_placeholder);
    }
}
