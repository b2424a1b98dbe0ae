use paysync_common::error::PaysyncResult;
use paysync_common::EntityKind;
use sqlx::PgPool;

use crate::records::pg_repository::map_db_error;

/// DDL for one destination table. Reference columns are nullable foreign keys
/// so placeholders can be created with whatever hints are available.
pub fn table_ddl(kind: EntityKind) -> String {
    let mut columns = vec!["id text primary key".to_string()];
    for reference in kind.references() {
        columns.push(format!(
            "{} text references {}(id)",
            reference.column,
            reference.target.table()
        ));
    }
    columns.extend([
        "fields jsonb not null default '{}'::jsonb".to_string(),
        "raw jsonb".to_string(),
        "is_placeholder boolean not null default false".to_string(),
        "first_synced_at timestamptz not null default now()".to_string(),
        "updated_at timestamptz not null default now()".to_string(),
    ]);

    format!(
        "create table if not exists {} (\n  {}\n)",
        kind.table(),
        columns.join(",\n  ")
    )
}

/// Create every destination table if missing, parents before children.
pub async fn ensure_schema(pool: &PgPool) -> PaysyncResult<()> {
    for tier in EntityKind::tiers(&EntityKind::ALL) {
        for kind in tier {
            sqlx::query(&table_ddl(kind))
                .execute(pool)
                .await
                .map_err(map_db_error)?;

            for reference in kind.references() {
                sqlx::query(&format!(
                    "create index if not exists {table}_{column}_idx on {table}({column})",
                    table = kind.table(),
                    column = reference.column
                ))
                .execute(pool)
                .await
                .map_err(map_db_error)?;
            }
        }
    }
    tracing::info!("destination schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_ddl_has_foreign_keys() {
        let ddl = table_ddl(EntityKind::Invoice);
        assert!(ddl.starts_with("create table if not exists billing_invoices ("));
        assert!(ddl.contains("customer_id text references billing_customers(id)"));
        assert!(ddl.contains("subscription_id text references billing_subscriptions(id)"));
        assert!(ddl.contains("is_placeholder boolean not null default false"));
    }

    #[test]
    fn independent_kind_has_no_reference_columns() {
        let ddl = table_ddl(EntityKind::PaymentMethod);
        assert!(!ddl.contains("references"));
        assert!(ddl.contains("raw jsonb"));
    }
}
