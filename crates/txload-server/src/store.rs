//! PostgreSQL record storage
//!
//! One export file is written in one transaction: every table's rows are
//! upserted on the idempotency key `(transaction_id_unique, source_folder)`,
//! so reloading a file converges to the same rows.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, info};

use crate::decode::{DecodedRecord, Value};
use crate::schema::{quote_ident, ColumnSpec, SchemaRegistry, SOURCE_FOLDER_COLUMN, TRANSACTION_ID_COLUMN};

/// PostgreSQL limit on bind parameters in one statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Default rows per INSERT statement
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Decoded records of one file, keyed by table
pub type FileTables = BTreeMap<&'static str, Vec<DecodedRecord>>;

/// Destination of decoded records
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Upsert every table of one file in a single transaction.
    ///
    /// Returns the number of rows inserted or updated.
    async fn upsert_file(&self, tables: &FileTables) -> Result<u64, sqlx::Error>;
}

/// [`RecordStore`] backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_table(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        records: &[DecodedRecord],
    ) -> Result<u64, sqlx::Error> {
        let Some(columns) = records.first().map(|r| r.columns) else {
            return Ok(0);
        };

        let rows = dedupe_by_key(records);
        let chunk_size = chunk_size(self.batch_size, columns.len());
        let mut affected = 0u64;

        for (index, chunk) in rows.chunks(chunk_size).enumerate() {
            debug!(table, chunk = index + 1, rows = chunk.len(), "Upserting chunk");

            let mut query_builder = upsert_prefix(table, columns);
            query_builder.push_values(chunk.iter(), |mut b, record| {
                for (column, value) in columns.iter().zip(&record.values) {
                    push_value(&mut b, column, value);
                }
            });
            query_builder.push(conflict_clause(columns));

            affected += query_builder.build().execute(&mut **tx).await?.rows_affected();
        }

        Ok(affected)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_file(&self, tables: &FileTables) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;

        for (table, records) in tables {
            affected += self.upsert_table(&mut tx, table, records).await?;
        }

        tx.commit().await?;
        Ok(affected)
    }
}

/// Create every registry table that does not exist yet
pub async fn ensure_tables(pool: &PgPool, registry: &SchemaRegistry) -> Result<(), sqlx::Error> {
    for schema in registry.tables() {
        sqlx::query(&schema.create_table_sql()).execute(pool).await?;
    }
    info!(tables = registry.len(), "Transaction tables ready");
    Ok(())
}

/// Rows per statement, bounded by the bind parameter limit
pub fn chunk_size(batch_size: usize, column_count: usize) -> usize {
    let by_params = MAX_BIND_PARAMS / column_count.max(1);
    batch_size.min(by_params).max(1)
}

fn upsert_prefix(table: &str, columns: &[ColumnSpec]) -> QueryBuilder<'static, Postgres> {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c.name))
        .collect::<Vec<_>>()
        .join(", ");
    QueryBuilder::new(format!("INSERT INTO {} ({}) ", quote_ident(table), column_list))
}

/// `ON CONFLICT .. DO UPDATE` overwriting every non-key column
pub fn conflict_clause(columns: &[ColumnSpec]) -> String {
    let updates = columns
        .iter()
        .filter(|c| c.name != TRANSACTION_ID_COLUMN && c.name != SOURCE_FOLDER_COLUMN)
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c.name)))
        .chain(std::iter::once("\"loaded_at\" = now()".to_string()))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        " ON CONFLICT ({}, {}) DO UPDATE SET {}",
        quote_ident(TRANSACTION_ID_COLUMN),
        quote_ident(SOURCE_FOLDER_COLUMN),
        updates
    )
}

/// Whether the value is written as NULL under the column's zero policy
pub fn is_null(column: &ColumnSpec, value: &Value) -> bool {
    !column.allow_zero && value.is_zero()
}

fn push_value(b: &mut Separated<'_, 'static, Postgres, &'static str>, column: &ColumnSpec, value: &Value) {
    let null = is_null(column, value);
    match value {
        Value::Text(s) => b.push_bind((!null).then(|| s.clone())),
        Value::Int(i) => b.push_bind((!null).then_some(*i)),
        Value::Float(f) => b.push_bind((!null).then_some(*f)),
        Value::Date(d) => b.push_bind(*d),
        Value::Time(t) => b.push_bind(*t),
    };
}

/// Keep the last record per idempotency key, in first-seen order.
///
/// A single `INSERT .. ON CONFLICT DO UPDATE` may not touch the same row twice.
pub fn dedupe_by_key(records: &[DecodedRecord]) -> Vec<&DecodedRecord> {
    let mut positions: HashMap<(Option<i64>, Option<&str>), usize> = HashMap::new();
    let mut rows: Vec<&DecodedRecord> = Vec::with_capacity(records.len());

    for record in records {
        let key = (record.int(TRANSACTION_ID_COLUMN), record.text(SOURCE_FOLDER_COLUMN));
        match positions.get(&key) {
            Some(&index) => rows[index] = record,
            None => {
                positions.insert(key, rows.len());
                rows.push(record);
            },
        }
    }

    rows
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::schema::ColumnKind;

    fn cash_record(id: &str, sum: &str, folder: &str) -> DecodedRecord {
        let schema = SchemaRegistry::builtin().lookup("tx_cash_in").unwrap();
        let fields = [id, "01.12.2024", "10:00:00", "50", "001", "1", "0", "", sum];
        decode(schema, &fields, folder).record
    }

    #[test]
    fn test_chunk_size_respects_bind_limit() {
        assert_eq!(chunk_size(500, 20), 500);
        assert_eq!(chunk_size(10_000, 20), MAX_BIND_PARAMS / 20);
        assert_eq!(chunk_size(0, 20), 1);
        assert_eq!(chunk_size(500, 0), 500);
    }

    #[test]
    fn test_conflict_clause_skips_key_columns() {
        let schema = SchemaRegistry::builtin().lookup("tx_cash_in").unwrap();
        let clause = conflict_clause(schema.columns);

        assert!(clause.starts_with(" ON CONFLICT (\"transaction_id_unique\", \"source_folder\") DO UPDATE SET"));
        assert!(clause.contains("\"cash_sum\" = EXCLUDED.\"cash_sum\""));
        assert!(!clause.contains("\"transaction_id_unique\" = EXCLUDED"));
        assert!(!clause.contains("\"source_folder\" = EXCLUDED"));
    }

    #[test]
    fn test_zero_policy() {
        let code = ColumnSpec {
            name: "cashier_code",
            kind: ColumnKind::Int64,
            allow_zero: false,
        };
        let key = ColumnSpec {
            name: TRANSACTION_ID_COLUMN,
            kind: ColumnKind::Int64,
            allow_zero: true,
        };
        assert!(is_null(&code, &Value::Int(0)));
        assert!(!is_null(&code, &Value::Int(7)));
        assert!(!is_null(&key, &Value::Int(0)));
    }

    #[test]
    fn test_dedupe_keeps_last_per_key() {
        let records = vec![
            cash_record("1", "10", "T01/main"),
            cash_record("2", "20", "T01/main"),
            cash_record("1", "30", "T01/main"),
            cash_record("1", "40", "T01/backup"),
        ];
        let rows = dedupe_by_key(&records);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].float("cash_sum"), Some(30.0));
        assert_eq!(rows[1].int(TRANSACTION_ID_COLUMN), Some(2));
        assert_eq!(rows[2].text(SOURCE_FOLDER_COLUMN), Some("T01/backup"));
    }
}
