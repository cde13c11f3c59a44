//! Schema registry for terminal export records
//!
//! Every physical transaction table is described by an ordered list of
//! [`ColumnSpec`]s. Column order is the positional order of the fields in an
//! export line; `SourceTag` columns are filled from the processing context and
//! never consume a field.
//!
//! Several tables share one layout (a registration and its storno, for
//! example). Layouts are `const` slices, so the column names the decoder and
//! the loader bind against are fixed at compile time.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Idempotency key column read from field 1 of every line
pub const TRANSACTION_ID_COLUMN: &str = "transaction_id_unique";

/// Idempotency key column filled with the originating folder key
pub const SOURCE_FOLDER_COLUMN: &str = "source_folder";

/// Errors from registry lookups
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),
}

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnKind {
    String,
    Int64,
    Float64,
    /// `DD.MM.YYYY`
    Date,
    /// `HH:MM:SS`
    Time,
    /// Populated from the folder key, not from the line
    SourceTag,
}

impl ColumnKind {
    /// PostgreSQL column type used when creating the table
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::String | ColumnKind::SourceTag => "TEXT",
            ColumnKind::Int64 => "BIGINT",
            ColumnKind::Float64 => "DOUBLE PRECISION",
            ColumnKind::Date => "DATE",
            ColumnKind::Time => "TIME",
        }
    }

    /// Whether the column reads a field from the export line
    pub fn consumes_field(self) -> bool {
        !matches!(self, ColumnKind::SourceTag)
    }
}

/// One column of a table layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// When false, a zero/empty value is written as NULL
    pub allow_zero: bool,
}

/// A physical table and its column layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
}

impl TableSchema {
    /// Position of a column in the layout
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Number of export fields the layout consumes
    pub fn field_count(&self) -> usize {
        self.columns.iter().filter(|c| c.kind.consumes_field()).count()
    }

    /// Whether two tables decode with the same positional layout
    pub fn same_layout(&self, other: &TableSchema) -> bool {
        self.columns == other.columns
    }

    /// `CREATE TABLE IF NOT EXISTS` statement with the idempotency constraint
    pub fn create_table_sql(&self) -> String {
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (\n", quote_ident(self.name));
        sql.push_str("    id BIGSERIAL PRIMARY KEY,\n");
        for column in self.columns {
            let not_null = if column.name == TRANSACTION_ID_COLUMN
                || column.name == SOURCE_FOLDER_COLUMN
            {
                " NOT NULL"
            } else {
                ""
            };
            sql.push_str(&format!(
                "    {} {}{},\n",
                quote_ident(column.name),
                column.kind.sql_type(),
                not_null
            ));
        }
        sql.push_str("    loaded_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n");
        sql.push_str(&format!(
            "    CONSTRAINT {} UNIQUE ({}, {})\n)",
            quote_ident(&format!("{}_idempotency_key", self.name)),
            quote_ident(TRANSACTION_ID_COLUMN),
            quote_ident(SOURCE_FOLDER_COLUMN)
        ));
        sql
    }
}

/// Double-quote an SQL identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

// ============================================================================
// Column constructors
// ============================================================================

const fn spec(name: &'static str, kind: ColumnKind, allow_zero: bool) -> ColumnSpec {
    ColumnSpec {
        name,
        kind,
        allow_zero,
    }
}

/// Identifier that is meaningful even when zero
const fn key(name: &'static str) -> ColumnSpec {
    spec(name, ColumnKind::Int64, true)
}

/// Reference code; zero means "not set"
const fn code(name: &'static str) -> ColumnSpec {
    spec(name, ColumnKind::Int64, false)
}

const fn count(name: &'static str) -> ColumnSpec {
    spec(name, ColumnKind::Int64, true)
}

const fn amount(name: &'static str) -> ColumnSpec {
    spec(name, ColumnKind::Float64, true)
}

const fn text(name: &'static str) -> ColumnSpec {
    spec(name, ColumnKind::String, false)
}

const fn date(name: &'static str) -> ColumnSpec {
    spec(name, ColumnKind::Date, false)
}

const fn time(name: &'static str) -> ColumnSpec {
    spec(name, ColumnKind::Time, false)
}

const fn source(name: &'static str) -> ColumnSpec {
    spec(name, ColumnKind::SourceTag, true)
}

/// Fields 1-7 are shared by every transaction type; the folder key is last.
macro_rules! layout {
    ($($column:expr),* $(,)?) => {
        &[
            key(TRANSACTION_ID_COLUMN),
            date("transaction_date"),
            time("transaction_time"),
            count("transaction_type"),
            text("cash_register_code"),
            count("document_number"),
            code("cashier_code"),
            $($column,)*
            source(SOURCE_FOLDER_COLUMN),
        ]
    };
}

// ============================================================================
// Layouts
// ============================================================================

pub const ITEM_LAYOUT: &[ColumnSpec] = layout![
    text("item_identifier"),
    text("group_code"),
    amount("price"),
    amount("quantity"),
    amount("position_sum"),
    code("operation_type"),
    count("shift_number"),
    amount("final_price"),
    amount("final_sum"),
    code("print_group_code"),
    text("item_article"),
    text("barcode"),
    text("marking_code"),
    code("document_type_code"),
    code("comment_code"),
    text("document_info"),
    code("enterprise_id"),
    code("employee_code"),
    text("unit_code"),
];

pub const TAX_LAYOUT: &[ColumnSpec] = layout![
    text("item_identifier"),
    code("tax_group_code"),
    code("tax_rate_code"),
    amount("tax_sum"),
    code("operation_type"),
    count("shift_number"),
    amount("tax_rate"),
    amount("taxable_sum"),
    code("document_type_code"),
    text("document_info"),
    code("enterprise_id"),
];

pub const DISCOUNT_LAYOUT: &[ColumnSpec] = layout![
    text("item_identifier"),
    text("discount_info"),
    code("discount_type_code"),
    amount("discount_value"),
    amount("discount_sum"),
    code("operation_type"),
    count("shift_number"),
    text("promo_code"),
    text("card_number"),
    code("document_type_code"),
    text("document_info"),
    code("enterprise_id"),
];

pub const BONUS_LAYOUT: &[ColumnSpec] = layout![
    text("card_number"),
    code("card_type_code"),
    amount("bonus_sum"),
    amount("bonus_balance"),
    code("operation_type"),
    count("shift_number"),
    text("promo_code"),
    code("document_type_code"),
    text("document_info"),
    code("enterprise_id"),
];

pub const CARD_LAYOUT: &[ColumnSpec] = layout![
    text("card_number"),
    code("card_type_code"),
    text("client_code"),
    text("client_name"),
    code("operation_type"),
    count("shift_number"),
    code("document_type_code"),
    code("enterprise_id"),
];

pub const PAYMENT_LAYOUT: &[ColumnSpec] = layout![
    text("card_number"),
    code("payment_type_code"),
    code("payment_operation_code"),
    amount("customer_sum"),
    amount("payment_sum"),
    code("operation_type"),
    count("shift_number"),
    text("currency_code"),
    text("rrn"),
    text("authorization_code"),
    code("document_type_code"),
    text("document_info"),
    code("enterprise_id"),
];

pub const DOCUMENT_LAYOUT: &[ColumnSpec] = layout![
    text("card_numbers"),
    text("client_code"),
    count("positions_count"),
    amount("document_sum"),
    code("operation_type"),
    count("shift_number"),
    code("document_type_code"),
    text("document_info"),
    code("enterprise_id"),
    text("fiscal_sign"),
    count("fiscal_document_number"),
    code("employee_code"),
];

pub const CASH_LAYOUT: &[ColumnSpec] = layout![
    text("cash_item_code"),
    amount("cash_sum"),
    code("operation_type"),
    count("shift_number"),
    code("document_type_code"),
    text("comment"),
    code("enterprise_id"),
];

pub const SHIFT_LAYOUT: &[ColumnSpec] = layout![
    text("kkm_serial"),
    amount("report_sum"),
    count("shift_number"),
    amount("cash_in_drawer"),
    amount("revenue"),
    text("kkm_number"),
    count("fiscal_document_number"),
    code("enterprise_id"),
];

pub const MARKING_LAYOUT: &[ColumnSpec] = layout![
    text("item_identifier"),
    text("marking_code"),
    code("marking_status"),
    amount("quantity"),
    count("shift_number"),
    code("document_type_code"),
    text("document_info"),
    code("enterprise_id"),
];

pub const SERVICE_LAYOUT: &[ColumnSpec] = layout![
    code("event_code"),
    text("event_text"),
    count("shift_number"),
    code("document_type_code"),
    code("enterprise_id"),
];

const fn table(name: &'static str, columns: &'static [ColumnSpec]) -> TableSchema {
    TableSchema { name, columns }
}

/// Every physical table the loader writes to
pub const TABLES: &[TableSchema] = &[
    table("tx_item_registration", ITEM_LAYOUT),
    table("tx_item_storno", ITEM_LAYOUT),
    table("tx_item_refund", ITEM_LAYOUT),
    table("tx_item_refund_storno", ITEM_LAYOUT),
    table("tx_item_correction", ITEM_LAYOUT),
    table("tx_item_tax", TAX_LAYOUT),
    table("tx_item_tax_storno", TAX_LAYOUT),
    table("tx_position_discount", DISCOUNT_LAYOUT),
    table("tx_position_discount_storno", DISCOUNT_LAYOUT),
    table("tx_document_discount", DISCOUNT_LAYOUT),
    table("tx_document_discount_storno", DISCOUNT_LAYOUT),
    table("tx_distributed_discount", DISCOUNT_LAYOUT),
    table("tx_distributed_discount_storno", DISCOUNT_LAYOUT),
    table("tx_bonus_accrual", BONUS_LAYOUT),
    table("tx_bonus_writeoff", BONUS_LAYOUT),
    table("tx_card_registration", CARD_LAYOUT),
    table("tx_card_storno", CARD_LAYOUT),
    table("tx_payment", PAYMENT_LAYOUT),
    table("tx_payment_storno", PAYMENT_LAYOUT),
    table("tx_payment_refund", PAYMENT_LAYOUT),
    table("tx_document_open", DOCUMENT_LAYOUT),
    table("tx_document_subtotal", DOCUMENT_LAYOUT),
    table("tx_document_close_kkm", DOCUMENT_LAYOUT),
    table("tx_document_close", DOCUMENT_LAYOUT),
    table("tx_document_deferred", DOCUMENT_LAYOUT),
    table("tx_document_cancel", DOCUMENT_LAYOUT),
    table("tx_cash_in", CASH_LAYOUT),
    table("tx_cash_out", CASH_LAYOUT),
    table("tx_x_report", SHIFT_LAYOUT),
    table("tx_z_report", SHIFT_LAYOUT),
    table("tx_shift_open", SHIFT_LAYOUT),
    table("tx_shift_close", SHIFT_LAYOUT),
    table("tx_marking", MARKING_LAYOUT),
    table("tx_marking_storno", MARKING_LAYOUT),
    table("tx_kkm_error", SERVICE_LAYOUT),
    table("tx_service_event", SERVICE_LAYOUT),
];

/// Immutable lookup from table name to schema
///
/// Built once at startup and shared by `Arc`.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    tables: BTreeMap<&'static str, &'static TableSchema>,
}

impl SchemaRegistry {
    /// Registry of every built-in transaction table
    pub fn builtin() -> Self {
        Self::from_tables(TABLES)
    }

    pub fn from_tables(tables: &'static [TableSchema]) -> Self {
        Self {
            tables: tables.iter().map(|t| (t.name, t)).collect(),
        }
    }

    pub fn lookup(&self, table: &str) -> Result<&'static TableSchema, SchemaError> {
        self.tables
            .get(table)
            .copied()
            .ok_or_else(|| SchemaError::UnknownTable(table.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &'static TableSchema> + '_ {
        self.tables.values().copied()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
