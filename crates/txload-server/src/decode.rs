//! Generic positional line decoder
//!
//! Walks a [`TableSchema`] and converts the fields of one export line into a
//! [`DecodedRecord`]. Content problems never fail a line: unparsable numbers
//! become zero and unparsable dates become the zero date, matching what the
//! terminals' back office has always done. Each such coercion is reported as a
//! [`FieldDiagnostic`] so it can be logged and counted.

use chrono::{NaiveDate, NaiveTime};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::schema::{ColumnKind, ColumnSpec, TableSchema};

/// Date format of export fields
pub const DATE_FORMAT: &str = "%d.%m.%Y";

/// Time format of export fields
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Int(i64),
    Float(f64),
    /// `None` is the zero date
    Date(Option<NaiveDate>),
    /// `None` is the zero time
    Time(Option<NaiveTime>),
}

impl Value {
    /// Whether this is the zero value of its kind
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Text(s) => s.is_empty(),
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            Value::Date(d) => d.is_none(),
            Value::Time(t) => t.is_none(),
        }
    }
}

/// One line decoded against a table schema
///
/// Serializes as an object keyed by column name, in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub table: &'static str,
    pub columns: &'static [ColumnSpec],
    pub values: Vec<Value>,
}

impl Serialize for DecodedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column.name, value)?;
        }
        map.end()
    }
}

impl DecodedRecord {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match self.get(column)? {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn float(&self, column: &str) -> Option<f64> {
        match self.get(column)? {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn date(&self, column: &str) -> Option<NaiveDate> {
        match self.get(column)? {
            Value::Date(d) => *d,
            _ => None,
        }
    }

    pub fn time(&self, column: &str) -> Option<NaiveTime> {
        match self.get(column)? {
            Value::Time(t) => *t,
            _ => None,
        }
    }
}

/// Why a field was coerced to its zero value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Coercion {
    InvalidInteger,
    InvalidDecimal(DecimalError),
    InvalidDate,
    InvalidTime,
}

impl fmt::Display for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coercion::InvalidInteger => write!(f, "invalid integer"),
            Coercion::InvalidDecimal(e) => write!(f, "{}", e),
            Coercion::InvalidDate => write!(f, "invalid date"),
            Coercion::InvalidTime => write!(f, "invalid time"),
        }
    }
}

/// A non-empty field that could not be parsed and was replaced by zero
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDiagnostic {
    pub column: &'static str,
    pub raw: String,
    pub reason: Coercion,
}

impl fmt::Display for FieldDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = '{}': {}, stored as zero", self.column, self.raw, self.reason)
    }
}

/// Decoded record plus the lossy coercions made while decoding it
#[derive(Debug, Clone)]
pub struct Decoded {
    pub record: DecodedRecord,
    pub diagnostics: Vec<FieldDiagnostic>,
}

/// Decode one line's fields against a schema.
///
/// `SourceTag` columns take `source_tag` and consume no field. Missing trailing
/// fields decode as empty strings; surplus fields are ignored.
pub fn decode(schema: &'static TableSchema, fields: &[&str], source_tag: &str) -> Decoded {
    let mut values = Vec::with_capacity(schema.columns.len());
    let mut diagnostics = Vec::new();
    let mut fields = fields.iter();

    for column in schema.columns {
        if !column.kind.consumes_field() {
            values.push(Value::Text(source_tag.to_string()));
            continue;
        }

        let raw = fields.next().copied().unwrap_or("");
        let (value, coercion) = convert(column.kind, raw);
        if let Some(reason) = coercion {
            diagnostics.push(FieldDiagnostic {
                column: column.name,
                raw: raw.to_string(),
                reason,
            });
        }
        values.push(value);
    }

    Decoded {
        record: DecodedRecord {
            table: schema.name,
            columns: schema.columns,
            values,
        },
        diagnostics,
    }
}

fn convert(kind: ColumnKind, raw: &str) -> (Value, Option<Coercion>) {
    let trimmed = raw.trim();

    match kind {
        ColumnKind::String | ColumnKind::SourceTag => (Value::Text(raw.to_string()), None),
        ColumnKind::Int64 => {
            if trimmed.is_empty() {
                return (Value::Int(0), None);
            }
            match trimmed.parse::<i64>() {
                Ok(i) => (Value::Int(i), None),
                Err(_) => (Value::Int(0), Some(Coercion::InvalidInteger)),
            }
        },
        ColumnKind::Float64 => {
            if trimmed.is_empty() {
                return (Value::Float(0.0), None);
            }
            match parse_decimal(trimmed) {
                Ok(f) => (Value::Float(f), None),
                Err(e) => (Value::Float(0.0), Some(Coercion::InvalidDecimal(e))),
            }
        },
        ColumnKind::Date => {
            if trimmed.is_empty() {
                return (Value::Date(None), None);
            }
            match NaiveDate::parse_from_str(trimmed, DATE_FORMAT) {
                Ok(d) => (Value::Date(Some(d)), None),
                Err(_) => (Value::Date(None), Some(Coercion::InvalidDate)),
            }
        },
        ColumnKind::Time => {
            if trimmed.is_empty() {
                return (Value::Time(None), None);
            }
            match NaiveTime::parse_from_str(trimmed, TIME_FORMAT) {
                Ok(t) => (Value::Time(Some(t)), None),
                Err(_) => (Value::Time(None), Some(Coercion::InvalidTime)),
            }
        },
    }
}

/// Rejections from [`parse_decimal`]
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum DecimalError {
    #[error("empty decimal")]
    Empty,

    #[error("ambiguous thousands separator in '{0}'")]
    ThousandsSeparator(String),

    #[error("invalid decimal '{0}'")]
    Invalid(String),
}

/// Parse a decimal that may use `.` or `,` as the decimal separator.
///
/// - `"1,25"` is 1.25 and `"1.25"` is 1.25.
/// - A lone comma followed by exactly three digits (`"1,000"`) looks like a
///   thousands separator and is rejected.
/// - When both separators appear, commas count as separators too and the
///   number ends at the second one: `"1,234.56"` is 1.234.
pub fn parse_decimal(input: &str) -> Result<f64, DecimalError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DecimalError::Empty);
    }

    if !s.contains('.') && looks_like_thousands(s) {
        return Err(DecimalError::ThousandsSeparator(s.to_string()));
    }

    let normalized = s.replace(',', ".");
    let mut parts = normalized.splitn(3, '.');
    let whole = parts.next().unwrap_or("");
    let candidate = match parts.next() {
        Some(fraction) => format!("{}.{}", whole, fraction),
        None => whole.to_string(),
    };

    match candidate.parse::<f64>() {
        Ok(value) if value.is_finite() && has_digits(&candidate) => Ok(value),
        _ => Err(DecimalError::Invalid(s.to_string())),
    }
}

fn looks_like_thousands(s: &str) -> bool {
    let mut commas = s.match_indices(',');
    match (commas.next(), commas.next()) {
        (Some((idx, _)), None) => {
            let tail = &s[idx + 1..];
            tail.len() == 3 && tail.bytes().all(|b| b.is_ascii_digit())
        },
        _ => false,
    }
}

// Rejects spellings such as "inf" or "nan" that `f64::from_str` accepts.
fn has_digits(s: &str) -> bool {
    s.bytes().any(|b| b.is_ascii_digit())
        && s.bytes().all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::{SchemaRegistry, ITEM_LAYOUT};

    fn item_schema() -> &'static TableSchema {
        SchemaRegistry::builtin().lookup("tx_item_registration").unwrap()
    }

    #[test]
    fn test_decode_item_registration() {
        let line = "12345;01.12.2024;10:30:00;1;001;100;1;ITEM001;GR1;10,50;2;21,00";
        let fields: Vec<&str> = line.split(';').collect();
        let decoded = decode(item_schema(), &fields, "T01/main");
        let record = &decoded.record;

        assert_eq!(record.table, "tx_item_registration");
        assert_eq!(record.int("transaction_id_unique"), Some(12345));
        assert_eq!(record.int("transaction_type"), Some(1));
        assert_eq!(record.text("item_identifier"), Some("ITEM001"));
        assert_eq!(record.text("cash_register_code"), Some("001"));
        assert_eq!(record.date("transaction_date"), NaiveDate::from_ymd_opt(2024, 12, 1));
        assert_eq!(record.time("transaction_time"), NaiveTime::from_hms_opt(10, 30, 0));
        assert_eq!(record.float("price"), Some(10.5));
        assert_eq!(record.float("position_sum"), Some(21.0));
        assert_eq!(record.text("source_folder"), Some("T01/main"));
        assert!(decoded.diagnostics.is_empty());
    }

    #[test]
    fn test_record_serializes_by_column_name() {
        let fields = ["12345", "01.12.2024", "", "1", "001", "100", "1", "ITEM001", "GR1", "10,50"];
        let record = decode(item_schema(), &fields, "T01/main").record;
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["transaction_id_unique"], 12345);
        assert_eq!(json["transaction_date"], "2024-12-01");
        assert!(json["transaction_time"].is_null());
        assert_eq!(json["item_identifier"], "ITEM001");
        assert_eq!(json["price"], 10.5);
        assert_eq!(json["source_folder"], "T01/main");
        assert_eq!(json.as_object().unwrap().len(), ITEM_LAYOUT.len());
    }

    #[test]
    fn test_missing_trailing_fields_are_empty() {
        let decoded = decode(item_schema(), &["7", "01.12.2024"], "T01/main");
        let record = &decoded.record;

        assert_eq!(record.values.len(), ITEM_LAYOUT.len());
        assert_eq!(record.int("transaction_id_unique"), Some(7));
        assert_eq!(record.time("transaction_time"), None);
        assert_eq!(record.text("item_identifier"), Some(""));
        assert_eq!(record.float("quantity"), Some(0.0));
        assert!(decoded.diagnostics.is_empty());
    }

    #[test]
    fn test_garbage_is_coerced_with_diagnostics() {
        let fields = ["x12", "31.02.2024", "25:00:00", "1", "001", "99999999999999999999"];
        let decoded = decode(item_schema(), &fields, "T01/main");
        let record = &decoded.record;

        assert_eq!(record.int("transaction_id_unique"), Some(0));
        assert_eq!(record.date("transaction_date"), None);
        assert_eq!(record.time("transaction_time"), None);
        assert_eq!(record.int("document_number"), Some(0));

        let columns: Vec<_> = decoded.diagnostics.iter().map(|d| d.column).collect();
        assert_eq!(
            columns,
            vec!["transaction_id_unique", "transaction_date", "transaction_time", "document_number"]
        );
        assert_eq!(decoded.diagnostics[0].reason, Coercion::InvalidInteger);
    }

    #[test]
    fn test_surplus_fields_are_ignored() {
        let mut fields = vec!["1"; 60];
        fields[1] = "01.01.2024";
        fields[2] = "00:00:01";
        let decoded = decode(item_schema(), &fields, "T01/main");
        assert_eq!(decoded.record.values.len(), ITEM_LAYOUT.len());
    }

    #[test]
    fn test_value_is_zero() {
        assert!(Value::Text(String::new()).is_zero());
        assert!(Value::Int(0).is_zero());
        assert!(Value::Date(None).is_zero());
        assert!(!Value::Float(0.5).is_zero());
    }

    #[test]
    fn test_parse_decimal_comma() {
        assert_eq!(parse_decimal("1,25").unwrap(), 1.25);
        assert_eq!(parse_decimal("-3,5").unwrap(), -3.5);
        assert_eq!(parse_decimal("1.5").unwrap(), 1.5);
        assert_eq!(parse_decimal("42").unwrap(), 42.0);
        assert_eq!(parse_decimal("1,0000").unwrap(), 1.0);
    }

    #[test]
    fn test_parse_decimal_thousands_rejected() {
        assert_eq!(
            parse_decimal("1,000"),
            Err(DecimalError::ThousandsSeparator("1,000".to_string()))
        );
    }

    #[test]
    fn test_parse_decimal_mixed_separators_truncate() {
        assert_eq!(parse_decimal("1,234.56").unwrap(), 1.234);
        assert_eq!(parse_decimal("1.234.567").unwrap(), 1.234);
    }

    #[test]
    fn test_parse_decimal_invalid() {
        assert!(matches!(parse_decimal("abc"), Err(DecimalError::Invalid(_))));
        assert!(matches!(parse_decimal("inf"), Err(DecimalError::Invalid(_))));
        assert!(matches!(parse_decimal("NaN"), Err(DecimalError::Invalid(_))));
        assert_eq!(parse_decimal("  "), Err(DecimalError::Empty));
    }
}
