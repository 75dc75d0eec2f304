//! SQL statements for the detections table.
//!
//! Inserts use bound `$n` parameters. Identifiers cannot be bound, so the
//! table name is validated by [`TableName`]. [`quote_literal`] is the one
//! place values are escaped into SQL text; it backs statement previews and
//! stores that cannot bind parameters.

use crate::record::{ingestion_format, DetectionRecord};
use std::fmt;
use thiserror::Error;

/// Postgres limits a statement to 65535 bound parameters.
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// Errors raised while turning records into SQL.
#[derive(Debug, Error, PartialEq)]
pub enum SerializeError {
    #[error("Non-finite value in column {column}")]
    NonFinite { column: &'static str },

    #[error("NUL byte in text for column {column}")]
    NulByte { column: &'static str },

    #[error("Value out of range for column {column}")]
    OutOfRange { column: &'static str },

    #[error("NUL byte in literal")]
    NulInLiteral,

    #[error("Non-finite float literal")]
    NonFiniteLiteral,

    #[error("Invalid table identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Statement needs {0} parameters, limit is 65535")]
    TooManyParameters(usize),
}

/// A SQL value, either bound as a parameter or rendered as a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Column SQL types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Text,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
        }
    }
}

/// Table columns in record field order.
pub const COLUMNS: [(&str, ColumnType); 28] = [
    ("source_type", ColumnType::Text),
    ("source_id", ColumnType::Text),
    ("frame_number", ColumnType::BigInt),
    ("class_id", ColumnType::BigInt),
    ("class_name", ColumnType::Text),
    ("confidence", ColumnType::Double),
    ("x_min", ColumnType::BigInt),
    ("y_min", ColumnType::BigInt),
    ("x_max", ColumnType::BigInt),
    ("y_max", ColumnType::BigInt),
    ("width", ColumnType::BigInt),
    ("height", ColumnType::BigInt),
    ("area_pixels", ColumnType::BigInt),
    ("frame_width", ColumnType::BigInt),
    ("frame_height", ColumnType::BigInt),
    ("bbox_area_ratio", ColumnType::Double),
    ("center_x", ColumnType::Double),
    ("center_y", ColumnType::Double),
    ("center_x_norm", ColumnType::Double),
    ("center_y_norm", ColumnType::Double),
    ("position_region", ColumnType::Text),
    ("dominant_color_name", ColumnType::Text),
    ("dom_r", ColumnType::BigInt),
    ("dom_g", ColumnType::BigInt),
    ("dom_b", ColumnType::BigInt),
    ("timestamp_sec", ColumnType::Double),
    ("ingestion_date", ColumnType::Text),
    ("detection_id", ColumnType::Text),
];

pub const COLUMN_COUNT: usize = COLUMNS.len();

/// A validated, possibly schema-qualified, table identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn parse(name: &str) -> Result<Self, SerializeError> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() > 2 || !parts.iter().all(|p| is_identifier(p)) {
            return Err(SerializeError::InvalidIdentifier(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// SQL with every `$n` replaced by its quoted literal.
    pub fn render_inline(&self) -> Result<String, SerializeError> {
        let mut out = String::with_capacity(self.sql.len() + self.params.len() * 8);
        let mut chars = self.sql.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            let mut digits = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_ascii_digit() {
                    digits.push(d);
                    chars.next();
                } else {
                    break;
                }
            }

            let value = digits
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| self.params.get(i));

            match value {
                Some(value) => out.push_str(&quote_literal(value)?),
                None => {
                    out.push('$');
                    out.push_str(&digits);
                }
            }
        }

        Ok(out)
    }

    /// Inline rendering cut to `max_chars`, for debug logs.
    pub fn preview(&self, max_chars: usize) -> String {
        let rendered = match self.render_inline() {
            Ok(sql) => sql,
            Err(_) => self.sql.clone(),
        };
        if rendered.chars().count() <= max_chars {
            rendered
        } else {
            let cut: String = rendered.chars().take(max_chars).collect();
            format!("{}...", cut)
        }
    }
}

/// Render a value as a SQL literal.
///
/// Text is wrapped in single quotes with embedded quotes doubled. NUL bytes
/// and non-finite floats have no literal form and are rejected.
pub fn quote_literal(value: &SqlValue) -> Result<String, SerializeError> {
    match value {
        SqlValue::Null => Ok("NULL".to_string()),
        SqlValue::Int(v) => Ok(v.to_string()),
        SqlValue::Float(v) => {
            if !v.is_finite() {
                return Err(SerializeError::NonFiniteLiteral);
            }
            // Debug keeps a decimal point on whole numbers
            Ok(format!("{:?}", v))
        }
        SqlValue::Text(s) => {
            if s.contains('\0') {
                return Err(SerializeError::NulInLiteral);
            }
            let mut out = String::with_capacity(s.len() + 2);
            out.push('\'');
            for c in s.chars() {
                if c == '\'' {
                    out.push('\'');
                }
                out.push(c);
            }
            out.push('\'');
            Ok(out)
        }
    }
}

fn text(column: &'static str, value: &str) -> Result<SqlValue, SerializeError> {
    if value.contains('\0') {
        return Err(SerializeError::NulByte { column });
    }
    Ok(SqlValue::Text(value.to_string()))
}

fn float(column: &'static str, value: f64) -> Result<SqlValue, SerializeError> {
    if !value.is_finite() {
        return Err(SerializeError::NonFinite { column });
    }
    Ok(SqlValue::Float(value))
}

/// Serialize a record into one row of values in [`COLUMNS`] order.
pub fn record_row(record: &DetectionRecord) -> Result<Vec<SqlValue>, SerializeError> {
    let frame_number = i64::try_from(record.frame_number).map_err(|_| {
        SerializeError::OutOfRange {
            column: "frame_number",
        }
    })?;

    Ok(vec![
        SqlValue::Text(record.source_type.as_str().to_string()),
        text("source_id", &record.source_id)?,
        SqlValue::Int(frame_number),
        SqlValue::Int(record.class_id as i64),
        text("class_name", &record.class_name)?,
        float("confidence", record.confidence)?,
        SqlValue::Int(record.x_min as i64),
        SqlValue::Int(record.y_min as i64),
        SqlValue::Int(record.x_max as i64),
        SqlValue::Int(record.y_max as i64),
        SqlValue::Int(record.width as i64),
        SqlValue::Int(record.height as i64),
        SqlValue::Int(record.area_pixels),
        SqlValue::Int(record.frame_width as i64),
        SqlValue::Int(record.frame_height as i64),
        float("bbox_area_ratio", record.bbox_area_ratio)?,
        float("center_x", record.center_x)?,
        float("center_y", record.center_y)?,
        float("center_x_norm", record.center_x_norm)?,
        float("center_y_norm", record.center_y_norm)?,
        SqlValue::Text(record.position_region.to_string()),
        text("dominant_color_name", &record.dominant_color_name)?,
        SqlValue::Int(record.dom_r as i64),
        SqlValue::Int(record.dom_g as i64),
        SqlValue::Int(record.dom_b as i64),
        float("timestamp_sec", record.timestamp_sec)?,
        SqlValue::Text(
            record
                .ingestion_date
                .format(ingestion_format::FORMAT)
                .to_string(),
        ),
        SqlValue::Text(record.detection_id.to_string()),
    ])
}

/// Build one multi-row INSERT for `records`.
pub fn insert_rows(
    table: &TableName,
    records: &[DetectionRecord],
) -> Result<Statement, SerializeError> {
    let param_count = records.len() * COLUMN_COUNT;
    if param_count > MAX_BIND_PARAMS {
        return Err(SerializeError::TooManyParameters(param_count));
    }

    let column_list = COLUMNS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("INSERT INTO {} ({}) VALUES ", table, column_list);
    let mut params = Vec::with_capacity(param_count);

    for (row_index, record) in records.iter().enumerate() {
        if row_index > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..COLUMN_COUNT {
            if col > 0 {
                sql.push_str(", ");
            }
            sql.push('$');
            sql.push_str(&(row_index * COLUMN_COUNT + col + 1).to_string());
        }
        sql.push(')');

        params.extend(record_row(record)?);
    }

    Ok(Statement { sql, params })
}

/// `CREATE TABLE IF NOT EXISTS` for the detections table.
pub fn create_table(table: &TableName) -> Statement {
    let columns = COLUMNS
        .iter()
        .map(|(name, ty)| format!("    {} {}", name, ty.sql()))
        .collect::<Vec<_>>()
        .join(",\n");

    Statement::new(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        table, columns
    ))
}

pub fn count_rows(table: &TableName) -> Statement {
    Statement::new(format!("SELECT COUNT(*) FROM {}", table))
}

/// Most frequent classes, `(class_name, count)` rows.
pub fn top_classes(table: &TableName, limit: i64) -> Statement {
    Statement {
        sql: format!(
            "SELECT class_name, COUNT(*) AS total FROM {} GROUP BY class_name ORDER BY total DESC, class_name ASC LIMIT $1",
            table
        ),
        params: vec![SqlValue::Int(limit)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sample_record;

    fn table() -> TableName {
        TableName::parse("yolo_objects").unwrap()
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal(&SqlValue::Null).unwrap(), "NULL");
        assert_eq!(quote_literal(&SqlValue::Int(-42)).unwrap(), "-42");
        assert_eq!(quote_literal(&SqlValue::Float(2.0)).unwrap(), "2.0");
        assert_eq!(quote_literal(&SqlValue::Float(0.25)).unwrap(), "0.25");
        assert_eq!(
            quote_literal(&SqlValue::Text("O'Brien".into())).unwrap(),
            "'O''Brien'"
        );
        assert_eq!(quote_literal(&SqlValue::Text("''".into())).unwrap(), "''''''");
    }

    #[test]
    fn test_quote_literal_separators_and_newlines() {
        let literal = quote_literal(&SqlValue::Text("a, b; c\nd\\e".into())).unwrap();
        assert_eq!(literal, "'a, b; c\nd\\e'");
    }

    #[test]
    fn test_quote_literal_rejects_nul_and_non_finite() {
        assert_eq!(
            quote_literal(&SqlValue::Text("a\0b".into())),
            Err(SerializeError::NulInLiteral)
        );
        assert_eq!(
            quote_literal(&SqlValue::Float(f64::NAN)),
            Err(SerializeError::NonFiniteLiteral)
        );
        assert_eq!(
            quote_literal(&SqlValue::Float(f64::NEG_INFINITY)),
            Err(SerializeError::NonFiniteLiteral)
        );
    }

    #[test]
    fn test_table_name_validation() {
        assert!(TableName::parse("yolo_objects").is_ok());
        assert!(TableName::parse("analytics.yolo_objects").is_ok());
        assert!(TableName::parse("_t1").is_ok());
        assert!(TableName::parse("1table").is_err());
        assert!(TableName::parse("a.b.c").is_err());
        assert!(TableName::parse("t; DROP TABLE x").is_err());
        assert!(TableName::parse("").is_err());
        assert!(TableName::parse("a.").is_err());
    }

    #[test]
    fn test_insert_rows_placeholders() {
        let records = vec![sample_record("a.mp4", 1.0), sample_record("a.mp4", 2.0)];
        let stmt = insert_rows(&table(), &records).unwrap();

        assert!(stmt.sql.starts_with("INSERT INTO yolo_objects (source_type, source_id,"));
        assert!(stmt.sql.contains("($1, $2,"));
        assert!(stmt.sql.contains("$28), ($29,"));
        assert!(stmt.sql.ends_with("$56)"));
        assert_eq!(stmt.params.len(), 56);
        assert_eq!(stmt.params[0], SqlValue::Text("video".into()));
        assert_eq!(stmt.params[1], SqlValue::Text("a.mp4".into()));
        assert_eq!(stmt.params[29], SqlValue::Text("a.mp4".into()));
    }

    #[test]
    fn test_record_row_rejects_malformed_values() {
        let mut record = sample_record("a.mp4", 1.0);
        record.center_x = f64::INFINITY;
        assert_eq!(
            record_row(&record),
            Err(SerializeError::NonFinite { column: "center_x" })
        );

        let mut record = sample_record("a.mp4", 1.0);
        record.class_name = "per\0son".into();
        assert_eq!(
            record_row(&record),
            Err(SerializeError::NulByte { column: "class_name" })
        );
    }

    #[test]
    fn test_too_many_parameters() {
        let records: Vec<_> = (0..2341).map(|i| sample_record("a.mp4", i as f64)).collect();
        assert!(matches!(
            insert_rows(&table(), &records),
            Err(SerializeError::TooManyParameters(_))
        ));
    }

    #[test]
    fn test_render_inline() {
        let stmt = Statement {
            sql: "SELECT $1, $2, $10, $3".into(),
            params: vec![
                SqlValue::Text("it's".into()),
                SqlValue::Int(7),
                SqlValue::Null,
            ],
        };
        assert_eq!(stmt.render_inline().unwrap(), "SELECT 'it''s', 7, $10, NULL");
    }

    #[test]
    fn test_render_inline_multi_digit_placeholders() {
        let mut record = sample_record("it's.mp4", 1.0);
        record.class_name = "dog".into();
        let stmt = insert_rows(&table(), &[record]).unwrap();
        let rendered = stmt.render_inline().unwrap();

        assert!(rendered.contains("'it''s.mp4'"));
        assert!(rendered.contains("'dog'"));
        assert!(!rendered.contains('$'));
    }

    #[test]
    fn test_preview_truncates() {
        let stmt = insert_rows(&table(), &[sample_record("a.mp4", 1.0)]).unwrap();
        let preview = stmt.preview(40);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 43);
    }

    #[test]
    fn test_create_table() {
        let stmt = create_table(&table());
        assert!(stmt.sql.starts_with("CREATE TABLE IF NOT EXISTS yolo_objects ("));
        assert!(stmt.sql.contains("confidence DOUBLE PRECISION"));
        assert!(stmt.sql.contains("frame_number BIGINT"));
        assert!(stmt.sql.contains("detection_id TEXT"));
        assert!(stmt.params.is_empty());
    }
}
