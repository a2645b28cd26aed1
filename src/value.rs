// ABOUTME: Backend-neutral column values moved from source cursor to target insert
// ABOUTME: Decodes PostgreSQL/SQLite rows and binds values back with type adaptation

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// One column value of a transferred row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

/// Ordered column values; order and count are fixed by the selecting query.
pub type Row = Vec<Value>;

impl Value {
    /// Text rendering used when a backend has no native slot for the value.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Decimal(v) => v.to_string(),
            Value::Text(v) => v.clone(),
            Value::Bytes(v) => String::from_utf8_lossy(v).into_owned(),
            Value::Uuid(v) => v.to_string(),
            Value::Date(v) => v.format("%Y-%m-%d").to_string(),
            Value::Time(v) => v.format("%H:%M:%S%.f").to_string(),
            Value::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Value::TimestampTz(v) => v.to_rfc3339(),
            Value::Json(v) => v.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            other => f.write_str(&other.to_text()),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

// --- PostgreSQL -----------------------------------------------------------

/// Decode a PostgreSQL row into backend-neutral values.
///
/// # Errors
///
/// Fails on column types with no [`Value`] mapping, naming the column.
pub fn from_pg_row(row: &tokio_postgres::Row) -> Result<Row> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            pg_value(row, idx, column.type_()).with_context(|| {
                format!(
                    "Failed to read column '{}' of type {}",
                    column.name(),
                    column.type_()
                )
            })
        })
        .collect()
}

fn pg_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::NUMERIC => row.try_get::<_, Option<Decimal>>(idx)?.map(Value::Decimal),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        }
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        Type::UUID => row.try_get::<_, Option<Uuid>>(idx)?.map(Value::Uuid),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date),
        Type::TIME => row.try_get::<_, Option<NaiveTime>>(idx)?.map(Value::Time),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(Value::TimestampTz),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(Value::Json),
        _ => bail!("Unsupported column type {}", ty),
    };

    Ok(value.unwrap_or(Value::Null))
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) if <bool as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Int(v) if <i64 as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Float(v) if <f64 as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Decimal(v) if <Decimal as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Text(v) if <String as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Bytes(v) if <Vec<u8> as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Uuid(v) if <Uuid as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Date(v) if <NaiveDate as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Time(v) if <NaiveTime as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::Timestamp(v) if <NaiveDateTime as ToSql>::accepts(ty) => v.to_sql(ty, out),
            Value::TimestampTz(v) if <DateTime<Utc> as ToSql>::accepts(ty) => {
                v.to_sql(ty, out)
            }
            Value::Json(v) if <serde_json::Value as ToSql>::accepts(ty) => v.to_sql(ty, out),
            other => text_to_sql(&other.to_text(), ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Bind a textual rendering into a parameter of type `ty`, parsing it into
/// the type's native representation first.
fn text_to_sql(text: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    let trimmed = text.trim();
    match *ty {
        Type::BOOL => parse_bool(trimmed)?.to_sql(ty, out),
        Type::INT2 => trimmed.parse::<i16>()?.to_sql(ty, out),
        Type::INT4 => trimmed.parse::<i32>()?.to_sql(ty, out),
        Type::INT8 => trimmed.parse::<i64>()?.to_sql(ty, out),
        Type::FLOAT4 => trimmed.parse::<f32>()?.to_sql(ty, out),
        Type::FLOAT8 => trimmed.parse::<f64>()?.to_sql(ty, out),
        Type::NUMERIC => Decimal::from_str(trimmed)?.to_sql(ty, out),
        Type::UUID => Uuid::parse_str(trimmed)?.to_sql(ty, out),
        Type::DATE => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")?.to_sql(ty, out),
        Type::TIME => NaiveTime::from_str(trimmed)?.to_sql(ty, out),
        Type::TIMESTAMP => parse_timestamp(trimmed)?.to_sql(ty, out),
        Type::TIMESTAMPTZ => match DateTime::parse_from_rfc3339(trimmed) {
            Ok(v) => v.with_timezone(&Utc).to_sql(ty, out),
            Err(_) => parse_timestamp(trimmed)?.and_utc().to_sql(ty, out),
        },
        Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(text)?.to_sql(ty, out),
        Type::BYTEA => text.as_bytes().to_sql(ty, out),
        _ => text.to_sql(ty, out),
    }
}

fn parse_bool(text: &str) -> Result<bool, BoxError> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "n" | "no" | "off" => Ok(false),
        _ => Err(format!("Invalid boolean value '{}'", text).into()),
    }
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
}

// --- SQLite ---------------------------------------------------------------

impl From<rusqlite::types::Value> for Value {
    fn from(value: rusqlite::types::Value) -> Self {
        match value {
            rusqlite::types::Value::Null => Value::Null,
            rusqlite::types::Value::Integer(v) => Value::Int(v),
            rusqlite::types::Value::Real(v) => Value::Float(v),
            rusqlite::types::Value::Text(v) => Value::Text(v),
            rusqlite::types::Value::Blob(v) => Value::Bytes(v),
        }
    }
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};

        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Value::Bool(v) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*v))),
            Value::Int(v) => ToSqlOutput::Owned(SqliteValue::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Owned(SqliteValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            other => ToSqlOutput::Owned(SqliteValue::Text(other.to_text())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value, ty: &Type) -> Result<BytesMut, BoxError> {
        let mut out = BytesMut::new();
        value.to_sql_checked(ty, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_int_narrows_to_int4() {
        let out = encode(&Value::Int(42), &Type::INT4).unwrap();
        assert_eq!(&out[..], &42i32.to_be_bytes());
    }

    #[test]
    fn test_int_overflow_is_rejected() {
        assert!(encode(&Value::Int(i64::from(i16::MAX) + 1), &Type::INT2).is_err());
    }

    #[test]
    fn test_text_parses_into_uuid() {
        let id = Uuid::new_v4();
        let out = encode(&Value::Text(id.to_string()), &Type::UUID).unwrap();
        assert_eq!(&out[..], id.as_bytes());
    }

    #[test]
    fn test_sqlite_style_timestamp_text() {
        let out = encode(
            &Value::Text("2024-03-01 12:30:00".to_string()),
            &Type::TIMESTAMP,
        );
        assert!(out.is_ok());
    }

    #[test]
    fn test_integer_flag_binds_to_bool() {
        let out = encode(&Value::Int(1), &Type::BOOL).unwrap();
        assert_eq!(&out[..], &[1u8]);
    }

    #[test]
    fn test_null_binds_to_any_type() {
        let mut out = BytesMut::new();
        let is_null = Value::Null.to_sql_checked(&Type::NUMERIC, &mut out).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
    }

    #[test]
    fn test_sqlite_conversion() {
        assert_eq!(Value::from(rusqlite::types::Value::Integer(7)), Value::Int(7));
        assert_eq!(
            Value::from(rusqlite::types::Value::Text("x".to_string())),
            Value::Text("x".to_string())
        );
    }

    #[test]
    fn test_display_for_logging() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::from("app").to_string(), "'app'");
        assert_eq!(Value::Bytes(vec![1, 2, 3]).to_string(), "<3 bytes>");
    }
}
