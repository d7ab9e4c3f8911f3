//! Warehouse value types
//!
//! Conversion between PostgreSQL wire values and the protocol's scalars.
//! Numeric values travel as decimal-exact strings, never floats.

use crate::warehouse::numeric;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::error::Error as StdError;
use std::fmt::Write as _;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};

type BoxError = Box<dyn StdError + Sync + Send>;

/// Column metadata for a result set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column label as returned by the warehouse
    pub name: String,

    /// Warehouse type name (e.g. `int8`, `numeric`, `varchar`)
    pub type_name: String,

    /// Nullability, when the backend reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: None,
        }
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }
}

/// A single decoded cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision decimal kept as its exact text form
    Decimal(String),
    Text(String),
    Json(serde_json::Value),
}

/// One row, aligned to the result set's columns
pub type Row = Vec<CellValue>;

impl CellValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) | CellValue::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Null => serializer.serialize_unit(),
            CellValue::Bool(v) => serializer.serialize_bool(*v),
            CellValue::Int(v) => serializer.serialize_i64(*v),
            CellValue::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            CellValue::Float(v) if v.is_nan() => serializer.serialize_str("NaN"),
            CellValue::Float(v) if *v > 0.0 => serializer.serialize_str("Infinity"),
            CellValue::Float(_) => serializer.serialize_str("-Infinity"),
            CellValue::Decimal(s) | CellValue::Text(s) => serializer.serialize_str(s),
            CellValue::Json(v) => v.serialize(serializer),
        }
    }
}

fn is_text_type(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

impl<'a> FromSql<'a> for CellValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if let Kind::Domain(base) = ty.kind() {
            return Self::from_sql(base, raw);
        }
        let value = match *ty {
            Type::BOOL => CellValue::Bool(bool::from_sql(ty, raw)?),
            Type::INT2 => CellValue::Int(i16::from_sql(ty, raw)? as i64),
            Type::INT4 => CellValue::Int(i32::from_sql(ty, raw)? as i64),
            Type::INT8 => CellValue::Int(i64::from_sql(ty, raw)?),
            Type::OID => CellValue::Int(u32::from_sql(ty, raw)? as i64),
            Type::FLOAT4 => CellValue::Float(f32::from_sql(ty, raw)? as f64),
            Type::FLOAT8 => CellValue::Float(f64::from_sql(ty, raw)?),
            Type::NUMERIC => CellValue::Decimal(numeric::decode(raw)?),
            Type::DATE => CellValue::Text(NaiveDate::from_sql(ty, raw)?.format("%Y-%m-%d").to_string()),
            Type::TIME => CellValue::Text(NaiveTime::from_sql(ty, raw)?.format("%H:%M:%S%.f").to_string()),
            Type::TIMESTAMP => CellValue::Text(
                NaiveDateTime::from_sql(ty, raw)?
                    .format("%Y-%m-%dT%H:%M:%S%.f")
                    .to_string(),
            ),
            Type::TIMESTAMPTZ => CellValue::Text(
                DateTime::<Utc>::from_sql(ty, raw)?.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            Type::JSON | Type::JSONB => CellValue::Json(serde_json::Value::from_sql(ty, raw)?),
            Type::UUID => CellValue::Text(uuid::Uuid::from_sql(ty, raw)?.to_string()),
            Type::BYTEA => {
                let mut hex = String::with_capacity(2 + raw.len() * 2);
                hex.push_str("\\x");
                for byte in raw {
                    let _ = write!(hex, "{:02x}", byte);
                }
                CellValue::Text(hex)
            }
            _ if <&str as FromSql>::accepts(ty) => CellValue::Text(<&str>::from_sql(ty, raw)?.to_string()),
            _ => return Err(format!("unsupported column type {}", ty.name()).into()),
        };
        Ok(value)
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(CellValue::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// A bound statement parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Decimal(String),
}

impl QueryParam {
    /// Build a decimal parameter, rejecting malformed literals
    pub fn decimal(literal: impl Into<String>) -> Result<Self, String> {
        let literal = literal.into();
        if numeric::is_decimal_literal(&literal) {
            Ok(QueryParam::Decimal(literal))
        } else {
            Err(format!("'{}' is not a decimal literal", literal))
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            QueryParam::Null => "null",
            QueryParam::Bool(_) => "boolean",
            QueryParam::Int(_) => "integer",
            QueryParam::Float(_) => "float",
            QueryParam::Text(_) => "text",
            QueryParam::Decimal(_) => "decimal",
        }
    }
}

fn mismatch(param: &QueryParam, ty: &Type) -> BoxError {
    format!("cannot bind {} parameter as {}", param.kind(), ty.name()).into()
}

impl ToSql for QueryParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if let Kind::Domain(base) = ty.kind() {
            return self.to_sql(base, out);
        }
        match self {
            QueryParam::Null => Ok(IsNull::Yes),
            QueryParam::Bool(v) => match *ty {
                Type::BOOL => v.to_sql(ty, out),
                _ if is_text_type(ty) => v.to_string().as_str().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            QueryParam::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::INT8 => v.to_sql(ty, out),
                Type::OID => u32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::NUMERIC => {
                    numeric::encode(&v.to_string(), out)?;
                    Ok(IsNull::No)
                }
                _ if is_text_type(ty) => v.to_string().as_str().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            QueryParam::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => v.to_sql(ty, out),
                Type::NUMERIC if v.is_finite() => {
                    numeric::encode(&v.to_string(), out)?;
                    Ok(IsNull::No)
                }
                _ if is_text_type(ty) => v.to_string().as_str().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            QueryParam::Text(s) => match *ty {
                Type::NUMERIC => {
                    numeric::encode(s, out)?;
                    Ok(IsNull::No)
                }
                Type::INT2 | Type::INT4 | Type::INT8 => {
                    QueryParam::Int(s.trim().parse::<i64>()?).to_sql(ty, out)
                }
                Type::FLOAT4 | Type::FLOAT8 => {
                    QueryParam::Float(s.trim().parse::<f64>()?).to_sql(ty, out)
                }
                Type::BOOL => QueryParam::Bool(s.trim().parse::<bool>()?).to_sql(ty, out),
                _ if <&str as ToSql>::accepts(ty) => s.as_str().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            QueryParam::Decimal(s) => match *ty {
                Type::NUMERIC => {
                    numeric::encode(s, out)?;
                    Ok(IsNull::No)
                }
                Type::FLOAT4 | Type::FLOAT8 => {
                    QueryParam::Float(s.parse::<f64>()?).to_sql(ty, out)
                }
                Type::INT2 | Type::INT4 | Type::INT8 => {
                    QueryParam::Int(s.parse::<i64>()?).to_sql(ty, out)
                }
                _ if is_text_type(ty) => s.as_str().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(ty: &Type, raw: &[u8]) -> CellValue {
        CellValue::from_sql(ty, raw).unwrap()
    }

    #[test]
    fn test_integer_and_bool_decoding() {
        assert_eq!(decode(&Type::INT8, &42i64.to_be_bytes()), CellValue::Int(42));
        assert_eq!(decode(&Type::INT4, &(-7i32).to_be_bytes()), CellValue::Int(-7));
        assert_eq!(decode(&Type::BOOL, &[1]), CellValue::Bool(true));
    }

    #[test]
    fn test_text_decoding() {
        assert_eq!(
            decode(&Type::VARCHAR, b"hello"),
            CellValue::Text("hello".to_string())
        );
    }

    #[test]
    fn test_numeric_decodes_to_exact_string() {
        let mut buf = BytesMut::new();
        numeric::encode("12345.6789", &mut buf).unwrap();
        assert_eq!(
            decode(&Type::NUMERIC, &buf),
            CellValue::Decimal("12345.6789".to_string())
        );
    }

    #[test]
    fn test_null_decoding() {
        assert_eq!(CellValue::from_sql_null(&Type::INT8).unwrap(), CellValue::Null);
    }

    #[test]
    fn test_bytea_hex() {
        assert_eq!(
            decode(&Type::BYTEA, &[0xde, 0xad]),
            CellValue::Text("\\xdead".to_string())
        );
    }

    #[test]
    fn test_cell_serialization() {
        let row = vec![
            CellValue::Null,
            CellValue::Int(3),
            CellValue::Decimal("0.10".to_string()),
            CellValue::Float(f64::NAN),
            CellValue::Float(f64::NEG_INFINITY),
            CellValue::Json(json!({"a": 1})),
        ];
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            json!([null, 3, "0.10", "NaN", "-Infinity", {"a": 1}])
        );
    }

    #[test]
    fn test_decimal_param_binds_as_text_unchanged() {
        let param = QueryParam::decimal("12345.6789").unwrap();
        let mut buf = BytesMut::new();
        param.to_sql(&Type::TEXT, &mut buf).unwrap();
        assert_eq!(&buf[..], b"12345.6789");
    }

    #[test]
    fn test_decimal_param_binds_as_numeric() {
        let param = QueryParam::decimal("-0.005").unwrap();
        let mut buf = BytesMut::new();
        param.to_sql(&Type::NUMERIC, &mut buf).unwrap();
        assert_eq!(numeric::decode(&buf).unwrap(), "-0.005");
    }

    #[test]
    fn test_malformed_decimal_rejected() {
        assert!(QueryParam::decimal("12.3.4").is_err());
        assert!(QueryParam::decimal("abc").is_err());
    }

    #[test]
    fn test_int_param_out_of_range_for_int2() {
        let mut buf = BytesMut::new();
        assert!(QueryParam::Int(100_000).to_sql(&Type::INT2, &mut buf).is_err());
    }

    #[test]
    fn test_bool_param_rejects_timestamp() {
        let mut buf = BytesMut::new();
        match QueryParam::Bool(true).to_sql(&Type::TIMESTAMP, &mut buf) {
            Err(err) => assert!(err.to_string().contains("cannot bind boolean")),
            Ok(_) => panic!("boolean must not bind as timestamp"),
        }
    }
}
