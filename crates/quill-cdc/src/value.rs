//! Owned SQLite values for change records.
//!
//! Unlike sqlx's borrowed value types, these can outlive the database
//! connection and be shipped between nodes. The serde representation is
//! untagged so the wire encoding stays self-describing: SQL NULL maps to
//! JSON null, integers and floats are native numbers, text is a string and
//! blobs travel as byte arrays.

use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteValueRef};
use sqlx::{Decode, TypeInfo, ValueRef};

use crate::CdcError;

/// An owned SQLite value, one of the engine's five storage classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// SQL NULL value.
    Null,
    /// 64-bit signed integer (SQLite INTEGER).
    Integer(i64),
    /// 64-bit IEEE floating point (SQLite REAL).
    Real(f64),
    /// UTF-8 string (SQLite TEXT).
    Text(String),
    /// Raw bytes (SQLite BLOB).
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Normalises the value for cross-platform stability using the column's
    /// declared type as the decision rule: blobs stored in text-like
    /// columns (TEXT/CHAR/CLOB/JSON/DATE/TIME declarations) become text,
    /// everything else is kept as-is. Binary-declared columns keep raw
    /// bytes.
    pub fn normalized_for(self, declared_type: &str) -> Self {
        match self {
            SqlValue::Blob(bytes) if is_text_like(declared_type) => {
                SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            other => other,
        }
    }

    /// Appends this value to a query's bind arguments.
    pub fn bind<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            SqlValue::Null => query.bind(Option::<i64>::None),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Blob(b) => query.bind(b.clone()),
        }
    }
}

/// Returns true when a declared column type carries textual data.
pub fn is_text_like(declared_type: &str) -> bool {
    let declared = declared_type.to_ascii_uppercase();
    ["TEXT", "CHAR", "CLOB", "JSON", "DATE", "TIME"]
        .iter()
        .any(|needle| declared.contains(needle))
}

/// Converts a borrowed SQLite value reference into an owned [`SqlValue`].
///
/// The conversion copies the underlying data; the pre-update hook relies on
/// this to capture row values before the engine's transient buffers are
/// reused.
impl<'r> TryFrom<SqliteValueRef<'r>> for SqlValue {
    type Error = CdcError;

    fn try_from(value: SqliteValueRef<'r>) -> Result<Self, Self::Error> {
        match value.type_info().name() {
            "NULL" => Ok(SqlValue::Null),
            "INTEGER" => Ok(SqlValue::Integer(Decode::<Sqlite>::decode(value).map_err(
                |e| CdcError::DecodeError {
                    type_name: "INTEGER",
                    source: e,
                },
            )?)),
            "REAL" => Ok(SqlValue::Real(Decode::<Sqlite>::decode(value).map_err(
                |e| CdcError::DecodeError {
                    type_name: "REAL",
                    source: e,
                },
            )?)),
            "TEXT" => Ok(SqlValue::Text(Decode::<Sqlite>::decode(value).map_err(
                |e| CdcError::DecodeError {
                    type_name: "TEXT",
                    source: e,
                },
            )?)),
            "BLOB" => Ok(SqlValue::Blob(Decode::<Sqlite>::decode(value).map_err(
                |e| CdcError::DecodeError {
                    type_name: "BLOB",
                    source: e,
                },
            )?)),
            other => Err(CdcError::UnsupportedSqliteType {
                type_name: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_untagged() {
        let values = vec![
            SqlValue::Null,
            SqlValue::Integer(42),
            SqlValue::Real(1.5),
            SqlValue::Text("alice".to_string()),
            SqlValue::Blob(vec![1, 2, 3]),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,42,1.5,"alice",[1,2,3]]"#);
    }

    #[test]
    fn round_trips_through_json() {
        let values = vec![
            SqlValue::Null,
            SqlValue::Integer(-7),
            SqlValue::Real(0.25),
            SqlValue::Text("x".to_string()),
            SqlValue::Blob(vec![0xff, 0x00]),
        ];
        let json = serde_json::to_vec(&values).unwrap();
        let back: Vec<SqlValue> = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn text_like_declarations() {
        for decl in ["TEXT", "VARCHAR(20)", "clob", "JSON", "DATETIME", "DATE"] {
            assert!(is_text_like(decl), "{decl}");
        }
        for decl in ["BLOB", "INTEGER", "REAL", ""] {
            assert!(!is_text_like(decl), "{decl}");
        }
    }

    #[test]
    fn normalizes_blobs_in_text_columns_only() {
        let blob = SqlValue::Blob(b"ABC".to_vec());
        assert_eq!(
            blob.clone().normalized_for("TEXT"),
            SqlValue::Text("ABC".to_string())
        );
        assert_eq!(blob.clone().normalized_for("BLOB"), blob);
        assert_eq!(
            SqlValue::Integer(7).normalized_for("TEXT"),
            SqlValue::Integer(7)
        );
    }
}
