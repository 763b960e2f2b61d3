//! Typed column values carried through backup artifacts.

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

/// A single SQLite column value.
///
/// Serialized externally tagged (`"null"`, `{"integer": 1}`, `{"blob": "00ff"}`)
/// so integers and reals survive a JSON round trip unambiguously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes, hex encoded in JSON.
    Blob(#[serde(with = "hex_bytes")] Vec<u8>),
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(i) => ValueRef::Integer(*i),
            SqlValue::Real(f) => ValueRef::Real(*f),
            SqlValue::Text(t) => ValueRef::Text(t.as_bytes()),
            SqlValue::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        assert_eq!(serde_json::to_string(&SqlValue::Null).unwrap(), "\"null\"");
        assert_eq!(
            serde_json::to_string(&SqlValue::Integer(7)).unwrap(),
            "{\"integer\":7}"
        );
        assert_eq!(
            serde_json::to_string(&SqlValue::Blob(vec![0, 255])).unwrap(),
            "{\"blob\":\"00ff\"}"
        );
    }

    #[test]
    fn test_real_stays_real() {
        let json = serde_json::to_string(&SqlValue::Real(1.0)).unwrap();
        let back: SqlValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SqlValue::Real(1.0));
    }

    #[test]
    fn test_bind_and_read_back() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a, b, c, d, e)").unwrap();
        let values = [
            SqlValue::Null,
            SqlValue::Integer(-3),
            SqlValue::Real(2.5),
            SqlValue::Text("semi;colon".into()),
            SqlValue::Blob(vec![1, 2, 3]),
        ];
        conn.execute(
            "INSERT INTO t VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params_from_iter(values.iter()),
        )
        .unwrap();

        let read: Vec<SqlValue> = conn
            .query_row("SELECT a, b, c, d, e FROM t", [], |row| {
                (0..5).map(|i| row.get_ref(i).map(SqlValue::from)).collect()
            })
            .unwrap();
        assert_eq!(read, values.to_vec());
    }
}
