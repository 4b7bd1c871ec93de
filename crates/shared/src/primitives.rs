use std::{fmt, str::FromStr};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(transparent)]
pub struct WrappedUuidV4(uuid::Uuid);

impl Default for WrappedUuidV4 {
    fn default() -> Self {
        Self::new()
    }
}

impl WrappedUuidV4 {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl FromStr for WrappedUuidV4 {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl fmt::Display for WrappedUuidV4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for WrappedUuidV4 {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(uuid::Uuid::parse_str(&value)?))
    }
}

impl libsql::FromValue for WrappedUuidV4 {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => {
                WrappedUuidV4::try_from(s).map_err(|_e| libsql::Error::InvalidColumnType)
            }
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

impl From<WrappedUuidV4> for libsql::Value {
    fn from(val: WrappedUuidV4) -> Self {
        libsql::Value::Text(val.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct WrappedJsonValue(serde_json::Value);

impl WrappedJsonValue {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn get_inner(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for WrappedJsonValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<WrappedJsonValue> for serde_json::Value {
    fn from(value: WrappedJsonValue) -> Self {
        value.0
    }
}

impl From<WrappedJsonValue> for libsql::Value {
    fn from(value: WrappedJsonValue) -> Self {
        libsql::Value::Text(value.0.to_string())
    }
}

impl libsql::FromValue for WrappedJsonValue {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => Ok(WrappedJsonValue::new(
                serde_json::from_str(&s).map_err(|_e| libsql::Error::InvalidColumnType)?,
            )),
            libsql::Value::Null => Ok(WrappedJsonValue::new(serde_json::Value::Null)),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct WrappedChronoDateTime(chrono::DateTime<chrono::Utc>);

impl WrappedChronoDateTime {
    pub fn new(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self(value)
    }

    pub fn now() -> Self {
        Self(chrono::Utc::now())
    }

    pub fn get_inner(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }
}

fn parse_sqlite_datetime(value: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    // SQLite datetime format first, RFC3339 as fallback
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(value).map(|dt| dt.into()))
        .map_err(|_e| anyhow::anyhow!("invalid datetime value: {value}"))
}

impl TryFrom<String> for WrappedChronoDateTime {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self(parse_sqlite_datetime(&value)?))
    }
}

impl TryFrom<&str> for WrappedChronoDateTime {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Self(parse_sqlite_datetime(value)?))
    }
}

impl fmt::Display for WrappedChronoDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for WrappedChronoDateTime {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self(value)
    }
}

impl From<WrappedChronoDateTime> for chrono::DateTime<chrono::Utc> {
    fn from(value: WrappedChronoDateTime) -> Self {
        value.0
    }
}

impl libsql::FromValue for WrappedChronoDateTime {
    fn from_sql(val: libsql::Value) -> libsql::Result<Self>
    where
        Self: Sized,
    {
        match val {
            libsql::Value::Text(s) => Ok(Self(
                parse_sqlite_datetime(&s).map_err(|_e| libsql::Error::InvalidColumnType)?,
            )),
            _ => Err(libsql::Error::InvalidColumnType),
        }
    }
}

impl From<WrappedChronoDateTime> for libsql::Value {
    fn from(value: WrappedChronoDateTime) -> Self {
        // SQLite's expected datetime format instead of RFC3339
        libsql::Value::Text(value.0.format("%Y-%m-%d %H:%M:%S%.f").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_roundtrips_through_sqlite_format() {
        let now = WrappedChronoDateTime::now();
        let value: libsql::Value = now.into();
        let back = <WrappedChronoDateTime as libsql::FromValue>::from_sql(value).unwrap();
        // sub-microsecond precision is not preserved by the storage format
        let delta = (*now.get_inner() - *back.get_inner()).num_milliseconds().abs();
        assert!(delta < 1);
    }

    #[test]
    fn datetime_parses_rfc3339_fallback() {
        let parsed = WrappedChronoDateTime::try_from("2026-08-01T10:00:00+02:00").unwrap();
        assert_eq!(parsed.get_inner().timezone(), chrono::Utc);
    }

    #[test]
    fn json_value_roundtrips() {
        let value = WrappedJsonValue::new(serde_json::json!({"a": [1, 2, 3]}));
        let sql: libsql::Value = value.clone().into();
        let back = <WrappedJsonValue as libsql::FromValue>::from_sql(sql).unwrap();
        assert_eq!(value, back);
    }
}
