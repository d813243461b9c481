//! Query-related data models.
//!
//! This module defines parameter values, result sets and pagination types
//! shared by every dialect.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// One result row: field name to JSON value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// Default sort column for `paginate` when none is given.
pub const DEFAULT_ORDER_BY: &str = "created_at";

/// Largest page size `paginate` accepts.
pub const MAX_PAGE_LIMIT: u64 = 10_000;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arrays and objects, bound as JSON where the engine supports it
    Json(JsonValue),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Convert a JSON value taken from a record into a bindable parameter.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Inverse of [`QueryParam::from_json`], used by document stores.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => JsonValue::from(*f),
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Json(v) => v.clone(),
            Self::Bytes(bytes) => {
                use base64::{Engine as _, engine::general_purpose::STANDARD};
                JsonValue::String(STANDARD.encode(bytes))
            }
        }
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for QueryParam {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for QueryParam {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for QueryParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&JsonValue> for QueryParam {
    fn from(value: &JsonValue) -> Self {
        Self::from_json(value)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Result of a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
    /// Field names in column order, after dialect normalization.
    pub fields: Vec<String>,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn new(fields: Vec<String>, rows: Vec<Row>, elapsed: Duration) -> Self {
        Self {
            row_count: rows.len(),
            rows,
            fields,
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }

    /// Concatenate several results, e.g. from a shard fan-out.
    ///
    /// Field names come from the first non-empty part; execution time is the
    /// slowest part since parts run concurrently.
    pub fn merge(parts: impl IntoIterator<Item = QueryResult>) -> Self {
        let mut merged = Self::default();
        for part in parts {
            if merged.fields.is_empty() {
                merged.fields = part.fields;
            }
            merged.execution_time_ms = merged.execution_time_ms.max(part.execution_time_ms);
            merged.rows.extend(part.rows);
        }
        merged.row_count = merged.rows.len();
        merged
    }

    /// First column of the first row, if any.
    pub fn scalar(&self) -> Option<&JsonValue> {
        self.rows.first().and_then(|row| row.values().next())
    }
}

/// Sort direction for `paginate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Request for one page of a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u64,
    pub limit: u64,
    /// Equality filters. Null values are ignored.
    #[serde(default)]
    pub filters: Row,
    /// Defaults to [`DEFAULT_ORDER_BY`].
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub direction: SortDirection,
}

impl PageRequest {
    pub fn new(page: u64, limit: u64) -> Self {
        Self {
            page,
            limit,
            filters: Row::new(),
            order_by: None,
            direction: SortDirection::default(),
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(field.into());
        self.direction = direction;
        self
    }

    pub fn order_column(&self) -> &str {
        self.order_by.as_deref().unwrap_or(DEFAULT_ORDER_BY)
    }

    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }

    /// Filters with null values removed.
    pub fn active_filters(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.filters.iter().filter(|(_, v)| !v.is_null())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.page == 0 {
            return Err("page must be 1 or greater".to_string());
        }
        if self.limit == 0 {
            return Err("limit must be greater than 0".to_string());
        }
        if self.limit > MAX_PAGE_LIMIT {
            return Err(format!("limit must be at most {}", MAX_PAGE_LIMIT));
        }
        // page * limit becomes a LIMIT clause, which drivers read as i64
        match self.page.checked_mul(self.limit) {
            Some(window) if window <= i64::MAX as u64 => Ok(()),
            _ => Err(format!("page {} is out of range", self.page)),
        }
    }
}

/// One page of rows plus totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResult {
    pub data: Vec<Row>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl PaginatedResult {
    pub fn new(data: Vec<Row>, total: u64, page: u64, limit: u64) -> Self {
        let total_pages = if limit == 0 { 0 } else { total.div_ceil(limit) };
        Self {
            data,
            total,
            page,
            limit,
            total_pages,
        }
    }
}

/// One entry of a bulk update: the row's primary key and its new values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowUpdate {
    pub id: JsonValue,
    pub changes: Row,
}

impl RowUpdate {
    pub fn new(id: impl Into<JsonValue>, changes: Row) -> Self {
        Self {
            id: id.into(),
            changes,
        }
    }
}

/// Interpret a count-like JSON value (number or numeric string).
pub fn json_to_u64(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|i| i.max(0) as u64))
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Interpret a flag-like JSON value (`true`, `1`, `"YES"`, `"Y"`, `"t"`).
pub fn json_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "yes" | "y" | "true" | "t" | "1"
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_from_json() {
        assert_eq!(QueryParam::from_json(&json!(null)), QueryParam::Null);
        assert_eq!(QueryParam::from_json(&json!(42)), QueryParam::Int(42));
        assert_eq!(QueryParam::from_json(&json!(1.5)), QueryParam::Float(1.5));
        assert_eq!(
            QueryParam::from_json(&json!("a")),
            QueryParam::String("a".to_string())
        );
        assert!(matches!(
            QueryParam::from_json(&json!({"k": 1})),
            QueryParam::Json(_)
        ));
    }

    #[test]
    fn test_query_param_deserialize_untagged() {
        let params: Vec<QueryParam> = serde_json::from_str(r#"[null, true, 7, 2.5, "x"]"#).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Int(7),
                QueryParam::Float(2.5),
                QueryParam::String("x".to_string()),
            ]
        );
    }

    #[test]
    fn test_total_pages_rounds_up() {
        let page = PaginatedResult::new(Vec::new(), 25, 2, 10);
        assert_eq!(page.total_pages, 3);
        assert_eq!(PaginatedResult::new(Vec::new(), 0, 1, 10).total_pages, 0);
        assert_eq!(PaginatedResult::new(Vec::new(), 30, 1, 10).total_pages, 3);
    }

    #[test]
    fn test_paginated_result_serializes_camel_case() {
        let value = serde_json::to_value(PaginatedResult::new(Vec::new(), 5, 1, 2)).unwrap();
        assert_eq!(value["totalPages"], 3);
    }

    #[test]
    fn test_page_request_offset_and_filters() {
        let request = PageRequest::new(3, 10)
            .filter("status", "ONLINE")
            .filter("region", JsonValue::Null);
        assert_eq!(request.offset(), 20);
        assert_eq!(request.order_column(), DEFAULT_ORDER_BY);
        let active: Vec<_> = request.active_filters().map(|(k, _)| k.as_str()).collect();
        assert_eq!(active, vec!["status"]);
        assert!(PageRequest::new(0, 10).validate().is_err());
        assert!(PageRequest::new(1, 0).validate().is_err());
    }

    #[test]
    fn test_page_request_bounds() {
        assert!(PageRequest::new(1, MAX_PAGE_LIMIT).validate().is_ok());
        assert!(PageRequest::new(1, MAX_PAGE_LIMIT + 1).validate().is_err());
        assert!(PageRequest::new(u64::MAX, 10).validate().is_err());
        assert!(PageRequest::new(i64::MAX as u64 / 10 + 1, 10).validate().is_err());
        assert!(PageRequest::new(i64::MAX as u64 / 10, 10).validate().is_ok());
    }

    #[test]
    fn test_merge_concatenates_rows() {
        let mut row = Row::new();
        row.insert("id".to_string(), json!(1));
        let a = QueryResult::new(vec!["id".to_string()], vec![row.clone()], Duration::from_millis(5));
        let b = QueryResult::new(vec!["id".to_string()], vec![row.clone(), row], Duration::from_millis(9));
        let merged = QueryResult::merge([a, b]);
        assert_eq!(merged.row_count, 3);
        assert_eq!(merged.execution_time_ms, 9);
        assert_eq!(merged.fields, vec!["id".to_string()]);
    }

    #[test]
    fn test_json_helpers() {
        assert_eq!(json_to_u64(&json!(12)), Some(12));
        assert_eq!(json_to_u64(&json!("34")), Some(34));
        assert_eq!(json_to_u64(&json!(null)), None);
        assert!(json_truthy(&json!("YES")));
        assert!(json_truthy(&json!(1)));
        assert!(!json_truthy(&json!("NO")));
        assert!(!json_truthy(&json!(0)));
    }
}
