//! MongoDB backend (feature `mongodb`).
//!
//! Collections stand in for tables and BSON filters for SQL. `query` and
//! `execute` take a JSON command document (e.g. `{"find": "servers"}`)
//! run through `runCommand`. Documents leave this module as JSON rows with
//! `_id` mapped to `id`.

use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDefinition, ConnectionConfig, DatabaseType, IndexDefinition, IndexInfo, PageRequest,
    QueryResult, Row, SortDirection, TableSchema,
};
use futures_util::TryStreamExt;
use mongodb::bson::{Bson, Document, doc, oid::ObjectId};
use mongodb::options::{ClientOptions, FindOptions, IndexOptions};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const MONGO_ID: &str = "_id";

#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        let mut uri = String::from("mongodb://");
        if let Some(username) = &config.username {
            uri.push_str(&url_encode(username));
            if let Some(password) = &config.password {
                uri.push(':');
                uri.push_str(&url_encode(password));
            }
            uri.push('@');
        }
        uri.push_str(&format!(
            "{}:{}/{}",
            config.host,
            config.port_or_default(DatabaseType::MongoDB),
            config.database
        ));
        if config.ssl {
            uri.push_str("?tls=true");
        }

        let timeout = Duration::from_secs(config.timeout_or_default());
        let mut options = ClientOptions::parse(&uri).await?;
        options.max_pool_size = Some(config.pool_size_or_default(DatabaseType::MongoDB));
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        options.app_name = Some("unidb".to_string());

        let client = Client::with_options(options)?;
        let db = client.database(&config.database);
        let store = Self { client, db };
        store.ping().await.map_err(|e| {
            let message = e.to_string();
            DbError::connection(
                format!("Failed to connect: {}", message),
                crate::db::pool::connection_suggestion(DatabaseType::MongoDB, &message),
            )
        })?;
        info!(endpoint = %config.endpoint(DatabaseType::MongoDB), "Connected to MongoDB");
        Ok(store)
    }

    pub async fn close(&self) {
        // Client handles share one topology; shutting down a clone is safe.
        self.client.clone().shutdown().await;
    }

    pub async fn ping(&self) -> DbResult<()> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    pub async fn version(&self) -> DbResult<String> {
        let info = self.db.run_command(doc! { "buildInfo": 1 }, None).await?;
        Ok(info.get_str("version").unwrap_or("unknown").to_string())
    }

    fn collection(&self, table: &str) -> DbResult<Collection<Document>> {
        validate_collection(table)?;
        Ok(self.db.collection::<Document>(table))
    }

    /// Run a JSON command document and return its documents as rows.
    pub async fn command(&self, command: &str, limit: Duration) -> DbResult<QueryResult> {
        let start = Instant::now();
        let command = parse_command(command)?;
        let reply = with_timeout(limit, self.db.run_command(command, None)).await?;
        Ok(reply_to_result(reply, start))
    }

    /// Run a JSON command document and return its `n` count.
    pub async fn command_count(&self, command: &str, limit: Duration) -> DbResult<u64> {
        let command = parse_command(command)?;
        let reply = with_timeout(limit, self.db.run_command(command, None)).await?;
        Ok(reply_count(&reply))
    }

    pub async fn insert(&self, table: &str, record: &Row) -> DbResult<Row> {
        let document = to_document(record)?;
        let result = self.collection(table)?.insert_one(document.clone(), None).await?;
        Ok(inserted(document, result.inserted_id))
    }

    pub async fn bulk_insert(&self, table: &str, records: &[Row]) -> DbResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let documents = records
            .iter()
            .map(to_document)
            .collect::<DbResult<Vec<_>>>()?;
        let result = self.collection(table)?.insert_many(documents, None).await?;
        Ok(result.inserted_ids.len() as u64)
    }

    pub async fn update(
        &self,
        table: &str,
        key: &str,
        id: &JsonValue,
        changes: &Row,
    ) -> DbResult<u64> {
        let update = doc! { "$set": to_document(changes)? };
        let result = self
            .collection(table)?
            .update_one(key_filter(key, id)?, update, None)
            .await?;
        Ok(result.matched_count)
    }

    pub async fn delete(&self, table: &str, key: &str, id: &JsonValue) -> DbResult<u64> {
        let result = self
            .collection(table)?
            .delete_one(key_filter(key, id)?, None)
            .await?;
        Ok(result.deleted_count)
    }

    pub async fn find_one(&self, table: &str, key: &str, id: &JsonValue) -> DbResult<Option<Row>> {
        let found = self
            .collection(table)?
            .find_one(key_filter(key, id)?, None)
            .await?;
        Ok(found.map(document_to_row))
    }

    pub async fn find_by_field(&self, table: &str, field: &str, value: &JsonValue) -> DbResult<Vec<Row>> {
        let filter = key_filter(field, value)?;
        self.find(table, filter, None).await
    }

    async fn find(
        &self,
        table: &str,
        filter: Document,
        options: Option<FindOptions>,
    ) -> DbResult<Vec<Row>> {
        let cursor = self.collection(table)?.find(filter, options).await?;
        let documents: Vec<Document> = cursor.try_collect().await?;
        Ok(documents.into_iter().map(document_to_row).collect())
    }

    /// Total matching documents plus one window of them.
    pub async fn count_and_window(
        &self,
        table: &str,
        request: &PageRequest,
        limit: u64,
        offset: u64,
    ) -> DbResult<(u64, Vec<Row>)> {
        let mut filter = Document::new();
        for (field, value) in request.active_filters() {
            filter.insert(mongo_field(field), to_bson(value)?);
        }
        let total = self
            .collection(table)?
            .count_documents(filter.clone(), None)
            .await?;
        let direction = match request.direction {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        };
        let options = FindOptions::builder()
            .sort(doc! { mongo_field(request.order_column()): direction })
            .skip(offset)
            .limit(limit as i64)
            .build();
        let rows = self.find(table, filter, Some(options)).await?;
        Ok((total, rows))
    }

    /// Case-insensitive regex OR-match, ordered by `key` ascending.
    pub async fn search(
        &self,
        table: &str,
        fields: &[String],
        term: &str,
        key: &str,
        limit: u64,
    ) -> DbResult<Vec<Row>> {
        if fields.is_empty() {
            return Err(DbError::invalid_input("Search requires at least one field"));
        }
        let pattern = escape_regex(term);
        let clauses: Vec<Document> = fields
            .iter()
            .map(|field| doc! { mongo_field(field): { "$regex": pattern.as_str(), "$options": "i" } })
            .collect();
        let options = FindOptions::builder()
            .sort(doc! { mongo_field(key): 1 })
            .limit(limit as i64)
            .build();
        self.find(table, doc! { "$or": clauses }, Some(options)).await
    }

    pub async fn table_exists(&self, table: &str) -> DbResult<bool> {
        validate_collection(table)?;
        let names = self
            .db
            .list_collection_names(doc! { "name": table })
            .await?;
        Ok(!names.is_empty())
    }

    /// Schema inferred from one sample document plus the collection indexes.
    pub async fn describe(&self, table: &str) -> DbResult<TableSchema> {
        if !self.table_exists(table).await? {
            return Err(DbError::schema("Collection not found", table));
        }
        let sample = self.collection(table)?.find_one(None, None).await?;
        let mut schema = TableSchema::new(table);
        if let Some(sample) = sample {
            for (field, value) in &sample {
                let name = if field == MONGO_ID { "id" } else { field.as_str() };
                schema = schema.with_column(
                    ColumnDefinition::new(name, bson_type_name(value), true)
                        .with_primary_key(field == MONGO_ID),
                );
            }
        }
        Ok(schema.with_indexes(self.list_indexes(table).await?))
    }

    pub async fn create_index(&self, table: &str, index: &IndexDefinition) -> DbResult<()> {
        if index.columns.is_empty() {
            return Err(DbError::invalid_input("Index requires at least one column"));
        }
        let mut keys = Document::new();
        for column in &index.columns {
            keys.insert(mongo_field(column), 1);
        }
        let model = IndexModel::builder()
            .keys(keys)
            .options(
                IndexOptions::builder()
                    .name(index.name.clone())
                    .unique(index.unique)
                    .build(),
            )
            .build();
        self.collection(table)?.create_index(model, None).await?;
        Ok(())
    }

    pub async fn list_indexes(&self, table: &str) -> DbResult<Vec<IndexInfo>> {
        let cursor = self.collection(table)?.list_indexes(None).await?;
        let models: Vec<IndexModel> = cursor.try_collect().await?;
        Ok(models
            .into_iter()
            .map(|model| {
                let columns: Vec<String> = model
                    .keys
                    .keys()
                    .map(|k| if k == MONGO_ID { "id".to_string() } else { k.clone() })
                    .collect();
                let options = model.options.unwrap_or_default();
                let is_primary = columns == ["id"];
                IndexInfo::new(options.name.unwrap_or_default(), columns)
                    .with_unique(options.unique.unwrap_or(false))
                    .with_primary(is_primary)
            })
            .collect())
    }

    pub async fn begin(&self) -> DbResult<MongoTransaction> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        debug!("MongoDB session transaction started");
        Ok(MongoTransaction {
            session,
            db: self.db.clone(),
        })
    }
}

/// Multi-document transaction bound to one client session.
pub struct MongoTransaction {
    session: ClientSession,
    db: Database,
}

impl MongoTransaction {
    fn collection(&self, table: &str) -> DbResult<Collection<Document>> {
        validate_collection(table)?;
        Ok(self.db.collection::<Document>(table))
    }

    pub async fn command(&mut self, command: &str, limit: Duration) -> DbResult<QueryResult> {
        let start = Instant::now();
        let command = parse_command(command)?;
        let reply = with_timeout(
            limit,
            self.db
                .run_command_with_session(command, None, &mut self.session),
        )
        .await?;
        Ok(reply_to_result(reply, start))
    }

    pub async fn command_count(&mut self, command: &str, limit: Duration) -> DbResult<u64> {
        let command = parse_command(command)?;
        let reply = with_timeout(
            limit,
            self.db
                .run_command_with_session(command, None, &mut self.session),
        )
        .await?;
        Ok(reply_count(&reply))
    }

    pub async fn insert(&mut self, table: &str, record: &Row) -> DbResult<Row> {
        let document = to_document(record)?;
        let result = self
            .collection(table)?
            .insert_one_with_session(document.clone(), None, &mut self.session)
            .await?;
        Ok(inserted(document, result.inserted_id))
    }

    pub async fn update(
        &mut self,
        table: &str,
        key: &str,
        id: &JsonValue,
        changes: &Row,
    ) -> DbResult<u64> {
        let update = doc! { "$set": to_document(changes)? };
        let result = self
            .collection(table)?
            .update_one_with_session(key_filter(key, id)?, update, None, &mut self.session)
            .await?;
        Ok(result.matched_count)
    }

    pub async fn delete(&mut self, table: &str, key: &str, id: &JsonValue) -> DbResult<u64> {
        let result = self
            .collection(table)?
            .delete_one_with_session(key_filter(key, id)?, None, &mut self.session)
            .await?;
        Ok(result.deleted_count)
    }

    pub async fn find_one(
        &mut self,
        table: &str,
        key: &str,
        id: &JsonValue,
    ) -> DbResult<Option<Row>> {
        let found = self
            .collection(table)?
            .find_one_with_session(key_filter(key, id)?, None, &mut self.session)
            .await?;
        Ok(found.map(document_to_row))
    }

    pub async fn commit(mut self) -> DbResult<()> {
        self.session.commit_transaction().await?;
        Ok(())
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        self.session.abort_transaction().await?;
        Ok(())
    }
}

async fn with_timeout<T>(
    limit: Duration,
    future: impl std::future::Future<Output = mongodb::error::Result<T>>,
) -> DbResult<T> {
    match tokio::time::timeout(limit, future).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(crate::db::executor::timeout_error("command execution", limit)),
    }
}

fn validate_collection(name: &str) -> DbResult<()> {
    if name.is_empty() || name.starts_with("system.") || name.contains('$') || name.contains('\0')
    {
        return Err(DbError::invalid_input(format!(
            "Invalid collection name '{}'",
            name
        )));
    }
    Ok(())
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn parse_command(command: &str) -> DbResult<Document> {
    let json: JsonValue = serde_json::from_str(command)
        .map_err(|e| DbError::invalid_input(format!("MongoDB command must be a JSON document: {}", e)))?;
    match Bson::try_from(json) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(_) => Err(DbError::invalid_input("MongoDB command must be a JSON object")),
        Err(e) => Err(DbError::invalid_input(format!("Invalid MongoDB command: {}", e))),
    }
}

fn to_bson(value: &JsonValue) -> DbResult<Bson> {
    Bson::try_from(value.clone())
        .map_err(|e| DbError::invalid_input(format!("Value cannot be stored as BSON: {}", e)))
}

/// Record to document, storing `id` as `_id` unless both are present.
fn to_document(record: &Row) -> DbResult<Document> {
    let mut document = Document::new();
    let has_mongo_id = record.contains_key(MONGO_ID);
    for (field, value) in record {
        let name = if field == "id" && !has_mongo_id { MONGO_ID } else { field.as_str() };
        document.insert(name, to_bson(value)?);
    }
    Ok(document)
}

fn mongo_field(field: &str) -> String {
    if field == "id" {
        MONGO_ID.to_string()
    } else {
        field.to_string()
    }
}

/// Equality filter on `key`, accepting hex strings for ObjectId keys.
fn key_filter(key: &str, id: &JsonValue) -> DbResult<Document> {
    let field = mongo_field(key);
    let value = match id {
        JsonValue::String(s) if field == MONGO_ID => match ObjectId::parse_str(s) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => Bson::String(s.clone()),
        },
        other => to_bson(other)?,
    };
    Ok(doc! { field: value })
}

fn inserted(mut document: Document, inserted_id: Bson) -> Row {
    if !document.contains_key(MONGO_ID) {
        document.insert(MONGO_ID, inserted_id);
    }
    document_to_row(document)
}

fn bson_to_json(value: Bson) -> JsonValue {
    match value {
        Bson::ObjectId(oid) => JsonValue::String(oid.to_hex()),
        Bson::DateTime(dt) => JsonValue::String(
            dt.try_to_rfc3339_string()
                .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        ),
        Bson::Document(document) => JsonValue::Object(document_to_row(document)),
        Bson::Array(items) => JsonValue::Array(items.into_iter().map(bson_to_json).collect()),
        other => other.into_relaxed_extjson(),
    }
}

/// Field mapping step: `_id` becomes `id`.
fn document_to_row(document: Document) -> Row {
    document
        .into_iter()
        .map(|(field, value)| {
            let name = if field == MONGO_ID { "id".to_string() } else { field };
            (name, bson_to_json(value))
        })
        .collect()
}

/// Rows from a command reply: the cursor batch when present, else the reply.
fn reply_to_result(reply: Document, start: Instant) -> QueryResult {
    let batch = reply
        .get_document("cursor")
        .ok()
        .and_then(|cursor| cursor.get_array("firstBatch").ok())
        .cloned();
    let rows: Vec<Row> = match batch {
        Some(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Bson::Document(document) => Some(document_to_row(document)),
                _ => None,
            })
            .collect(),
        None => vec![document_to_row(reply)],
    };
    let fields = rows
        .first()
        .map(|row| row.keys().cloned().collect())
        .unwrap_or_default();
    QueryResult::new(fields, rows, start.elapsed())
}

fn reply_count(reply: &Document) -> u64 {
    match reply.get("n") {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) => n.max(0.0) as u64,
        _ => 0,
    }
}

fn bson_type_name(value: &Bson) -> String {
    format!("{:?}", value.element_type()).to_lowercase()
}

fn escape_regex(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_id_mapping_round_trip() {
        let document = to_document(&row(json!({"id": "srv-1", "status": "ONLINE"}))).unwrap();
        assert_eq!(document.get_str("_id").unwrap(), "srv-1");
        let back = document_to_row(document);
        assert_eq!(back["id"], "srv-1");
        assert!(!back.contains_key("_id"));
    }

    #[test]
    fn test_key_filter_parses_object_ids() {
        let filter = key_filter("id", &json!("65a1f0c2e4b0a1b2c3d4e5f6")).unwrap();
        assert!(matches!(filter.get("_id"), Some(Bson::ObjectId(_))));
        let filter = key_filter("hostname", &json!("web")).unwrap();
        assert_eq!(filter.get_str("hostname").unwrap(), "web");
    }

    #[test]
    fn test_reply_to_result_uses_first_batch() {
        let reply = doc! {
            "cursor": { "firstBatch": [ { "_id": 1, "name": "a" }, { "_id": 2, "name": "b" } ], "id": 0_i64 },
            "ok": 1.0
        };
        let result = reply_to_result(reply, Instant::now());
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0]["id"], 1);
    }

    #[test]
    fn test_reply_count() {
        assert_eq!(reply_count(&doc! { "n": 3, "ok": 1.0 }), 3);
        assert_eq!(reply_count(&doc! { "ok": 1.0 }), 0);
    }

    #[test]
    fn test_escape_regex() {
        assert_eq!(escape_regex("a.b*"), "a\\.b\\*");
        assert_eq!(escape_regex("web"), "web");
    }

    #[test]
    fn test_parse_command_requires_object() {
        assert!(parse_command(r#"{"ping": 1}"#).is_ok());
        assert!(parse_command("[1, 2]").is_err());
        assert!(parse_command("SELECT 1").is_err());
    }
}
