//! Statement building on top of a [`Dialect`].
//!
//! All user-supplied values become bound parameters; identifiers are
//! validated and quoted. Nothing here touches a connection.

use crate::db::dialect::Dialect;
use crate::error::{DbError, DbResult};
use crate::models::{IndexDefinition, PageRequest, QueryParam, Row, SortDirection};
use serde_json::Value as JsonValue;

const MAX_IDENTIFIER_LEN: usize = 128;

/// SQL text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Check that `name` is a plain identifier, optionally `schema.`-qualified.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid = parts.len() <= 2
        && name.len() <= MAX_IDENTIFIER_LEN
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!(
            "Invalid identifier '{}': use letters, digits and underscores",
            name
        )))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SqlBuilder {
    dialect: &'static dyn Dialect,
}

impl SqlBuilder {
    pub fn new(dialect: &'static dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    /// Validate and quote a (possibly schema-qualified) identifier.
    pub fn quote(&self, name: &str) -> DbResult<String> {
        validate_identifier(name)?;
        Ok(name
            .split('.')
            .map(|part| self.dialect.quote_identifier(part))
            .collect::<Vec<_>>()
            .join("."))
    }

    fn push_param(&self, params: &mut Vec<QueryParam>, value: QueryParam) -> String {
        params.push(value);
        self.dialect.placeholder(params.len())
    }

    /// ` WHERE a = ? AND b = ?` for non-null filters, or an empty string.
    fn where_equals<'a>(
        &self,
        filters: impl IntoIterator<Item = (&'a String, &'a JsonValue)>,
        params: &mut Vec<QueryParam>,
    ) -> DbResult<String> {
        let mut clauses = Vec::new();
        for (field, value) in filters {
            let column = self.quote(field)?;
            let placeholder = self.push_param(params, QueryParam::from_json(value));
            clauses.push(format!("{column} = {placeholder}"));
        }
        if clauses.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!(" WHERE {}", clauses.join(" AND ")))
        }
    }

    pub fn insert(&self, table: &str, record: &Row) -> DbResult<Statement> {
        if record.is_empty() {
            return Err(DbError::invalid_input("Cannot insert an empty record"));
        }
        let table = self.quote(table)?;
        let mut params = Vec::with_capacity(record.len());
        let mut columns = Vec::with_capacity(record.len());
        let mut placeholders = Vec::with_capacity(record.len());
        for (field, value) in record {
            columns.push(self.quote(field)?);
            placeholders.push(self.push_param(&mut params, QueryParam::from_json(value)));
        }

        let mut sql = format!("INSERT INTO {table} ({})", columns.join(", "));
        if let Some(output) = self.dialect.output_clause() {
            sql.push(' ');
            sql.push_str(output);
        }
        sql.push_str(&format!(" VALUES ({})", placeholders.join(", ")));
        if let Some(returning) = self.dialect.returning_clause() {
            sql.push(' ');
            sql.push_str(returning);
        }
        Ok(Statement::new(sql, params))
    }

    /// Multi-row INSERT statements, chunked under the dialect's limits.
    ///
    /// Columns are the union of all record keys in first-seen order; a
    /// record missing a column binds NULL for it.
    pub fn bulk_insert(&self, table: &str, records: &[Row]) -> DbResult<Vec<Statement>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let mut fields: Vec<&String> = Vec::new();
        for record in records {
            for field in record.keys() {
                if !fields.contains(&field) {
                    fields.push(field);
                }
            }
        }
        if fields.is_empty() {
            return Err(DbError::invalid_input("Cannot insert empty records"));
        }

        let table = self.quote(table)?;
        let columns = fields
            .iter()
            .map(|f| self.quote(f))
            .collect::<DbResult<Vec<_>>>()?
            .join(", ");
        let rows_per_chunk = (self.dialect.max_bind_params() / fields.len())
            .min(self.dialect.max_rows_per_insert())
            .max(1);

        let mut statements = Vec::new();
        for chunk in records.chunks(rows_per_chunk) {
            let mut params = Vec::with_capacity(chunk.len() * fields.len());
            let mut groups = Vec::with_capacity(chunk.len());
            for record in chunk {
                let placeholders: Vec<String> = fields
                    .iter()
                    .map(|field| {
                        let value = record.get(*field).unwrap_or(&JsonValue::Null);
                        self.push_param(&mut params, QueryParam::from_json(value))
                    })
                    .collect();
                groups.push(format!("({})", placeholders.join(", ")));
            }
            let sql = self.dialect.bulk_insert_sql(&table, &columns, &groups);
            statements.push(Statement::new(sql, params));
        }
        Ok(statements)
    }

    pub fn update(
        &self,
        table: &str,
        key_column: &str,
        id: &JsonValue,
        changes: &Row,
    ) -> DbResult<Statement> {
        if changes.is_empty() {
            return Err(DbError::invalid_input("Update requires at least one field"));
        }
        let table = self.quote(table)?;
        let mut params = Vec::with_capacity(changes.len() + 1);
        let mut assignments = Vec::with_capacity(changes.len());
        for (field, value) in changes {
            let column = self.quote(field)?;
            let placeholder = self.push_param(&mut params, QueryParam::from_json(value));
            assignments.push(format!("{column} = {placeholder}"));
        }
        let key = self.quote(key_column)?;
        let placeholder = self.push_param(&mut params, QueryParam::from_json(id));
        Ok(Statement::new(
            format!(
                "UPDATE {table} SET {} WHERE {key} = {placeholder}",
                assignments.join(", ")
            ),
            params,
        ))
    }

    pub fn delete(&self, table: &str, key_column: &str, id: &JsonValue) -> DbResult<Statement> {
        let table = self.quote(table)?;
        let key = self.quote(key_column)?;
        let mut params = Vec::with_capacity(1);
        let placeholder = self.push_param(&mut params, QueryParam::from_json(id));
        Ok(Statement::new(
            format!("DELETE FROM {table} WHERE {key} = {placeholder}"),
            params,
        ))
    }

    /// `SELECT *` where `column` equals `value` (`IS NULL` for null).
    pub fn select_where(&self, table: &str, column: &str, value: &JsonValue) -> DbResult<Statement> {
        let table = self.quote(table)?;
        let column = self.quote(column)?;
        if value.is_null() {
            return Ok(Statement::new(
                format!("SELECT * FROM {table} WHERE {column} IS NULL"),
                Vec::new(),
            ));
        }
        let mut params = Vec::with_capacity(1);
        let placeholder = self.push_param(&mut params, QueryParam::from_json(value));
        Ok(Statement::new(
            format!("SELECT * FROM {table} WHERE {column} = {placeholder}"),
            params,
        ))
    }

    pub fn count(&self, table: &str, request: &PageRequest) -> DbResult<Statement> {
        let table = self.quote(table)?;
        let mut params = Vec::new();
        let where_clause = self.where_equals(request.active_filters(), &mut params)?;
        Ok(Statement::new(
            format!("SELECT COUNT(*) AS cnt FROM {table}{where_clause}"),
            params,
        ))
    }

    /// Filtered, ordered window of `table`.
    pub fn page(
        &self,
        table: &str,
        request: &PageRequest,
        limit: u64,
        offset: u64,
    ) -> DbResult<Statement> {
        let table = self.quote(table)?;
        let order_column = self.quote(request.order_column())?;
        let mut params = Vec::new();
        let where_clause = self.where_equals(request.active_filters(), &mut params)?;
        let select = format!(
            "SELECT * FROM {table}{where_clause} ORDER BY {order_column} {}",
            request.direction.as_sql()
        );
        Ok(Statement::new(
            self.dialect.limit_offset(&select, limit, offset),
            params,
        ))
    }

    /// Case-insensitive OR-match of `term` across `fields`, ordered by
    /// `key_column` ascending.
    pub fn search(
        &self,
        table: &str,
        fields: &[String],
        term: &str,
        key_column: &str,
        limit: u64,
    ) -> DbResult<Statement> {
        if fields.is_empty() {
            return Err(DbError::invalid_input("Search requires at least one field"));
        }
        let table = self.quote(table)?;
        let key = self.quote(key_column)?;
        let pattern = format!("%{}%", self.dialect.escape_like(term));
        let mut params = Vec::with_capacity(fields.len());
        let mut predicates = Vec::with_capacity(fields.len());
        for field in fields {
            let column = self.quote(field)?;
            let placeholder = self.push_param(&mut params, QueryParam::String(pattern.clone()));
            predicates.push(self.dialect.pattern_match(&column, &placeholder));
        }
        let select = format!(
            "SELECT * FROM {table} WHERE ({}) ORDER BY {key} {}",
            predicates.join(" OR "),
            SortDirection::Asc.as_sql()
        );
        Ok(Statement::new(
            self.dialect.limit_offset(&select, limit, 0),
            params,
        ))
    }

    pub fn create_index(&self, table: &str, index: &IndexDefinition) -> DbResult<String> {
        if index.columns.is_empty() {
            return Err(DbError::invalid_input("Index requires at least one column"));
        }
        let table = self.quote(table)?;
        let name = self.quote(&index.name)?;
        let columns = index
            .columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<DbResult<Vec<_>>>()?
            .join(", ");
        let unique = if index.unique { "UNIQUE " } else { "" };
        Ok(format!("CREATE {unique}INDEX {name} ON {table} ({columns})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::{
        MySqlDialect, OracleDialect, PostgresDialect, SqlServerDialect, SqliteDialect,
    };
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("servers").is_ok());
        assert!(validate_identifier("public.servers").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier("name; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_insert_postgres_returning() {
        let builder = SqlBuilder::new(&PostgresDialect);
        let stmt = builder
            .insert("servers", &row(json!({"name": "a", "port": 80})))
            .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"servers\" (\"name\", \"port\") VALUES ($1, $2) RETURNING *"
        );
        assert_eq!(stmt.params, vec![QueryParam::from("a"), QueryParam::Int(80)]);
    }

    #[test]
    fn test_insert_sql_server_output() {
        let builder = SqlBuilder::new(&SqlServerDialect);
        let stmt = builder.insert("servers", &row(json!({"name": "a"}))).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO [servers] ([name]) OUTPUT INSERTED.* VALUES (@P1)"
        );
    }

    #[test]
    fn test_insert_rejects_empty_and_bad_columns() {
        let builder = SqlBuilder::new(&MySqlDialect);
        assert!(builder.insert("t", &Row::new()).is_err());
        assert!(builder.insert("t", &row(json!({"bad col": 1}))).is_err());
    }

    #[test]
    fn test_update_and_delete() {
        let builder = SqlBuilder::new(&OracleDialect);
        let stmt = builder
            .update("servers", "id", &json!(7), &row(json!({"status": "OFFLINE"})))
            .unwrap();
        assert_eq!(stmt.sql, "UPDATE servers SET status = :1 WHERE id = :2");
        assert_eq!(stmt.params[1], QueryParam::Int(7));

        let stmt = builder.delete("servers", "id", &json!(7)).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM servers WHERE id = :1");
    }

    #[test]
    fn test_select_where_null() {
        let builder = SqlBuilder::new(&SqliteDialect);
        let stmt = builder.select_where("t", "owner", &JsonValue::Null).unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM \"t\" WHERE \"owner\" IS NULL");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_page_skips_null_filters() {
        let builder = SqlBuilder::new(&PostgresDialect);
        let request = PageRequest::new(2, 10)
            .filter("status", "ONLINE")
            .filter("region", JsonValue::Null);
        let stmt = builder.page("servers", &request, 10, request.offset()).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"servers\" WHERE \"status\" = $1 ORDER BY \"created_at\" DESC LIMIT 10 OFFSET 10"
        );
        assert_eq!(stmt.params.len(), 1);

        let count = builder.count("servers", &request).unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(*) AS cnt FROM \"servers\" WHERE \"status\" = $1"
        );
    }

    #[test]
    fn test_page_sql_server_offset_fetch() {
        let builder = SqlBuilder::new(&SqlServerDialect);
        let request = PageRequest::new(1, 5).order_by("name", SortDirection::Asc);
        let stmt = builder.page("servers", &request, 5, 0).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM [servers] ORDER BY [name] ASC OFFSET 0 ROWS FETCH NEXT 5 ROWS ONLY"
        );
    }

    #[test]
    fn test_search_orders_by_key() {
        let builder = SqlBuilder::new(&PostgresDialect);
        let fields = vec!["name".to_string(), "hostname".to_string()];
        let stmt = builder.search("servers", &fields, "web", "id", 20).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"servers\" WHERE (\"name\"::text ILIKE $1 ESCAPE '!' OR \"hostname\"::text ILIKE $2 ESCAPE '!') ORDER BY \"id\" ASC LIMIT 20 OFFSET 0"
        );
        assert_eq!(stmt.params[0], QueryParam::from("%web%"));
        assert!(builder.search("servers", &[], "web", "id", 20).is_err());

        let stmt = builder.search("servers", &fields, "db_1%", "id", 20).unwrap();
        assert_eq!(stmt.params[0], QueryParam::from("%db!_1!%%"));
    }

    #[test]
    fn test_bulk_insert_fills_missing_columns() {
        let builder = SqlBuilder::new(&MySqlDialect);
        let records = vec![row(json!({"a": 1})), row(json!({"a": 2, "b": "x"}))];
        let statements = builder.bulk_insert("t", &records).unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql,
            "INSERT INTO `t` (`a`, `b`) VALUES (?, ?), (?, ?)"
        );
        assert_eq!(statements[0].params[1], QueryParam::Null);
    }

    #[test]
    fn test_bulk_insert_chunks_by_row_limit() {
        let builder = SqlBuilder::new(&SqlServerDialect);
        let records: Vec<Row> = (0..1500).map(|i| row(json!({"id": i}))).collect();
        let statements = builder.bulk_insert("t", &records).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].params.len(), 1000);
        assert_eq!(statements[1].params.len(), 500);
        assert!(statements[1].sql.contains("@P500"));
        assert!(!statements[1].sql.contains("@P501"));
    }

    #[test]
    fn test_create_index() {
        let builder = SqlBuilder::new(&SqliteDialect);
        let sql = builder
            .create_index(
                "servers",
                &IndexDefinition::new("idx_servers_status", vec!["status".to_string()]).unique(),
            )
            .unwrap();
        assert_eq!(
            sql,
            "CREATE UNIQUE INDEX \"idx_servers_status\" ON \"servers\" (\"status\")"
        );
    }
}
