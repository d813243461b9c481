//! SQL dialect strategies.
//!
//! Every relational engine differs in placeholder syntax, pagination,
//! case-insensitive matching, identifier quoting and catalog layout. Those
//! differences live behind the [`Dialect`] trait; everything above it
//! (statement building, the adapter, sharding) is engine-agnostic.
//!
//! Catalog queries alias their columns to a shared set of lower-case names
//! (`column_name`, `data_type`, `is_nullable`, `column_default`,
//! `is_primary_key`, `index_name`, `is_unique`, `is_primary`, `cnt`) so the
//! schema parser can read any dialect's output.

use crate::models::{DatabaseType, Row};

/// Escape character declared on every LIKE predicate.
pub const LIKE_ESCAPE: char = '!';

fn escape_like_chars(term: &str, wildcards: &[char]) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if c == LIKE_ESCAPE || wildcards.contains(&c) {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

/// Per-engine SQL generation strategy.
pub trait Dialect: Send + Sync + std::fmt::Debug {
    fn database_type(&self) -> DatabaseType;

    /// Bind placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Quote one identifier part. The input is already validated.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Apply a row window to a SELECT that already carries its ORDER BY.
    fn limit_offset(&self, select: &str, limit: u64, offset: u64) -> String {
        format!("{select} LIMIT {limit} OFFSET {offset}")
    }

    /// Case-insensitive substring predicate for `column` against a bound
    /// pattern built with [`Dialect::escape_like`].
    fn pattern_match(&self, column: &str, placeholder: &str) -> String {
        format!("LOWER({column}) LIKE LOWER({placeholder}) ESCAPE '{LIKE_ESCAPE}'")
    }

    /// Escape LIKE wildcards in a user term so it matches literally.
    fn escape_like(&self, term: &str) -> String {
        escape_like_chars(term, &['%', '_'])
    }

    /// Clause appended to INSERT/UPDATE to return the written row.
    fn returning_clause(&self) -> Option<&'static str> {
        None
    }

    /// Clause placed between the column list and VALUES to return the
    /// written row (SQL Server `OUTPUT`).
    fn output_clause(&self) -> Option<&'static str> {
        None
    }

    fn health_check_sql(&self) -> &'static str {
        "SELECT 1"
    }

    fn version_sql(&self) -> &'static str;

    /// COUNT of tables named by parameter 1, aliased `cnt`.
    fn table_exists_sql(&self) -> String;

    /// Column catalog for the table named by parameter 1.
    fn columns_sql(&self) -> String;

    /// One row per (index, column) for the table named by parameter 1,
    /// ordered by index name then column position.
    fn indexes_sql(&self) -> String;

    /// Multi-row INSERT from pre-rendered `(…)` placeholder groups.
    fn bulk_insert_sql(&self, table: &str, columns: &str, groups: &[String]) -> String {
        format!(
            "INSERT INTO {table} ({columns}) VALUES {}",
            groups.join(", ")
        )
    }

    /// Upper bound on bind parameters in one statement.
    fn max_bind_params(&self) -> usize {
        65_535
    }

    /// Upper bound on rows in one multi-row INSERT.
    fn max_rows_per_insert(&self) -> usize {
        usize::MAX
    }

    /// Map a driver-reported field name to its canonical form.
    fn normalize_field_name(&self, name: &str) -> String {
        name.to_string()
    }

    /// Field mapping step applied to every row before it leaves the adapter.
    fn normalize_row(&self, row: Row) -> Row {
        row.into_iter()
            .map(|(k, v)| (self.normalize_field_name(&k), v))
            .collect()
    }

    /// Native backup statement taking the target path as parameter 1.
    fn backup_sql(&self, _database: &str) -> Option<String> {
        None
    }

    /// Native restore statement taking the source path as parameter 1.
    fn restore_sql(&self, _database: &str) -> Option<String> {
        None
    }

    /// External tool to point users at when native backup is unavailable.
    fn backup_tool(&self) -> &'static str;
}

/// Select the SQL strategy for a database type. MongoDB has none.
pub fn dialect_for(db_type: DatabaseType) -> Option<&'static dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Some(&PostgresDialect),
        DatabaseType::MySQL => Some(&MySqlDialect),
        DatabaseType::SQLite => Some(&SqliteDialect),
        DatabaseType::SqlServer => Some(&SqlServerDialect),
        DatabaseType::Oracle => Some(&OracleDialect),
        DatabaseType::MongoDB => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{ident}\"")
    }

    fn pattern_match(&self, column: &str, placeholder: &str) -> String {
        format!("{column}::text ILIKE {placeholder} ESCAPE '{LIKE_ESCAPE}'")
    }

    fn returning_clause(&self) -> Option<&'static str> {
        Some("RETURNING *")
    }

    fn version_sql(&self) -> &'static str {
        "SELECT version()"
    }

    fn table_exists_sql(&self) -> String {
        r#"SELECT COUNT(*) AS cnt
            FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_name = $1"#
            .to_string()
    }

    fn columns_sql(&self) -> String {
        r#"SELECT
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                c.is_nullable::text AS is_nullable,
                c.column_default::text AS column_default,
                EXISTS (
                    SELECT 1
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                        AND tc.table_schema = c.table_schema
                        AND tc.table_name = c.table_name
                        AND kcu.column_name = c.column_name
                ) AS is_primary_key
            FROM information_schema.columns c
            WHERE c.table_schema = current_schema() AND c.table_name = $1
            ORDER BY c.ordinal_position"#
            .to_string()
    }

    fn indexes_sql(&self) -> String {
        r#"SELECT
                i.relname::text AS index_name,
                a.attname::text AS column_name,
                ix.indisunique AS is_unique,
                ix.indisprimary AS is_primary
            FROM pg_index ix
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE t.relname = $1 AND n.nspname = current_schema()
            ORDER BY i.relname, array_position(ix.indkey, a.attnum)"#
            .to_string()
    }

    fn backup_tool(&self) -> &'static str {
        "pg_dump / pg_restore"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{ident}`")
    }

    fn version_sql(&self) -> &'static str {
        "SELECT VERSION()"
    }

    fn table_exists_sql(&self) -> String {
        r#"SELECT COUNT(*) AS cnt
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?"#
            .to_string()
    }

    fn columns_sql(&self) -> String {
        r#"SELECT
                COLUMN_NAME AS column_name,
                DATA_TYPE AS data_type,
                IS_NULLABLE AS is_nullable,
                COLUMN_DEFAULT AS column_default,
                COLUMN_KEY = 'PRI' AS is_primary_key
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION"#
            .to_string()
    }

    fn indexes_sql(&self) -> String {
        r#"SELECT
                INDEX_NAME AS index_name,
                COLUMN_NAME AS column_name,
                NON_UNIQUE = 0 AS is_unique,
                INDEX_NAME = 'PRIMARY' AS is_primary
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY INDEX_NAME, SEQ_IN_INDEX"#
            .to_string()
    }

    fn backup_tool(&self) -> &'static str {
        "mysqldump"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{ident}\"")
    }

    fn returning_clause(&self) -> Option<&'static str> {
        Some("RETURNING *")
    }

    fn version_sql(&self) -> &'static str {
        "SELECT sqlite_version()"
    }

    fn table_exists_sql(&self) -> String {
        "SELECT COUNT(*) AS cnt FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?"
            .to_string()
    }

    fn columns_sql(&self) -> String {
        r#"SELECT
                name AS column_name,
                type AS data_type,
                CASE WHEN "notnull" = 0 THEN 'YES' ELSE 'NO' END AS is_nullable,
                dflt_value AS column_default,
                pk > 0 AS is_primary_key
            FROM pragma_table_info(?)
            ORDER BY cid"#
            .to_string()
    }

    fn indexes_sql(&self) -> String {
        r#"SELECT
                il.name AS index_name,
                ii.name AS column_name,
                il."unique" AS is_unique,
                il.origin = 'pk' AS is_primary
            FROM pragma_index_list(?) il
            JOIN pragma_index_info(il.name) ii
            ORDER BY il.name, ii.seqno"#
            .to_string()
    }

    fn max_bind_params(&self) -> usize {
        32_766
    }

    fn backup_sql(&self, _database: &str) -> Option<String> {
        Some("VACUUM INTO ?".to_string())
    }

    fn backup_tool(&self) -> &'static str {
        "sqlite3 .backup"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SqlServerDialect;

impl Dialect for SqlServerDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{index}")
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("[{ident}]")
    }

    fn limit_offset(&self, select: &str, limit: u64, offset: u64) -> String {
        format!("{select} OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY")
    }

    fn pattern_match(&self, column: &str, placeholder: &str) -> String {
        format!(
            "LOWER(CAST({column} AS NVARCHAR(MAX))) LIKE LOWER({placeholder}) ESCAPE '{LIKE_ESCAPE}'"
        )
    }

    // `[` opens a character class in T-SQL patterns
    fn escape_like(&self, term: &str) -> String {
        escape_like_chars(term, &['%', '_', '['])
    }

    fn output_clause(&self) -> Option<&'static str> {
        Some("OUTPUT INSERTED.*")
    }

    fn version_sql(&self) -> &'static str {
        "SELECT @@VERSION"
    }

    fn table_exists_sql(&self) -> String {
        "SELECT COUNT(*) AS cnt FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_NAME = @P1".to_string()
    }

    fn columns_sql(&self) -> String {
        r#"SELECT
                c.COLUMN_NAME AS column_name,
                c.DATA_TYPE AS data_type,
                c.IS_NULLABLE AS is_nullable,
                c.COLUMN_DEFAULT AS column_default,
                CASE WHEN EXISTS (
                    SELECT 1
                    FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                    JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
                        ON tc.CONSTRAINT_NAME = k.CONSTRAINT_NAME
                    WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
                        AND tc.TABLE_NAME = c.TABLE_NAME
                        AND k.COLUMN_NAME = c.COLUMN_NAME
                ) THEN 1 ELSE 0 END AS is_primary_key
            FROM INFORMATION_SCHEMA.COLUMNS c
            WHERE c.TABLE_NAME = @P1
            ORDER BY c.ORDINAL_POSITION"#
            .to_string()
    }

    fn indexes_sql(&self) -> String {
        r#"SELECT
                i.name AS index_name,
                c.name AS column_name,
                i.is_unique AS is_unique,
                i.is_primary_key AS is_primary
            FROM sys.indexes i
            JOIN sys.index_columns ic
                ON ic.object_id = i.object_id AND ic.index_id = i.index_id
            JOIN sys.columns c
                ON c.object_id = ic.object_id AND c.column_id = ic.column_id
            WHERE i.object_id = OBJECT_ID(@P1) AND i.name IS NOT NULL
            ORDER BY i.name, ic.key_ordinal"#
            .to_string()
    }

    fn max_bind_params(&self) -> usize {
        2_099
    }

    fn max_rows_per_insert(&self) -> usize {
        1_000
    }

    fn backup_sql(&self, database: &str) -> Option<String> {
        Some(format!(
            "BACKUP DATABASE {} TO DISK = @P1",
            self.quote_identifier(database)
        ))
    }

    fn restore_sql(&self, database: &str) -> Option<String> {
        Some(format!(
            "RESTORE DATABASE {} FROM DISK = @P1 WITH REPLACE",
            self.quote_identifier(database)
        ))
    }

    fn backup_tool(&self) -> &'static str {
        "sqlcmd BACKUP DATABASE"
    }
}

/// Oracle folds unquoted identifiers to upper case, so identifiers are
/// emitted unquoted and catalog lookups compare against `UPPER(:1)`.
#[derive(Debug, Clone, Copy)]
pub struct OracleDialect;

/// Helper column added by the ROWNUM pagination wrapper.
const ORACLE_ROWNUM_COLUMN: &str = "rnum__";

impl Dialect for OracleDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Oracle
    }

    fn placeholder(&self, index: usize) -> String {
        format!(":{index}")
    }

    fn quote_identifier(&self, ident: &str) -> String {
        ident.to_string()
    }

    fn limit_offset(&self, select: &str, limit: u64, offset: u64) -> String {
        let upper = offset.saturating_add(limit);
        format!(
            "SELECT * FROM (SELECT inner_q.*, ROWNUM AS {ORACLE_ROWNUM_COLUMN} FROM ({select}) inner_q WHERE ROWNUM <= {upper}) WHERE {ORACLE_ROWNUM_COLUMN} > {offset}"
        )
    }

    fn health_check_sql(&self) -> &'static str {
        "SELECT 1 FROM DUAL"
    }

    fn version_sql(&self) -> &'static str {
        "SELECT banner FROM v$version WHERE ROWNUM = 1"
    }

    fn table_exists_sql(&self) -> String {
        "SELECT COUNT(*) AS cnt FROM user_tables WHERE table_name = UPPER(:1)".to_string()
    }

    fn columns_sql(&self) -> String {
        r#"SELECT
                c.column_name AS column_name,
                c.data_type AS data_type,
                c.nullable AS is_nullable,
                NULL AS column_default,
                CASE WHEN EXISTS (
                    SELECT 1
                    FROM user_constraints uc
                    JOIN user_cons_columns ucc ON uc.constraint_name = ucc.constraint_name
                    WHERE uc.constraint_type = 'P'
                        AND uc.table_name = c.table_name
                        AND ucc.column_name = c.column_name
                ) THEN 1 ELSE 0 END AS is_primary_key
            FROM user_tab_columns c
            WHERE c.table_name = UPPER(:1)
            ORDER BY c.column_id"#
            .to_string()
    }

    fn indexes_sql(&self) -> String {
        r#"SELECT
                ic.index_name AS index_name,
                ic.column_name AS column_name,
                CASE WHEN i.uniqueness = 'UNIQUE' THEN 1 ELSE 0 END AS is_unique,
                CASE WHEN uc.constraint_type = 'P' THEN 1 ELSE 0 END AS is_primary
            FROM user_ind_columns ic
            JOIN user_indexes i ON i.index_name = ic.index_name
            LEFT JOIN user_constraints uc
                ON uc.index_name = ic.index_name AND uc.constraint_type = 'P'
            WHERE ic.table_name = UPPER(:1)
            ORDER BY ic.index_name, ic.column_position"#
            .to_string()
    }

    fn bulk_insert_sql(&self, table: &str, columns: &str, groups: &[String]) -> String {
        let mut sql = String::from("INSERT ALL");
        for group in groups {
            sql.push_str(&format!(" INTO {table} ({columns}) VALUES {group}"));
        }
        sql.push_str(" SELECT 1 FROM DUAL");
        sql
    }

    fn normalize_field_name(&self, name: &str) -> String {
        name.to_ascii_lowercase()
    }

    fn normalize_row(&self, row: Row) -> Row {
        row.into_iter()
            .map(|(k, v)| (self.normalize_field_name(&k), v))
            .filter(|(k, _)| k != ORACLE_ROWNUM_COLUMN)
            .collect()
    }

    fn backup_tool(&self) -> &'static str {
        "expdp / impdp (Data Pump)"
    }
}
