//! Error types for unidb.
//!
//! All fallible operations return [`DbResult`]. Native driver errors are
//! mapped into [`DbError`] at the adapter boundary so callers never see
//! driver-specific error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database '{database}' is not connected")]
    NotConnected { database: String },

    #[error("Query failed: {message} (statement: {statement})")]
    Query {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        /// Failing statement with string literals redacted. Bound parameter
        /// values are never stored here.
        statement: String,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    TransactionState {
        message: String,
        transaction_id: String,
    },

    #[error("Shard routing failed: {message}")]
    ShardRouting { message: String },

    #[error("Unsupported operation: {operation} - {reason}")]
    UnsupportedOperation { operation: String, reason: String },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Database '{database}' not found: {hint}")]
    DatabaseNotFound { database: String, hint: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn not_connected(database: impl Into<String>) -> Self {
        Self::NotConnected {
            database: database.into(),
        }
    }

    /// Create a query error. The statement is redacted before it is stored.
    pub fn query(message: impl Into<String>, sql_state: Option<String>, statement: &str) -> Self {
        Self::Query {
            message: message.into(),
            sql_state,
            statement: redact_statement(statement),
        }
    }

    pub fn transaction_state(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::TransactionState {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn shard_routing(message: impl Into<String>) -> Self {
        Self::ShardRouting {
            message: message.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a database not found error.
    pub fn database_not_found(database: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::DatabaseNotFound {
            database: database.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::DatabaseNotFound { hint, .. } => Some(hint),
            Self::NotConnected { .. } => Some("Call connect() before issuing operations"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Attach the failing statement to an error produced by a driver call.
    ///
    /// Database-level failures become [`DbError::Query`]; connection and
    /// timeout failures keep their own category.
    pub fn with_statement(self, sql: &str) -> Self {
        match self {
            Self::Query {
                message, sql_state, ..
            } => Self::query(message, sql_state, sql),
            Self::Schema { message, .. } | Self::Internal { message } => {
                Self::query(message, None, sql)
            }
            other => other,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection settings and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::Query {
                    message: db_err.message().to_string(),
                    sql_state: code,
                    statement: String::new(),
                }
            }
            sqlx::Error::RowNotFound => DbError::Query {
                message: "No rows returned".to_string(),
                sql_state: None,
                statement: String::new(),
            },
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

#[cfg(feature = "mssql")]
impl From<tiberius::error::Error> for DbError {
    fn from(err: tiberius::error::Error) -> Self {
        match err {
            tiberius::error::Error::Server(token) => DbError::Query {
                message: token.message().to_string(),
                sql_state: Some(token.code().to_string()),
                statement: String::new(),
            },
            tiberius::error::Error::Io { message, .. } => DbError::connection(
                format!("I/O error: {}", message),
                "Check network connectivity and database server status",
            ),
            tiberius::error::Error::Tls(msg) => DbError::connection(
                format!("TLS error: {}", msg),
                "Verify TLS configuration and certificates",
            ),
            other => DbError::internal(format!("SQL Server error: {}", other)),
        }
    }
}

#[cfg(feature = "mssql")]
impl<E: std::fmt::Display> From<mobc::Error<E>> for DbError {
    fn from(value: mobc::Error<E>) -> Self {
        match value {
            mobc::Error::Inner(e) => DbError::connection(
                e.to_string(),
                "Check the SQL Server host, port and credentials",
            ),
            mobc::Error::Timeout => DbError::timeout("connection pool acquire", 30),
            mobc::Error::BadConn => {
                DbError::connection("Bad connection returned by pool", "Retry the operation")
            }
            mobc::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
        }
    }
}

#[cfg(feature = "oracle")]
impl From<oracle::Error> for DbError {
    fn from(err: oracle::Error) -> Self {
        match err.db_error() {
            Some(db_err) => DbError::Query {
                message: db_err.message().to_string(),
                sql_state: Some(format!("ORA-{:05}", db_err.code())),
                statement: String::new(),
            },
            None => DbError::internal(format!("Oracle error: {}", err)),
        }
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for DbError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;
        match err.kind.as_ref() {
            ErrorKind::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            ErrorKind::ServerSelection { message, .. } => DbError::connection(
                message.clone(),
                "Check that the MongoDB deployment is reachable",
            ),
            ErrorKind::Authentication { message, .. } => {
                DbError::connection(message.clone(), "Check the MongoDB credentials")
            }
            ErrorKind::Command(cmd) => DbError::Query {
                message: cmd.message.clone(),
                sql_state: Some(cmd.code.to_string()),
                statement: String::new(),
            },
            _ => DbError::Query {
                message: err.to_string(),
                sql_state: None,
                statement: String::new(),
            },
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Replace single-quoted string literals in a statement with `'?'`.
///
/// `''` escapes inside a literal are honored. Quoted identifiers are left
/// untouched.
pub fn redact_statement(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\'' {
            out.push(c);
            continue;
        }
        // Skip to the closing quote, honoring '' escapes.
        loop {
            match chars.next() {
                Some('\'') if chars.peek() == Some(&'\'') => {
                    chars.next();
                }
                Some('\'') | None => break,
                Some(_) => {}
            }
        }
        out.push_str("'?'");
    }

    out
}
