//! SQL Server backend (feature `mssql`).
//!
//! tiberius speaks TDS over a tokio `TcpStream`; connections are pooled
//! with mobc. Transactions are started with a plain `BEGIN TRANSACTION`
//! batch so they outlive the statement that opened them.

use crate::db::dialect::{Dialect, SqlServerDialect};
use crate::db::executor::{process_rows, timeout_error};
use crate::db::pool::{PoolStats, connection_suggestion};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType, QueryParam, QueryResult, Row};
use mobc::Manager;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tiberius::{AuthMethod, Client, ColumnData, EncryptionLevel, FromSql, Query};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

type MssqlClient = Client<Compat<TcpStream>>;

#[derive(Debug)]
pub struct TiberiusManager {
    config: tiberius::Config,
}

impl TiberiusManager {
    pub fn new(config: &ConnectionConfig) -> Self {
        let mut tds = tiberius::Config::new();
        tds.host(&config.host);
        tds.port(config.port_or_default(DatabaseType::SqlServer));
        tds.database(&config.database);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            tds.authentication(AuthMethod::sql_server(user, password));
        }
        if config.ssl {
            tds.encryption(EncryptionLevel::Required);
        } else {
            tds.encryption(EncryptionLevel::NotSupported);
        }
        tds.trust_cert();
        info!("create SQL Server manager for '{}'", config.endpoint(DatabaseType::SqlServer));
        Self { config: tds }
    }
}

#[async_trait::async_trait]
impl Manager for TiberiusManager {
    type Connection = MssqlClient;

    type Error = tiberius::error::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let tcp = TcpStream::connect(self.config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(self.config.clone(), tcp.compat_write()).await?;
        debug!("create new client for '{}'", self.config.get_addr());
        Ok(client)
    }

    async fn check(&self, mut conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        conn.simple_query("SELECT 1").await?.into_results().await?;
        Ok(conn)
    }
}

#[derive(Clone)]
pub struct MssqlPool {
    pool: mobc::Pool<TiberiusManager>,
}

impl std::fmt::Debug for MssqlPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlPool").finish_non_exhaustive()
    }
}

impl MssqlPool {
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        let acquire_timeout = Duration::from_secs(config.timeout_or_default());
        let pool = mobc::Pool::builder()
            .max_open(config.pool_size_or_default(DatabaseType::SqlServer) as u64)
            .get_timeout(Some(acquire_timeout))
            .build(TiberiusManager::new(config));

        // Surface authentication and network failures now rather than on
        // first use.
        pool.get().await.map_err(|e| {
            let message = e.to_string();
            DbError::connection(
                format!("Failed to connect: {}", message),
                connection_suggestion(DatabaseType::SqlServer, &message),
            )
        })?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        debug!("SQL Server pool released; connections close when the last handle drops");
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.pool.state().await;
        PoolStats {
            size: state.connections as u32,
            idle: state.idle as u32,
        }
    }

    pub async fn fetch(
        &self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<QueryResult> {
        let mut conn = self.pool.get().await?;
        fetch(&mut conn, sql, params, query_timeout).await
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let mut conn = self.pool.get().await?;
        execute(&mut conn, sql, params, query_timeout).await
    }

    pub async fn begin(&self) -> DbResult<MssqlTransaction> {
        let mut conn = self.pool.get().await?;
        conn.simple_query("BEGIN TRANSACTION")
            .await?
            .into_results()
            .await?;
        Ok(MssqlTransaction { conn })
    }
}

pub struct MssqlTransaction {
    conn: mobc::Connection<TiberiusManager>,
}

impl MssqlTransaction {
    pub async fn fetch(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<QueryResult> {
        fetch(&mut self.conn, sql, params, query_timeout).await
    }

    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        execute(&mut self.conn, sql, params, query_timeout).await
    }

    pub async fn commit(mut self) -> DbResult<()> {
        self.conn
            .simple_query("COMMIT TRANSACTION")
            .await?
            .into_results()
            .await?;
        Ok(())
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        self.conn
            .simple_query("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION")
            .await?
            .into_results()
            .await?;
        Ok(())
    }
}

fn build_query<'a>(sql: &'a str, params: &'a [QueryParam]) -> Query<'a> {
    let mut query = Query::new(sql);
    for param in params {
        match param {
            QueryParam::Null => query.bind(Option::<String>::None),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            QueryParam::Json(v) => query.bind(v.to_string()),
            QueryParam::Bytes(v) => query.bind(v.as_slice()),
        }
    }
    query
}

async fn fetch(
    client: &mut MssqlClient,
    sql: &str,
    params: &[QueryParam],
    query_timeout: Duration,
) -> DbResult<QueryResult> {
    let start = Instant::now();
    let rows = async {
        build_query(sql, params)
            .query(client)
            .await?
            .into_first_result()
            .await
    };
    match timeout(query_timeout, rows).await {
        Ok(Ok(rows)) => {
            let rows: Vec<MssqlRow> = rows.into_iter().map(MssqlRow::from).collect();
            Ok(process_rows(rows, &SqlServerDialect as &dyn Dialect, start))
        }
        Ok(Err(e)) => Err(DbError::from(e).with_statement(sql)),
        Err(_) => Err(timeout_error("query execution", query_timeout)),
    }
}

async fn execute(
    client: &mut MssqlClient,
    sql: &str,
    params: &[QueryParam],
    query_timeout: Duration,
) -> DbResult<u64> {
    match timeout(query_timeout, build_query(sql, params).execute(client)).await {
        Ok(Ok(result)) => Ok(result.total()),
        Ok(Err(e)) => Err(DbError::from(e).with_statement(sql)),
        Err(_) => Err(timeout_error("write operation", query_timeout)),
    }
}

/// tiberius row adapted to the shared row conversion.
struct MssqlRow {
    names: Vec<String>,
    cells: Vec<ColumnData<'static>>,
}

impl From<tiberius::Row> for MssqlRow {
    fn from(row: tiberius::Row) -> Self {
        let names = row.columns().iter().map(|c| c.name().to_string()).collect();
        Self {
            names,
            cells: row.into_iter().collect(),
        }
    }
}

impl RowToJson for MssqlRow {
    fn to_json_map(&self) -> Row {
        self.names
            .iter()
            .zip(&self.cells)
            .map(|(name, data)| (name.clone(), column_to_json(data)))
            .collect()
    }

    fn column_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

fn temporal<'a, T>(data: &'a ColumnData<'static>) -> JsonValue
where
    T: FromSql<'a> + ToString,
{
    match T::from_sql(data) {
        Ok(Some(v)) => JsonValue::String(v.to_string()),
        _ => JsonValue::Null,
    }
}

fn column_to_json(data: &ColumnData<'static>) -> JsonValue {
    match data {
        ColumnData::U8(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::I16(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::I32(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::I64(v) => v.map_or(JsonValue::Null, JsonValue::from),
        ColumnData::F32(v) => v.map_or(JsonValue::Null, |f| crate::db::types::float_value(f as f64)),
        ColumnData::F64(v) => v.map_or(JsonValue::Null, crate::db::types::float_value),
        ColumnData::Bit(v) => v.map_or(JsonValue::Null, JsonValue::Bool),
        ColumnData::String(v) => v
            .as_ref()
            .map_or(JsonValue::Null, |s| JsonValue::String(s.to_string())),
        ColumnData::Guid(v) => v.map_or(JsonValue::Null, |g| JsonValue::String(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map_or(JsonValue::Null, |b| {
            crate::db::types::decode_binary_value(b, false)
        }),
        ColumnData::Numeric(v) => v
            .as_ref()
            .map_or(JsonValue::Null, |n| JsonValue::String(n.to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal::<chrono::NaiveDateTime>(data)
        }
        ColumnData::Date(_) => temporal::<chrono::NaiveDate>(data),
        ColumnData::Time(_) => temporal::<chrono::NaiveTime>(data),
        ColumnData::DateTimeOffset(_) => temporal::<chrono::DateTime<chrono::FixedOffset>>(data),
        ColumnData::Xml(v) => v.as_ref().map_or(JsonValue::Null, |x| {
            JsonValue::String(x.as_ref().clone().into_string())
        }),
    }
}
