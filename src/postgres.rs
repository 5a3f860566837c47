//! The PostgreSQL [`Driver`] binding, built on tokio-postgres with a
//! deadpool connection pool.
//!
//! This is where the abstract catalog queries take concrete SQL form:
//! `pg_class` resolves table OIDs, `pg_attribute` lists user columns (the
//! confusingly named catalog of all actual columns; ordinary columns are
//! numbered from 1 up, system columns carry negative numbers), and
//! `pg_type` resolves custom type OIDs.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use bytes::BytesMut;
use deadpool_postgres::{Client, Manager, ManagerConfig, Pool};
use parking_lot::RwLock;
use thiserror::Error;
use tokio_postgres::{
    tls::{MakeTlsConnect, TlsConnect},
    types::{to_sql_checked, FromSql, IsNull, Oid, ToSql, Type},
    Config, NoTls, Socket,
};
use tracing::warn;

use crate::{
    descriptor::TableDescriptor,
    interface::{
        exactly_one, CatalogColumn, ColumnOrdinal, Driver, DriverError, DriverSession, Row,
        RowColumn, TableOid, TypeOid, Value,
    },
    reconcile::{SchemaLoadError, Strictness},
    semantic::Converter,
    session::SchemaPool,
};

/// Options for establishing a pooled server connection.
#[derive(Debug, Clone)]
pub struct PostgresConnectionOptions {
    /// Server hostname or IP address, or the absolute path of a directory
    /// containing its Unix socket.
    pub host: String,
    /// Server port. Ignored for Unix sockets.
    pub port: u16,
    /// Username to authenticate with.
    pub user: String,
    /// Password to authenticate with.
    pub password: Option<String>,
    /// Database to connect to. Defaults to the username.
    pub dbname: Option<String>,
    /// Number of pooled connections.
    pub connection_count: usize,
    /// Whether tables or columns missing server-side fail initialization
    /// (the default) or merely log a warning. Disabling this is only useful
    /// in special situations, such as while a migration is running.
    pub strict_schema_loading: bool,
}

impl Default for PostgresConnectionOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5432,
            user: "postgres".to_owned(),
            password: None,
            dbname: None,
            connection_count: 4,
            strict_schema_loading: true,
        }
    }
}

impl PostgresConnectionOptions {
    fn pg_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(self.dbname.as_deref().unwrap_or(&self.user));
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }

    fn strictness(&self) -> Strictness {
        if self.strict_schema_loading {
            Strictness::Strict
        } else {
            Strictness::Lenient
        }
    }
}

/// Errors raised while establishing a [`SchemaPool`] over a new connection
/// pool.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The connection pool could not be built.
    #[error("failed to build connection pool: {0}")]
    Pool(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Schema reconciliation failed.
    #[error(transparent)]
    Load(#[from] SchemaLoadError),
}

/// Open a pooled, unencrypted connection and reconcile the declared
/// `tables`, yielding a ready [`SchemaPool`].
pub async fn connect(
    options: PostgresConnectionOptions,
    tables: impl IntoIterator<Item = Arc<TableDescriptor>>,
) -> Result<SchemaPool, ConnectError> {
    connect_with_tls(options, NoTls, tables).await
}

/// As [`connect`], with an explicit TLS context.
pub async fn connect_with_tls<T>(
    options: PostgresConnectionOptions,
    tls: T,
    tables: impl IntoIterator<Item = Arc<TableDescriptor>>,
) -> Result<SchemaPool, ConnectError>
where
    T: MakeTlsConnect<Socket> + Clone + Send + Sync + 'static,
    T::Stream: Send + Sync,
    T::TlsConnect: Send + Sync,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let manager = Manager::from_config(options.pg_config(), tls, ManagerConfig::default());
    let pool = Pool::builder(manager)
        .max_size(options.connection_count)
        .build()
        .map_err(|e| ConnectError::Pool(Box::new(e)))?;

    let driver: Arc<dyn Driver> = Arc::new(PostgresDriver::new(pool));
    Ok(SchemaPool::with_driver(driver, tables, options.strictness()).await?)
}

#[derive(Debug, Default)]
struct ConverterRegistry {
    by_oid: RwLock<HashMap<Oid, Converter>>,
}

impl ConverterRegistry {
    fn register(&self, converter: Converter) {
        self.by_oid
            .write()
            .insert(converter.oid().get(), converter);
    }

    fn get(&self, oid: Oid) -> Option<Converter> {
        self.by_oid.read().get(&oid).cloned()
    }
}

/// A [`Driver`] over a deadpool-managed tokio-postgres pool.
pub struct PostgresDriver {
    pool: Pool,
    converters: Arc<ConverterRegistry>,
}

impl PostgresDriver {
    /// Wrap an established connection pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            converters: Arc::new(ConverterRegistry::default()),
        }
    }

    async fn client(&self) -> Result<Client, DriverError> {
        self.pool
            .get()
            .await
            .map_err(|e| DriverError::Connection(Box::new(e)))
    }
}

impl Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Driver for PostgresDriver {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<u64, DriverError> {
        let client = self.client().await?;
        client
            .execute(query, &sql_params(params))
            .await
            .map_err(database_err)
    }

    async fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        let client = self.client().await?;
        let rows = client
            .query(query, &sql_params(params))
            .await
            .map_err(database_err)?;
        rows.iter()
            .map(|row| decode_row(&self.converters, row))
            .collect()
    }

    async fn fetch_one(&self, query: &str, params: &[Value]) -> Result<Row, DriverError> {
        exactly_one(self.fetch(query, params).await?)
    }

    async fn begin(&self) -> Result<Box<dyn DriverSession>, DriverError> {
        let client = self.client().await?;
        client.batch_execute("BEGIN").await.map_err(database_err)?;
        Ok(Box::new(PostgresSession {
            client: Some(client),
            converters: Arc::clone(&self.converters),
        }))
    }

    fn register_converter(&self, converter: Converter) {
        self.converters.register(converter);
    }

    async fn table_oid(&self, table_name: &str) -> Result<Option<TableOid>, DriverError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT oid FROM pg_class WHERE relname = $1 AND relkind = 'r';",
                &[&table_name],
            )
            .await
            .map_err(database_err)?;
        row.map(|row| {
            row.try_get::<_, Oid>(0)
                .map(TableOid::new)
                .map_err(database_err)
        })
        .transpose()
    }

    async fn table_columns(&self, oid: TableOid) -> Result<Vec<CatalogColumn>, DriverError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT attname, attnum FROM pg_attribute \
                 WHERE attrelid = $1 AND attnum > 0 AND NOT attisdropped \
                 ORDER BY attnum;",
                &[&oid.get()],
            )
            .await
            .map_err(database_err)?;
        rows.iter()
            .map(|row| {
                Ok(CatalogColumn {
                    name: row.try_get(0).map_err(database_err)?,
                    ordinal: ColumnOrdinal::new(row.try_get::<_, i16>(1).map_err(database_err)?),
                })
            })
            .collect()
    }

    async fn type_oid(&self, type_name: &str) -> Result<Option<TypeOid>, DriverError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT oid FROM pg_type WHERE typname = $1;", &[&type_name])
            .await
            .map_err(database_err)?;
        row.map(|row| {
            row.try_get::<_, Oid>(0)
                .map(TypeOid::new)
                .map_err(database_err)
        })
        .transpose()
    }
}

/// A checked-out connection with an open transaction.
///
/// Dropped uncommitted, it rolls the transaction back before the connection
/// returns to the pool.
struct PostgresSession {
    client: Option<Client>,
    converters: Arc<ConverterRegistry>,
}

impl PostgresSession {
    fn client(&self) -> &Client {
        // Present until commit consumes the session or drop takes it.
        self.client.as_ref().expect("session client already taken")
    }
}

impl Debug for PostgresSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSession").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl DriverSession for PostgresSession {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.client()
            .execute(query, &sql_params(params))
            .await
            .map_err(database_err)
    }

    async fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        let rows = self
            .client()
            .query(query, &sql_params(params))
            .await
            .map_err(database_err)?;
        rows.iter()
            .map(|row| decode_row(&self.converters, row))
            .collect()
    }

    async fn fetch_one(&self, query: &str, params: &[Value]) -> Result<Row, DriverError> {
        exactly_one(self.fetch(query, params).await?)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), DriverError> {
        let client = self.client.take().expect("session client already taken");
        client.batch_execute("COMMIT").await.map_err(database_err)
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        // The transaction was abandoned; roll it back before the connection
        // is recycled.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = client.batch_execute("ROLLBACK").await {
                        warn!(%error, "failed to roll back abandoned transaction");
                    }
                });
            }
            Err(_) => {
                warn!("transaction abandoned outside a runtime; dropping connection");
            }
        }
    }
}

fn database_err(e: tokio_postgres::Error) -> DriverError {
    DriverError::Database(Box::new(e))
}

fn sql_params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(v) => v.to_sql(ty, out),
            Self::Int4(v) => v.to_sql(ty, out),
            Self::Int8(v) => v.to_sql(ty, out),
            Self::Float8(v) => v.to_sql(ty, out),
            Self::Text(v) => v.to_sql(ty, out),
            // Enum wire values are their label text.
            Self::Enum(v) => {
                out.extend_from_slice(v.label().as_bytes());
                Ok(IsNull::No)
            }
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Raw bytes of any value, interpreted as UTF-8. Used to feed registered
/// converters.
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(std::str::from_utf8(raw)?.to_owned()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn decode_row(
    converters: &ConverterRegistry,
    row: &tokio_postgres::Row,
) -> Result<Row, DriverError> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());

    for (idx, column) in row.columns().iter().enumerate() {
        columns.push(RowColumn {
            name: column.name().to_owned(),
            table_oid: column.table_oid().map(TableOid::new),
            ordinal: column.column_id().map(ColumnOrdinal::new),
        });
        values.push(decode_value(converters, row, idx)?);
    }

    Ok(Row::new(columns, values))
}

fn decode_value(
    converters: &ConverterRegistry,
    row: &tokio_postgres::Row,
    idx: usize,
) -> Result<Value, DriverError> {
    let ty = row.columns()[idx].type_();

    if let Some(converter) = converters.get(ty.oid()) {
        return match row
            .try_get::<_, Option<RawText>>(idx)
            .map_err(database_err)?
        {
            Some(raw) => converter.decode(&raw.0),
            None => Ok(Value::Null),
        };
    }

    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)
            .map_err(database_err)?
            .map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)
            .map_err(database_err)?
            .map(|v| Value::Int4(i32::from(v)))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)
            .map_err(database_err)?
            .map(Value::Int4)
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)
            .map_err(database_err)?
            .map(Value::Int8)
    } else if *ty == Type::OID {
        row.try_get::<_, Option<Oid>>(idx)
            .map_err(database_err)?
            .map(|v| Value::Int8(i64::from(v)))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .map_err(database_err)?
            .map(|v| Value::Float8(f64::from(v)))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)
            .map_err(database_err)?
            .map(Value::Float8)
    } else if *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
    {
        row.try_get::<_, Option<String>>(idx)
            .map_err(database_err)?
            .map(Value::Text)
    } else {
        return Err(DriverError::Decode {
            type_name: ty.name().to_owned(),
            message: "no decoder registered for this type".to_owned(),
        });
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dbname_defaults_to_user() {
        let options = PostgresConnectionOptions {
            user: "bananas".to_owned(),
            ..Default::default()
        };
        let config = options.pg_config();
        assert_eq!(config.get_user(), Some("bananas"));
        assert_eq!(config.get_dbname(), Some("bananas"));

        let options = PostgresConnectionOptions {
            user: "bananas".to_owned(),
            dbname: Some("platanos".to_owned()),
            ..Default::default()
        };
        assert_eq!(options.pg_config().get_dbname(), Some("platanos"));
    }

    #[test]
    fn strictness_follows_flag() {
        let options = PostgresConnectionOptions::default();
        assert_eq!(options.strictness(), Strictness::Strict);

        let options = PostgresConnectionOptions {
            strict_schema_loading: false,
            ..Default::default()
        };
        assert_eq!(options.strictness(), Strictness::Lenient);
    }

    #[test]
    fn null_param_encodes_as_null() {
        let mut buf = BytesMut::new();
        let is_null = Value::Null.to_sql(&Type::INT4, &mut buf).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
        assert!(buf.is_empty());
    }

    #[test]
    fn enum_param_encodes_as_label_text() {
        let mut buf = BytesMut::new();
        let value = Value::Enum(crate::interface::EnumValue::new("example_enum", "ONE"));
        let is_null = value.to_sql(&Type::TEXT, &mut buf).unwrap();
        assert!(matches!(is_null, IsNull::No));
        assert_eq!(&buf[..], b"ONE");
    }
}
