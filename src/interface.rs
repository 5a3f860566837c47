//! Traits and types abstracting over the underlying database driver.
//!
//! The reconciler and the session facade never talk to the wire protocol
//! directly; they issue queries through a [`Driver`] and interpret the
//! [`Row`]s it returns. A production binding lives in [`crate::postgres`],
//! an in-memory test binding in [`crate::mem`].

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use crate::semantic::Converter;

/// Server-assigned object identifier of a table, stable for the table's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableOid(u32);

#[allow(missing_docs)]
impl TableOid {
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TableOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned object identifier of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeOid(u32);

#[allow(missing_docs)]
impl TypeOid {
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TypeOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based position of a user column within its table, as assigned by the
/// server at column-creation time. System columns carry non-positive numbers
/// and are never represented by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnOrdinal(i16);

#[allow(missing_docs)]
impl ColumnOrdinal {
    pub const fn new(v: i16) -> Self {
        Self(v)
    }

    pub fn get(&self) -> i16 {
        self.0
    }
}

impl std::fmt::Display for ColumnOrdinal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded value of a custom (converter-backed) server type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    type_name: String,
    label: String,
}

impl EnumValue {
    /// Construct an enum value of the named server type.
    pub fn new(type_name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            label: label.into(),
        }
    }

    /// Server-side name of the enum type.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The enum label this value holds.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// A single decoded value within a [`Row`], or a parameter to a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// `bool`.
    Bool(bool),
    /// `int4` (also the decoded form of `int2`).
    Int4(i32),
    /// `int8`.
    Int8(i64),
    /// `float8` (also the decoded form of `float4`).
    Float8(f64),
    /// `text` and friends.
    Text(String),
    /// A custom enum type, decoded through a registered [`Converter`].
    Enum(EnumValue),
}

#[allow(missing_docs)]
impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int4(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumValue> {
        match self {
            Self::Enum(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int4(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int8(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float8(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<EnumValue> for Value {
    fn from(v: EnumValue) -> Self {
        Self::Enum(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Positional metadata of one value in a [`Row`], as reported by the query
/// result description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowColumn {
    /// Column name in the result set.
    pub name: String,
    /// OID of the table this value originates from, if the server attributed
    /// it to one (computed columns and literals carry none).
    pub table_oid: Option<TableOid>,
    /// Ordinal of the originating column within its table.
    pub ordinal: Option<ColumnOrdinal>,
}

/// One fetched result row: raw decoded values paired with per-value
/// positional metadata.
///
/// A row may contain columns from multiple tables (joins), or a subset or
/// reordering of a single table's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<RowColumn>,
    values: Vec<Value>,
}

impl Row {
    /// Assemble a row from its result description and values.
    ///
    /// # Panics
    ///
    /// If `columns` and `values` differ in length.
    pub fn new(columns: Vec<RowColumn>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "row metadata and values must pair up"
        );
        Self { columns, values }
    }

    /// Per-value positional metadata, in result order.
    pub fn columns(&self) -> &[RowColumn] {
        &self.columns
    }

    /// Decoded values, in result order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of values in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One user-visible column definition discovered in the server catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogColumn {
    /// Column name as recorded by the server.
    pub name: String,
    /// 1-based ordinal assigned by the server.
    pub ordinal: ColumnOrdinal,
}

/// Errors surfaced by a [`Driver`] binding.
///
/// Connection, protocol and constraint failures are carried opaquely; this
/// layer adds no translation for them.
#[derive(Debug, Error)]
pub enum DriverError {
    /// `fetch_one` matched zero or more than one row.
    #[error("query returned {returned} rows where exactly one was expected")]
    NotExactlyOneRow {
        /// Number of rows the query actually produced.
        returned: usize,
    },

    /// A fetched or converted value could not be decoded.
    #[error("cannot decode value of type {type_name}: {message}")]
    Decode {
        /// Server-side name of the offending type.
        type_name: String,
        /// Binding-specific detail.
        message: String,
    },

    /// Failure establishing or checking out a connection.
    #[error("connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Any other error reported by the database.
    #[error("database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Require exactly one row from a fetch result, surfacing the distinct
/// [`DriverError::NotExactlyOneRow`] condition otherwise.
pub(crate) fn exactly_one(mut rows: Vec<Row>) -> Result<Row, DriverError> {
    match rows.len() {
        1 => Ok(rows.remove(0)),
        returned => Err(DriverError::NotExactlyOneRow { returned }),
    }
}

/// The external database driver this layer is built on.
///
/// Queries use the driver's positional-placeholder convention (`$1`, `$2`,
/// ...) with parameters supplied as a [`Value`] slice.
#[async_trait]
pub trait Driver: Debug + Send + Sync {
    /// Execute a statement, returning the affected-row count.
    async fn execute(&self, query: &str, params: &[Value]) -> Result<u64, DriverError>;

    /// Execute a query and fetch all result rows.
    async fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, DriverError>;

    /// Execute a query that must return exactly one row.
    async fn fetch_one(&self, query: &str, params: &[Value]) -> Result<Row, DriverError>;

    /// Check out a connection bound to a newly opened transaction.
    ///
    /// The returned session owns the connection exclusively. Implementations
    /// must roll the transaction back if the session is dropped without
    /// [`DriverSession::commit`] having been called.
    async fn begin(&self) -> Result<Box<dyn DriverSession>, DriverError>;

    /// Register a value converter so raw wire values of the converter's type
    /// OID decode to their in-memory representation before rows are returned.
    fn register_converter(&self, converter: Converter);

    /// Resolve the object ID of the ordinary (row-storing) relation with the
    /// given name, if one exists.
    async fn table_oid(&self, table_name: &str) -> Result<Option<TableOid>, DriverError>;

    /// List the user-visible column definitions of a table, ordered by
    /// ordinal ascending. System columns are excluded.
    async fn table_columns(&self, oid: TableOid) -> Result<Vec<CatalogColumn>, DriverError>;

    /// Resolve the runtime OID of the type with the given name, if it exists.
    async fn type_oid(&self, type_name: &str) -> Result<Option<TypeOid>, DriverError>;
}

/// A connection checked out of a [`Driver`], scoped to one transaction.
#[async_trait]
pub trait DriverSession: Debug + Send + Sync {
    /// Execute a statement within the transaction.
    async fn execute(&self, query: &str, params: &[Value]) -> Result<u64, DriverError>;

    /// Fetch all rows for a query within the transaction.
    async fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, DriverError>;

    /// Fetch exactly one row within the transaction.
    async fn fetch_one(&self, query: &str, params: &[Value]) -> Result<Row, DriverError>;

    /// Commit the transaction and release the connection.
    async fn commit(self: Box<Self>) -> Result<(), DriverError>;
}
