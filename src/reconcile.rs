//! Reconciliation of declared descriptors against the live server catalog.
//!
//! [`load_schemas`] fans out one reconciliation task per declared table,
//! discovers table OIDs, column ordinals and custom type OIDs through the
//! driver's catalog queries, and assembles an immutable [`SchemaMap`] plus
//! the set of [`Converter`]s the declared semantic types require.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{
    descriptor::{ColumnDescriptor, ColumnDescriptorId, TableDescriptor, TableDescriptorId},
    interface::{ColumnOrdinal, Driver, DriverError, TableOid},
    semantic::Converter,
};

/// Whether a mismatch between declared and actual schema is fatal or merely
/// logged and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Any mismatch fails the whole load. The default, and what nearly all
    /// deployments want.
    #[default]
    Strict,
    /// Mismatched tables, columns and types are warned about and dropped
    /// from the reconciled schema. Useful while migrations are in flight.
    Lenient,
}

impl Strictness {
    /// True under [`Strictness::Strict`].
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// Errors raised while reconciling a single declared table.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The declared table does not exist server-side.
    #[error("unknown table {table}")]
    UnknownTable {
        /// The declared table name.
        table: String,
    },

    /// Declared and actual column sets disagree: either the server has
    /// columns the declaration never accounted for, or declared columns are
    /// absent server-side.
    #[error("unmapped columns in table {table}: {}", .columns.join(", "))]
    UnmappedColumn {
        /// The declared table name.
        table: String,
        /// Every column name that failed to map.
        columns: Vec<String>,
    },

    /// A semantic type requiring a converter has no matching server-side
    /// type.
    #[error("unknown type {type_name} declared by column {table}.{column}")]
    UnknownType {
        /// The declared type name.
        type_name: String,
        /// Table of the declaring column.
        table: String,
        /// The declaring column.
        column: String,
    },

    /// The catalog query itself failed. Fatal under both policies; the
    /// caller may re-invoke the whole reconciliation.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Composite failure aggregating every [`ReconcileError`] observed before the
/// load was abandoned.
#[derive(Debug, Error)]
#[error("schema load failed: {}", join_failures(.failures))]
pub struct SchemaLoadError {
    /// All per-table failures collected before the batch was cancelled.
    pub failures: Vec<ReconcileError>,
}

fn join_failures(failures: &[ReconcileError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The runtime identifiers discovered for one declared table.
///
/// Created once during startup reconciliation and never mutated afterwards.
#[derive(Debug)]
pub struct ReconciledSchema {
    table: Arc<TableDescriptor>,
    oid: TableOid,
    ordinals: HashMap<ColumnDescriptorId, ColumnOrdinal>,
}

impl ReconciledSchema {
    /// The declared descriptor this schema reconciles.
    pub fn table(&self) -> &Arc<TableDescriptor> {
        &self.table
    }

    /// The table's server-assigned object ID.
    pub fn oid(&self) -> TableOid {
        self.oid
    }

    /// The ordinal assigned to a declared column, if it was mapped.
    ///
    /// Under [`Strictness::Strict`] every declared column is mapped; under
    /// [`Strictness::Lenient`] columns absent server-side are omitted.
    pub fn ordinal_of(&self, column: &ColumnDescriptor) -> Option<ColumnOrdinal> {
        self.ordinals.get(&column.id()).copied()
    }
}

/// Immutable snapshot mapping each declared table to its reconciled runtime
/// identifiers, owned by the session facade for the life of the pool.
#[derive(Debug, Default)]
pub struct SchemaMap {
    tables: HashMap<TableDescriptorId, ReconciledSchema>,
}

impl SchemaMap {
    /// Look up the reconciled schema of a declared table.
    ///
    /// Returns `None` for tables dropped by a lenient load (or never passed
    /// to the loader at all).
    pub fn get(&self, table: &TableDescriptor) -> Option<&ReconciledSchema> {
        self.tables.get(&table.id())
    }

    pub(crate) fn get_by_id(&self, id: TableDescriptorId) -> Option<&ReconciledSchema> {
        self.tables.get(&id)
    }

    /// Number of reconciled tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether no table was reconciled.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn insert(&mut self, schema: ReconciledSchema) {
        self.tables.insert(schema.table().id(), schema);
    }
}

/// Reconcile one declared table against the catalog.
///
/// Returns `Ok(None)` when a lenient load drops the table.
async fn reconcile_table(
    driver: &dyn Driver,
    table: &Arc<TableDescriptor>,
    strictness: Strictness,
) -> Result<Option<ReconciledSchema>, ReconcileError> {
    let Some(oid) = driver.table_oid(table.name()).await? else {
        if strictness.is_strict() {
            return Err(ReconcileError::UnknownTable {
                table: table.name().to_owned(),
            });
        }
        warn!(table = table.name(), "declared table missing server-side");
        return Ok(None);
    };

    debug!(table = table.name(), %oid, "resolved table oid");

    let mut ordinals = HashMap::with_capacity(table.columns().len());
    for catalog_column in driver.table_columns(oid).await? {
        let Some(column) = table.column(&catalog_column.name) else {
            if strictness.is_strict() {
                return Err(ReconcileError::UnmappedColumn {
                    table: table.name().to_owned(),
                    columns: vec![catalog_column.name],
                });
            }
            warn!(
                table = table.name(),
                column = %catalog_column.name,
                "server column not declared, skipping"
            );
            continue;
        };

        ordinals.insert(column.id(), catalog_column.ordinal);
        debug!(
            table = table.name(),
            column = column.name(),
            ordinal = %catalog_column.ordinal,
            "resolved column ordinal"
        );
    }

    if strictness.is_strict() {
        // The server may declare fewer columns than the program expects.
        let missing = table
            .columns()
            .iter()
            .filter(|column| !ordinals.contains_key(&column.id()))
            .map(|column| column.name().to_owned())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ReconcileError::UnmappedColumn {
                table: table.name().to_owned(),
                columns: missing,
            });
        }
    }

    Ok(Some(ReconciledSchema {
        table: Arc::clone(table),
        oid,
        ordinals,
    }))
}

/// Resolve the runtime type OID of every converter-bearing semantic type and
/// collect the converters, keyed by type name (last write wins; production is
/// deterministic within one name).
async fn collect_converters(
    driver: &dyn Driver,
    schemas: &[ReconciledSchema],
    strictness: Strictness,
) -> Result<Vec<Converter>, ReconcileError> {
    let mut converters: HashMap<String, Converter> = HashMap::new();

    for schema in schemas {
        for column in schema.table().columns() {
            let semantic = column.semantic();
            if !semantic.has_converter() {
                continue;
            }

            let type_name = semantic.type_name();
            let Some(oid) = driver.type_oid(type_name).await? else {
                if strictness.is_strict() {
                    return Err(ReconcileError::UnknownType {
                        type_name: type_name.to_owned(),
                        table: schema.table().name().to_owned(),
                        column: column.name().to_owned(),
                    });
                }
                warn!(
                    table = schema.table().name(),
                    column = column.name(),
                    type_name,
                    "declared type missing server-side, skipping converter"
                );
                continue;
            };

            if let Some(converter) = semantic.converter(oid) {
                debug!(type_name, %oid, "resolved type oid");
                converters.insert(type_name.to_owned(), converter);
            }
        }
    }

    Ok(converters.into_values().collect())
}

/// Reconcile every declared table concurrently.
///
/// One task runs per table; results are collected in completion order, so
/// callers must not rely on table processing order. Under
/// [`Strictness::Strict`] the first failure cancels outstanding siblings and
/// the returned [`SchemaLoadError`] aggregates every failure that had
/// occurred by then - already-successful sibling results are discarded.
/// Under [`Strictness::Lenient`] mismatched tables are dropped from the map
/// and the load completes normally.
pub async fn load_schemas(
    driver: Arc<dyn Driver>,
    tables: impl IntoIterator<Item = Arc<TableDescriptor>>,
    strictness: Strictness,
) -> Result<(SchemaMap, Vec<Converter>), SchemaLoadError> {
    let mut tasks = JoinSet::new();
    for table in tables {
        let driver = Arc::clone(&driver);
        tasks.spawn(async move { reconcile_table(driver.as_ref(), &table, strictness).await });
    }

    let mut schemas = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(Some(schema))) => schemas.push(schema),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                failures.push(e);
                tasks.abort_all();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    if !failures.is_empty() {
        return Err(SchemaLoadError { failures });
    }

    let converters = collect_converters(driver.as_ref(), &schemas, strictness)
        .await
        .map_err(|e| SchemaLoadError { failures: vec![e] })?;

    let mut map = SchemaMap::default();
    for schema in schemas {
        map.insert(schema);
    }

    Ok((map, converters))
}
