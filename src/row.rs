//! Typed access to fetched rows through declared descriptors.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    descriptor::ColumnDescriptor,
    interface::{Row, Value},
    reconcile::SchemaMap,
};

/// Errors raised by per-row lookups.
#[derive(Debug, Error)]
pub enum RowError {
    /// The requested column exists in this row but holds NULL.
    #[error("column {column} has a NULL value")]
    NullValue {
        /// Name of the requested column.
        column: String,
    },

    /// The requested column was not part of this result set: it was not
    /// selected, or belongs to a table absent from this particular join.
    #[error("no column {column} in this row")]
    ColumnNotInRow {
        /// Name of the requested column.
        column: String,
    },

    /// A raw positional index outside the row's value count.
    #[error("index {index} out of bounds for row of {len} values")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// The row's value count.
        len: usize,
    },

    /// The descriptor's table was never reconciled (for example, dropped by
    /// a lenient load). A configuration error, distinct from data absence.
    #[error("table {table} is not present in the reconciled schema map")]
    TableNotLoaded {
        /// The declared table name.
        table: String,
    },

    /// The descriptor's column was never mapped during reconciliation (a
    /// lenient load skipped it). Distinct from data absence.
    #[error("column {table}.{column} was not mapped during schema load")]
    ColumnNotLoaded {
        /// The declared table name.
        table: String,
        /// The declared column name.
        column: String,
    },

    /// The descriptor was never registered on a table.
    #[error("column {column} is not bound to any table")]
    UnboundColumn {
        /// The declared column name.
        column: String,
    },
}

/// One fetched row plus the schema map needed to translate descriptor
/// lookups into positional ones.
///
/// Lookups by [`ColumnDescriptor`] require both the row's reported table OID
/// and column ordinal to match; the column name alone is insufficient, which
/// disambiguates joins and avoids cross-table collisions.
#[derive(Debug)]
pub struct TypedRow {
    schemas: Arc<SchemaMap>,
    row: Row,
}

impl TypedRow {
    /// Wrap a raw row with the schema map governing descriptor lookups.
    pub fn new(schemas: Arc<SchemaMap>, row: Row) -> Self {
        Self { schemas, row }
    }

    /// The underlying raw row.
    pub fn raw(&self) -> &Row {
        &self.row
    }

    /// Number of values in this row.
    pub fn len(&self) -> usize {
        self.row.len()
    }

    /// Whether the row holds no values.
    pub fn is_empty(&self) -> bool {
        self.row.is_empty()
    }

    /// Resolve a value by raw positional index.
    ///
    /// NULL values pass through as [`Value::Null`]; only an out-of-range
    /// index is an error.
    pub fn get_by_index(&self, index: usize) -> Result<&Value, RowError> {
        self.row
            .values()
            .get(index)
            .ok_or(RowError::IndexOutOfBounds {
                index,
                len: self.row.len(),
            })
    }

    /// Resolve a value by declared column descriptor.
    pub fn get_by_column(&self, column: &ColumnDescriptor) -> Result<&Value, RowError> {
        let owner = column.owner().ok_or_else(|| RowError::UnboundColumn {
            column: column.name().to_owned(),
        })?;

        let schema = self
            .schemas
            .get_by_id(owner)
            .ok_or_else(|| RowError::TableNotLoaded {
                table: column.owner_table().unwrap_or_default().to_owned(),
            })?;

        let ordinal = schema
            .ordinal_of(column)
            .ok_or_else(|| RowError::ColumnNotLoaded {
                table: schema.table().name().to_owned(),
                column: column.name().to_owned(),
            })?;

        for (meta, value) in self.row.columns().iter().zip(self.row.values()) {
            if meta.table_oid == Some(schema.oid()) && meta.ordinal == Some(ordinal) {
                if value.is_null() {
                    return Err(RowError::NullValue {
                        column: column.name().to_owned(),
                    });
                }
                return Ok(value);
            }
        }

        Err(RowError::ColumnNotInRow {
            column: column.name().to_owned(),
        })
    }

    /// Suppressing variant of [`TypedRow::get_by_column`]: returns `None`
    /// for a NULL value or a column absent from this row.
    ///
    /// All other failures - including out-of-bounds access and descriptors
    /// whose table or column was never reconciled - still propagate.
    pub fn get(&self, column: &ColumnDescriptor) -> Result<Option<&Value>, RowError> {
        match self.get_by_column(column) {
            Ok(value) => Ok(Some(value)),
            Err(RowError::NullValue { .. } | RowError::ColumnNotInRow { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Suppressing variant of [`TypedRow::get_by_index`]: returns `None` for
    /// a NULL value. An out-of-range index always propagates.
    pub fn get_at(&self, index: usize) -> Result<Option<&Value>, RowError> {
        let value = self.get_by_index(index)?;
        Ok((!value.is_null()).then_some(value))
    }
}
