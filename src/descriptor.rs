//! Static, program-defined descriptions of tables and their typed columns.
//!
//! Descriptors are declared once at program load and are immutable
//! afterwards; they carry no knowledge of the live database. The
//! [`crate::reconcile`] module matches them against the server catalog at
//! startup.
//!
//! ```
//! use schema_bridge::descriptor::{ColumnDescriptor, TableDescriptor};
//! use schema_bridge::semantic::{Int4Type, TextType};
//!
//! let id = ColumnDescriptor::new("id", Int4Type);
//! let field = ColumnDescriptor::new("field", TextType);
//! let table = TableDescriptor::builder("example_table")
//!     .column(&id)
//!     .unwrap()
//!     .column(&field)
//!     .unwrap()
//!     .build();
//! assert_eq!(table.name(), "example_table");
//! ```

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::semantic::SemanticType;

/// Process-unique identity of a [`TableDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableDescriptorId(u64);

/// Process-unique identity of a [`ColumnDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnDescriptorId(u64);

static NEXT_DESCRIPTOR_ID: AtomicU64 = AtomicU64::new(1);

fn next_descriptor_id() -> u64 {
    NEXT_DESCRIPTOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Errors raised while assembling descriptors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// A column was registered against more than one table.
    #[error("column {column} is already bound to a table")]
    AlreadyBound {
        /// Name of the offending column.
        column: String,
    },

    /// Two columns of the same name were registered on one table.
    #[error("duplicate column {column} in table {table}")]
    DuplicateColumn {
        /// Table being built.
        table: String,
        /// The duplicated column name.
        column: String,
    },
}

#[derive(Debug, Clone)]
struct Owner {
    id: TableDescriptorId,
    table: String,
}

/// A single typed column of a [`TableDescriptor`].
///
/// A column is created unbound and becomes owned by exactly one table when
/// registered through [`TableDescriptorBuilder::column`]. Registering it a
/// second time is an error.
#[derive(Debug)]
pub struct ColumnDescriptor {
    id: ColumnDescriptorId,
    name: String,
    semantic: Arc<dyn SemanticType>,
    owner: OnceCell<Owner>,
}

impl ColumnDescriptor {
    /// Declare a column with an explicit name and semantic type.
    pub fn new(name: impl Into<String>, semantic: impl SemanticType + 'static) -> Arc<Self> {
        Arc::new(Self {
            id: ColumnDescriptorId(next_descriptor_id()),
            name: name.into(),
            semantic: Arc::new(semantic),
            owner: OnceCell::new(),
        })
    }

    /// Process-unique identity of this column.
    pub fn id(&self) -> ColumnDescriptorId {
        self.id
    }

    /// Declared column name, matched against the server catalog.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The semantic type this column holds.
    pub fn semantic(&self) -> &Arc<dyn SemanticType> {
        &self.semantic
    }

    /// Identity of the owning table, if this column has been registered.
    pub fn owner(&self) -> Option<TableDescriptorId> {
        self.owner.get().map(|o| o.id)
    }

    /// Name of the owning table, if this column has been registered.
    pub fn owner_table(&self) -> Option<&str> {
        self.owner.get().map(|o| o.table.as_str())
    }

    fn bind(&self, id: TableDescriptorId, table: &str) -> Result<(), DescriptorError> {
        self.owner
            .set(Owner {
                id,
                table: table.to_owned(),
            })
            .map_err(|_| DescriptorError::AlreadyBound {
                column: self.name.clone(),
            })
    }
}

/// Immutable description of one logical table: its name and its columns,
/// keyed by name.
#[derive(Debug)]
pub struct TableDescriptor {
    id: TableDescriptorId,
    name: String,
    columns: Vec<Arc<ColumnDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl TableDescriptor {
    /// Start building a descriptor for the named table.
    pub fn builder(name: impl Into<String>) -> TableDescriptorBuilder {
        TableDescriptorBuilder {
            id: TableDescriptorId(next_descriptor_id()),
            name: name.into(),
            columns: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Process-unique identity of this table.
    pub fn id(&self) -> TableDescriptorId {
        self.id
    }

    /// Declared table name, matched against the server catalog.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All registered columns, in registration order.
    pub fn columns(&self) -> &[Arc<ColumnDescriptor>] {
        &self.columns
    }

    /// Look up a registered column by name.
    pub fn column(&self, name: &str) -> Option<&Arc<ColumnDescriptor>> {
        self.by_name.get(name).map(|&idx| &self.columns[idx])
    }
}

/// Builder enforcing the "bind exactly once" and column-name-uniqueness
/// invariants at registration time.
#[derive(Debug)]
pub struct TableDescriptorBuilder {
    id: TableDescriptorId,
    name: String,
    columns: Vec<Arc<ColumnDescriptor>>,
    by_name: HashMap<String, usize>,
}

impl TableDescriptorBuilder {
    /// Register a column on this table, binding its owner.
    pub fn column(mut self, column: &Arc<ColumnDescriptor>) -> Result<Self, DescriptorError> {
        if self.by_name.contains_key(column.name()) {
            return Err(DescriptorError::DuplicateColumn {
                table: self.name,
                column: column.name().to_owned(),
            });
        }

        column.bind(self.id, &self.name)?;
        self.by_name
            .insert(column.name().to_owned(), self.columns.len());
        self.columns.push(Arc::clone(column));
        Ok(self)
    }

    /// Finalize the descriptor.
    pub fn build(self) -> Arc<TableDescriptor> {
        Arc::new(TableDescriptor {
            id: self.id,
            name: self.name,
            columns: self.columns,
            by_name: self.by_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::semantic::{Int4Type, TextType};

    use super::*;

    #[test]
    fn builds_table_with_columns() {
        let id = ColumnDescriptor::new("id", Int4Type);
        let field = ColumnDescriptor::new("field", TextType);

        let table = TableDescriptor::builder("example_table")
            .column(&id)
            .unwrap()
            .column(&field)
            .unwrap()
            .build();

        assert_eq!(table.name(), "example_table");
        assert_eq!(table.columns().len(), 2);
        assert_eq!(table.column("id").unwrap().id(), id.id());
        assert_eq!(table.column("field").unwrap().id(), field.id());
        assert!(table.column("nope").is_none());

        assert_eq!(id.owner(), Some(table.id()));
        assert_eq!(id.owner_table(), Some("example_table"));
        assert_eq!(field.owner(), Some(table.id()));
    }

    #[test]
    fn column_binds_exactly_once() {
        let id = ColumnDescriptor::new("id", Int4Type);
        assert!(id.owner().is_none());

        let _first = TableDescriptor::builder("first")
            .column(&id)
            .unwrap()
            .build();

        let err = TableDescriptor::builder("second")
            .column(&id)
            .expect_err("rebinding a column must fail");
        assert_matches!(err, DescriptorError::AlreadyBound { column } => {
            assert_eq!(column, "id");
        });
    }

    #[test]
    fn duplicate_column_names_rejected() {
        let a = ColumnDescriptor::new("id", Int4Type);
        let b = ColumnDescriptor::new("id", Int4Type);

        let err = TableDescriptor::builder("t")
            .column(&a)
            .unwrap()
            .column(&b)
            .expect_err("duplicate names must fail");
        assert_matches!(err, DescriptorError::DuplicateColumn { table, column } => {
            assert_eq!(table, "t");
            assert_eq!(column, "id");
        });

        // The duplicate was never bound and remains usable elsewhere.
        assert!(b.owner().is_none());
    }

    #[test]
    fn descriptor_ids_are_unique() {
        let a = ColumnDescriptor::new("a", Int4Type);
        let b = ColumnDescriptor::new("a", Int4Type);
        assert_ne!(a.id(), b.id());
    }
}
