//! A schema-reconciliation layer over PostgreSQL.
//!
//! Tables and their typed columns are declared statically as descriptors;
//! at startup the declarations are matched against the live server catalog,
//! concurrently and under a configurable strictness policy. Fetched rows are
//! then addressed through the declared descriptors rather than by position
//! or bare name, which stays correct under arbitrary select order, column
//! subsets and joins.
//!
//! ```no_run
//! use schema_bridge::{
//!     descriptor::{ColumnDescriptor, TableDescriptor},
//!     postgres::{connect, PostgresConnectionOptions},
//!     semantic::{Int4Type, TextType},
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let id = ColumnDescriptor::new("id", Int4Type);
//! let field = ColumnDescriptor::new("field", TextType);
//! let table = TableDescriptor::builder("example_table")
//!     .column(&id)?
//!     .column(&field)?
//!     .build();
//!
//! let pool = connect(PostgresConnectionOptions::default(), [table]).await?;
//! let row = pool
//!     .fetch_one("SELECT * FROM example_table WHERE id = $1;", &[1.into()])
//!     .await?;
//! println!("{:?}", row.get_by_column(&field)?);
//! # Ok(())
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::todo,
    clippy::use_self,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub
)]

pub mod descriptor;
pub mod interface;
pub mod mem;
pub mod postgres;
pub mod reconcile;
pub mod row;
pub mod semantic;
pub mod session;

pub use interface::Value;
pub use reconcile::Strictness;
pub use row::{RowError, TypedRow};
pub use session::{SchemaPool, Session};
