//! The session facade binding a reconciled schema map to a live driver.

use std::sync::Arc;

use crate::{
    descriptor::TableDescriptor,
    interface::{Driver, DriverError, DriverSession, Value},
    reconcile::{load_schemas, SchemaLoadError, SchemaMap, Strictness},
    row::TypedRow,
};

/// A pooled session over the external driver, producing [`TypedRow`]
/// accessors for every fetched row.
///
/// Construction reconciles the declared tables up front (see
/// [`crate::reconcile::load_schemas`]) and registers the discovered
/// converters on the driver; initialization either fully succeeds or fails
/// with a composite [`SchemaLoadError`].
#[derive(Debug)]
pub struct SchemaPool {
    driver: Arc<dyn Driver>,
    schemas: Arc<SchemaMap>,
}

impl SchemaPool {
    /// Build a pool over an already-established driver, reconciling the
    /// declared `tables` under the given policy.
    pub async fn with_driver(
        driver: Arc<dyn Driver>,
        tables: impl IntoIterator<Item = Arc<TableDescriptor>>,
        strictness: Strictness,
    ) -> Result<Self, SchemaLoadError> {
        let (schemas, converters) = load_schemas(Arc::clone(&driver), tables, strictness).await?;

        for converter in converters {
            driver.register_converter(converter);
        }

        Ok(Self {
            driver,
            schemas: Arc::new(schemas),
        })
    }

    /// The reconciled schema snapshot this pool serves lookups from.
    pub fn schemas(&self) -> &SchemaMap {
        &self.schemas
    }

    /// Execute a statement and return the affected-row count. No schema
    /// involvement; errors pass through from the driver unchanged.
    pub async fn execute(&self, query: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.driver.execute(query, params).await
    }

    /// Execute a query and wrap every fetched row in a [`TypedRow`].
    pub async fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<TypedRow>, DriverError> {
        let rows = self.driver.fetch(query, params).await?;
        Ok(rows
            .into_iter()
            .map(|row| TypedRow::new(Arc::clone(&self.schemas), row))
            .collect())
    }

    /// Execute a query that must return exactly one row.
    ///
    /// The driver's distinct not-exactly-one-row error propagates unchanged.
    pub async fn fetch_one(&self, query: &str, params: &[Value]) -> Result<TypedRow, DriverError> {
        let row = self.driver.fetch_one(query, params).await?;
        Ok(TypedRow::new(Arc::clone(&self.schemas), row))
    }

    /// Check out a connection bound to a new transaction.
    ///
    /// The returned [`Session`] shares this pool's schema map and owns its
    /// connection exclusively. The transaction is closed when the session
    /// goes out of scope by any path: committed through
    /// [`Session::commit`], rolled back otherwise.
    pub async fn checkout(&self) -> Result<Session, DriverError> {
        let inner = self.driver.begin().await?;
        Ok(Session {
            inner,
            schemas: Arc::clone(&self.schemas),
        })
    }
}

/// A transaction-scoped session checked out of a [`SchemaPool`].
///
/// Dropping the session without calling [`Session::commit`] rolls the
/// transaction back.
#[derive(Debug)]
pub struct Session {
    inner: Box<dyn DriverSession>,
    schemas: Arc<SchemaMap>,
}

impl Session {
    /// Execute a statement within the transaction.
    pub async fn execute(&self, query: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.inner.execute(query, params).await
    }

    /// Execute a query within the transaction, wrapping every row.
    pub async fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<TypedRow>, DriverError> {
        let rows = self.inner.fetch(query, params).await?;
        Ok(rows
            .into_iter()
            .map(|row| TypedRow::new(Arc::clone(&self.schemas), row))
            .collect())
    }

    /// Execute a query that must return exactly one row, within the
    /// transaction.
    pub async fn fetch_one(&self, query: &str, params: &[Value]) -> Result<TypedRow, DriverError> {
        let row = self.inner.fetch_one(query, params).await?;
        Ok(TypedRow::new(Arc::clone(&self.schemas), row))
    }

    /// Commit the transaction, consuming the session.
    pub async fn commit(self) -> Result<(), DriverError> {
        self.inner.commit().await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        descriptor::ColumnDescriptor,
        interface::{Row, RowColumn},
        mem::{MemDriver, SessionEvent},
        semantic::{EnumType, Int4Type},
    };

    use super::*;

    fn plain_row(values: Vec<Value>) -> Row {
        let columns = values
            .iter()
            .enumerate()
            .map(|(i, _)| RowColumn {
                name: format!("c{i}"),
                table_oid: None,
                ordinal: None,
            })
            .collect();
        Row::new(columns, values)
    }

    async fn empty_pool(driver: Arc<MemDriver>) -> SchemaPool {
        SchemaPool::with_driver(driver, [], Strictness::Strict)
            .await
            .expect("empty declaration must load")
    }

    #[tokio::test]
    async fn execute_delegates_to_driver() {
        let driver = Arc::new(MemDriver::default().with_execute_result(3));
        let pool = empty_pool(Arc::clone(&driver)).await;

        let affected = pool.execute("DELETE FROM t WHERE x = $1;", &[Value::Int4(1)]).await;
        assert_matches!(affected, Ok(3));
        assert_eq!(driver.statements(), ["DELETE FROM t WHERE x = $1;"]);
    }

    #[tokio::test]
    async fn fetch_wraps_every_row() {
        let driver = Arc::new(MemDriver::default().with_fetch_result(vec![
            plain_row(vec![Value::Int4(1)]),
            plain_row(vec![Value::Int4(2)]),
        ]));
        let pool = empty_pool(Arc::clone(&driver)).await;

        let rows = pool.fetch("SELECT x FROM t;", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_by_index(0).unwrap(), &Value::Int4(1));
        assert_eq!(rows[1].get_by_index(0).unwrap(), &Value::Int4(2));
    }

    #[tokio::test]
    async fn fetch_one_propagates_row_count_errors() {
        let driver = Arc::new(
            MemDriver::default()
                .with_fetch_result(vec![])
                .with_fetch_result(vec![
                    plain_row(vec![Value::Int4(1)]),
                    plain_row(vec![Value::Int4(2)]),
                ]),
        );
        let pool = empty_pool(Arc::clone(&driver)).await;

        assert_matches!(
            pool.fetch_one("SELECT 1;", &[]).await,
            Err(DriverError::NotExactlyOneRow { returned: 0 })
        );
        assert_matches!(
            pool.fetch_one("SELECT 1;", &[]).await,
            Err(DriverError::NotExactlyOneRow { returned: 2 })
        );
    }

    #[tokio::test]
    async fn checkout_commit_closes_transaction() {
        let driver = Arc::new(MemDriver::default());
        let pool = empty_pool(Arc::clone(&driver)).await;

        let session = pool.checkout().await.unwrap();
        session.execute("INSERT INTO t VALUES (1);", &[]).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(
            driver.session_events(),
            [SessionEvent::Begin, SessionEvent::Commit]
        );
    }

    #[tokio::test]
    async fn dropped_session_rolls_back() {
        let driver = Arc::new(MemDriver::default());
        let pool = empty_pool(Arc::clone(&driver)).await;

        {
            let session = pool.checkout().await.unwrap();
            session.execute("INSERT INTO t VALUES (1);", &[]).await.unwrap();
            // Dropped without commit, e.g. on an early return or error path.
        }

        assert_eq!(
            driver.session_events(),
            [SessionEvent::Begin, SessionEvent::Rollback]
        );
    }

    #[tokio::test]
    async fn construction_registers_discovered_converters() {
        let state = ColumnDescriptor::new("state", EnumType::new("example_enum", ["ONE"]));
        let id = ColumnDescriptor::new("id", Int4Type);
        let table = TableDescriptor::builder("example_table")
            .column(&id)
            .unwrap()
            .column(&state)
            .unwrap()
            .build();

        let driver = Arc::new(
            MemDriver::default()
                .with_table("example_table", 4242, &[("id", 1), ("state", 2)])
                .with_type("example_enum", 16384),
        );

        let _pool = SchemaPool::with_driver(
            Arc::clone(&driver) as Arc<dyn Driver>,
            [table],
            Strictness::Strict,
        )
        .await
        .unwrap();

        assert_eq!(driver.registered_converters(), ["example_enum"]);
    }
}
