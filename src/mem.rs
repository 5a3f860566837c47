//! An in-memory [`Driver`] implementation, useful for testing.
//!
//! Catalog objects are declared up front with the `with_*` builder methods;
//! fetch and execute results are scripted FIFO queues. All statements and
//! transaction events are recorded for assertions.

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    interface::{
        exactly_one, CatalogColumn, ColumnOrdinal, Driver, DriverError, DriverSession, Row,
        TableOid, TypeOid, Value,
    },
    semantic::Converter,
};

/// A transaction lifecycle event observed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A transaction was opened.
    Begin,
    /// A transaction was committed.
    Commit,
    /// A transaction was rolled back (session dropped uncommitted).
    Rollback,
}

#[derive(Debug, Clone)]
struct MemTable {
    name: String,
    oid: TableOid,
    columns: Vec<CatalogColumn>,
}

#[derive(Debug, Default)]
struct MemState {
    tables: Vec<MemTable>,
    types: Vec<(String, TypeOid)>,
    converters: Vec<Converter>,
    fetch_results: VecDeque<Vec<Row>>,
    execute_results: VecDeque<u64>,
    statements: Vec<String>,
    session_events: Vec<SessionEvent>,
}

/// An in-memory [`Driver`] backed by scripted results.
#[derive(Debug, Default)]
pub struct MemDriver {
    state: Arc<Mutex<MemState>>,
}

impl MemDriver {
    /// Declare a catalog table with the given OID and `(name, ordinal)`
    /// column definitions.
    pub fn with_table(self, name: &str, oid: u32, columns: &[(&str, i16)]) -> Self {
        {
            let mut state = self.state.lock();
            let mut columns = columns
                .iter()
                .map(|&(name, ordinal)| CatalogColumn {
                    name: name.to_owned(),
                    ordinal: ColumnOrdinal::new(ordinal),
                })
                .collect::<Vec<_>>();
            columns.sort_by_key(|c| c.ordinal);
            state.tables.push(MemTable {
                name: name.to_owned(),
                oid: TableOid::new(oid),
                columns,
            });
        }
        self
    }

    /// Declare a catalog type with the given OID.
    pub fn with_type(self, name: &str, oid: u32) -> Self {
        self.state
            .lock()
            .types
            .push((name.to_owned(), TypeOid::new(oid)));
        self
    }

    /// Queue the result of the next `fetch` (or `fetch_one`) call.
    pub fn with_fetch_result(self, rows: Vec<Row>) -> Self {
        self.state.lock().fetch_results.push_back(rows);
        self
    }

    /// Queue the affected-row count of the next `execute` call.
    pub fn with_execute_result(self, count: u64) -> Self {
        self.state.lock().execute_results.push_back(count);
        self
    }

    /// All statements passed to `execute`/`fetch`/`fetch_one`, in call
    /// order, across the pool and any checked-out sessions.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Names of every converter registered on this driver.
    pub fn registered_converters(&self) -> Vec<String> {
        self.state
            .lock()
            .converters
            .iter()
            .map(|c| c.type_name().to_owned())
            .collect()
    }

    /// All transaction lifecycle events, in occurrence order.
    pub fn session_events(&self) -> Vec<SessionEvent> {
        self.state.lock().session_events.clone()
    }

    fn record_and_pop_fetch(&self, query: &str) -> Vec<Row> {
        let mut state = self.state.lock();
        state.statements.push(query.to_owned());
        state.fetch_results.pop_front().unwrap_or_default()
    }

    fn record_and_pop_execute(&self, query: &str) -> u64 {
        let mut state = self.state.lock();
        state.statements.push(query.to_owned());
        state.execute_results.pop_front().unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MemDriver {
    async fn execute(&self, query: &str, _params: &[Value]) -> Result<u64, DriverError> {
        Ok(self.record_and_pop_execute(query))
    }

    async fn fetch(&self, query: &str, _params: &[Value]) -> Result<Vec<Row>, DriverError> {
        Ok(self.record_and_pop_fetch(query))
    }

    async fn fetch_one(&self, query: &str, params: &[Value]) -> Result<Row, DriverError> {
        exactly_one(self.fetch(query, params).await?)
    }

    async fn begin(&self) -> Result<Box<dyn DriverSession>, DriverError> {
        self.state.lock().session_events.push(SessionEvent::Begin);
        Ok(Box::new(MemSession {
            driver: MemDriver {
                state: Arc::clone(&self.state),
            },
            open: Mutex::new(true),
        }))
    }

    fn register_converter(&self, converter: Converter) {
        self.state.lock().converters.push(converter);
    }

    async fn table_oid(&self, table_name: &str) -> Result<Option<TableOid>, DriverError> {
        Ok(self
            .state
            .lock()
            .tables
            .iter()
            .find(|t| t.name == table_name)
            .map(|t| t.oid))
    }

    async fn table_columns(&self, oid: TableOid) -> Result<Vec<CatalogColumn>, DriverError> {
        Ok(self
            .state
            .lock()
            .tables
            .iter()
            .find(|t| t.oid == oid)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn type_oid(&self, type_name: &str) -> Result<Option<TypeOid>, DriverError> {
        Ok(self
            .state
            .lock()
            .types
            .iter()
            .find(|(name, _)| name == type_name)
            .map(|&(_, oid)| oid))
    }
}

#[derive(Debug)]
struct MemSession {
    driver: MemDriver,
    open: Mutex<bool>,
}

#[async_trait]
impl DriverSession for MemSession {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.driver.execute(query, params).await
    }

    async fn fetch(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        self.driver.fetch(query, params).await
    }

    async fn fetch_one(&self, query: &str, params: &[Value]) -> Result<Row, DriverError> {
        self.driver.fetch_one(query, params).await
    }

    async fn commit(self: Box<Self>) -> Result<(), DriverError> {
        *self.open.lock() = false;
        self.driver
            .state
            .lock()
            .session_events
            .push(SessionEvent::Commit);
        Ok(())
    }
}

impl Drop for MemSession {
    fn drop(&mut self) {
        if *self.open.lock() {
            self.driver
                .state
                .lock()
                .session_events
                .push(SessionEvent::Rollback);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::interface::RowColumn;

    use super::*;

    #[tokio::test]
    async fn answers_catalog_queries() {
        let driver = MemDriver::default()
            .with_table("t", 10, &[("b", 2), ("a", 1)])
            .with_type("example_enum", 16384);

        assert_eq!(
            driver.table_oid("t").await.unwrap(),
            Some(TableOid::new(10))
        );
        assert_eq!(driver.table_oid("nope").await.unwrap(), None);

        // Columns come back ordered by ordinal regardless of declaration
        // order.
        let columns = driver.table_columns(TableOid::new(10)).await.unwrap();
        assert_eq!(
            columns
                .iter()
                .map(|c| (c.name.as_str(), c.ordinal.get()))
                .collect::<Vec<_>>(),
            [("a", 1), ("b", 2)]
        );

        assert_eq!(
            driver.type_oid("example_enum").await.unwrap(),
            Some(TypeOid::new(16384))
        );
        assert_eq!(driver.type_oid("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scripted_fetch_results_pop_in_order() {
        let row = Row::new(
            vec![RowColumn {
                name: "v".into(),
                table_oid: None,
                ordinal: None,
            }],
            vec![Value::Int4(1)],
        );
        let driver = MemDriver::default()
            .with_fetch_result(vec![row.clone()])
            .with_fetch_result(vec![]);

        assert_eq!(driver.fetch("SELECT 1;", &[]).await.unwrap(), vec![row]);
        assert_matches!(
            driver.fetch_one("SELECT 1;", &[]).await,
            Err(DriverError::NotExactlyOneRow { returned: 0 })
        );
        assert_eq!(driver.statements(), ["SELECT 1;", "SELECT 1;"]);
    }

    #[tokio::test]
    async fn commit_suppresses_rollback_event() {
        let driver = MemDriver::default();

        let session = driver.begin().await.unwrap();
        session.commit().await.unwrap();
        drop(driver.begin().await.unwrap());

        assert_eq!(
            driver.session_events(),
            [
                SessionEvent::Begin,
                SessionEvent::Commit,
                SessionEvent::Begin,
                SessionEvent::Rollback
            ]
        );
    }
}
