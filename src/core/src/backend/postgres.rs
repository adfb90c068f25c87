//! `tokio-postgres` implementation of the server client port.

use std::ops::Deref;

use async_trait::async_trait;
use common_exception::{FilterError, Result};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

use super::server::{ServerClient, ViewName};
use super::sql::{SelectSpec, SqlDialect, quote_ident};

const BACKEND: &str = "server";

/// A fixed set of connections shared by every server-backed layer.
///
/// Checkouts beyond the pool size wait for a connection to come back; the
/// pool never opens more than `size` connections.
pub struct PgPool {
    clients: Vec<Client>,
    free: Mutex<Vec<usize>>,
    permits: Semaphore,
}

impl PgPool {
    pub async fn connect(dsn: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let mut clients = Vec::with_capacity(size);
        for _ in 0..size {
            let (client, connection) = tokio_postgres::connect(dsn, NoTls)
                .await
                .map_err(|e| FilterError::storage(BACKEND, e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("connection error: {}", e);
                }
            });
            clients.push(client);
        }
        debug!(size, "opened server connection pool");
        Ok(Self {
            free: Mutex::new((0..clients.len()).collect()),
            clients,
            permits: Semaphore::new(size),
        })
    }

    async fn checkout(&self) -> Result<PooledClient<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| FilterError::Internal(format!("connection pool closed: {e}")))?;
        let index = self
            .free
            .lock()
            .pop()
            .ok_or_else(|| FilterError::Internal("connection pool is empty".to_owned()))?;
        Ok(PooledClient {
            pool: self,
            index,
            _permit: permit,
        })
    }

    async fn batch(&self, sql: &str) -> Result<()> {
        let client = self.checkout().await?;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| FilterError::storage(BACKEND, e))
    }
}

struct PooledClient<'a> {
    pool: &'a PgPool,
    index: usize,
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledClient<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.pool.clients[self.index]
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.index);
    }
}

/// `CREATE MATERIALIZED VIEW` plus the GiST index on its geometry.
///
/// The statements fail on an existing relation rather than adopting it;
/// view names are unique per session and build.
pub fn create_view_sql(view: &ViewName, select: &SelectSpec) -> String {
    let index = index_name(view, "gix");
    format!(
        "CREATE MATERIALIZED VIEW {view} AS {select};\n\
         CREATE INDEX {index} ON {view} USING GIST ({geom});\n\
         CREATE INDEX {pk_index} ON {view} ({pk});",
        view = view.qualified(),
        select = select.select_keys_and_geometry(SqlDialect::Postgis),
        geom = quote_ident(&select.source.geometry_column),
        pk_index = index_name(view, "pk"),
        pk = quote_ident(&select.source.primary_key),
    )
}

/// Index names are unqualified; the index lives in the view's schema.
fn index_name(view: &ViewName, suffix: &str) -> String {
    quote_ident(&format!("{}_{suffix}", view.name))
}

#[async_trait]
impl ServerClient for PgPool {
    async fn ping(&self) -> Result<()> {
        let client = self.checkout().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| FilterError::storage(BACKEND, e))
    }

    async fn create_materialized_view(&self, view: &ViewName, select: &SelectSpec) -> Result<()> {
        self.batch(&create_view_sql(view, select)).await
    }

    async fn count_rows(&self, view: &ViewName) -> Result<u64> {
        let client = self.checkout().await?;
        let row = client
            .query_one(&format!("SELECT count(*) FROM {}", view.qualified()), &[])
            .await
            .map_err(|e| FilterError::storage(BACKEND, e))?;
        let count: i64 = row.try_get(0).map_err(|e| FilterError::storage(BACKEND, e))?;
        Ok(count.max(0) as u64)
    }

    async fn drop_materialized_view(&self, view: &ViewName) -> Result<()> {
        self.batch(&format!(
            "DROP MATERIALIZED VIEW IF EXISTS {} CASCADE",
            view.qualified()
        ))
        .await
    }
}
