//! Embedded engine adapter (SQLite).
//!
//! Each plan is materialized into a session temporary table plus an R*Tree
//! over the envelopes of its rows. The engine allows a single writer per
//! database file: writes from every adapter in the process go through one
//! async mutex per file, and a file locked by another process is retried with
//! bounded backoff. Connections never wait on SQLite's own busy handler.
//!
//! Layers stored in another engine are imported once into an in-memory
//! database through the host's data provider.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common_exception::{FilterError, Result};
use common_utils::{RetryPolicy, retry_with_backoff};
use layerfilter_spatial::geometry_to_wkt;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OpenFlags, params_from_iter};
use tracing::{debug, warn};

use super::plan::{Artifact, FilterPlan, Materialization};
use super::sql::{SelectSpec, SourceTable, SqlDialect, id_subset, qualified, quote_ident};
use super::sqlite_functions;
use super::{
    BackendKind, BackendPort, ExecutionContext, require_attribute_only, require_spatial,
};
use crate::cache::CacheKey;
use crate::events::Phase;
use crate::host::{FeatureScope, HostLayers};
use crate::layer::{AttrValue, Feature, LayerRef, StorageKind};
use crate::request::FilterResult;

const BACKEND: &str = "embedded";
const MEMORY: &str = ":memory:";
const IMPORTED_TABLE: &str = "lf_source";

/// One writer lock per database file, shared by every embedded adapter in
/// the process.
#[derive(Clone, Default)]
pub struct EmbeddedLocks {
    files: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl EmbeddedLocks {
    pub fn for_path(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.files.lock().entry(path.to_owned()).or_default())
    }
}

/// Maps a native SQLite failure into the shared taxonomy.
fn map_sqlite_error(path: &str, err: rusqlite::Error) -> FilterError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => FilterError::TransientLock {
            path: path.to_owned(),
            attempts: 1,
        },
        _ => FilterError::storage(BACKEND, err),
    }
}

struct TempNames {
    table: String,
    rtree: String,
}

struct EmbeddedInner {
    layer: LayerRef,
    host: Arc<dyn HostLayers>,
    /// Database file, or `:memory:` for imported layers.
    path: String,
    /// Key into the writer lock registry.
    lock_key: String,
    locks: EmbeddedLocks,
    retry: RetryPolicy,
    conn: Arc<Mutex<Option<Connection>>>,
    source: tokio::sync::Mutex<Option<SourceTable>>,
    tables: Mutex<Vec<(String, String)>>,
}

pub struct EmbeddedAdapter {
    inner: Arc<EmbeddedInner>,
}

impl EmbeddedAdapter {
    pub fn new(
        layer: LayerRef,
        host: Arc<dyn HostLayers>,
        locks: EmbeddedLocks,
        retry: RetryPolicy,
    ) -> Self {
        let (path, lock_key) = match layer.storage {
            StorageKind::Embedded => (layer.source.location.clone(), layer.source.location.clone()),
            _ => (MEMORY.to_owned(), format!("{MEMORY}{}", layer.id)),
        };
        Self {
            inner: Arc::new(EmbeddedInner {
                layer,
                host,
                path,
                lock_key,
                locks,
                retry,
                conn: Arc::new(Mutex::new(None)),
                source: tokio::sync::Mutex::new(None),
                tables: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn layer(&self) -> &LayerRef {
        &self.inner.layer
    }

    async fn run(&self, plan: &FilterPlan, ctx: &ExecutionContext) -> Result<FilterResult> {
        let started = Instant::now();
        ctx.checkpoint(Phase::BuildMaterialization)?;
        let source = self.inner.source_table().await?;
        let select = SelectSpec::from_plan(plan, source);
        let names = TempNames {
            table: format!("lf_tmp_{}", plan.fingerprint),
            rtree: format!("lf_tmp_{}_rtree", plan.fingerprint),
        };
        let key = CacheKey::new(
            self.inner.layer.id.clone(),
            BackendKind::Embedded,
            plan.fingerprint.clone(),
        );
        let inner = Arc::clone(&self.inner);
        let fingerprint = plan.fingerprint.clone();
        let materialization = ctx
            .materialize(key, move || async move {
                inner.build(select, names, fingerprint).await
            })
            .await?;
        if let Artifact::TempTable { name, rtree } = &materialization.artifact {
            let mut tables = self.inner.tables.lock();
            let entry = (name.clone(), rtree.clone());
            if !tables.contains(&entry) {
                tables.push(entry);
            }
        }

        ctx.checkpoint(Phase::RunPredicate)?;
        ctx.checkpoint(Phase::ComputeCount)?;
        Ok(FilterResult::from_materialization(
            BackendKind::Embedded,
            materialization,
            None,
            started.elapsed(),
        ))
    }
}

impl EmbeddedInner {
    /// Runs `job` on the adapter's connection on a blocking worker, holding the
    /// file's writer lock and retrying while the file is locked elsewhere.
    async fn with_connection<T, F>(&self, label: &str, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Connection, &str) -> rusqlite::Result<T> + Clone + Send + 'static,
    {
        let lock = self.locks.for_path(&self.lock_key);
        let _writer = lock.lock().await;
        retry_with_backoff(self.retry, label, |attempt| {
            let conn = Arc::clone(&self.conn);
            let path = self.path.clone();
            let job = job.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let mut guard = conn.lock();
                    if guard.is_none() {
                        *guard = Some(open_connection(&path)?);
                    }
                    match guard.as_ref() {
                        Some(conn) => job(conn, &path).map_err(|e| map_sqlite_error(&path, e)),
                        None => Err(FilterError::Internal("connection not open".to_owned())),
                    }
                })
                .await
                .map_err(|e| {
                    FilterError::Internal(format!("embedded worker failed on attempt {attempt}: {e}"))
                })?
            }
        })
        .await
    }

    /// The table filters read from, importing the layer first if it is not
    /// stored in this engine.
    async fn source_table(&self) -> Result<SourceTable> {
        let mut source = self.source.lock().await;
        if let Some(table) = source.as_ref() {
            return Ok(table.clone());
        }
        let table = match self.layer.storage {
            StorageKind::Embedded => SourceTable::from_source(&self.layer.source),
            _ => self.import().await?,
        };
        *source = Some(table.clone());
        Ok(table)
    }

    async fn import(&self) -> Result<SourceTable> {
        let features = self
            .host
            .fetch_features(&self.layer.id, FeatureScope::All)
            .await?;
        let table = SourceTable {
            schema: Some("temp".to_owned()),
            table: IMPORTED_TABLE.to_owned(),
            primary_key: self.layer.source.primary_key.clone(),
            geometry_column: self.layer.source.geometry_column.clone(),
            srid: self.layer.source.srid,
        };
        let rows = Arc::new(features);
        let count = rows.len();
        let target = table.clone();
        self.with_connection("embedded import", move |conn, _| {
            import_features(conn, &target, &rows)
        })
        .await?;
        debug!(layer = %self.layer.id, features = count, "imported layer into embedded engine");
        Ok(table)
    }

    async fn build(
        &self,
        select: SelectSpec,
        names: TempNames,
        fingerprint: String,
    ) -> Result<Materialization> {
        let table = names.table.clone();
        let rtree = names.rtree.clone();
        let ids = self
            .with_connection("embedded materialize", move |conn, _| {
                materialize(conn, &select, &table, &rtree)
            })
            .await?;
        debug!(
            layer = %self.layer.id,
            table = %names.table,
            rows = ids.len(),
            "materialized temp table"
        );
        Ok(Materialization {
            fingerprint,
            subset: id_subset(&self.layer.source.primary_key, &ids),
            feature_count: Some(ids.len() as u64),
            artifact: Artifact::TempTable {
                name: names.table,
                rtree: names.rtree,
            },
        })
    }

    async fn drop_tables(&self, table: String, rtree: String) -> Result<()> {
        self.with_connection("embedded discard", move |conn, _| {
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
                qualified(Some("temp"), &table),
                qualified(Some("temp"), &rtree),
            ))
        })
        .await
    }
}

fn open_connection(path: &str) -> Result<Connection> {
    let conn = if path == MEMORY {
        Connection::open_in_memory()
    } else {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
        )
    }
    .map_err(|e| map_sqlite_error(path, e))?;
    // Contention is handled by the retry loop, not by SQLite's busy handler.
    conn.busy_timeout(Duration::ZERO)
        .map_err(|e| map_sqlite_error(path, e))?;
    sqlite_functions::register(&conn).map_err(|e| map_sqlite_error(path, e))?;
    Ok(conn)
}

/// Rebuilds the temp table and its R*Tree, returning the selected keys.
///
/// Every statement is repeatable, so a retried attempt starts clean.
fn materialize(
    conn: &Connection,
    select: &SelectSpec,
    table: &str,
    rtree: &str,
) -> rusqlite::Result<Vec<i64>> {
    let temp_table = qualified(Some("temp"), table);
    let temp_rtree = qualified(Some("temp"), rtree);
    let pk = quote_ident(&select.source.primary_key);
    let geom = quote_ident(&select.source.geometry_column);
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {temp_table};\n\
         DROP TABLE IF EXISTS {temp_rtree};\n\
         CREATE TEMP TABLE {table_name} AS {select};\n\
         CREATE VIRTUAL TABLE {temp_rtree} USING rtree(id, minx, maxx, miny, maxy);\n\
         INSERT INTO {temp_rtree} (id, minx, maxx, miny, maxy) \
         SELECT s.{pk}, ST_MinX(s.{geom}), ST_MaxX(s.{geom}), ST_MinY(s.{geom}), ST_MaxY(s.{geom}) \
         FROM {source} AS s WHERE s.{pk} IN (SELECT {pk} FROM {temp_table}) AND ST_MinX(s.{geom}) IS NOT NULL;",
        table_name = quote_ident(table),
        select = select.select_keys(SqlDialect::Sqlite),
        source = select.source.qualified(),
    ))?;
    let mut statement = conn.prepare(&format!("SELECT {pk} FROM {temp_table} ORDER BY {pk}"))?;
    let ids = statement
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

fn attr_to_value(value: &AttrValue) -> Value {
    match value {
        AttrValue::Null => Value::Null,
        AttrValue::Bool(v) => Value::Integer(i64::from(*v)),
        AttrValue::Int(v) => Value::Integer(*v),
        AttrValue::Float(v) => Value::Real(*v),
        AttrValue::Text(v) => Value::Text(v.clone()),
    }
}

fn import_features(
    conn: &Connection,
    table: &SourceTable,
    features: &[Feature],
) -> rusqlite::Result<()> {
    let columns: BTreeSet<&str> = features
        .iter()
        .flat_map(|f| f.attributes.keys().map(String::as_str))
        .filter(|name| *name != table.primary_key && *name != table.geometry_column)
        .collect();
    let target = table.qualified();
    let mut ddl = format!(
        "DROP TABLE IF EXISTS {target};\nCREATE TEMP TABLE {} ({} INTEGER PRIMARY KEY, {} TEXT",
        quote_ident(&table.table),
        quote_ident(&table.primary_key),
        quote_ident(&table.geometry_column),
    );
    for column in &columns {
        ddl.push_str(&format!(", {}", quote_ident(column)));
    }
    ddl.push_str(");");
    conn.execute_batch(&ddl)?;

    let placeholders = vec!["?"; columns.len() + 2].join(", ");
    let tx = conn.unchecked_transaction()?;
    {
        let mut insert = tx.prepare(&format!("INSERT INTO {target} VALUES ({placeholders})"))?;
        for feature in features {
            let mut values = Vec::with_capacity(columns.len() + 2);
            values.push(Value::Integer(feature.id));
            values.push(Value::Text(geometry_to_wkt(&feature.geometry)));
            values.extend(columns.iter().map(|c| attr_to_value(feature.attribute(c))));
            insert.execute(params_from_iter(values))?;
        }
    }
    tx.commit()
}

#[async_trait]
impl BackendPort for EmbeddedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn apply_geometric_filter(
        &self,
        plan: &FilterPlan,
        ctx: &ExecutionContext,
    ) -> Result<FilterResult> {
        require_spatial(plan)?;
        self.run(plan, ctx).await
    }

    async fn apply_attribute_filter(
        &self,
        plan: &FilterPlan,
        ctx: &ExecutionContext,
    ) -> Result<FilterResult> {
        require_attribute_only(plan)?;
        self.run(plan, ctx).await
    }

    async fn discard(&self, materialization: &Materialization) -> Result<()> {
        let Artifact::TempTable { name, rtree } = &materialization.artifact else {
            return Ok(());
        };
        self.inner.drop_tables(name.clone(), rtree.clone()).await?;
        self.inner
            .tables
            .lock()
            .retain(|(table, _)| table != name);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let tables = std::mem::take(&mut *self.inner.tables.lock());
        for (table, rtree) in tables {
            if let Err(e) = self.inner.drop_tables(table.clone(), rtree).await {
                warn!(layer = %self.inner.layer.id, table = %table, error = %e, "failed to drop temp table");
            }
        }
        self.inner.source.lock().await.take();
        // Closing the connection drops anything temporary that is left.
        if let Some(conn) = self.inner.conn.lock().take() {
            if let Err((_, e)) = conn.close() {
                warn!(layer = %self.inner.layer.id, error = %e, "failed to close connection");
            }
        }
        Ok(())
    }
}
