use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use layerfilter::backend::ServerClient;
use layerfilter::backend::postgres::PgPool;
use layerfilter::{
    BackendKind, EngineConfig, FilterRequest, FilterService, InMemoryHost, LayerRef, LayerSource,
    ReferenceSource, StorageKind,
};
use layerfilter_spatial::SpatialRelation;
#[cfg(test)]
use rusky as _;
use tikv_jemallocator::Jemalloc;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Applies one spatial filter to a layer and logs the resulting subset.
#[derive(Parser, Debug)]
#[command(
    name = "layerfilter-core",
    about = "Backend-aware spatial filtering of a single layer"
)]
struct Args {
    /// SQLite file, or a PostgreSQL connection string for the server engine.
    #[arg(value_name = "DATABASE")]
    database: String,
    /// Table (optionally `schema.table`) holding the layer.
    #[arg(value_name = "TABLE")]
    table: String,
    /// Spatial predicate such as intersects, within or disjoint.
    #[arg(value_name = "PREDICATE")]
    predicate: SpatialRelation,
    /// Reference geometry as WKT.
    #[arg(value_name = "WKT")]
    reference: String,
    /// Signed buffer distance applied to the reference, in layer units.
    #[arg(long, short = 'b', allow_negative_numbers = true)]
    buffer: Option<f64>,
    /// Attribute expression combined with the spatial predicate.
    #[arg(long = "where", short = 'w', value_name = "EXPR")]
    expression: Option<String>,
    /// Force a backend (server, embedded or generic) instead of the ranking.
    #[arg(long, value_name = "BACKEND")]
    backend: Option<BackendKind>,
}

fn is_server_dsn(database: &str) -> bool {
    database.starts_with("postgres://")
        || database.starts_with("postgresql://")
        || database.contains("host=")
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env();
    if let Some(kind) = args.backend {
        config = config.with_forced_backend(kind);
    }
    let (storage, server) = if is_server_dsn(&args.database) {
        let pool = PgPool::connect(&args.database, config.server_pool_size)
            .await
            .context("cannot connect to server")?;
        let client: Arc<dyn ServerClient> = Arc::new(pool);
        (StorageKind::Server, Some(client))
    } else {
        (StorageKind::Embedded, None)
    };
    let layer = LayerRef::new(
        args.table.as_str(),
        storage,
        LayerSource::new(args.database.as_str(), args.table.as_str()),
    );
    let host = Arc::new(InMemoryHost::new());
    host.add_layer(&layer, Vec::new());

    let mut request = FilterRequest::spatial(args.predicate, ReferenceSource::wkt(&args.reference)?);
    if let Some(distance) = args.buffer {
        request = request.with_buffer(distance);
    }
    if let Some(expression) = args.expression {
        request = request.with_attribute(expression);
    }

    let service = FilterService::new(host, server, config).await;
    let outcome = service.submit_filter(layer, request).wait().await;
    service.shutdown().await;

    let result = outcome.context("filter failed")?;
    info!(
        backend = result.backend_name(),
        features = ?result.feature_count,
        elapsed = ?result.elapsed,
        subset = %result.subset,
        "filter applied"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let guards = common_telemetry::init_logging();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e:#}");
        drop(guards);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_arguments() -> anyhow::Result<()> {
        let parsed = Args::try_parse_from([
            "layerfilter-core",
            "parcels.sqlite",
            "parcels",
            "within",
            "POINT(1 2)",
            "--buffer",
            "25.5",
            "--where",
            "kind = 'road'",
            "--backend",
            "generic",
        ])?;
        assert_eq!(parsed.database, "parcels.sqlite");
        assert_eq!(parsed.table, "parcels");
        assert_eq!(parsed.predicate, SpatialRelation::Within);
        assert_eq!(parsed.reference, "POINT(1 2)");
        assert_eq!(parsed.buffer, Some(25.5));
        assert_eq!(parsed.expression.as_deref(), Some("kind = 'road'"));
        assert_eq!(parsed.backend, Some(BackendKind::Generic));
        Ok(())
    }

    #[test]
    fn test_negative_buffer_is_accepted() -> anyhow::Result<()> {
        let parsed = Args::try_parse_from([
            "layerfilter-core",
            "a.sqlite",
            "t",
            "intersects",
            "POINT(0 0)",
            "-b",
            "-10",
        ])?;
        assert_eq!(parsed.buffer, Some(-10.0));
        assert_eq!(parsed.backend, None);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_missing_and_bad_arguments() {
        let bin = "layerfilter-core";
        assert!(Args::try_parse_from([bin, "parcels.sqlite", "parcels"]).is_err());
        assert!(Args::try_parse_from([bin, "a.sqlite", "t", "near", "POINT(0 0)"]).is_err());
        assert!(
            Args::try_parse_from([bin, "a.sqlite", "t", "within", "POINT(0 0)", "--buffer", "far"])
                .is_err()
        );
        assert!(
            Args::try_parse_from([bin, "a.sqlite", "t", "within", "POINT(0 0)", "--backend", "duckdb"])
                .is_err()
        );
    }

    #[test]
    fn test_server_dsn_detection() {
        assert!(is_server_dsn("postgres://gis@localhost/gis"));
        assert!(is_server_dsn("host=localhost dbname=gis"));
        assert!(!is_server_dsn("/data/parcels.sqlite"));
    }
}
