//! Spatial SQL functions registered on every embedded engine connection.
//!
//! Geometries are stored as WKT text. The functions evaluate with the same
//! geometry code as the generic engine, so both agree on every predicate.

use geo::Intersects;
use layerfilter_spatial::{
    Geometry, SpatialRelation, buffer_geometry, envelope, evaluate, geometry_from_wkt,
    geometry_to_wkt,
};
use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::functions::{Context, FunctionFlags};

fn user_error(err: common_exception::FilterError) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(err))
}

fn geometry_arg(ctx: &Context<'_>, index: usize) -> rusqlite::Result<Option<Geometry>> {
    let wkt: Option<String> = ctx.get(index)?;
    wkt.map(|wkt| geometry_from_wkt(&wkt))
        .transpose()
        .map_err(user_error)
}

/// Parses the reference argument, reusing the previous parse when the text
/// is unchanged. The reference is the same for every row of a scan.
fn cached_reference(
    memo: &Mutex<Option<(String, Geometry)>>,
    ctx: &Context<'_>,
    index: usize,
) -> rusqlite::Result<Option<Geometry>> {
    let Some(wkt) = ctx.get::<Option<String>>(index)? else {
        return Ok(None);
    };
    let mut memo = memo.lock();
    if let Some((text, geometry)) = memo.as_ref() {
        if *text == wkt {
            return Ok(Some(geometry.clone()));
        }
    }
    let geometry = geometry_from_wkt(&wkt).map_err(user_error)?;
    *memo = Some((wkt, geometry.clone()));
    Ok(Some(geometry))
}

fn register_relation(conn: &Connection, relation: SpatialRelation) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    let memo = Mutex::new(None);
    conn.create_scalar_function(relation.sql_function(), 2, flags, move |ctx| {
        let Some(candidate) = geometry_arg(ctx, 0)? else {
            return Ok(None);
        };
        let Some(reference) = cached_reference(&memo, ctx, 1)? else {
            return Ok(None);
        };
        if relation.uses_envelope_prefilter() {
            match (envelope(&candidate), envelope(&reference)) {
                (Some(a), Some(b)) if !a.intersects(&b) => return Ok(Some(false)),
                _ => {}
            }
        }
        Ok(Some(evaluate(relation, &candidate, &reference)))
    })
}

fn register_envelope_bound(
    conn: &Connection,
    name: &str,
    pick: fn(geo::Rect<f64>) -> f64,
) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function(name, 1, flags, move |ctx| {
        Ok(geometry_arg(ctx, 0)?.and_then(|g| envelope(&g)).map(pick))
    })
}

pub(crate) fn register(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    // The optional SRID argument is accepted and ignored.
    conn.create_scalar_function("ST_GeomFromText", -1, flags, |ctx| {
        if ctx.is_empty() || ctx.len() > 2 {
            return Err(rusqlite::Error::UserFunctionError(
                "ST_GeomFromText expects one or two arguments".into(),
            ));
        }
        Ok(geometry_arg(ctx, 0)?.map(|g| geometry_to_wkt(&g)))
    })?;

    let memo = Mutex::new(None);
    conn.create_scalar_function("ST_Buffer", 2, flags, move |ctx| {
        let Some(geometry) = cached_reference(&memo, ctx, 0)? else {
            return Ok(None);
        };
        let distance: f64 = ctx.get(1)?;
        Ok(Some(geometry_to_wkt(&buffer_geometry(&geometry, distance))))
    })?;

    for relation in SpatialRelation::ALL {
        register_relation(conn, relation)?;
    }

    register_envelope_bound(conn, "ST_MinX", |r| r.min().x)?;
    register_envelope_bound(conn, "ST_MaxX", |r| r.max().x)?;
    register_envelope_bound(conn, "ST_MinY", |r| r.min().y)?;
    register_envelope_bound(conn, "ST_MaxY", |r| r.max().y)?;
    Ok(())
}
