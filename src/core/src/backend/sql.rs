//! SQL rendering for the server (PostGIS) and embedded (SQLite) engines.
//!
//! Plans are turned into a structured [`SelectSpec`] first, so the server
//! client port receives statements it can either render or evaluate.

use geo::{Coord, Rect};
use layerfilter_spatial::{envelope, geometry_to_wkt};

use super::plan::{Artifact, FilterPlan, PlannedStep, ResolvedSpatial};
use crate::layer::LayerSource;

const ALIAS: &str = "t";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgis,
    Sqlite,
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `schema.name` with each part quoted.
pub fn qualified(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        None => quote_ident(name),
    }
}

/// The relation a plan reads rows from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTable {
    pub schema: Option<String>,
    pub table: String,
    pub primary_key: String,
    pub geometry_column: String,
    pub srid: Option<i32>,
}

impl SourceTable {
    pub fn from_source(source: &LayerSource) -> Self {
        let (schema, table) = source.schema_and_table();
        Self {
            schema: schema.map(ToOwned::to_owned),
            table: table.to_owned(),
            primary_key: source.primary_key.clone(),
            geometry_column: source.geometry_column.clone(),
            srid: source.srid,
        }
    }

    pub fn qualified(&self) -> String {
        qualified(self.schema.as_deref(), &self.table)
    }
}

/// A previous materialization the new rows must belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseRelation {
    pub schema: Option<String>,
    pub name: String,
    /// Embedded only: R*Tree holding the envelopes of the base rows.
    pub rtree: Option<String>,
}

impl BaseRelation {
    pub fn from_artifact(artifact: &Artifact) -> Option<Self> {
        match artifact {
            Artifact::View { schema, name } => Some(Self {
                schema: schema.clone(),
                name: name.clone(),
                rtree: None,
            }),
            Artifact::TempTable { name, rtree } => Some(Self {
                schema: Some("temp".to_owned()),
                name: name.clone(),
                rtree: Some(rtree.clone()),
            }),
            Artifact::Features(_) => None,
        }
    }

    pub fn qualified(&self) -> String {
        qualified(self.schema.as_deref(), &self.name)
    }
}

/// A structured `SELECT` over one source table.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectSpec {
    pub source: SourceTable,
    pub base: Option<BaseRelation>,
    pub steps: Vec<PlannedStep>,
}

impl SelectSpec {
    pub fn from_plan(plan: &FilterPlan, source: SourceTable) -> Self {
        Self {
            source,
            base: plan
                .base
                .as_ref()
                .and_then(|base| BaseRelation::from_artifact(&base.artifact)),
            steps: plan.steps.clone(),
        }
    }

    fn column(&self, name: &str) -> String {
        format!("{ALIAS}.{}", quote_ident(name))
    }

    fn reference_expr(&self, dialect: SqlDialect, spatial: &ResolvedSpatial) -> Vec<String> {
        spatial
            .references
            .iter()
            .map(|reference| {
                let wkt = quote_literal(&geometry_to_wkt(reference));
                let geometry = match (dialect, self.source.srid) {
                    (SqlDialect::Postgis, Some(srid)) => format!("ST_GeomFromText({wkt}, {srid})"),
                    _ => format!("ST_GeomFromText({wkt})"),
                };
                match spatial.effective_buffer() {
                    Some(distance) => format!("ST_Buffer({geometry}, {distance:?})"),
                    None => geometry,
                }
            })
            .collect()
    }

    fn spatial_clause(&self, dialect: SqlDialect, spatial: &ResolvedSpatial) -> String {
        let geometry = self.column(&self.source.geometry_column);
        let tests: Vec<String> = self
            .reference_expr(dialect, spatial)
            .into_iter()
            .map(|reference| {
                format!(
                    "{}({geometry}, {reference})",
                    spatial.predicate.sql_function()
                )
            })
            .collect();
        if tests.is_empty() {
            return false_literal(dialect).to_owned();
        }
        format!("({})", tests.join(" OR "))
    }

    fn base_clause(&self, base: &BaseRelation) -> String {
        let pk = quote_ident(&self.source.primary_key);
        if let (Some(rtree), Some(window)) = (&base.rtree, self.prefilter_window()) {
            let rtree = qualified(base.schema.as_deref(), rtree);
            return format!(
                "{} IN (SELECT id FROM {rtree} WHERE minx <= {:?} AND maxx >= {:?} AND miny <= {:?} AND maxy >= {:?})",
                self.column(&self.source.primary_key),
                window.max().x,
                window.min().x,
                window.max().y,
                window.min().y,
            );
        }
        format!(
            "{} IN (SELECT {pk} FROM {})",
            self.column(&self.source.primary_key),
            base.qualified()
        )
    }

    /// Envelope every matching row must intersect, when a step allows it.
    fn prefilter_window(&self) -> Option<Rect<f64>> {
        let spatial = self
            .steps
            .iter()
            .filter_map(|step| step.spatial.as_ref())
            .find(|spatial| spatial.predicate.uses_envelope_prefilter())?;
        let grow = spatial.effective_buffer().unwrap_or(0.0).max(0.0);
        let mut window: Option<Rect<f64>> = None;
        for reference in &spatial.references {
            let rect = envelope(reference)?;
            window = Some(match window {
                Some(current) => Rect::new(
                    Coord {
                        x: current.min().x.min(rect.min().x),
                        y: current.min().y.min(rect.min().y),
                    },
                    Coord {
                        x: current.max().x.max(rect.max().x),
                        y: current.max().y.max(rect.max().y),
                    },
                ),
                None => rect,
            });
        }
        window.map(|rect| {
            Rect::new(
                Coord {
                    x: rect.min().x - grow,
                    y: rect.min().y - grow,
                },
                Coord {
                    x: rect.max().x + grow,
                    y: rect.max().y + grow,
                },
            )
        })
    }

    /// The `WHERE` expression: base membership and every step, combined with AND.
    pub fn where_clause(&self, dialect: SqlDialect) -> String {
        let mut clauses = Vec::new();
        if let Some(base) = &self.base {
            clauses.push(self.base_clause(base));
        }
        for step in &self.steps {
            if let Some(spatial) = &step.spatial {
                clauses.push(self.spatial_clause(dialect, spatial));
            }
            if let Some(attribute) = &step.attribute {
                clauses.push(format!("({})", attribute.to_sql(dialect, ALIAS)));
            }
        }
        if clauses.is_empty() {
            return true_literal(dialect).to_owned();
        }
        clauses.join(" AND ")
    }

    pub fn select_keys(&self, dialect: SqlDialect) -> String {
        let pk = quote_ident(&self.source.primary_key);
        format!(
            "SELECT {ALIAS}.{pk} AS {pk} FROM {} AS {ALIAS} WHERE {}",
            self.source.qualified(),
            self.where_clause(dialect)
        )
    }

    pub fn select_keys_and_geometry(&self, dialect: SqlDialect) -> String {
        let pk = quote_ident(&self.source.primary_key);
        let geom = quote_ident(&self.source.geometry_column);
        format!(
            "SELECT {ALIAS}.{pk} AS {pk}, {ALIAS}.{geom} AS {geom} FROM {} AS {ALIAS} WHERE {}",
            self.source.qualified(),
            self.where_clause(dialect)
        )
    }
}

fn true_literal(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Postgis => "TRUE",
        SqlDialect::Sqlite => "1",
    }
}

fn false_literal(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Postgis => "FALSE",
        SqlDialect::Sqlite => "0",
    }
}

/// A subset definition selecting the given keys.
///
/// Consecutive runs of three or more keys collapse into `BETWEEN` ranges.
pub fn id_subset(primary_key: &str, ids: &[i64]) -> String {
    if ids.is_empty() {
        return "1 = 0".to_owned();
    }
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let column = quote_ident(primary_key);
    let mut ranges = Vec::new();
    let mut singles = Vec::new();
    let mut start = 0;
    while start < sorted.len() {
        let mut end = start;
        while end + 1 < sorted.len() && sorted[end + 1] == sorted[end] + 1 {
            end += 1;
        }
        if end - start >= 2 {
            ranges.push(format!("{column} BETWEEN {} AND {}", sorted[start], sorted[end]));
        } else {
            singles.extend(sorted[start..=end].iter().map(ToString::to_string));
        }
        start = end + 1;
    }
    if !singles.is_empty() {
        ranges.push(format!("{column} IN ({})", singles.join(",")));
    }
    if ranges.len() == 1 {
        ranges.remove(0)
    } else {
        ranges
            .iter()
            .map(|r| format!("({r})"))
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

/// A subset definition selecting the keys stored in a server view.
pub fn view_subset(primary_key: &str, schema: Option<&str>, view: &str) -> String {
    let column = quote_ident(primary_key);
    format!("{column} IN (SELECT {column} FROM {})", qualified(schema, view))
}

#[cfg(test)]
mod tests {
    use layerfilter_spatial::{SpatialRelation, geometry_from_wkt};

    use super::*;
    use crate::attribute::parse;

    fn spec(base: Option<BaseRelation>, buffer: Option<f64>) -> SelectSpec {
        SelectSpec {
            source: SourceTable {
                schema: Some("gis".to_owned()),
                table: "roads".to_owned(),
                primary_key: "fid".to_owned(),
                geometry_column: "geom".to_owned(),
                srid: Some(3857),
            },
            base,
            steps: vec![PlannedStep {
                spatial: Some(ResolvedSpatial {
                    predicate: SpatialRelation::Intersects,
                    buffer,
                    references: vec![geometry_from_wkt("POINT(10 20)").unwrap()],
                }),
                attribute: Some(parse("lanes > 1").unwrap()),
            }],
        }
    }

    #[test]
    fn postgis_buffers_the_reference() {
        let sql = spec(None, Some(50.0)).select_keys(SqlDialect::Postgis);
        let wkt = geometry_to_wkt(&geometry_from_wkt("POINT(10 20)").unwrap());
        assert_eq!(
            sql,
            format!(
                r#"SELECT t."fid" AS "fid" FROM "gis"."roads" AS t WHERE (ST_Intersects(t."geom", ST_Buffer(ST_GeomFromText('{wkt}', 3857), 50.0))) AND (t."lanes" > 1)"#
            )
        );
    }

    #[test]
    fn sqlite_base_uses_rtree_window() {
        let base = BaseRelation {
            schema: Some("temp".to_owned()),
            name: "lf_tmp_a".to_owned(),
            rtree: Some("lf_tmp_a_rtree".to_owned()),
        };
        let clause = spec(Some(base), Some(5.0)).where_clause(SqlDialect::Sqlite);
        assert!(clause.starts_with(
            r#"t."fid" IN (SELECT id FROM "temp"."lf_tmp_a_rtree" WHERE minx <= 15.0 AND maxx >= 5.0 AND miny <= 25.0 AND maxy >= 15.0)"#
        ), "{clause}");
        assert!(clause.contains("ST_Buffer(ST_GeomFromText('POINT"), "{clause}");
        assert!(clause.ends_with(r#"(t."lanes" > 1)"#), "{clause}");
    }

    #[test]
    fn view_base_uses_membership() {
        let base = BaseRelation {
            schema: Some("gis".to_owned()),
            name: "lf_mv_a".to_owned(),
            rtree: None,
        };
        let clause = spec(Some(base), None).where_clause(SqlDialect::Postgis);
        assert!(clause.starts_with(r#"t."fid" IN (SELECT "fid" FROM "gis"."lf_mv_a")"#));
    }

    #[test]
    fn id_subset_collapses_runs() {
        assert_eq!(id_subset("fid", &[]), "1 = 0");
        assert_eq!(id_subset("fid", &[3, 1]), r#""fid" IN (1,3)"#);
        assert_eq!(
            id_subset("fid", &[5, 1, 2, 3, 4, 9, 11]),
            r#"("fid" BETWEEN 1 AND 5) OR ("fid" IN (9,11))"#
        );
    }

    #[test]
    fn quoting_escapes() {
        assert_eq!(quote_ident(r#"a"b"#), r#""a""b""#);
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
