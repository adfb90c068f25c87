//! The attribute expression mini-grammar.
//!
//! Expressions are parsed once by the engine, rendered to SQL for the server
//! and embedded engines and evaluated in process by the generic engine. Both
//! paths use SQL three-valued logic: a comparison against NULL is unknown, and
//! only rows whose expression is true are kept.

mod parser;

use std::cmp::Ordering;
use std::fmt::{self, Display};

pub use parser::parse;

use crate::backend::sql::{SqlDialect, quote_ident, quote_literal};
use crate::layer::{AttrValue, Feature};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }

    fn sql_symbol(&self) -> &'static str {
        match self {
            CompareOp::NotEq => "<>",
            other => other.symbol(),
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Literal {
    fn to_sql(&self, dialect: SqlDialect) -> String {
        match self {
            Literal::Null => "NULL".to_owned(),
            Literal::Bool(value) => match dialect {
                SqlDialect::Postgis => if *value { "TRUE" } else { "FALSE" }.to_owned(),
                SqlDialect::Sqlite => if *value { "1" } else { "0" }.to_owned(),
            },
            Literal::Int(value) => value.to_string(),
            Literal::Float(value) => format!("{value:?}"),
            Literal::Text(value) => quote_literal(value),
        }
    }
}

impl Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("NULL"),
            Literal::Bool(value) => f.write_str(if *value { "TRUE" } else { "FALSE" }),
            Literal::Int(value) => write!(f, "{value}"),
            Literal::Float(value) => write!(f, "{value:?}"),
            Literal::Text(value) => f.write_str(&quote_literal(value)),
        }
    }
}

/// A parsed attribute expression.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeExpr {
    Compare {
        field: String,
        op: CompareOp,
        value: Literal,
    },
    InList {
        field: String,
        values: Vec<Literal>,
        negated: bool,
    },
    IsNull {
        field: String,
        negated: bool,
    },
    /// Case-insensitive for ASCII on every engine.
    Like {
        field: String,
        pattern: String,
        negated: bool,
    },
    And(Box<AttributeExpr>, Box<AttributeExpr>),
    Or(Box<AttributeExpr>, Box<AttributeExpr>),
    Not(Box<AttributeExpr>),
}

impl AttributeExpr {
    /// Conjunction of two expressions.
    pub fn and(self, other: AttributeExpr) -> AttributeExpr {
        AttributeExpr::And(Box::new(self), Box::new(other))
    }

    /// Renders a boolean SQL expression over columns of `alias`.
    pub fn to_sql(&self, dialect: SqlDialect, alias: &str) -> String {
        let column = |field: &str| format!("{alias}.{}", quote_ident(field));
        match self {
            AttributeExpr::Compare { field, op, value } => format!(
                "{} {} {}",
                column(field),
                op.sql_symbol(),
                value.to_sql(dialect)
            ),
            AttributeExpr::InList {
                field,
                values,
                negated,
            } => {
                let list: Vec<String> = values.iter().map(|v| v.to_sql(dialect)).collect();
                format!(
                    "{} {}IN ({})",
                    column(field),
                    if *negated { "NOT " } else { "" },
                    list.join(", ")
                )
            }
            AttributeExpr::IsNull { field, negated } => format!(
                "{} IS {}NULL",
                column(field),
                if *negated { "NOT " } else { "" }
            ),
            AttributeExpr::Like {
                field,
                pattern,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                match dialect {
                    SqlDialect::Postgis => format!(
                        "CAST({} AS TEXT) {not}ILIKE {}",
                        column(field),
                        quote_literal(pattern)
                    ),
                    SqlDialect::Sqlite => {
                        format!("{} {not}LIKE {}", column(field), quote_literal(pattern))
                    }
                }
            }
            AttributeExpr::And(left, right) => format!(
                "({}) AND ({})",
                left.to_sql(dialect, alias),
                right.to_sql(dialect, alias)
            ),
            AttributeExpr::Or(left, right) => format!(
                "({}) OR ({})",
                left.to_sql(dialect, alias),
                right.to_sql(dialect, alias)
            ),
            AttributeExpr::Not(inner) => format!("NOT ({})", inner.to_sql(dialect, alias)),
        }
    }

    /// Three-valued evaluation; `None` is SQL's unknown.
    pub fn evaluate(&self, feature: &Feature) -> Option<bool> {
        match self {
            AttributeExpr::Compare { field, op, value } => {
                compare(feature.attribute(field), value).map(|ordering| op.holds(ordering))
            }
            AttributeExpr::InList {
                field,
                values,
                negated,
            } => {
                let actual = feature.attribute(field);
                if actual.is_null() {
                    return None;
                }
                let mut unknown = false;
                for value in values {
                    match compare(actual, value) {
                        Some(Ordering::Equal) => return Some(!negated),
                        Some(_) => {}
                        None => unknown = true,
                    }
                }
                if unknown { None } else { Some(*negated) }
            }
            AttributeExpr::IsNull { field, negated } => {
                Some(feature.attribute(field).is_null() != *negated)
            }
            AttributeExpr::Like {
                field,
                pattern,
                negated,
            } => {
                let text = match feature.attribute(field) {
                    AttrValue::Null => return None,
                    AttrValue::Text(text) => text.clone(),
                    AttrValue::Int(value) => value.to_string(),
                    AttrValue::Float(value) => format!("{value:?}"),
                    AttrValue::Bool(value) => i64::from(*value).to_string(),
                };
                Some(like_match(pattern, &text) != *negated)
            }
            AttributeExpr::And(left, right) => match (left.evaluate(feature), right.evaluate(feature)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            AttributeExpr::Or(left, right) => match (left.evaluate(feature), right.evaluate(feature)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            AttributeExpr::Not(inner) => inner.evaluate(feature).map(|value| !value),
        }
    }

    /// Whether the row is kept: only a definite true passes.
    pub fn matches(&self, feature: &Feature) -> bool {
        self.evaluate(feature) == Some(true)
    }
}

impl Display for AttributeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeExpr::Compare { field, op, value } => {
                write!(f, "{} {} {value}", quote_ident(field), op.symbol())
            }
            AttributeExpr::InList {
                field,
                values,
                negated,
            } => {
                let list: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "{} {}IN ({})",
                    quote_ident(field),
                    if *negated { "NOT " } else { "" },
                    list.join(", ")
                )
            }
            AttributeExpr::IsNull { field, negated } => write!(
                f,
                "{} IS {}NULL",
                quote_ident(field),
                if *negated { "NOT " } else { "" }
            ),
            AttributeExpr::Like {
                field,
                pattern,
                negated,
            } => write!(
                f,
                "{} {}LIKE {}",
                quote_ident(field),
                if *negated { "NOT " } else { "" },
                quote_literal(pattern)
            ),
            AttributeExpr::And(left, right) => write!(f, "({left}) AND ({right})"),
            AttributeExpr::Or(left, right) => write!(f, "({left}) OR ({right})"),
            AttributeExpr::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn compare(actual: &AttrValue, literal: &Literal) -> Option<Ordering> {
    match (actual, literal) {
        (AttrValue::Null, _) | (_, Literal::Null) => None,
        (AttrValue::Int(a), Literal::Int(b)) => Some(a.cmp(b)),
        (AttrValue::Int(a), Literal::Float(b)) => (*a as f64).partial_cmp(b),
        (AttrValue::Float(a), Literal::Int(b)) => a.partial_cmp(&(*b as f64)),
        (AttrValue::Float(a), Literal::Float(b)) => a.partial_cmp(b),
        (AttrValue::Text(a), Literal::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        (AttrValue::Bool(a), Literal::Bool(b)) => Some(a.cmp(b)),
        (AttrValue::Bool(a), Literal::Int(b)) => Some(i64::from(*a).cmp(b)),
        (AttrValue::Int(a), Literal::Bool(b)) => Some(a.cmp(&i64::from(*b))),
        _ => None,
    }
}

/// SQL `LIKE` with `%` and `_`, ASCII case-insensitive.
fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();
    let text: Vec<char> = text.chars().map(|c| c.to_ascii_lowercase()).collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}
