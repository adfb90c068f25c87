//! Lowers a SQL boolean expression into [`AttributeExpr`].
//!
//! The text is parsed with the generic SQL dialect and only the node shapes
//! the engines can all evaluate are accepted: comparisons between a field and
//! a literal, `IN` lists, `IS [NOT] NULL`, `[NOT] LIKE` and boolean
//! connectives. Everything else is an [`FilterError::InvalidExpression`].

use common_exception::{FilterError, Result};
use sqlparser::ast::{BinaryOperator, Expr as SqlExpr, UnaryOperator, Value, ValueWithSpan};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use super::{AttributeExpr, CompareOp, Literal};

fn invalid(message: impl Into<String>) -> FilterError {
    FilterError::InvalidExpression(message.into())
}

/// Parses an attribute expression.
pub fn parse(input: &str) -> Result<AttributeExpr> {
    if input.trim().is_empty() {
        return Err(invalid("empty attribute expression"));
    }
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(input)
        .map_err(|e| invalid(e.to_string()))?;
    let expr = parser.parse_expr().map_err(|e| invalid(e.to_string()))?;
    parser
        .expect_token(&Token::EOF)
        .map_err(|e| invalid(e.to_string()))?;
    translate_condition(&expr)
}

fn translate_condition(expr: &SqlExpr) -> Result<AttributeExpr> {
    match expr {
        SqlExpr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Ok(AttributeExpr::And(
                Box::new(translate_condition(left)?),
                Box::new(translate_condition(right)?),
            )),
            BinaryOperator::Or => Ok(AttributeExpr::Or(
                Box::new(translate_condition(left)?),
                Box::new(translate_condition(right)?),
            )),
            op => Ok(AttributeExpr::Compare {
                field: field_name(left)?,
                op: compare_op(op)?,
                value: literal(right)?,
            }),
        },
        SqlExpr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(AttributeExpr::Not(Box::new(translate_condition(expr)?))),
        SqlExpr::Nested(inner) => translate_condition(inner),
        SqlExpr::IsNull(inner) => Ok(AttributeExpr::IsNull {
            field: field_name(inner)?,
            negated: false,
        }),
        SqlExpr::IsNotNull(inner) => Ok(AttributeExpr::IsNull {
            field: field_name(inner)?,
            negated: true,
        }),
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => Ok(AttributeExpr::InList {
            field: field_name(expr)?,
            values: list.iter().map(literal).collect::<Result<_>>()?,
            negated: *negated,
        }),
        SqlExpr::Like {
            negated,
            expr,
            pattern,
            escape_char,
            ..
        } => {
            if escape_char.is_some() {
                return Err(invalid("LIKE ... ESCAPE is not supported"));
            }
            let pattern = match pattern.as_ref() {
                SqlExpr::Value(ValueWithSpan {
                    value: Value::SingleQuotedString(text),
                    ..
                }) => text.clone(),
                _ => return Err(invalid("LIKE expects a quoted pattern")),
            };
            Ok(AttributeExpr::Like {
                field: field_name(expr)?,
                pattern,
                negated: *negated,
            })
        }
        other => Err(invalid(format!("unsupported expression: {other}"))),
    }
}

fn compare_op(op: &BinaryOperator) -> Result<CompareOp> {
    Ok(match op {
        BinaryOperator::Eq => CompareOp::Eq,
        BinaryOperator::NotEq => CompareOp::NotEq,
        BinaryOperator::Lt => CompareOp::Lt,
        BinaryOperator::LtEq => CompareOp::LtEq,
        BinaryOperator::Gt => CompareOp::Gt,
        BinaryOperator::GtEq => CompareOp::GtEq,
        other => return Err(invalid(format!("unsupported operator: {other}"))),
    })
}

fn field_name(expr: &SqlExpr) -> Result<String> {
    match expr {
        SqlExpr::Identifier(ident) => Ok(ident.value.clone()),
        SqlExpr::Nested(inner) => field_name(inner),
        other => Err(invalid(format!("expected a field name, found {other}"))),
    }
}

fn literal(expr: &SqlExpr) -> Result<Literal> {
    match expr {
        SqlExpr::Value(value) => literal_from_value(value),
        SqlExpr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Literal::Int(value) => Ok(Literal::Int(-value)),
            Literal::Float(value) => Ok(Literal::Float(-value)),
            other => Err(invalid(format!("cannot negate {other}"))),
        },
        SqlExpr::UnaryOp {
            op: UnaryOperator::Plus,
            expr,
        } => literal(expr),
        SqlExpr::Nested(inner) => literal(inner),
        other => Err(invalid(format!("expected a literal, found {other}"))),
    }
}

fn literal_from_value(value: &ValueWithSpan) -> Result<Literal> {
    match &value.value {
        Value::Number(text, _) => {
            if let Ok(parsed) = text.parse::<i64>() {
                return Ok(Literal::Int(parsed));
            }
            text.parse::<f64>()
                .map(Literal::Float)
                .map_err(|_| invalid(format!("invalid number '{text}'")))
        }
        Value::SingleQuotedString(text) => Ok(Literal::Text(text.clone())),
        Value::Boolean(flag) => Ok(Literal::Bool(*flag)),
        Value::Null => Ok(Literal::Null),
        other => Err(invalid(format!("unsupported literal: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_binds_tighter_than_or() {
        let expr = parse("a = 1 OR b = 2 AND c = 3").unwrap();
        let AttributeExpr::Or(_, right) = expr else {
            panic!("expected OR at the root");
        };
        assert!(matches!(*right, AttributeExpr::And(_, _)));
    }

    #[test]
    fn parses_every_form() {
        let expr = parse(
            r#"NOT ("road type" IN ('a', 'b''c') AND speed >= -1.5e1) OR name IS NOT NULL OR name NOT LIKE 'A%' OR n <> 3"#,
        )
        .unwrap();
        assert_eq!(
            expr.to_string(),
            r#"(((NOT (("road type" IN ('a', 'b''c')) AND ("speed" >= -15.0))) OR ("name" IS NOT NULL)) OR ("name" NOT LIKE 'A%')) OR ("n" != 3)"#
        );
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let expr = parse("flag = true and kind in (1, 2)").unwrap();
        assert!(matches!(expr, AttributeExpr::And(_, _)));
    }

    #[test]
    fn bang_equals_is_not_equal() {
        let expr = parse("lanes != 2").unwrap();
        assert!(matches!(
            expr,
            AttributeExpr::Compare {
                op: CompareOp::NotEq,
                ..
            }
        ));
    }

    #[test]
    fn rejects_outside_grammar() {
        for input in [
            "",
            "   ",
            "a = ",
            "a = 1 AND",
            "(a = 1",
            "a LIKE 3",
            "1 = a",
            "a = b",
            "a = 1; DROP TABLE roads",
            "a = 'open",
            "speed >>> 3",
            "a BETWEEN 1 AND 2",
            "upper(name) = 'X'",
            "a + 1 = 2",
            "name LIKE 'a!%' ESCAPE '!'",
        ] {
            let err = parse(input).unwrap_err();
            assert_eq!(
                err.kind(),
                common_exception::ErrorKind::InvalidExpression,
                "{input}"
            );
        }
    }
}
