use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::model::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }

    /// Compare `actual` against `expected`. Null on either side never matches;
    /// incompatible types are an error.
    pub fn check(self, actual: &Scalar, expected: &Scalar) -> Result<bool, String> {
        if actual.is_null() || expected.is_null() {
            return Ok(false);
        }
        let ordering = compare_scalars(actual, expected)?;
        Ok(match self {
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Gte => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Lte => ordering != Ordering::Greater,
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "gt" => Ok(CompareOp::Gt),
            ">=" | "gte" => Ok(CompareOp::Gte),
            "<" | "lt" => Ok(CompareOp::Lt),
            "<=" | "lte" => Ok(CompareOp::Lte),
            "==" | "=" | "eq" => Ok(CompareOp::Eq),
            "!=" | "ne" => Ok(CompareOp::Ne),
            other => Err(format!("unknown comparison operator `{other}`")),
        }
    }
}

impl TryFrom<String> for CompareOp {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

fn compare_scalars(actual: &Scalar, expected: &Scalar) -> Result<Ordering, String> {
    match (actual, expected) {
        (Scalar::Text(a), Scalar::Text(b)) => Ok(a.cmp(b)),
        (Scalar::Bool(a), Scalar::Bool(b)) => Ok(a.cmp(b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| "cannot compare NaN".to_string()),
            _ => Err(format!("cannot compare {} with {}", type_name(a), type_name(b))),
        },
    }
}

fn type_name(value: &Scalar) -> &'static str {
    match value {
        Scalar::Null => "null",
        Scalar::Bool(_) => "bool",
        Scalar::Int(_) => "int",
        Scalar::Float(_) => "float",
        Scalar::Text(_) => "text",
    }
}

/// Rule predicate, interpreted against one record's attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        field: String,
        op: CompareOp,
        value: Scalar,
    },
    Exists {
        field: String,
    },
    All(Vec<Expr>),
    Any(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// `lookup` resolves a field name to its value (`Null` when absent).
    pub fn eval<F>(&self, lookup: &F) -> Result<bool, String>
    where
        F: Fn(&str) -> Scalar,
    {
        match self {
            Expr::Compare { field, op, value } => op
                .check(&lookup(field), value)
                .map_err(|reason| format!("{field} {op} {value}: {reason}")),
            Expr::Exists { field } => Ok(!lookup(field).is_null()),
            Expr::All(children) => {
                for child in children {
                    if !child.eval(lookup)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Any(children) => {
                for child in children {
                    if child.eval(lookup)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Not(inner) => inner.eval(lookup).map(|matched| !matched),
        }
    }

    /// Field of the first comparison, used as the default for severity tiers.
    pub fn primary_field(&self) -> Option<&str> {
        match self {
            Expr::Compare { field, .. } => Some(field),
            Expr::Exists { .. } => None,
            Expr::All(children) | Expr::Any(children) => {
                children.iter().find_map(Expr::primary_field)
            }
            Expr::Not(_) => None,
        }
    }
}

/// YAML shape of a comparison: `{field, op, value}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompareDoc {
    pub field: String,
    pub op: CompareOp,
    pub value: Scalar,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldRef {
    Name(String),
    Map { field: String },
}

impl FieldRef {
    fn into_name(self) -> String {
        match self {
            FieldRef::Name(field) | FieldRef::Map { field } => field,
        }
    }
}

/// YAML shape of an expression node.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExprDoc {
    Compare { compare: CompareDoc },
    Exists { exists: FieldRef },
    All { all: Vec<ExprDoc> },
    Any { any: Vec<ExprDoc> },
    Not { not: Box<ExprDoc> },
    Bare(CompareDoc),
}

impl TryFrom<ExprDoc> for Expr {
    type Error = String;

    fn try_from(doc: ExprDoc) -> Result<Self, Self::Error> {
        Ok(match doc {
            ExprDoc::Compare { compare } | ExprDoc::Bare(compare) => compare.try_into()?,
            ExprDoc::Exists { exists } => {
                let field = exists.into_name();
                if field.trim().is_empty() {
                    return Err("`exists` needs a field name".into());
                }
                Expr::Exists { field }
            }
            ExprDoc::All { all } => Expr::All(convert_children("all", all)?),
            ExprDoc::Any { any } => Expr::Any(convert_children("any", any)?),
            ExprDoc::Not { not } => Expr::Not(Box::new(Expr::try_from(*not)?)),
        })
    }
}

impl TryFrom<CompareDoc> for Expr {
    type Error = String;

    fn try_from(doc: CompareDoc) -> Result<Self, Self::Error> {
        if doc.field.trim().is_empty() {
            return Err("comparison needs a field name".into());
        }
        if doc.value.is_null() {
            return Err(format!("comparison on `{}` has no value", doc.field));
        }
        Ok(Expr::Compare {
            field: doc.field,
            op: doc.op,
            value: doc.value,
        })
    }
}

fn convert_children(name: &str, docs: Vec<ExprDoc>) -> Result<Vec<Expr>, String> {
    if docs.is_empty() {
        return Err(format!("`{name}` needs at least one child expression"));
    }
    docs.into_iter().map(Expr::try_from).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(values: &[(&str, Scalar)]) -> impl Fn(&str) -> Scalar + use<> {
        let map: HashMap<String, Scalar> = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |field: &str| map.get(field).cloned().unwrap_or_default()
    }

    fn parse(yaml: &str) -> Result<Expr, String> {
        let doc: ExprDoc = serde_yaml::from_str(yaml).map_err(|err| err.to_string())?;
        Expr::try_from(doc)
    }

    #[test]
    fn null_never_matches_any_operator() {
        for op in ["<", "<=", ">", ">=", "==", "!="] {
            let op: CompareOp = op.parse().expect("op");
            assert_eq!(op.check(&Scalar::Null, &Scalar::Int(1)), Ok(false));
        }
    }

    #[test]
    fn numeric_comparison_mixes_int_and_float() {
        assert_eq!(CompareOp::Gt.check(&Scalar::Int(35_000), &Scalar::Float(30_000.0)), Ok(true));
        assert_eq!(CompareOp::Lte.check(&Scalar::Float(2.5), &Scalar::Int(2)), Ok(false));
        assert_eq!(CompareOp::Eq.check(&Scalar::from("a"), &Scalar::from("a")), Ok(true));
    }

    #[test]
    fn text_against_number_is_an_error() {
        assert!(CompareOp::Gt.check(&Scalar::from("abc"), &Scalar::Int(10)).is_err());
    }

    #[test]
    fn nested_expressions_parse_and_evaluate() {
        let expr = parse(
            r#"
all:
  - compare: {field: duration_seconds, op: ">=", value: 300}
  - not:
      exists: is_blocked
  - any:
      - {field: login_name, op: "==", value: app}
      - {field: login_name, op: "==", value: batch}
"#,
        )
        .expect("expr");

        let matching = lookup(&[
            ("duration_seconds", Scalar::Float(301.0)),
            ("login_name", Scalar::from("batch")),
        ]);
        assert_eq!(expr.eval(&matching), Ok(true));

        let blocked = lookup(&[
            ("duration_seconds", Scalar::Float(301.0)),
            ("login_name", Scalar::from("batch")),
            ("is_blocked", Scalar::Bool(true)),
        ]);
        assert_eq!(expr.eval(&blocked), Ok(false));
        assert_eq!(expr.primary_field(), Some("duration_seconds"));
    }

    #[test]
    fn unknown_operator_and_empty_groups_are_rejected() {
        assert!(parse("{field: x, op: '~', value: 1}").is_err());
        assert!(parse("all: []").is_err());
        assert!(parse("{field: x, op: '>'}").is_err());
    }
}
