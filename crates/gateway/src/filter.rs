//! Post-filters evaluated over engine rows. Cells are typed by the engine's
//! column type before comparison; numbers compare as decimals so wide
//! integers and exact decimals keep their precision.

use std::cmp::Ordering;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use dag_contracts::canonical::scalar_to_string;
use dag_contracts::{Operator, ServiceResponseFilter};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Decimal,
    Instant,
    Boolean,
}

impl ColumnKind {
    /// Maps an engine type name such as `varchar(32)` or `decimal(10,2)`.
    /// Unknown types compare as text.
    pub fn from_engine_type(raw: &str) -> Self {
        let base = raw
            .split(['(', ' '])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match base.as_str() {
            "tinyint" | "smallint" | "int" | "integer" | "bigint" => ColumnKind::Integer,
            "float" | "double" | "real" | "decimal" | "numeric" => ColumnKind::Decimal,
            "time" | "date" | "datetime" | "timestamp" => ColumnKind::Instant,
            "boolean" | "bool" => ColumnKind::Boolean,
            _ => ColumnKind::Text,
        }
    }

    fn supports(self, operator: Operator) -> bool {
        match self {
            ColumnKind::Text => matches!(
                operator,
                Operator::Eq | Operator::Ne | Operator::Like | Operator::In | Operator::NotIn
            ),
            ColumnKind::Integer | ColumnKind::Decimal | ColumnKind::Instant => {
                operator != Operator::Like
            }
            ColumnKind::Boolean => matches!(
                operator,
                Operator::Eq | Operator::Ne | Operator::In | Operator::NotIn
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Number(BigDecimal),
    Instant(NaiveDateTime),
    Boolean(bool),
}

impl Cell {
    /// Types an engine value. A value that does not fit the column type is
    /// treated as NULL.
    pub fn from_value(value: &Value, kind: ColumnKind) -> Self {
        if value.is_null() {
            return Cell::Null;
        }
        Self::parse(&scalar_to_string(value), kind).unwrap_or(Cell::Null)
    }

    fn parse(text: &str, kind: ColumnKind) -> Option<Self> {
        match kind {
            ColumnKind::Text => Some(Cell::Text(text.to_string())),
            ColumnKind::Integer | ColumnKind::Decimal => {
                BigDecimal::from_str(text.trim()).ok().map(Cell::Number)
            }
            ColumnKind::Instant => parse_instant(text.trim()).map(Cell::Instant),
            ColumnKind::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(Cell::Boolean(true)),
                "false" | "0" => Some(Cell::Boolean(false)),
                _ => None,
            },
        }
    }

    fn compare(&self, other: &Cell) -> Option<Ordering> {
        match (self, other) {
            (Cell::Text(a), Cell::Text(b)) => Some(a.cmp(b)),
            (Cell::Number(a), Cell::Number(b)) => Some(a.cmp(b)),
            (Cell::Instant(a), Cell::Instant(b)) => Some(a.cmp(b)),
            (Cell::Boolean(a), Cell::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

fn parse_instant(text: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date.and_time(NaiveTime::MIN));
    }
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .ok()
        .map(|time| NaiveDate::default().and_time(time))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError(pub String);

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "response filter: {}", self.0)
    }
}

impl std::error::Error for FilterError {}

/// A response filter bound to a column position with typed operands.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    column: usize,
    kind: ColumnKind,
    operator: Operator,
    operands: Vec<Cell>,
    pattern: String,
}

/// Binds each filter to the column of the same name. Filters naming a column
/// the result does not have are ignored.
pub fn compile(
    filters: &[ServiceResponseFilter],
    columns: &[(String, ColumnKind)],
) -> Result<Vec<CompiledFilter>, FilterError> {
    let mut compiled = Vec::new();

    for filter in filters {
        let Some(column) = columns.iter().position(|(name, _)| *name == filter.param) else {
            continue;
        };
        let kind = columns[column].1;

        if !kind.supports(filter.operator) {
            return Err(FilterError(format!(
                "operator `{}` is not supported on column `{}`",
                filter.operator.as_str(),
                filter.param
            )));
        }

        let raw: Vec<&str> = if filter.operator.is_list() {
            filter.value.split(',').map(str::trim).collect()
        } else {
            vec![filter.value.as_str()]
        };
        let operands = raw
            .iter()
            .map(|text| {
                Cell::parse(text, kind).ok_or_else(|| {
                    FilterError(format!(
                        "value `{}` does not fit column `{}`",
                        text, filter.param
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        compiled.push(CompiledFilter {
            column,
            kind,
            operator: filter.operator,
            operands,
            pattern: filter.value.clone(),
        });
    }

    Ok(compiled)
}

impl CompiledFilter {
    pub fn matches(&self, row: &[Value]) -> bool {
        let cell = row
            .get(self.column)
            .map(|value| Cell::from_value(value, self.kind))
            .unwrap_or(Cell::Null);

        if cell == Cell::Null {
            return matches!(self.operator, Operator::Ne | Operator::NotIn);
        }

        let ordering = self.operands.first().and_then(|operand| cell.compare(operand));
        match self.operator {
            Operator::Eq => ordering == Some(Ordering::Equal),
            Operator::Ne => ordering != Some(Ordering::Equal),
            Operator::Gt => ordering == Some(Ordering::Greater),
            Operator::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            Operator::Lt => ordering == Some(Ordering::Less),
            Operator::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Operator::Like => match &cell {
                Cell::Text(text) => text.contains(self.pattern.as_str()),
                _ => false,
            },
            Operator::In => self.contains(&cell),
            Operator::NotIn => !self.contains(&cell),
        }
    }

    fn contains(&self, cell: &Cell) -> bool {
        self.operands
            .iter()
            .any(|operand| cell.compare(operand) == Some(Ordering::Equal))
    }
}

/// Keeps the rows that pass every filter.
pub fn retain_rows(rows: &mut Vec<Vec<Value>>, filters: &[CompiledFilter]) {
    if filters.is_empty() {
        return;
    }
    rows.retain(|row| filters.iter().all(|f| f.matches(row)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(param: &str, operator: Operator, value: &str) -> ServiceResponseFilter {
        ServiceResponseFilter {
            param: param.to_string(),
            operator,
            value: value.to_string(),
        }
    }

    fn columns() -> Vec<(String, ColumnKind)> {
        vec![
            ("name".to_string(), ColumnKind::from_engine_type("varchar(32)")),
            ("big".to_string(), ColumnKind::from_engine_type("bigint")),
            ("price".to_string(), ColumnKind::from_engine_type("decimal(20,2)")),
            ("at".to_string(), ColumnKind::from_engine_type("timestamp")),
            ("ok".to_string(), ColumnKind::from_engine_type("boolean")),
        ]
    }

    fn rows() -> Vec<Vec<Value>> {
        serde_json::from_str(
            r#"[
                ["alice", 9007199254740993, 10.10, "2023-08-20 10:00:00", true],
                ["bob",   9007199254740992, 10.1000000000000000001, "2023-08-21", false],
                [null,    1, null, null, null]
            ]"#,
        )
        .expect("rows should parse")
    }

    fn names(rows: &[Vec<Value>]) -> Vec<String> {
        rows.iter().map(|r| scalar_to_string(&r[0])).collect()
    }

    fn run(filters: &[ServiceResponseFilter]) -> Vec<String> {
        let compiled = compile(filters, &columns()).expect("filters should compile");
        let mut rows = rows();
        retain_rows(&mut rows, &compiled);
        names(&rows)
    }

    #[test]
    fn engine_types_map_to_kinds() {
        assert_eq!(ColumnKind::from_engine_type("CHAR"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_engine_type("json"), ColumnKind::Text);
        assert_eq!(ColumnKind::from_engine_type("smallint"), ColumnKind::Integer);
        assert_eq!(ColumnKind::from_engine_type("double"), ColumnKind::Decimal);
        assert_eq!(ColumnKind::from_engine_type("datetime"), ColumnKind::Instant);
        assert_eq!(ColumnKind::from_engine_type("time"), ColumnKind::Instant);
        assert_eq!(ColumnKind::from_engine_type("boolean"), ColumnKind::Boolean);
    }

    #[test]
    fn wide_integers_compare_exactly() {
        assert_eq!(run(&[filter("big", Operator::Eq, "9007199254740993")]), ["alice"]);
        assert_eq!(run(&[filter("big", Operator::Gt, "9007199254740992")]), ["alice"]);
    }

    #[test]
    fn decimals_compare_without_float_rounding() {
        assert_eq!(run(&[filter("price", Operator::Eq, "10.1")]), ["alice"]);
        assert_eq!(run(&[filter("price", Operator::Gt, "10.1")]), ["bob"]);
    }

    #[test]
    fn text_like_is_substring_and_lists_split() {
        assert_eq!(run(&[filter("name", Operator::Like, "li")]), ["alice"]);
        assert_eq!(run(&[filter("name", Operator::In, "bob, carol")]), ["bob"]);
        assert_eq!(run(&[filter("name", Operator::NotIn, "bob")]), ["alice", ""]);
    }

    #[test]
    fn instants_accept_date_only_values() {
        assert_eq!(run(&[filter("at", Operator::Ge, "2023-08-21")]), ["bob"]);
        assert_eq!(run(&[filter("at", Operator::Lt, "2023-08-21 00:00:00")]), ["alice"]);
    }

    #[test]
    fn nulls_only_satisfy_negative_operators() {
        assert_eq!(run(&[filter("ok", Operator::Eq, "true")]), ["alice"]);
        assert_eq!(run(&[filter("ok", Operator::Ne, "true")]), ["bob", ""]);
    }

    #[test]
    fn all_filters_must_pass() {
        assert_eq!(
            run(&[
                filter("ok", Operator::In, "true,false"),
                filter("name", Operator::Ne, "alice"),
            ]),
            ["bob"]
        );
    }

    #[test]
    fn unsupported_operator_or_value_fails() {
        assert!(compile(&[filter("big", Operator::Like, "1")], &columns()).is_err());
        assert!(compile(&[filter("ok", Operator::Gt, "true")], &columns()).is_err());
        assert!(compile(&[filter("big", Operator::Eq, "abc")], &columns()).is_err());
    }

    #[test]
    fn unknown_columns_are_ignored() {
        assert_eq!(run(&[filter("missing", Operator::Eq, "x")]).len(), 3);
    }
}
