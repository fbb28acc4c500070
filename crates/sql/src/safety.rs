use std::ops::ControlFlow;

use sqlparser::ast::{
    BinaryOperator, DataType as SqlDataType, Expr, Ident, ObjectName, ObjectNamePart, Query,
    SelectItem, SetExpr, Statement, Value, Visit, Visitor, visit_expressions_mut,
    visit_relations_mut,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};

use crate::SqlError;
use crate::params::{TIMESTAMP_MARKER, is_timestamp_literal};

const PLACEHOLDER_OPEN: &str = "${";

/// Runs the read-only gate over `sql` and returns the parsed statement.
///
/// Accepts exactly one SELECT (set operations and CTEs allowed) with an
/// explicit projection, no comments, no `SELECT INTO` and no locking clause.
/// The raw-text checks here only suit placeholder templates; statements
/// carrying substituted values go through [`parse_read_only`].
pub fn check(sql: &str) -> Result<Statement, SqlError> {
    let trimmed = sql.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with("/*") {
        return Err(SqlError::unsafe_sql("statement starts with a comment"));
    }

    let lowered = sql.to_ascii_lowercase();
    if lowered.contains("select*") || lowered.contains("select *") {
        return Err(SqlError::unsafe_sql("wildcard projection is not allowed"));
    }

    parse_read_only(sql)
}

/// Token and AST level gate. Quoted literals are opaque here, so values
/// containing `select *` or `--` pass.
pub fn parse_read_only(sql: &str) -> Result<Statement, SqlError> {
    reject_comments(sql)?;

    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|err| SqlError::unsafe_sql(format!("parse failed: {}", err)))?;
    if statements.len() != 1 {
        return Err(SqlError::unsafe_sql("exactly one statement is required"));
    }
    let statement = statements.remove(0);
    let Statement::Query(query) = &statement else {
        return Err(SqlError::unsafe_sql("only SELECT statements are allowed"));
    };
    check_query_tree(query)?;

    Ok(statement)
}

fn reject_comments(sql: &str) -> Result<(), SqlError> {
    let tokens = Tokenizer::new(&GenericDialect {}, sql)
        .tokenize()
        .map_err(|err| SqlError::unsafe_sql(format!("tokenize failed: {}", err)))?;

    let has_comment = tokens.iter().any(|token| {
        matches!(
            token,
            Token::Whitespace(Whitespace::SingleLineComment { .. })
                | Token::Whitespace(Whitespace::MultiLineComment(_))
        )
    });
    if has_comment {
        return Err(SqlError::unsafe_sql("comments are not allowed"));
    }
    Ok(())
}

struct QueryGate {
    reason: Option<String>,
}

impl Visitor for QueryGate {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if !query.locks.is_empty() {
            self.reason = Some("locking clauses are not allowed".to_string());
            return ControlFlow::Break(());
        }
        if let Err(reason) = check_set_expr(&query.body) {
            self.reason = Some(reason);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

fn check_query_tree(query: &Query) -> Result<(), SqlError> {
    let mut gate = QueryGate { reason: None };
    if query.visit(&mut gate).is_break() {
        let reason = gate
            .reason
            .unwrap_or_else(|| "query rejected".to_string());
        return Err(SqlError::unsafe_sql(reason));
    }
    Ok(())
}

// Nested `SetExpr::Query` bodies are reached by the visitor on their own.
fn check_set_expr(body: &SetExpr) -> Result<(), String> {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                return Err("SELECT INTO is not allowed".to_string());
            }
            let wildcard = select.projection.iter().any(|item| {
                matches!(
                    item,
                    SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..)
                )
            });
            if wildcard {
                return Err("wildcard projection is not allowed".to_string());
            }
            Ok(())
        }
        SetExpr::Query(_) => Ok(()),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left)?;
            check_set_expr(right)
        }
        _ => Err("only SELECT statements are allowed".to_string()),
    }
}

/// Parses a stored sub-service row filter. The clause must be a single
/// boolean expression: no comments, no statement separators.
pub fn row_filter_expr(clause: &str) -> Result<Expr, SqlError> {
    let clause = clause.trim();
    if clause.is_empty() {
        return Err(SqlError::unsafe_sql("row filter is empty"));
    }
    reject_comments(clause)?;

    let tokens = Tokenizer::new(&GenericDialect {}, clause)
        .tokenize()
        .map_err(|err| SqlError::unsafe_sql(format!("tokenize failed: {}", err)))?;
    if tokens.iter().any(|t| matches!(t, Token::SemiColon)) {
        return Err(SqlError::unsafe_sql(
            "row filter must not contain a statement separator",
        ));
    }

    let wrapped = format!("SELECT 1 WHERE {}", clause);
    let mut statements = Parser::parse_sql(&GenericDialect {}, &wrapped)
        .map_err(|err| SqlError::unsafe_sql(format!("row filter parse failed: {}", err)))?;
    if statements.len() != 1 {
        return Err(SqlError::unsafe_sql("row filter must be one expression"));
    }
    let Statement::Query(query) = statements.remove(0) else {
        return Err(SqlError::unsafe_sql("row filter must be one expression"));
    };
    if query.order_by.is_some() || query.limit_clause.is_some() {
        return Err(SqlError::unsafe_sql("row filter must be one expression"));
    }
    match *query.body {
        SetExpr::Select(select) => select
            .selection
            .ok_or_else(|| SqlError::unsafe_sql("row filter must be one expression")),
        _ => Err(SqlError::unsafe_sql("row filter must be one expression")),
    }
}

/// Joins the given row filters into one parenthesised disjunction, skipping
/// clauses that do not validate. Returns the joined clause and the rejects.
pub fn join_row_filters<'c>(
    clauses: impl IntoIterator<Item = &'c str>,
) -> (Option<String>, Vec<(&'c str, SqlError)>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for clause in clauses {
        match row_filter_expr(clause) {
            Ok(_) => accepted.push(format!("({})", clause.trim())),
            Err(err) => rejected.push((clause, err)),
        }
    }
    let joined = (!accepted.is_empty()).then(|| accepted.join(" OR "));
    (joined, rejected)
}

/// Gates `sql`, ANDs the optional row filter into the outermost WHERE and
/// rewrites every table reference to `"catalog"."schema"."table"`. Names
/// bound by a WITH clause are left alone. Marked timestamp strings become
/// `timestamp '...'` literals.
pub fn qualify(
    sql: &str,
    catalog: &str,
    schema: &str,
    row_filter: Option<&str>,
) -> Result<String, SqlError> {
    let mut statement = parse_read_only(sql)?;

    if let Some(clause) = row_filter.map(str::trim).filter(|c| !c.is_empty()) {
        let filter = row_filter_expr(clause)?;
        if let Statement::Query(query) = &mut statement {
            splice_filter(&mut query.body, &filter);
        }
    }

    let mut ctes = CteNames::default();
    let _ = statement.visit(&mut ctes);

    let _ = visit_relations_mut(&mut statement, |name: &mut ObjectName| {
        let parts = &name.0;
        let Some(table) = parts.last().and_then(|p| p.as_ident()).cloned() else {
            return ControlFlow::<()>::Continue(());
        };
        if parts.len() == 1 && ctes.contains(&table.value) {
            return ControlFlow::Continue(());
        }
        *name = ObjectName(vec![
            ObjectNamePart::Identifier(Ident::with_quote('"', catalog)),
            ObjectNamePart::Identifier(Ident::with_quote('"', schema)),
            ObjectNamePart::Identifier(Ident::with_quote('"', table.value)),
        ]);
        ControlFlow::Continue(())
    });

    type_timestamp_literals(&mut statement);

    Ok(normalize_backquotes(&statement.to_string()))
}

/// Turns `'@TIMESTAMP@<ts>'` string nodes into typed timestamp literals.
/// Other strings are left as they are, whatever they contain.
fn type_timestamp_literals(statement: &mut Statement) {
    let _ = visit_expressions_mut(statement, |expr: &mut Expr| {
        let Expr::Value(node) = expr else {
            return ControlFlow::<()>::Continue(());
        };
        let Value::SingleQuotedString(text) = &node.value else {
            return ControlFlow::Continue(());
        };
        let Some(stamp) = text
            .strip_prefix(TIMESTAMP_MARKER)
            .filter(|rest| is_timestamp_literal(rest))
        else {
            return ControlFlow::Continue(());
        };
        *expr = Expr::TypedString {
            data_type: SqlDataType::Custom(
                ObjectName(vec![ObjectNamePart::Identifier(Ident::new("timestamp"))]),
                Vec::new(),
            ),
            value: Value::SingleQuotedString(stamp.to_string()),
        };
        ControlFlow::Continue(())
    });
}

fn splice_filter(body: &mut SetExpr, filter: &Expr) {
    match body {
        SetExpr::Select(select) => {
            let added = Expr::Nested(Box::new(filter.clone()));
            select.selection = Some(match select.selection.take() {
                Some(existing) => Expr::BinaryOp {
                    left: Box::new(Expr::Nested(Box::new(existing))),
                    op: BinaryOperator::And,
                    right: Box::new(added),
                },
                None => added,
            });
        }
        SetExpr::Query(query) => splice_filter(&mut query.body, filter),
        SetExpr::SetOperation { left, right, .. } => {
            splice_filter(left, filter);
            splice_filter(right, filter);
        }
        _ => {}
    }
}

#[derive(Default)]
struct CteNames {
    names: Vec<String>,
}

impl CteNames {
    fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

impl Visitor for CteNames {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            self.names
                .extend(with.cte_tables.iter().map(|cte| cte.alias.name.value.clone()));
        }
        ControlFlow::Continue(())
    }
}

/// Rewrites back-quoted identifiers to double quotes. Text inside single
/// quoted literals is untouched.
pub fn normalize_backquotes(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_string = !in_string;
                out.push(ch);
            }
            '`' if !in_string => out.push('"'),
            _ => out.push(ch),
        }
    }
    out
}

/// Replaces each `${name}` with the text returned by `render`. Unterminated
/// placeholders are copied through.
pub fn substitute<E>(
    template: &str,
    mut render: impl FnMut(&str) -> Result<String, E>,
) -> Result<String, E> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        let after = &rest[start + PLACEHOLDER_OPEN.len()..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push_str(&render(after[..end].trim())?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(sql: &str) -> bool {
        matches!(check(sql), Err(SqlError::Unsafe(_)))
    }

    #[test]
    fn gate_rejects_writes_and_wildcards() {
        assert!(rejected("DELETE FROM t"));
        assert!(rejected("UPDATE t SET a = 1"));
        assert!(rejected("INSERT INTO t (a) VALUES (1)"));
        assert!(rejected("select * from t"));
        assert!(rejected("SELECT t.* FROM t"));
        assert!(rejected("SELECT a FROM t UNION SELECT * FROM u"));
        assert!(rejected("SELECT a FROM (SELECT * FROM t) AS x"));
    }

    #[test]
    fn gate_rejects_comments_and_multiple_statements() {
        assert!(rejected("# hi\nSELECT a FROM t"));
        assert!(rejected("/* hi */ SELECT a FROM t"));
        assert!(rejected("SELECT a FROM t -- trailing"));
        assert!(rejected("SELECT a FROM t; SELECT b FROM u"));
        assert!(rejected("SELECT a FROM"));
    }

    #[test]
    fn gate_accepts_plain_selects() {
        assert!(check("SELECT a, b FROM t WHERE a > 1").is_ok());
        assert!(check("SELECT COUNT(*) FROM t").is_ok());
        assert!(check("WITH x AS (SELECT a FROM t) SELECT a FROM x").is_ok());
        assert!(check("SELECT a FROM t WHERE b = ?").is_ok());
    }

    #[test]
    fn qualify_rewrites_every_relation() {
        let sql = qualify(
            "SELECT a.x, b.y FROM t1 a JOIN db.t2 b ON a.id = b.id",
            "cat",
            "sch",
            None,
        )
        .expect("qualify should succeed");
        assert!(sql.contains(r#""cat"."sch"."t1""#), "{sql}");
        assert!(sql.contains(r#""cat"."sch"."t2""#), "{sql}");
        assert!(!sql.contains("db."), "{sql}");
    }

    #[test]
    fn qualify_leaves_cte_names_alone() {
        let sql = qualify(
            "WITH recent AS (SELECT id FROM orders) SELECT id FROM recent",
            "cat",
            "sch",
            None,
        )
        .expect("qualify should succeed");
        assert!(sql.contains(r#"FROM "cat"."sch"."orders""#), "{sql}");
        assert!(sql.ends_with("FROM recent"), "{sql}");
    }

    #[test]
    fn qualify_splices_row_filter_with_precedence() {
        let sql = qualify(
            "SELECT a FROM t WHERE a = 1 OR b = 2",
            "cat",
            "sch",
            Some("(region = 'east') OR (region = 'west')"),
        )
        .expect("qualify should succeed");
        assert_eq!(
            sql,
            r#"SELECT a FROM "cat"."sch"."t" WHERE (a = 1 OR b = 2) AND ((region = 'east') OR (region = 'west'))"#
        );

        let sql = qualify("SELECT a FROM t ORDER BY a", "c", "s", Some("a > 0"))
            .expect("qualify should succeed");
        assert_eq!(sql, r#"SELECT a FROM "c"."s"."t" WHERE (a > 0) ORDER BY a"#);
    }

    #[test]
    fn row_filters_are_validated() {
        assert!(row_filter_expr("dept = 'x'").is_ok());
        assert!(row_filter_expr("").is_err());
        assert!(row_filter_expr("a = 1; DROP TABLE t").is_err());
        assert!(row_filter_expr("a = 1 -- x").is_err());
        assert!(row_filter_expr("a = 1 ORDER BY a").is_err());

        let (joined, rejected) = join_row_filters(["a = 1", "b = ;", "c = 3"]);
        assert_eq!(joined.as_deref(), Some("(a = 1) OR (c = 3)"));
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn backquotes_become_double_quotes_outside_strings() {
        assert_eq!(
            normalize_backquotes("SELECT `a` FROM t WHERE b = '`x`'"),
            r#"SELECT "a" FROM t WHERE b = '`x`'"#
        );
        assert_eq!(normalize_backquotes("'it''s' `c`"), r#"'it''s' "c""#);
    }

    #[test]
    fn placeholder_substitution() {
        let out = substitute::<()>("x = ${a} AND y = ${ b }", |name| Ok(format!("<{name}>")))
            .expect("substitute should succeed");
        assert_eq!(out, "x = <a> AND y = <b>");

        let out = substitute::<()>("d = '${'", |_| Ok("?".to_string()))
            .expect("substitute should succeed");
        assert_eq!(out, "d = '${'");
    }

    #[test]
    fn quoted_values_are_not_read_as_sql() {
        let sql = qualify(
            "SELECT a FROM t WHERE n = 'select * x' AND m = '-- not a comment' AND k = '/* x */'",
            "cat",
            "sch",
            None,
        )
        .expect("quoted text should pass");
        assert!(sql.contains("'select * x'"), "{sql}");
        assert!(sql.contains("'-- not a comment'"), "{sql}");

        assert!(parse_read_only("SELECT * FROM t").is_err());
        assert!(parse_read_only("SELECT a FROM t -- x").is_err());
    }

    #[test]
    fn only_marked_strings_become_timestamps() {
        let sql = qualify(
            "SELECT a FROM t WHERE d = '@TIMESTAMP@2023-08-20' AND n = 'x''@TIMESTAMP@2023-08-20' AND m = '@TIMESTAMP@soon'",
            "cat",
            "sch",
            None,
        )
        .expect("qualify should succeed");
        assert!(sql.contains("d = timestamp '2023-08-20'"), "{sql}");
        assert!(sql.contains("n = 'x''@TIMESTAMP@2023-08-20'"), "{sql}");
        assert!(sql.contains("m = '@TIMESTAMP@soon'"), "{sql}");
    }
}
