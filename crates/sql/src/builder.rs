use dag_contracts::{
    Operator, PAGE_PARAM, PAGE_SIZE_PARAM, ParamMap, ParamType, ServiceParam,
};

use crate::SqlError;
use crate::params::{literal, lookup, page_window};
use crate::safety;

/// Where a query runs and how it is shaped.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub catalog: &'a str,
    pub schema: &'a str,
    /// Sub-service row filter, already OR-joined.
    pub sub_clause: Option<&'a str>,
    pub service_params: &'a [ServiceParam],
    pub is_count: bool,
}

impl<'a> QueryContext<'a> {
    pub fn counting(self) -> Self {
        Self {
            is_count: true,
            ..self
        }
    }

    fn request_param(&self, name: &str) -> Option<&'a ServiceParam> {
        let request = self
            .service_params
            .iter()
            .filter(|p| p.param_type == ParamType::Request);
        request
            .clone()
            .find(|p| p.en_name == name)
            .or_else(|| request.clone().find(|p| p.en_name.eq_ignore_ascii_case(name)))
    }
}

/// Generates the SELECT for a wizard-built service from its parameter
/// metadata, then finishes it like a script.
pub fn wizard_query(
    params: &ParamMap,
    table: &str,
    ctx: &QueryContext<'_>,
) -> Result<String, SqlError> {
    let response: Vec<&ServiceParam> = ctx
        .service_params
        .iter()
        .filter(|p| p.param_type == ParamType::Response)
        .collect();

    let projection = if ctx.is_count {
        "COUNT(*)".to_string()
    } else {
        if response.is_empty() {
            return Err(SqlError::invalid("service declares no response params"));
        }
        response
            .iter()
            .map(|p| {
                let column = quote_ident(&p.en_name);
                if p.data_protection_query {
                    format!("'*' AS {}", column)
                } else {
                    column
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut sql = format!("SELECT {} FROM {}", projection, quote_ident(table));

    let predicates: Vec<String> = ctx
        .service_params
        .iter()
        .filter(|p| p.param_type == ParamType::Request)
        .filter(|p| p.en_name != PAGE_PARAM && p.en_name != PAGE_SIZE_PARAM)
        .filter(|p| lookup(params, &p.en_name).is_some_and(|v| !v.is_empty()))
        .map(|p| {
            let operator = p.operator.unwrap_or(Operator::Eq);
            let keyword = match operator {
                Operator::Like => "LIKE",
                Operator::In => "IN",
                Operator::NotIn => "NOT IN",
                other => other.as_str(),
            };
            format!("{} {} ${{{}}}", quote_ident(&p.en_name), keyword, p.en_name)
        })
        .collect();
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    if !ctx.is_count {
        let mut sorted = response.clone();
        sorted.sort_by_key(|p| p.sequence);
        let order: Vec<String> = sorted
            .iter()
            .filter_map(|p| {
                p.sort
                    .sql_keyword()
                    .map(|dir| format!("{} {}", quote_ident(&p.en_name), dir))
            })
            .collect();
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
    }

    finish(params, &sql, ctx, false)
}

/// Turns a caller-authored template into engine SQL: gate, substitute,
/// qualify, then paginate (or wrap for counting).
pub fn script_query(
    params: &ParamMap,
    script: &str,
    ctx: &QueryContext<'_>,
) -> Result<String, SqlError> {
    finish(params, script, ctx, true)
}

fn finish(
    params: &ParamMap,
    template: &str,
    ctx: &QueryContext<'_>,
    wrap_count: bool,
) -> Result<String, SqlError> {
    let gate_text = safety::substitute::<SqlError>(template, |name| {
        let list = ctx
            .request_param(name)
            .and_then(|p| p.operator)
            .is_some_and(Operator::is_list);
        Ok(if list { "(?)" } else { "?" }.to_string())
    })?;
    safety::check(&gate_text)?;

    let mut errors = Vec::new();
    let substituted = safety::substitute::<SqlError>(template, |name| {
        let decl = ctx.request_param(name);
        match lookup(params, name).filter(|p| !p.is_empty()) {
            Some(param) => Ok(literal(param, decl)),
            None => {
                if decl.is_some_and(|d| d.required) {
                    errors.push(format!("param {} required", name));
                }
                let list = decl.and_then(|d| d.operator).is_some_and(Operator::is_list);
                Ok(if list { "(NULL)" } else { "NULL" }.to_string())
            }
        }
    })?;
    if !errors.is_empty() {
        return Err(SqlError::Invalid(errors));
    }

    let sql = safety::qualify(&substituted, ctx.catalog, ctx.schema, ctx.sub_clause)?;

    if ctx.is_count {
        if wrap_count {
            return Ok(format!("SELECT COUNT(*) FROM ({}) AS total_rows", sql));
        }
        return Ok(sql);
    }

    let (page, size) = page_window(params);
    let offset = (page - 1).saturating_mul(size);
    Ok(format!("{} offset {} limit {}", sql, offset, size))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::prepare;
    use dag_contracts::{DataType, Param, Position, SortOrder};
    use serde_json::Value;

    fn param(
        param_type: ParamType,
        name: &str,
        data_type: DataType,
        operator: Option<Operator>,
    ) -> ServiceParam {
        ServiceParam {
            param_type,
            en_name: name.to_string(),
            cn_name: String::new(),
            data_type,
            required: false,
            default_value: None,
            operator,
            sort: SortOrder::Unsorted,
            masking: None,
            sequence: 0,
            data_protection_query: false,
        }
    }

    fn ctx(service_params: &[ServiceParam]) -> QueryContext<'_> {
        QueryContext {
            catalog: "cat",
            schema: "sch",
            sub_clause: None,
            service_params,
            is_count: false,
        }
    }

    #[test]
    fn wizard_numeric_filter() {
        let decls = vec![
            param(ParamType::Request, "age", DataType::Int, Some(Operator::Ge)),
            param(ParamType::Response, "name", DataType::String, None),
        ];
        let mut params =
            crate::params::assemble([], br#"{"age":30}"#, &[]).expect("assemble");
        prepare(&decls, &mut params, None).expect("prepare");

        let sql = wizard_query(&params, "t", &ctx(&decls)).expect("wizard");
        assert_eq!(
            sql,
            r#"SELECT "name" FROM "cat"."sch"."t" WHERE "age" >= 30 offset 0 limit 10"#
        );
    }

    #[test]
    fn wizard_like_with_string_default() {
        let mut q = param(ParamType::Request, "q", DataType::String, Some(Operator::Like));
        q.default_value = Some("foo".to_string());
        let decls = vec![q, param(ParamType::Response, "q", DataType::String, None)];

        let mut params = ParamMap::new();
        prepare(&decls, &mut params, None).expect("prepare");

        let sql = wizard_query(&params, "t", &ctx(&decls)).expect("wizard");
        assert!(
            sql.to_ascii_lowercase()
                .contains(r#"where "q" like '%foo%'"#),
            "{sql}"
        );
    }

    #[test]
    fn wizard_timestamp_literal() {
        let decls = vec![
            param(ParamType::Request, "cjsj", DataType::String, Some(Operator::Eq)),
            param(ParamType::Response, "id", DataType::Long, None),
        ];
        let mut params = ParamMap::new();
        params.insert(
            "cjsj".into(),
            Param::new(Value::from("2023-08-20"), Position::Query),
        );
        prepare(&decls, &mut params, None).expect("prepare");

        let sql = wizard_query(&params, "t", &ctx(&decls)).expect("wizard");
        assert!(sql.contains(r#""cjsj" = timestamp '2023-08-20'"#), "{sql}");
    }

    #[test]
    fn wizard_count_masking_and_order() {
        let mut a = param(ParamType::Response, "a", DataType::String, None);
        a.sequence = 2;
        a.sort = SortOrder::Desc;
        let mut b = param(ParamType::Response, "b", DataType::String, None);
        b.sequence = 1;
        b.sort = SortOrder::Asc;
        b.data_protection_query = true;
        let ids = param(ParamType::Request, "ids", DataType::Long, Some(Operator::In));
        let decls = vec![a, b, ids];

        let mut params = ParamMap::new();
        params.insert("ids".into(), Param::new(Value::from("1,2"), Position::Query));
        params.insert("offset".into(), Param::new(Value::from("3"), Position::Query));
        params.insert("limit".into(), Param::new(Value::from("20"), Position::Query));
        prepare(&decls, &mut params, None).expect("prepare");

        let sql = wizard_query(&params, "t", &ctx(&decls)).expect("wizard");
        assert_eq!(
            sql,
            r#"SELECT "a", '*' AS "b" FROM "cat"."sch"."t" WHERE "ids" IN (1, 2) ORDER BY "b" ASC, "a" DESC offset 40 limit 20"#
        );

        let count = wizard_query(&params, "t", &ctx(&decls).counting()).expect("count");
        assert_eq!(
            count,
            r#"SELECT COUNT(*) FROM "cat"."sch"."t" WHERE "ids" IN (1, 2)"#
        );
    }

    #[test]
    fn wizard_without_response_params_is_invalid() {
        let decls = vec![param(ParamType::Request, "a", DataType::Int, None)];
        let err = wizard_query(&ParamMap::new(), "t", &ctx(&decls)).unwrap_err();
        assert!(matches!(err, SqlError::Invalid(_)));
    }

    #[test]
    fn script_rejects_unsafe_templates() {
        for script in ["DELETE FROM t", "select * from t"] {
            let err = script_query(&ParamMap::new(), script, &ctx(&[])).unwrap_err();
            assert!(matches!(err, SqlError::Unsafe(_)), "{script}");
        }
    }

    #[test]
    fn script_substitutes_and_qualifies() {
        let mut dept = param(ParamType::Request, "dept", DataType::String, Some(Operator::Eq));
        dept.required = true;
        let decls = vec![dept, param(ParamType::Request, "min", DataType::Int, None)];
        let script = "SELECT name FROM emp WHERE dept = ${dept} AND salary > ${min}";

        let err = script_query(&ParamMap::new(), script, &ctx(&decls)).unwrap_err();
        assert_eq!(err, SqlError::Invalid(vec!["param dept required".to_string()]));

        let mut params = ParamMap::new();
        params.insert("dept".into(), Param::new(Value::from("o'neil"), Position::Query));
        let sql = script_query(&params, script, &ctx(&decls)).expect("script");
        assert_eq!(
            sql,
            r#"SELECT name FROM "cat"."sch"."emp" WHERE dept = 'o''neil' AND salary > NULL offset 0 limit 10"#
        );
    }

    #[test]
    fn script_count_wraps_and_applies_row_filter() {
        let script = "SELECT name FROM emp WHERE age > 1";
        let context = QueryContext {
            sub_clause: Some("(region = 'east') OR (region = 'west')"),
            ..ctx(&[]).counting()
        };
        let sql = script_query(&ParamMap::new(), script, &context).expect("count");
        assert_eq!(
            sql,
            r#"SELECT COUNT(*) FROM (SELECT name FROM "cat"."sch"."emp" WHERE (age > 1) AND ((region = 'east') OR (region = 'west'))) AS total_rows"#
        );
    }

    #[test]
    fn script_injection_attempt_stays_a_literal() {
        let decls = vec![param(ParamType::Request, "n", DataType::String, None)];
        let mut params = ParamMap::new();
        params.insert(
            "n".into(),
            Param::new(Value::from("x'; DELETE FROM t; --"), Position::Query),
        );
        let sql = script_query(&params, "SELECT a FROM t WHERE n = ${n}", &ctx(&decls))
            .expect("script");
        assert!(sql.contains("n = 'x''; DELETE FROM t; --'"), "{sql}");
    }

    #[test]
    fn values_that_look_like_sql_are_plain_strings() {
        let decls = vec![
            param(ParamType::Request, "n", DataType::String, None),
            param(ParamType::Request, "m", DataType::String, None),
        ];
        let mut params = ParamMap::new();
        params.insert("n".into(), Param::new(Value::from("select * x"), Position::Query));
        params.insert(
            "m".into(),
            Param::new(Value::from("-- note '@TIMESTAMP@2023-08-20"), Position::Query),
        );
        let sql = script_query(
            &params,
            "SELECT a FROM t WHERE n = ${n} AND m = ${m}",
            &ctx(&decls),
        )
        .expect("script");
        assert_eq!(
            sql,
            r#"SELECT a FROM "cat"."sch"."t" WHERE n = 'select * x' AND m = '-- note ''@TIMESTAMP@2023-08-20' offset 0 limit 10"#
        );
    }
}
