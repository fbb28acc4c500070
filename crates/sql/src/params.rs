use dag_contracts::{
    DataType, Operator, PAGE_PARAM, PAGE_SIZE_PARAM, Param, ParamMap, ParamType, Position,
    ServiceParam,
};
use serde_json::Value;

use crate::SqlError;

pub const MAX_PAGE_SIZE: u64 = 1000;
pub const DEFAULT_PAGE_SIZE: u64 = 10;

/// Builds the request parameter map. Later sources overlay earlier ones:
/// headers, then the JSON body, then the query string.
pub fn assemble<'a>(
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    body: &[u8],
    query: &[(String, String)],
) -> Result<ParamMap, SqlError> {
    let mut params = ParamMap::new();

    for (name, value) in headers {
        params.insert(
            name.to_ascii_lowercase(),
            Param::new(Value::String(value.to_string()), Position::Header),
        );
    }

    if !body.iter().all(|b| b.is_ascii_whitespace()) {
        let parsed = serde_json::from_slice::<Value>(body)
            .map_err(|_| SqlError::invalid("request body must be a JSON object"))?;
        let Value::Object(map) = parsed else {
            return Err(SqlError::invalid("request body must be a JSON object"));
        };
        for (name, value) in map {
            params.insert(name, Param::new(value, Position::Body));
        }
    }

    for (name, value) in query {
        params.insert(
            name.clone(),
            Param::new(Value::String(value.clone()), Position::Query),
        );
    }

    Ok(params)
}

pub fn lookup<'p>(params: &'p ParamMap, name: &str) -> Option<&'p Param> {
    params
        .get(name)
        .or_else(|| params.get(name.to_ascii_lowercase().as_str()))
}

/// Applies defaults, required-ness, type coercion and pagination bounds for
/// every declared request parameter. All problems are reported together.
pub fn prepare(
    declared: &[ServiceParam],
    params: &mut ParamMap,
    default_page_size: Option<u32>,
) -> Result<(), SqlError> {
    let mut errors = Vec::new();

    for decl in declared
        .iter()
        .filter(|p| p.param_type == ParamType::Request)
    {
        let name = decl.en_name.as_str();
        if name == PAGE_PARAM || name == PAGE_SIZE_PARAM {
            continue;
        }

        let key = if params.contains_key(name) {
            Some(name.to_string())
        } else {
            let lowered = name.to_ascii_lowercase();
            params.contains_key(lowered.as_str()).then_some(lowered)
        };

        let supplied = key
            .as_deref()
            .and_then(|k| params.get(k))
            .filter(|p| !p.is_empty())
            .cloned();

        match supplied {
            Some(param) => match coerce(decl, &param) {
                Ok(value) => {
                    params.insert(
                        key.unwrap_or_else(|| name.to_string()),
                        Param {
                            value,
                            position: param.position,
                            data_type: Some(decl.data_type),
                        },
                    );
                }
                Err(message) => errors.push(message),
            },
            None if decl.required => errors.push(format!("param {} required", name)),
            None => {
                let Some(default) = decl
                    .default_value
                    .as_deref()
                    .filter(|d| !d.trim().is_empty())
                else {
                    continue;
                };
                match coerce_text(decl, default) {
                    Ok(value) => {
                        params.insert(
                            name.to_string(),
                            Param {
                                value,
                                position: Position::Query,
                                data_type: Some(decl.data_type),
                            },
                        );
                    }
                    Err(message) => errors.push(format!("default of {}", message)),
                }
            }
        }
    }

    if let Err(message) = bound_page_param(params, PAGE_PARAM, 1, u64::MAX) {
        errors.push(message);
    }
    if let Err(message) = bound_page_param(params, PAGE_SIZE_PARAM, 1, MAX_PAGE_SIZE) {
        errors.push(message);
    }
    if !params.contains_key(PAGE_SIZE_PARAM)
        && let Some(size) = default_page_size.filter(|s| *s > 0)
    {
        let size = u64::from(size).min(MAX_PAGE_SIZE);
        params.insert(
            PAGE_SIZE_PARAM.to_string(),
            Param {
                value: Value::from(size),
                position: Position::Query,
                data_type: Some(DataType::Long),
            },
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SqlError::Invalid(errors))
    }
}

/// 1-based page number and page size as validated by [`prepare`]. Missing
/// values fall back to page 1 and [`DEFAULT_PAGE_SIZE`].
pub fn page_window(params: &ParamMap) -> (u64, u64) {
    let page = params
        .get(PAGE_PARAM)
        .and_then(|p| integer_of(&p.value))
        .filter(|p| *p >= 1)
        .unwrap_or(1);
    let size = params
        .get(PAGE_SIZE_PARAM)
        .and_then(|p| integer_of(&p.value))
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    (page, size)
}

fn bound_page_param(params: &mut ParamMap, name: &str, min: u64, max: u64) -> Result<(), String> {
    let Some(param) = params.get_mut(name) else {
        return Ok(());
    };
    if param.is_empty() {
        params.remove(name);
        return Ok(());
    }

    let value = integer_of(&param.value)
        .filter(|v| (min..=max).contains(v))
        .ok_or_else(|| {
            if max == u64::MAX {
                format!("param {} must be an integer >= {}", name, min)
            } else {
                format!("param {} must be an integer between {} and {}", name, min, max)
            }
        })?;
    param.value = Value::from(value);
    param.data_type = Some(DataType::Long);
    Ok(())
}

fn integer_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn coerce(decl: &ServiceParam, param: &Param) -> Result<Value, String> {
    match (&param.value, param.position) {
        (Value::String(text), Position::Header | Position::Query | Position::Path) => {
            coerce_text(decl, text)
        }
        (Value::String(text), Position::Body)
            if decl.data_type != DataType::String
                || decl.operator.is_some_and(Operator::is_list) =>
        {
            if decl.operator.is_some_and(Operator::is_list) {
                coerce_text(decl, text)
            } else {
                Err(type_error(decl))
            }
        }
        (Value::Array(items), _) if decl.operator.is_some_and(Operator::is_list) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(coerce_json_scalar(decl, item)?);
            }
            Ok(Value::Array(out))
        }
        (value, _) => coerce_json_scalar(decl, value),
    }
}

fn coerce_json_scalar(decl: &ServiceParam, value: &Value) -> Result<Value, String> {
    let ok = match (decl.data_type, value) {
        (DataType::String, Value::String(_)) => true,
        (DataType::Int | DataType::Long, Value::Number(n)) => n.as_i64().is_some(),
        (DataType::Float | DataType::Double, Value::Number(_)) => true,
        (DataType::Boolean, Value::Bool(_)) => true,
        _ => false,
    };
    if ok {
        Ok(value.clone())
    } else {
        Err(type_error(decl))
    }
}

/// Coerces a textual value (header, query string or stored default) to the
/// declared type. List operators accept comma separated values.
pub fn coerce_text(decl: &ServiceParam, text: &str) -> Result<Value, String> {
    if decl.operator.is_some_and(Operator::is_list) {
        let mut items = Vec::new();
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            items.push(coerce_scalar_text(decl, item)?);
        }
        return Ok(Value::Array(items));
    }
    coerce_scalar_text(decl, text)
}

fn coerce_scalar_text(decl: &ServiceParam, text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    match decl.data_type {
        DataType::String => Ok(Value::String(text.to_string())),
        DataType::Int | DataType::Long => trimmed
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| type_error(decl)),
        DataType::Float | DataType::Double => {
            if !trimmed.parse::<f64>().is_ok_and(f64::is_finite) {
                return Err(type_error(decl));
            }
            serde_json::from_str::<serde_json::Number>(trimmed)
                .map(Value::Number)
                .map_err(|_| type_error(decl))
        }
        DataType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(type_error(decl)),
        },
    }
}

fn type_error(decl: &ServiceParam) -> String {
    format!("param {} must be {}", decl.en_name, decl.data_type.as_str())
}

/// True for `YYYY-MM-DD` and `YYYY-MM-DD HH:MM:SS`.
pub fn is_timestamp_literal(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if bytes.len() != 10 && bytes.len() != 19 {
        return false;
    }
    let digit = |idx: usize| bytes.get(idx).is_some_and(|b| b.is_ascii_digit());

    let date_ok = (0..4).all(digit)
        && bytes.get(4) == Some(&b'-')
        && digit(5)
        && digit(6)
        && bytes.get(7) == Some(&b'-')
        && digit(8)
        && digit(9);
    if !date_ok {
        return false;
    }
    if bytes.len() == 10 {
        return true;
    }

    bytes.get(10) == Some(&b' ')
        && digit(11)
        && digit(12)
        && bytes.get(13) == Some(&b':')
        && digit(14)
        && digit(15)
        && bytes.get(16) == Some(&b':')
        && digit(17)
        && digit(18)
}

pub const TIMESTAMP_MARKER: &str = "@TIMESTAMP@";

/// Renders a parameter as the SQL text substituted for its `${name}`
/// placeholder. List operators render a parenthesised value list.
pub fn literal(param: &Param, decl: Option<&ServiceParam>) -> String {
    let data_type = decl.map(|d| d.data_type).or(param.data_type);
    let operator = decl.and_then(|d| d.operator);

    if operator.is_some_and(Operator::is_list) {
        let items = match &param.value {
            Value::Array(items) => items.clone(),
            Value::String(text) => text
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
            other => vec![other.clone()],
        };
        if items.is_empty() {
            return "(NULL)".to_string();
        }
        let rendered = items
            .iter()
            .map(|item| scalar_literal(item, data_type, None))
            .collect::<Vec<_>>();
        return format!("({})", rendered.join(", "));
    }

    scalar_literal(&param.value, data_type, operator)
}

fn scalar_literal(value: &Value, data_type: Option<DataType>, operator: Option<Operator>) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) if data_type != Some(DataType::String) => b.to_string(),
        Value::Number(n) if data_type != Some(DataType::String) => n.to_string(),
        Value::String(s)
            if data_type.is_some_and(|t| t.is_integer() || t.is_fractional())
                && is_numeric_token(s.trim()) =>
        {
            s.trim().to_string()
        }
        Value::String(s)
            if data_type == Some(DataType::Boolean)
                && matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "false") =>
        {
            s.trim().to_ascii_lowercase()
        }
        other => string_literal(&dag_contracts::canonical::scalar_to_string(other), operator),
    }
}

/// Quotes a string value. Every leading and trailing `'` of the incoming
/// value is dropped first, so `''x''` and `'x` both render as `'x'`; quotes
/// inside the value are doubled.
fn string_literal(raw: &str, operator: Option<Operator>) -> String {
    let trimmed = raw.trim();
    if is_timestamp_literal(trimmed) {
        return format!("'{}{}'", TIMESTAMP_MARKER, trimmed);
    }

    let unquoted = raw.trim_matches('\'');
    let escaped = unquoted.replace('\'', "''");

    if operator == Some(Operator::Like) {
        format!("'%{}%'", escaped)
    } else {
        format!("'{}'", escaped)
    }
}

fn is_numeric_token(s: &str) -> bool {
    !s.is_empty()
        && s.parse::<f64>().is_ok_and(f64::is_finite)
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E'))
}
