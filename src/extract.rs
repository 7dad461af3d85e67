//! Value extraction from step output and the assertion ledger built on it.

use crate::comparator::{compare, Operator};
use crate::error::StepError;
use crate::model::{
    range_is_all, AssertRule, AssertionOutcome, ExtractRule, ExtractSource, StepExecutionResult,
    Variables,
};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Everything an extraction rule may read from.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionInput<'a> {
    /// Structured body, when the output parsed as JSON.
    pub json: Option<&'a Value>,
    pub text: &'a str,
    pub headers: &'a BTreeMap<String, String>,
    pub cookies: &'a BTreeMap<String, String>,
    /// Merged view of the variable pool.
    pub variables: &'a Variables,
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn available_keys<'k>(keys: impl Iterator<Item = &'k String>) -> String {
    keys.take(10)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

// ── JSON path ───────────────────────────────────────────

/// Resolve `$.a.0.b` (or `$.a[0].b`) against `root`.
pub fn json_path(root: &Value, expr: &str) -> Result<Value, StepError> {
    let expr = expr.trim();
    let Some(rest) = expr.strip_prefix('$') else {
        return Err(StepError::config(format!(
            "JSON path '{expr}' must start with '$'"
        )));
    };
    let normalized = rest.replace('[', ".").replace(']', "");
    let parts: Vec<&str> = normalized.split('.').filter(|p| !p.is_empty()).collect();

    let mut current = root;
    for (i, part) in parts.iter().enumerate() {
        let path = format!("$.{}", parts[..=i].join("."));
        current = match current {
            Value::Object(map) => map.get(*part).ok_or_else(|| StepError::PathNotFound {
                path: path.clone(),
                segment: part.to_string(),
                available: available_keys(map.keys()),
            })?,
            Value::Array(items) => {
                let index: usize = part.parse().map_err(|_| StepError::PathType {
                    path: path.clone(),
                    segment: part.to_string(),
                    found: "list",
                })?;
                items.get(index).ok_or_else(|| StepError::IndexOutOfRange {
                    context: format!("path '{path}'"),
                    index: index as i64,
                    len: items.len(),
                })?
            }
            scalar => {
                return Err(StepError::PathType {
                    path,
                    segment: part.to_string(),
                    found: type_name(scalar),
                })
            }
        };
    }
    Ok(current.clone())
}

// ── XML path ────────────────────────────────────────────

fn node_text(node: roxmltree::Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Resolve `/root/item[2]/name`, `/root/item/@id` or `.../text()`.
///
/// Indices are 1-based. A path that selects several nodes yields a list.
pub fn xml_path(text: &str, expr: &str) -> Result<Value, StepError> {
    let doc = roxmltree::Document::parse(text)
        .map_err(|e| StepError::Execution(format!("response is not well-formed XML: {e}")))?;

    let segments: Vec<&str> = expr.trim().split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(StepError::config(format!("empty XML path '{expr}'")));
    }

    let mut nodes = vec![doc.root()];
    let mut walked = String::new();
    for segment in &segments {
        walked.push('/');
        walked.push_str(segment);

        if let Some(attr) = segment.strip_prefix('@') {
            let values: Vec<Value> = nodes
                .iter()
                .filter_map(|n| n.attribute(attr))
                .map(|v| Value::String(v.to_string()))
                .collect();
            return collapse(values, &walked, attr);
        }
        if *segment == "text()" {
            let values = nodes.iter().map(|n| Value::String(node_text(*n))).collect();
            return collapse(values, &walked, segment);
        }

        let (name, index) = match segment.split_once('[') {
            Some((name, idx)) => {
                let idx = idx.trim_end_matches(']');
                let n: usize = idx.parse().map_err(|_| {
                    StepError::config(format!("invalid index '{idx}' in XML path '{expr}'"))
                })?;
                (name, Some(n))
            }
            None => (*segment, None),
        };

        let mut next = Vec::new();
        let mut seen = Vec::new();
        for node in &nodes {
            let matching: Vec<_> = node
                .children()
                .filter(|c| c.is_element())
                .inspect(|c| seen.push(c.tag_name().name().to_string()))
                .filter(|c| c.tag_name().name() == name)
                .collect();
            match index {
                Some(n) if n >= 1 => {
                    if let Some(hit) = matching.get(n - 1) {
                        next.push(*hit);
                    } else if !matching.is_empty() {
                        return Err(StepError::IndexOutOfRange {
                            context: format!("XML path '{walked}'"),
                            index: n as i64,
                            len: matching.len(),
                        });
                    }
                }
                Some(_) => {
                    return Err(StepError::config(format!(
                        "XML path indices start at 1 (in '{expr}')"
                    )))
                }
                None => next.extend(matching),
            }
        }
        if next.is_empty() {
            seen.dedup();
            return Err(StepError::PathNotFound {
                path: walked,
                segment: name.to_string(),
                available: available_keys(seen.iter()),
            });
        }
        nodes = next;
    }

    let values = nodes.iter().map(|n| Value::String(node_text(*n))).collect();
    collapse(values, &walked, segments.last().copied().unwrap_or_default())
}

fn collapse(mut values: Vec<Value>, path: &str, segment: &str) -> Result<Value, StepError> {
    match values.len() {
        0 => Err(StepError::PathNotFound {
            path: path.to_string(),
            segment: segment.to_string(),
            available: String::new(),
        }),
        1 => Ok(values.remove(0)),
        _ => Ok(Value::Array(values)),
    }
}

// ── Text pattern ────────────────────────────────────────

/// Match `pattern` against `text`; capture group 1 when present, else the
/// whole match. One match yields a string, several yield a list.
pub fn regex_extract(text: &str, pattern: &str) -> Result<Value, StepError> {
    let re = Regex::new(pattern)
        .map_err(|e| StepError::config(format!("invalid pattern '{pattern}': {e}")))?;
    let mut found: Vec<Value> = re
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| Value::String(m.as_str().to_string()))
        .collect();
    match found.len() {
        0 => Err(StepError::Execution(format!(
            "pattern '{pattern}' did not match the response text"
        ))),
        1 => Ok(found.remove(0)),
        _ => Ok(Value::Array(found)),
    }
}

// ── Rule evaluation ─────────────────────────────────────

fn keyed(
    map: &BTreeMap<String, String>,
    key: &str,
    what: &str,
    case_insensitive: bool,
) -> Result<Value, StepError> {
    let hit = if case_insensitive {
        let lowered = key.to_ascii_lowercase();
        map.iter()
            .find(|(k, _)| k.to_ascii_lowercase() == lowered)
            .map(|(_, v)| v)
    } else {
        map.get(key)
    };
    hit.map(|v| Value::String(v.clone()))
        .ok_or_else(|| StepError::PathNotFound {
            path: format!("{what}.{key}"),
            segment: key.to_string(),
            available: available_keys(map.keys()),
        })
}

fn whole(source: ExtractSource, input: &ExtractionInput<'_>) -> Value {
    let as_object = |m: &BTreeMap<String, String>| {
        Value::Object(
            m.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    };
    match source {
        ExtractSource::ResponseJson => input.json.cloned().unwrap_or(Value::Null),
        ExtractSource::ResponseXml | ExtractSource::ResponseText => {
            Value::String(input.text.to_string())
        }
        ExtractSource::ResponseHeaders => as_object(input.headers),
        ExtractSource::ResponseCookies => as_object(input.cookies),
        ExtractSource::VariablesPool => Value::Object(input.variables.clone()),
    }
}

/// Read one value out of `input`.
pub fn extract_value(
    source: ExtractSource,
    expr: Option<&str>,
    range: Option<&str>,
    index: Option<i64>,
    input: &ExtractionInput<'_>,
) -> Result<Value, StepError> {
    let value = if range_is_all(range) {
        whole(source, input)
    } else {
        let expr = expr.map(str::trim).filter(|e| !e.is_empty()).ok_or_else(|| {
            StepError::config("extraction needs an 'expr' unless range is ALL")
        })?;
        match source {
            ExtractSource::ResponseJson => {
                let body = input.json.ok_or_else(|| {
                    StepError::Execution(format!(
                        "cannot evaluate '{expr}': response body is not JSON"
                    ))
                })?;
                json_path(body, expr)?
            }
            ExtractSource::ResponseXml => xml_path(input.text, expr)?,
            ExtractSource::ResponseText => regex_extract(input.text, expr)?,
            ExtractSource::ResponseHeaders => keyed(input.headers, expr, "headers", true)?,
            ExtractSource::ResponseCookies => keyed(input.cookies, expr, "cookies", false)?,
            ExtractSource::VariablesPool => input
                .variables
                .get(expr)
                .cloned()
                .ok_or_else(|| StepError::UnknownVariable(expr.to_string()))?,
        }
    };
    apply_index(value, index, expr.unwrap_or("ALL"))
}

fn apply_index(value: Value, index: Option<i64>, expr: &str) -> Result<Value, StepError> {
    match (value, index) {
        (Value::Array(mut items), Some(i)) => {
            let len = items.len();
            if i < 0 || i as usize >= len {
                return Err(StepError::IndexOutOfRange {
                    context: format!("'{expr}'"),
                    index: i,
                    len,
                });
            }
            Ok(items.swap_remove(i as usize))
        }
        (value, _) => Ok(value),
    }
}

/// Run extraction and assertion rules against one step output.
///
/// Every rule is evaluated. Extracted values land in the result (and are
/// visible to later assertions reading the variable pool); every
/// assertion is appended to the result's ledger. Any failure yields an
/// [`StepError::Assertion`] enumerating all of them.
pub fn run_checks(
    extracts: &[ExtractRule],
    asserts: &[AssertRule],
    input: &ExtractionInput<'_>,
    result: &mut StepExecutionResult,
) -> Result<(), StepError> {
    let mut failures = Vec::new();

    for rule in extracts {
        let outcome = ExtractSource::from_declared(rule.source.as_deref()).and_then(|source| {
            extract_value(
                source,
                rule.expr.as_deref(),
                rule.range.as_deref(),
                rule.index,
                input,
            )
        });
        match outcome {
            Ok(value) => {
                debug!(name = %rule.name, "extracted variable");
                result.extract_variables.insert(rule.name.clone(), value);
            }
            Err(e) => failures.push(format!("extract '{}': {e}", rule.name)),
        }
    }

    let mut pool = input.variables.clone();
    pool.extend(result.extract_variables.clone());
    let input = ExtractionInput {
        variables: &pool,
        ..*input
    };

    for (i, rule) in asserts.iter().enumerate() {
        let outcome = assert_one(i, rule, &input);
        if !outcome.success {
            failures.push(format!(
                "assert '{}': {}",
                outcome.name,
                outcome.message.as_deref().unwrap_or("failed")
            ));
        }
        result.assert_validators.push(outcome);
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "{} check(s) failed: {}",
            failures.len(),
            failures.join("; ")
        )))
    }
}

fn assert_one(position: usize, rule: &AssertRule, input: &ExtractionInput<'_>) -> AssertionOutcome {
    let name = rule
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| rule.expr.clone())
        .unwrap_or_else(|| format!("assertion #{}", position + 1));

    let mut outcome = AssertionOutcome {
        name,
        source: rule.source.clone().unwrap_or_else(|| "Response Json".to_string()),
        expr: rule.expr.clone(),
        operation: rule.operation.clone(),
        except_value: rule.except_value.clone(),
        actual_value: Value::Null,
        success: false,
        message: None,
    };

    let evaluated = ExtractSource::from_declared(rule.source.as_deref())
        .and_then(|source| {
            extract_value(
                source,
                rule.expr.as_deref(),
                rule.range.as_deref(),
                rule.index,
                input,
            )
        })
        .and_then(|actual| {
            let op = Operator::parse(&rule.operation)?;
            let passed = compare(&actual, op, &rule.except_value)?;
            Ok((actual, op, passed))
        });

    match evaluated {
        Ok((actual, op, passed)) => {
            if !passed {
                outcome.message = Some(format!(
                    "expected {op} {}, got {actual}",
                    rule.except_value
                ));
            }
            outcome.actual_value = actual;
            outcome.success = passed;
        }
        Err(e) => outcome.message = Some(e.to_string()),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepRecord;
    use serde_json::json;

    fn input<'a>(
        json: Option<&'a Value>,
        text: &'a str,
        headers: &'a BTreeMap<String, String>,
        variables: &'a Variables,
    ) -> ExtractionInput<'a> {
        ExtractionInput {
            json,
            text,
            headers,
            cookies: headers,
            variables,
        }
    }

    #[test]
    fn test_json_path_hits() {
        let body = json!({"data": {"items": [{"id": 7}, {"id": 8}]}});
        assert_eq!(json_path(&body, "$.data.items.1.id").unwrap(), json!(8));
        assert_eq!(json_path(&body, "$.data.items[0].id").unwrap(), json!(7));
        assert_eq!(json_path(&body, "$").unwrap(), body);
    }

    #[test]
    fn test_json_path_missing_key_names_path() {
        let body = json!({"data": {}});
        let err = json_path(&body, "$.data.token").unwrap_err();
        assert!(matches!(err, StepError::PathNotFound { .. }));
        assert!(err.to_string().contains("$.data.token"));
    }

    #[test]
    fn test_json_path_type_and_range_errors() {
        let body = json!({"n": 1, "list": [1]});
        let err = json_path(&body, "$.n.x").unwrap_err();
        assert!(err.to_string().contains("number"));
        let err = json_path(&body, "$.list.5").unwrap_err();
        assert!(matches!(err, StepError::IndexOutOfRange { len: 1, .. }));
        assert!(json_path(&body, "data.n").unwrap_err().is_config());
    }

    #[test]
    fn test_xml_path() {
        let xml = r#"<resp><user id="1"><name>ann</name></user><user id="2"><name>bob</name></user></resp>"#;
        assert_eq!(xml_path(xml, "/resp/user[2]/name").unwrap(), json!("bob"));
        assert_eq!(xml_path(xml, "/resp/user/@id").unwrap(), json!(["1", "2"]));
        assert_eq!(xml_path(xml, "/resp/user[1]/name/text()").unwrap(), json!("ann"));
        let err = xml_path(xml, "/resp/group").unwrap_err();
        assert!(err.to_string().contains("/resp/group"));
    }

    #[test]
    fn test_regex_extract() {
        let text = "id=10; id=11";
        assert_eq!(regex_extract(text, r"id=(\d+)").unwrap(), json!(["10", "11"]));
        assert_eq!(regex_extract("token abc", r"token \w+").unwrap(), json!("token abc"));
        assert!(regex_extract(text, r"nope").is_err());
        assert!(regex_extract(text, r"(").unwrap_err().is_config());
    }

    #[test]
    fn test_range_all_and_index() {
        let body = json!({"ids": [4, 5, 6]});
        let headers = BTreeMap::new();
        let vars = Variables::new();
        let data = input(Some(&body), "", &headers, &vars);

        let all = extract_value(ExtractSource::ResponseJson, Some("$.x"), Some("ALL"), None, &data);
        assert_eq!(all.unwrap(), body);

        let picked =
            extract_value(ExtractSource::ResponseJson, Some("$.ids"), None, Some(2), &data);
        assert_eq!(picked.unwrap(), json!(6));

        let err = extract_value(ExtractSource::ResponseJson, Some("$.ids"), None, Some(3), &data)
            .unwrap_err();
        assert!(matches!(err, StepError::IndexOutOfRange { index: 3, len: 3, .. }));
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let vars = Variables::new();
        let data = input(None, "", &headers, &vars);
        let v = extract_value(ExtractSource::ResponseHeaders, Some("Content-Type"), None, None, &data);
        assert_eq!(v.unwrap(), json!("application/json"));
    }

    #[test]
    fn test_run_checks_builds_full_ledger() {
        let body = json!({"code": 0, "data": {"token": "abc"}});
        let headers = BTreeMap::new();
        let vars = Variables::new();
        let data = input(Some(&body), "", &headers, &vars);

        let extracts: Vec<ExtractRule> = serde_json::from_value(json!([
            {"name": "token", "source": "Response Json", "expr": "$.data.token", "range": "SOME"}
        ]))
        .unwrap();
        let asserts: Vec<AssertRule> = serde_json::from_value(json!([
            {"name": "code", "expr": "$.code", "operation": "等于", "except_value": 1},
            {"name": "missing", "expr": "$.nope", "operation": "等于", "except_value": 1},
            {"name": "token var", "source": "Variables Pool", "expr": "token", "operation": "等于", "except_value": "abc"}
        ]))
        .unwrap();

        let mut result = StepExecutionResult::new(&StepRecord::default());
        let err = run_checks(&extracts, &asserts, &data, &mut result).unwrap_err();

        assert_eq!(result.extract_variables.get("token"), Some(&json!("abc")));
        assert_eq!(result.assert_validators.len(), 3);
        assert!(!result.assert_validators[0].success);
        assert_eq!(result.assert_validators[0].actual_value, json!(0));
        assert!(!result.assert_validators[1].success);
        assert!(result.assert_validators[2].success);
        let msg = err.to_string();
        assert!(msg.starts_with("2 check(s) failed"));
        assert!(msg.contains("'code'"));
        assert!(msg.contains("'missing'"));
    }
}
