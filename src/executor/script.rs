//! Embedded script steps, run on the Rhai interpreter.
//!
//! Scripts see read-only copies of the three variable scopes and a small
//! set of helpers (random values, time, HTTP through the run's client).
//! Modules cannot be imported and every run has an operation budget.

use super::http::resolve_rules;
use super::StepExecutor;
use crate::context::{ExecutionContext, VariableScope};
use crate::error::StepError;
use crate::extract::{run_checks, ExtractionInput};
use crate::model::{HttpResponse, StepExecutionResult, StepRecord, Variables};
use async_trait::async_trait;
use chrono::Local;
use reqwest::{Client, Method};
use rhai::module_resolvers::DummyModuleResolver;
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::debug;

const MAX_CALL_LEVELS: usize = 64;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Runs a script step.
pub struct ScriptExecutor<'a> {
    step: &'a StepRecord,
}

impl<'a> ScriptExecutor<'a> {
    pub fn new(step: &'a StepRecord) -> Self {
        Self { step }
    }
}

/// Everything a script run needs, owned so it can move to a blocking thread.
struct ScriptJob {
    code: String,
    defined: Variables,
    session: Variables,
    extract: Variables,
    max_operations: u64,
    client: Client,
    handle: Handle,
}

/// What a finished script produced.
#[derive(Debug)]
struct ScriptOutput {
    value: Option<Variables>,
    printed: Vec<String>,
}

#[async_trait]
impl StepExecutor for ScriptExecutor<'_> {
    fn step(&self) -> &StepRecord {
        self.step
    }

    async fn do_execute(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
    ) -> Result<(), StepError> {
        let code = self
            .step
            .code
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| StepError::config("script step has no code"))?;
        let code = ctx.substitute_script(code);
        let (extracts, asserts) = resolve_rules(ctx, self.step)?;

        let job = ScriptJob {
            code,
            defined: ctx.scope(VariableScope::Defined).clone(),
            session: ctx.scope(VariableScope::Session).clone(),
            extract: ctx.scope(VariableScope::Extract).clone(),
            max_operations: ctx.settings().script_max_operations,
            client: ctx.client()?,
            handle: Handle::current(),
        };
        let output = tokio::task::spawn_blocking(move || run(job))
            .await
            .map_err(|e| StepError::Execution(format!("script task failed: {e}")))?;
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                ctx.log(format!("script failed: {e}"));
                return Err(e);
            }
        };

        for line in &output.printed {
            ctx.log(format!("print: {line}"));
        }
        let Some(values) = output.value else {
            result.message = Some("script returned nothing".to_string());
            return Ok(());
        };
        debug!(step = %self.step.key(), keys = values.len(), "script returned");

        ctx.update_scope(&values, VariableScope::Extract);
        result.extract_variables.extend(values.clone());
        let body = Value::Object(values);
        let response = HttpResponse {
            status_code: 200,
            reason: Some("OK".to_string()),
            text: body.to_string(),
            elapsed: 0.0,
            ..Default::default()
        };
        result.response = serde_json::to_value(&response).ok();
        result.message = Some(format!("script returned {} value(s)", result.extract_variables.len()));

        let variables = ctx.snapshot();
        let input = ExtractionInput {
            json: Some(&body),
            text: &response.text,
            headers: &response.headers,
            cookies: &response.cookies,
            variables: &variables,
        };
        run_checks(&extracts, &asserts, &input, result)
    }
}

fn script_error(e: Box<EvalAltResult>) -> StepError {
    StepError::Script(e.to_string())
}

fn scope_value(vars: Variables) -> ScriptResult<Dynamic> {
    to_dynamic(Value::Object(vars))
}

/// Compile and run `job.code`, picking the entry point.
///
/// One `fn` is called with no arguments. With no `fn`, a top-level
/// `result` variable wins over the value of the last statement. More than
/// one `fn` is ambiguous.
fn run(job: ScriptJob) -> Result<ScriptOutput, StepError> {
    let printed = Arc::new(Mutex::new(Vec::new()));
    let engine = build_engine(&job, printed.clone());
    let ast = engine
        .compile(&job.code)
        .map_err(|e| StepError::Script(format!("syntax error: {e}")))?;

    let mut scope = Scope::new();
    scope.push("defined_variables", scope_value(job.defined).map_err(script_error)?);
    scope.push("session_variables", scope_value(job.session).map_err(script_error)?);
    scope.push("extract_variables", scope_value(job.extract).map_err(script_error)?);

    let functions: Vec<(String, usize)> = ast
        .iter_functions()
        .map(|f| (f.name.to_string(), f.params.len()))
        .collect();

    let value: Dynamic = match functions.as_slice() {
        [] => {
            let last = engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                .map_err(script_error)?;
            scope.get_value::<Dynamic>("result").unwrap_or(last)
        }
        [(name, 0)] => engine
            .call_fn::<Dynamic>(&mut scope, &ast, name, ())
            .map_err(script_error)?,
        [(name, arity)] => {
            return Err(StepError::config(format!(
                "script entry point '{name}' must take no arguments, it takes {arity}"
            )))
        }
        many => {
            let mut names: Vec<&str> = many.iter().map(|(n, _)| n.as_str()).collect();
            names.sort_unstable();
            return Err(StepError::config(format!(
                "script defines {} functions ({}), expected a single entry point",
                many.len(),
                names.join(", ")
            )));
        }
    };

    let printed = printed.lock().map(|p| p.clone()).unwrap_or_default();
    Ok(ScriptOutput {
        value: into_variables(value)?,
        printed,
    })
}

fn into_variables(value: Dynamic) -> Result<Option<Variables>, StepError> {
    if value.is_unit() {
        return Ok(None);
    }
    if !value.is_map() {
        return Err(StepError::config(format!(
            "script must return a map or nothing, got {}",
            value.type_name()
        )));
    }
    match from_dynamic::<Value>(&value).map_err(script_error)? {
        Value::Object(map) => Ok(Some(map)),
        other => Err(StepError::config(format!(
            "script must return a map or nothing, got {other}"
        ))),
    }
}

// ── Engine ──────────────────────────────────────────────

fn build_engine(job: &ScriptJob, printed: Arc<Mutex<Vec<String>>>) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.set_max_operations(job.max_operations);
    engine.set_max_call_levels(MAX_CALL_LEVELS);
    engine.disable_symbol("eval");
    engine.on_print(move |line| {
        if let Ok(mut lines) = printed.lock() {
            lines.push(line.to_string());
        }
    });

    register_random(&mut engine);
    register_time(&mut engine);
    register_http(&mut engine, job.client.clone(), job.handle.clone());
    engine
}

fn register_random(engine: &mut Engine) {
    engine.register_fn("rand_int", |low: i64, high: i64| -> ScriptResult<i64> {
        if low > high {
            return Err(format!("rand_int: low {low} is greater than high {high}").into());
        }
        Ok(fastrand::i64(low..=high))
    });
    engine.register_fn("rand_float", fastrand::f64);
    engine.register_fn("rand_string", |len: i64| -> String {
        std::iter::repeat_with(fastrand::alphanumeric)
            .take(len.max(0) as usize)
            .collect()
    });
    engine.register_fn("rand_choice", |items: Array| -> Dynamic {
        if items.is_empty() {
            return Dynamic::UNIT;
        }
        items[fastrand::usize(..items.len())].clone()
    });
}

fn register_time(engine: &mut Engine) {
    engine.register_fn("timestamp", || Local::now().timestamp());
    engine.register_fn("timestamp_ms", || Local::now().timestamp_millis());
    engine.register_fn("now", || Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
    engine.register_fn("now", |fmt: ImmutableString| -> ScriptResult<String> {
        let mut out = String::new();
        write!(out, "{}", Local::now().format(fmt.as_str()))
            .map_err(|_| format!("now: invalid time format '{fmt}'"))?;
        Ok(out)
    });
    engine.register_fn("today", || Local::now().format("%Y-%m-%d").to_string());
}

fn register_http(engine: &mut Engine, client: Client, handle: Handle) {
    let (c, h) = (client.clone(), handle.clone());
    engine.register_fn("http_get", move |url: ImmutableString| {
        script_http(&c, &h, "GET", &url, Map::new())
    });

    let (c, h) = (client.clone(), handle.clone());
    engine.register_fn("http_post", move |url: ImmutableString, body: Dynamic| {
        let mut options = Map::new();
        options.insert("json".into(), body);
        script_http(&c, &h, "POST", &url, options)
    });

    engine.register_fn(
        "http_request",
        move |method: ImmutableString, url: ImmutableString, options: Map| {
            script_http(&client, &handle, &method, &url, options)
        },
    );
}

/// Blocking HTTP call for scripts. `options` may hold `headers`, `params`
/// (maps), `json` (any value) or `body` (string).
fn script_http(
    client: &Client,
    handle: &Handle,
    method: &str,
    url: &str,
    options: Map,
) -> ScriptResult<Map> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid HTTP method '{method}'"))?;
    let mut request = client.request(method, url);

    if let Some(headers) = options.get("headers").and_then(|h| h.clone().try_cast::<Map>()) {
        for (name, value) in headers {
            request = request.header(name.as_str(), value.to_string());
        }
    }
    if let Some(params) = options.get("params").and_then(|p| p.clone().try_cast::<Map>()) {
        let pairs: Vec<(String, String)> = params
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        request = request.query(&pairs);
    }
    if let Some(json) = options.get("json") {
        request = request.json(&from_dynamic::<Value>(json)?);
    } else if let Some(body) = options.get("body") {
        request = request.body(body.to_string());
    }

    let (status, headers, text) = handle
        .block_on(async move {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let headers: BTreeMap<String, String> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, headers, text))
        })
        .map_err(|e| format!("http request to {url} failed: {e}"))?;

    let json: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    let mut out = Map::new();
    out.insert("status_code".into(), Dynamic::from_int(i64::from(status)));
    out.insert("headers".into(), to_dynamic(&headers)?);
    out.insert("json".into(), to_dynamic(&json)?);
    out.insert("text".into(), text.into());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::execute_step;
    use super::super::testing::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_last_expression_map_is_extracted() {
        let mut ctx = context();
        let s = step(script(1, "S", "let a = 1; #{a: a, b: \"x\"}"));
        let result = execute_step(&s, &mut ctx).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.extract_variables.get("b"), Some(&json!("x")));
        assert_eq!(ctx.get_variable("a").unwrap(), json!(1));
        let response = result.response.unwrap();
        assert_eq!(response["status_code"], json!(200));
        assert_eq!(response["elapsed"], json!(0.0));
    }

    #[tokio::test]
    async fn test_single_function_is_the_entry_point() {
        let mut ctx = context();
        let s = step(script(1, "S", "fn main() { #{token: \"t-\" + 7} }"));
        let result = execute_step(&s, &mut ctx).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(ctx.get_variable("token").unwrap(), json!("t-7"));
    }

    #[tokio::test]
    async fn test_result_binding() {
        let mut ctx = context();
        let s = step(script(1, "S", "let result = #{x: 2}; 5"));
        let result = execute_step(&s, &mut ctx).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(ctx.get_variable("x").unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_two_functions_are_ambiguous() {
        let mut ctx = context();
        let s = step(script(1, "S", "fn a() { #{} } fn b() { #{} }"));
        let result = execute_step(&s, &mut ctx).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.starts_with("configuration error"), "{error}");
        assert!(error.contains("a, b"));
    }

    #[tokio::test]
    async fn test_non_map_result_is_type_mismatch() {
        let mut ctx = context();
        let s = step(script(1, "S", "[1, 2, 3]"));
        let result = execute_step(&s, &mut ctx).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("must return a map"));
    }

    #[tokio::test]
    async fn test_unit_result_is_fine() {
        let mut ctx = context();
        let s = step(script(1, "S", "print(\"hello\");"));
        let result = execute_step(&s, &mut ctx).await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.extract_variables.is_empty());
        assert!(ctx.step_logs("S").iter().any(|l| l.ends_with("print: hello")));
    }

    #[tokio::test]
    async fn test_scripts_see_variable_scopes_and_placeholders() {
        let mut ctx = context().with_session(
            [("user".to_string(), json!("ann")), ("n".to_string(), json!(4))]
                .into_iter()
                .collect(),
        );
        let s = step(script(
            1,
            "S",
            "#{greeting: \"hi ${user}\", double: ${n} * 2, same: session_variables.user}",
        ));
        let result = execute_step(&s, &mut ctx).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(ctx.get_variable("greeting").unwrap(), json!("hi ann"));
        assert_eq!(ctx.get_variable("double").unwrap(), json!(8));
        assert_eq!(ctx.get_variable("same").unwrap(), json!("ann"));
    }

    #[tokio::test]
    async fn test_sandbox_blocks_imports_and_runaway_loops() {
        let mut ctx = context();
        let s = step(script(1, "S", "import \"os\" as os; #{}"));
        assert!(!execute_step(&s, &mut ctx).await.success);

        let s = step(script(1, "S", "loop { }"));
        let result = execute_step(&s, &mut ctx).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("script error"));
    }

    #[tokio::test]
    async fn test_helpers() {
        let mut ctx = context();
        let s = step(script(
            1,
            "S",
            "let r = rand_int(1, 3); \
             #{in_range: r >= 1 && r <= 3, len: rand_string(8).len(), \
               pick: rand_choice([\"x\"]), ts: timestamp() > 0, day: today().len()}",
        ));
        let result = execute_step(&s, &mut ctx).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            json!(result.extract_variables),
            json!({"in_range": true, "len": 8, "pick": "x", "ts": true, "day": 10})
        );
    }

    #[tokio::test]
    async fn test_assertions_run_on_script_output() {
        let mut ctx = context();
        let s = step(json!({
            "step_code": "S", "step_type": "script",
            "code": "#{data: #{count: 3}}",
            "extract_variables": [{"name": "count", "expr": "$.data.count"}],
            "assert_validators": [
                {"name": "count is 3", "expr": "$.data.count", "operation": "eq", "except_value": "3"},
                {"name": "count is 4", "expr": "$.data.count", "operation": "eq", "except_value": 4}
            ]
        }));
        let result = execute_step(&s, &mut ctx).await;
        assert!(!result.success);
        assert_eq!(result.assert_validators.len(), 2);
        assert!(result.assert_validators[0].success);
        assert!(!result.assert_validators[1].success);
        assert_eq!(ctx.get_variable("count").unwrap(), json!(3));
    }
}
