//! Per-run execution context.
//!
//! One context is created per case run and passed by `&mut` through the
//! whole step tree, so variable and log side effects of one step are
//! visible to every later step. It owns the run's HTTP client, which is
//! built on first use and dropped with the context.

use crate::config::EngineSettings;
use crate::error::StepError;
use crate::host::ExecutionHost;
use crate::model::{CaseMeta, HttpResponse, Variables};
use crate::placeholder;
use chrono::Local;
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// The three named variable scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableScope {
    /// Declared on the step being executed.
    Defined,
    /// Accumulated over the run.
    Session,
    /// Produced by the step being executed.
    Extract,
}

impl FromStr for VariableScope {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "defined" | "defined_variables" => Ok(Self::Defined),
            "session" | "session_variables" => Ok(Self::Session),
            "extract" | "extract_variables" => Ok(Self::Extract),
            other => Err(StepError::config(format!(
                "invalid variable scope '{other}' (expected defined_variables, \
                 session_variables or extract_variables)"
            ))),
        }
    }
}

/// Body of an outbound request.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Text(String),
    /// `application/x-www-form-urlencoded`
    Form(Vec<(String, String)>),
    /// `multipart/form-data` text fields
    Multipart(Vec<(String, String)>),
}

/// One outbound HTTP call.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            params: Vec::new(),
            body: RequestBody::Empty,
        }
    }
}

/// Build the client a run uses: pooled, cookie-persisting, with the
/// configured timeouts.
pub fn build_client(settings: &EngineSettings) -> Result<Client, StepError> {
    Client::builder()
        .timeout(Duration::from_secs_f64(settings.request_timeout_secs))
        .connect_timeout(Duration::from_secs_f64(settings.connect_timeout_secs))
        .cookie_store(true)
        .build()
        .map_err(|e| StepError::Execution(format!("failed to build HTTP client: {e}")))
}

/// State of one case run.
pub struct ExecutionContext {
    case: CaseMeta,
    environment: Option<String>,
    report_code: Option<String>,
    settings: EngineSettings,
    host: Arc<dyn ExecutionHost>,

    defined: Variables,
    session: Variables,
    extract: Variables,

    logs: BTreeMap<String, Vec<String>>,
    current_key: Option<String>,
    cycle_index: HashMap<String, u32>,
    /// Ids of the cases currently being included, outermost first.
    quote_stack: Vec<i64>,

    client: Option<Client>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("case", &self.case.case_code)
            .field("environment", &self.environment)
            .field("report_code", &self.report_code)
            .field("session", &self.session)
            .field("client_open", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub fn new(case: CaseMeta, host: Arc<dyn ExecutionHost>, settings: EngineSettings) -> Self {
        let mut quote_stack = Vec::new();
        if let Some(id) = case.id {
            quote_stack.push(id);
        }
        Self {
            case,
            environment: None,
            report_code: None,
            settings,
            host,
            defined: Variables::new(),
            session: Variables::new(),
            extract: Variables::new(),
            logs: BTreeMap::new(),
            current_key: None,
            cycle_index: HashMap::new(),
            quote_stack,
            client: None,
        }
    }

    /// Use `client` instead of building one on first use.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_session(mut self, variables: Variables) -> Self {
        self.session = variables;
        self
    }

    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn set_report_code(&mut self, code: Option<String>) {
        self.report_code = code;
    }

    pub fn case(&self) -> &CaseMeta {
        &self.case
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn report_code(&self) -> Option<&str> {
        self.report_code.as_deref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn host(&self) -> Arc<dyn ExecutionHost> {
        Arc::clone(&self.host)
    }

    // ── Trace log ───────────────────────────────────────

    /// Append a timestamped line to the current step's bucket.
    pub fn log(&mut self, message: impl AsRef<str>) {
        let key = self.current_key.clone().unwrap_or_default();
        self.log_to(&key, message);
    }

    pub fn log_to(&mut self, key: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!(step = %key, "{message}");
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        self.logs
            .entry(key.to_string())
            .or_default()
            .push(format!("[{stamp}] {message}"));
    }

    /// Make `key` the bucket for subsequent [`log`](Self::log) calls and
    /// return the previous one.
    pub fn set_current_key(&mut self, key: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.current_key, key)
    }

    pub fn logs(&self) -> &BTreeMap<String, Vec<String>> {
        &self.logs
    }

    pub fn step_logs(&self, key: &str) -> &[String] {
        self.logs.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn take_logs(&mut self) -> BTreeMap<String, Vec<String>> {
        std::mem::take(&mut self.logs)
    }

    // ── Iteration bookkeeping ───────────────────────────

    pub fn cycle_index(&self, key: &str) -> u32 {
        self.cycle_index.get(key).copied().unwrap_or(1)
    }

    pub fn set_cycle_index(&mut self, key: &str, iteration: u32) {
        self.cycle_index.insert(key.to_string(), iteration);
    }

    // ── Variables ───────────────────────────────────────

    pub fn scope(&self, scope: VariableScope) -> &Variables {
        match scope {
            VariableScope::Defined => &self.defined,
            VariableScope::Session => &self.session,
            VariableScope::Extract => &self.extract,
        }
    }

    fn scope_mut(&mut self, scope: VariableScope) -> &mut Variables {
        match scope {
            VariableScope::Defined => &mut self.defined,
            VariableScope::Session => &mut self.session,
            VariableScope::Extract => &mut self.extract,
        }
    }

    /// Merge `data` into the scope named `scope`.
    pub fn update_variables(&mut self, data: &Variables, scope: &str) -> Result<(), StepError> {
        let scope: VariableScope = scope.parse()?;
        self.update_scope(data, scope);
        Ok(())
    }

    pub fn update_scope(&mut self, data: &Variables, scope: VariableScope) {
        if data.is_empty() {
            return;
        }
        self.scope_mut(scope).extend(data.clone());
        let keys: Vec<&String> = data.keys().collect();
        self.log(format!("updated {scope:?} variables: {keys:?}"));
    }

    /// Replace the defined scope, returning the previous contents.
    pub fn replace_defined(&mut self, defined: Variables) -> Variables {
        std::mem::replace(&mut self.defined, defined)
    }

    /// Replace the extract scope, returning the previous contents.
    pub fn replace_extract(&mut self, extract: Variables) -> Variables {
        std::mem::replace(&mut self.extract, extract)
    }

    /// Look a name up in defined, then session, then extract scope.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.defined
            .get(name)
            .or_else(|| self.session.get(name))
            .or_else(|| self.extract.get(name))
            .cloned()
    }

    /// Like [`lookup`](Self::lookup) but a missing name is an error. An
    /// explicit `null` is a successful lookup.
    pub fn get_variable(&self, name: &str) -> Result<Value, StepError> {
        if name.trim().is_empty() {
            return Err(StepError::config("variable name must not be empty"));
        }
        self.lookup(name)
            .ok_or_else(|| StepError::UnknownVariable(name.to_string()))
    }

    /// Merged view of all scopes, precedence as in [`lookup`](Self::lookup).
    pub fn snapshot(&self) -> Variables {
        let mut merged = self.extract.clone();
        merged.extend(self.session.clone());
        merged.extend(self.defined.clone());
        merged
    }

    pub fn session_variables(&self) -> &Variables {
        &self.session
    }

    // ── Placeholders ────────────────────────────────────

    fn report_missing(&mut self, missing: Vec<String>) {
        for name in missing {
            self.log(format!("placeholder ${{{name}}} is not defined, kept as is"));
        }
    }

    /// Resolve `${name}` placeholders anywhere inside `value`.
    pub fn resolve_value(&mut self, value: &Value) -> Value {
        let mut missing = Vec::new();
        let resolved = placeholder::resolve_value(value, &|n: &str| self.lookup(n), &mut missing);
        self.report_missing(missing);
        resolved
    }

    pub fn resolve_str(&mut self, text: &str) -> String {
        let mut missing = Vec::new();
        let resolved = placeholder::resolve_str(text, &|n: &str| self.lookup(n), &mut missing);
        self.report_missing(missing);
        resolved
    }

    /// Substitute placeholders into script source.
    pub fn substitute_script(&mut self, code: &str) -> String {
        let mut missing = Vec::new();
        let resolved =
            placeholder::substitute_script(code, &|n: &str| self.lookup(n), &mut missing);
        self.report_missing(missing);
        resolved
    }

    // ── Sub-case inclusion ──────────────────────────────

    /// Push `case_id` onto the inclusion stack, refusing cycles.
    pub fn enter_case(&mut self, case_id: i64) -> Result<(), StepError> {
        if self.quote_stack.contains(&case_id) {
            let chain: Vec<String> = self
                .quote_stack
                .iter()
                .chain(std::iter::once(&case_id))
                .map(i64::to_string)
                .collect();
            return Err(StepError::config(format!(
                "circular case inclusion: {}",
                chain.join(" -> ")
            )));
        }
        self.quote_stack.push(case_id);
        Ok(())
    }

    pub fn exit_case(&mut self, case_id: i64) {
        if self.quote_stack.last() == Some(&case_id) {
            self.quote_stack.pop();
        }
    }

    // ── Suspension points ───────────────────────────────

    /// Validate and sleep.
    pub async fn sleep(&mut self, seconds: f64) -> Result<(), StepError> {
        let max = self.settings.wait_limit();
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(StepError::config(format!(
                "wait time must be a non-negative number of seconds, got {seconds}"
            )));
        }
        if seconds > max {
            return Err(StepError::config(format!(
                "wait time must not exceed {max} seconds, got {seconds}"
            )));
        }
        self.log(format!("waiting {seconds} s"));
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(())
    }

    /// The run's client, built on first use.
    pub fn client(&mut self) -> Result<Client, StepError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        debug!(case = %self.case.case_code, "opening HTTP client");
        let client = build_client(&self.settings)?;
        self.client = Some(client.clone());
        Ok(client)
    }

    /// Release the HTTP client. Dropping the context does the same.
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            debug!(case = %self.case.case_code, "HTTP client released");
        }
    }

    /// Send one request and normalise the response.
    ///
    /// An error status is a normal response; only transport failures are
    /// errors.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn send_http(&mut self, request: HttpRequest) -> Result<HttpResponse, StepError> {
        let client = self.client()?;
        let method = request.method.to_string();
        let url = request.url.clone();
        self.log(format!(
            "request: {method} {url} headers={:?} params={:?}",
            request.headers, request.params
        ));

        let mut builder = client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(&body),
            RequestBody::Text(text) => builder.body(text),
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Multipart(fields) => {
                let form = fields
                    .into_iter()
                    .fold(reqwest::multipart::Form::new(), |form, (k, v)| form.text(k, v));
                builder.multipart(form)
            }
        };

        let started = Instant::now();
        let timeout = self.settings.request_timeout_secs;
        let map_err = |e: reqwest::Error| {
            let reason = if e.is_timeout() {
                format!("no response within {timeout} s")
            } else if e.is_connect() {
                format!("connection failed: {e}")
            } else {
                format!("request error: {e}")
            };
            StepError::Http {
                method: method.clone(),
                url: url.clone(),
                reason,
            }
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = map_err(e);
                warn!("{err}");
                self.log(err.to_string());
                return Err(err);
            }
        };

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let cookies: BTreeMap<String, String> = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                let err = map_err(e);
                self.log(err.to_string());
                return Err(err);
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        self.log(format!(
            "response: {} {} in {elapsed:.3} s",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        ));

        Ok(HttpResponse {
            status_code: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
            headers,
            cookies,
            text,
            elapsed,
        })
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::InMemoryHost;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let case = CaseMeta {
            id: Some(1),
            case_code: "C-1".into(),
            case_name: "demo".into(),
        };
        ExecutionContext::new(case, Arc::new(InMemoryHost::new()), EngineSettings::default())
    }

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_lookup_prefers_defined_over_session() {
        let mut ctx = context().with_session(vars(&[("a", json!(1)), ("b", json!(2))]));
        ctx.replace_defined(vars(&[("a", json!(10))]));
        assert_eq!(ctx.get_variable("a").unwrap(), json!(10));
        assert_eq!(ctx.get_variable("b").unwrap(), json!(2));
    }

    #[test]
    fn test_explicit_null_is_not_missing() {
        let ctx = context().with_session(vars(&[("n", Value::Null)]));
        assert_eq!(ctx.get_variable("n").unwrap(), Value::Null);
        assert!(matches!(
            ctx.get_variable("ghost"),
            Err(StepError::UnknownVariable(name)) if name == "ghost"
        ));
    }

    #[test]
    fn test_resolve_unknown_keeps_token_and_logs() {
        let mut ctx = context();
        ctx.set_current_key(Some("S1".into()));
        assert_eq!(ctx.resolve_str("id=${ghost}"), "id=${ghost}");
        assert!(ctx.get_variable("ghost").is_err());
        assert!(ctx.step_logs("S1")[0].contains("${ghost}"));
    }

    #[test]
    fn test_update_variables_scopes() {
        let mut ctx = context();
        ctx.update_variables(&vars(&[("x", json!(1))]), "session_variables")
            .unwrap();
        assert_eq!(ctx.session_variables().get("x"), Some(&json!(1)));
        let err = ctx
            .update_variables(&vars(&[("x", json!(1))]), "global")
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_log_lines_are_timestamped() {
        let mut ctx = context();
        ctx.log_to("S1", "hello");
        let line = &ctx.logs()["S1"][0];
        // [YYYY-MM-DD HH:MM:SS.mmm] hello
        assert_eq!(line.find(']'), Some(24));
        assert!(line.ends_with("] hello"));
    }

    #[test]
    fn test_circular_inclusion_refused() {
        let mut ctx = context();
        ctx.enter_case(2).unwrap();
        let err = ctx.enter_case(1).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("1 -> 2 -> 1"));
        ctx.exit_case(2);
        assert!(ctx.enter_case(2).is_ok());
    }

    #[tokio::test]
    async fn test_sleep_bounds() {
        let mut ctx = context();
        assert!(ctx.sleep(-1.0).await.unwrap_err().is_config());
        assert!(ctx.sleep(301.0).await.unwrap_err().is_config());
        assert!(ctx.sleep(0.0).await.is_ok());

        let settings = EngineSettings {
            max_wait_secs: 1000.0,
            ..Default::default()
        };
        let mut ctx = ExecutionContext::new(ctx.case().clone(), Arc::new(InMemoryHost::new()), settings);
        let err = ctx.sleep(301.0).await.unwrap_err();
        assert!(err.to_string().contains("must not exceed 300"));
    }

    #[tokio::test]
    async fn test_connection_failure_is_http_error() {
        let mut ctx = context();
        // Port 9 on localhost is not expected to accept connections.
        let err = ctx
            .send_http(HttpRequest::new(Method::GET, "http://127.0.0.1:9/"))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Http { ref method, .. } if method == "GET"));
    }

    #[test]
    fn test_close_releases_client() {
        let mut ctx = context();
        ctx.client().unwrap();
        assert!(format!("{ctx:?}").contains("client_open: true"));
        ctx.close();
        assert!(format!("{ctx:?}").contains("client_open: false"));
    }
}
