//! Step records, closed enumerations, execution results and the records
//! handed to the persistence collaborator.

use crate::error::StepError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Variable scope contents.
pub type Variables = Map<String, Value>;

// ── Closed value sets ───────────────────────────────────

/// Kind of a step node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Http,
    Script,
    Wait,
    Condition,
    Loop,
    Quote,
    Tcp,
    Database,
    Group,
}

impl StepKind {
    /// Parse a declared kind, accepting the labels used by the case
    /// editor as aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        let kind = match raw.trim() {
            "http" | "HTTP" | "HTTP请求" | "HTTP/HTTPS协议网络请求" => Self::Http,
            "script" | "执行代码请求" | "执行代码请求(Python)" => Self::Script,
            "wait" | "等待控制" => Self::Wait,
            "condition" | "if" | "条件分支" => Self::Condition,
            "loop" | "循环结构" => Self::Loop,
            "quote" | "include" | "引用公共用例" => Self::Quote,
            "tcp" | "TCP" | "TCP请求" => Self::Tcp,
            "database" | "数据库请求" => Self::Database,
            "group" | "default" | "默认" => Self::Group,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Script => "script",
            Self::Wait => "wait",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Quote => "quote",
            Self::Tcp => "tcp",
            Self::Database => "database",
            Self::Group => "group",
        }
    }

    /// Kinds that may carry child steps.
    pub fn allows_children(&self) -> bool {
        matches!(self, Self::Condition | Self::Loop | Self::Group)
    }
}

/// Iteration mode of a loop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    Count,
    Iterable,
    Dict,
    Condition,
}

impl LoopMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "count" | "次数循环" => Some(Self::Count),
            "iterable" | "对象循环" => Some(Self::Iterable),
            "dict" | "字典循环" => Some(Self::Dict),
            "condition" | "条件循环" => Some(Self::Condition),
            _ => None,
        }
    }
}

/// What a loop does when one of its children fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopErrorStrategy {
    /// Log and go on with the next iteration.
    Continue,
    /// Stop the loop; the loop step fails.
    Break,
    /// Abort the whole case run.
    Stop,
}

impl LoopErrorStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "continue" | "继续下一次循环" => Some(Self::Continue),
            "break" | "中断循环" => Some(Self::Break),
            "stop" | "停止整个用例执行" => Some(Self::Stop),
            _ => None,
        }
    }
}

/// Where an extraction or assertion reads its actual value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtractSource {
    #[serde(rename = "Response Json")]
    ResponseJson,
    #[serde(rename = "Response XML")]
    ResponseXml,
    #[serde(rename = "Response Text")]
    ResponseText,
    #[serde(rename = "Response Headers")]
    ResponseHeaders,
    #[serde(rename = "Response Cookies")]
    ResponseCookies,
    #[serde(rename = "Variables Pool")]
    VariablesPool,
}

impl ExtractSource {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let source = match normalized.as_str() {
            "response json" | "json" | "body" => Self::ResponseJson,
            "response xml" | "xml" => Self::ResponseXml,
            "response text" | "text" => Self::ResponseText,
            "response headers" | "response header" | "headers" | "header" => {
                Self::ResponseHeaders
            }
            "response cookies" | "response cookie" | "cookies" | "cookie" => {
                Self::ResponseCookies
            }
            "variables pool" | "variables" | "variable" => Self::VariablesPool,
            _ => return None,
        };
        Some(source)
    }

    /// Resolve an optional declared source, defaulting to the JSON body.
    pub fn from_declared(raw: Option<&str>) -> Result<Self, StepError> {
        match raw {
            None => Ok(Self::ResponseJson),
            Some(s) if s.trim().is_empty() => Ok(Self::ResponseJson),
            Some(s) => Self::parse(s).ok_or_else(|| {
                StepError::config(format!(
                    "unsupported extraction source '{s}' (expected one of: Response Json, \
                     Response XML, Response Text, Response Headers, Response Cookies, \
                     Variables Pool)"
                ))
            }),
        }
    }
}

/// How a report was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    #[serde(alias = "调试执行")]
    Debug,
    #[default]
    #[serde(alias = "同步执行")]
    Sync,
    #[serde(alias = "异步执行")]
    Async,
    #[serde(alias = "定时执行")]
    Scheduled,
}

/// Visibility of a case; only public cases may be included by others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    #[serde(alias = "公共脚本")]
    Public,
    #[default]
    #[serde(alias = "用户脚本")]
    Private,
}

// ── Step records ────────────────────────────────────────

/// One node of a case's step forest, as handed over by the store.
///
/// Fields are deliberately loose: kind, loop mode and strategy stay raw
/// strings until the executor that needs them parses them, so that an
/// unknown value surfaces as a configuration error on that step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(default, alias = "id")]
    pub step_id: Option<i64>,
    /// Sequence number, unique among siblings.
    #[serde(default)]
    pub step_no: Option<i64>,
    #[serde(default)]
    pub step_code: Option<String>,
    #[serde(default)]
    pub step_name: Option<String>,
    #[serde(default, alias = "kind")]
    pub step_type: Option<String>,
    #[serde(default)]
    pub parent_step_id: Option<i64>,
    /// Case whose root steps run as children of this step.
    #[serde(default)]
    pub quote_case_id: Option<i64>,

    // ── HTTP ────────────────────────────────────────────
    #[serde(default, deserialize_with = "string_or_number")]
    pub request_project: Option<String>,
    #[serde(default)]
    pub request_url: Option<String>,
    #[serde(default)]
    pub request_method: Option<String>,
    #[serde(default)]
    pub request_port: Option<u32>,
    #[serde(default)]
    pub request_header: Option<Value>,
    #[serde(default)]
    pub request_params: Option<Value>,
    #[serde(default)]
    pub request_body: Option<Value>,
    #[serde(default)]
    pub request_text: Option<String>,
    #[serde(default)]
    pub request_form_data: Option<Value>,
    #[serde(default)]
    pub request_form_urlencoded: Option<Value>,

    // ── Script / wait ───────────────────────────────────
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub wait: Option<Value>,

    // ── Condition / loop ────────────────────────────────
    #[serde(default)]
    pub conditions: Option<Value>,
    #[serde(default)]
    pub loop_mode: Option<String>,
    #[serde(default)]
    pub loop_on_error: Option<String>,
    #[serde(default)]
    pub loop_maximums: Option<Value>,
    #[serde(default)]
    pub loop_interval: Option<f64>,
    #[serde(default)]
    pub loop_timeout: Option<f64>,
    #[serde(default)]
    pub loop_iterable: Option<Value>,
    #[serde(default)]
    pub loop_iter_idx: Option<Value>,
    #[serde(default)]
    pub loop_iter_key: Option<String>,
    #[serde(default)]
    pub loop_iter_val: Option<String>,

    // ── Variables ───────────────────────────────────────
    #[serde(default)]
    pub defined_variables: Option<Variables>,
    #[serde(default)]
    pub extract_variables: Option<Value>,
    #[serde(default, alias = "validators")]
    pub assert_validators: Option<Value>,

    #[serde(default)]
    pub children: Vec<StepRecord>,
}

impl StepRecord {
    /// Key used for logs, iteration bookkeeping and de-duplication.
    pub fn key(&self) -> String {
        step_key(self.step_code.as_deref(), self.step_id, self.step_no)
    }

    pub fn name(&self) -> &str {
        self.step_name.as_deref().unwrap_or("")
    }

    pub fn kind(&self) -> Option<StepKind> {
        self.step_type.as_deref().and_then(StepKind::parse)
    }

    /// Children in ascending sequence order.
    pub fn ordered_children(&self) -> Vec<&StepRecord> {
        sort_by_sequence(&self.children)
    }

    pub fn extract_rules(&self) -> Result<Vec<ExtractRule>, StepError> {
        rules_from_value(self.extract_variables.as_ref(), "extract_variables")
    }

    pub fn assert_rules(&self) -> Result<Vec<AssertRule>, StepError> {
        rules_from_value(self.assert_validators.as_ref(), "assert_validators")
    }
}

pub(crate) fn step_key(
    code: Option<&str>,
    id: Option<i64>,
    no: Option<i64>,
) -> String {
    match code {
        Some(code) if !code.is_empty() => code.to_string(),
        _ => format!(
            "{}-{}",
            id.map(|v| v.to_string()).unwrap_or_default(),
            no.map(|v| v.to_string()).unwrap_or_default()
        ),
    }
}

/// Order sibling steps by sequence number; missing numbers sort first.
pub fn sort_by_sequence(steps: &[StepRecord]) -> Vec<&StepRecord> {
    let mut ordered: Vec<&StepRecord> = steps.iter().collect();
    ordered.sort_by_key(|s| s.step_no.unwrap_or(0));
    ordered
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn rules_from_value<T: DeserializeOwned>(
    value: Option<&Value>,
    field: &str,
) -> Result<Vec<T>, StepError> {
    let parse = |item: &Value| {
        serde_json::from_value::<T>(item.clone()).map_err(|e| {
            StepError::config(format!("invalid {field} entry {item}: {e}"))
        })
    };
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(parse).collect(),
        Some(obj @ Value::Object(_)) => Ok(vec![parse(obj)?]),
        Some(other) => Err(StepError::config(format!(
            "{field} must be a list or an object, got {other}"
        ))),
    }
}

/// One variable to pull out of a step's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRule {
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub index: Option<i64>,
}

/// One assertion to run against a step's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub expr: Option<String>,
    pub operation: String,
    #[serde(default)]
    pub except_value: Value,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub index: Option<i64>,
}

/// `true` when `range` asks for the whole source.
pub fn range_is_all(range: Option<&str>) -> bool {
    range.is_some_and(|r| r.trim().eq_ignore_ascii_case("all"))
}

/// Predicate used by condition steps and condition loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub value: Value,
    pub operation: String,
    #[serde(default)]
    pub except_value: Value,
    #[serde(default)]
    pub desc: String,
}

impl ConditionSpec {
    /// Parse the `conditions` field: an object, a JSON string (which may
    /// spell `None`/`True`/`False`), or a list whose first element is used.
    pub fn from_field(raw: Option<&Value>) -> Result<Self, StepError> {
        let obj = match raw {
            None | Some(Value::Null) => {
                return Err(StepError::config("missing condition configuration"))
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                return Err(StepError::config("missing condition configuration"))
            }
            Some(Value::String(s)) => parse_condition_text(s)?,
            Some(Value::Array(items)) => items.first().cloned().ok_or_else(|| {
                StepError::config("condition list is empty")
            })?,
            Some(other) => other.clone(),
        };

        let Value::Object(map) = &obj else {
            return Err(StepError::config(format!(
                "condition must be an object, got {obj}"
            )));
        };
        let value = map.get("value").cloned().unwrap_or(Value::Null);
        let operation = map.get("operation").and_then(Value::as_str);
        if value.is_null() || operation.is_none() {
            return Err(StepError::config(format!(
                "incomplete condition: value={value}, operation={}",
                operation.unwrap_or("null")
            )));
        }
        serde_json::from_value(obj.clone())
            .map_err(|e| StepError::config(format!("invalid condition {obj}: {e}")))
    }
}

fn parse_condition_text(text: &str) -> Result<Value, StepError> {
    use regex::Regex;
    use std::sync::LazyLock;

    static BARE_LITERALS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\b(None|True|False)\b")
            .expect("failed to compile literal regex")
    });

    let normalized = BARE_LITERALS.replace_all(text, |caps: &regex::Captures| {
        match &caps[1] {
            "None" => "null",
            "True" => "true",
            _ => "false",
        }
        .to_string()
    });
    serde_json::from_str(&normalized).map_err(|e| {
        StepError::config(format!(
            "condition is not valid JSON (line {}, column {}): {e}",
            e.line(),
            e.column()
        ))
    })
}

// ── Case metadata ───────────────────────────────────────

/// Identity of the case being run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseMeta {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, alias = "code")]
    pub case_code: String,
    #[serde(default, alias = "name")]
    pub case_name: String,
}

/// A case as returned by the store when another case includes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseRecord {
    #[serde(flatten)]
    pub meta: CaseMeta,
    #[serde(default)]
    pub case_type: CaseType,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

// ── Results ─────────────────────────────────────────────

/// Normalised HTTP response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub text: String,
    /// Round-trip time in seconds.
    #[serde(default)]
    pub elapsed: f64,
}

impl HttpResponse {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.text).ok()
    }
}

/// Outcome of one assertion rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionOutcome {
    pub name: String,
    pub source: String,
    pub expr: Option<String>,
    pub operation: String,
    pub except_value: Value,
    pub actual_value: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of one executed step, including loop iterations and steps
/// spliced in from included cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_id: Option<i64>,
    pub step_no: Option<i64>,
    pub step_code: Option<String>,
    pub step_name: String,
    pub step_type: Option<String>,
    pub success: bool,
    /// Set when a `stop` strategy fired in this subtree.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub elapsed: f64,
    /// 1-based iteration index when re-run inside a loop.
    #[serde(default = "first_iteration")]
    pub iteration: u32,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub extract_variables: Variables,
    #[serde(default)]
    pub assert_validators: Vec<AssertionOutcome>,
    #[serde(default)]
    pub children: Vec<StepExecutionResult>,
}

fn first_iteration() -> u32 {
    1
}

impl StepExecutionResult {
    pub fn new(step: &StepRecord) -> Self {
        Self {
            step_id: step.step_id,
            step_no: step.step_no,
            step_code: step.step_code.clone(),
            step_name: step.name().to_string(),
            step_type: step.step_type.clone(),
            success: true,
            aborted: false,
            message: None,
            error: None,
            elapsed: 0.0,
            iteration: 1,
            response: None,
            extract_variables: Variables::new(),
            assert_validators: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        step_key(self.step_code.as_deref(), self.step_id, self.step_no)
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
    }

    /// Pre-order walk over this result and all of its descendants.
    pub fn flatten(&self) -> Vec<&StepExecutionResult> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }
}

/// Pass/fail counts over the de-duplicated step set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Statistics {
    pub total_steps: usize,
    pub success_steps: usize,
    pub failed_steps: usize,
    /// Percentage, rounded to two decimals.
    pub pass_ratio: f64,
}

/// Everything a case run hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseExecution {
    pub case: CaseMeta,
    pub success: bool,
    pub results: Vec<StepExecutionResult>,
    /// Trace lines per step key; root steps also hold their descendants'.
    pub logs: BTreeMap<String, Vec<String>>,
    pub report_code: Option<String>,
    pub statistics: Statistics,
    /// Session scope at the end of the run.
    pub session_variables: Variables,
    pub elapsed: f64,
}

// ── Persistence records ─────────────────────────────────

/// Report row opened at the start of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportCreate {
    pub case_id: Option<i64>,
    pub case_code: String,
    pub case_name: String,
    pub case_st_time: String,
    pub case_state: bool,
    pub step_total: usize,
    pub step_fail_count: usize,
    pub step_pass_count: usize,
    pub step_pass_ratio: f64,
    pub report_type: ReportType,
}

/// Close-out of a report row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportUpdate {
    pub report_code: String,
    pub case_ed_time: String,
    pub case_elapsed: String,
    pub case_state: bool,
    pub step_total: usize,
    pub step_fail_count: usize,
    pub step_pass_count: usize,
    pub step_pass_ratio: f64,
}

/// Per-step trail row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailRecord {
    pub case_id: Option<i64>,
    pub case_code: String,
    pub report_code: String,
    pub step_id: Option<i64>,
    pub step_no: Option<i64>,
    pub step_code: String,
    pub step_name: String,
    pub step_type: Option<String>,
    pub step_state: bool,
    pub step_st_time: String,
    pub step_ed_time: String,
    pub step_elapsed: String,
    pub step_exec_logger: Option<String>,
    pub step_exec_except: Option<String>,
    pub num_cycles: u32,
    pub response_header: BTreeMap<String, String>,
    pub response_body: Value,
    pub response_text: Option<String>,
    pub response_cookie: Option<String>,
    pub session_variables: Variables,
    pub defined_variables: Variables,
    pub extract_variables: Variables,
    pub assert_validators: Vec<AssertionOutcome>,
}
