//! Step executors: one per step kind, dispatched by [`StepExecutorFactory`].
//!
//! Every step goes through [`execute_step`], which owns the part of the
//! lifecycle shared by all kinds (iteration bookkeeping, the step's
//! defined scope, failure capture, merging extracted variables into the
//! session, timing, and the best-effort detail record). Executors only
//! implement the kind-specific part in [`StepExecutor::do_execute`].

mod condition;
mod http;
mod loop_step;
mod passthrough;
mod quote;
mod script;
mod wait;

pub use condition::ConditionExecutor;
pub use http::HttpExecutor;
pub use loop_step::LoopExecutor;
pub use passthrough::PassthroughExecutor;
pub use quote::QuoteExecutor;
pub use script::ScriptExecutor;
pub use wait::WaitExecutor;

use crate::context::{ExecutionContext, VariableScope};
use crate::error::StepError;
use crate::model::{
    DetailRecord, HttpResponse, StepExecutionResult, StepKind, StepRecord, Variables,
};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, warn};

/// Kind-specific behaviour of a step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// The step this executor runs.
    fn step(&self) -> &StepRecord;

    /// Run the kind-specific logic. Returning `Err` marks the step failed
    /// with the error's text.
    async fn do_execute(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
    ) -> Result<(), StepError>;
}

/// Maps a step's kind to its executor.
pub struct StepExecutorFactory;

impl StepExecutorFactory {
    pub fn create<'a>(step: &'a StepRecord) -> Result<Box<dyn StepExecutor + 'a>, StepError> {
        let raw = step
            .step_type
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                StepError::config(format!("step '{}' has no step_type", step.key()))
            })?;
        let kind = StepKind::parse(raw).ok_or_else(|| {
            StepError::config(format!(
                "step '{}' has unsupported step_type '{raw}'",
                step.key()
            ))
        })?;

        let executor: Box<dyn StepExecutor + 'a> = match kind {
            StepKind::Http => Box::new(HttpExecutor::new(step)),
            StepKind::Script => Box::new(ScriptExecutor::new(step)),
            StepKind::Wait => Box::new(WaitExecutor::new(step)),
            StepKind::Condition => Box::new(ConditionExecutor::new(step)),
            StepKind::Loop => Box::new(LoopExecutor::new(step)),
            StepKind::Quote => Box::new(QuoteExecutor::new(step)),
            StepKind::Tcp | StepKind::Database | StepKind::Group => {
                Box::new(PassthroughExecutor::new(step, kind))
            }
        };
        Ok(executor)
    }
}

/// Execute one step and everything below it.
pub async fn execute_step(step: &StepRecord, ctx: &mut ExecutionContext) -> StepExecutionResult {
    let started = Instant::now();
    let started_at = Local::now();
    let key = step.key();

    let mut result = StepExecutionResult::new(step);
    result.iteration = ctx.cycle_index(&key);

    let previous_key = ctx.set_current_key(Some(key.clone()));
    let mut defined = ctx.scope(VariableScope::Defined).clone();
    if let Some(own) = &step.defined_variables {
        let resolved = ctx.resolve_value(&Value::Object(own.clone()));
        if let Value::Object(own) = resolved {
            defined.extend(own);
        }
    }
    let previous_defined = ctx.replace_defined(defined);
    let previous_extract = ctx.replace_extract(Variables::new());

    let label = if step.name().is_empty() {
        key.clone()
    } else {
        step.name().to_string()
    };
    ctx.log(format!(
        "start step '{}' ({}), iteration {}",
        label,
        step.step_type.as_deref().unwrap_or("?"),
        result.iteration
    ));

    let outcome = match StepExecutorFactory::create(step) {
        Ok(executor) => executor.do_execute(ctx, &mut result).await,
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        result.aborted |= e.is_abort();
        result.fail(e.to_string());
        ctx.log(format!("step failed: {e}"));
    }

    if !result.extract_variables.is_empty() {
        let extracted = result.extract_variables.clone();
        ctx.update_scope(&extracted, VariableScope::Session);
    }

    result.elapsed = started.elapsed().as_secs_f64();
    ctx.log(format!(
        "finish step '{}': {} in {:.3} s",
        label,
        if result.success { "passed" } else { "failed" },
        result.elapsed
    ));

    if ctx.report_code().is_some() {
        save_detail(ctx, &key, &result, started_at).await;
    }

    ctx.replace_extract(previous_extract);
    ctx.replace_defined(previous_defined);
    ctx.set_current_key(previous_key);
    result
}

/// Best-effort persistence of one step run.
async fn save_detail(
    ctx: &mut ExecutionContext,
    key: &str,
    result: &StepExecutionResult,
    started_at: DateTime<Local>,
) {
    let response: Option<HttpResponse> = result
        .response
        .as_ref()
        .and_then(|r| serde_json::from_value(r.clone()).ok());
    let logs = ctx.step_logs(key);
    let detail = DetailRecord {
        case_id: ctx.case().id,
        case_code: ctx.case().case_code.clone(),
        report_code: ctx.report_code().unwrap_or_default().to_string(),
        step_id: result.step_id,
        step_no: result.step_no,
        step_code: key.to_string(),
        step_name: result.step_name.clone(),
        step_type: result.step_type.clone(),
        step_state: result.success,
        step_st_time: started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        step_ed_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        step_elapsed: format!("{:.3}", result.elapsed),
        step_exec_logger: (!logs.is_empty()).then(|| logs.join("\n")),
        step_exec_except: result.error.clone(),
        num_cycles: result.iteration,
        response_header: response
            .as_ref()
            .map(|r| r.headers.clone())
            .unwrap_or_default(),
        response_body: response
            .as_ref()
            .and_then(HttpResponse::json)
            .unwrap_or(Value::Null),
        response_text: response.as_ref().map(|r| r.text.clone()),
        response_cookie: response
            .as_ref()
            .filter(|r| !r.cookies.is_empty())
            .and_then(|r| serde_json::to_string(&r.cookies).ok()),
        session_variables: ctx.session_variables().clone(),
        defined_variables: ctx.scope(VariableScope::Defined).clone(),
        extract_variables: result.extract_variables.clone(),
        assert_validators: result.assert_validators.clone(),
    };

    if let Err(e) = ctx.host().create_detail(&detail).await {
        warn!(step = %key, "failed to save step detail: {e:#}");
        ctx.log_to(key, format!("failed to save step detail: {e}"));
    }
}

/// Aggregate outcome of a batch of child steps.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ChildrenOutcome {
    pub all_passed: bool,
    pub aborted: bool,
}

/// Run `children` in order, appending their results to `result`.
///
/// Stops early after an aborted child, and after a failed one when
/// `halt_on_failure` is set.
pub(crate) async fn run_children(
    ctx: &mut ExecutionContext,
    children: &[&StepRecord],
    result: &mut StepExecutionResult,
    halt_on_failure: bool,
) -> ChildrenOutcome {
    let mut outcome = ChildrenOutcome {
        all_passed: true,
        aborted: false,
    };
    for child in children {
        let child_result = execute_step(child, ctx).await;
        let failed = !child_result.success;
        let aborted = child_result.aborted;
        result.children.push(child_result);

        if failed {
            outcome.all_passed = false;
        }
        if aborted {
            outcome.aborted = true;
            debug!(step = %child.key(), "child aborted the run");
            break;
        }
        if failed && halt_on_failure {
            break;
        }
    }
    outcome
}

/// Turn a child batch outcome into the container's own result.
pub(crate) fn container_outcome(
    outcome: ChildrenOutcome,
    what: &str,
) -> Result<(), StepError> {
    if outcome.aborted {
        return Err(StepError::Aborted(format!("a step inside this {what} stopped the case")));
    }
    if !outcome.all_passed {
        return Err(StepError::Execution(format!(
            "one or more child steps of this {what} failed"
        )));
    }
    Ok(())
}

/// `{"k": v}` or `[{"key": k, "value": v}]` into ordered string pairs.
pub(crate) fn value_pairs(value: &Value, field: &str) -> Result<Vec<(String, String)>, StepError> {
    use crate::placeholder::display_value;

    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), display_value(v)))
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let key = item.get("key").and_then(Value::as_str);
                match key {
                    Some(key) if !key.is_empty() => Ok((
                        key.to_string(),
                        item.get("value").map(display_value).unwrap_or_default(),
                    )),
                    _ => Err(StepError::config(format!(
                        "{field} entries must be objects with a 'key', got {item}"
                    ))),
                }
            })
            .collect(),
        other => Err(StepError::config(format!(
            "{field} must be an object or a list of key/value entries, got {other}"
        ))),
    }
}
