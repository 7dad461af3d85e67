//! Case execution: walks the root steps of one case, folds logs, computes
//! statistics and drives the report lifecycle.

use crate::config::ExecuteOptions;
use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::executor::execute_step;
use crate::host::{ExecutionHost, InMemoryHost};
use crate::model::{
    sort_by_sequence, CaseExecution, CaseMeta, ReportCreate, ReportUpdate, Statistics,
    StepExecutionResult, StepRecord,
};
use crate::validator::validate_step_tree;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use reqwest::Client;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Runs whole cases.
#[async_trait]
pub trait CaseRunner: Send + Sync {
    /// Execute the step forest of `case` and return its full trace.
    async fn execute(
        &self,
        case: &CaseMeta,
        steps: &[StepRecord],
        options: &ExecuteOptions,
    ) -> Result<CaseExecution, EngineError>;
}

/// Default case runner.
pub struct StepExecutionEngine {
    host: Arc<dyn ExecutionHost>,
    client: Option<Client>,
}

impl fmt::Debug for StepExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepExecutionEngine")
            .field("custom_client", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

impl StepExecutionEngine {
    /// Engine backed by an empty in-memory host.
    pub fn new() -> Self {
        Self::with_host(Arc::new(InMemoryHost::new()))
    }

    pub fn with_host(host: Arc<dyn ExecutionHost>) -> Self {
        Self { host, client: None }
    }

    /// Use `client` for every run instead of building one per run.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn host(&self) -> &Arc<dyn ExecutionHost> {
        &self.host
    }

    async fn open_report(
        &self,
        case: &CaseMeta,
        options: &ExecuteOptions,
        started_at: DateTime<Local>,
    ) -> Result<String, EngineError> {
        let report = ReportCreate {
            case_id: case.id,
            case_code: case.case_code.clone(),
            case_name: case.case_name.clone(),
            case_st_time: started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            case_state: false,
            step_total: 0,
            step_fail_count: 0,
            step_pass_count: 0,
            step_pass_ratio: 0.0,
            report_type: options.report_type,
        };
        self.host
            .create_report(&report)
            .await
            .map_err(|source| EngineError::ReportCreation {
                case_code: case.case_code.clone(),
                source,
            })
    }

    /// Best-effort close-out of the report and the case's last-run state.
    async fn close_report(
        &self,
        case: &CaseMeta,
        report_code: &str,
        success: bool,
        statistics: &Statistics,
        elapsed: f64,
    ) {
        let update = ReportUpdate {
            report_code: report_code.to_string(),
            case_ed_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            case_elapsed: format!("{elapsed:.3}"),
            case_state: success,
            step_total: statistics.total_steps,
            step_fail_count: statistics.failed_steps,
            step_pass_count: statistics.success_steps,
            step_pass_ratio: statistics.pass_ratio,
        };
        if let Err(e) = self.host.update_report(&update).await {
            warn!(report = %report_code, "failed to close report: {e:#}");
        }
        if let Some(case_id) = case.id {
            if let Err(e) = self.host.update_case_state(case_id, success).await {
                warn!(case_id, "failed to update case state: {e:#}");
            }
        }
    }
}

impl Default for StepExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaseRunner for StepExecutionEngine {
    #[instrument(skip_all, fields(case_code = %case.case_code))]
    async fn execute(
        &self,
        case: &CaseMeta,
        steps: &[StepRecord],
        options: &ExecuteOptions,
    ) -> Result<CaseExecution, EngineError> {
        let started = Instant::now();
        let started_at = Local::now();
        validate_step_tree(steps)?;

        let report_code = if options.save_report {
            Some(self.open_report(case, options, started_at).await?)
        } else {
            None
        };

        let mut ctx = ExecutionContext::new(case.clone(), self.host.clone(), options.settings.clone())
            .with_session(options.initial_variables.clone())
            .with_environment(options.environment.clone());
        if let Some(client) = &self.client {
            ctx = ctx.with_client(client.clone());
        }
        ctx.set_report_code(report_code.clone());

        let roots = sort_by_sequence(steps);
        info!("Starting case {} with {} root step(s)", case.case_code, roots.len());

        let mut results = Vec::with_capacity(roots.len());
        for (i, step) in roots.iter().enumerate() {
            info!("Running step {}/{}: {}", i + 1, roots.len(), step.key());
            let result = execute_step(step, &mut ctx).await;
            let aborted = result.aborted;
            results.push(result);
            if aborted {
                warn!("Case {} aborted at step {}", case.case_code, step.key());
                break;
            }
        }

        let statistics = compute_statistics(&results);
        let success = results.iter().all(|r| r.success);
        let logs = fold_logs(&results, ctx.take_logs());
        let session_variables = ctx.session_variables().clone();
        ctx.close();
        let elapsed = started.elapsed().as_secs_f64();

        if let Some(code) = &report_code {
            self.close_report(case, code, success, &statistics, elapsed)
                .await;
        }

        info!(
            "Case {} finished in {:.3} s - {}/{} step(s) passed",
            case.case_code, elapsed, statistics.success_steps, statistics.total_steps
        );

        Ok(CaseExecution {
            case: case.clone(),
            success,
            results,
            logs,
            report_code,
            statistics,
            session_variables,
            elapsed,
        })
    }
}

/// Counts over every executed step, loop iterations and included steps
/// collapsed by step key; the last run of a key decides its outcome.
pub fn compute_statistics(results: &[StepExecutionResult]) -> Statistics {
    let mut outcome: HashMap<String, bool> = HashMap::new();
    for result in results.iter().flat_map(StepExecutionResult::flatten) {
        outcome.insert(result.key(), result.success);
    }

    let total_steps = outcome.len();
    let success_steps = outcome.values().filter(|ok| **ok).count();
    let pass_ratio = if total_steps == 0 {
        0.0
    } else {
        (success_steps as f64 / total_steps as f64 * 10_000.0).round() / 100.0
    };
    Statistics {
        total_steps,
        success_steps,
        failed_steps: total_steps - success_steps,
        pass_ratio,
    }
}

/// Give each root step's bucket its own lines followed by every
/// descendant's lines, descendants in ascending step-code order.
pub fn fold_logs(
    results: &[StepExecutionResult],
    mut logs: BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, Vec<String>> {
    for root in results {
        let root_key = root.key();
        let descendants: BTreeSet<String> = root
            .flatten()
            .into_iter()
            .skip(1)
            .map(StepExecutionResult::key)
            .filter(|key| *key != root_key)
            .collect();

        let mut folded = logs.get(&root_key).cloned().unwrap_or_default();
        for key in &descendants {
            if let Some(lines) = logs.get(key) {
                folded.extend(lines.iter().cloned());
            }
        }
        logs.insert(root_key, folded);
    }
    logs
}
