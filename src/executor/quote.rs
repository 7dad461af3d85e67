use super::{container_outcome, run_children, StepExecutor};
use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::model::{sort_by_sequence, CaseType, StepExecutionResult, StepRecord};
use async_trait::async_trait;
use tracing::debug;

/// Runs the root steps of another, public case as children of this step.
pub struct QuoteExecutor<'a> {
    step: &'a StepRecord,
}

impl<'a> QuoteExecutor<'a> {
    pub fn new(step: &'a StepRecord) -> Self {
        Self { step }
    }
}

#[async_trait]
impl StepExecutor for QuoteExecutor<'_> {
    fn step(&self) -> &StepRecord {
        self.step
    }

    async fn do_execute(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
    ) -> Result<(), StepError> {
        let case_id = self
            .step
            .quote_case_id
            .ok_or_else(|| StepError::config("include step has no quote_case_id"))?;

        let case = ctx
            .host()
            .load_case(case_id)
            .await
            .map_err(|e| StepError::Execution(format!("failed to load case {case_id}: {e:#}")))?
            .ok_or_else(|| StepError::config(format!("included case {case_id} does not exist")))?;
        if case.case_type != CaseType::Public {
            return Err(StepError::config(format!(
                "case {case_id} ({}) is private and cannot be included",
                case.meta.case_code
            )));
        }

        if case.steps.is_empty() {
            ctx.log(format!("included case {case_id} has no steps, nothing to do"));
            result.message = Some("included case is empty".to_string());
            return Ok(());
        }

        ctx.enter_case(case_id)?;
        debug!(case_id, steps = case.steps.len(), "including case");
        ctx.log(format!(
            "including case {case_id} ({}) with {} root step(s)",
            case.meta.case_code,
            case.steps.len()
        ));
        let roots = sort_by_sequence(&case.steps);
        let outcome = run_children(ctx, &roots, result, false).await;
        ctx.exit_case(case_id);

        container_outcome(outcome, "included case")
    }
}
