use super::{container_outcome, run_children, StepExecutor};
use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::model::{StepExecutionResult, StepKind, StepRecord};
use async_trait::async_trait;

/// Container for kinds with no behaviour of their own (group, and the
/// not yet supported tcp and database kinds): runs the children and
/// aggregates their outcome.
pub struct PassthroughExecutor<'a> {
    step: &'a StepRecord,
    kind: StepKind,
}

impl<'a> PassthroughExecutor<'a> {
    pub fn new(step: &'a StepRecord, kind: StepKind) -> Self {
        Self { step, kind }
    }
}

#[async_trait]
impl StepExecutor for PassthroughExecutor<'_> {
    fn step(&self) -> &StepRecord {
        self.step
    }

    async fn do_execute(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
    ) -> Result<(), StepError> {
        if self.kind != StepKind::Group {
            ctx.log(format!(
                "{} steps have no behaviour of their own; running children only",
                self.kind.as_str()
            ));
        }
        let children = self.step.ordered_children();
        let outcome = run_children(ctx, &children, result, false).await;
        container_outcome(outcome, self.kind.as_str())
    }
}
