use super::StepExecutor;
use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::model::{StepExecutionResult, StepRecord};
use async_trait::async_trait;
use serde_json::Value;

/// Sleeps for a bounded number of seconds.
pub struct WaitExecutor<'a> {
    step: &'a StepRecord,
}

impl<'a> WaitExecutor<'a> {
    pub fn new(step: &'a StepRecord) -> Self {
        Self { step }
    }
}

fn seconds(value: &Value) -> Result<f64, StepError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        StepError::config(format!("wait time must be a number of seconds, got {value}"))
    })
}

#[async_trait]
impl StepExecutor for WaitExecutor<'_> {
    fn step(&self) -> &StepRecord {
        self.step
    }

    async fn do_execute(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
    ) -> Result<(), StepError> {
        let raw = match &self.step.wait {
            None | Some(Value::Null) => {
                return Err(StepError::config("wait step has no 'wait' value"))
            }
            Some(raw) => ctx.resolve_value(raw),
        };
        let secs = seconds(&raw)?;
        ctx.sleep(secs).await?;
        result.message = Some(format!("waited {secs} s"));
        Ok(())
    }
}
