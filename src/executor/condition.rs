use super::{container_outcome, run_children, StepExecutor};
use crate::comparator::compare_str;
use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::model::{ConditionSpec, StepExecutionResult, StepRecord};
use crate::placeholder::bare_reference;
use async_trait::async_trait;
use serde_json::Value;

/// Runs its children only when the predicate holds.
pub struct ConditionExecutor<'a> {
    step: &'a StepRecord,
}

impl<'a> ConditionExecutor<'a> {
    pub fn new(step: &'a StepRecord) -> Self {
        Self { step }
    }
}

/// Evaluate a condition against the variable pool.
///
/// `value` is resolved first; if it is still a bare `${name}` afterwards
/// the name is unknown, which is an error rather than a false predicate.
pub(crate) fn evaluate(ctx: &mut ExecutionContext, cond: &ConditionSpec) -> Result<bool, StepError> {
    let resolved = ctx.resolve_value(&cond.value);
    let actual = match &resolved {
        Value::String(s) => match bare_reference(s) {
            Some(name) => ctx.get_variable(name.trim())?,
            None => resolved.clone(),
        },
        _ => resolved.clone(),
    };
    let expected = ctx.resolve_value(&cond.except_value);
    let holds = compare_str(&actual, &cond.operation, &expected)?;
    ctx.log(format!(
        "condition {} {} {} -> {holds}",
        actual, cond.operation, expected
    ));
    Ok(holds)
}

#[async_trait]
impl StepExecutor for ConditionExecutor<'_> {
    fn step(&self) -> &StepRecord {
        self.step
    }

    async fn do_execute(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
    ) -> Result<(), StepError> {
        let cond = ConditionSpec::from_field(self.step.conditions.as_ref())?;

        if !evaluate(ctx, &cond)? {
            let message = format!("condition not met: {}", cond.desc);
            ctx.log(&message);
            result.message = Some(message);
            return Ok(());
        }

        let message = format!("condition met: {}", cond.desc);
        ctx.log(&message);
        result.message = Some(message);

        let children = self.step.ordered_children();
        let outcome = run_children(ctx, &children, result, false).await;
        container_outcome(outcome, "condition")
    }
}

#[cfg(test)]
mod tests {
    use super::super::execute_step;
    use super::super::testing::*;
    use crate::error::StepError;
    use serde_json::json;

    fn branch(cond: serde_json::Value) -> serde_json::Value {
        json!({
            "step_no": 1, "step_code": "IF", "step_type": "条件分支",
            "conditions": cond,
            "children": [script(1, "INNER", "#{ran: true}")]
        })
    }

    #[tokio::test]
    async fn test_false_condition_succeeds_without_children() {
        let mut ctx = context().with_session([("n".to_string(), json!(1))].into_iter().collect());
        let s = step(branch(json!(r#"{"value": "${n}", "operation": "等于", "except_value": 2, "desc": "n is 2"}"#)));
        let result = execute_step(&s, &mut ctx).await;
        assert!(result.success);
        assert!(result.children.is_empty());
        assert_eq!(result.message.as_deref(), Some("condition not met: n is 2"));
    }

    #[tokio::test]
    async fn test_true_condition_runs_children() {
        let mut ctx = context().with_session([("n".to_string(), json!("2"))].into_iter().collect());
        let s = step(branch(json!({"value": "${n}", "operation": "eq", "except_value": 2})));
        let result = execute_step(&s, &mut ctx).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.children.len(), 1);
        assert_eq!(ctx.get_variable("ran").unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_unknown_variable_fails_branch() {
        let mut ctx = context();
        let s = step(branch(json!({"value": "${missing}", "operation": "非空", "except_value": null})));
        let result = execute_step(&s, &mut ctx).await;
        assert!(!result.success);
        assert_eq!(
            result.error,
            Some(StepError::UnknownVariable("missing".into()).to_string())
        );
        assert!(result.children.is_empty());
    }

    #[tokio::test]
    async fn test_failing_child_fails_branch() {
        let mut ctx = context();
        let s = step(json!({
            "step_code": "IF", "step_type": "if",
            "conditions": {"value": 1, "operation": "等于", "except_value": "1"},
            "children": [script(1, "BAD", "throw \"no\";"), script(2, "GOOD", "#{x: 1}")]
        }));
        let result = execute_step(&s, &mut ctx).await;
        assert!(!result.success);
        assert_eq!(result.children.len(), 2);
        assert!(result.children[1].success);
    }
}
