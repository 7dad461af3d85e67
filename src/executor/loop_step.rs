use super::condition::evaluate;
use super::{run_children, StepExecutor};
use crate::config::{CONDITION_LOOP_CEILING, COUNT_LOOP_CEILING};
use crate::context::{ExecutionContext, VariableScope};
use crate::error::StepError;
use crate::model::{
    ConditionSpec, LoopErrorStrategy, LoopMode, StepExecutionResult, StepRecord, Variables,
};
use crate::placeholder::bare_reference;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

/// Repeats its children by count, over a list, over a mapping, or while a
/// condition holds.
pub struct LoopExecutor<'a> {
    step: &'a StepRecord,
}

/// What the loop does after one iteration.
enum Flow {
    Next,
    Break,
}

/// Bookkeeping shared by all modes.
struct LoopState {
    strategy: LoopErrorStrategy,
    interval: f64,
    executed: u32,
    failed_iterations: Vec<u32>,
    broken_at: Option<u32>,
}

impl LoopState {
    fn finish(self, result: &mut StepExecutionResult) -> Result<(), StepError> {
        result.message = Some(format!("loop ran {} iteration(s)", self.executed));
        if let Some(at) = self.broken_at {
            return Err(StepError::Execution(format!(
                "loop broken at iteration {at}: a child step failed"
            )));
        }
        if !self.failed_iterations.is_empty() {
            let list: Vec<String> = self.failed_iterations.iter().map(u32::to_string).collect();
            return Err(StepError::Execution(format!(
                "child steps failed in iteration(s) {}",
                list.join(", ")
            )));
        }
        Ok(())
    }
}

impl<'a> LoopExecutor<'a> {
    pub fn new(step: &'a StepRecord) -> Self {
        Self { step }
    }

    fn mode(&self) -> Result<LoopMode, StepError> {
        let raw = self
            .step
            .loop_mode
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| StepError::config("loop step has no loop_mode"))?;
        LoopMode::parse(raw).ok_or_else(|| {
            StepError::config(format!(
                "unsupported loop_mode '{raw}' (expected count, iterable, dict or condition)"
            ))
        })
    }

    fn strategy(&self) -> Result<LoopErrorStrategy, StepError> {
        let raw = self
            .step
            .loop_on_error
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| StepError::config("loop step has no loop_on_error strategy"))?;
        LoopErrorStrategy::parse(raw).ok_or_else(|| {
            StepError::config(format!(
                "unsupported loop_on_error '{raw}' (expected continue, break or stop)"
            ))
        })
    }

    fn interval(&self, ctx: &ExecutionContext) -> Result<f64, StepError> {
        let interval = self.step.loop_interval.unwrap_or(0.0);
        let max = ctx.settings().wait_limit();
        if !(0.0..=max).contains(&interval) {
            return Err(StepError::config(format!(
                "loop_interval must be between 0 and {max} seconds, got {interval}"
            )));
        }
        Ok(interval)
    }

    fn variable_name(raw: Option<&Value>, default: &str) -> String {
        match raw {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => default.to_string(),
        }
    }

    /// Resolve `loop_iterable`: a `${name}` reference, a JSON string, or an
    /// inline value.
    fn source(&self, ctx: &mut ExecutionContext) -> Result<Value, StepError> {
        let raw = match &self.step.loop_iterable {
            None | Some(Value::Null) => {
                return Err(StepError::config("loop step has no loop_iterable"))
            }
            Some(raw) => raw,
        };
        let resolved = ctx.resolve_value(raw);
        match resolved {
            Value::String(s) => {
                if let Some(name) = bare_reference(&s) {
                    return ctx.get_variable(name.trim());
                }
                Ok(serde_json::from_str(&s).unwrap_or(Value::String(s)))
            }
            other => Ok(other),
        }
    }

    async fn iteration(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
        state: &mut LoopState,
        iteration: u32,
    ) -> Result<Flow, StepError> {
        let children = self.step.ordered_children();
        ctx.set_cycle_index(&self.step.key(), iteration);
        result.iteration = iteration;
        for child in &children {
            ctx.set_cycle_index(&child.key(), iteration);
        }
        state.executed = iteration;

        let halt = state.strategy != LoopErrorStrategy::Continue;
        let outcome = run_children(ctx, &children, result, halt).await;
        if outcome.aborted {
            return Err(StepError::Aborted(format!(
                "a step inside iteration {iteration} stopped the case"
            )));
        }
        if outcome.all_passed {
            return Ok(Flow::Next);
        }

        state.failed_iterations.push(iteration);
        match state.strategy {
            LoopErrorStrategy::Continue => {
                ctx.log(format!("iteration {iteration} failed, continuing"));
                Ok(Flow::Next)
            }
            LoopErrorStrategy::Break => {
                ctx.log(format!("iteration {iteration} failed, breaking the loop"));
                state.broken_at = Some(iteration);
                Ok(Flow::Break)
            }
            LoopErrorStrategy::Stop => Err(StepError::Aborted(format!(
                "iteration {iteration} failed and loop_on_error is stop"
            ))),
        }
    }

    async fn pause(
        &self,
        ctx: &mut ExecutionContext,
        state: &LoopState,
    ) -> Result<(), StepError> {
        if state.interval > 0.0 {
            ctx.sleep(state.interval).await?;
        }
        Ok(())
    }

    async fn count_loop(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
        state: &mut LoopState,
    ) -> Result<(), StepError> {
        let raw = match &self.step.loop_maximums {
            None | Some(Value::Null) => {
                return Err(StepError::config("count loop has no loop_maximums"))
            }
            Some(raw) => ctx.resolve_value(raw),
        };
        let maximums = match &raw {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            StepError::config(format!(
                "loop_maximums must be a positive integer, got {raw}"
            ))
        })?;

        ctx.log(format!("count loop: {maximums} iteration(s)"));
        let last = maximums.min(u64::from(COUNT_LOOP_CEILING)) as u32;
        for i in 1..=last {
            ctx.log(format!("count loop: iteration {i}/{maximums}"));
            if let Flow::Break = self.iteration(ctx, result, state, i).await? {
                return Ok(());
            }
            if i < last {
                self.pause(ctx, state).await?;
            }
        }
        if maximums > u64::from(COUNT_LOOP_CEILING) {
            return Err(StepError::SafetyLimit {
                limit: COUNT_LOOP_CEILING,
                executed: state.executed,
            });
        }
        Ok(())
    }

    async fn iterable_loop(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
        state: &mut LoopState,
    ) -> Result<(), StepError> {
        let items = match self.source(ctx)? {
            Value::Array(items) => items,
            Value::String(_) => {
                return Err(StepError::config(
                    "loop_iterable must be a list, not a string",
                ))
            }
            other => {
                return Err(StepError::config(format!(
                    "loop_iterable must be a list, got {other}"
                )))
            }
        };
        if items.is_empty() {
            ctx.log("iterable loop: source is empty, nothing to do");
            return Ok(());
        }

        let idx_name = Self::variable_name(self.step.loop_iter_idx.as_ref(), "loop_index");
        let val_name = Self::variable_name(
            self.step.loop_iter_val.clone().map(Value::String).as_ref(),
            "loop_value",
        );
        let total = items.len();
        ctx.log(format!(
            "iterable loop: {total} item(s), index variable {idx_name}, value variable {val_name}"
        ));

        for (n, item) in items.into_iter().enumerate() {
            let i = n as u32 + 1;
            let mut injected = Variables::new();
            injected.insert(format!("{idx_name}_{i}"), Value::from(i));
            injected.insert(format!("{val_name}_{i}"), item);
            ctx.update_scope(&injected, VariableScope::Session);

            if let Flow::Break = self.iteration(ctx, result, state, i).await? {
                break;
            }
            if (i as usize) < total {
                self.pause(ctx, state).await?;
            }
        }
        Ok(())
    }

    async fn dict_loop(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
        state: &mut LoopState,
    ) -> Result<(), StepError> {
        let entries = match self.source(ctx)? {
            Value::Object(map) => map,
            other => {
                return Err(StepError::config(format!(
                    "loop_iterable must be a mapping in dict mode, got {other}"
                )))
            }
        };
        if entries.is_empty() {
            ctx.log("dict loop: mapping is empty, nothing to do");
            return Ok(());
        }

        let idx_name = Self::variable_name(self.step.loop_iter_idx.as_ref(), "loop_index");
        let key_name = Self::variable_name(
            self.step.loop_iter_key.clone().map(Value::String).as_ref(),
            "loop_key",
        );
        let val_name = Self::variable_name(
            self.step.loop_iter_val.clone().map(Value::String).as_ref(),
            "loop_value",
        );
        let total = entries.len();
        ctx.log(format!("dict loop: {total} entr(y/ies)"));

        for (n, (key, value)) in entries.into_iter().enumerate() {
            let i = n as u32 + 1;
            let mut injected = Variables::new();
            injected.insert(format!("{idx_name}_{i}"), Value::from(i));
            injected.insert(format!("{key_name}_{i}"), Value::String(key));
            injected.insert(format!("{val_name}_{i}"), value);
            ctx.update_scope(&injected, VariableScope::Session);

            if let Flow::Break = self.iteration(ctx, result, state, i).await? {
                break;
            }
            if (i as usize) < total {
                self.pause(ctx, state).await?;
            }
        }
        Ok(())
    }

    async fn condition_loop(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
        state: &mut LoopState,
    ) -> Result<(), StepError> {
        let cond = ConditionSpec::from_field(self.step.conditions.as_ref())?;
        let timeout = self.step.loop_timeout.unwrap_or(0.0);
        if !timeout.is_finite() || timeout < 0.0 {
            return Err(StepError::config(format!(
                "loop_timeout must be a non-negative number of seconds, got {timeout}"
            )));
        }

        let started = Instant::now();
        let mut iteration: u32 = 0;
        loop {
            if timeout > 0.0 && started.elapsed().as_secs_f64() >= timeout {
                ctx.log(format!(
                    "condition loop: timed out after {iteration} iteration(s) ({timeout} s)"
                ));
                break;
            }
            if iteration >= CONDITION_LOOP_CEILING {
                return Err(StepError::SafetyLimit {
                    limit: CONDITION_LOOP_CEILING,
                    executed: iteration,
                });
            }
            iteration += 1;
            ctx.log(format!("condition loop: iteration {iteration}"));

            if let Flow::Break = self.iteration(ctx, result, state, iteration).await? {
                break;
            }

            match evaluate(ctx, &cond) {
                Ok(true) => {}
                Ok(false) => {
                    ctx.log("condition loop: condition no longer holds");
                    break;
                }
                Err(e) => {
                    ctx.log(format!("condition loop: predicate failed: {e}"));
                    return Err(StepError::Execution(format!(
                        "loop condition could not be evaluated after iteration {iteration}: {e}"
                    )));
                }
            }

            self.pause(ctx, state).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StepExecutor for LoopExecutor<'_> {
    fn step(&self) -> &StepRecord {
        self.step
    }

    async fn do_execute(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
    ) -> Result<(), StepError> {
        let mode = self.mode()?;
        let strategy = self.strategy()?;
        let mut state = LoopState {
            strategy,
            interval: self.interval(ctx)?,
            executed: 0,
            failed_iterations: Vec::new(),
            broken_at: None,
        };
        debug!(step = %self.step.key(), ?mode, ?strategy, "starting loop");

        match mode {
            LoopMode::Count => self.count_loop(ctx, result, &mut state).await?,
            LoopMode::Iterable => self.iterable_loop(ctx, result, &mut state).await?,
            LoopMode::Dict => self.dict_loop(ctx, result, &mut state).await?,
            LoopMode::Condition => self.condition_loop(ctx, result, &mut state).await?,
        }
        state.finish(result)
    }
}
