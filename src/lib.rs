//! stepcase - an execution engine for tree-shaped automated test cases.
//!
//! A case is a forest of steps (HTTP calls, scripts, waits, conditions,
//! loops, includes of other cases). The engine runs them against a shared
//! variable pool, substitutes `${name}` placeholders, extracts values,
//! checks assertions and returns a structured trace.

pub mod comparator;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod extract;
pub mod host;
pub mod model;
pub mod placeholder;
pub mod runner;
pub mod validator;

pub use config::*;
pub use error::{EngineError, StepError};
pub use host::{ExecutionHost, InMemoryHost};
pub use model::*;
pub use runner::*;
pub use validator::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    const CASE_YAML: &str = r##"
case: { id: 3, case_code: ORDER-01, case_name: order flow }
variables:
  items: [apple, pear]
library:
  - id: 9
    case_code: SETUP
    case_type: public
    steps:
      - { step_no: 1, step_code: SETUP-1, step_type: script, code: "#{ready: true}" }
steps:
  - step_no: 1
    step_code: INCLUDE
    step_type: quote
    quote_case_id: 9
  - step_no: 2
    step_code: EACH
    step_type: loop
    loop_mode: iterable
    loop_on_error: break
    loop_iterable: "${items}"
    loop_iter_val: item
    children:
      - { step_no: 1, step_code: PICK, step_type: script, code: "#{last: \"got ${item_1}\"}" }
  - step_no: 3
    step_code: CHECK
    step_type: condition
    conditions: { value: "${ready}", operation: eq, except_value: "true" }
    children:
      - { step_no: 1, step_code: DONE, step_type: script, code: "#{done: true}" }
"##;

    #[test]
    fn test_case_file_round_trip() {
        let case = CaseFile::from_yaml(CASE_YAML).unwrap();
        let yaml = case.to_yaml().unwrap();
        let again = CaseFile::from_yaml(&yaml).unwrap();
        assert_eq!(again.case.case_code, "ORDER-01");
        assert_eq!(again.steps.len(), 3);
        assert_eq!(again.library[0].steps[0].key(), "SETUP-1");
    }

    #[tokio::test]
    async fn test_case_file_end_to_end() {
        let file = CaseFile::from_yaml(CASE_YAML).unwrap();
        let host = Arc::new(file.host());
        let engine = StepExecutionEngine::with_host(host.clone());
        let options = file.options(&ExecuteOptions::default());

        let run = engine.execute(&file.case, &file.steps, &options).await.unwrap();
        assert!(run.success, "{:#?}", run.results);
        assert_eq!(run.session_variables.get("ready"), Some(&json!(true)));
        assert_eq!(run.session_variables.get("item_2"), Some(&json!("pear")));
        assert_eq!(run.session_variables.get("done"), Some(&json!(true)));
        // INCLUDE, SETUP-1, EACH, PICK, CHECK, DONE
        assert_eq!(run.statistics.total_steps, 6);
        assert_eq!(run.statistics.pass_ratio, 100.0);
        assert!(run.logs["EACH"].len() > run.logs["PICK"].len());
        assert_eq!(host.case_state(3), Some(true));
    }
}
