//! stepcase CLI - runs step-tree test cases from YAML or JSON files.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;
use stepcase::{
    CaseConfigManager, CaseExecution, CaseFile, CaseRunner, ExecuteOptions, StepExecutionEngine,
    StepExecutionResult, Variables,
};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// stepcase - run automated test cases made of HTTP, script, wait,
/// condition, loop and include steps.
#[derive(Parser, Debug)]
#[command(name = "stepcase", version, about)]
struct Cli {
    /// Case file or directory path.
    #[arg(short = 'p', long = "path", env = "STEPCASE_PATH")]
    case_path: Option<String>,

    /// Filter cases by name or code (partial match).
    #[arg(short = 'f', long = "filter")]
    case_filter: Option<String>,

    /// Environment used to resolve relative request URLs.
    #[arg(short = 'e', long = "env", env = "STEPCASE_ENV")]
    environment: Option<String>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Timeout in seconds per HTTP request.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<f64>,

    /// Directory to save case report files.
    #[arg(short = 'r', long = "report-dir", env = "STEPCASE_REPORT_DIR")]
    report_dir: Option<String>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Initial session variable, `key=value`. The value is parsed as JSON
    /// when possible. Repeatable.
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn parse_vars(raw: &[String]) -> Result<Variables> {
    let mut vars = Variables::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("--var expects KEY=VALUE, got '{item}'"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("--var expects a non-empty key, got '{item}'");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...(truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

fn print_step(result: &StepExecutionResult, depth: usize, position: usize, verbose: bool) {
    let indent = "  ".repeat(depth + 1);
    let status = if result.success {
        "\x1b[32m✓\x1b[0m"
    } else {
        "\x1b[31m✗\x1b[0m"
    };
    let iteration = if result.iteration > 1 {
        format!(" #{}", result.iteration)
    } else {
        String::new()
    };
    info!(
        "{indent}{}. {} {} [{}]{} ({:.3} s)",
        position,
        status,
        result.key(),
        result.step_type.as_deref().unwrap_or("?"),
        iteration,
        result.elapsed
    );

    if let Some(error) = &result.error {
        error!("{indent}   \x1b[31mError: {}\x1b[0m", error);
    }
    if verbose {
        if let Some(message) = &result.message {
            debug!("{indent}   {}", message);
        }
        for assertion in &result.assert_validators {
            debug!(
                "{indent}   assert {}: {} {} {} -> {}",
                assertion.name,
                assertion.actual_value,
                assertion.operation,
                assertion.except_value,
                if assertion.success { "ok" } else { "failed" }
            );
        }
        if let Some(text) = result
            .response
            .as_ref()
            .and_then(|r| r.get("text"))
            .and_then(Value::as_str)
        {
            debug!("{indent}   Response body: {}", truncate(text, 500));
        }
    }

    for (i, child) in result.children.iter().enumerate() {
        print_step(child, depth + 1, i + 1, verbose);
    }
}

fn print_case_result(run: &CaseExecution, verbose: bool) {
    let status = if run.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!(
        "{} case: {} ({:.3} s) - {}/{} step(s) passed ({}%)",
        status,
        run.case.case_code,
        run.elapsed,
        run.statistics.success_steps,
        run.statistics.total_steps,
        run.statistics.pass_ratio
    );
    for (i, result) in run.results.iter().enumerate() {
        print_step(result, 0, i + 1, verbose);
    }
}

fn text_step(content: &mut String, result: &StepExecutionResult, depth: usize) {
    let indent = "  ".repeat(depth + 1);
    content.push_str(&format!(
        "{indent}- {} ({}) iteration {} {:.3} s\n",
        result.key(),
        if result.success { "PASS" } else { "FAIL" },
        result.iteration,
        result.elapsed
    ));
    if let Some(error) = &result.error {
        content.push_str(&format!("{indent}  Error: {error}\n"));
    }
    for child in &result.children {
        text_step(content, child, depth + 1);
    }
}

fn save_case_report(run: &CaseExecution, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = run.case.case_code.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(run)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(run)?,
        ),
        ReportFormat::Text => {
            let mut content = String::new();
            content.push_str(&format!(
                "Case: {} ({})\n",
                run.case.case_code, run.case.case_name
            ));
            content.push_str(&format!(
                "Status: {}\n",
                if run.success { "PASS" } else { "FAIL" }
            ));
            content.push_str(&format!(
                "Steps: {} total, {} passed, {} failed ({}%)\n",
                run.statistics.total_steps,
                run.statistics.success_steps,
                run.statistics.failed_steps,
                run.statistics.pass_ratio
            ));
            content.push_str(&format!("Duration: {:.3} s\n\nSteps:\n", run.elapsed));
            for result in &run.results {
                text_step(&mut content, result, 0);
            }
            (format!("{sanitized_name}-{timestamp}.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn load_cases(case_path: Option<String>) -> Result<Vec<CaseFile>> {
    let mut config = CaseConfigManager::new();
    for path in ["tests/cases", "testcase/cases"] {
        if Path::new(path).exists() {
            config.add_path(path);
        }
    }

    let cases = match case_path {
        Some(path) => {
            let path = PathBuf::from(path);
            if !path.exists() {
                bail!("Path does not exist: {}", path.display());
            }
            if path.is_file() {
                vec![config
                    .load_case(&path)
                    .context(format!("Failed to load case: {}", path.display()))?]
            } else {
                config.load_cases_from_dir(&path).context(format!(
                    "Failed to load cases from directory: {}",
                    path.display()
                ))?
            }
        }
        None => config.load_all_cases()?,
    };

    if cases.is_empty() {
        bail!("No case files found");
    }
    Ok(cases)
}

async fn run_all_cases(
    cases: Vec<CaseFile>,
    base: &ExecuteOptions,
    case_filter: Option<String>,
    verbose: bool,
    report_dir: Option<&Path>,
    report_format: ReportFormat,
) -> Result<bool> {
    let filtered: Vec<CaseFile> = match &case_filter {
        Some(filter) => {
            let filter = filter.to_lowercase();
            cases
                .into_iter()
                .filter(|c| {
                    c.name().to_lowercase().contains(&filter)
                        || c.case.case_code.to_lowercase().contains(&filter)
                })
                .collect()
        }
        None => cases,
    };
    if filtered.is_empty() {
        bail!("No cases matching the filter were found");
    }

    let total_start = Instant::now();
    let total = filtered.len();
    let (mut passed, mut failed) = (0, 0);
    info!("Running {} case(s)...", total);

    for (idx, case) in filtered.into_iter().enumerate() {
        info!("Case {}/{}: {}", idx + 1, total, case.name());
        let engine = StepExecutionEngine::with_host(Arc::new(case.host()));
        let options = case.options(base);

        match engine.execute(&case.case, &case.steps, &options).await {
            Ok(run) => {
                print_case_result(&run, verbose);
                if let Some(dir) = report_dir {
                    match save_case_report(&run, dir, report_format) {
                        Ok(path) => info!("Report saved: {}", path.display()),
                        Err(e) => error!("Failed to save report: {}", e),
                    }
                }
                if run.success {
                    passed += 1;
                } else {
                    failed += 1;
                }
            }
            Err(e) => {
                error!("\x1b[31mCase execution error: {} - {}\x1b[0m", case.name(), e);
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );
    Ok(failed == 0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let mut base = ExecuteOptions {
        initial_variables: parse_vars(&args.vars)?,
        environment: args.environment,
        ..Default::default()
    };
    if let Some(timeout) = args.timeout {
        base.settings.request_timeout_secs = timeout;
    }

    let cases = load_cases(args.case_path)?;
    let report_dir = args.report_dir.map(PathBuf::from);

    let success = run_all_cases(
        cases,
        &base,
        args.case_filter,
        args.verbose,
        report_dir.as_deref(),
        args.report_format,
    )
    .await?;

    if !success {
        exit(1);
    }

    Ok(())
}
