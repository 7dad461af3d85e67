//! Engine settings and case-file loading.

use crate::host::InMemoryHost;
use crate::model::{CaseMeta, CaseRecord, ReportType, StepRecord, Variables};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Iteration ceiling of count loops, whatever `loop_maximums` says.
pub const COUNT_LOOP_CEILING: u32 = 100;

/// Iteration ceiling of condition loops.
pub const CONDITION_LOOP_CEILING: u32 = 1000;

/// Longest single wait, in seconds. `max_wait_secs` can lower it, not raise it.
pub const MAX_WAIT_SECS: f64 = 300.0;

/// Tunables of one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Overall timeout of one outbound HTTP call, in seconds.
    pub request_timeout_secs: f64,
    pub connect_timeout_secs: f64,
    /// Upper bound accepted by wait steps and loop intervals, capped at
    /// [`MAX_WAIT_SECS`].
    pub max_wait_secs: f64,
    /// Operation budget of one script run.
    pub script_max_operations: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30.0,
            connect_timeout_secs: 10.0,
            max_wait_secs: MAX_WAIT_SECS,
            script_max_operations: 1_000_000,
        }
    }
}

impl EngineSettings {
    /// Effective wait bound in seconds.
    pub fn wait_limit(&self) -> f64 {
        self.max_wait_secs.min(MAX_WAIT_SECS)
    }
}

/// Per-run options supplied by the caller.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Seed of the session scope.
    pub initial_variables: Variables,
    /// Environment used to resolve relative HTTP URLs.
    pub environment: Option<String>,
    /// Open a report and write one detail record per step.
    pub save_report: bool,
    pub report_type: ReportType,
    pub settings: EngineSettings,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            initial_variables: Variables::new(),
            environment: None,
            save_report: true,
            report_type: ReportType::Sync,
            settings: EngineSettings::default(),
        }
    }
}

/// A runnable case as stored on disk.
///
/// ```yaml
/// case: { id: 1, case_code: LOGIN-01, case_name: login }
/// environment: test
/// environments:
///   "7": { test: "http://127.0.0.1:8080" }
/// variables: { user: alice }
/// steps:
///   - step_no: 1
///     step_code: S1
///     step_type: http
///     request_project: 7
///     request_url: /login
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseFile {
    pub case: CaseMeta,
    #[serde(default)]
    pub environment: Option<String>,
    /// project -> environment -> base host
    #[serde(default)]
    pub environments: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub variables: Variables,
    /// Reusable cases that `quote` steps may include.
    #[serde(default)]
    pub library: Vec<CaseRecord>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub settings: Option<EngineSettings>,
}

impl CaseFile {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse case YAML")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse case JSON")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize case to YAML")
    }

    /// Display name used by the CLI filter and report file names.
    pub fn name(&self) -> &str {
        if self.case.case_name.is_empty() {
            &self.case.case_code
        } else {
            &self.case.case_name
        }
    }

    /// Host serving this file's environments and library.
    pub fn host(&self) -> InMemoryHost {
        let mut host = InMemoryHost::new();
        for (project, envs) in &self.environments {
            for (env, base) in envs {
                host = host.with_environment(project.as_str(), env.as_str(), base.as_str());
            }
        }
        for case in &self.library {
            host = host.with_case(case.clone());
        }
        host
    }

    /// Options for running this file; `base` supplies what the file omits.
    pub fn options(&self, base: &ExecuteOptions) -> ExecuteOptions {
        let mut options = base.clone();
        let mut variables = self.variables.clone();
        variables.extend(base.initial_variables.clone());
        options.initial_variables = variables;
        if options.environment.is_none() {
            options.environment = self.environment.clone();
        }
        if let Some(settings) = &self.settings {
            options.settings = settings.clone();
        }
        options
    }
}

/// Finds and loads case files.
#[derive(Debug)]
pub struct CaseConfigManager {
    pub case_paths: Vec<PathBuf>,
}

impl CaseConfigManager {
    pub fn new() -> Self {
        Self {
            case_paths: vec![PathBuf::from("cases")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.case_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single case file, choosing the parser by extension.
    pub fn load_case<P: AsRef<Path>>(&self, path: P) -> Result<CaseFile> {
        let path = path.as_ref();
        info!("Loading case from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read case file: {}", path.display()))?;

        let case = if path.extension().is_some_and(|ext| ext == "json") {
            CaseFile::from_json(&content)
        } else {
            CaseFile::from_yaml(&content)
        }
        .context(format!("Failed to parse case file {}", path.display()))?;

        debug!("Loaded case {} with {} root step(s)", case.name(), case.steps.len());
        Ok(case)
    }

    pub fn load_cases_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<CaseFile>> {
        let dir = dir.as_ref();
        info!("Loading cases from directory: {}", dir.display());

        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .context(format!("Failed to read directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_case_file(path))
            .collect();
        entries.sort();

        let mut cases = Vec::new();
        for path in entries {
            match self.load_case(&path) {
                Ok(case) => cases.push(case),
                Err(err) => debug!("Failed to load case from {}: {:#}", path.display(), err),
            }
        }

        info!("Loaded {} case(s) from {}", cases.len(), dir.display());
        Ok(cases)
    }

    pub fn load_all_cases(&self) -> Result<Vec<CaseFile>> {
        let mut all = Vec::new();
        for path in &self.case_paths {
            if path.is_dir() {
                match self.load_cases_from_dir(path) {
                    Ok(mut cases) => all.append(&mut cases),
                    Err(err) => debug!("Failed to load cases from {}: {}", path.display(), err),
                }
            }
        }
        info!("Loaded {} case(s) in total", all.len());
        Ok(all)
    }
}

impl Default for CaseConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// `.yaml`, `.yml` and `.json` files are case files.
fn is_case_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ExecutionHost;
    use serde_json::json;

    const LOGIN_YAML: &str = r#"
case:
  id: 1
  case_code: LOGIN-01
  case_name: login
environment: test
environments:
  "7":
    test: http://127.0.0.1:8080
variables:
  user: alice
library:
  - id: 42
    case_code: LIB-1
    case_type: 公共脚本
    steps:
      - step_no: 1
        step_code: L1
        step_type: wait
        wait: 0
steps:
  - step_no: 1
    step_code: S1
    step_type: HTTP请求
    request_project: 7
    request_url: /login
"#;

    #[test]
    fn test_case_file_extensions() {
        assert!(is_case_file(Path::new("a.yaml")));
        assert!(is_case_file(Path::new("dir/b.yml")));
        assert!(is_case_file(Path::new("c.json")));
        assert!(!is_case_file(Path::new("readme.md")));
        assert!(!is_case_file(Path::new("no_ext")));
    }

    #[test]
    fn test_settings_defaults() {
        let settings: EngineSettings = serde_yaml::from_str("request_timeout_secs: 5").unwrap();
        assert_eq!(settings.request_timeout_secs, 5.0);
        assert_eq!(settings.connect_timeout_secs, 10.0);
        assert_eq!(settings.max_wait_secs, 300.0);

        let settings: EngineSettings = serde_yaml::from_str("max_wait_secs: 900").unwrap();
        assert_eq!(settings.wait_limit(), MAX_WAIT_SECS);
        let settings: EngineSettings = serde_yaml::from_str("max_wait_secs: 5").unwrap();
        assert_eq!(settings.wait_limit(), 5.0);
    }

    #[test]
    fn test_parse_case_yaml() {
        let case = CaseFile::from_yaml(LOGIN_YAML).unwrap();
        assert_eq!(case.name(), "login");
        assert_eq!(case.steps[0].request_project.as_deref(), Some("7"));
        assert_eq!(case.library[0].case_type, crate::model::CaseType::Public);
    }

    #[test]
    fn test_options_merge_variables() {
        let case = CaseFile::from_yaml(LOGIN_YAML).unwrap();
        let mut base = ExecuteOptions::default();
        base.initial_variables.insert("user".into(), json!("bob"));
        let options = case.options(&base);
        assert_eq!(options.initial_variables.get("user"), Some(&json!("bob")));
        assert_eq!(options.environment.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn test_case_file_host() {
        let case = CaseFile::from_yaml(LOGIN_YAML).unwrap();
        let host = case.host();
        let base = host.environment_host("7", "test").await.unwrap();
        assert_eq!(base.as_deref(), Some("http://127.0.0.1:8080"));
        assert!(host.load_case(42).await.unwrap().is_some());
    }

    #[test]
    fn test_load_from_dir_mixed_formats() {
        let dir = tempdir_with_files(&[
            ("a.yaml", LOGIN_YAML),
            (
                "b.json",
                r#"{"case": {"case_code": "J-1", "case_name": "json case"}, "steps": []}"#,
            ),
            ("c.yaml", "case: [this is not a case"),
            ("d.md", "# notes\n"),
        ]);

        let mgr = CaseConfigManager::new();
        let cases = mgr.load_cases_from_dir(dir.path()).unwrap();
        let names: Vec<&str> = cases.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["login", "json case"]);
    }

    #[test]
    fn test_load_all_skips_missing_paths() {
        let dir = tempdir_with_files(&[("a.yml", LOGIN_YAML)]);
        let mut mgr = CaseConfigManager::new();
        mgr.add_path(dir.path()).add_path("does/not/exist");
        assert_eq!(mgr.load_all_cases().unwrap().len(), 1);
    }

    fn tempdir_with_files(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }
}
