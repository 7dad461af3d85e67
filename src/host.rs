//! Narrow capabilities the engine needs from its hosting application:
//! environment hosts, report and detail persistence, and access to
//! other cases for inclusion.

use crate::model::{CaseRecord, DetailRecord, ReportCreate, ReportUpdate};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Host-side collaborator of a case run.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    /// Base host (scheme + authority, optional path prefix) configured for
    /// `project` in `environment`.
    async fn environment_host(&self, project: &str, environment: &str) -> Result<Option<String>>;

    /// Open a report record and return its code.
    async fn create_report(&self, report: &ReportCreate) -> Result<String>;

    async fn update_report(&self, update: &ReportUpdate) -> Result<()>;

    async fn create_detail(&self, detail: &DetailRecord) -> Result<()>;

    /// Load a case for inclusion by another case.
    async fn load_case(&self, case_id: i64) -> Result<Option<CaseRecord>>;

    /// Record the pass/fail state of a case's latest run.
    async fn update_case_state(&self, case_id: i64, passed: bool) -> Result<()>;
}

/// Host backed by in-process maps. Used by the CLI and by tests.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    environments: HashMap<(String, String), String>,
    cases: HashMap<i64, CaseRecord>,
    reports: Mutex<Vec<(String, ReportCreate)>>,
    report_updates: Mutex<Vec<ReportUpdate>>,
    details: Mutex<Vec<DetailRecord>>,
    case_states: Mutex<HashMap<i64, bool>>,
    report_seq: AtomicU64,
    fail_details: AtomicBool,
    fail_reports: AtomicBool,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environment(
        mut self,
        project: impl Into<String>,
        environment: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        self.environments
            .insert((project.into(), environment.into()), host.into());
        self
    }

    pub fn with_case(mut self, case: CaseRecord) -> Self {
        if let Some(id) = case.meta.id {
            self.cases.insert(id, case);
        }
        self
    }

    /// Make every `create_detail` call fail.
    pub fn fail_details(self, fail: bool) -> Self {
        self.fail_details.store(fail, Ordering::SeqCst);
        self
    }

    /// Make every `create_report` call fail.
    pub fn fail_reports(self, fail: bool) -> Self {
        self.fail_reports.store(fail, Ordering::SeqCst);
        self
    }

    pub fn details(&self) -> Vec<DetailRecord> {
        self.details.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn reports(&self) -> Vec<(String, ReportCreate)> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn report_updates(&self) -> Vec<ReportUpdate> {
        self.report_updates
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn case_state(&self, case_id: i64) -> Option<bool> {
        self.case_states
            .lock()
            .ok()
            .and_then(|s| s.get(&case_id).copied())
    }
}

#[async_trait]
impl ExecutionHost for InMemoryHost {
    async fn environment_host(&self, project: &str, environment: &str) -> Result<Option<String>> {
        Ok(self
            .environments
            .get(&(project.to_string(), environment.to_string()))
            .cloned())
    }

    async fn create_report(&self, report: &ReportCreate) -> Result<String> {
        if self.fail_reports.load(Ordering::SeqCst) {
            bail!("report store unavailable");
        }
        let seq = self.report_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let code = format!("RPT-{}-{seq:04}", report.case_code);
        let mut reports = self
            .reports
            .lock()
            .map_err(|_| anyhow::anyhow!("report store poisoned"))?;
        reports.push((code.clone(), report.clone()));
        Ok(code)
    }

    async fn update_report(&self, update: &ReportUpdate) -> Result<()> {
        let mut updates = self
            .report_updates
            .lock()
            .map_err(|_| anyhow::anyhow!("report store poisoned"))?;
        updates.push(update.clone());
        Ok(())
    }

    async fn create_detail(&self, detail: &DetailRecord) -> Result<()> {
        if self.fail_details.load(Ordering::SeqCst) {
            bail!("detail store unavailable");
        }
        let mut details = self
            .details
            .lock()
            .map_err(|_| anyhow::anyhow!("detail store poisoned"))?;
        details.push(detail.clone());
        Ok(())
    }

    async fn load_case(&self, case_id: i64) -> Result<Option<CaseRecord>> {
        Ok(self.cases.get(&case_id).cloned())
    }

    async fn update_case_state(&self, case_id: i64, passed: bool) -> Result<()> {
        let mut states = self
            .case_states
            .lock()
            .map_err(|_| anyhow::anyhow!("case store poisoned"))?;
        states.insert(case_id, passed);
        Ok(())
    }
}
