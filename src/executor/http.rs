use super::{value_pairs, StepExecutor};
use crate::context::{ExecutionContext, HttpRequest, RequestBody};
use crate::error::StepError;
use crate::extract::{run_checks, ExtractionInput};
use crate::model::{AssertRule, ExtractRule, StepExecutionResult, StepRecord};
use crate::placeholder::display_value;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

/// Sends one HTTP request and runs the step's extraction and assertion
/// rules against the response.
pub struct HttpExecutor<'a> {
    step: &'a StepRecord,
}

impl<'a> HttpExecutor<'a> {
    pub fn new(step: &'a StepRecord) -> Self {
        Self { step }
    }

    fn method(&self) -> Result<Method, StepError> {
        let raw = self
            .step
            .request_method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("GET")
            .to_ascii_uppercase();
        Method::from_bytes(raw.as_bytes())
            .map_err(|_| StepError::config(format!("invalid HTTP method '{raw}'")))
    }

    /// Absolute URL of the request. Relative paths are joined to the host
    /// configured for the step's project in the run's environment.
    async fn url(&self, ctx: &mut ExecutionContext) -> Result<String, StepError> {
        let raw = self
            .step
            .request_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| StepError::config("HTTP step has no request_url"))?;
        let url = ctx.resolve_str(raw);

        let full = if is_absolute(&url) {
            url
        } else {
            let project = self.step.request_project.as_deref().ok_or_else(|| {
                StepError::config(format!(
                    "relative URL '{url}' needs a request_project to find its host"
                ))
            })?;
            let environment = ctx.environment().map(str::to_string).ok_or_else(|| {
                StepError::config(format!(
                    "relative URL '{url}' needs an environment to find its host"
                ))
            })?;
            let host = ctx
                .host()
                .environment_host(project, &environment)
                .await
                .map_err(|e| {
                    StepError::Execution(format!("failed to look up environment host: {e:#}"))
                })?
                .filter(|h| !h.trim().is_empty())
                .ok_or_else(|| {
                    StepError::config(format!(
                        "no host configured for project {project} in environment '{environment}'"
                    ))
                })?;
            format!(
                "{}/{}",
                host.trim().trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        };

        let parsed = Url::parse(&full)
            .map_err(|e| StepError::config(format!("invalid request URL '{full}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StepError::config(format!(
                "request URL '{full}' must use http or https"
            )));
        }
        Ok(full)
    }

    fn resolved(ctx: &mut ExecutionContext, field: &Option<Value>) -> Option<Value> {
        field
            .as_ref()
            .filter(|v| !v.is_null())
            .map(|v| ctx.resolve_value(v))
    }

    /// Body precedence: JSON, raw text, multipart form, urlencoded form.
    fn body(&self, ctx: &mut ExecutionContext) -> Result<RequestBody, StepError> {
        if let Some(json) = Self::resolved(ctx, &self.step.request_body) {
            return Ok(RequestBody::Json(json));
        }
        if let Some(text) = self.step.request_text.as_deref().filter(|t| !t.is_empty()) {
            return Ok(RequestBody::Text(ctx.resolve_str(text)));
        }
        if let Some(form) = Self::resolved(ctx, &self.step.request_form_data) {
            return Ok(RequestBody::Multipart(value_pairs(&form, "request_form_data")?));
        }
        if let Some(form) = Self::resolved(ctx, &self.step.request_form_urlencoded) {
            return Ok(RequestBody::Form(value_pairs(&form, "request_form_urlencoded")?));
        }
        Ok(RequestBody::Empty)
    }

    async fn request(&self, ctx: &mut ExecutionContext) -> Result<HttpRequest, StepError> {
        if let Some(port) = self.step.request_port {
            return Err(StepError::config(format!(
                "request_port {port} is set but raw TCP requests are not supported"
            )));
        }
        let method = self.method()?;
        let url = self.url(ctx).await?;
        let mut request = HttpRequest::new(method, url);
        if let Some(headers) = Self::resolved(ctx, &self.step.request_header) {
            request.headers = value_pairs(&headers, "request_header")?;
        }
        if let Some(params) = Self::resolved(ctx, &self.step.request_params) {
            request.params = value_pairs(&params, "request_params")?;
        }
        request.body = self.body(ctx)?;
        Ok(request)
    }
}

/// Resolve placeholders in rule expressions and expected values.
pub(crate) fn resolve_rules(
    ctx: &mut ExecutionContext,
    step: &StepRecord,
) -> Result<(Vec<ExtractRule>, Vec<AssertRule>), StepError> {
    let mut extracts = step.extract_rules()?;
    for rule in &mut extracts {
        rule.expr = rule.expr.as_deref().map(|e| ctx.resolve_str(e));
    }
    let mut asserts = step.assert_rules()?;
    for rule in &mut asserts {
        rule.expr = rule.expr.as_deref().map(|e| ctx.resolve_str(e));
        rule.except_value = ctx.resolve_value(&rule.except_value);
    }
    Ok((extracts, asserts))
}

/// `http://` or `https://`, in any letter case.
fn is_absolute(url: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        url.get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

#[async_trait]
impl StepExecutor for HttpExecutor<'_> {
    fn step(&self) -> &StepRecord {
        self.step
    }

    #[instrument(skip_all, fields(step = %self.step.key()))]
    async fn do_execute(
        &self,
        ctx: &mut ExecutionContext,
        result: &mut StepExecutionResult,
    ) -> Result<(), StepError> {
        let request = self.request(ctx).await?;
        let (extracts, asserts) = resolve_rules(ctx, self.step)?;

        let response = ctx.send_http(request).await?;
        ctx.log(format!(
            "response: {} {} in {:.3} s",
            response.status_code,
            response.reason.as_deref().unwrap_or(""),
            response.elapsed
        ));
        debug!(status = response.status_code, "received response");
        result.message = Some(format!("HTTP {}", response.status_code));
        result.response = serde_json::to_value(&response).ok();

        let json = response.json();
        let variables = ctx.snapshot();
        let input = ExtractionInput {
            json: json.as_ref(),
            text: &response.text,
            headers: &response.headers,
            cookies: &response.cookies,
            variables: &variables,
        };
        let checked = run_checks(&extracts, &asserts, &input, result);
        for (name, value) in &result.extract_variables {
            ctx.log(format!("extracted {name} = {}", display_value(value)));
        }
        checked
    }
}
