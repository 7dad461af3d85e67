use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use stepcase::{
    CaseExecution, CaseFile, CaseMeta, CaseRecord, CaseRunner, CaseType, ExecuteOptions,
    InMemoryHost, StepExecutionEngine, StepRecord,
};
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));

        let app = Router::new()
            .route(
                "/login",
                post(|Json(body): Json<Value>| async move {
                    let user = body["user"].as_str().unwrap_or("nobody").to_string();
                    (
                        [(header::SET_COOKIE, "session=abc; Path=/")],
                        Json(json!({"code": 0, "data": {"token": format!("tok-{user}")}})),
                    )
                }),
            )
            .route(
                "/profile",
                get(|headers: HeaderMap| async move {
                    let auth = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok());
                    if auth == Some("Bearer tok-ann") {
                        (
                            StatusCode::OK,
                            Json(json!({"data": {"name": "ann", "roles": ["admin", "dev"]}})),
                        )
                    } else {
                        (
                            StatusCode::UNAUTHORIZED,
                            Json(json!({"error": "unauthorized"})),
                        )
                    }
                }),
            )
            .route(
                "/cookie-echo",
                get(|headers: HeaderMap| async move {
                    let cookie = headers
                        .get(header::COOKIE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    Json(json!({"cookie": cookie}))
                }),
            )
            .route(
                "/empty-data",
                get(|| async move { Json(json!({"data": {}})) }),
            )
            .route(
                "/missing",
                get(|| async move {
                    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
                }),
            )
            .route(
                "/tick",
                get(move || {
                    let ticks = ticks.clone();
                    async move {
                        let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                        Json(json!({"n": n}))
                    }
                }),
            )
            .route(
                "/catalog.xml",
                get(|| async move {
                    (
                        [(header::CONTENT_TYPE, "application/xml")],
                        r#"<catalog><book id="b1"><title>Rust</title></book><book id="b2"><title>Tokio</title></book></catalog>"#,
                    )
                }),
            );

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn load_case(path: &str, base_url: &str) -> CaseFile {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let case_path = manifest_dir.join("tests/fixtures").join(path);
    let content = fs::read_to_string(&case_path)
        .unwrap_or_else(|e| panic!("failed to read {case_path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);
    CaseFile::from_yaml(&content).unwrap_or_else(|e| panic!("failed to parse case yaml: {e}"))
}

fn case_meta(id: i64, code: &str) -> CaseMeta {
    CaseMeta {
        id: Some(id),
        case_code: code.to_string(),
        case_name: code.to_lowercase(),
    }
}

fn steps(value: Value) -> Vec<StepRecord> {
    serde_json::from_value(value).expect("valid step records")
}

async fn run_case(file: &CaseFile) -> (CaseExecution, Arc<InMemoryHost>) {
    let host = Arc::new(file.host());
    let engine = StepExecutionEngine::with_host(host.clone());
    let options = file.options(&ExecuteOptions::default());
    let run = engine
        .execute(&file.case, &file.steps, &options)
        .await
        .expect("engine returned error");
    (run, host)
}

async fn run_steps(host: InMemoryHost, tree: Value) -> (CaseExecution, Arc<InMemoryHost>) {
    let host = Arc::new(host);
    let engine = StepExecutionEngine::with_host(host.clone());
    let options = ExecuteOptions {
        environment: Some("test".into()),
        ..Default::default()
    };
    let run = engine
        .execute(&case_meta(1, "INLINE"), &steps(tree), &options)
        .await
        .expect("engine returned error");
    (run, host)
}

#[tokio::test]
async fn login_flow_extracts_token_and_reuses_it() {
    let server = TestServer::spawn().await;
    let file = load_case("login_flow.yaml", &server.base_url);

    let (run, host) = run_case(&file).await;

    assert!(run.success, "case should pass: {:#?}", run.results);
    assert_eq!(run.session_variables["token"], json!("tok-ann"));
    assert_eq!(run.session_variables["sid"], json!("abc"));
    assert_eq!(run.session_variables["greeting"], json!("hello tok-ann"));
    assert_eq!(run.results[1].assert_validators.len(), 3);
    assert_eq!(run.statistics.total_steps, 4);
    assert_eq!(run.statistics.pass_ratio, 100.0);

    let details = host.details();
    assert_eq!(details.len(), 4);
    assert_eq!(details[0].step_code, "LOGIN");
    assert_eq!(details[0].response_body["data"]["token"], json!("tok-ann"));
    assert_eq!(details[0].response_cookie.as_deref(), Some(r#"{"session":"abc"}"#));
    assert_eq!(host.case_state(100), Some(true));
    assert_eq!(host.report_updates()[0].step_pass_count, 4);

    server.shutdown().await;
}

#[tokio::test]
async fn missing_json_key_names_the_path() {
    let server = TestServer::spawn().await;
    let (run, _) = run_steps(
        InMemoryHost::new(),
        json!([{
            "step_no": 1, "step_code": "TOKEN", "step_type": "http",
            "request_url": format!("{}/empty-data", server.base_url),
            "extract_variables": [{"name": "token", "expr": "$.data.token"}]
        }]),
    )
    .await;

    assert!(!run.success);
    let error = run.results[0].error.as_deref().unwrap();
    assert!(error.contains("$.data.token"), "{error}");
    assert!(error.contains("'token'"), "{error}");
    assert!(!run.session_variables.contains_key("token"));

    server.shutdown().await;
}

#[tokio::test]
async fn assertion_ledger_lists_every_rule() {
    let server = TestServer::spawn().await;
    let (run, _) = run_steps(
        InMemoryHost::new(),
        json!([{
            "step_no": 1, "step_code": "PROFILE", "step_type": "http",
            "request_url": format!("{}/profile", server.base_url),
            "assert_validators": [
                {"name": "error text", "expr": "$.error", "operation": "eq", "except_value": "unauthorized"},
                {"name": "name", "expr": "$.data.name", "operation": "eq", "except_value": "ann"},
                {"name": "wrong text", "expr": "$.error", "operation": "eq", "except_value": "nope"}
            ]
        }]),
    )
    .await;

    let result = &run.results[0];
    assert!(!result.success);
    let ledger: Vec<(&str, bool)> = result
        .assert_validators
        .iter()
        .map(|a| (a.name.as_str(), a.success))
        .collect();
    assert_eq!(
        ledger,
        vec![("error text", true), ("name", false), ("wrong text", false)]
    );
    assert_eq!(result.assert_validators[2].actual_value, json!("unauthorized"));
    assert!(result.error.as_deref().unwrap().starts_with("2 check(s) failed"));

    server.shutdown().await;
}

#[tokio::test]
async fn error_status_is_a_normal_response() {
    let server = TestServer::spawn().await;
    let (run, _) = run_steps(
        InMemoryHost::new().with_environment("7", "test", server.base_url.clone()),
        json!([{
            "step_no": 1, "step_code": "MISSING", "step_type": "http",
            "request_project": "7", "request_url": "missing"
        }]),
    )
    .await;

    assert!(run.success, "{:?}", run.results[0].error);
    assert_eq!(run.results[0].response.as_ref().unwrap()["status_code"], json!(404));

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_environment_is_a_configuration_error() {
    let (run, _) = run_steps(
        InMemoryHost::new(),
        json!([{
            "step_no": 1, "step_code": "REL", "step_type": "http",
            "request_project": 7, "request_url": "/profile"
        }]),
    )
    .await;

    assert!(!run.success);
    let error = run.results[0].error.as_deref().unwrap();
    assert!(error.starts_with("configuration error"), "{error}");
}

#[tokio::test]
async fn condition_loop_polls_until_ready_and_reads_xml() {
    let server = TestServer::spawn().await;
    let file = load_case("polling.yaml", &server.base_url);

    let (run, host) = run_case(&file).await;

    assert!(run.success, "case should pass: {:#?}", run.results);
    let poll = &run.results[0];
    let iterations: Vec<u32> = poll.children.iter().map(|c| c.iteration).collect();
    assert_eq!(iterations, vec![1, 2, 3]);
    assert_eq!(run.session_variables["ticks"], json!(3));
    assert_eq!(run.session_variables["second_title"], json!("Tokio"));
    assert_eq!(run.session_variables["ids"], json!(["b1", "b2"]));
    assert_eq!(run.session_variables["first_id"], json!("b1"));

    let cycles: Vec<u32> = host
        .details()
        .iter()
        .filter(|d| d.step_code == "TICK")
        .map(|d| d.num_cycles)
        .collect();
    assert_eq!(cycles, vec![1, 2, 3]);
    // POLL, TICK, CATALOG
    assert_eq!(run.statistics.total_steps, 3);

    server.shutdown().await;
}

#[tokio::test]
async fn count_loop_break_reports_two_iterations() {
    let (run, _) = run_steps(
        InMemoryHost::new(),
        json!([{
            "step_no": 1, "step_code": "LOOP", "step_type": "loop",
            "loop_mode": "count", "loop_on_error": "中断循环", "loop_maximums": 3,
            "children": [{
                "step_no": 1, "step_code": "BODY", "step_type": "script",
                "code": "let n = (session_variables.n ?? 0) + 1; if n == 2 { throw \"second\"; } #{n: n}"
            }]
        }]),
    )
    .await;

    assert!(!run.success);
    let lp = &run.results[0];
    assert!(!lp.success);
    let iterations: Vec<u32> = lp.children.iter().map(|c| c.iteration).collect();
    assert_eq!(iterations, vec![1, 2]);
    // BODY's last run failed, so it counts as failed.
    assert_eq!(run.statistics.total_steps, 2);
    assert_eq!(run.statistics.failed_steps, 2);
}

#[tokio::test]
async fn stop_strategy_aborts_remaining_roots() {
    let (run, host) = run_steps(
        InMemoryHost::new(),
        json!([
            {
                "step_no": 1, "step_code": "LOOP", "step_type": "loop",
                "loop_mode": "count", "loop_on_error": "stop", "loop_maximums": 3,
                "children": [{"step_no": 1, "step_code": "BAD", "step_type": "script", "code": "throw \"fatal\";"}]
            },
            {"step_no": 2, "step_code": "NEVER", "step_type": "script", "code": "#{ran: true}"}
        ]),
    )
    .await;

    assert!(!run.success);
    assert_eq!(run.results.len(), 1);
    assert!(run.results[0].aborted);
    assert!(!run.session_variables.contains_key("ran"));
    assert!(host.details().iter().all(|d| d.step_code != "NEVER"));
    assert_eq!(host.report_updates().len(), 1);
}

#[tokio::test]
async fn included_cases_follow_visibility_rules() {
    let server = TestServer::spawn().await;
    let public = CaseRecord {
        meta: case_meta(10, "LOGIN-LIB"),
        case_type: CaseType::Public,
        steps: steps(json!([{
            "step_no": 1, "step_code": "LIB-LOGIN", "step_type": "http",
            "request_url": format!("{}/login", server.base_url), "request_method": "POST",
            "request_body": {"user": "lib"},
            "extract_variables": [{"name": "lib_token", "expr": "$.data.token"}]
        }])),
    };
    let empty = CaseRecord {
        meta: case_meta(11, "EMPTY-LIB"),
        case_type: CaseType::Public,
        steps: vec![],
    };
    let private = CaseRecord {
        meta: case_meta(12, "PRIVATE"),
        case_type: CaseType::Private,
        steps: steps(json!([{"step_no": 1, "step_code": "P", "step_type": "wait", "wait": 0}])),
    };
    let host = InMemoryHost::new()
        .with_case(public)
        .with_case(empty)
        .with_case(private);

    let (run, _) = run_steps(
        host,
        json!([
            {"step_no": 1, "step_code": "INC-PUBLIC", "step_type": "quote", "quote_case_id": 10},
            {"step_no": 2, "step_code": "INC-EMPTY", "step_type": "quote", "quote_case_id": 11},
            {"step_no": 3, "step_code": "INC-PRIVATE", "step_type": "quote", "quote_case_id": 12}
        ]),
    )
    .await;

    assert!(run.results[0].success, "{:?}", run.results[0].error);
    assert_eq!(run.session_variables["lib_token"], json!("tok-lib"));
    assert!(run.results[1].success);
    assert!(run.results[1].children.is_empty());
    assert!(!run.results[2].success);
    assert!(run.results[2].error.as_deref().unwrap().contains("private"));
    assert!(!run.success);

    server.shutdown().await;
}

#[tokio::test]
async fn detail_write_failures_do_not_change_outcomes() {
    let (run, host) = run_steps(
        InMemoryHost::new().fail_details(true),
        json!([{"step_no": 1, "step_code": "OK", "step_type": "script", "code": "#{ok: true}"}]),
    )
    .await;

    assert!(run.success);
    assert!(host.details().is_empty());
    assert!(run.logs["OK"]
        .iter()
        .any(|l| l.contains("failed to save step detail")));
}
