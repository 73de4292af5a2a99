use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use ragdesk::api::{Answer, ApiClient, ApiError, ParserType};
use ragdesk::catalog::Catalog;
use ragdesk::lifecycle::{Controller, LifecycleError, ModelStatus, StatusChange};
use ragdesk::resolver::{Level, Resolver};
use ragdesk::session::{Action, Session};

const POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Backend {
    installed: HashSet<String>,
    /// model → status checks left until the pull finishes
    pulling: HashMap<String, usize>,
    checks: usize,
    pulls: usize,
    cancels: usize,
    /// pull progress streams the client still holds open
    open_streams: usize,
    fail_delete: bool,
    queries: Vec<Value>,
    uploads: Vec<HashMap<String, String>>,
}

type Shared = Arc<Mutex<Backend>>;

fn model_param(params: &HashMap<String, String>) -> String {
    params.get("model").cloned().unwrap_or_default()
}

async fn check_model(State(b): State<Shared>, Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let model = model_param(&params);
    let mut b = b.lock().unwrap();
    b.checks += 1;
    let finished = match b.pulling.get_mut(&model) {
        Some(left) => {
            *left = left.saturating_sub(1);
            *left == 0
        }
        None => false,
    };
    if finished {
        b.pulling.remove(&model);
        b.installed.insert(model.clone());
    }
    Json(json!({ "installed": b.installed.contains(&model) }))
}

/// Counts an open progress stream until the server drops the body.
struct StreamGuard(Shared);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).open_streams -= 1;
    }
}

async fn pull_model(State(shared): State<Shared>, Query(params): Query<HashMap<String, String>>) -> Response {
    let model = model_param(&params);
    let mut b = shared.lock().unwrap();
    b.pulls += 1;
    if !model.contains("huge") {
        b.pulling.insert(model.clone(), 2);
        return format!("pulling manifest\ndownloading {model}\n").into_response();
    }

    // huge models stream progress until the client hangs up
    b.pulling.insert(model, usize::MAX);
    b.open_streams += 1;
    drop(b);
    let progress = futures_util::stream::unfold(StreamGuard(shared), |guard| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Some((Ok::<_, Infallible>("downloading\n"), guard))
    });
    Body::from_stream(progress).into_response()
}

async fn cancel_pull(State(b): State<Shared>, Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let model = model_param(&params);
    let mut b = b.lock().unwrap();
    b.cancels += 1;
    b.pulling.remove(&model);
    Json(json!({ "message": format!("Pull for model {model} canceled.") }))
}

async fn delete_model(State(b): State<Shared>, Query(params): Query<HashMap<String, String>>) -> Response {
    let model = model_param(&params);
    let mut b = b.lock().unwrap();
    if b.fail_delete {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "model is in use" })),
        )
            .into_response();
    }
    b.installed.remove(&model);
    Json(json!({ "message": format!("Model {model} deleted successfully.") })).into_response()
}

async fn query(State(b): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let text = body["query"].as_str().unwrap_or_default().to_string();
    b.lock().unwrap().queries.push(body);
    if text.contains("chart") {
        Json(json!({ "response": { "chart_type": "bar", "chart_image_path": "charts/q3.png" } }))
    } else {
        Json(json!({ "response": format!("answer to: {text}") }))
    }
}

async fn add(State(b): State<Shared>, mut multipart: Multipart) -> Json<Value> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(String::from);
        let data = field.bytes().await.unwrap();
        match file_name {
            Some(file_name) => {
                fields.insert(format!("{name}.filename"), file_name);
                fields.insert(format!("{name}.size"), data.len().to_string());
            }
            None => {
                fields.insert(name, String::from_utf8_lossy(&data).to_string());
            }
        }
    }
    b.lock().unwrap().uploads.push(fields);
    Json(json!({ "message": "File uploaded successfully." }))
}

async fn spawn_backend() -> (String, Shared) {
    let state: Shared = Arc::default();
    let app = Router::new()
        .route("/api/check-model", get(check_model))
        .route("/api/pull-model", post(pull_model))
        .route("/api/cancel-pull", post(cancel_pull))
        .route("/api/delete-model", post(delete_model))
        .route("/query", post(query))
        .route("/add", post(add))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn client(url: &str) -> Arc<ApiClient> {
    Arc::new(ApiClient::new(url, Duration::from_secs(5)).unwrap())
}

fn session(url: &str) -> Session {
    let api = client(url);
    let controller = Controller::new(api.clone(), POLL);
    let catalog = Arc::new(Catalog::builtin().unwrap());
    Session::new(Resolver::new(catalog), controller, api)
}

async fn wait_for(
    events: &mut tokio::sync::broadcast::Receiver<StatusChange>,
    model: &str,
    status: ModelStatus,
) -> StatusChange {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let change = events.recv().await.unwrap();
            if change.model == model && change.status == status {
                return change;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{model} never reached {status}"))
}

#[tokio::test]
async fn test_pull_until_installed() {
    let (url, backend) = spawn_backend().await;
    let controller = Controller::new(client(&url), POLL);
    let mut events = controller.subscribe();

    assert_eq!(
        controller.check_status("Gemma 2 - 2B").await.unwrap(),
        ModelStatus::AwaitingUserConfirmation
    );
    controller.confirm_pull("Gemma 2 - 2B").unwrap();
    wait_for(&mut events, "Gemma 2 - 2B", ModelStatus::Downloaded).await;

    assert_eq!(controller.active_polls(), 0);
    let b = backend.lock().unwrap();
    assert_eq!(b.pulls, 1);
    assert!(b.installed.contains("Gemma 2 - 2B"));
}

#[tokio::test]
async fn test_cancel_stops_polling() {
    let (url, backend) = spawn_backend().await;
    let controller = Controller::new(client(&url), POLL);

    controller.check_status("huge-model").await.unwrap();
    controller.confirm_pull("huge-model").unwrap();
    tokio::time::sleep(POLL * 3).await;

    assert_eq!(controller.cancel_pull("huge-model").await.unwrap(), ModelStatus::Idle);
    assert_eq!(controller.active_polls(), 0);
    // let a request that was already on the wire land
    tokio::time::sleep(Duration::from_millis(20)).await;
    let checks = backend.lock().unwrap().checks;

    tokio::time::sleep(POLL * 6).await;
    let b = backend.lock().unwrap();
    assert_eq!(b.checks, checks, "no status check after cancel");
    assert_eq!(b.cancels, 1);
    assert!(!b.pulling.contains_key("huge-model"));
}

async fn settle(mut done: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_cancel_and_shutdown_close_pull_streams() {
    let (url, backend) = spawn_backend().await;
    let controller = Controller::new(client(&url), POLL);
    for model in ["huge-a", "huge-b"] {
        controller.check_status(model).await.unwrap();
        controller.confirm_pull(model).unwrap();
    }
    settle(|| backend.lock().unwrap().open_streams == 2, "both pull streams").await;

    controller.cancel_pull("huge-a").await.unwrap();
    settle(|| backend.lock().unwrap().open_streams == 1, "stream of huge-a to close").await;
    assert_eq!(controller.status("huge-b"), ModelStatus::Downloading);

    drop(controller);
    settle(|| backend.lock().unwrap().open_streams == 0, "stream of huge-b to close").await;
}

#[tokio::test]
async fn test_delete_reports_backend_detail() {
    let (url, backend) = spawn_backend().await;
    backend.lock().unwrap().installed.insert("Phi-3 - 3B".into());
    backend.lock().unwrap().fail_delete = true;
    let controller = Controller::new(client(&url), POLL);

    assert_eq!(controller.check_status("Phi-3 - 3B").await.unwrap(), ModelStatus::Downloaded);
    let err = controller.delete_model("Phi-3 - 3B").await.unwrap_err();
    assert!(err.to_string().contains("model is in use"), "{err}");
    assert_eq!(controller.status("Phi-3 - 3B"), ModelStatus::Downloaded);

    backend.lock().unwrap().fail_delete = false;
    assert_eq!(controller.delete_model("Phi-3 - 3B").await.unwrap(), ModelStatus::Idle);
    assert!(backend.lock().unwrap().installed.is_empty());
}

#[tokio::test]
async fn test_unreachable_backend() {
    // Nothing listens on the discard port
    let controller = Controller::new(client("http://127.0.0.1:9"), POLL);
    let err = controller.check_status("m").await.unwrap_err();
    assert!(matches!(err, LifecycleError::Remote(ApiError::RemoteUnavailable(_))));
    assert_eq!(controller.status("m"), ModelStatus::Error);
}

#[tokio::test]
async fn test_query_carries_resolved_selection() {
    let (url, backend) = spawn_backend().await;
    let mut s = session(&url);

    let select = |level: Level, value: &str| Action::Select { level, value: value.to_string() };
    s.dispatch(select(Level::LlmProvider, "groq")).await.unwrap();
    s.dispatch(select(Level::EmbeddingCategory, "llm_based")).await.unwrap();
    s.dispatch(select(Level::EmbeddingSubcategory, "openai")).await.unwrap();
    s.dispatch(select(Level::VectorDb, "qdrant")).await.unwrap();
    s.dispatch(select(Level::VectorDbParam("mode".into()), "memory")).await.unwrap();
    s.dispatch(select(Level::VectorDb, "pinecone")).await.unwrap();
    s.dispatch(Action::SetFile(PathBuf::from("/tmp/Annual Report.pdf"))).await.unwrap();

    let answer = s.ask("what changed?").await.unwrap();
    assert_eq!(answer, Answer::Text("answer to: what changed?".into()));

    let sent = backend.lock().unwrap().queries.pop().unwrap();
    assert_eq!(sent["provider"], "groq");
    assert_eq!(sent["model"], "gemma-7b-it");
    assert_eq!(sent["embedding_provider"], "openai");
    assert_eq!(sent["embedding_model"], "text-embedding-ada-002");
    assert_eq!(sent["db_type"], "pinecone");
    assert_eq!(sent["db_config"], json!({ "environment": "us-east-1" }));
    assert_eq!(sent["db_filename"], "Annual_Report.pdf");
    assert_eq!(sent["top_k"], 3);
}

#[tokio::test]
async fn test_summarize_and_chart_answers() {
    let (url, backend) = spawn_backend().await;
    let mut s = session(&url);
    s.dispatch(Action::SetFile(PathBuf::from("q3.pdf"))).await.unwrap();

    s.summarize().await.unwrap();
    assert_eq!(
        backend.lock().unwrap().queries[0]["query"],
        "Please summarize the entire document."
    );

    let Answer::Chart { chart_type, image_path } = s.ask("draw a chart of revenue").await.unwrap() else {
        panic!("expected a chart");
    };
    assert_eq!(chart_type, "bar");
    assert_eq!(
        s.api().static_url(&image_path).unwrap().as_str(),
        format!("{url}/static/charts/q3.png")
    );
}

#[tokio::test]
async fn test_upload_multipart_fields() {
    let (url, backend) = spawn_backend().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let file = tmp.path().join("Q3 report.pdf");
    std::fs::write(&file, b"%PDF-1.4 fake").unwrap();

    let mut s = session(&url);
    let select = |level: Level, value: &str| Action::Select { level, value: value.to_string() };
    s.dispatch(select(Level::EmbeddingCategory, "classic")).await.unwrap();
    s.dispatch(select(Level::EmbeddingSubcategory, "bert")).await.unwrap();
    s.dispatch(select(Level::VectorDb, "milvus")).await.unwrap();
    s.dispatch(Action::SetFile(file)).await.unwrap();

    let message = s.upload(ParserType::Llama).await.unwrap();
    assert_eq!(message, "File uploaded successfully.");

    let fields = backend.lock().unwrap().uploads.pop().unwrap();
    assert_eq!(fields["pdf.filename"], "Q3 report.pdf");
    assert_eq!(fields["pdf.size"], "13");
    assert_eq!(fields["embedding_provider"], "bert");
    assert_eq!(fields["embedding_model"], "bert-base-uncased");
    assert_eq!(fields["parser_type"], "LlamaParser");
    assert_eq!(fields["db_type"], "milvus");
    let db_config: Value = serde_json::from_str(&fields["db_config"]).unwrap();
    assert_eq!(db_config, json!({ "mode": "local" }));
}

#[tokio::test]
async fn test_session_pull_flow() {
    let (url, backend) = spawn_backend().await;
    backend.lock().unwrap().installed.insert("Llama 3.1 - 70B".into());
    let mut s = session(&url);
    let mut events = s.subscribe();

    s.dispatch(Action::Select { level: Level::LlmProvider, value: "ollama".into() })
        .await
        .unwrap();
    assert_eq!(s.model_status(), Some(ModelStatus::AwaitingUserConfirmation));
    s.dispatch(Action::ConfirmPull(true)).await.unwrap();

    // switching to an installed model leaves the download running
    s.dispatch(Action::Select { level: Level::LlmModel, value: "Llama 3.1 - 70B".into() })
        .await
        .unwrap();
    assert_eq!(s.model_status(), Some(ModelStatus::Downloaded));

    wait_for(&mut events, "Llama 3.1 - 8B", ModelStatus::Downloaded).await;
    assert_eq!(s.controller().active_polls(), 0);
    s.shutdown();
}
