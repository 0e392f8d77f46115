use axum::{
    extract::State,
    http::{header, StatusCode},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::process::Output;

const PAGE: &str = "<html><head><title>t</title></head><body>\
    <nav>Home About Contact</nav>\
    <p>PAGEMARK The 0.19 release of the library landed in July 2017 with a long list of changes.</p>\
    </body></html>";

#[derive(Clone)]
struct Fixture {
    addr: SocketAddr,
}

async fn llm(Json(req): Json<serde_json::Value>) -> Json<serde_json::Value> {
    let prompt = req["messages"][0]["content"].as_str().unwrap_or("");
    let text = if prompt.contains("PAGEMARK") {
        "grounded"
    } else {
        "ungrounded"
    };
    Json(serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": text}}],
        "usage": {"prompt_tokens": 40, "completion_tokens": 1}
    }))
}

async fn ddg(State(f): State<Fixture>) -> ([(header::HeaderName, &'static str); 1], String) {
    let html = format!(
        "<html><body><div class=\"result\"><a class=\"result__a\" \
         href=\"//duckduckgo.com/l/?uddg=http%3A%2F%2F{}%2Fpage&rut=x\">Page</a></div></body></html>",
        f.addr
    );
    ([(header::CONTENT_TYPE, "text/html")], html)
}

async fn start() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route(
            "/page",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], PAGE) }),
        )
        .route("/html/", get(ddg))
        .route(
            "/limited/",
            get(|| async { (StatusCode::ACCEPTED, "anomaly") }),
        )
        .route("/v1/chat/completions", post(llm))
        .with_state(Fixture { addr });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn run(addr: SocketAddr, ddg_path: &str, args: &[&str]) -> Output {
    let bin = assert_cmd::cargo::cargo_bin!("webanswer");
    let mut cmd = std::process::Command::new(bin);
    cmd.args(args)
        .env_remove("WEBANSWER_ENV_FILE")
        .env_remove("WEBANSWER_CACHE_DIR")
        .env_remove("WEBANSWER_GOOGLE_API_KEY")
        .env_remove("GOOGLE_API_KEY")
        .env("WEBANSWER_DDG_ENDPOINT", format!("http://{addr}{ddg_path}"))
        .env("WEBANSWER_SECONDARY_COOLDOWN_MS", "0")
        .env("WEBANSWER_LLM_BASE_URL", format!("http://{addr}"))
        .env("WEBANSWER_LLM_API_KEY", "sk-test")
        .env("WEBANSWER_LLM_MAX_RETRIES", "0");
    tokio::task::spawn_blocking(move || cmd.output().expect("run webanswer"))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_runs_the_whole_pipeline_offline() {
    let addr = start().await;
    let out = run(
        addr,
        "/html/",
        &["ask", "library 0.19 release date site:example.org", "--output", "json"],
    )
    .await;
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse report");
    assert_eq!(v["search_query"].as_str(), Some("library 0.19 release date"));
    assert_eq!(v["provider"].as_str(), Some("duckduckgo"));
    assert_eq!(v["urls"][0].as_str(), Some(format!("http://{addr}/page").as_str()));
    assert_eq!(v["pages"][0]["success"].as_bool(), Some(true));
    assert!(!v["pages"][0]["content"].as_str().unwrap_or("").contains("Contact"));
    assert_eq!(v["answer"]["text"].as_str(), Some("grounded"));
    assert_eq!(v["answer"]["prompt_tokens"].as_u64(), Some(40));
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_fails_with_search_stage_when_no_provider_answers() {
    let addr = start().await;
    let out = run(addr, "/limited/", &["ask", "anything"]).await;
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("search unavailable"), "stderr: {stderr}");
}

#[tokio::test(flavor = "multi_thread")]
async fn read_answers_about_one_url() {
    let addr = start().await;
    let url = format!("http://{addr}/page");
    let out = run(
        addr,
        "/html/",
        &["read", "--url", &url, "--question", "When was 0.19 released?"],
    )
    .await;
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "grounded");
}
