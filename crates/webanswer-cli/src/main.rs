use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use webanswer_core::{parse_action, SearchProvider, Synthesizer};
use webanswer_local::openai_compat::{self, OpenAiCompatClient};
use webanswer_local::pipeline::{Pipeline, PipelineConfig};
use webanswer_local::search::{DuckDuckGoSearchProvider, GoogleSearchProvider};
use webanswer_local::LocalFetcher;

mod logging;

#[derive(Parser, Debug)]
#[command(name = "webanswer")]
#[command(about = "Answer questions from live web pages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search, fetch the top results and synthesize an answer.
    Ask(AskCmd),
    /// Answer a question about a single URL.
    Read(ReadCmd),
    /// Extract one structured action from model output (json).
    ParseAction(ParseActionCmd),
    /// Report which backends are configured (json; no secrets).
    Doctor,
    /// Print version info.
    Version,
}

#[derive(clap::Args, Debug)]
struct RunOpts {
    /// Model identifier for the completion endpoint.
    #[arg(long, env = "WEBANSWER_LLM_MODEL")]
    model: Option<String>,
    /// Upper bound on the whole run, in milliseconds.
    #[arg(long)]
    deadline_ms: Option<u64>,
    /// Use the per-user cache directory when WEBANSWER_CACHE_DIR is unset.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    cache: bool,
    /// Output format: json | text
    #[arg(long, default_value = "text")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct AskCmd {
    /// Natural-language query; `site:`-style directives are stripped before searching.
    query: String,
    #[arg(long, default_value_t = 3)]
    results: usize,
    /// Concurrent page fetches.
    #[arg(long, default_value_t = 3)]
    concurrency: usize,
    #[command(flatten)]
    run: RunOpts,
}

#[derive(clap::Args, Debug)]
struct ReadCmd {
    #[arg(long)]
    url: String,
    #[arg(long)]
    question: String,
    #[command(flatten)]
    run: RunOpts,
}

#[derive(clap::Args, Debug)]
struct ParseActionCmd {
    /// Text to parse; read from stdin when absent.
    #[arg(long)]
    text: Option<String>,
}

// Optional env-file loader: fills only variables that are not already set.
fn load_env_file() {
    let Ok(p) = std::env::var("WEBANSWER_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("webanswer")
}

fn build_pipeline(run: &RunOpts, config: PipelineConfig) -> Result<Pipeline> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("webanswer/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("build http client")?;

    let secondary: Arc<dyn SearchProvider> =
        Arc::new(DuckDuckGoSearchProvider::from_env(http.clone()));
    let primary: Option<Arc<dyn SearchProvider>> = match GoogleSearchProvider::from_env(http.clone()) {
        Ok(p) => Some(Arc::new(p) as Arc<dyn SearchProvider>),
        Err(e) => {
            debug!(error = %e, "primary search provider disabled");
            None
        }
    };

    let fallback_cache = run.cache.then(default_cache_dir);
    let fetcher = Arc::new(LocalFetcher::from_env(fallback_cache)?);

    let llm = OpenAiCompatClient::from_env(http, run.model.clone())?;
    let model = llm.model().to_string();
    let synthesizer = Synthesizer::new(Arc::new(llm), model);

    Ok(Pipeline::new(secondary, primary, fetcher, synthesizer).with_config(config))
}

fn print_answer(output: &str, json: serde_json::Value, text: &str) {
    match output.to_ascii_lowercase().as_str() {
        "json" => println!("{json}"),
        _ => println!("{text}"),
    }
}

fn has_env(k: &str) -> bool {
    std::env::var(k).ok().is_some_and(|v| !v.trim().is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    logging::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ask(args) => {
            let config = PipelineConfig {
                max_results: args.results,
                fetch_concurrency: args.concurrency,
                deadline: args.run.deadline_ms.map(Duration::from_millis),
            };
            let pipeline = build_pipeline(&args.run, config)?;
            let report = pipeline.run(&args.query).await?;
            print_answer(
                &args.run.output,
                serde_json::to_value(&report)?,
                &report.answer.text,
            );
        }
        Commands::Read(args) => {
            let config = PipelineConfig {
                deadline: args.run.deadline_ms.map(Duration::from_millis),
                ..PipelineConfig::default()
            };
            let pipeline = build_pipeline(&args.run, config)?;
            let out = pipeline.answer_about_url(&args.url, &args.question).await?;
            print_answer(
                &args.run.output,
                serde_json::to_value(&out)?,
                &out.answer.text,
            );
        }
        Commands::ParseAction(args) => {
            let text = match args.text {
                Some(t) => t,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("read stdin")?;
                    buf
                }
            };
            match parse_action(&text) {
                Ok(action) => {
                    let v = serde_json::json!({
                        "ok": true,
                        "name": action.name,
                        "arguments": action.arguments,
                        "preamble": action.preamble,
                    });
                    println!("{v}");
                }
                Err(e) => {
                    let v = serde_json::json!({ "ok": false, "error": e });
                    println!("{v}");
                    std::process::exit(2);
                }
            }
        }
        Commands::Doctor => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "doctor",
                "name": "webanswer",
                "version": env!("CARGO_PKG_VERSION"),
                "configured": {
                    "search": {
                        "duckduckgo": true,
                        "google": (has_env("WEBANSWER_GOOGLE_API_KEY") || has_env("GOOGLE_API_KEY"))
                            && (has_env("WEBANSWER_GOOGLE_CSE_ID") || has_env("GOOGLE_CSE_ID")),
                    },
                    "llm": {
                        "api_key": openai_compat::llm_api_key_configured(),
                        "base_url_override": has_env("WEBANSWER_LLM_BASE_URL"),
                    },
                    "cache_dir": has_env("WEBANSWER_CACHE_DIR"),
                    "env_file": has_env("WEBANSWER_ENV_FILE"),
                },
            });
            println!("{v}");
        }
        Commands::Version => {
            println!("webanswer {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}
