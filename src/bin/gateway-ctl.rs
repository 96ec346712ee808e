//! Management client for a running kdeps gateway.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;

use kdeps_gateway::config::schema::MANAGEMENT_TOKEN_ENV;
use kdeps_gateway::http::management::MANAGEMENT_PREFIX;
use kdeps_gateway::http::server::DEFAULT_WORKFLOW_FILE;
use kdeps_gateway::workflow::{WorkflowParser, YamlWorkflowParser};

const PUSH_TIMEOUT: Duration = Duration::from_secs(30);
const PACKAGE_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

#[derive(Parser)]
#[command(name = "gateway-ctl")]
#[command(about = "Management CLI for the kdeps gateway", long_about = None)]
struct Cli {
    /// Gateway base URL
    #[arg(short, long, env = "KDEPS_GATEWAY_URL", default_value = "http://localhost:16395")]
    url: String,

    /// Management bearer token
    #[arg(short, long, env = MANAGEMENT_TOKEN_ENV, hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the workflow currently served
    Status,
    /// Push a workflow file (or a directory holding workflow.yaml) and reload
    PushWorkflow { path: PathBuf },
    /// Push a .kdeps package, extract it over the workflow directory and reload
    PushPackage { path: PathBuf },
    /// Reload the workflow from disk
    Reload,
}

#[derive(Debug, thiserror::Error)]
enum CtlError {
    #[error("push rejected: invalid or missing management token (use --token or set KDEPS_MANAGEMENT_TOKEN)")]
    Unauthorized,
    #[error("push rejected: management API is disabled on the server (set KDEPS_MANAGEMENT_TOKEN on the server to enable)")]
    Disabled,
    #[error("server error ({0}): {1}")]
    Server(u16, String),
    #[error("failed to connect to {0}: {1}")]
    Connect(String, #[source] reqwest::Error),
    #[error("unexpected response from server: {0}")]
    Unexpected(String),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let target = normalize_target(&cli.url);
    let client = Client {
        http: reqwest::Client::new(),
        target,
        token: cli
            .token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
    };

    match cli.command {
        Commands::Status => {
            let body = client.call(Method::GET, "status", None, PUSH_TIMEOUT).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::PushWorkflow { path } => {
            if is_package(&path) {
                push_package(&client, &path).await?;
            } else {
                let file = resolve_workflow_file(&path);
                let workflow = YamlWorkflowParser::new().parse(&file)?;
                let yaml = serde_yaml::to_string(&workflow)?.into_bytes();
                println!("Pushing workflow to {}...", client.target);
                println!("  Workflow loaded ({} bytes)", yaml.len());
                let body = client
                    .call(
                        Method::PUT,
                        "workflow",
                        Some(("application/yaml", yaml)),
                        PUSH_TIMEOUT,
                    )
                    .await?;
                print_push_result(&body, "Workflow");
            }
        }
        Commands::PushPackage { path } => push_package(&client, &path).await?,
        Commands::Reload => {
            let body = client.call(Method::POST, "reload", None, PUSH_TIMEOUT).await?;
            print_push_result(&body, "Reload");
        }
    }

    Ok(())
}

struct Client {
    http: reqwest::Client,
    target: String,
    token: Option<String>,
}

impl Client {
    async fn call(
        &self,
        method: Method,
        route: &str,
        body: Option<(&str, Vec<u8>)>,
        timeout: Duration,
    ) -> Result<Value, CtlError> {
        let endpoint = format!("{}{}/{}", self.target, MANAGEMENT_PREFIX, route);
        let mut request = self.http.request(method, &endpoint).timeout(timeout);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some((content_type, bytes)) = body {
            request = request.header(CONTENT_TYPE, content_type).body(bytes);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| CtlError::Connect(endpoint.clone(), e))?;
        let status = response.status();

        let mut raw = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| CtlError::Connect(endpoint.clone(), e))?
        {
            let room = MAX_RESPONSE_BYTES.saturating_sub(raw.len());
            raw.extend_from_slice(&chunk[..room.min(chunk.len())]);
            if raw.len() >= MAX_RESPONSE_BYTES {
                break;
            }
        }
        interpret(status, &raw)
    }
}

async fn push_package(client: &Client, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| format!("failed to read package {}: {}", path.display(), e))?;
    println!("Pushing package to {}...", client.target);
    println!("  Package loaded ({} bytes)", data.len());
    let body = client
        .call(
            Method::PUT,
            "package",
            Some(("application/octet-stream", data)),
            PACKAGE_TIMEOUT,
        )
        .await?;
    print_push_result(&body, "Package");
    Ok(())
}

fn interpret(status: StatusCode, raw: &[u8]) -> Result<Value, CtlError> {
    let text = String::from_utf8_lossy(raw).into_owned();
    let parsed: Option<Value> = serde_json::from_slice(raw).ok();
    match status {
        StatusCode::OK => {}
        StatusCode::UNAUTHORIZED => return Err(CtlError::Unauthorized),
        StatusCode::SERVICE_UNAVAILABLE => return Err(CtlError::Disabled),
        other => {
            let message = parsed
                .as_ref()
                .and_then(|v| v["message"].as_str())
                .map(str::to_string)
                .unwrap_or(text);
            return Err(CtlError::Server(other.as_u16(), message));
        }
    }
    match parsed {
        Some(body) if body["status"] == "ok" => Ok(body),
        _ => Err(CtlError::Unexpected(text)),
    }
}

fn print_push_result(body: &Value, label: &str) {
    println!();
    println!("{} succeeded: {}", label, body["message"].as_str().unwrap_or("ok"));
    if let Some(name) = body["workflow"]["name"].as_str() {
        println!("  Name:    {}", name);
    }
    if let Some(version) = body["workflow"]["version"].as_str() {
        println!("  Version: {}", version);
    }
}

/// Trim trailing slashes and default the scheme to `http://`.
fn normalize_target(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

fn is_package(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "kdeps")
}

/// A directory resolves to the workflow file inside it.
fn resolve_workflow_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(DEFAULT_WORKFLOW_FILE)
    } else {
        path.to_path_buf()
    }
}
