use axum::{
    Router,
    extract::Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    AggregateReport, ExplorationResult, ExploreParameter, RunOptions, Scenario, TaxTable,
    TrialResult, explore, simulate,
};

const MAX_TRIALS: u32 = 100_000;
const MAX_YEARS: u32 = 150;
const HORIZON_AGE: i32 = 100;

#[derive(Parser, Debug)]
#[command(
    name = "planner",
    about = "Monte Carlo retirement planner (income, RMDs, Roth conversions, taxes, rebalancing)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a scenario file and print the aggregate report as JSON.
    Run(RunArgs),
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, help = "Scenario JSON file")]
    pub scenario: PathBuf,
    #[arg(long, help = "Tax table JSON file; the built-in reference table when omitted")]
    pub tax_table: Option<PathBuf>,
    #[arg(long, default_value_t = 1000)]
    pub trials: u32,
    #[arg(
        long,
        help = "Years to simulate; defaults to the years left until the owner turns 100"
    )]
    pub years: Option<u32>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long, help = "Worker threads, defaults to available cores")]
    pub workers: Option<usize>,
    #[arg(long, help = "Stop scheduling trials after this many seconds")]
    pub timeout_secs: Option<u64>,
    #[arg(long, default_value_t = false, help = "Include every trial's yearly states")]
    pub keep_trials: bool,
    #[arg(long, default_value_t = false)]
    pub pretty: bool,
}

/// Fully validated inputs for one Monte Carlo run.
#[derive(Debug, Clone)]
struct RunRequest {
    scenario: Scenario,
    table: TaxTable,
    trials: u32,
    years: u32,
    options: RunOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    scenario: Option<Scenario>,
    tax_table: Option<TaxTable>,
    trials: Option<u32>,
    years: Option<u32>,
    seed: Option<u64>,
    keep_trials: Option<bool>,
    yearly_stats: Option<bool>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExplorePayload {
    #[serde(flatten)]
    run: SimulatePayload,
    parameter: ExploreParameter,
    #[serde(default)]
    values: Vec<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse<'a> {
    scenario: &'a str,
    trials: u32,
    years: u32,
    seed: Option<u64>,
    report: &'a AggregateReport,
    #[serde(skip_serializing_if = "no_trials")]
    trial_results: &'a [TrialResult],
}

fn no_trials(trials: &&[TrialResult]) -> bool {
    trials.is_empty()
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn run_cli(cli: Cli) -> Result<Option<u16>, String> {
    match cli.command {
        Command::Serve { port } => Ok(Some(port)),
        Command::Run(args) => {
            let scenario: Scenario = read_json(&args.scenario, "--scenario")?;
            let table = match &args.tax_table {
                Some(path) => read_json(path, "--tax-table")?,
                None => TaxTable::reference(),
            };
            let request = build_run_request(&args, scenario, table)?;
            let body = execute(&request)?;
            let text = if args.pretty {
                serde_json::to_string_pretty(&body)
            } else {
                serde_json::to_string(&body)
            }
            .map_err(|e| format!("could not encode report: {e}"))?;
            println!("{text}");
            Ok(None)
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, flag: &str) -> Result<T, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("{flag}: cannot read {}: {e}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|e| format!("{flag}: invalid JSON in {}: {e}", path.display()))
}

fn build_run_request(
    args: &RunArgs,
    scenario: Scenario,
    table: TaxTable,
) -> Result<RunRequest, String> {
    if args.trials == 0 || args.trials > MAX_TRIALS {
        return Err(format!("--trials must be between 1 and {MAX_TRIALS}"));
    }
    if args.workers == Some(0) {
        return Err("--workers must be > 0".to_string());
    }
    let years = resolve_years(args.years, &scenario).map_err(|e| format!("--years {e}"))?;
    Ok(RunRequest {
        scenario,
        table,
        trials: args.trials,
        years,
        options: RunOptions {
            seed: args.seed,
            workers: args.workers,
            deadline: args.timeout_secs.map(Duration::from_secs),
            keep_trials: args.keep_trials,
            ..RunOptions::default()
        },
    })
}

fn resolve_years(years: Option<u32>, scenario: &Scenario) -> Result<u32, String> {
    let years = years.unwrap_or_else(|| default_years(scenario));
    if years == 0 || years > MAX_YEARS {
        return Err(format!("must be between 1 and {MAX_YEARS}"));
    }
    Ok(years)
}

/// Years until the owner reaches the planning horizon age, at least one.
fn default_years(scenario: &Scenario) -> u32 {
    let age = scenario.start_year - scenario.birth_year;
    (HORIZON_AGE - age).clamp(1, MAX_YEARS as i32) as u32
}

fn execute(request: &RunRequest) -> Result<serde_json::Value, String> {
    let output = simulate(
        &request.scenario,
        &request.table,
        request.trials,
        request.years,
        &request.options,
    )
    .map_err(|e| e.to_string())?;
    let response = SimulateResponse {
        scenario: &request.scenario.name,
        trials: request.trials,
        years: request.years,
        seed: request.options.seed,
        report: &output.report,
        trial_results: &output.trials,
    };
    serde_json::to_value(response).map_err(|e| format!("could not encode report: {e}"))
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "planner HTTP API listening");
    axum::serve(listener, router()).await
}

fn router() -> Router {
    Router::new()
        .route("/api/simulate", post(simulate_handler))
        .route("/api/explore", post(explore_handler))
        .fallback(not_found_handler)
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(Json(payload): Json<SimulatePayload>) -> Response {
    let request = match run_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    // Trials are CPU-bound; keep them off the async workers.
    match tokio::task::spawn_blocking(move || execute(&request)).await {
        Ok(Ok(body)) => json_response(StatusCode::OK, body),
        Ok(Err(msg)) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &msg),
        Err(err) => {
            error!(error = %err, "simulation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation failed")
        }
    }
}

async fn explore_handler(Json(payload): Json<ExplorePayload>) -> Response {
    let request = match run_request_from_payload(payload.run) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    if payload.values.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "values must not be empty");
    }
    let parameter = payload.parameter;
    let values = payload.values;
    let task = tokio::task::spawn_blocking(move || -> Result<ExplorationResult, String> {
        explore(
            &request.scenario,
            &request.table,
            &parameter,
            &values,
            request.trials,
            request.years,
            &request.options,
        )
        .map_err(|e| e.to_string())
    });
    match task.await {
        Ok(Ok(result)) => json_response(StatusCode::OK, result),
        Ok(Err(msg)) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &msg),
        Err(err) => {
            error!(error = %err, "exploration task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "exploration failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn run_request_from_json(json: &str) -> Result<RunRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    run_request_from_payload(payload)
}

fn run_request_from_payload(payload: SimulatePayload) -> Result<RunRequest, String> {
    let Some(scenario) = payload.scenario else {
        return Err("scenario is required".to_string());
    };
    let trials = payload.trials.unwrap_or(1000);
    if trials == 0 || trials > MAX_TRIALS {
        return Err(format!("trials must be between 1 and {MAX_TRIALS}"));
    }
    let years = resolve_years(payload.years, &scenario).map_err(|e| format!("years {e}"))?;
    if payload.timeout_ms == Some(0) {
        return Err("timeoutMs must be > 0".to_string());
    }

    Ok(RunRequest {
        table: payload.tax_table.unwrap_or_else(TaxTable::reference),
        trials,
        years,
        options: RunOptions {
            seed: payload.seed,
            deadline: payload.timeout_ms.map(Duration::from_millis),
            keep_trials: payload.keep_trials.unwrap_or(false),
            yearly_stats: payload.yearly_stats.unwrap_or(true),
            ..RunOptions::default()
        },
        scenario,
    })
}
