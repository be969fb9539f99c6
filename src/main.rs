mod access;
mod client;
mod config;
mod delete;
mod error;
mod listing;
mod paths;
mod protection;
mod routes;
mod session;
mod state;
mod storage;
mod store;
mod upload;
mod visibility;

use std::process::ExitCode;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method, header};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::client::HttpClient;
use crate::config::{Cli, Command, DeleteArgs, ServerConfig, UploadArgs};
use crate::delete::DeleteReport;
use crate::paths::RelPath;
use crate::state::AppState;
use crate::upload::{FollowUp, ProtectionOutcome, TransferError, UploadOrchestrator, UploadPlan, UploadReport};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fileshelf=info,tower_http=info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(ServerConfig::from_args(args)).await,
        Command::Upload(args) => upload(args).await,
        Command::Delete(args) => delete(args).await,
    }
}

async fn serve(config: ServerConfig) -> ExitCode {
    let addr = format!("{}:{}", config.host, config.port);
    let body_limit = config.max_upload_bytes;
    let cors = cors_layer(&config.cors_origins);

    let state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Could not prepare the public directory");
            return ExitCode::FAILURE;
        }
    };
    info!(
        root = %state.storage.root().display(),
        protected = state.protection.len(),
        hidden = state.visibility.len(),
        max_upload_bytes = body_limit,
        "Public directory ready"
    );
    if state.config.upload_key.is_none() {
        warn!("No upload key configured; uploads and folder creation are disabled");
    }
    if !state.config.delete_configured() {
        warn!("No delete key configured; deletion is disabled");
    }
    if !state.config.hidden_configured() {
        warn!("No hidden key configured; hiding folders is disabled");
    }

    let app = routes::router(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Could not bind");
            return ExitCode::FAILURE;
        }
    };
    info!("fileshelf listening on {addr}");
    match axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server stopped");
            ExitCode::FAILURE
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-upload-key"),
            HeaderName::from_static("x-delete-key"),
        ])
        .allow_credentials(true)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("Could not listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn upload(args: UploadArgs) -> ExitCode {
    let server = args.client.server.clone();
    let viewing = args.viewing.clone();
    match run_upload(args).await {
        Ok((report, dest)) => {
            for failure in &report.failures {
                println!("failed  {} ({})", failure.target, failure.reason);
            }
            match &report.protection {
                ProtectionOutcome::Applied => println!("folder protected"),
                ProtectionOutcome::Failed(reason) => println!("warning: folder could not be protected ({reason})"),
                ProtectionOutcome::Skipped => println!("nothing uploaded, protection not applied"),
                ProtectionOutcome::NotRequested => {}
            }
            println!(
                "{} uploaded, {} failed, {} skipped",
                report.success_count, report.fail_count, report.skipped_count
            );
            let viewing = viewing.and_then(|v| RelPath::parse(&v).ok());
            match report.follow_up(viewing.as_ref(), &dest) {
                FollowUp::KeepOpenForRetry => println!("re-run the same command to retry"),
                FollowUp::RefreshListing => print_listing(&server, &dest).await,
                FollowUp::CloseAfterDelay => {}
            }
            match report.partial_failure() {
                Some(e) => {
                    error!(error = %e, "Upload incomplete");
                    ExitCode::FAILURE
                }
                None => ExitCode::SUCCESS,
            }
        }
        Err(e) => {
            error!(error = %e, "Upload aborted");
            ExitCode::FAILURE
        }
    }
}

async fn print_listing(server: &str, dir: &RelPath) {
    let names = match HttpClient::new(server) {
        Ok(client) => client.list_names(dir).await,
        Err(e) => Err(e),
    };
    match names {
        Ok(names) => {
            println!("/{dir}:");
            for name in names {
                println!("  {name}");
            }
        }
        Err(e) => warn!(error = %e, "Could not refresh the listing"),
    }
}

async fn run_upload(args: UploadArgs) -> Result<(UploadReport, RelPath), TransferError> {
    args.validate().map_err(|e| TransferError::InvalidTarget(e.to_string()))?;
    let client = HttpClient::new(&args.client.server)?;
    let dest = RelPath::parse(&args.dest).map_err(|e| TransferError::InvalidTarget(e.to_string()))?;
    let plan = match &args.folder {
        Some(dir) => UploadPlan::folder(dest.clone(), dir, args.protect_password.clone())?,
        None => UploadPlan::files(dest.clone(), &args.files)?,
    };

    // Fail on a bad key before any byte leaves.
    client.validate_upload_key(&dest, &args.client.key).await?;
    info!(
        files = plan.items.len(),
        bytes = plan.total_bytes(),
        dest = %dest,
        "Starting upload"
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, skipping remaining files");
            on_interrupt.cancel();
        }
    });

    let orchestrator = UploadOrchestrator::new(client, args.timeout()).with_cancellation(cancel);
    let mut last_line = None;
    let report = orchestrator
        .run(&plan, &args.client.key, |progress| {
            let line = (progress.file_index, progress.overall_percent);
            if last_line != Some(line) {
                last_line = Some(line);
                println!(
                    "[{}/{}] {:>3}%  {}",
                    progress.file_index + 1,
                    progress.file_count,
                    progress.overall_percent,
                    progress.target
                );
            }
        })
        .await;
    Ok((report, dest))
}

async fn delete(args: DeleteArgs) -> ExitCode {
    match run_delete(&args).await {
        Ok(report) => {
            for item in &report.errors {
                println!("failed  {} ({})", item.path, item.error);
            }
            println!("{} deleted, {} failed", report.success_count, report.fail_count);
            if report.fail_count == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "Delete rejected");
            ExitCode::FAILURE
        }
    }
}

async fn run_delete(args: &DeleteArgs) -> Result<DeleteReport, TransferError> {
    let client = HttpClient::new(&args.client.server)?;
    client.delete_items(&args.items, &args.client.key).await
}
