//! filegate server binary.
//!
//! Serves a file tree with directory listings and accepts uploads into
//! directories covered by an explicit per-directory rule. The main entry
//! point loads configuration, builds the immutable policy store, and wires
//! the Axum router.

mod background;
mod browse;
mod config;
mod error;
mod http;
mod listing;
mod logging;
mod paths;
mod policy;
mod ratelimit;
mod staging;
mod upload;
mod validate;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use clap::Parser;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::{Args, ServerConfig};
use crate::listing::DirectoryLister;
use crate::policy::UploadPolicyStore;
use crate::ratelimit::RateLimiter;
use crate::staging::StagingManager;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let rule_configs = config::load_rule_configs(args.upload_rules.as_deref())
        .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err.to_string()))?;
    let policy = Arc::new(
        UploadPolicyStore::build(&rule_configs)
            .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err.to_string()))?,
    );

    let files_dir = PathBuf::from(&args.files_dir);
    let staging = Arc::new(StagingManager::new(files_dir.clone(), args.max_upload_size));
    staging.ensure_dirs().await?;
    let lister = Arc::new(DirectoryLister::new(files_dir));
    let limiter = Arc::new(RateLimiter::new(
        args.upload_rate_limit,
        Duration::from_secs(args.upload_rate_window_secs),
    ));
    let server_config = Arc::new(ServerConfig {
        upload_enabled: args.upload_enabled,
    });

    info!(
        files_dir = args.files_dir,
        upload_enabled = args.upload_enabled,
        "configuration loaded"
    );

    let app = Router::new()
        .route(
            "/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/uploadRules", get(upload::upload_rules))
        .fallback(browse::browse)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = http::extract_forwarded_ip(request.headers())
                        .or_else(|| {
                            request
                                .extensions()
                                .get::<ConnectInfo<SocketAddr>>()
                                .map(|ConnectInfo(addr)| addr.ip())
                        })
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(server_config))
        .layer(Extension(policy))
        .layer(Extension(staging.clone()))
        .layer(Extension(lister))
        .layer(Extension(limiter.clone()));

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let listener = TcpListener::bind(addr).await?;

    spawn_background_tasks(
        staging,
        limiter,
        Duration::from_secs(args.staging_ttl_secs),
    );

    info!("starting server at {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
}
