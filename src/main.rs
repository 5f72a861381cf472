//! fileuploader server binary.
//!
//! Serves a small browser UI and a JSON API for browsing, uploading, and
//! managing files below a single root directory. Every client-supplied path
//! is confined to that root before it reaches the filesystem.

mod admission;
mod atomic;
mod batch;
mod config;
mod error;
mod files;
mod frontend;
mod http;
mod logging;
mod part;
mod sandbox;
mod storage;
mod upload;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span};

use crate::admission::UploadGate;
use crate::config::{Args, ROUTE_PREFIX, SHUTDOWN_GRACE_SECS};
use crate::frontend::{AssetProvider, EmbeddedAssets};
use crate::http::build_cors_layer;
use crate::sandbox::PathSandbox;
use crate::storage::{Storage, StorageOptions};
use crate::upload::UploadConfig;

/// Starts the file manager and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let sandbox = PathSandbox::open(&args.root_dir).await.map_err(|err| {
        error!(root = %args.root_dir, error = %err, "failed to open root directory");
        err
    })?;
    info!(root = ?sandbox.root(), "serving files");
    let storage = Arc::new(Storage::new(
        sandbox,
        StorageOptions {
            symlink_target_prefix: args.symlink_target_prefix.clone(),
            tree_hidden_prefix: args.tree_hidden_prefix.clone(),
        },
    ));
    let read_timeout = Duration::from_secs(args.read_timeout_secs);
    let upload_config = Arc::new(UploadConfig {
        max_file_size: args.max_file_size,
        max_request_size: args.max_request_size,
        read_timeout,
        write_timeout: Duration::from_secs(args.write_timeout_secs),
    });
    let upload_gate = Arc::new(UploadGate::new(
        args.upload_max_concurrent,
        args.upload_admission,
        read_timeout,
    ));
    let assets: Arc<dyn AssetProvider> = Arc::new(EmbeddedAssets);

    let api = api_routes(upload_config.max_request_size);
    let mut app = Router::new()
        .merge(api.clone())
        .nest(ROUTE_PREFIX, api)
        .fallback(frontend::serve_frontend)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let client_ip = http::client_ip(request);
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(storage))
        .layer(Extension(upload_config))
        .layer(Extension(upload_gate))
        .layer(Extension(assets));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    tokio::spawn(shutdown_signal(handle.clone()));
    axum_server::bind(http_addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// JSON API routes; mounted both at `/` and under [`ROUTE_PREFIX`].
fn api_routes(max_request_size: u64) -> Router {
    let body_limit = usize::try_from(max_request_size).unwrap_or(usize::MAX);
    Router::new()
        .route(
            "/api/file/upload",
            post(upload::upload_files)
                .fallback(files::method_not_allowed)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route(
            "/api/directory/list",
            get(files::list_root).fallback(files::method_not_allowed),
        )
        .route(
            "/api/directory/list/{*path}",
            get(files::list_directory).fallback(files::method_not_allowed),
        )
        .route(
            "/api/directory/tree",
            get(files::directory_tree).fallback(files::method_not_allowed),
        )
        .route(
            "/api/directory/create",
            post(files::create_directory).fallback(files::method_not_allowed),
        )
        .route(
            "/api/directory/symlink",
            post(files::create_symlink).fallback(files::method_not_allowed),
        )
        .route(
            "/api/file/rename",
            post(files::rename_entry).fallback(files::method_not_allowed),
        )
        .route(
            "/api/file/delete",
            delete(files::delete_missing_path).fallback(files::method_not_allowed),
        )
        .route(
            "/api/file/delete/{*path}",
            delete(files::delete_entry).fallback(files::method_not_allowed),
        )
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
