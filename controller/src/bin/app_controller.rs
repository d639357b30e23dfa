/*
 * 5D Labs App Controller - Kubernetes controller for kapp-deployed Apps
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! App Controller Service - Kubernetes controller for `App` and `PackageRepository` CRDs
//!
//! This service:
//! - Watches `App` and `PackageRepository` resources plus the Secrets and
//!   ConfigMaps they reference
//! - Fetches, templates and deploys each App through kapp
//! - Guards deletion with a finalizer until deployed resources are removed
//! - Serves health and readiness endpoints

use app_controller::tasks::{config::ControllerConfig, run_task_controller};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    controllers_started: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,app_controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting 5D Labs App Controller Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let controller_config = Arc::new(load_controller_config(&client).await);
    let state = AppState {
        controllers_started: Arc::new(AtomicBool::new(false)),
    };

    // Start the controllers in the background
    let controller_handle = {
        let client = client.clone();
        let config = controller_config.clone();
        let started = state.controllers_started.clone();
        tokio::spawn(async move {
            started.store(true, Ordering::SeqCst);
            if let Err(e) = run_task_controller(client, config).await {
                error!("Controller error: {}", e);
            }
            started.store(false, Ordering::SeqCst);
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(60))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("App controller HTTP server listening on 0.0.0.0:8080");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("App controller service stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "app-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.controllers_started.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "ready",
        "service": "app-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn load_controller_config(client: &kube::Client) -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or("/config/config.yaml");

    let file_err = match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            return cfg;
        }
        Err(err) => err,
    };

    // Fall back to reading the ConfigMap through the API when it is not mounted
    if let Ok(cm_name) = std::env::var("CONTROLLER_CONFIGMAP") {
        let namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "kapp-controller".to_string());
        match ControllerConfig::from_configmap(client, &namespace, &cm_name).await {
            Ok(cfg) => {
                info!("Loaded controller configuration from ConfigMap {}/{}", namespace, cm_name);
                return cfg;
            }
            Err(err) => {
                warn!("Failed to load ConfigMap {}/{}: {}", namespace, cm_name, err);
            }
        }
    }

    warn!(
        "Failed to load configuration from {}: {}. Using defaults.",
        config_path, file_err
    );
    ControllerConfig::default()
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
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
