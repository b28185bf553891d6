use crate::{
    metrics::Metrics,
    notify::{self, NotifyService},
    runnable::Runnable,
};
use async_trait::async_trait;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const _SERVER_NAME_PREFIX: &str = "http-server";

#[derive(Clone)]
struct OpsState {
    in_rotation: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

async fn healthz(State(state): State<OpsState>) -> StatusCode {
    if state.in_rotation.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    }
}

async fn remove_lb(State(state): State<OpsState>) -> StatusCode {
    if state.in_rotation.swap(false, Ordering::SeqCst) {
        tracing::info!("removed from load balancer rotation");
    }
    StatusCode::OK
}

async fn expose_metrics(State(state): State<OpsState>) -> Response {
    match state.metrics.gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Builds the service router: `/notify`, `/healthz`, `/removelb` and `/metrics`.
pub fn router(notify: Arc<NotifyService>, metrics: Arc<Metrics>) -> Router {
    let ops = Router::new()
        .route("/healthz", get(healthz))
        .route("/removelb", get(remove_lb))
        .route("/metrics", get(expose_metrics))
        .with_state(OpsState {
            in_rotation: Arc::new(AtomicBool::new(true)),
            metrics: metrics.clone(),
        });

    notify::router(notify, metrics).merge(ops)
}

pub struct HttpServer {
    name: String,
    addr: SocketAddr,
    router: Router,
    cancel: CancellationToken,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router, cancel: CancellationToken) -> Self {
        Self {
            name: format!("{}-{}", _SERVER_NAME_PREFIX, addr.port()),
            addr,
            router,
            cancel,
        }
    }

    pub async fn serve(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "http server listening");

        let cancel = self.cancel.clone();
        axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Runnable for HttpServer {
    async fn run(&mut self) {
        if let Err(e) = self.serve().await {
            tracing::error!(error = %e, "{} failed", self.name);
            // a failed server stops the process
            self.cancel.cancel();
        }
        tracing::info!("{} stopped", self.name);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
