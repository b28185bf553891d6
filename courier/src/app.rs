/// App module: wires one delivery pipeline per configured service and runs them.
///
/// A pipeline is: service topic → listener → instrumented handler → dispatcher →
/// runner pool → HTTP sender, with terminal failures published to the service's
/// error topic and drained by a failure log. The HTTP server publishes submissions
/// onto the service topics.
use crate::{
    broker::{Broker, Publisher},
    client::HttpSender,
    config::{Config, ServiceConfig},
    consumer::{FailureLog, Listener},
    dispatcher::Dispatcher,
    message::JsonCodec,
    metrics::{InstrumentedBuilder, InstrumentedHandler, InstrumentedPublisher, Metrics},
    notify::NotifyService,
    pool::RunnerPool,
    runnable::TasksGroup,
    runner::FixedDelayBuilder,
    server::{self, HttpServer},
};
use anyhow::{Context, Result};
use axum::Router;
use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct App {
    broker: Arc<Broker>,
    group: TasksGroup,
    router: Router,
    cancel: CancellationToken,
}

impl App {
    pub fn new(config: &Config) -> Result<Self> {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
        let broker = Arc::new(Broker::new(config.broker.capacity));
        let mut group = TasksGroup::new("courier");
        let mut notify = NotifyService::new();

        for service in &config.services {
            add_pipeline(service, &broker, &metrics, &cancel, &mut group, &mut notify)
                .with_context(|| format!("failed to build pipeline for {}", service.topic()))?;
        }

        let router = server::router(Arc::new(notify), metrics);
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.app.port));
        group.add_task(Box::new(HttpServer::new(addr, router.clone(), cancel.clone())));

        Ok(Self {
            broker,
            group,
            router,
            cancel,
        })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs until SIGINT or SIGTERM, then shuts down.
    pub async fn start(self) -> Result<()> {
        let mut sigint_stream = signal(SignalKind::interrupt()).context("watch SIGINT failed")?;
        let mut sigterm_stream = signal(SignalKind::terminate()).context("watch SIGTERM failed")?;

        self.run(async move {
            tokio::select! {
                _ = sigint_stream.recv() => {
                    tracing::info!("SIGINT received, shutdown initiated...");
                }
                _ = sigterm_stream.recv() => {
                    tracing::info!("SIGTERM received, shutdown initiated...");
                }
            }
        })
        .await;
        Ok(())
    }

    /// Runs every task until `shutdown` resolves or a task fires the cancellation token.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        self.group.run();

        tokio::select! {
            _ = shutdown => {}
            _ = self.cancel.cancelled() => {
                tracing::warn!("cancelled from within, shutdown initiated...");
            }
        }

        self.cancel.cancel();
        self.group
            .wait_for_shutdown(TASK_SHUTDOWN_TIMEOUT, SHUTDOWN_TIMEOUT)
            .await;
        self.broker.shutdown();

        tracing::info!("Shutdown complete");
    }
}

fn add_pipeline(
    service: &ServiceConfig,
    broker: &Broker,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
    group: &mut TasksGroup,
    notify: &mut NotifyService,
) -> Result<()> {
    let topic = service.topic();
    let error_topic = service.error_topic();

    let sender = Arc::new(HttpSender::new(service.timeout)?);
    let error_publisher = Arc::new(InstrumentedPublisher::new(
        Arc::new(broker.publisher(&error_topic)),
        &error_topic,
        &service.name,
        metrics.clone(),
    ));
    let builder = InstrumentedBuilder::new(
        Box::new(FixedDelayBuilder::new(service.retry, service.retry_delay)),
        &service.name,
        metrics.clone(),
    );
    let pool = Arc::new(RunnerPool::build(service.max_requests, &builder));
    let dispatcher = Dispatcher::new(Arc::new(JsonCodec), sender, error_publisher, pool);
    let handler = InstrumentedHandler::new(Box::new(dispatcher), &service.name, metrics.clone());

    group.add_task(Box::new(Listener::new(
        broker.subscribe(&topic),
        Box::new(handler),
        cancel.clone(),
    )));
    group.add_task(Box::new(FailureLog::new(
        broker.subscribe(&error_topic),
        cancel.clone(),
    )));

    let publisher: Arc<dyn Publisher> = Arc::new(InstrumentedPublisher::new(
        Arc::new(broker.publisher(&topic)),
        &topic,
        &service.name,
        metrics.clone(),
    ));
    notify.register(&topic, publisher);

    tracing::info!(
        service = %service.name,
        tenant = %service.tenant_id,
        group_id = service.group_id(),
        pool = service.max_requests,
        retry = service.retry,
        "pipeline ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, BrokerConfig, LogConfig};
    use crate::notify::{SERVICE_HEADER, TENANT_HEADER};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use httptest::{Expectation, Server, matchers::*, responders};
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;
    use tower::ServiceExt;

    fn config(retry: u32) -> Config {
        let mut config = Config {
            app: AppConfig { port: 0 },
            log: LogConfig::default(),
            broker: BrokerConfig { capacity: 8 },
            services: vec![ServiceConfig {
                name: "billing".to_string(),
                tenant_id: "acme".to_string(),
                max_requests: 2,
                retry,
                retry_delay: Duration::from_millis(10),
                timeout: Duration::from_secs(1),
                group_id: None,
            }],
        };
        config.validate().unwrap();
        config
    }

    fn submit(url: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/notify")
            .header(TENANT_HEADER, "acme")
            .header(SERVICE_HEADER, "billing")
            .body(Body::from(format!(
                r#"{{"type":"httpget","http_request":"{}"}}"#,
                url
            )))
            .unwrap()
    }

    async fn metrics_text(router: Router) -> String {
        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    async fn wait_for_metric(router: &Router, needle: &str) {
        timeout(Duration::from_secs(5), async {
            while !metrics_text(router.clone()).await.contains(needle) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("metric {} never appeared", needle));
    }

    #[tokio::test]
    async fn test_submission_is_delivered() {
        let target = Server::run();
        target.expect(
            Expectation::matching(request::method_path("GET", "/hook"))
                .times(1)
                .respond_with(responders::status_code(200)),
        );

        let app = App::new(&config(3)).unwrap();
        let router = app.router();
        let cancel = app.cancel_token();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(app.run(async move {
            let _ = stop_rx.await;
        }));

        let response = router
            .clone()
            .oneshot(submit(&target.url_str("/hook")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        wait_for_metric(&router, "runner_service_success_count{attempt=\"0\",service=\"billing\"} 1").await;
        let text = metrics_text(router).await;
        assert!(text.contains("publisher_topic_count{topic=\"acme-billing\"} 1"));
        assert!(text.contains("consumer_service_requests_count{service=\"billing\"} 1"));

        let _ = stop_tx.send(());
        timeout(Duration::from_secs(15), running).await.unwrap().unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_exhausted_delivery_is_reported() {
        let target = Server::run();
        target.expect(
            Expectation::matching(request::method_path("GET", "/down"))
                .times(2)
                .respond_with(responders::status_code(503)),
        );

        let app = App::new(&config(2)).unwrap();
        let router = app.router();
        let cancel = app.cancel_token();
        let running = tokio::spawn(app.run(std::future::pending()));

        let response = router
            .clone()
            .oneshot(submit(&target.url_str("/down")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        wait_for_metric(&router, "runner_service_failed_count{attempt=\"2\",service=\"billing\"} 1").await;
        wait_for_metric(&router, "publisher_topic_count{topic=\"acme-billing-error\"} 1").await;

        cancel.cancel();
        timeout(Duration::from_secs(15), running).await.unwrap().unwrap();
    }
}
