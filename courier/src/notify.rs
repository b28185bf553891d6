/// Notify module: the HTTP submission API.
///
/// `POST /notify` validates the tenant and service headers and the request body,
/// encodes the request with the message codec, and publishes it to the
/// `<tenant>-<service>` topic. Delivery happens later, on the consumer side.
use crate::{
    broker::{PublishError, Publisher},
    message::{DeliveryRequest, EncodeError, Encoder, JsonCodec, KIND_HTTP_GET},
    metrics::{Metrics, track_http_latency},
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

pub const TENANT_HEADER: &str = "X-NS-TENANTID";
pub const SERVICE_HEADER: &str = "X-NS-SERVICE";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request header missing params: {}", .0.join(", "))]
    MissingHeaders(Vec<&'static str>),

    #[error("request body missing params: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("unknown service {tenant}/{service}")]
    UnknownService { tenant: String, service: String },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl NotifyError {
    pub fn status(&self) -> StatusCode {
        match self {
            NotifyError::MissingHeaders(_) => StatusCode::FORBIDDEN,
            NotifyError::MissingFields(_) | NotifyError::InvalidParameter => {
                StatusCode::BAD_REQUEST
            }
            NotifyError::UnknownService { .. } => StatusCode::NOT_FOUND,
            NotifyError::Encode(_) | NotifyError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for NotifyError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Body of a submission. Absent fields decode as empty strings and are reported
/// by `validate`.
#[derive(Debug, Default, Deserialize)]
pub struct NotifyRequest {
    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub http_request: String,
}

impl NotifyRequest {
    fn validate(&self) -> Result<(), NotifyError> {
        let mut missing = Vec::new();
        if self.kind.is_empty() {
            missing.push("type");
        }
        if self.http_request.is_empty() {
            missing.push("http_request");
        }
        if !missing.is_empty() {
            return Err(NotifyError::MissingFields(missing));
        }
        Ok(())
    }

    fn into_delivery(self) -> Result<DeliveryRequest, NotifyError> {
        match self.kind.as_str() {
            KIND_HTTP_GET => Ok(DeliveryRequest::http_get(self.http_request)),
            _ => Err(NotifyError::InvalidParameter),
        }
    }
}

/// Routes submissions to the publisher of their service topic.
#[derive(Default)]
pub struct NotifyService {
    publishers: HashMap<String, Arc<dyn Publisher>>,
    encoder: JsonCodec,
}

impl NotifyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, topic: impl Into<String>, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(topic.into(), publisher);
    }

    pub async fn send(
        &self,
        tenant: &str,
        service: &str,
        request: NotifyRequest,
    ) -> Result<(), NotifyError> {
        request.validate()?;
        let delivery = request.into_delivery()?;

        let publisher = self
            .publishers
            .get(&format!("{}-{}", tenant, service))
            .ok_or_else(|| NotifyError::UnknownService {
                tenant: tenant.to_string(),
                service: service.to_string(),
            })?;

        let payload = self.encoder.encode(&delivery)?;
        publisher.publish(Bytes::from(payload)).await?;

        tracing::debug!(tenant, service, url = %delivery.target, "notification accepted");
        Ok(())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn required_headers(headers: &HeaderMap) -> Result<(&str, &str), NotifyError> {
    match (header(headers, TENANT_HEADER), header(headers, SERVICE_HEADER)) {
        (Some(tenant), Some(service)) => Ok((tenant, service)),
        (tenant, service) => {
            let mut missing = Vec::new();
            if tenant.is_none() {
                missing.push(TENANT_HEADER);
            }
            if service.is_none() {
                missing.push(SERVICE_HEADER);
            }
            Err(NotifyError::MissingHeaders(missing))
        }
    }
}

pub async fn notify(
    State(service): State<Arc<NotifyService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, NotifyError> {
    let (tenant, service_name) = required_headers(&headers)?;
    // a body that is not JSON counts as an empty one
    let request: NotifyRequest = serde_json::from_slice(&body).unwrap_or_default();

    service
        .send(tenant, service_name, request)
        .await
        .inspect_err(|e| {
            tracing::info!(tenant, service = service_name, error = %e, "notification rejected");
        })?;

    Ok(StatusCode::ACCEPTED)
}

/// `/notify` with its latency middleware.
pub fn router(service: Arc<NotifyService>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/notify", post(notify))
        .route_layer(middleware::from_fn_with_state(metrics, track_http_latency))
        .with_state(service)
}
