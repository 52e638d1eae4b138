// ===============================
// src/http.rs (REST + /metrics)
// ===============================
//
// Routes (prefix /orders atau /api/orders):
//   POST /orders          -> submit, 200 + record
//   PUT  /orders/{id}     -> update item/amount, 404 kalau id tidak ada
//   GET  /orders/{id}     -> record, 404 kalau tidak ada
//   GET  /orders/stats    -> {totalRequests, timestamp}
//   GET  /metrics         -> Prometheus text
//   GET  /health          -> {"status":"ok"}
//
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::domain::{OrderId, OrderRequest};
use crate::metrics::Metrics;
use crate::service::{OrderService, ServiceError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self) -> Response<Body> {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        json_response(status, &json!({ "error": self.to_string() }))
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::NotFound(id) => ApiError::NotFound(format!("order {id} not found")),
            ServiceError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

/// State yang dibagi ke semua koneksi.
#[derive(Clone)]
pub struct AppState {
    pub service: OrderService,
    pub metrics: Arc<Metrics>,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut rsp = Response::new(Body::from(bytes));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    rsp
}

async fn read_order_request(req: Request<Body>) -> Result<OrderRequest, ApiError> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| ApiError::BadRequest(format!("cannot read body: {e}")))?;
    let body: OrderRequest =
        serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?;
    body.validate().map_err(ApiError::BadRequest)?;
    Ok(body)
}

fn parse_id(raw: &str) -> Result<OrderId, ApiError> {
    raw.parse().map_err(|_| ApiError::BadRequest(format!("invalid order id: {raw}")))
}

/// Potong prefix /api kalau ada, lalu pecah jadi segmen.
fn segments(path: &str) -> Vec<&str> {
    let path = path.strip_prefix("/api").filter(|p| p.starts_with('/')).unwrap_or(path);
    path.split('/').filter(|s| !s.is_empty()).collect()
}

async fn route(state: AppState, req: Request<Body>) -> Result<Response<Body>, ApiError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "request");

    match (method, segments(&path).as_slice()) {
        (Method::POST, ["orders"]) => {
            let body = read_order_request(req).await?;
            info!(item = %body.item, amount = body.amount, "create order request");
            let order = state.service.submit(body).await?;
            Ok(json_response(StatusCode::OK, &order))
        }
        (Method::GET, ["orders", "stats"]) => Ok(json_response(StatusCode::OK, &state.service.stats())),
        (Method::GET, ["orders", id]) => {
            let order = state.service.find_by_id(parse_id(id)?).await?;
            Ok(json_response(StatusCode::OK, &order))
        }
        (Method::PUT, ["orders", id]) => {
            let id = parse_id(id)?;
            let body = read_order_request(req).await?;
            info!(order_id = id, item = %body.item, amount = body.amount, "update order request");
            let order = state.service.update_order(id, body).await?;
            Ok(json_response(StatusCode::OK, &order))
        }
        (Method::GET, ["metrics"]) => {
            let mut rsp = Response::new(Body::from(state.metrics.encode()));
            if let Ok(v) = HeaderValue::from_str(&state.metrics.content_type()) {
                rsp.headers_mut().insert(CONTENT_TYPE, v);
            }
            Ok(rsp)
        }
        (Method::GET, ["health"]) => Ok(json_response(StatusCode::OK, &json!({ "status": "ok" }))),
        (_, ["orders"]) | (_, ["orders", _]) | (_, ["metrics"]) | (_, ["health"]) => Err(ApiError::MethodNotAllowed),
        _ => Err(ApiError::NotFound(format!("no route for {path}"))),
    }
}

pub async fn handle(state: AppState, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    Ok(route(state, req).await.unwrap_or_else(ApiError::into_response))
}

/// Jalankan server sampai `shutdown` selesai. `on_bound` dipanggil dengan alamat aktual
/// (berguna kalau port 0).
pub async fn serve<F>(
    addr: SocketAddr,
    state: AppState,
    shutdown: F,
    on_bound: impl FnOnce(SocketAddr),
) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(state.clone(), req))) }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local = server.local_addr();
    info!(addr = %local, "http listening (orders + /metrics)");
    on_bound(local);
    server.with_graceful_shutdown(shutdown).await
}
