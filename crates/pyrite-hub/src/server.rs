use crate::broadcast::Hub;
use crate::control;
use crate::registry::Registry;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub hub: Arc<Hub>,
    pub allow_remote: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .merge(control::routes())
        .layer(middleware::from_fn_with_state(state.clone(), loopback_only))
        .with_state(state)
}

async fn loopback_only(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !state.allow_remote && !is_allowed(addr) {
        warn!(event = "remote_rejected", remote = %addr, path = %request.uri().path());
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

fn is_allowed(addr: SocketAddr) -> bool {
    addr.ip().is_loopback()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_loopback_is_allowed_by_default() {
        assert!(is_allowed("127.0.0.1:9000".parse().expect("addr")));
        assert!(is_allowed("[::1]:9000".parse().expect("addr")));
        assert!(!is_allowed("10.0.0.5:9000".parse().expect("addr")));
    }
}
