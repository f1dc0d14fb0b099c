pub mod app_routes;
pub mod config;
pub mod error;
pub mod request_meta;
pub mod rpc;
pub mod state;
pub mod stream;

use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::state::AppState;

/// Every HTTP and WebSocket route of the control plane.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(app_routes::health))
        .route("/api/websocket", get(stream::websocket))
        .route("/api/:category/rpc/:method", post(rpc::call))
        .route("/api/app-resources/:id/base", get(app_routes::base))
        .route("/api/app-resources/:id/bundle.js", get(app_routes::bundle))
        .route("/api/app-resources/:id/client.meta.json", get(app_routes::metafile))
        .layer(middleware::from_fn(request_meta::request_id))
        .with_state(state)
}


#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::request_meta::REQUEST_ID_HEADER;

    #[tokio::test]
    async fn request_ids_are_echoed_or_minted() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_support::state(dir.path()).await);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/health")
                    .header(REQUEST_ID_HEADER, "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "req-42");

        let resp = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let minted = resp.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(minted).is_ok());
    }

    #[tokio::test]
    async fn rpc_needs_post() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_support::state(dir.path()).await);
        let resp = app
            .oneshot(Request::get("/api/internal/rpc/ListProcesses").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
