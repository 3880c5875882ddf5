//! Web server module

mod middleware;
mod routes;

use anyhow::Result;
use axum::{
    http::{header, HeaderValue},
    routing::get,
    Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer};
use tracing::info;

use crate::config::ServerConfig;
use crate::counter::VisitorCounter;
use middleware::PageViewLayer;

pub struct AppState {
    pub counter: VisitorCounter,
}

/// Build the application router
pub fn router(counter: VisitorCounter, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState {
        counter: counter.clone(),
    });

    let api = Router::new()
        .route("/visitor-stats", get(routes::visitor_stats))
        .route("/admin/stats", get(routes::admin_stats))
        // Stats change with every page view
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    Router::new()
        .route("/healthz", get(routes::healthz))
        .nest("/api", api)
        // Static files for everything else
        .fallback_service(ServeDir::new(&config.public_dir))
        .layer(PageViewLayer::new(counter, config.trust_proxy))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn start_server(
    config: &ServerConfig,
    counter: VisitorCounter,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(counter, config);

    let addr = format!("{}:{}", config.host, config.http_port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
