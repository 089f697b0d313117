use axum::Router;
use eyre::Context;
use eyre::Result;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::{AppState, Config};

#[utoipa::path(get, path = "/metrics", responses((status = OK, body = String)))]
async fn metrics() -> crate::error::Result<String> {
    let metrics = prometheus::default_registry().gather();
    let report = prometheus::TextEncoder::new().encode_to_string(&metrics)?;
    Ok(report)
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .nest("/api/v1/github", crate::github::serve::router())
        .nest("/api/v1", crate::job::serve::router())
        .routes(routes!(metrics))
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::catch_panic::CatchPanicLayer::new())
                .layer(sentry_tower::NewSentryLayer::new_from_top())
                .layer(sentry_tower::SentryHttpLayer::with_transaction()),
        )
}

async fn serve(app_state: AppState) -> Result<()> {
    let addr = format!("0.0.0.0:{}", app_state.config.port);
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err("bind")?;

    let (api_router, _) = router().split_for_parts();
    let api_router = api_router.with_state(app_state);

    let app = Router::new().merge(api_router);

    axum::serve(listener, app).await.wrap_err("serve")
}

pub fn main(config: Config) -> Result<()> {
    let _sentry = config.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.to_string(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                ..Default::default()
            },
        ))
    });

    let _recorder = metrics_prometheus::install();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async {
            let app_state = AppState::new(config).await?;
            serve(app_state).await
        })
}
