use axum::{extract::Request, http::StatusCode, response::IntoResponse, routing::get, Router};
use std::sync::Arc;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::catalog::{CatalogAggregator, HttpMovieSource, HttpRatingsSource};
use crate::config::Config;
use crate::resilience::CircuitBreaker;
use crate::upstream::{HttpClient, StaticResolver};
use crate::ServerError;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<CatalogAggregator>,
}

impl AppState {
    pub fn new(aggregator: Arc<CatalogAggregator>) -> Self {
        Self { aggregator }
    }

    /// Wires resolver, client, sources and one breaker per dependency. The
    /// breakers live as long as the returned state.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let resolver = Arc::new(StaticResolver::new(&config.services));
        let client = HttpClient::new(resolver, config.client.connect_timeout())?;

        let ratings_policy = config.ratings_policy();
        let movie_info_policy = config.movie_info_policy();
        info!(
            service = %config.ratings.service,
            timeout_ms = ratings_policy.timeout.as_millis() as u64,
            window = ratings_policy.window_size,
            threshold = ratings_policy.error_threshold_percentage,
            cooldown_ms = ratings_policy.cooldown.as_millis() as u64,
            "ratings breaker"
        );
        info!(
            service = %config.movie_info.service,
            timeout_ms = movie_info_policy.timeout.as_millis() as u64,
            window = movie_info_policy.window_size,
            threshold = movie_info_policy.error_threshold_percentage,
            cooldown_ms = movie_info_policy.cooldown.as_millis() as u64,
            "movie-info breaker"
        );

        let aggregator = CatalogAggregator::new(
            Arc::new(HttpRatingsSource::new(client.clone(), config.ratings.service.clone())),
            Arc::new(HttpMovieSource::new(client, config.movie_info.service.clone())),
            Arc::new(CircuitBreaker::new(config.ratings.service.clone(), ratings_policy)),
            Arc::new(CircuitBreaker::new(config.movie_info.service.clone(), movie_info_policy)),
            config.client.max_concurrent_fetches,
        );

        Ok(Self::new(Arc::new(aggregator)))
    }
}

pub fn build_router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/catalog/:user_id", get(crate::catalog::get_catalog))
        .fallback(fallback_handler);

    let app = with_layers(routes).with_state(state);

    Router::new()
        .fallback_service(app)
        .layer(axum::middleware::from_fn(crate::middleware::normalize_path))
}

fn with_layers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(CatchPanicLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CompressionLayer::new())
        .layer(axum::middleware::from_fn(crate::middleware::log_request))
        .layer(TraceLayer::new_for_http())
}

async fn fallback_handler(req: Request<axum::body::Body>) -> impl IntoResponse {
    if req.method() == axum::http::Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    StatusCode::NOT_FOUND.into_response()
}
