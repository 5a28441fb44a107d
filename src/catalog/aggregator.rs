//! # Catalog aggregation
//!
//! Builds a user's catalog from two chained upstream calls:
//! 1. ratings lookup for the user (one call)
//! 2. movie metadata per rating (fan-out, bounded)
//!
//! Each call goes through its dependency's circuit breaker and degrades to a
//! fixed fallback value, so assembling a catalog never fails.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use super::sources::{MovieSource, RatingsSource};
use super::types::{CatalogItem, CatalogResponse, Rating, UserRating};
use crate::resilience::CircuitBreaker;
use crate::upstream::UpstreamError;

pub const MOVIE_NOT_FOUND: &str = "Movie not found";

/// Placeholder returned when the ratings service cannot be reached.
pub fn fallback_user_rating(user_id: &str) -> UserRating {
    UserRating {
        user_id: user_id.to_string(),
        ratings: vec![Rating::new("0", 0)],
    }
}

/// Placeholder for a rating whose movie metadata could not be fetched. The
/// user's rating is kept.
pub fn fallback_catalog_item(rating: &Rating) -> CatalogItem {
    CatalogItem {
        name: MOVIE_NOT_FOUND.to_string(),
        description: String::new(),
        rating: rating.rating,
    }
}

pub struct CatalogAggregator {
    ratings: Arc<dyn RatingsSource>,
    movies: Arc<dyn MovieSource>,
    ratings_breaker: Arc<CircuitBreaker>,
    movies_breaker: Arc<CircuitBreaker>,
    max_concurrent_fetches: usize,
}

impl CatalogAggregator {
    pub fn new(
        ratings: Arc<dyn RatingsSource>,
        movies: Arc<dyn MovieSource>,
        ratings_breaker: Arc<CircuitBreaker>,
        movies_breaker: Arc<CircuitBreaker>,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            ratings,
            movies,
            ratings_breaker,
            movies_breaker,
            max_concurrent_fetches: max_concurrent_fetches.max(1),
        }
    }

    pub fn ratings_breaker(&self) -> &CircuitBreaker {
        &self.ratings_breaker
    }

    pub fn movies_breaker(&self) -> &CircuitBreaker {
        &self.movies_breaker
    }

    /// Catalog for `user_id`, one item per rating, in rating order.
    ///
    /// Movie lookups run concurrently, at most `max_concurrent_fetches` at a
    /// time. Results are put back in rating order after they complete, so a
    /// slow lookup only occupies its own slot.
    pub async fn get_catalog(&self, user_id: &str) -> CatalogResponse {
        let start = Instant::now();

        let user_rating = self.get_user_rating(user_id).await;

        let mut items: Vec<(usize, CatalogItem)> = stream::iter(user_rating.ratings.into_iter().enumerate())
            .map(|(idx, rating)| async move { (idx, self.get_catalog_item(&rating).await) })
            .buffer_unordered(self.max_concurrent_fetches)
            .collect()
            .await;
        items.sort_by_key(|(idx, _)| *idx);

        info!(
            user_id,
            items = items.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "catalog assembled"
        );

        items.into_iter().map(|(_, item)| item).collect()
    }

    pub async fn get_user_rating(&self, user_id: &str) -> UserRating {
        self.ratings_breaker
            .call_with_fallback(
                || self.ratings.user_rating(user_id),
                |_| fallback_user_rating(user_id),
            )
            .await
    }

    pub async fn get_catalog_item(&self, rating: &Rating) -> CatalogItem {
        self.movies_breaker
            .call_with_fallback(
                || async {
                    let movie = self.movies.movie(&rating.movie_id).await?;
                    debug!(movie_id = %rating.movie_id, name = %movie.name, "movie resolved");
                    Ok::<_, UpstreamError>(CatalogItem {
                        name: movie.name,
                        description: movie.description,
                        rating: rating.rating,
                    })
                },
                |_| fallback_catalog_item(rating),
            )
            .await
    }
}
