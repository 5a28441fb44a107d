use async_trait::async_trait;

use super::types::{Movie, UserRating};
use crate::upstream::{HttpClient, UpstreamError};

#[async_trait]
pub trait RatingsSource: Send + Sync {
    async fn user_rating(&self, user_id: &str) -> Result<UserRating, UpstreamError>;
}

#[async_trait]
pub trait MovieSource: Send + Sync {
    async fn movie(&self, movie_id: &str) -> Result<Movie, UpstreamError>;
}

/// `GET /ratingsdata/user/{userId}` on the ratings service.
pub struct HttpRatingsSource {
    client: HttpClient,
    service: String,
}

impl HttpRatingsSource {
    pub fn new(client: HttpClient, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }
}

#[async_trait]
impl RatingsSource for HttpRatingsSource {
    async fn user_rating(&self, user_id: &str) -> Result<UserRating, UpstreamError> {
        self.client
            .get_json(&self.service, &["ratingsdata", "user", user_id])
            .await
    }
}

/// `GET /movies/{movieId}` on the movie-info service.
pub struct HttpMovieSource {
    client: HttpClient,
    service: String,
}

impl HttpMovieSource {
    pub fn new(client: HttpClient, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }
}

#[async_trait]
impl MovieSource for HttpMovieSource {
    async fn movie(&self, movie_id: &str) -> Result<Movie, UpstreamError> {
        self.client.get_json(&self.service, &["movies", movie_id]).await
    }
}
