pub mod aggregator;
pub mod handlers;
pub mod sources;
pub mod types;

pub use aggregator::{fallback_catalog_item, fallback_user_rating, CatalogAggregator, MOVIE_NOT_FOUND};
pub use handlers::*;
pub use sources::{HttpMovieSource, HttpRatingsSource, MovieSource, RatingsSource};
pub use types::*;
