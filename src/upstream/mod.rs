pub mod client;
pub mod error;
pub mod resolver;

pub use client::HttpClient;
pub use error::UpstreamError;
pub use resolver::{ServiceResolver, StaticResolver};
