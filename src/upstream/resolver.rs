use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::UpstreamError;

/// Maps a logical service name to the base URL of one of its instances.
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, service: &str) -> Result<String, UpstreamError>;
}

struct Endpoints {
    urls: Vec<String>,
    next: AtomicUsize,
}

/// Fixed table of service instances taken from the config file. Each lookup
/// hands out the next instance in turn.
pub struct StaticResolver {
    services: HashMap<String, Endpoints>,
}

impl StaticResolver {
    pub fn new(services: &HashMap<String, Vec<String>>) -> Self {
        let services = services
            .iter()
            .filter(|(_, urls)| !urls.is_empty())
            .map(|(name, urls)| {
                let urls = urls.iter().map(|u| u.trim_end_matches('/').to_string()).collect();
                (
                    name.clone(),
                    Endpoints {
                        urls,
                        next: AtomicUsize::new(0),
                    },
                )
            })
            .collect();

        Self { services }
    }
}

impl ServiceResolver for StaticResolver {
    fn resolve(&self, service: &str) -> Result<String, UpstreamError> {
        let endpoints = self
            .services
            .get(service)
            .ok_or_else(|| UpstreamError::Connection(format!("no instances known for {}", service)))?;

        let idx = endpoints.next.fetch_add(1, Ordering::Relaxed) % endpoints.urls.len();
        let url = &endpoints.urls[idx];
        debug!(service, url = %url, "resolved service");
        Ok(url.clone())
    }
}
