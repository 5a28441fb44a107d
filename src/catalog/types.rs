use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub movie_id: String,
    pub rating: i32,
}

impl Rating {
    pub fn new(movie_id: impl Into<String>, rating: i32) -> Self {
        Self {
            movie_id: movie_id.into(),
            rating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRating {
    pub user_id: String,
    #[serde(default)]
    pub ratings: Vec<Rating>,
}

// Movie-info responses may omit the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub name: String,
    pub description: String,
    pub rating: i32,
}

pub type CatalogResponse = Vec<CatalogItem>;
