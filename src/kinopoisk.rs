use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};

pub const NO_DESCRIPTION: &str = "Описание отсутствует.";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("kinopoisk returned status {0}")]
    Status(StatusCode),
    #[error("kinopoisk request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Нормализованная карточка фильма — то, что показываем и пишем в таблицу.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieRecord {
    pub title: String,
    pub year: Option<i32>,
    pub genres: String,
    pub description: String,
    pub poster_url: Option<String>,
}

#[async_trait]
pub trait MovieSearch: Send + Sync {
    /// `Ok(None)` — ничего не нашлось, это не ошибка.
    async fn find_first(&self, title: &str) -> Result<Option<MovieRecord>, LookupError>;
}

#[derive(Clone)]
pub struct KinopoiskClient {
    api_key: String,
    base_url: String,
    http: Client,
}

impl KinopoiskClient {
    pub fn new(api_key: String, base_url: impl Into<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }
}

#[async_trait]
impl MovieSearch for KinopoiskClient {
    async fn find_first(&self, title: &str) -> Result<Option<MovieRecord>, LookupError> {
        info!(%title, "kinopoisk lookup");
        let url = format!(
            "{}/v1.3/movie?token={}&field=name&search={}&limit=1",
            self.base_url,
            urlencoding::encode(&self.api_key),
            urlencoding::encode(title)
        );
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            error!(%status, %title, "kinopoisk api error");
            return Err(LookupError::Status(status));
        }
        let data: SearchResp = resp.json().await?;
        debug!(docs = data.docs.len(), "kinopoisk response");
        Ok(data.docs.into_iter().next().map(|doc| doc.into_record(title)))
    }
}

/* ======= DTOs ======= */

#[derive(Deserialize, Debug)]
struct SearchResp {
    #[serde(default)]
    docs: Vec<Doc>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Doc {
    name: Option<String>,
    alternative_name: Option<String>,
    year: Option<i32>,
    genres: Option<Vec<Genre>>,
    description: Option<String>,
    poster: Option<Poster>,
}

#[derive(Deserialize, Debug)]
struct Genre {
    name: String,
}

#[derive(Deserialize, Debug)]
struct Poster {
    url: Option<String>,
}

impl Doc {
    fn into_record(self, query: &str) -> MovieRecord {
        let title = self
            .name
            .filter(|n| !n.trim().is_empty())
            .or(self.alternative_name.filter(|n| !n.trim().is_empty()))
            .unwrap_or_else(|| query.to_string());
        let genres = self.genres.unwrap_or_default().into_iter().map(|g| g.name).collect::<Vec<_>>().join(", ");
        let description = self
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| NO_DESCRIPTION.to_string());
        MovieRecord {
            title,
            year: self.year,
            genres,
            description,
            poster_url: self.poster.and_then(|p| p.url),
        }
    }
}
