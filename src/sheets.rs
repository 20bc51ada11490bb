use crate::auth::{AuthError, CredentialProvider};
use crate::kinopoisk::MovieRecord;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Все причины, по которым строка не записалась. Пользователю показываем одно
/// общее сообщение, подробности только в лог.
#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("google auth failed: {0}")]
    Auth(#[from] AuthError),
    #[error("sheets request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sheets api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[async_trait]
pub trait SheetAppender: Send + Sync {
    async fn append_movie(&self, movie: &MovieRecord) -> Result<(), SheetsError>;
}

pub struct SheetsClient {
    http: Client,
    base_url: String,
    spreadsheet_id: String,
    range: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl SheetsClient {
    pub fn new(
        base_url: impl Into<String>,
        spreadsheet_id: impl Into<String>,
        range: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            range: range.into(),
            credentials,
        }
    }

    fn append_url(&self) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}:append?valueInputOption=RAW",
            self.base_url,
            urlencoding::encode(&self.spreadsheet_id),
            urlencoding::encode(&self.range)
        )
    }
}

/// Строка таблицы: название, год, жанры. Без года — пустая ячейка.
pub fn movie_row(movie: &MovieRecord) -> Vec<Value> {
    vec![
        json!(movie.title),
        movie.year.map(Value::from).unwrap_or_else(|| json!("")),
        json!(movie.genres),
    ]
}

#[async_trait]
impl SheetAppender for SheetsClient {
    async fn append_movie(&self, movie: &MovieRecord) -> Result<(), SheetsError> {
        let token = self.credentials.access_token().await?;
        let body = json!({ "values": [movie_row(movie)] });
        let resp = self
            .http
            .post(self.append_url())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SheetsError::Api { status, body });
        }
        info!(title = %movie.title, range = %self.range, "row appended");
        Ok(())
    }
}
