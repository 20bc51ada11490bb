// Доступ к Google Sheets через OAuth2.
// CachedCredentials — сохранённый токен с тихим обновлением, LocalServerFlow —
// согласие в браузере с редиректом на локальный порт. Интерактивную авторизацию
// запускает только resolve_credentials на старте, из разговора — никогда.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use axum::{
    extract::{Query, State},
    http::StatusCode as HttpStatus,
    routing::get,
    Router,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs,
    net::TcpListener,
    sync::{oneshot, Mutex},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// токен считаем протухшим чуть раньше реального срока
const EXPIRY_SKEW_SECS: i64 = 60;
/// сколько ждём, пока сервер редиректа допишет ответ браузеру
const REDIRECT_DRAIN_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("client secret file has neither `installed` nor `web` section")]
    NoClientSection,
    #[error("oauth request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("local redirect listener failed: {0}")]
    Listener(#[source] std::io::Error),
    #[error("authorization was denied: {0}")]
    Denied(String),
    #[error("oauth state mismatch in redirect")]
    StateMismatch,
    #[error("no usable Google credential, interactive authorization is required")]
    ReauthorizationRequired,
}

/* ======= token.json ======= */

/// Формат совместим с authorized-user файлом из google-auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl StoredToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            None => true,
            Some(expiry) => expiry - Duration::seconds(EXPIRY_SKEW_SECS) > now,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<StoredToken>, AuthError> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let data = fs::read(&self.path).await.map_err(|source| AuthError::Io {
            path: self.path.clone(),
            source,
        })?;
        let token = serde_json::from_slice(&data).map_err(|source| AuthError::Json {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(token))
    }

    pub async fn save(&self, token: &StoredToken) -> Result<(), AuthError> {
        let io_err = |source| AuthError::Io { path: self.path.clone(), source };
        let snapshot = serde_json::to_vec_pretty(token).map_err(|source| AuthError::Json {
            path: self.path.clone(),
            source,
        })?;
        // пишем во временный файл и переименовываем, чтобы не оставить полуфайл
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &snapshot).await.map_err(io_err)?;
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

/* ======= credentials.json ======= */

#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

impl ClientSecret {
    pub async fn load(path: &Path) -> Result<Self, AuthError> {
        let data = fs::read(path).await.map_err(|source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ClientSecretFile = serde_json::from_slice(&data).map_err(|source| {
            AuthError::Json { path: path.to_path_buf(), source }
        })?;
        file.installed.or(file.web).ok_or(AuthError::NoClientSection)
    }

    fn consent_url(&self, redirect_uri: &str, scopes: &[String], state: &str) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&access_type=offline&prompt=consent",
            self.auth_uri,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" ")),
            urlencoding::encode(state),
        )
    }
}

/* ======= token endpoint ======= */

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Clone, Default)]
pub struct OAuthClient {
    http: Client,
}

impl OAuthClient {
    pub fn new() -> Self {
        Self { http: Client::new() }
    }

    /// Обновить access token по refresh token. Старый refresh token сохраняется,
    /// если сервер не выдал новый.
    pub async fn refresh(&self, token: &StoredToken) -> Result<StoredToken, AuthError> {
        let Some(refresh_token) = token.refresh_token.as_deref() else {
            return Err(AuthError::ReauthorizationRequired);
        };
        let resp = self
            .token_request(
                &token.token_uri,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", token.client_id.as_str()),
                    ("client_secret", token.client_secret.as_str()),
                ],
            )
            .await?;
        let mut fresh = token.clone();
        fresh.token = resp.access_token;
        fresh.expiry = expiry_from(resp.expires_in);
        if let Some(rt) = resp.refresh_token {
            fresh.refresh_token = Some(rt);
        }
        if let Some(scope) = resp.scope {
            fresh.scopes = scope.split_whitespace().map(str::to_string).collect();
        }
        Ok(fresh)
    }

    pub async fn exchange_code(
        &self,
        secret: &ClientSecret,
        code: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<StoredToken, AuthError> {
        let resp = self
            .token_request(
                &secret.token_uri,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                    ("client_id", secret.client_id.as_str()),
                    ("client_secret", secret.client_secret.as_str()),
                ],
            )
            .await?;
        Ok(StoredToken {
            token: resp.access_token,
            refresh_token: resp.refresh_token,
            token_uri: secret.token_uri.clone(),
            client_id: secret.client_id.clone(),
            client_secret: secret.client_secret.clone(),
            scopes: resp
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| scopes.to_vec()),
            expiry: expiry_from(resp.expires_in),
        })
    }

    async fn token_request(
        &self,
        token_uri: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, AuthError> {
        let resp = self.http.post(token_uri).form(form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint { status, body });
        }
        Ok(resp.json().await?)
    }
}

fn expiry_from(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in.map(|secs| Utc::now() + Duration::seconds(secs))
}

/* ======= providers ======= */

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;
}

#[async_trait]
pub trait InteractiveAuthorizer: Send + Sync {
    async fn authorize(&self) -> Result<StoredToken, AuthError>;
}

/// Сохранённый токен + тихое обновление. Если обновить нечем — ошибка,
/// интерактивную авторизацию отсюда не запускаем.
pub struct CachedCredentials {
    store: TokenStore,
    oauth: OAuthClient,
    current: Mutex<Option<StoredToken>>,
}

impl CachedCredentials {
    pub fn new(store: TokenStore, oauth: OAuthClient, token: Option<StoredToken>) -> Self {
        Self { store, oauth, current: Mutex::new(token) }
    }
}

#[async_trait]
impl CredentialProvider for CachedCredentials {
    async fn access_token(&self) -> Result<String, AuthError> {
        let mut guard = self.current.lock().await;
        if guard.is_none() {
            *guard = self.store.load().await?;
        }
        let Some(token) = guard.as_ref() else {
            return Err(AuthError::ReauthorizationRequired);
        };
        if token.is_valid(Utc::now()) {
            return Ok(token.token.clone());
        }
        info!("google access token expired, refreshing");
        let fresh = self.oauth.refresh(token).await?;
        self.store.save(&fresh).await?;
        let access = fresh.token.clone();
        *guard = Some(fresh);
        Ok(access)
    }
}

/// Интерактивная авторизация: ссылка в лог, редирект на локальный порт.
pub struct LocalServerFlow {
    secret_path: PathBuf,
    oauth: OAuthClient,
    scopes: Vec<String>,
}

impl LocalServerFlow {
    pub fn new(secret_path: impl Into<PathBuf>, oauth: OAuthClient) -> Self {
        Self {
            secret_path: secret_path.into(),
            oauth,
            scopes: vec![SHEETS_SCOPE.to_string()],
        }
    }
}

#[async_trait]
impl InteractiveAuthorizer for LocalServerFlow {
    async fn authorize(&self) -> Result<StoredToken, AuthError> {
        let secret = ClientSecret::load(&self.secret_path).await?;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(AuthError::Listener)?;
        let port = listener.local_addr().map_err(AuthError::Listener)?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}/");
        let state = Uuid::new_v4().simple().to_string();

        let url = secret.consent_url(&redirect_uri, &self.scopes, &state);
        warn!(%url, "open this URL in a browser to grant Google Sheets access");

        let code = wait_for_code(listener, &state).await?;
        info!("authorization code received, exchanging for a token");
        self.oauth.exchange_code(&secret, &code, &redirect_uri, &self.scopes).await
    }
}

/* ======= редирект на локальный порт ======= */

#[derive(Debug, PartialEq, Eq)]
enum Redirect {
    Code(String),
    Denied(String),
    StateMismatch,
    Other,
}

fn parse_redirect(params: &HashMap<String, String>, expected_state: &str) -> Redirect {
    if let Some(err) = params.get("error") {
        return Redirect::Denied(err.clone());
    }
    let Some(code) = params.get("code") else {
        return Redirect::Other;
    };
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Redirect::StateMismatch;
    }
    Redirect::Code(code.clone())
}

#[derive(Clone)]
struct RedirectState {
    expected_state: Arc<str>,
    // первый осмысленный редирект забирает отправителя, остальные игнорируются
    outcome: Arc<std::sync::Mutex<Option<oneshot::Sender<Redirect>>>>,
}

async fn on_redirect(
    State(st): State<RedirectState>,
    Query(params): Query<HashMap<String, String>>,
) -> (HttpStatus, &'static str) {
    let redirect = parse_redirect(&params, &st.expected_state);
    let reply = match &redirect {
        Redirect::Code(_) => (HttpStatus::OK, "Авторизация завершена, окно можно закрыть."),
        Redirect::Denied(_) => (HttpStatus::OK, "Авторизация отклонена."),
        Redirect::StateMismatch => (HttpStatus::BAD_REQUEST, "Неверный state."),
        Redirect::Other => return (HttpStatus::NOT_FOUND, ""),
    };
    let sender = st.outcome.lock().ok().and_then(|mut slot| slot.take());
    if let Some(tx) = sender {
        let _ = tx.send(redirect);
    }
    reply
}

fn redirect_router(expected_state: &str, tx: oneshot::Sender<Redirect>) -> Router {
    let state = RedirectState {
        expected_state: Arc::from(expected_state),
        outcome: Arc::new(std::sync::Mutex::new(Some(tx))),
    };
    Router::new().route("/", get(on_redirect)).with_state(state)
}

/// Поднимаем сервер на уже открытом листенере и ждём редирект браузера.
/// Посторонние запросы (favicon, preconnect) сервер обслуживает сам.
async fn wait_for_code(listener: TcpListener, state: &str) -> Result<String, AuthError> {
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, redirect_router(state, outcome_tx)).with_graceful_shutdown(async move {
        let _ = stop_rx.await;
    });
    let server = tokio::spawn(async move { server.await });

    let outcome = outcome_rx.await;
    let _ = stop_tx.send(());
    match tokio::time::timeout(std::time::Duration::from_secs(REDIRECT_DRAIN_SECS), server).await {
        Ok(Ok(Err(e))) => debug!(error = %e, "redirect server stopped with error"),
        Err(_) => debug!("redirect server did not drain in time"),
        _ => {}
    }

    match outcome {
        Ok(Redirect::Code(code)) => Ok(code),
        Ok(Redirect::Denied(reason)) => Err(AuthError::Denied(reason)),
        Ok(Redirect::StateMismatch) => Err(AuthError::StateMismatch),
        Ok(Redirect::Other) | Err(_) => Err(AuthError::Listener(std::io::Error::other(
            "redirect server stopped before a code arrived",
        ))),
    }
}

/* ======= startup policy ======= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Saved,
    Refreshed,
    Interactive,
}

/// Стартовая проверка доступа к Google: сохранённый токен → обновление →
/// интерактивная авторизация (ровно один раз). Результат пишется в `store`.
pub async fn resolve_credentials(
    store: &TokenStore,
    oauth: &OAuthClient,
    interactive: &dyn InteractiveAuthorizer,
) -> Result<(StoredToken, CredentialSource), AuthError> {
    let saved = match store.load().await {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, path = %store.path().display(), "saved token is unreadable, ignoring it");
            None
        }
    };

    if let Some(token) = saved {
        if token.is_valid(Utc::now()) {
            return Ok((token, CredentialSource::Saved));
        }
        if token.refresh_token.is_some() {
            match oauth.refresh(&token).await {
                Ok(fresh) => {
                    store.save(&fresh).await?;
                    return Ok((fresh, CredentialSource::Refreshed));
                }
                Err(e) => warn!(error = %e, "token refresh failed"),
            }
        }
    }

    info!(path = %store.path().display(), "starting interactive Google authorization");
    let token = interactive.authorize().await?;
    store.save(&token).await?;
    Ok((token, CredentialSource::Interactive))
}
