mod auth;
mod config;
mod conversation;
mod kinopoisk;
mod session;
mod sheets;
mod tg;

use dotenvy::dotenv;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::Config::from_env()?;
    let bot = Bot::new(config.telegram_token.clone());
    let kinopoisk = kinopoisk::KinopoiskClient::new(
        config.kinopoisk_api_key.clone(),
        config.kinopoisk_base_url.clone(),
    );

    // доступ к Google проверяем один раз на старте; интерактивная авторизация — только здесь
    let oauth = auth::OAuthClient::new();
    let store = auth::TokenStore::new(config.token_path.clone());
    let interactive = auth::LocalServerFlow::new(config.credentials_path.clone(), oauth.clone());
    let token = match auth::resolve_credentials(&store, &oauth, &interactive).await {
        Ok((token, source)) => {
            info!(?source, path = %config.token_path.display(), "google credentials ready");
            Some(token)
        }
        Err(e) => {
            error!(error = %e, "google authorization failed, spreadsheet appends will fail until it is redone");
            None
        }
    };
    let credentials = auth::CachedCredentials::new(store, oauth, token);
    let sheets = sheets::SheetsClient::new(
        config.sheets_base_url.clone(),
        config.spreadsheet_id.clone(),
        config.sheet_range.clone(),
        Arc::new(credentials),
    );

    let conversation = conversation::Conversation::new(
        Arc::new(kinopoisk),
        Arc::new(sheets),
        session::Sessions::new(),
    );

    info!("bot started, polling for updates");
    tg::run(bot, Arc::new(conversation)).await;
    Ok(())
}
