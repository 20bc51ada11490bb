use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_SHEET_RANGE: &str = "Sheet1!A:C";
pub const DEFAULT_KINOPOISK_BASE_URL: &str = "https://api.kinopoisk.dev";
pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is missing")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: String,
    pub kinopoisk_api_key: String,
    pub kinopoisk_base_url: String,
    pub spreadsheet_id: String,
    pub sheet_range: String,
    pub sheets_base_url: String,
    /// client secret для первой авторизации в Google
    pub credentials_path: PathBuf,
    /// сохранённый (и обновляемый) токен
    pub token_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Сборка конфига из произвольного источника переменных (удобно в тестах).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let telegram_token = get("TELEGRAM_BOT_TOKEN")
            .or_else(|| get("TELOXIDE_TOKEN"))
            .ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;
        // KINPOISK_API_KEY — старое имя с опечаткой, оставлено для совместимости с .env
        let kinopoisk_api_key = get("KINOPOISK_API_KEY")
            .or_else(|| get("KINPOISK_API_KEY"))
            .ok_or(ConfigError::Missing("KINOPOISK_API_KEY"))?;
        let spreadsheet_id = get("SPREADSHEET_ID").ok_or(ConfigError::Missing("SPREADSHEET_ID"))?;

        Ok(Self {
            telegram_token,
            kinopoisk_api_key,
            kinopoisk_base_url: get("KINOPOISK_BASE_URL")
                .unwrap_or_else(|| DEFAULT_KINOPOISK_BASE_URL.to_string()),
            spreadsheet_id,
            sheet_range: get("SHEET_RANGE").unwrap_or_else(|| DEFAULT_SHEET_RANGE.to_string()),
            sheets_base_url: get("SHEETS_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SHEETS_BASE_URL.to_string()),
            credentials_path: get("GOOGLE_CREDENTIALS_PATH")
                .unwrap_or_else(|| "credentials.json".to_string())
                .into(),
            token_path: get("GOOGLE_TOKEN_PATH")
                .unwrap_or_else(|| "token.json".to_string())
                .into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_fill_optional_values() {
        let cfg = Config::from_lookup(env(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("KINOPOISK_API_KEY", "kp"),
            ("SPREADSHEET_ID", "sheet-1"),
        ]))
        .expect("config");

        assert_eq!(cfg.telegram_token, "123:abc");
        assert_eq!(cfg.sheet_range, "Sheet1!A:C");
        assert_eq!(cfg.kinopoisk_base_url, DEFAULT_KINOPOISK_BASE_URL);
        assert_eq!(cfg.sheets_base_url, DEFAULT_SHEETS_BASE_URL);
        assert_eq!(cfg.credentials_path, PathBuf::from("credentials.json"));
        assert_eq!(cfg.token_path, PathBuf::from("token.json"));
    }

    #[test]
    fn legacy_kinopoisk_key_name_is_accepted() {
        let cfg = Config::from_lookup(env(&[
            ("TELOXIDE_TOKEN", "123:abc"),
            ("KINPOISK_API_KEY", "legacy"),
            ("SPREADSHEET_ID", "sheet-1"),
        ]))
        .expect("config");

        assert_eq!(cfg.kinopoisk_api_key, "legacy");
        assert_eq!(cfg.telegram_token, "123:abc");
    }

    #[test]
    fn blank_required_value_counts_as_missing() {
        let err = Config::from_lookup(env(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("KINOPOISK_API_KEY", "kp"),
            ("SPREADSHEET_ID", "   "),
        ]))
        .unwrap_err();

        assert_eq!(err, ConfigError::Missing("SPREADSHEET_ID"));
    }
}
