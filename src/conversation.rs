use crate::kinopoisk::{MovieRecord, MovieSearch};
use crate::session::{Phase, Sessions};
use crate::sheets::SheetAppender;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use teloxide::types::ChatId;
use tracing::{error, info, warn};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/* ====== Кнопки ====== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SearchFilm,
    SearchAnother,
    AddToSheet,
}

impl Action {
    pub fn payload(self) -> &'static str {
        match self {
            Action::SearchFilm => "search_film",
            Action::SearchAnother => "search_another",
            Action::AddToSheet => "add_to_sheet",
        }
    }

    pub fn from_payload(data: &str) -> Option<Self> {
        match data {
            "search_film" => Some(Action::SearchFilm),
            "search_another" => Some(Action::SearchAnother),
            "add_to_sheet" => Some(Action::AddToSheet),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Action::SearchFilm => "Найти фильм",
            Action::SearchAnother => "Найти другой фильм",
            Action::AddToSheet => "Добавить в Google Таблицу",
        }
    }
}

/// Что отправить в чат. Кнопки — по одной в строке.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text { text: String, html: bool, buttons: Vec<Action> },
    Photo { url: String, caption: String },
}

impl Reply {
    fn plain(text: impl Into<String>) -> Self {
        Reply::Text { text: text.into(), html: false, buttons: Vec::new() }
    }

    fn with_buttons(text: impl Into<String>, buttons: Vec<Action>) -> Self {
        Reply::Text { text: text.into(), html: false, buttons }
    }
}

pub const GREETING: &str = "Привет! Нажмите на кнопку ниже, чтобы начать поиск фильма.";
pub const ASK_TITLE: &str = "Введите название фильма:";
pub const ASK_ANOTHER_TITLE: &str = "Введите название другого фильма.";
pub const WHAT_NEXT: &str = "Что вы хотите сделать дальше?";
pub const NOT_FOUND: &str = "Фильм не найден. Попробуйте ввести другое название.";
pub const SHEET_FAILED: &str = "Ошибка при добавлении данных в таблицу.";
pub const NOTHING_SELECTED: &str = "Сначала найдите фильм.";

/// Сценарий разговора без привязки к Telegram: событие → список ответов.
pub struct Conversation {
    search: Arc<dyn MovieSearch>,
    sheet: Arc<dyn SheetAppender>,
    sessions: Sessions,
}

impl Conversation {
    pub fn new(search: Arc<dyn MovieSearch>, sheet: Arc<dyn SheetAppender>, sessions: Sessions) -> Self {
        Self { search, sheet, sessions }
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    pub async fn start(&self, chat: ChatId) -> Vec<Reply> {
        self.sessions.set_phase(chat, Phase::Idle).await;
        vec![Reply::with_buttons(GREETING, vec![Action::SearchFilm])]
    }

    /// Любой текст (не команда) — это название фильма, в каком бы состоянии ни был чат.
    pub async fn text(&self, chat: ChatId, raw: &str) -> Vec<Reply> {
        let query = normalize_query(raw);
        if query.is_empty() {
            return Vec::new();
        }
        let phase = self.sessions.get(chat).await.phase;
        info!(chat = chat.0, ?phase, %query, "movie title received");

        let movie = match self.search.find_first(&query).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                info!(chat = chat.0, %query, "movie not found");
                return self.not_found(chat).await;
            }
            Err(e) => {
                warn!(chat = chat.0, %query, error = %e, "movie lookup failed");
                return self.not_found(chat).await;
            }
        };

        let caption = movie_caption(&movie);
        let card = match &movie.poster_url {
            Some(url) => Reply::Photo { url: url.clone(), caption },
            None => Reply::Text { text: caption, html: true, buttons: Vec::new() },
        };
        self.sessions.show_result(chat, movie).await;

        vec![
            card,
            Reply::with_buttons(WHAT_NEXT, vec![Action::SearchAnother, Action::AddToSheet]),
        ]
    }

    /// Ждём новое название; найденный ранее фильм остаётся текущим.
    async fn not_found(&self, chat: ChatId) -> Vec<Reply> {
        self.sessions.set_phase(chat, Phase::AwaitingTitle).await;
        vec![Reply::plain(NOT_FOUND)]
    }

    pub async fn action(&self, chat: ChatId, action: Action) -> Vec<Reply> {
        match action {
            Action::SearchFilm => {
                self.sessions.set_phase(chat, Phase::AwaitingTitle).await;
                vec![Reply::plain(ASK_TITLE)]
            }
            Action::SearchAnother => {
                self.sessions.set_phase(chat, Phase::AwaitingTitle).await;
                vec![Reply::plain(ASK_ANOTHER_TITLE)]
            }
            Action::AddToSheet => vec![self.add_to_sheet(chat).await],
        }
    }

    async fn add_to_sheet(&self, chat: ChatId) -> Reply {
        let Some(movie) = self.sessions.current(chat).await else {
            return Reply::plain(NOTHING_SELECTED);
        };
        info!(chat = chat.0, title = %movie.title, "adding movie to spreadsheet");
        match self.sheet.append_movie(&movie).await {
            Ok(()) => Reply::plain(format!("Фильм '{}' успешно добавлен в Google Таблицу!", movie.title)),
            Err(e) => {
                error!(chat = chat.0, title = %movie.title, error = %e, "failed to append row");
                Reply::plain(SHEET_FAILED)
            }
        }
    }
}

/* ====== Вспомогательные ====== */

pub fn normalize_query(raw: &str) -> String {
    WHITESPACE.replace_all(raw.trim(), " ").into_owned()
}

pub fn movie_caption(m: &MovieRecord) -> String {
    let year = m.year.map(|y| y.to_string()).unwrap_or_else(|| "—".to_string());
    format!(
        "<b>Название:</b> {}\n<b>Год:</b> {}\n<b>Жанры:</b> {}\n<b>Описание:</b> {}",
        html_escape(&m.title),
        year,
        html_escape(&m.genres),
        html_escape(&m.description)
    )
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
