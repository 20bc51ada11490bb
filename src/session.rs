use crate::kinopoisk::MovieRecord;
use std::{collections::HashMap, sync::Arc};
use teloxide::types::ChatId;
use tokio::sync::RwLock;

/// Где находится разговор в конкретном чате.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    AwaitingTitle,
    ShowingResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub phase: Phase,
    /// последний успешно найденный фильм
    pub current: Option<MovieRecord>,
}

/// Состояние разговоров в памяти, по одному слоту на чат. После рестарта пусто.
#[derive(Clone, Default)]
pub struct Sessions {
    inner: Arc<RwLock<HashMap<ChatId, Session>>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, chat: ChatId) -> Session {
        let guard = self.inner.read().await;
        guard.get(&chat).cloned().unwrap_or_default()
    }

    pub async fn current(&self, chat: ChatId) -> Option<MovieRecord> {
        let guard = self.inner.read().await;
        guard.get(&chat).and_then(|s| s.current.clone())
    }

    pub async fn set_phase(&self, chat: ChatId, phase: Phase) {
        let mut guard = self.inner.write().await;
        guard.entry(chat).or_default().phase = phase;
    }

    /// Запомнить найденный фильм и перейти к показу результата.
    pub async fn show_result(&self, chat: ChatId, movie: MovieRecord) {
        let mut guard = self.inner.write().await;
        let entry = guard.entry(chat).or_default();
        entry.current = Some(movie);
        entry.phase = Phase::ShowingResult;
    }
}
