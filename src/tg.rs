use crate::conversation::{Action, Conversation, Reply};
use once_cell::sync::Lazy;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::{sync::Arc, time::Duration};
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    prelude::*,
    types::{CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode},
    utils::command::BotCommands,
};
use tracing::{debug, error, warn};
use unicode_segmentation::UnicodeSegmentation;

/// лимиты Telegram
const CAPTION_LIMIT: usize = 1024;
const TEXT_LIMIT: usize = 4096;

/* ====== Команды ====== */
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Команды:")]
enum Command {
    #[command(description = "начать поиск фильма")]
    Start,
    #[command(description = "помощь")]
    Help,
}

pub async fn run(bot: Bot, conversation: Arc<Conversation>) {
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!(error = %e, "failed to register bot commands");
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint({
                            let conversation = conversation.clone();
                            move |bot: Bot, msg: Message, cmd: Command| {
                                let conversation = conversation.clone();
                                async move { on_command(bot, msg, cmd, &conversation).await }
                            }
                        }),
                )
                .branch({
                    let conversation = conversation.clone();
                    dptree::endpoint(move |bot: Bot, msg: Message| {
                        let conversation = conversation.clone();
                        async move { on_text(bot, msg, &conversation).await }
                    })
                }),
        )
        .branch(Update::filter_callback_query().endpoint({
            let conversation = conversation.clone();
            move |bot: Bot, q: CallbackQuery| {
                let conversation = conversation.clone();
                async move { on_callback(bot, q, &conversation).await }
            }
        }));

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn on_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    conversation: &Conversation,
) -> ResponseResult<()> {
    match cmd {
        Command::Start => {
            let replies = conversation.start(msg.chat.id).await;
            send_replies(&bot, msg.chat.id, replies).await;
        }
        Command::Help => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string()).await?;
        }
    }
    Ok(())
}

/* ====== Название фильма ====== */
async fn on_text(bot: Bot, msg: Message, conversation: &Conversation) -> ResponseResult<()> {
    let Some(text) = msg.text() else { return Ok(()); };
    // незнакомые команды молча пропускаем
    if text.starts_with('/') {
        debug!(chat = msg.chat.id.0, %text, "unknown command ignored");
        return Ok(());
    }
    let replies = conversation.text(msg.chat.id, text).await;
    send_replies(&bot, msg.chat.id, replies).await;
    Ok(())
}

/* ====== Callback-кнопки ======
   search_film    — начать поиск
   search_another — искать другой фильм
   add_to_sheet   — записать текущий фильм в таблицу
*/
async fn on_callback(bot: Bot, q: CallbackQuery, conversation: &Conversation) -> ResponseResult<()> {
    let action = q.data.as_deref().and_then(Action::from_payload);
    let Some(action) = action else {
        bot.answer_callback_query(q.id.clone()).text("Неизвестная команда").await?;
        return Ok(());
    };
    bot.answer_callback_query(q.id.clone()).await?;

    let Some(chat_id) = q.message.as_ref().map(|m| m.chat().id) else {
        warn!(payload = action.payload(), "callback without message, nothing to answer to");
        return Ok(());
    };
    let replies = conversation.action(chat_id, action).await;
    send_replies(&bot, chat_id, replies).await;
    Ok(())
}

/* ====== Отправка ответов ====== */

/// Сбой одного ответа (например, карточки) не отменяет остальные:
/// кнопки «что дальше» должны дойти в любом случае.
async fn send_replies(bot: &Bot, chat: ChatId, replies: Vec<Reply>) {
    for reply in replies {
        let sent = match reply {
            Reply::Text { text, html, buttons } => send_text(bot, chat, &text, html, &buttons).await,
            Reply::Photo { url, caption } => send_poster(bot, chat, &url, &caption).await,
        };
        if let Err(e) = sent {
            error!(chat = chat.0, error = %e, "failed to send reply");
        }
    }
}

async fn send_text(bot: &Bot, chat: ChatId, text: &str, html: bool, buttons: &[Action]) -> ResponseResult<()> {
    let mut req = bot.send_message(chat, clip(text, TEXT_LIMIT));
    if html {
        req = req.parse_mode(ParseMode::Html);
    }
    if !buttons.is_empty() {
        req = req.reply_markup(keyboard(buttons));
    }
    req.await?;
    Ok(())
}

/// Постер отдаём байтами. Не скачался или Telegram его не принял — шлём
/// карточку текстом.
async fn send_poster(bot: &Bot, chat: ChatId, url: &str, caption: &str) -> ResponseResult<()> {
    let delivered = match download_poster(url).await {
        Ok(bytes) => bot
            .send_photo(chat, InputFile::memory(bytes).file_name("poster.jpg"))
            .caption(clip(caption, CAPTION_LIMIT))
            .parse_mode(ParseMode::Html)
            .await
            .map(drop)
            .map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    if let Err(e) = delivered {
        warn!(%url, error = %e, "poster not delivered, sending text only");
        send_text(bot, chat, caption, true, &[]).await?;
    }
    Ok(())
}

static POSTER_HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .user_agent("kino-sheet-bot/0.1")
        .build()
        .unwrap_or_default()
});

async fn download_poster(url: &str) -> anyhow::Result<Vec<u8>> {
    let resp = POSTER_HTTP
        .get(url)
        .header(ACCEPT, "image/*")
        .send()
        .await?
        .error_for_status()?;
    let is_image = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .map_or(true, |ct| ct.starts_with("image/"));
    anyhow::ensure!(is_image, "poster url did not return an image");
    Ok(resp.bytes().await?.to_vec())
}

fn keyboard(actions: &[Action]) -> InlineKeyboardMarkup {
    let rows = actions
        .iter()
        .map(|a| vec![InlineKeyboardButton::callback(a.label(), a.payload())])
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

/// Обрезка по графемам. Описание стоит в подписи последним, так что под обрез
/// попадает только оно; недорезанную HTML-сущность (`&am`) отбрасываем целиком.
fn clip(s: &str, max: usize) -> String {
    if s.graphemes(true).count() <= max {
        return s.to_string();
    }
    let mut out = s.graphemes(true).take(max - 1).collect::<String>();
    if let Some(amp) = out.rfind('&') {
        if !out[amp..].contains(';') {
            out.truncate(amp);
        }
    }
    out + "…"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::WHAT_NEXT;
    use serde_json::json;
    use teloxide::types::InlineKeyboardButtonKind;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHAT: ChatId = ChatId(100);

    fn telegram(server: &MockServer) -> Bot {
        Bot::new("123:abc").set_api_url(reqwest::Url::parse(&server.uri()).unwrap())
    }

    async fn mount_send_message(server: &MockServer, times: u64) {
        Mock::given(method("POST"))
            .and(path_regex(r"(?i)^/bot[^/]+/sendmessage$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {
                    "message_id": 1,
                    "date": 1700000000,
                    "chat": {"id": 100, "type": "private", "first_name": "Test"},
                    "text": "ok"
                }
            })))
            .expect(times)
            .mount(server)
            .await;
    }

    async fn sent_messages(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path().to_lowercase().ends_with("/sendmessage"))
            .map(|r| String::from_utf8_lossy(&r.body).to_string())
            .collect()
    }

    fn card_and_buttons(server: &MockServer) -> Vec<Reply> {
        vec![
            Reply::Photo {
                url: format!("{}/poster.jpg", server.uri()),
                caption: "<b>Название:</b> Матрица".into(),
            },
            Reply::Text {
                text: WHAT_NEXT.into(),
                html: false,
                buttons: vec![Action::SearchAnother, Action::AddToSheet],
            },
        ]
    }

    #[tokio::test]
    async fn rejected_photo_falls_back_to_text_and_buttons_still_arrive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/poster.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0xFF, 0xD8, 0xFF, 0xE0], "image/jpeg"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"(?i)^/bot[^/]+/sendphoto$"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: PHOTO_INVALID_DIMENSIONS"
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_send_message(&server, 2).await;

        send_replies(&telegram(&server), CHAT, card_and_buttons(&server)).await;

        let messages = sent_messages(&server).await;
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("Матрица"));
        assert!(messages[1].contains("add_to_sheet"));
    }

    #[tokio::test]
    async fn missing_poster_is_sent_as_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/poster.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"(?i)^/bot[^/]+/sendphoto$"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        mount_send_message(&server, 2).await;

        send_replies(&telegram(&server), CHAT, card_and_buttons(&server)).await;

        let messages = sent_messages(&server).await;
        assert!(messages[0].contains("Матрица"));
        assert!(messages[1].contains("search_another"));
    }

    #[test]
    fn clip_keeps_short_text() {
        assert_eq!(clip("Матрица", 10), "Матрица");
    }

    #[test]
    fn clip_counts_graphemes() {
        let s = "ё".repeat(1030);
        let out = clip(&s, CAPTION_LIMIT);
        assert_eq!(out.graphemes(true).count(), CAPTION_LIMIT);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn clip_drops_cut_entity() {
        assert_eq!(clip("ab &amp; cd", 6), "ab …");
        assert_eq!(clip("a&lt;bcdef", 7), "a&lt;b…");
    }

    #[test]
    fn one_button_per_row() {
        let kb = keyboard(&[Action::SearchAnother, Action::AddToSheet]);
        assert_eq!(kb.inline_keyboard.len(), 2);
        let first = &kb.inline_keyboard[0][0];
        assert_eq!(first.text, "Найти другой фильм");
        assert!(matches!(&first.kind, InlineKeyboardButtonKind::CallbackData(d) if d == "search_another"));
        assert_eq!(kb.inline_keyboard[1][0].text, "Добавить в Google Таблицу");
    }

    #[test]
    fn commands_parse() {
        assert!(matches!(Command::parse("/start", "bot"), Ok(Command::Start)));
        assert!(matches!(Command::parse("/help", "bot"), Ok(Command::Help)));
    }
}
