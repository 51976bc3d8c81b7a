//! Telegram bot client - simple polling version.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::InputFile;

use crate::channel::{Delivery, OperatorReporter};
use crate::config::{get_home_dir, Settings};
use crate::core::{Collaborators, Switchboard};
use crate::error::{Error, Result};
use crate::followup::LogExporter;
use crate::providers::create_backend;
use crate::store::SqliteStore;

use super::handler::handle_message;

const PHOTO_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

fn chat_id(session_id: &str) -> Result<ChatId> {
    session_id
        .trim()
        .parse::<i64>()
        .map(ChatId)
        .map_err(|_| Error::Delivery(format!("Not a Telegram chat id: {}", session_id)))
}

/// Sends replies, nudges and reports through the bot.
#[derive(Clone)]
pub struct TelegramDelivery {
    bot: Bot,
}

impl TelegramDelivery {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Delivery for TelegramDelivery {
    async fn deliver(&self, session_id: &str, text: &str) -> Result<()> {
        self.bot
            .send_message(chat_id(session_id)?, text)
            .await
            .map_err(|e| Error::Telegram(format!("send_message: {}", e)))?;
        Ok(())
    }

    async fn deliver_media(&self, session_id: &str, path: &Path) -> Result<()> {
        let chat = chat_id(session_id)?;
        let is_photo = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| PHOTO_EXTENSIONS.contains(&e.to_lowercase().as_str()));

        let sent = if is_photo {
            self.bot
                .send_photo(chat, InputFile::file(path))
                .await
                .map(|_| ())
        } else {
            self.bot
                .send_document(chat, InputFile::file(path))
                .await
                .map(|_| ())
        };
        sent.map_err(|e| Error::Telegram(format!("send media: {}", e)))
    }
}

/// Run the telegram bot daemon using simple polling.
pub async fn run_telegram_daemon(settings: Settings) -> Result<()> {
    tracing::info!("Starting Telegram bot...");

    let token = settings
        .channels
        .telegram
        .bot_token
        .clone()
        .ok_or_else(|| Error::Telegram("No bot token configured".to_string()))?;

    let bot = Bot::new(token.clone());

    if let Err(e) = bot
        .set_my_commands(vec![teloxide::types::BotCommand::new(
            "reset",
            "Reset conversation",
        )])
        .await
    {
        tracing::warn!("Failed to set commands: {}", e);
    }

    let store = Arc::new(SqliteStore::open(&settings.storage.resolve_database_path()?)?);
    let delivery: Arc<dyn Delivery> = Arc::new(TelegramDelivery::new(bot.clone()));
    let reporter = Arc::new(OperatorReporter::new(
        Arc::clone(&delivery),
        settings.channels.operator_chat.clone(),
    ));

    let switchboard = Arc::new(Switchboard::new(
        &settings,
        Collaborators {
            backend: create_backend(&settings)?,
            delivery,
            reporter,
            data: store.clone(),
            calendar: store.clone(),
            store,
            exporter: Arc::new(LogExporter),
        },
    ));

    match switchboard.resume_reconnections().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Resumed {} reconnection cycle(s)", n),
        Err(e) => tracing::warn!("Could not resume reconnection cycles: {}", e),
    }

    let files_dir = get_home_dir()?.join("files");
    std::fs::create_dir_all(&files_dir)?;

    tracing::info!("Telegram bot ready");

    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let switchboard = Arc::clone(&switchboard);
        let token = token.clone();
        let files_dir = files_dir.clone();
        async move { handle_message(bot, msg, switchboard, &token, &files_dir).await }
    })
    .await;

    Ok(())
}
