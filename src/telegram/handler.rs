//! Telegram message handling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::Message;

use crate::channel::InboundMessage;
use crate::core::Switchboard;

fn sanitize_file_name(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "file.bin".to_string()
    } else {
        out
    }
}

/// Fetch a file from Telegram into `files_dir`.
async fn download_telegram_file(
    token: &str,
    file_id: &str,
    extension: &str,
    files_dir: &Path,
) -> Result<PathBuf, String> {
    let get_file_url = format!(
        "https://api.telegram.org/bot{}/getFile?file_id={}",
        token, file_id
    );
    let resp = reqwest::get(get_file_url).await.map_err(|e| e.to_string())?;
    let value: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
    let file_path = value
        .get("result")
        .and_then(|r| r.get("file_path"))
        .and_then(|p| p.as_str())
        .ok_or_else(|| "Telegram getFile returned no file_path".to_string())?;

    let download_url = format!("https://api.telegram.org/file/bot{}/{}", token, file_path);
    let bytes = reqwest::get(download_url)
        .await
        .map_err(|e| e.to_string())?
        .bytes()
        .await
        .map_err(|e| e.to_string())?;

    let name = sanitize_file_name(&format!("telegram_{}.{}", ulid::Ulid::new(), extension));
    let path = files_dir.join(name);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| e.to_string())?;
    Ok(path)
}

/// Photo or video attached to the message, downloaded locally.
async fn capture_media(msg: &Message, token: &str, files_dir: &Path) -> Option<PathBuf> {
    let (file_id, extension) = if let Some(last) = msg.photo().and_then(|p| p.last()) {
        (last.file.id.to_string(), "jpg")
    } else if let Some(video) = msg.video() {
        (video.file.id.to_string(), "mp4")
    } else {
        return None;
    };

    match download_telegram_file(token, &file_id, extension, files_dir).await {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!("Failed to download media: {}", e);
            None
        }
    }
}

/// Turn a Telegram update into an inbound message for the router.
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    switchboard: Arc<Switchboard>,
    token: &str,
    files_dir: &Path,
) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };

    let mut text = msg
        .text()
        .or_else(|| msg.caption())
        .unwrap_or("")
        .to_string();
    if text.trim() == "/reset" {
        text = "#reset".to_string();
    }

    let inbound = InboundMessage {
        from: msg.chat.id.0.to_string(),
        body: text,
        is_group: msg.chat.is_group() || msg.chat.is_supergroup(),
        is_broadcast: msg.chat.is_channel(),
        is_system: false,
        is_bot: user.is_bot,
        media: capture_media(&msg, token, files_dir).await,
        timestamp: msg.date.timestamp_millis(),
    };

    match switchboard.accept(inbound) {
        Some(id) => {
            tracing::info!("Enqueued message {} from {}", id, msg.chat.id);
            let _ = bot
                .send_chat_action(msg.chat.id, teloxide::types::ChatAction::Typing)
                .await;
        }
        None => tracing::debug!("Message from {} not enqueued", msg.chat.id),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("telegram_01.jpg"), "telegram_01.jpg");
        assert_eq!(sanitize_file_name("a b/c.mp4"), "a_b_c.mp4");
        assert_eq!(sanitize_file_name(""), "file.bin");
    }
}
