use anyhow::Result;

use crate::chat::db::{chat_session_list, find_chat_session_by_id};
use crate::chat::{MessageStatus, Role};
use crate::core::AppConfig;
use crate::core::db::async_db;

pub async fn run(config: &AppConfig, session: Option<String>) -> Result<()> {
    let db = async_db(&config.db_path).await?;

    let Some(session_id) = session else {
        let sessions = chat_session_list(&db).await?;
        if sessions.is_empty() {
            println!("No stored sessions");
        }
        for s in sessions {
            println!("{}  {}  {} messages", s.id, s.created_at, s.message_count);
        }
        return Ok(());
    };

    for msg in find_chat_session_by_id(&db, &session_id).await? {
        let who = match msg.role {
            Role::User => "you",
            Role::Bot => "bot",
        };
        let note = match &msg.status {
            MessageStatus::Failed { reason } => format!(" [failed: {}]", reason),
            MessageStatus::Cancelled => " [cancelled]".to_string(),
            _ => String::new(),
        };
        println!("{}: {}{}", who, msg.content, note);
    }
    Ok(())
}
