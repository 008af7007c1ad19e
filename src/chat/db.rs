use anyhow::{Error, Result};
use chrono::Utc;
use serde_json::json;
use tokio_rusqlite::Connection;

use super::models::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: String,
    pub message_count: i64,
}

/// Saves a finished exchange. Both messages go in one transaction so a
/// prompt is never stored without its response.
pub async fn insert_exchange(
    db: &Connection,
    session_id: &str,
    prompt: &Message,
    response: &Message,
) -> Result<(), Error> {
    let s_id = session_id.to_owned();
    let created_at = Utc::now().to_rfc3339();
    let rows = [json!(prompt).to_string(), json!(response).to_string()];

    db.call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO session (id, created_at) VALUES (?, ?)",
            [&s_id, &created_at],
        )?;
        for data in rows {
            tx.execute(
                "INSERT INTO chat_message (session_id, data, created_at) VALUES (?, ?, ?)",
                [&s_id, &data, &created_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    })
    .await?;

    Ok(())
}

pub async fn find_chat_session_by_id(
    db: &Connection,
    session_id: &str,
) -> Result<Vec<Message>, Error> {
    let s_id = session_id.to_owned();
    let rows = db
        .call(move |conn| {
            let mut stmt =
                conn.prepare("SELECT data FROM chat_message WHERE session_id = ? ORDER BY id")?;
            let rows = stmt
                .query_map([s_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(rows)
        })
        .await?;

    let history = rows
        .iter()
        .map(|data| serde_json::from_str::<Message>(data))
        .collect::<Result<Vec<Message>, _>>()?;
    Ok(history)
}

pub async fn chat_session_list(db: &Connection) -> Result<Vec<SessionSummary>, Error> {
    let sessions = db
        .call(|conn| {
            let mut stmt = conn.prepare(
                r#"
                    SELECT s.id, s.created_at, COUNT(m.id)
                    FROM session s
                    LEFT JOIN chat_message m ON m.session_id = s.id
                    GROUP BY s.id
                    ORDER BY s.created_at DESC
                "#,
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(SessionSummary {
                        id: row.get(0)?,
                        created_at: row.get(1)?,
                        message_count: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<SessionSummary>, _>>()?;
            Ok(rows)
        })
        .await?;

    Ok(sessions)
}
