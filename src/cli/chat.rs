use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use tokio_util::sync::CancellationToken;

use crate::chat::db::find_chat_session_by_id;
use crate::chat::{ChatSession, MessageStatus, Role, Subscription, TranscriptEvent};
use crate::core::db::async_db;
use crate::core::{AppConfig, ChatConfig, PreferenceStore};
use crate::openai::{CompletionClient, OpenAiClient};

fn render(event: &TranscriptEvent) {
    match event {
        TranscriptEvent::PromptSubmitted { .. } => {}
        TranscriptEvent::Delta { text, .. } => {
            print!("{}", text);
            let _ = io::stdout().flush();
        }
        TranscriptEvent::Finished { .. } => println!(),
        TranscriptEvent::Failed { reason, .. } => {
            println!();
            eprintln!("[response failed: {}]", reason);
        }
        TranscriptEvent::Cancelled { .. } => {
            println!();
            eprintln!("[cancelled]");
        }
    }
}

fn print_transcript<C: CompletionClient>(session: &ChatSession<C>) {
    for msg in session.messages() {
        match msg.role {
            Role::User => println!(">>> {}", msg.content),
            Role::Bot => {
                println!("{}", msg.content);
                if let MessageStatus::Failed { reason } = &msg.status {
                    eprintln!("[response failed: {}]", reason);
                }
            }
        }
    }
}

/// Runs one turn, printing the response as it streams in. Ctrl-C
/// cancels the response without leaving the REPL.
async fn turn<C: CompletionClient>(
    session: &mut ChatSession<C>,
    sub: &mut Subscription,
    prompt: &str,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let send = session.send(prompt, cancel);
    tokio::pin!(send);
    let result = loop {
        tokio::select! {
            result = &mut send => break result,
            Some(event) = sub.recv() => render(&event),
        }
    };
    while let Some(event) = sub.try_recv() {
        render(&event);
    }
    ctrl_c.abort();

    if let Err(e) = result {
        eprintln!("{}", e);
    }
    Ok(())
}

pub async fn run(config: &AppConfig, model: Option<String>, session_id: Option<String>) -> Result<()> {
    let db = async_db(&config.db_path).await?;
    let prefs = PreferenceStore::new(&db);
    let settings = prefs.settings().await?;

    if settings.session.is_none() {
        println!("You're not signed in. Run `gptchat login --email <EMAIL>` first.");
        return Ok(());
    }

    // Missing credentials send the user to the settings flow
    let chat_config = match ChatConfig::load(settings, model.as_deref()) {
        Ok(chat_config) => chat_config,
        Err(e) => {
            println!("{}", e);
            return Ok(());
        }
    };

    let client = OpenAiClient::new(
        &chat_config.api_base,
        &chat_config.api_key,
        &chat_config.organization,
    );
    let builder = ChatSession::builder(client, chat_config);
    let mut session = if let Some(id) = session_id.as_deref() {
        let history = find_chat_session_by_id(&db, id).await?;
        builder.transcript(history).database(&db, Some(id)).build()
    } else {
        builder.database(&db, None).build()
    };

    tracing::info!(
        session_id = session.session_id.as_deref().unwrap_or_default(),
        model = session.config().tier.model_id(),
        "Chat session started"
    );
    print_transcript(&session);

    let mut sub = session.subscribe();
    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline(">>> ");
        match readline {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.as_str());
                turn(&mut session, &mut sub, &line).await?;
            }
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
