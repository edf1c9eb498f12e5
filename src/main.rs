use anyhow::{Context, Result};
use convo_sync::commands;
use convo_sync::services::chat_types::ChatEvent;
use convo_sync::services::transport::StaticIdentity;
use convo_sync::AppState;
use tokio::sync::broadcast::error::RecvError;

const ENV_USER: &str = "CONVO_SYNC_USER";
const ENV_TOKEN: &str = "CONVO_SYNC_TOKEN";
const ENV_SCOPE: &str = "CONVO_SYNC_SCOPE";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let identity = StaticIdentity {
        user_id: std::env::var(ENV_USER).with_context(|| format!("{} is not set", ENV_USER))?,
        credential: std::env::var(ENV_TOKEN).with_context(|| format!("{} is not set", ENV_TOKEN))?,
    };
    let scope = std::env::var(ENV_SCOPE).with_context(|| format!("{} is not set", ENV_SCOPE))?;

    let state = AppState::new(identity, Some(scope.clone())).context("Failed to initialize")?;
    let mut events = state.chat.subscribe();

    let conversations = commands::open_scope(&state, scope).await?;
    for row in &conversations {
        let preview = row
            .preview
            .as_ref()
            .map(|p| p.content.as_str())
            .unwrap_or("");
        println!("{:<24} {:<32} {}", row.id, row.display_name, preview);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                break;
            }
            received = events.recv() => match received {
                Ok(event) => print_event(&state, event).await,
                Err(RecvError::Lagged(n)) => log::warn!("Missed {} UI events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    commands::close_conversation(&state, None).await?;
    commands::disconnect(&state).await;
    Ok(())
}

async fn print_event(state: &AppState, event: ChatEvent) {
    match event {
        ChatEvent::TimelineChanged { conversation_id } => {
            let messages = state.chat.messages(&conversation_id).await;
            if let Some(latest) = messages.last() {
                println!(
                    "[{}] {}: {}",
                    conversation_id,
                    latest.author_id,
                    latest.preview_text()
                );
            }
        }
        ChatEvent::ConnectionChanged { state } => println!("connection: {:?}", state),
        other => log::debug!("{:?}", other),
    }
}
