use super::{chat_api, shared_reducer};
use anyhow::Result;
use runwire_application::ChatService;
use runwire_core::ClientSettings;

pub async fn list(settings: ClientSettings) -> Result<()> {
    let service = ChatService::new(chat_api(&settings), shared_reducer(&settings));
    let mut chats = service.refresh_sessions().await?;
    chats.sort_by_key(|chat| std::cmp::Reverse(chat.updated_at()));

    if chats.is_empty() {
        println!("No chats yet.");
        return Ok(());
    }
    for chat in &chats {
        let updated = chat
            .updated_at()
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{}  {:<16}  {}", chat.chat_guid, updated, chat.display_title());
    }
    Ok(())
}
