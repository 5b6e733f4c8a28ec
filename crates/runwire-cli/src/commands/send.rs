use super::{chat_api, shared_reducer};
use anyhow::Result;
use runwire_application::ChatService;
use runwire_core::ClientSettings;
use runwire_core::reducer::TurnInput;
use runwire_core::session::MessageStatus;
use runwire_core::stream::StreamDelta;
use std::io::Write;

pub struct SendOptions {
    pub chat: Option<String>,
    pub image: Option<String>,
    pub search: bool,
    pub message: String,
}

pub async fn run(settings: ClientSettings, options: SendOptions) -> Result<()> {
    let service = ChatService::new(chat_api(&settings), shared_reducer(&settings));
    let chat_id = match options.chat {
        Some(id) => id,
        None => {
            let id = service.create_session(None).await?;
            eprintln!("Created chat {id}");
            id
        }
    };

    let reply = if options.search {
        service.web_search(&chat_id, &options.message).await?
    } else {
        let mut input = TurnInput::new(options.message);
        if let Some(image) = options.image {
            input = input.with_image(image);
        }
        let mut printed = String::new();
        let reply = service
            .send_message_with(&chat_id, input, |delta| {
                if let StreamDelta::Text(fragment) = delta {
                    printed.push_str(fragment);
                    print!("{fragment}");
                    let _ = std::io::stdout().flush();
                }
            })
            .await?;
        if !printed.is_empty() {
            println!();
        }
        reply
    };

    if options.search {
        println!("{}", reply.content);
        if let Some(metadata) = &reply.metadata {
            for result in &metadata.search_results {
                println!("  - {} <{}>", result.title, result.url);
            }
        }
    }
    if reply.status == MessageStatus::Error {
        anyhow::bail!("Backend reported an error: {}", reply.content);
    }
    Ok(())
}
