pub mod replay;
pub mod send;
pub mod sessions;

use anyhow::{Context, Result};
use runwire_application::SharedReducer;
use runwire_core::{ClientSettings, SessionReducer};
use runwire_interaction::{ChatApi, StaticToken};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Loads settings from `path` or the default location, then applies the
/// environment overrides.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings> {
    let settings = match path {
        Some(path) => ClientSettings::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?
            .with_env_overrides(|key| std::env::var(key).ok()),
        None => ClientSettings::load().context("Failed to load settings")?,
    };
    Ok(settings)
}

pub fn chat_api(settings: &ClientSettings) -> Arc<ChatApi> {
    let credentials = Arc::new(StaticToken::from_settings(settings));
    Arc::new(ChatApi::new(settings.clone(), credentials))
}

pub fn shared_reducer(settings: &ClientSettings) -> SharedReducer {
    Arc::new(Mutex::new(SessionReducer::new(settings.clone())))
}
