use crate::config::{ConfigManager, Settings};
use anyhow::Context;

/// `pipetun config show`, with the token masked
pub fn show_settings(settings: &Settings, config: &ConfigManager) -> anyhow::Result<()> {
    let mut shown = settings.clone();
    shown.access_token = shown.access_token.as_deref().map(mask);
    let json = serde_json::to_string_pretty(&shown).context("Failed to serialize settings")?;
    println!("# {}", config.path().display());
    println!("{}", json);
    Ok(())
}

fn mask(token: &str) -> String {
    let visible: String = token.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if token.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("****{}", visible)
    }
}
