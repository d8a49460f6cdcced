//! `tern providers` command: list configured providers in selection order.

use tern_core::config::{HarnessConfig, ProviderConfig};

pub fn run_providers(config: &HarnessConfig) {
    let mut providers: Vec<&ProviderConfig> = config.providers.iter().collect();
    providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    println!(
        "{:<16} {:>8} {:<16} {:>7}  COMMAND",
        "ID", "PRIORITY", "KIND", "RETRIES"
    );
    println!("{}", "-".repeat(72));
    for provider in providers {
        let marker = if config.default_provider.as_deref() == Some(provider.id.as_str()) {
            " (default)"
        } else {
            ""
        };
        let mut command = provider.command.clone();
        for arg in &provider.args {
            command.push(' ');
            command.push_str(arg);
        }
        println!(
            "{:<16} {:>8} {:<16} {:>7}  {command}{marker}",
            provider.id,
            provider.priority,
            provider.kind.to_string(),
            provider.max_retries,
        );
    }
}
