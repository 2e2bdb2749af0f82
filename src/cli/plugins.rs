use anyhow::Result;
use console::style;

use massip_core::{PluginRegistry, Settings};

use super::print_rejections;

pub fn run(settings: &Settings) -> Result<()> {
    let registry = PluginRegistry::discover(&settings.plugin_dir);

    for plugin in registry.iter() {
        let metadata = plugin.metadata();
        let mut notes = Vec::new();
        if !metadata.network_facing {
            notes.push("offline".to_string());
        }
        if let Some(retry) = &metadata.retry {
            notes.push(format!("{} endpoints", retry.endpoints.len()));
        }
        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!(" ({})", notes.join(", "))
        };

        println!(
            "{}{}  {}",
            style(plugin.name()).bold(),
            style(notes).dim(),
            metadata.description
        );
    }

    print_rejections("plugin manifests", registry.rejected());

    if !registry.collisions().is_empty() {
        eprintln!();
        eprintln!("{}", style("Redefined plugins (last definition wins):").yellow().bold());
        for name in registry.collisions() {
            eprintln!("  {}", style(name).yellow());
        }
    }

    Ok(())
}
