//! Configuration display command.

use console::style;

use crate::cli::icons::dim_arrow;
use crate::config::Settings;

/// Print the effective settings after file, environment and flag overrides.
pub async fn cmd_config_show(settings: &Settings, json: bool) -> anyhow::Result<()> {
    let rendered = if json {
        serde_json::to_string_pretty(settings)?
    } else {
        toml::to_string_pretty(settings)?
    };

    match settings.source_path {
        Some(ref path) => eprintln!("{} Source: {}", dim_arrow(), path.display()),
        None => eprintln!("{} Source: {}", dim_arrow(), style("defaults and environment").dim()),
    }
    println!("{}", rendered);
    Ok(())
}
