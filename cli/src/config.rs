use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use tether::{ChannelOptions, RegistryOptions, SupportOptions};

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Name of the I/O thread
    pub io_thread_name: Option<String>,

    /// Channel limits
    pub channel: ChannelSection,

    /// Endpoint registry limits
    pub registry: RegistrySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    pub max_message_size: Option<usize>,
    pub max_handles: Option<usize>,
    pub read_chunk_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub max_endpoint_id: Option<u32>,
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            parse_config(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))
        }
        None => Ok(FileConfig::default()),
    }
}

fn parse_config(content: &str) -> Result<FileConfig> {
    Ok(toml::from_str(content)?)
}

/// Build library options, file values over library defaults
pub fn support_options(file: &FileConfig) -> Result<SupportOptions> {
    let mut channel = ChannelOptions::builder();
    if let Some(size) = file.channel.max_message_size {
        channel = channel.max_message_size(size);
    }
    if let Some(count) = file.channel.max_handles {
        channel = channel.max_handles(count);
    }
    if let Some(size) = file.channel.read_chunk_size {
        channel = channel.read_chunk_size(size);
    }
    let channel = channel.build().context("invalid [channel] section")?;

    let mut registry = RegistryOptions::builder();
    if let Some(id) = file.registry.max_endpoint_id {
        registry = registry.max_endpoint_id(id);
    }
    let registry = registry.build().context("invalid [registry] section")?;

    let mut options = SupportOptions::builder().channel(channel).registry(registry);
    if let Some(name) = &file.io_thread_name {
        options = options.io_thread_name(name.clone());
    }
    Ok(options.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_override_defaults() {
        let file = parse_config(
            r#"
            io_thread_name = "cli-io"

            [channel]
            max_handles = 8

            [registry]
            max_endpoint_id = 100
            "#,
        )
        .unwrap();
        let options = support_options(&file).unwrap();
        assert_eq!(options.io_thread_name(), "cli-io");
        assert_eq!(options.channel().max_handles(), 8);
        assert_eq!(
            options.channel().max_message_size(),
            tether::DEFAULT_MAX_MESSAGE_SIZE
        );
        assert_eq!(options.registry().max_endpoint_id(), 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = parse_config("[registry]\nmax_endpoint_id = 0\n").unwrap();
        assert!(support_options(&file).is_err());
        assert!(parse_config("[channel]\nmax_handles = \"many\"\n").is_err());
    }
}
