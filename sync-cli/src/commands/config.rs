//! Show the effective configuration.

use anyhow::{Context, Result};
use roomsync_client::Config;

/// Run the config command.
pub fn run(config: &Config) -> Result<()> {
    print!("{}", render(config)?);
    Ok(())
}

/// Render `config` as TOML, after checking that it builds a resolver.
pub fn render(config: &Config) -> Result<String> {
    config
        .resolver
        .build()
        .context("Invalid resolver configuration")?;
    config.to_toml().context("Failed to render configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_renders() {
        let text = render(&Config::default()).unwrap();
        assert!(text.contains("[sync]"));
        assert!(text.contains("max_batch_size = 10"));
    }

    #[test]
    fn loaded_config_renders_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nbatch_timeout_ms = 50").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        let text = render(&config).unwrap();
        assert!(text.contains("batch_timeout_ms = 50"));
    }

    #[test]
    fn unknown_rule_fails() {
        let config: Config = toml::from_str(
            "[resolver.rules.not_a_conflict]\nstrategy = \"merge\"\n",
        )
        .unwrap();
        assert!(render(&config).is_err());
    }
}
