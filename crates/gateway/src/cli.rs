use std::path::PathBuf;

use clap::{Parser, Subcommand};

use vl_domain::config::Config;

/// VoiceLine — a real-time voice agent runtime for inbound calls.
#[derive(Debug, Parser)]
#[command(name = "voiceline", version, about)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the media server (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults and environment
    /// overrides applied) as TOML.
    Show,
}

/// Load the config file (missing file means all defaults) and apply the
/// environment overrides on top.
pub fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    let mut config: Config = if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        Config::default()
    };
    config.apply_env();
    Ok(config)
}

pub fn validate(path: &PathBuf) -> bool {
    match load_config(path) {
        Ok(config) => {
            let mut ok = true;
            if config.tenants.is_empty() {
                eprintln!("warning: no tenants configured; every call will be refused");
            }
            for tenant in &config.tenants {
                if !tenant.dialed_number.starts_with('+') {
                    eprintln!(
                        "error: tenant {} dialed_number {:?} is not E.164",
                        tenant.tenant_id, tenant.dialed_number
                    );
                    ok = false;
                }
                if tenant.greeting.trim().is_empty() {
                    eprintln!("error: tenant {} has an empty greeting", tenant.tenant_id);
                    ok = false;
                }
            }
            if ok {
                println!("config ok ({} tenants)", config.tenants.len());
            }
            ok
        }
        Err(e) => {
            eprintln!("config error: {e}");
            false
        }
    }
}

pub fn show(path: &PathBuf) {
    match load_config(path) {
        Ok(config) => match toml::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => eprintln!("failed to render config: {e}"),
        },
        Err(e) => eprintln!("config error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_loads_defaults() {
        let path = PathBuf::from("/definitely/not/here/voiceline.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.idle.nudge_ms, 8000);
    }

    #[test]
    fn file_values_survive_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [limits]
            max_concurrent_calls = 7
            "#
        )
        .unwrap();
        let config = load_config(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.limits.max_concurrent_calls, 7);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "limits = 3").unwrap();
        assert!(load_config(&file.path().to_path_buf()).is_err());
    }
}
