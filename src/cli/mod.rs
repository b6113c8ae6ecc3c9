use clap::{Parser, Subcommand};

pub mod config;
pub mod digest;
pub mod init;
pub mod simulate;
pub mod version;

#[derive(Parser)]
#[command(name = "courier")]
#[command(author = "Courier Project")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the courier chat bot", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file, or migrate an older one
    Init {
        /// Path to config file (default: ~/.local/share/courier/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Crypto store directory written into the config
        #[arg(long)]
        store_path: Option<String>,

        /// Existing config to migrate (legacy config.json or TOML)
        #[arg(long)]
        from: Option<String>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Run an emoji verification against a simulated device
    Simulate {
        /// Path to config file (default: ~/.local/share/courier/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Answer the emoji prompt automatically (y, n or c) instead of asking
        #[arg(long)]
        answer: Option<String>,

        /// Methods the simulated device offers
        #[arg(long, value_delimiter = ',', default_value = "emoji")]
        methods: Vec<String>,

        /// Simulated device sends a MAC that does not match
        #[arg(long)]
        wrong_mac: bool,
    },

    /// Compose the news digest for one configured source
    Digest {
        /// Path to config file (default: ~/.local/share/courier/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// News source name from the [news] tables
        #[arg(long)]
        source: String,

        /// JSON file of feed entries: [{"title": ..., "link": ...}]
        #[arg(long)]
        entries: String,

        /// Text file of earlier room messages; their links are skipped
        #[arg(long)]
        history: Option<String>,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Init {
            config,
            store_path,
            from,
            force,
        } => init::execute(config, store_path, from, force),
        Commands::Simulate {
            config,
            answer,
            methods,
            wrong_mac,
        } => simulate::execute(config, answer, methods, wrong_mac).await,
        Commands::Digest {
            config,
            source,
            entries,
            history,
        } => digest::execute(config, source, entries, history),
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_init() {
        let cli = Cli::parse_from(["courier", "init", "--config", "/tmp/c.toml", "--force"]);

        match cli.command {
            Commands::Init {
                config,
                store_path,
                from,
                force,
            } => {
                assert_eq!(config, Some("/tmp/c.toml".to_string()));
                assert!(store_path.is_none());
                assert!(from.is_none());
                assert!(force);
            }
            _ => panic!("Expected Init command"),
        }
    }

    #[test]
    fn test_cli_parse_simulate_defaults() {
        let cli = Cli::parse_from(["courier", "simulate"]);

        match cli.command {
            Commands::Simulate {
                config,
                answer,
                methods,
                wrong_mac,
            } => {
                assert!(config.is_none());
                assert!(answer.is_none());
                assert_eq!(methods, vec!["emoji".to_string()]);
                assert!(!wrong_mac);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_cli_parse_simulate_with_all_options() {
        let cli = Cli::parse_from([
            "courier",
            "simulate",
            "--answer",
            "n",
            "--methods",
            "decimal,emoji",
            "--wrong-mac",
        ]);

        match cli.command {
            Commands::Simulate {
                answer,
                methods,
                wrong_mac,
                ..
            } => {
                assert_eq!(answer, Some("n".to_string()));
                assert_eq!(methods, vec!["decimal".to_string(), "emoji".to_string()]);
                assert!(wrong_mac);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_cli_parse_init_migration() {
        let cli = Cli::parse_from(["courier", "init", "--from", "config.json"]);

        match cli.command {
            Commands::Init { from, force, .. } => {
                assert_eq!(from, Some("config.json".to_string()));
                assert!(!force);
            }
            _ => panic!("Expected Init command"),
        }
    }

    #[test]
    fn test_cli_parse_digest() {
        let cli = Cli::parse_from([
            "courier",
            "digest",
            "--source",
            "ars",
            "--entries",
            "entries.json",
            "--history",
            "history.txt",
        ]);

        match cli.command {
            Commands::Digest {
                config,
                source,
                entries,
                history,
            } => {
                assert!(config.is_none());
                assert_eq!(source, "ars");
                assert_eq!(entries, "entries.json");
                assert_eq!(history, Some("history.txt".to_string()));
            }
            _ => panic!("Expected Digest command"),
        }
    }

    #[test]
    fn test_cli_parse_digest_requires_source() {
        assert!(Cli::try_parse_from(["courier", "digest", "--entries", "e.json"]).is_err());
    }

    #[test]
    fn test_cli_parse_version() {
        let cli = Cli::parse_from(["courier", "version"]);
        assert!(matches!(cli.command, Commands::Version));
    }
}
