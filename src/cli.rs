use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "claude-bridge")]
#[command(author, version, about = "Chat-driven coding sessions backed by an AI assistant", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Run the bridge until Ctrl-C or SIGTERM
    Serve,

    /// List open sessions, or every session of one user
    Sessions {
        /// Internal user id
        #[arg(short, long)]
        user: Option<i64>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show which sessions the running bridge's idle sweeper would end
    Idle,

    /// Print the effective configuration
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_with_global_config() {
        let cli = Cli::try_parse_from(["claude-bridge", "sessions", "--user", "7", "-c", "b.toml"])
            .unwrap();
        assert_eq!(
            cli.command,
            Command::Sessions {
                user: Some(7),
                json: false
            }
        );
        assert_eq!(cli.config, Some(PathBuf::from("b.toml")));

        assert!(Cli::try_parse_from(["claude-bridge"]).is_err());
        assert_eq!(
            Cli::try_parse_from(["claude-bridge", "idle"]).unwrap().command,
            Command::Idle
        );
        assert!(Cli::try_parse_from(["claude-bridge", "sweep"]).is_err());
    }
}
