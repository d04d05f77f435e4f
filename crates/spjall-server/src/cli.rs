//! Command-line arguments.

use clap::Parser;
use std::path::PathBuf;

/// spjall - realtime chat server
#[derive(Parser, Debug)]
#[command(name = "spjall", version, about = "Realtime chat server speaking WebSocket")]
pub struct Cli {
    /// Config file path (defaults to spjall.toml, /etc/spjall/spjall.toml,
    /// ~/.config/spjall/spjall.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_config_flag() {
        let cli = Cli::try_parse_from(["spjall"]).unwrap();
        assert_eq!(cli.config, None);

        let cli = Cli::try_parse_from(["spjall", "--config", "/tmp/a.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/a.toml")));

        let cli = Cli::try_parse_from(["spjall", "--config=/tmp/b.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/b.toml")));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let err = Cli::try_parse_from(["spjall", "--confg", "/etc/prod.toml"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);

        assert!(Cli::try_parse_from(["spjall", "--config"]).is_err());
    }

    #[test]
    fn test_help_prints_usage() {
        let err = Cli::try_parse_from(["spjall", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert!(err.to_string().contains("--config"));
    }
}
