//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Fetch package metadata and archives through a pooled, caching downloader.
#[derive(Parser, Debug)]
#[command(name = "pkgfetch")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/pkgfetch/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Per-attempt timeout in seconds (1-3600)
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout: Option<u64>,

    /// Attempts per URL, including the first (1-20)
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_tries: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch one or more URLs
    Fetch {
        /// URLs to fetch; several URLs are fetched in parallel, one thread per host
        #[arg(required = true)]
        urls: Vec<String>,

        /// Serve cached copies without contacting the server
        #[arg(long)]
        prefer_cached: bool,

        /// Write the body here instead of stdout (single URL only)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resolve the CA trust anchor for a domain
    CheckCerts {
        /// Domain to check, e.g. packages.example.com
        domain: String,
    },

    /// Print the config file path that would be used
    ConfigPath,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_fetch_parses_urls_and_flags() {
        let args = Args::try_parse_from([
            "pkgfetch",
            "fetch",
            "https://a.test/x",
            "https://b.test/y",
            "--prefer-cached",
        ])
        .unwrap();
        match args.command {
            Command::Fetch {
                urls,
                prefer_cached,
                output,
            } => {
                assert_eq!(urls.len(), 2);
                assert!(prefer_cached);
                assert!(output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["pkgfetch", "-vv", "config-path"]).unwrap();
        assert_eq!(args.verbose, 2);

        let args = Args::try_parse_from(["pkgfetch", "config-path", "--verbose"]).unwrap();
        assert_eq!(args.verbose, 1);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["pkgfetch", "-q", "config-path"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_fetch_requires_url() {
        let err = Args::try_parse_from(["pkgfetch", "fetch"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_timeout_range() {
        assert!(Args::try_parse_from(["pkgfetch", "--timeout", "0", "config-path"]).is_err());
        let args = Args::try_parse_from(["pkgfetch", "--timeout", "15", "config-path"]).unwrap();
        assert_eq!(args.timeout, Some(15));
    }

    #[test]
    fn test_cli_max_tries_range() {
        assert!(Args::try_parse_from(["pkgfetch", "--max-tries", "21", "config-path"]).is_err());
    }

    #[test]
    fn test_cli_check_certs() {
        let args = Args::try_parse_from(["pkgfetch", "check-certs", "packages.test"]).unwrap();
        assert!(matches!(args.command, Command::CheckCerts { ref domain } if domain == "packages.test"));
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let err = Args::try_parse_from(["pkgfetch", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let err = Args::try_parse_from(["pkgfetch", "--invalid-flag"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }
}
