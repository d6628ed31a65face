//! CLI entry point for pkgfetch.

use std::fs;
use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use clap::Parser;
use pkgfetch::{
    BackgroundFetchCoordinator, DownloadManager, FetchConfig, TrustAnchor, load_config,
    resolve_default_config_path,
};
use tracing::{debug, error, info};

mod cli;

use cli::{Args, Command};

fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    if matches!(args.command, Command::ConfigPath) {
        match args.config.clone().or_else(resolve_default_config_path) {
            Some(path) => println!("{}", path.display()),
            None => bail!("cannot determine config path: neither XDG_CONFIG_HOME nor HOME is set"),
        }
        return Ok(());
    }

    let loaded = load_config(args.config.as_deref())?;
    let mut config = loaded.config;
    if loaded.loaded_from_file {
        debug!(path = ?loaded.path, "using config file");
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = Some(timeout);
    }
    if let Some(max_tries) = args.max_tries {
        config.max_tries = Some(max_tries);
    }
    config.validate()?;

    match args.command {
        Command::Fetch {
            urls,
            prefer_cached,
            output,
        } => {
            let manager = config.build_manager()?;
            let result = if urls.len() == 1 {
                fetch_one(&manager, &config, &urls[0], prefer_cached, output.as_deref())
            } else if output.is_some() {
                Err(anyhow::anyhow!("--output can only be used with a single URL"))
            } else {
                fetch_many(&manager, &config, urls, prefer_cached)
            };
            manager.close_idle();
            result
        }
        Command::CheckCerts { domain } => {
            let context = config.build_context()?;
            let anchor = context
                .trust
                .check_certs(&domain, config.timeout())
                .with_context(|| format!("no trust anchor for {domain}"))?;
            match anchor {
                TrustAnchor::Native => println!("{domain}: platform verifier"),
                TrustAnchor::Bundle(path) => println!("{domain}: {}", path.display()),
            }
            Ok(())
        }
        Command::ConfigPath => Ok(()),
    }
}

fn fetch_one(
    manager: &DownloadManager,
    config: &FetchConfig,
    url: &str,
    prefer_cached: bool,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let request = config.request(url).prefer_cached(prefer_cached);
    let body = manager.fetch(&request)?;
    info!(url, bytes = body.len(), "fetched");
    match output {
        Some(path) => fs::write(path, &body)
            .with_context(|| format!("Failed to write '{}'", path.display()))?,
        None => io::stdout()
            .lock()
            .write_all(&body)
            .context("Failed to write to stdout")?,
    }
    Ok(())
}

fn fetch_many(
    manager: &DownloadManager,
    config: &FetchConfig,
    urls: Vec<String>,
    prefer_cached: bool,
) -> Result<()> {
    let mut coordinator = BackgroundFetchCoordinator::new(manager);
    for url in urls {
        coordinator.add(config.request(url).prefer_cached(prefer_cached));
    }

    let outcomes = coordinator.run();
    let mut failed = 0usize;
    let mut stdout = io::stdout().lock();
    for outcome in &outcomes {
        match &outcome.result {
            Ok(body) => writeln!(stdout, "{}\t{}", body.len(), outcome.request.url)?,
            Err(e) => {
                failed += 1;
                error!(url = %outcome.request.url, error = %e, "fetch failed");
            }
        }
    }
    info!(total = outcomes.len(), failed, "fetch complete");
    if failed > 0 {
        bail!("{failed} of {} fetches failed", outcomes.len());
    }
    Ok(())
}
