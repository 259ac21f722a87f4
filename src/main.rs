use anyhow::{Result, bail};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use parley::chat::{ChatOptions, run_chat};
use parley::cli::{Cli, Commands, ConfigAction};
use parley::config::Config;
use parley::interruption::InterruptionPolicy;
use parley::pipeline::TaskReport;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Chat {
            word_delay,
            playback,
            min_words,
            no_interruptions,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(words) = min_words {
                config.interruption.policy = InterruptionPolicy::min_words(words);
            }
            if no_interruptions {
                config.interruption.allow_interruptions = false;
            }
            let options = ChatOptions {
                word_delay,
                playback,
                quiet: cli.quiet,
            };
            let report = run_chat(config, options).await?;
            if !cli.quiet {
                print_report(&report);
            }
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "parley", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// `-q` keeps errors only, each `-v` raises the level. `RUST_LOG` wins when set.
fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("parley={level}"))),
        )
        .init();
}

fn config_path(custom_path: Option<&Path>) -> Result<PathBuf> {
    match custom_path {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(Config::default_path()?),
    }
}

fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        // An explicit path must exist
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path()?)?,
    };
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let path = config_path(custom_path)?;
    match action {
        ConfigAction::Show => {
            let config = Config::load_or_default(&path)?.with_env_overrides();
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Path => {
            println!("{}", path.display());
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, Config::default().to_toml()?)?;
            eprintln!("{} {}", "Wrote".green(), path.display());
        }
    }
    Ok(())
}

fn print_report(report: &TaskReport) {
    let m = &report.metrics;
    eprintln!(
        "{} {} ({:?})",
        "Conversation".bold(),
        report.state,
        report.reason
    );
    eprintln!(
        "  frames: {} observed, {} forwarded, {} stale dropped",
        m.frames_observed, m.frames_forwarded, m.stale_dropped
    );
    eprintln!(
        "  interruptions: {}, preempted: {}, errors: {} ({} timeouts)",
        m.interruptions, m.preempted, m.stage_errors, m.timeouts
    );
    if report.aborted_stages > 0 {
        eprintln!(
            "  {} stage(s) aborted after the cancel grace",
            report.aborted_stages.yellow()
        );
    }
}
