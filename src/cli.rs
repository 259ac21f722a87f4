//! Command-line interface for parley
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Real-time conversational pipeline demo
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Real-time conversational pipeline demo")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: info, -vv: debug, -vvv: trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse a duration string.
///
/// Bare numbers are milliseconds; anything else goes through `humantime`
/// (`80ms`, `1s`, `1s500ms`).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Chat with the echo assistant over an in-process transport.
    ///
    /// Each stdin line is recognized as one user utterance. Typing while the
    /// assistant is still speaking interrupts it once enough words arrive.
    Chat {
        /// Delay between generated words (e.g. 80ms, 1s)
        #[arg(long, value_name = "DURATION", default_value = "60ms", value_parser = parse_duration)]
        word_delay: Duration,

        /// Playback time per synthesized audio chunk
        #[arg(long, value_name = "DURATION", default_value = "20ms", value_parser = parse_duration)]
        playback: Duration,

        /// Words needed to interrupt the assistant (overrides config)
        #[arg(long, value_name = "N")]
        min_words: Option<usize>,

        /// Never interrupt the assistant
        #[arg(long)]
        no_interruptions: bool,
    },

    /// View and create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
