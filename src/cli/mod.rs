//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ragmill",
    version,
    about = "Offline retrieval-augmented generation engine",
    long_about = "ragmill ingests text documents into an on-device vector index and answers \
                  questions about them with a local generation model. Everything runs offline: \
                  embedding, retrieval, and generation never leave the machine."
)]
pub struct Cli {
    /// Config file path (defaults to ~/.config/ragmill/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Index snapshot path (defaults to the platform data directory)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub index: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest text files into the index
    Add {
        /// Files to ingest
        files: Vec<PathBuf>,

        /// JSON metadata object attached to every chunk
        #[arg(short, long)]
        metadata: Option<String>,
    },

    /// Retrieve the most similar chunks without generating an answer
    Search {
        /// Query text
        query: String,

        /// Maximum number of results to return
        #[arg(short, long, default_value = "5")]
        limit: usize,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Ask a question answered from the indexed documents
    Ask {
        /// Question to ask
        question: String,

        /// Maximum tokens to generate
        #[arg(short = 'n', long, default_value = "512")]
        max_tokens: usize,

        /// Sampling temperature
        #[arg(short, long, default_value = "0.7")]
        temperature: f32,

        /// Show the full result in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics
    Stats,

    /// Remove all indexed documents
    Clear,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Default config location: `~/.config/ragmill/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ragmill/config.toml")
}

/// Default index snapshot location under the platform data directory
pub fn default_index_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ragmill/index")
}
