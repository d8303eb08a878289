use ragmill::cli::{Cli, Commands};
use ragmill::error::Result;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);
    run(cli)
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "ragmill=debug" } else { "ragmill=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(feature = "onnx")]
fn run(cli: Cli) -> Result<()> {
    use ragmill::cli::{default_config_path, default_index_path};
    use ragmill::config::RagConfig;
    use ragmill::pipeline::{QueryParams, RagPipeline};

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let index_path = cli.index.unwrap_or_else(default_index_path);

    let config = RagConfig::load(&config_path)?;
    let pipeline = RagPipeline::new(config)?;

    // Resume from a previous snapshot when one exists
    let sidecar = {
        let mut os = index_path.as_os_str().to_os_string();
        os.push(".metadata.json");
        std::path::PathBuf::from(os)
    };
    if sidecar.exists() {
        pipeline.load_index(&index_path)?;
        tracing::info!(chunks = pipeline.document_count(), "loaded existing index");
    }

    match cli.command {
        Commands::Add { files, metadata } => {
            if files.is_empty() {
                eprintln!("nothing to ingest");
                return Ok(());
            }
            for file in &files {
                let text = std::fs::read_to_string(file).map_err(|e| {
                    ragmill::error::RagError::Io {
                        source: e,
                        context: format!("reading {}", file.display()),
                    }
                })?;
                let added = pipeline.add_document(&text, metadata.as_deref())?;
                println!("{}: {added} chunks indexed", file.display());
            }
            save_index(&pipeline, &index_path)?;
        }

        Commands::Search { query, limit, json } => {
            let results = pipeline.search(&query, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results).unwrap_or_default());
            } else if results.is_empty() {
                println!("no results");
            } else {
                for result in results {
                    println!("[{:.3}] {}  {}", result.similarity, result.chunk_id, result.text);
                }
            }
        }

        Commands::Ask {
            question,
            max_tokens,
            temperature,
            json,
        } => {
            let params = QueryParams {
                max_tokens,
                temperature,
                ..QueryParams::default()
            };
            let output = pipeline.query(&question, &params)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
            } else {
                println!("{}", output.answer);
                println!(
                    "\n({} chunks, retrieval {:.0} ms, generation {:.0} ms)",
                    output.retrieved_chunks.len(),
                    output.retrieval_time_ms,
                    output.generation_time_ms
                );
            }
        }

        Commands::Stats => {
            println!(
                "{}",
                serde_json::to_string_pretty(&pipeline.statistics()).unwrap_or_default()
            );
        }

        Commands::Clear => {
            pipeline.clear_documents();
            save_index(&pipeline, &index_path)?;
            println!("index cleared");
        }
    }

    Ok(())
}

#[cfg(feature = "onnx")]
fn save_index(pipeline: &ragmill::pipeline::RagPipeline, index_path: &std::path::Path) -> Result<()> {
    if let Some(parent) = index_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ragmill::error::RagError::Io {
            source: e,
            context: format!("creating {}", parent.display()),
        })?;
    }
    pipeline.save_index(index_path)
}

#[cfg(not(feature = "onnx"))]
fn run(_cli: Cli) -> Result<()> {
    Err(ragmill::error::RagError::Config(
        "this binary was built without the onnx feature; no embedding provider is available"
            .to_string(),
    ))
}
