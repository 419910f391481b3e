use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing::error;

use coderag::config::Settings;
use coderag::indexer::Watcher;
use coderag::inference::ChatMessage;
use coderag::retrieval::ChatRequest;
use coderag::server::{self, AppState};
use coderag::Result;

#[derive(Parser, Debug)]
#[command(name = "coderag")]
#[command(about = "Local RAG engine: chunk, embed, and search source-code and document corpora")]
#[command(version)]
struct Cli {
    /// Path to the settings file.
    #[arg(long, global = true, default_value = "settings.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process and embed all configured sources
    Embed,
    /// Diff the filesystem against the store and apply the changes
    Update,
    /// Watch configured sources and update on an interval
    Watch {
        /// Poll interval in seconds
        #[arg(default_value_t = 60)]
        interval: u64,
    },
    /// Search for similar chunks
    Search {
        /// The search query
        query: String,
        /// Number of results to return
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    /// Show database statistics
    Stats,
    /// Clear all data
    Clear,
    /// Rebuild the vector index, reclaiming tombstoned entries
    Compact,
    /// Interactive chat grounded in the indexed corpus
    Chat,
    /// Start the HTTP API server
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8081)]
        port: u16,
        /// Enable background updates, optionally with an interval in
        /// seconds
        #[arg(long, num_args = 0..=1, default_missing_value = "60")]
        watch: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage goes to the terminal for help requests and parse
            // failures alike; only the latter is a failure exit.
            let is_failure = e.use_stderr();
            let _ = e.print();
            return if is_failure {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(&cli.config)?;
    let state = AppState::initialize(settings).await?;

    match cli.command {
        Commands::Embed => {
            println!("Starting embedding process...");
            let (files, chunks) = state.updater.embed_all().await?;
            println!("\nCompleted!");
            println!("  Files processed: {}", files);
            println!("  Total chunks: {}", chunks);
        }
        Commands::Update => {
            let touched = state.updater.update().await?;
            println!("Update completed: {} files processed", touched);
        }
        Commands::Watch { interval } => {
            let watcher = Watcher::spawn(Arc::clone(&state.updater), interval);
            println!("Watching for changes every {}s. Press Ctrl+C to stop.", interval);
            let _ = tokio::signal::ctrl_c().await;
            watcher.join().await;
        }
        Commands::Search { query, top } => {
            println!("Searching for: {}", query);
            let embedding = state.embedder.embed(&query).await?;
            let results = state.db.search(&embedding, top).await?;

            println!("\nFound {} results:", results.len());
            println!("{}", "-".repeat(80));
            for (i, result) in results.iter().enumerate() {
                println!("\n[{}] Score: {:.4}", i + 1, result.similarity_score);
                println!("Source: {}", result.source_id);
                println!("Type: {}", result.chunk_type);
                let preview: String = result.content.chars().take(200).collect();
                if result.content.chars().count() > 200 {
                    println!("Content: {}...", preview);
                } else {
                    println!("Content: {}", preview);
                }
            }
        }
        Commands::Stats => {
            let stats = state.db.get_stats().await?;
            println!("\n=== Database Statistics ===");
            println!("Total chunks: {}", stats.total_chunks);
            println!("Vectors in index: {}", stats.vector_count);
            println!("Active vectors: {}", stats.active_count);
            println!("Tombstoned vectors: {}", stats.deleted_count);

            println!("\nChunks by source:");
            for (source, count) in &stats.sources {
                println!("  {}: {}", source, count);
            }
            println!("\nChunks by type:");
            for (chunk_type, count) in &stats.types {
                println!("  {}: {}", chunk_type, count);
            }
        }
        Commands::Clear => {
            print!("Are you sure you want to clear all data? (yes/no): ");
            std::io::stdout().flush()?;
            let mut confirm = String::new();
            BufReader::new(tokio::io::stdin())
                .read_line(&mut confirm)
                .await?;
            if confirm.trim() == "yes" {
                state.db.clear().await?;
                println!("Database cleared.");
            } else {
                println!("Cancelled.");
            }
        }
        Commands::Compact => {
            state.db.compact().await?;
            let stats = state.db.get_stats().await?;
            println!(
                "Compaction complete: {} active vectors, {} tombstoned",
                stats.active_count, stats.deleted_count
            );
        }
        Commands::Chat => {
            chat_repl(&state).await?;
        }
        Commands::Serve { port, watch } => {
            let watcher = watch.map(|interval| {
                println!("  Auto-update: enabled (every {}s)", interval);
                Watcher::spawn(Arc::clone(&state.updater), interval)
            });
            if watcher.is_none() {
                println!("  Auto-update: disabled");
            }

            server::serve(state, port).await?;

            if let Some(watcher) = watcher {
                watcher.join().await;
            }
        }
    }

    Ok(())
}

/// Line-oriented chat loop; an empty line or `exit` quits.
async fn chat_repl(state: &AppState) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Chat ready. Type a question, or 'exit' to quit.");

    loop {
        print!("You: ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() || question == "exit" {
            break;
        }

        let request = ChatRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: question.to_string(),
            }],
            attachments: vec![],
            sourceids: vec![],
            temperature: 0.5,
        };

        match state.planner.chat(&request).await {
            Ok((_context, mut stream)) => {
                while let Some(delta) = stream.next().await {
                    match delta {
                        Ok(content) => {
                            print!("{}", content);
                            std::io::stdout().flush()?;
                        }
                        Err(e) => {
                            eprintln!("\nStream error: {}", e);
                            break;
                        }
                    }
                }
                println!();
            }
            Err(e) => eprintln!("Error: {}", e),
        }
    }
    Ok(())
}
