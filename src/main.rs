//! ragline — a local-first retrieval-augmented-generation service.
//!
//! Wraps the library crate's components behind a CLI that mirrors the HTTP
//! facade one-for-one: every endpoint has a command-line equivalent for
//! offline or scripted use.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ragline::auth::AdminAuth;
use ragline::chunker::{Chunker, ChunkerConfig};
use ragline::completion::{CollectingSink, CompletionClient};
use ragline::config::{self, Config};
use ragline::embedding::client::{EmbedKind, EmbeddingClient};
use ragline::http::{self, metrics::Metrics, AppState};
use ragline::lifecycle::{self, ShutdownFlag};
use ragline::models::ChatMessage;
use ragline::planner::RetrievalPlanner;
use ragline::source::SourceCollector;
use ragline::store::VectorStore;
use ragline::tokenizer::Tokenizer;
use ragline::updater::IncrementalUpdater;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};

#[derive(Parser)]
#[command(name = "ragline", about = "A local-first retrieval-augmented-generation service", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed and index every configured source from scratch.
    Embed,
    /// Detect and apply changes since the last run.
    Update,
    /// Run the updater on a timer until interrupted.
    Watch {
        #[arg(long, default_value_t = 300)]
        seconds: u64,
    },
    /// Search indexed chunks.
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Print store statistics.
    Stats,
    /// Remove every tracked file and chunk from the store.
    Clear,
    /// Rewrite the ANN index with only live vectors.
    Compact,
    /// Ask a single question against the indexed corpus.
    Chat { question: String },
    /// Start the HTTP facade.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, num_args = 0..=1, default_missing_value = "300")]
        watch: Option<u64>,
    },
    /// Set the admin password non-interactively.
    ResetPassword {
        #[arg(long)]
        pass: String,
    },
    /// Prompt for a new admin password on stdin.
    ResetPasswordInteractive,
    /// Report whether the admin password is still the built-in default.
    PasswordStatus,
}

struct Components {
    config: Arc<Config>,
    collector: Arc<SourceCollector>,
    chunker: Arc<Chunker>,
    embedding: Arc<EmbeddingClient>,
    completion: Arc<CompletionClient>,
    store: Arc<VectorStore>,
    updater: Arc<AsyncMutex<IncrementalUpdater>>,
}

impl Components {
    async fn build(config: Config) -> Result<Self> {
        let tokenizer = if std::path::Path::new(&config.tokenizer.config_path).exists() {
            Arc::new(Tokenizer::from_vocab_file(
                std::path::Path::new(&config.tokenizer.config_path),
                config.tokenizer.max_input_chars_per_word,
            )?)
        } else {
            Arc::new(Tokenizer::fallback())
        };

        let chunker_config = ChunkerConfig {
            min_tokens: config.chunking.nof_min_tokens,
            max_tokens: config.chunking.nof_max_tokens,
            overlap_fraction: config.chunking.overlap_percentage,
        };
        let chunker = Arc::new(Chunker::new(tokenizer.clone(), chunker_config));

        let collector = Arc::new(SourceCollector::new(config.source.clone()));

        let api = config
            .embedding
            .current()
            .with_context(|| "no embedding API configured (embedding.current_api)")?
            .clone();
        let embedding = Arc::new(EmbeddingClient::new(api.clone(), config.database.vector_dim, config.embedding.timeout_ms)?);

        let completion = Arc::new(CompletionClient::new(tokenizer.clone()));

        let store = Arc::new(VectorStore::open(&config.database).await?);

        // The updater owns its own collector/chunker/embedding client
        // instances rather than sharing the `Arc`s above: all three are
        // cheap to construct (thin wrappers over config and an HTTP
        // client) and the updater needs owned values it can hold behind
        // its own mutex independent of request-path readers.
        let updater_collector = SourceCollector::new(config.source.clone());
        let updater_chunker = Chunker::new(tokenizer, chunker_config);
        let updater_embedding = EmbeddingClient::new(api, config.database.vector_dim, config.embedding.timeout_ms)?;
        let updater = Arc::new(AsyncMutex::new(IncrementalUpdater::new(
            updater_collector,
            updater_chunker,
            Some(updater_embedding),
            config.embedding.batch_size,
        )));

        Ok(Self {
            config: Arc::new(config),
            collector,
            chunker,
            embedding,
            completion,
            store,
            updater,
        })
    }
}

fn init_logging(logging: &ragline::config::LoggingConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(false));

    if let Some(path) = &logging.logging_file {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file_appender = tracing_appender::rolling::never(
            std::path::Path::new(path).parent().unwrap_or_else(|| std::path::Path::new(".")),
            std::path::Path::new(path).file_name().unwrap_or_default(),
        );
        registry.with(fmt::layer().with_writer(file_appender).with_ansi(false)).init();
    } else {
        registry.init();
    }
}

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    init_logging(&config.logging);

    let result = run(cli.command, config).await;
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Embed | Commands::Update => {
            let components = Components::build(config).await?;
            let mut updater = components.updater.lock().await;
            let info = updater.detect_changes(&components.store).await?;
            let updated = updater.apply(&info, &components.store).await?;
            println!("{updated} files updated");
        }
        Commands::Watch { seconds } => {
            let components = Components::build(config).await?;
            let flag = ShutdownFlag::new();
            tokio::spawn(lifecycle::install_signal_handlers(flag.clone()));
            lifecycle::run_watcher(components.updater.clone(), components.store.clone(), seconds, flag).await;
        }
        Commands::Search { query, top_k } => {
            let components = Components::build(config).await?;
            let vectors = components.embedding.encode(&[query], EmbedKind::Query).await?;
            let query_vec = vectors.first().context("no embedding returned for query")?;
            let results = components.store.search(query_vec, top_k).await?;
            for result in results {
                println!("{:.3}  {}  {}", result.similarity_score, result.source_id, truncate(&result.content, 80));
            }
        }
        Commands::Stats => {
            let components = Components::build(config).await?;
            let stats = components.store.get_stats().await?;
            println!("tracked_files: {}", stats.tracked_files);
            println!("live_chunks: {}", stats.live_chunks);
            println!("tombstoned_chunks: {}", stats.tombstoned_chunks);
            println!("vector_count: {}", stats.vector_count);
        }
        Commands::Clear => {
            let components = Components::build(config).await?;
            components.store.clear().await?;
            println!("store cleared");
        }
        Commands::Compact => {
            let components = Components::build(config).await?;
            components.store.compact().await?;
            println!("store compacted");
        }
        Commands::Chat { question } => {
            let components = Components::build(config).await?;
            let api = components
                .config
                .generation
                .current()
                .context("no generation API configured")?
                .clone();
            let planner = RetrievalPlanner::new(&components.store, &components.collector, &components.embedding, &components.config.generation);
            let results = planner.plan(&question, &[], &[]).await?;
            let budget = CompletionClient::context_budget(&api, components.config.generation.max_context_tokens, components.config.generation.default_max_tokens);
            let context = components.completion.build_context(&results, &components.config.generation.prepend_label_format, budget);
            let prompt = CompletionClient::build_prompt(&context, &question);
            let messages = vec![ChatMessage { role: "user".to_string(), content: question.clone() }];

            let mut sink = CollectingSink::default();
            components
                .completion
                .stream(
                    &api,
                    &messages,
                    &prompt,
                    Some(components.config.generation.default_temperature),
                    components.config.generation.default_max_tokens,
                    &mut sink,
                )
                .await?;
            println!("{}", sink.0);
        }
        Commands::Serve { port, watch } => {
            let components = Components::build(config).await?;
            let flag = ShutdownFlag::new();
            tokio::spawn(lifecycle::install_signal_handlers(flag.clone()));

            if let Some(seconds) = watch {
                let store = components.store.clone();
                let watch_flag = flag.clone();
                tokio::spawn(lifecycle::run_watcher(components.updater.clone(), store, seconds, watch_flag));
            }

            let admin_auth = AdminAuth::load(".admin_password")?;
            if admin_auth.is_default_password() {
                tracing::warn!("admin password is still the built-in default, run 'ragline reset-password' to change it");
            }

            let state = AppState {
                config: components.config.clone(),
                store: components.store.clone(),
                embedding: components.embedding.clone(),
                completion: components.completion.clone(),
                collector: components.collector.clone(),
                chunker: components.chunker.clone(),
                updater: components.updater.clone(),
                auth: Arc::new(AsyncRwLock::new(admin_auth)),
                metrics: Arc::new(Metrics::new()),
            };

            http::run_server(state, port, flag.clone()).await?;
            components.store.persist().await?;
        }
        Commands::ResetPassword { pass } => {
            let mut auth = AdminAuth::load(".admin_password")?;
            auth.set_password(&pass)?;
            println!("admin password updated");
        }
        Commands::ResetPasswordInteractive => {
            print!("New admin password: ");
            std::io::stdout().flush()?;
            let mut pass = String::new();
            std::io::stdin().read_line(&mut pass)?;
            let mut auth = AdminAuth::load(".admin_password")?;
            auth.set_password(pass.trim())?;
            println!("admin password updated");
        }
        Commands::PasswordStatus => {
            let auth = AdminAuth::load(".admin_password")?;
            if auth.is_default_password() {
                println!("admin password is the built-in default");
            } else {
                println!("admin password has been changed");
            }
        }
    }
    Ok(())
}

fn truncate(s: &str, max_chars: usize) -> String {
    let collapsed: String = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        collapsed.chars().take(max_chars).collect::<String>() + "..."
    }
}
