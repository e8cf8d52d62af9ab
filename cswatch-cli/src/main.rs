//! Main entry point for the change stream tail
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cswatch::config::{FullDocument, Settings};
use cswatch::output::JsonPrinter;
use cswatch::{Closed, Watcher};
use mongodb::{options::ClientOptions, Client};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Print MongoDB change events as JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// MongoDB connection string, its path names the default database
    uri: Option<String>,
    /// Collection to watch
    #[arg(long)]
    collection: Option<String>,
    /// Database to watch, overrides the connection string
    #[arg(long)]
    database: Option<String>,
    /// Aggregation pipeline as a JSON array, e.g. '[{"$match": {"operationType": "update"}}]'
    #[arg(long)]
    pipeline: Option<String>,
    /// What update events carry in fullDocument
    #[arg(long, value_enum)]
    full_document: Option<FullDocumentArg>,
    /// Number of events per server batch
    #[arg(long)]
    batch_size: Option<u32>,
    /// How long the server waits for new events before answering an empty batch
    #[arg(long)]
    max_await_ms: Option<u64>,
    /// Print one event per line
    #[arg(long)]
    compact: bool,
    /// Path to an optional config file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,
    /// Prefix for environment variables
    #[arg(short, long, default_value = "CSWATCH")]
    prefix: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FullDocumentArg {
    #[value(name = "default")]
    Default,
    #[value(name = "updateLookup")]
    UpdateLookup,
    #[value(name = "whenAvailable")]
    WhenAvailable,
    #[value(name = "required")]
    Required,
}

impl From<FullDocumentArg> for FullDocument {
    fn from(arg: FullDocumentArg) -> Self {
        match arg {
            FullDocumentArg::Default => FullDocument::Default,
            FullDocumentArg::UpdateLookup => FullDocument::UpdateLookup,
            FullDocumentArg::WhenAvailable => FullDocument::WhenAvailable,
            FullDocumentArg::Required => FullDocument::Required,
        }
    }
}

impl Cli {
    /// Flags win over the file and the environment.
    fn apply(&self, settings: &mut Settings) {
        if let Some(uri) = &self.uri {
            settings.mongo_uri = Some(uri.clone());
        }
        if let Some(database) = &self.database {
            settings.database = Some(database.clone());
        }
        if let Some(collection) = &self.collection {
            settings.collection = Some(collection.clone());
        }
        if let Some(pipeline) = &self.pipeline {
            settings.pipeline = Some(pipeline.clone());
        }
        if let Some(full_document) = self.full_document {
            settings.full_document = Some(full_document.into());
        }
        if let Some(batch_size) = self.batch_size {
            settings.batch_size = Some(batch_size);
        }
        if let Some(max_await_ms) = self.max_await_ms {
            settings.max_await_ms = Some(max_await_ms);
        }
        settings.compact |= self.compact;
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut builder = config::Config::builder();
    if let Some(path) = &cli.config {
        builder = builder.add_source(config::File::with_name(path));
    }
    let config = builder
        .add_source(config::Environment::with_prefix(&cli.prefix).try_parsing(true))
        .build()?;

    let mut settings = config
        .try_deserialize::<Settings>()
        .context("Failed to read settings")?;
    cli.apply(&mut settings);
    Ok(settings)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let settings = load_settings(&cli)?;
    let options = ClientOptions::parse(settings.mongo_uri())
        .await
        .context("Invalid connection string")?;
    let watcher = Watcher::with_config(settings.watch_config(options.default_database.as_deref())?);
    let client = Client::with_options(options)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, closing change stream");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
            }
        }
    });

    let mut printer = JsonPrinter::new(std::io::stdout(), settings.format());
    let closed = watcher.watch(&client, &mut printer, cancel).await?;
    if closed == Closed::Ended {
        info!("Change stream was closed by the server");
    }

    client.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cswatch::output::Format;

    #[test]
    fn test_flags_override_settings() {
        let cli = Cli::parse_from([
            "cswatch",
            "mongodb://localhost:27017/argos?replicaSet=rs0",
            "--collection",
            "oplogs",
            "--full-document",
            "updateLookup",
            "--compact",
        ]);
        let mut settings = Settings {
            mongo_uri: Some("mongodb://elsewhere".into()),
            collection: Some("students".into()),
            pipeline: Some("[]".into()),
            ..Default::default()
        };
        cli.apply(&mut settings);

        assert_eq!(
            settings.mongo_uri(),
            "mongodb://localhost:27017/argos?replicaSet=rs0"
        );
        assert_eq!(settings.collection.as_deref(), Some("oplogs"));
        assert_eq!(settings.pipeline.as_deref(), Some("[]"));
        assert_eq!(settings.full_document, Some(FullDocument::UpdateLookup));
        assert_eq!(settings.format(), Format::Compact);
    }

    #[test]
    fn test_no_flags_keep_settings() {
        let cli = Cli::parse_from(["cswatch"]);
        let mut settings = Settings {
            database: Some("argos".into()),
            compact: true,
            ..Default::default()
        };
        let before = settings.clone();
        cli.apply(&mut settings);

        assert_eq!(settings, before);
        assert_eq!(cli.prefix, "CSWATCH");
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
