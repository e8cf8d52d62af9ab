use std::{fmt, time::Duration};

use mongodb::{
    bson::Document,
    options::{ChangeStreamOptions, FullDocumentType},
};
use serde::Deserialize;
use thiserror::Error;

use crate::{output::Format, pipeline};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid pipeline: {0}")]
    Pipeline(#[from] pipeline::Error),
    #[error("Collection '{0}' requires a database, set one in the URI or with --database")]
    CollectionWithoutDatabase(String),
}

/// Breadth of a change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// Every database of the deployment.
    Client,
    Database { db: &'a str },
    Collection { db: &'a str, coll: &'a str },
}

impl fmt::Display for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Client => write!(f, "deployment"),
            Scope::Database { db } => write!(f, "database '{}'", db),
            Scope::Collection { db, coll } => write!(f, "collection '{}.{}'", db, coll),
        }
    }
}

/// What the server puts into `fullDocument` for update events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FullDocument {
    Default,
    UpdateLookup,
    WhenAvailable,
    Required,
}

impl FullDocument {
    fn to_driver(self) -> Option<FullDocumentType> {
        match self {
            FullDocument::Default => None,
            FullDocument::UpdateLookup => Some(FullDocumentType::UpdateLookup),
            FullDocument::WhenAvailable => Some(FullDocumentType::WhenAvailable),
            FullDocument::Required => Some(FullDocumentType::Required),
        }
    }
}

/// Cursor tuning forwarded verbatim to the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub full_document: Option<FullDocument>,
    pub batch_size: Option<u32>,
    pub max_await_time: Option<Duration>,
}

impl StreamOptions {
    pub(crate) fn to_driver(&self) -> ChangeStreamOptions {
        let mut options = ChangeStreamOptions::default();
        options.full_document = self.full_document.and_then(FullDocument::to_driver);
        options.batch_size = self.batch_size;
        options.max_await_time = self.max_await_time;
        options
    }
}

/// Target and filter of a single watch.
///
/// Empty names count as unset, so the scope is decided purely by which of
/// `collection` and `database` carry a value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchConfig {
    database: Option<String>,
    collection: Option<String>,
    pipeline: Vec<Document>,
    options: StreamOptions,
}

impl WatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_database(&mut self, name: impl Into<String>) {
        self.database = non_empty(name.into());
    }

    pub fn set_collection(&mut self, name: impl Into<String>) {
        self.collection = non_empty(name.into());
    }

    pub fn set_pipeline(&mut self, stages: Vec<Document>) {
        self.pipeline = stages;
    }

    pub fn set_options(&mut self, options: StreamOptions) {
        self.options = options;
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn pipeline(&self) -> &[Document] {
        &self.pipeline
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Resolve the scope of the stream.
    ///
    /// A collection without a database resolves to database `""`; the server
    /// rejects that namespace when the stream is opened.
    pub fn scope(&self) -> Scope<'_> {
        match (self.database.as_deref(), self.collection.as_deref()) {
            (db, Some(coll)) => Scope::Collection {
                db: db.unwrap_or_default(),
                coll,
            },
            (Some(db), None) => Scope::Database { db },
            (None, None) => Scope::Client,
        }
    }
}

fn non_empty(name: String) -> Option<String> {
    (!name.is_empty()).then_some(name)
}

/// Command-line settings, layered from an optional file, the environment and flags.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub mongo_uri: Option<String>,
    pub database: Option<String>,
    pub collection: Option<String>,
    pub pipeline: Option<String>,
    pub full_document: Option<FullDocument>,
    pub batch_size: Option<u32>,
    pub max_await_ms: Option<u64>,
    #[serde(default)]
    pub compact: bool,
}

impl Settings {
    pub const DEFAULT_URI: &'static str = "mongodb://localhost:27017";

    pub fn mongo_uri(&self) -> &str {
        self.mongo_uri.as_deref().unwrap_or(Self::DEFAULT_URI)
    }

    pub fn format(&self) -> Format {
        if self.compact {
            Format::Compact
        } else {
            Format::Pretty
        }
    }

    /// Build the watch configuration.
    ///
    /// `uri_database` is the default database of the connection string and
    /// is used only when no database was configured explicitly.
    pub fn watch_config(&self, uri_database: Option<&str>) -> Result<WatchConfig, Error> {
        let mut config = WatchConfig::new();
        config.set_pipeline(pipeline::parse_opt(self.pipeline.as_deref())?);
        config.set_options(StreamOptions {
            full_document: self.full_document,
            batch_size: self.batch_size,
            max_await_time: self.max_await_ms.map(Duration::from_millis),
        });

        let database = self
            .database
            .as_deref()
            .filter(|db| !db.is_empty())
            .or(uri_database);
        if let Some(db) = database {
            config.set_database(db);
        }
        if let Some(coll) = &self.collection {
            config.set_collection(coll.as_str());
        }

        if let (Some(coll), None) = (config.collection(), config.database()) {
            return Err(Error::CollectionWithoutDatabase(coll.to_owned()));
        }
        Ok(config)
    }
}
