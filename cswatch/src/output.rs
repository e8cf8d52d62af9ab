//! JSON rendering of change events.

use std::io::{self, Write};

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};
use thiserror::Error;
use tracing::debug;

use crate::mongo::{
    event::{ChangeEvent, Malformed},
    watcher::{Handle, HandlerError},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to serialize change event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to write change event: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    /// Indented with two spaces, one event spanning several lines.
    #[default]
    Pretty,
    /// One event per line.
    Compact,
}

/// Writes each change event as relaxed extended JSON, followed by a newline.
///
/// The document is printed as received, so fields a pipeline added or
/// removed show up exactly as the server sent them.
pub struct JsonPrinter<W> {
    out: W,
    format: Format,
}

impl<W: Write + Send> JsonPrinter<W> {
    pub fn new(out: W, format: Format) -> Self {
        Self { out, format }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn print(&mut self, raw: &Document) -> Result<(), Error> {
        let value = Bson::Document(raw.clone()).into_relaxed_extjson();
        match self.format {
            Format::Pretty => serde_json::to_writer_pretty(&mut self.out, &value)?,
            Format::Compact => serde_json::to_writer(&mut self.out, &value)?,
        }
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

#[async_trait]
impl<W: Write + Send> Handle for JsonPrinter<W> {
    async fn handle(&mut self, event: ChangeEvent) -> Result<(), HandlerError> {
        Ok(self.print(event.raw())?)
    }

    // Reshaping pipelines can drop `operationType`; such documents are still output.
    async fn malformed(&mut self, event: Malformed) -> Result<(), HandlerError> {
        debug!(error = %event.source, "Printing change event without a typed view");
        Ok(self.print(&event.raw)?)
    }
}
