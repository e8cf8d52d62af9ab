use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use mongodb::{
    bson::Document,
    change_stream::{event::ResumeToken, ChangeStream},
    Client,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Scope, StreamOptions, WatchConfig};
use crate::mongo::event::{ChangeEvent, Malformed};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open change stream on {scope}: {source}")]
    Open {
        scope: String,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("Change stream error: {0}")]
    Stream(#[source] mongodb::error::Error),
    #[error("Undecodable change event: {0}")]
    Decode(#[from] Malformed),
    #[error("Event handler error: {0}")]
    Handler(#[source] HandlerError),
}

/// How a watch ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    /// The server closed the stream, e.g. after an `invalidate` event.
    Ended,
    Cancelled,
}

/// Receiver of change events.
///
/// Calls are sequential: the next event is not pulled from the cursor until
/// the previous call has returned. An error stops the watch.
#[async_trait]
pub trait Handle: Send {
    async fn handle(&mut self, event: ChangeEvent) -> Result<(), HandlerError>;

    /// Called for a change document that could not be decoded.
    async fn malformed(&mut self, event: Malformed) -> Result<(), HandlerError> {
        error!(error = %event.source, raw = ?event.raw, "Skipping undecodable change event");
        Ok(())
    }
}

#[async_trait]
impl<F> Handle for F
where
    F: FnMut(ChangeEvent) -> Result<(), HandlerError> + Send,
{
    async fn handle(&mut self, event: ChangeEvent) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Watches a MongoDB change stream at client, database or collection scope.
///
/// The configuration is only mutable through `&mut self`, so it cannot change
/// while [`Watcher::watch`] borrows the watcher.
#[derive(Debug, Clone, Default)]
pub struct Watcher {
    config: WatchConfig,
}

impl Watcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: WatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn set_collection(&mut self, name: impl Into<String>) {
        self.config.set_collection(name);
    }

    pub fn set_database(&mut self, name: impl Into<String>) {
        self.config.set_database(name);
    }

    pub fn set_pipeline(&mut self, stages: Vec<Document>) {
        self.config.set_pipeline(stages);
    }

    pub fn set_options(&mut self, options: StreamOptions) {
        self.config.set_options(options);
    }

    pub fn scope(&self) -> Scope<'_> {
        self.config.scope()
    }

    /// Open the change stream and return it as a lazy stream of events.
    ///
    /// The pipeline runs on the server as part of the change stream
    /// aggregation. Names are not checked locally, an invalid namespace or
    /// pipeline is reported by the server here.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the server rejects the request.
    pub async fn open(&self, client: &Client) -> Result<EventStream, Error> {
        let scope = self.scope();
        let pipeline = self.config.pipeline().to_vec();
        let options = self.config.options().to_driver();
        let stages = pipeline.len();

        debug!(%scope, ?pipeline, "Opening change stream");
        let opened = match scope {
            Scope::Client => client.watch().pipeline(pipeline).with_options(options).await,
            Scope::Database { db } => {
                client
                    .database(db)
                    .watch()
                    .pipeline(pipeline)
                    .with_options(options)
                    .await
            }
            Scope::Collection { db, coll } => {
                client
                    .database(db)
                    .collection::<Document>(coll)
                    .watch()
                    .pipeline(pipeline)
                    .with_options(options)
                    .await
            }
        };

        let cursor = opened.map_err(|source| {
            error!(error = %source, %scope, "Failed to open change stream");
            Error::Open {
                scope: scope.to_string(),
                source,
            }
        })?;
        info!(%scope, stages, "Started watching");

        Ok(EventStream::new(cursor.with_type::<Document>()))
    }

    /// Open the change stream and deliver every event to `handler`.
    ///
    /// Runs until the server ends the stream, an error occurs, or `cancel`
    /// fires. Cancellation is observed before each pull, so an event that was
    /// handed to `handler` is always fully handled.
    ///
    /// # Errors
    /// Returns an error if the stream cannot be opened, the cursor fails, or
    /// the handler fails. No retries happen here; resumable errors are
    /// retried by the driver.
    pub async fn watch<H>(
        &self,
        client: &Client,
        handler: &mut H,
        cancel: CancellationToken,
    ) -> Result<Closed, Error>
    where
        H: Handle + ?Sized,
    {
        let events = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(scope = %self.scope(), "Watch cancelled before the change stream was opened");
                return Ok(Closed::Cancelled);
            }
            events = self.open(client) => events?,
        };
        drive(events, handler, &cancel).await
    }
}

/// Pull loop shared by [`Watcher::watch`] and the tests.
async fn drive<S, H>(
    mut events: S,
    handler: &mut H,
    cancel: &CancellationToken,
) -> Result<Closed, Error>
where
    S: Stream<Item = Result<ChangeEvent, Error>> + Unpin,
    H: Handle + ?Sized,
{
    let mut delivered: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(delivered, "Watch cancelled");
                return Ok(Closed::Cancelled);
            }
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                debug!(operation_type = event.operation_type(), "Received change event");
                handler.handle(event).await.map_err(|e| {
                    error!(error = %e, "Failed to handle change event");
                    Error::Handler(e)
                })?;
                delivered += 1;
            }
            Some(Err(Error::Decode(malformed))) => {
                warn!(error = %malformed, "Received undecodable change event");
                handler.malformed(malformed).await.map_err(|e| {
                    error!(error = %e, "Failed to handle undecodable change event");
                    Error::Handler(e)
                })?;
            }
            Some(Err(e)) => {
                error!(error = %e, delivered, "Change stream error");
                return Err(e);
            }
            None => {
                info!(delivered, "Change stream ended");
                return Ok(Closed::Ended);
            }
        }
    }
}

/// Open change stream yielding decoded events.
///
/// The stream is not restartable: once it ends or fails a new one has to be
/// opened with [`Watcher::open`]. Dropping it closes the server-side cursor.
pub struct EventStream<C = ChangeStream<Document>> {
    cursor: C,
}

impl<C> EventStream<C> {
    fn new(cursor: C) -> Self {
        Self { cursor }
    }
}

impl EventStream {
    /// Resume token of the most recently returned event.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.cursor.resume_token()
    }

    /// Whether the server-side cursor may still return events.
    pub fn is_alive(&self) -> bool {
        self.cursor.is_alive()
    }
}

impl<C> Stream for EventStream<C>
where
    C: Stream<Item = mongodb::error::Result<Document>> + Unpin,
{
    type Item = Result<ChangeEvent, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.cursor.poll_next_unpin(cx).map(|next| {
            next.map(|res| match res {
                Ok(raw) => ChangeEvent::try_from(raw).map_err(Error::from),
                Err(e) => Err(Error::Stream(e)),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use mongodb::bson::doc;

    fn insert(n: i32) -> Document {
        doc! {
            "_id": {"_data": format!("token-{}", n)},
            "operationType": "insert",
            "ns": {"db": "argos", "coll": "oplogs"},
            "documentKey": {"_id": n},
            "fullDocument": {"_id": n, "city": "Atlanta"},
        }
    }

    fn cursor(
        items: Vec<mongodb::error::Result<Document>>,
    ) -> EventStream<stream::Iter<std::vec::IntoIter<mongodb::error::Result<Document>>>> {
        EventStream::new(stream::iter(items))
    }

    fn stream_error() -> mongodb::error::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset").into()
    }

    fn full_document_id(event: &ChangeEvent) -> i32 {
        event.full_document().unwrap().get_i32("_id").unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<ChangeEvent>,
        malformed: Vec<Document>,
    }

    #[async_trait]
    impl Handle for Recorder {
        async fn handle(&mut self, event: ChangeEvent) -> Result<(), HandlerError> {
            self.events.push(event);
            Ok(())
        }

        async fn malformed(&mut self, event: Malformed) -> Result<(), HandlerError> {
            self.malformed.push(event.raw);
            Ok(())
        }
    }

    #[test]
    fn test_watcher_setters() {
        let mut watcher = Watcher::new();
        assert_eq!(watcher.scope(), Scope::Client);

        watcher.set_database("argos");
        assert_eq!(watcher.scope(), Scope::Database { db: "argos" });

        watcher.set_collection("oplogs");
        watcher.set_pipeline(vec![doc! {"$match": {"operationType": "insert"}}]);
        assert_eq!(
            watcher.scope(),
            Scope::Collection {
                db: "argos",
                coll: "oplogs"
            }
        );
        assert_eq!(watcher.config().pipeline().len(), 1);
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let events = cursor((0..5).map(|n| Ok(insert(n))).collect());
        let mut recorder = Recorder::default();

        let closed = drive(events, &mut recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(closed, Closed::Ended);
        let ids: Vec<_> = recorder.events.iter().map(full_document_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let events = cursor(vec![Ok(insert(1)), Ok(insert(2))]);
        let mut seen = Vec::new();
        let mut handler = |event: ChangeEvent| -> Result<(), HandlerError> {
            seen.push(event.operation_type().to_owned());
            Ok(())
        };

        let closed = drive(events, &mut handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(closed, Closed::Ended);
        assert_eq!(seen, vec!["insert", "insert"]);
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_stop_the_watch() {
        let bad = doc! {"fullDocument": {"city": "Atlanta"}};
        let events = cursor(vec![Ok(insert(1)), Ok(bad.clone()), Ok(insert(2))]);
        let mut recorder = Recorder::default();

        let closed = drive(events, &mut recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(closed, Closed::Ended);
        assert_eq!(recorder.events.len(), 2);
        assert_eq!(recorder.malformed, vec![bad]);
    }

    #[tokio::test]
    async fn test_stream_error_terminates_the_watch() {
        let events = cursor(vec![Ok(insert(1)), Err(stream_error()), Ok(insert(2))]);
        let mut recorder = Recorder::default();

        let err = drive(events, &mut recorder, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Stream(_)));
        assert_eq!(recorder.events.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_terminates_the_watch() {
        let events = cursor(vec![Ok(insert(1)), Ok(insert(2))]);
        let mut calls = 0;
        let mut handler = |_event: ChangeEvent| -> Result<(), HandlerError> {
            calls += 1;
            Err("stdout closed".into())
        };

        let err = drive(events, &mut handler, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Handler(ref e) if e.to_string() == "stdout closed"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_event() {
        let events = cursor(vec![Ok(insert(1))]);
        let mut recorder = Recorder::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let closed = drive(events, &mut recorder, &cancel).await.unwrap();

        assert_eq!(closed, Closed::Cancelled);
        assert!(recorder.events.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_between_events() {
        let events = cursor((0..5).map(|n| Ok(insert(n))).collect());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut ids = Vec::new();
        let mut handler = |event: ChangeEvent| -> Result<(), HandlerError> {
            ids.push(full_document_id(&event));
            if ids.len() == 2 {
                trigger.cancel();
            }
            Ok(())
        };

        let closed = drive(events, &mut handler, &cancel).await.unwrap();

        assert_eq!(closed, Closed::Cancelled);
        assert_eq!(ids, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_pending_cursor() {
        let events = EventStream::new(stream::pending::<mongodb::error::Result<Document>>());
        let mut recorder = Recorder::default();
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let closed = drive(events, &mut recorder, &cancel).await.unwrap();
        task.await.unwrap();

        assert_eq!(closed, Closed::Cancelled);
        assert!(recorder.events.is_empty());
    }
}
