//! List-then-watch informers
//!
//! One generic [`Informer`] per watched collection. On start it lists the
//! active records and queues their ids; [`Informer::run`] then tails the
//! store's change feed from the persisted resume token and queues the id of
//! every inserted or updated record. The informer owns only the queue and the
//! resume token, never record content.
//!
//! Per-collection configuration lives in [`kinds`].

pub mod kinds;
mod queue;
mod token;

pub use queue::{QueueItem, WorkQueue};
pub use token::{ResumeTokenRecord, ResumeTokenStore, TokenPatch, get_start_watch_token};

use crate::store::{ChangeEvent, ChangeFeed, OperationType, Store, WatchStart};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use shared::{AppError, AppResult};
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lists the ids of the active records of one collection
pub type ListFn<K> = for<'a> fn(&'a dyn Store) -> BoxFuture<'a, AppResult<Vec<K>>>;

/// Pulls the record id out of a change-event document
pub type ExtractFn<K> = fn(&serde_json::Value) -> Option<K>;

/// Identifier types an informer can queue
pub trait InformerKey: QueueItem + Display {}

impl<T> InformerKey for T where T: QueueItem + Display {}

/// What an informer watches and how it finds ids
pub struct InformerSpec<K> {
    pub name: &'static str,
    pub collection: &'static str,
    /// `_id` of this collection's resume-token record
    pub token_key: &'static str,
    pub list: ListFn<K>,
    pub extract: ExtractFn<K>,
}

impl<K> Clone for InformerSpec<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            collection: self.collection,
            token_key: self.token_key,
            list: self.list,
            extract: self.extract,
        }
    }
}

/// Subscription retry policy
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub retries: u32,
    pub retry_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            retries: 4,
            retry_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformerState {
    Created,
    Listing,
    Watching,
}

impl Display for InformerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InformerState::Created => write!(f, "Created"),
            InformerState::Listing => write!(f, "Listing"),
            InformerState::Watching => write!(f, "Watching"),
        }
    }
}

/// Backing services of an informer
#[derive(Clone)]
pub struct InformerDeps {
    pub store: Arc<dyn Store>,
    pub feed: Arc<dyn ChangeFeed>,
    pub tokens: Arc<dyn ResumeTokenStore>,
}

pub struct Informer<K: InformerKey> {
    spec: InformerSpec<K>,
    deps: InformerDeps,
    options: WatchOptions,
    queue: WorkQueue<K>,
    state: Mutex<InformerState>,
    /// Token of the last applied event, used when resubscribing
    last_token: Mutex<Option<String>>,
}

impl<K: InformerKey> Informer<K> {
    pub fn new(spec: InformerSpec<K>, deps: InformerDeps, options: WatchOptions) -> Self {
        Self {
            spec,
            deps,
            options,
            queue: WorkQueue::new(),
            state: Mutex::new(InformerState::Created),
            last_token: Mutex::new(None),
        }
    }

    /// Build the informer and queue every active record
    ///
    /// A listing failure is returned; callers treat it as fatal.
    pub async fn start(
        spec: InformerSpec<K>,
        deps: InformerDeps,
        options: WatchOptions,
    ) -> AppResult<Arc<Self>> {
        let informer = Self::new(spec, deps, options);
        informer.list().await?;
        Ok(Arc::new(informer))
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    /// Watched collection and the key its resume token is stored under
    pub fn watch_position(&self) -> (&'static str, &'static str) {
        (self.spec.collection, self.spec.token_key)
    }

    pub fn state(&self) -> InformerState {
        *self.state.lock()
    }

    fn set_state(&self, state: InformerState) {
        *self.state.lock() = state;
        tracing::debug!(informer = %self.spec.name, state = %state, "Informer state changed");
    }

    /// Handle to the queue this informer feeds
    pub fn queue(&self) -> WorkQueue<K> {
        self.queue.clone()
    }

    /// Next queued id; `None` after shutdown
    pub async fn pop(&self) -> Option<K> {
        self.queue.pop().await
    }

    async fn list(&self) -> AppResult<()> {
        self.set_state(InformerState::Listing);
        let ids = (self.spec.list)(self.deps.store.as_ref()).await.map_err(|e| {
            tracing::error!(informer = %self.spec.name, error = %e, "Initial listing failed");
            e
        })?;
        let count = ids.len();
        for id in ids {
            self.queue.add(id);
        }
        tracing::info!(informer = %self.spec.name, count, "Initial listing queued");
        Ok(())
    }

    /// Tail the change feed until shutdown
    ///
    /// A closed subscription is reopened from the last applied token. Opening
    /// the subscription is retried `options.retries` times; running out of
    /// retries ends the watch with an error.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> AppResult<()> {
        self.set_state(InformerState::Watching);
        let result = loop {
            let mut rx = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                rx = self.subscribe() => match rx {
                    Ok(rx) => rx,
                    Err(e) => break Err(e),
                },
            };

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    event = rx.recv() => event,
                };
                match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                }
            }

            if shutdown.is_cancelled() {
                break Ok(());
            }
            tracing::warn!(informer = %self.spec.name, "Change stream closed, resubscribing");
        };

        self.queue.shutdown();
        match &result {
            Ok(()) => tracing::info!(informer = %self.spec.name, "Informer stopped"),
            Err(e) => tracing::error!(informer = %self.spec.name, error = %e, "Informer watch failed"),
        }
        result
    }

    async fn start_position(&self) -> AppResult<WatchStart> {
        let last = self.last_token.lock().clone();
        if let Some(token) = last {
            return Ok(WatchStart::Token(token));
        }
        get_start_watch_token(
            self.deps.tokens.as_ref(),
            self.deps.feed.as_ref(),
            self.spec.token_key,
            self.spec.collection,
        )
        .await
    }

    async fn subscribe(&self) -> AppResult<mpsc::Receiver<ChangeEvent>> {
        let mut attempt = 0;
        loop {
            let result = match self.start_position().await {
                Ok(start) => {
                    tracing::info!(informer = %self.spec.name, start = ?start, "Opening change stream");
                    self.deps.feed.watch(self.spec.collection, start).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(rx) => return Ok(rx),
                Err(e) if attempt < self.options.retries => {
                    attempt += 1;
                    tracing::warn!(
                        informer = %self.spec.name,
                        attempt,
                        error = %e,
                        "Failed to open change stream, retrying"
                    );
                    tokio::time::sleep(self.options.retry_interval).await;
                }
                Err(e) => {
                    return Err(AppError::with_message(
                        shared::ErrorCode::WatchFailed,
                        format!("{}: {}", self.spec.collection, e.message),
                    ));
                }
            }
        }
    }

    async fn handle_event(&self, event: ChangeEvent) {
        match event.operation {
            OperationType::Insert | OperationType::Update => {
                let id = serde_json::from_slice::<serde_json::Value>(&event.document)
                    .ok()
                    .and_then(|doc| (self.spec.extract)(&doc));
                let Some(id) = id else {
                    tracing::warn!(
                        informer = %self.spec.name,
                        event_id = %event.event_id,
                        "Dropping change event without a valid id"
                    );
                    return;
                };
                tracing::debug!(informer = %self.spec.name, id = %id, op = ?event.operation, "Queued from change event");
                self.queue.add(id);
            }
            OperationType::Delete => {
                // Deletes are accepted and ignored
                tracing::debug!(informer = %self.spec.name, event_id = %event.event_id, "Ignoring delete event");
            }
        }
        self.save_token(&event).await;
    }

    async fn save_token(&self, event: &ChangeEvent) {
        *self.last_token.lock() = Some(event.token.clone());
        let patch = TokenPatch {
            token: Some(event.token.clone()),
            cursor: event.cursor,
            event_id: (!event.event_id.is_empty()).then(|| event.event_id.clone()),
        };
        if let Err(e) = self.deps.tokens.merge_token(self.spec.token_key, &patch).await {
            tracing::warn!(informer = %self.spec.name, error = %e, "Failed to persist resume token");
        }
    }
}
