//! The publisher: bootstraps the remote folder, then drains the chunk
//! channel and uploads every chunk, retrying transient failures.
//!
//! All work happens on the task that awaits [`Publisher::run`]. At most one
//! request is in flight at any time, and chunks are uploaded strictly in the
//! order they were pushed.

use crate::api::{self, ApiContext, ApiError, ListFolderPage, UploadArg};
use crate::channel::{ChannelError, ChunkReceiver};
use crate::chunk::Chunk;
use crate::remote::{RemoteFile, RemoteFileError, RemoteFileSet};
use crate::retry::{self, RetryPolicy, RetryTimer};
use crate::state::{PublisherState, StateMachine, TransitionError};
use crate::transport::{ApiRequest, ApiResponse, Endpoint, Transport, TransportError};
use backoff::backoff::Backoff;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Why a single request attempt did not produce a usable result.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Fatal publisher errors. Any of these ends [`Publisher::run`] in
/// [`PublisherState::Failed`].
#[derive(Debug, Error)]
pub enum PublisherError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Chunk channel failed: {0}")]
    Channel(#[from] ChannelError),

    #[error("Bootstrap {operation} returned an unusable response: {source}")]
    BootstrapProtocol {
        operation: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("Bootstrap {operation} failed after {attempts} attempts: {source}")]
    BootstrapUnreachable {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    #[error("Upload of {path} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        path: String,
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    #[error("Remote file bookkeeping failed: {0}")]
    RemoteFiles(#[from] RemoteFileError),

    #[error("Failed to encode request: {0}")]
    Encode(#[source] ApiError),

    #[error("No chunk name left after remote timestamp {last}")]
    NamesExhausted { last: u64 },
}

/// Signals raised to the embedding controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherEvent {
    StateChanged {
        from: PublisherState,
        to: PublisherState,
    },
    /// Bootstrap is complete; the producer may start.
    Ready { files: usize, total_bytes: u64 },
    ChunkUploaded {
        path: String,
        size: u64,
        attempts: u32,
    },
    /// Advisory only: the transport reported a dropped connection.
    ConnectionLost(Endpoint),
    /// The final chunk has been uploaded; the producer can be joined.
    LastSent,
}

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub api: ApiContext,
    /// Dedicated remote folder, e.g. `/_seccam_`.
    pub app_folder: String,
    pub retry: RetryPolicy,
    /// Total tries for each bootstrap call, at least 1.
    pub bootstrap_max_attempts: u32,
    pub bootstrap_base_delay: Duration,
    pub bootstrap_max_delay: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct PublisherStats {
    pub chunks_uploaded: u64,
    pub bytes_uploaded: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    pub empty_chunks_skipped: u64,
}

/// Hands out remote chunk names: decimal unix timestamps, strictly
/// increasing even when two chunks finish within the same second.
#[derive(Debug, Default, Clone)]
pub struct ChunkNamer {
    last: u64,
}

impl ChunkNamer {
    /// Start after `last`, usually the newest timestamp already stored.
    pub fn new(last: u64) -> Self {
        Self { last }
    }

    /// `None` once the newest name is `u64::MAX`; no later name exists.
    pub fn next(&mut self, now_secs: u64) -> Option<u64> {
        let timestamp = now_secs.max(self.last.checked_add(1)?);
        self.last = timestamp;
        Some(timestamp)
    }
}

fn wall_clock_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// A chunk on its way up, with the upload argument fixed for every attempt.
struct PendingUpload {
    arg: UploadArg,
    chunk: Chunk,
}

pub struct Publisher<T, R> {
    settings: PublisherSettings,
    app_folder_lower: String,
    api: T,
    content: T,
    chunks: R,
    pending: VecDeque<Chunk>,
    files: RemoteFileSet,
    machine: StateMachine,
    namer: ChunkNamer,
    timer: RetryTimer,
    events: mpsc::UnboundedSender<PublisherEvent>,
    last_popped_final: bool,
    stats: PublisherStats,
}

impl<T: Transport, R: ChunkReceiver> Publisher<T, R> {
    pub fn new(
        settings: PublisherSettings,
        api: T,
        content: T,
        chunks: R,
        events: mpsc::UnboundedSender<PublisherEvent>,
    ) -> Self {
        let app_folder_lower = settings.app_folder.to_lowercase();
        Self {
            settings,
            app_folder_lower,
            api,
            content,
            chunks,
            pending: VecDeque::new(),
            files: RemoteFileSet::new(),
            machine: StateMachine::new(),
            namer: ChunkNamer::default(),
            timer: RetryTimer::new(),
            events,
            last_popped_final: false,
            stats: PublisherStats::default(),
        }
    }

    pub fn state(&self) -> PublisherState {
        self.machine.state()
    }

    pub fn remote_files(&self) -> &RemoteFileSet {
        &self.files
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }

    /// Run until the final chunk is uploaded or a fatal error occurs.
    pub async fn run(&mut self) -> Result<(), PublisherError> {
        let result = match self.bootstrap().await {
            Ok(()) => self.upload_loop().await,
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            error!(state = %self.state(), error = %e, "Publisher stopped on fatal error");
            if let Some(previous) = self.machine.fail() {
                self.emit(PublisherEvent::StateChanged {
                    from: previous,
                    to: PublisherState::Failed,
                });
            }
        }
        result
    }

    fn transition(
        &mut self,
        expected: PublisherState,
        next: PublisherState,
    ) -> Result<(), PublisherError> {
        self.machine.transition(expected, next)?;
        debug!(from = %expected, to = %next, "Publisher state changed");
        self.emit(PublisherEvent::StateChanged {
            from: expected,
            to: next,
        });
        Ok(())
    }

    fn emit(&self, event: PublisherEvent) {
        // the controller may already be gone during shutdown
        let _ = self.events.send(event);
    }

    fn note_connection_loss(&self, error: &TransportError) {
        if let Some(endpoint) = error.lost_connection() {
            warn!(endpoint = %endpoint, "Connection lost");
            self.emit(PublisherEvent::ConnectionLost(endpoint));
        }
    }

    async fn bootstrap(&mut self) -> Result<(), PublisherError> {
        use PublisherState::*;

        self.transition(Initializing, ListingRootFolder)?;
        let mut request = self
            .settings
            .api
            .list_folder("")
            .map_err(PublisherError::Encode)?;

        loop {
            let page: ListFolderPage = self.bootstrap_call("list_root_folder", request).await?;

            if page.contains_folder(&self.app_folder_lower) {
                info!(folder = %self.settings.app_folder, "App folder found");
                self.transition(ListingRootFolder, ListingAppFolder)?;
                return self.enumerate_app_folder().await;
            }

            let cursor = page
                .next_cursor()
                .map_err(|source| PublisherError::BootstrapProtocol {
                    operation: "list_root_folder",
                    source,
                })?;
            match cursor {
                Some(cursor) => {
                    self.transition(ListingRootFolder, ListingRootFolder)?;
                    request = self
                        .settings
                        .api
                        .list_folder_continue(cursor)
                        .map_err(PublisherError::Encode)?;
                }
                None => break,
            }
        }

        info!(folder = %self.settings.app_folder, "App folder not found, creating it");
        self.transition(ListingRootFolder, CreatingAppFolder)?;

        let request = self
            .settings
            .api
            .create_folder(&self.settings.app_folder)
            .map_err(PublisherError::Encode)?;
        let response = self.bootstrap_exchange("create_folder", request).await?;
        api::created_folder(&response, &self.app_folder_lower).map_err(|source| {
            error!(body = %response.body_text(), error = %source, "Malformed folder creation response");
            PublisherError::BootstrapProtocol {
                operation: "create_folder",
                source,
            }
        })?;

        // a folder that was just created has nothing to enumerate
        self.transition(CreatingAppFolder, ListingAppFolder)?;
        self.enumeration_complete(ListingAppFolder)
    }

    async fn enumerate_app_folder(&mut self) -> Result<(), PublisherError> {
        use PublisherState::*;

        let mut state = ListingAppFolder;
        let mut request = self
            .settings
            .api
            .list_folder(&self.settings.app_folder)
            .map_err(PublisherError::Encode)?;

        loop {
            let page: ListFolderPage = self.bootstrap_call("list_app_folder", request).await?;
            for file in page.files() {
                self.files.insert(file)?;
            }

            let cursor = page
                .next_cursor()
                .map_err(|source| PublisherError::BootstrapProtocol {
                    operation: "list_app_folder",
                    source,
                })?;
            match cursor {
                Some(cursor) => {
                    self.transition(state, ListingAppFolderContinue)?;
                    state = ListingAppFolderContinue;
                    request = self
                        .settings
                        .api
                        .list_folder_continue(cursor)
                        .map_err(PublisherError::Encode)?;
                }
                None => return self.enumeration_complete(state),
            }
        }
    }

    fn enumeration_complete(&mut self, from: PublisherState) -> Result<(), PublisherError> {
        self.transition(from, PublisherState::Idle)?;
        self.namer = ChunkNamer::new(self.files.latest_timestamp().unwrap_or(0));

        let total_bytes = self.files.total_bytes();
        metrics::gauge!("publisher.remote.total_bytes").set(total_bytes as f64);
        info!(
            files = self.files.len(),
            total_bytes = total_bytes,
            "Remote enumeration complete, publisher ready"
        );
        self.emit(PublisherEvent::Ready {
            files: self.files.len(),
            total_bytes,
        });
        Ok(())
    }

    /// Issue a bootstrap request, retrying transport failures and non-200
    /// responses with exponential backoff.
    async fn bootstrap_exchange(
        &mut self,
        operation: &'static str,
        request: ApiRequest,
    ) -> Result<ApiResponse, PublisherError> {
        let mut backoff = retry::bootstrap_backoff(
            self.settings.bootstrap_base_delay,
            self.settings.bootstrap_max_delay,
        );
        let max_attempts = self.settings.bootstrap_max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let failure: AttemptError = match self.api.request(request.clone()).await {
                Ok(response) if response.status == 200 => return Ok(response),
                Ok(response) => {
                    error!(
                        operation = operation,
                        method = %request.method,
                        path = %request.path,
                        status = response.status,
                        body = %response.body_text(),
                        "Bootstrap request rejected"
                    );
                    ApiError::Status {
                        status: response.status,
                        body: response.body_text(),
                    }
                    .into()
                }
                Err(e) => {
                    self.note_connection_loss(&e);
                    error!(
                        operation = operation,
                        method = %request.method,
                        path = %request.path,
                        error = %e,
                        "Bootstrap request failed"
                    );
                    e.into()
                }
            };

            if attempts >= max_attempts {
                return Err(PublisherError::BootstrapUnreachable {
                    operation,
                    attempts,
                    source: failure,
                });
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.settings.bootstrap_max_delay);
            warn!(
                operation = operation,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying bootstrap request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn bootstrap_call<D: DeserializeOwned>(
        &mut self,
        operation: &'static str,
        request: ApiRequest,
    ) -> Result<D, PublisherError> {
        let response = self.bootstrap_exchange(operation, request).await?;
        api::decode(&response).map_err(|source| {
            error!(
                operation = operation,
                body = %response.body_text(),
                error = %source,
                "Malformed bootstrap response"
            );
            PublisherError::BootstrapProtocol { operation, source }
        })
    }

    async fn upload_loop(&mut self) -> Result<(), PublisherError> {
        use PublisherState::*;

        loop {
            self.transition(Idle, PoppingSegment)?;
            if self.pending.is_empty() {
                self.chunks.try_drain_into(&mut self.pending)?;
            }

            match self.pending.pop_front() {
                Some(chunk) => {
                    self.last_popped_final = chunk.is_final();
                    if chunk.is_empty() {
                        info!(is_final = chunk.is_final(), "Skipping empty chunk");
                        self.stats.empty_chunks_skipped += 1;
                        self.transition(PoppingSegment, Idle)?;
                        continue;
                    }
                    self.transition(PoppingSegment, SendingSegment)?;
                    self.send_segment(chunk).await?;
                }
                None if self.last_popped_final => {
                    self.transition(PoppingSegment, TerminatingVideo)?;
                    info!(
                        chunks_uploaded = self.stats.chunks_uploaded,
                        "Last chunk sent"
                    );
                    self.emit(PublisherEvent::LastSent);
                    return Ok(());
                }
                None => {
                    self.transition(PoppingSegment, Idle)?;
                    if self.chunks.drain_into(&mut self.pending).await? == 0 {
                        warn!("Chunk producer went away without a final chunk");
                        self.last_popped_final = true;
                    }
                }
            }
        }
    }

    #[instrument(skip(self, chunk), fields(size_bytes = chunk.len()))]
    async fn send_segment(&mut self, chunk: Chunk) -> Result<(), PublisherError> {
        use PublisherState::*;

        let timestamp = self
            .namer
            .next(wall_clock_secs())
            .ok_or(PublisherError::NamesExhausted {
                last: self.files.latest_timestamp().unwrap_or(u64::MAX),
            })?;
        let upload = PendingUpload {
            arg: UploadArg {
                path: format!("{}/{}", self.settings.app_folder, timestamp),
            },
            chunk,
        };

        let mut backoff = self.settings.retry.backoff();
        let mut state = SendingSegment;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.attempt_upload(&upload).await {
                Ok(file) => {
                    self.record_upload(file, &upload, attempts)?;
                    self.transition(state, Idle)?;
                    return Ok(());
                }
                Err(failure) => {
                    self.stats.failed_attempts += 1;
                    metrics::counter!("publisher.upload.failures").increment(1);

                    let Some(delay) = backoff.next_backoff() else {
                        error!(
                            path = %upload.arg.path,
                            attempts = attempts,
                            error = %failure,
                            "Upload retries exhausted"
                        );
                        return Err(PublisherError::RetriesExhausted {
                            path: upload.arg.path.clone(),
                            attempts,
                            source: failure,
                        });
                    };

                    warn!(
                        path = %upload.arg.path,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Upload failed, retrying"
                    );
                    self.transition(state, SendingSegmentRetryTimer)?;
                    self.timer.schedule(delay);
                    self.timer.expired().await;

                    self.stats.retries += 1;
                    metrics::counter!("publisher.upload.retries").increment(1);
                    self.transition(SendingSegmentRetryTimer, SendingSegmentRetry)?;
                    state = SendingSegmentRetry;
                }
            }
        }
    }

    async fn attempt_upload(&self, upload: &PendingUpload) -> Result<RemoteFile, AttemptError> {
        let request = self
            .settings
            .api
            .upload(&upload.arg, upload.chunk.data().clone())?;
        let method = request.method.clone();

        let response = match self.content.request(request).await {
            Ok(response) => response,
            Err(e) => {
                self.note_connection_loss(&e);
                error!(
                    method = %method,
                    path = api::UPLOAD_PATH,
                    target = %upload.arg.path,
                    error = %e,
                    "Upload request failed"
                );
                return Err(e.into());
            }
        };

        api::uploaded_file(&response).map_err(|e| {
            error!(
                method = %method,
                path = api::UPLOAD_PATH,
                target = %upload.arg.path,
                status = response.status,
                body = %response.body_text(),
                error = %e,
                "Upload response rejected"
            );
            e.into()
        })
    }

    fn record_upload(
        &mut self,
        file: RemoteFile,
        upload: &PendingUpload,
        attempts: u32,
    ) -> Result<(), PublisherError> {
        let size = file.size;
        if size != upload.chunk.len() as u64 {
            warn!(
                path = %file.remote_path,
                reported = size,
                sent = upload.chunk.len(),
                "Remote size differs from chunk size"
            );
        }
        let path = file.remote_path.clone();
        self.files.insert(file)?;

        self.stats.chunks_uploaded += 1;
        self.stats.bytes_uploaded += size;
        metrics::counter!("publisher.chunks.uploaded").increment(1);
        metrics::counter!("publisher.bytes.uploaded").increment(size);
        metrics::gauge!("publisher.remote.total_bytes").set(self.files.total_bytes() as f64);

        info!(
            path = %path,
            size_bytes = size,
            attempts = attempts,
            total_bytes = self.files.total_bytes(),
            "Chunk uploaded"
        );
        self.emit(PublisherEvent::ChunkUploaded {
            path,
            size,
            attempts,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{API_ARG_HEADER, CREATE_FOLDER_PATH, LIST_FOLDER_CONTINUE_PATH, LIST_FOLDER_PATH};
    use crate::channel::queue::{self, QueueReceiver, QueueSender};
    use crate::channel::ChunkSink;
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;
    use PublisherState::*;

    enum Reply {
        Respond(Result<ApiResponse, TransportError>),
        /// Accept an upload and describe the stored file.
        EchoUpload,
    }

    #[derive(Debug, Clone)]
    struct Recorded {
        at: Instant,
        path: String,
        api_arg: Option<String>,
        body: Vec<u8>,
    }

    #[derive(Default)]
    struct FakeState {
        replies: VecDeque<Reply>,
        requests: Vec<Recorded>,
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeTransport {
        fn respond(&self, status: u16, body: Value) -> &Self {
            self.state
                .lock()
                .replies
                .push_back(Reply::Respond(Ok(ApiResponse::new(status, body.to_string()))));
            self
        }

        fn fail(&self, error: TransportError) -> &Self {
            self.state.lock().replies.push_back(Reply::Respond(Err(error)));
            self
        }

        fn echo_uploads(&self, count: usize) -> &Self {
            let mut state = self.state.lock();
            for _ in 0..count {
                state.replies.push_back(Reply::EchoUpload);
            }
            self
        }

        fn requests(&self) -> Vec<Recorded> {
            self.state.lock().requests.clone()
        }
    }

    fn echo(request: &ApiRequest) -> ApiResponse {
        let arg: UploadArg = request
            .header(API_ARG_HEADER)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .expect("upload without Dropbox-API-Arg");
        let name = arg.path.rsplit('/').next().unwrap_or_default().to_string();
        ApiResponse::new(
            200,
            json!({
                "name": name,
                "client_modified": "2024-01-15T10:30:45Z",
                "path_lower": arg.path.to_lowercase(),
                "size": request.body.len(),
            })
            .to_string(),
        )
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn request(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
            let mut state = self.state.lock();
            state.requests.push(Recorded {
                at: Instant::now(),
                path: request.path.clone(),
                api_arg: request.header(API_ARG_HEADER).map(str::to_string),
                body: request.body.as_bytes().to_vec(),
            });
            match state.replies.pop_front() {
                Some(Reply::Respond(result)) => result,
                Some(Reply::EchoUpload) => Ok(echo(&request)),
                None => Err(TransportError::Request {
                    endpoint: Endpoint::Api,
                    message: "no scripted reply".to_string(),
                }),
            }
        }
    }

    fn settings(max_retries: u32) -> PublisherSettings {
        PublisherSettings {
            api: ApiContext {
                access_token: "secret".to_string(),
                api_host: "api.dropboxapi.com".to_string(),
                content_host: "content.dropboxapi.com".to_string(),
            },
            app_folder: "/_seccam_".to_string(),
            retry: RetryPolicy {
                initial_delay: Duration::from_secs(2),
                max_retries,
            },
            bootstrap_max_attempts: 3,
            bootstrap_base_delay: Duration::from_millis(100),
            bootstrap_max_delay: Duration::from_secs(1),
        }
    }

    fn root_with_app_folder() -> Value {
        json!({
            "entries": [
                {".tag": "folder", "path_lower": "/photos"},
                {".tag": "folder", "path_lower": "/_seccam_"}
            ],
            "has_more": false
        })
    }

    fn empty_listing() -> Value {
        json!({"entries": [], "has_more": false})
    }

    fn file_entry(timestamp: u64, size: u64) -> Value {
        json!({
            ".tag": "file",
            "name": timestamp.to_string(),
            "path_lower": format!("/_seccam_/{timestamp}"),
            "size": size,
            "client_modified": "2024-01-15T10:30:45Z"
        })
    }

    struct Harness {
        publisher: Publisher<FakeTransport, QueueReceiver>,
        api: FakeTransport,
        content: FakeTransport,
        sender: QueueSender,
        events: mpsc::UnboundedReceiver<PublisherEvent>,
    }

    fn harness(max_retries: u32) -> Harness {
        let api = FakeTransport::default();
        let content = FakeTransport::default();
        let (sender, receiver) = queue::channel(16);
        let (events_tx, events) = mpsc::unbounded_channel();
        let publisher = Publisher::new(
            settings(max_retries),
            api.clone(),
            content.clone(),
            receiver,
            events_tx,
        );
        Harness {
            publisher,
            api,
            content,
            sender,
            events,
        }
    }

    fn drain_events(events: &mut mpsc::UnboundedReceiver<PublisherEvent>) -> Vec<PublisherEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[PublisherEvent]) -> Vec<PublisherState> {
        events
            .iter()
            .filter_map(|event| match event {
                PublisherEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn chunk(seq: u32, is_final: bool) -> Chunk {
        Chunk::new(seq.to_be_bytes().repeat(8), is_final)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_creates_app_folder() {
        let mut h = harness(5);
        h.api
            .respond(200, empty_listing())
            .respond(200, json!({"metadata": {"path_lower": "/_seccam_", "name": "_seccam_"}}));
        h.content.echo_uploads(1);
        h.sender.push(chunk(1, true)).unwrap();

        h.publisher.run().await.unwrap();

        let events = drain_events(&mut h.events);
        assert!(events.contains(&PublisherEvent::Ready {
            files: 0,
            total_bytes: 0
        }));
        assert_eq!(
            &states(&events)[..4],
            &[ListingRootFolder, CreatingAppFolder, ListingAppFolder, Idle]
        );

        let api_paths: Vec<String> = h.api.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(api_paths, vec![LIST_FOLDER_PATH, CREATE_FOLDER_PATH]);
        assert_eq!(
            h.api.requests()[1].body,
            br#"{"path":"/_seccam_","autorename":false}"#.to_vec()
        );
        assert_eq!(h.publisher.state(), TerminatingVideo);
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_listing_follows_cursor() {
        let mut h = harness(5);
        h.api
            .respond(
                200,
                json!({
                    "entries": [{".tag": "folder", "path_lower": "/other"}],
                    "has_more": true,
                    "cursor": "page-2"
                }),
            )
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        drop(h.sender);

        h.publisher.run().await.unwrap();

        let requests = h.api.requests();
        assert_eq!(requests[0].path, LIST_FOLDER_PATH);
        assert_eq!(requests[1].path, LIST_FOLDER_CONTINUE_PATH);
        assert_eq!(requests[1].body, br#"{"cursor":"page-2"}"#.to_vec());
        assert_eq!(requests[2].path, LIST_FOLDER_PATH);
        assert!(String::from_utf8_lossy(&requests[2].body).contains(r#""path":"/_seccam_""#));

        let events = drain_events(&mut h.events);
        assert_eq!(
            &states(&events)[..4],
            &[ListingRootFolder, ListingRootFolder, ListingAppFolder, Idle]
        );
    }

    async fn enumerate(pages: Vec<Value>) -> (Vec<(u64, u64)>, u64) {
        let mut h = harness(5);
        h.api.respond(200, root_with_app_folder());
        for page in pages {
            h.api.respond(200, page);
        }
        drop(h.sender);

        h.publisher.run().await.unwrap();

        let files = h.publisher.remote_files();
        let listed = files.iter().map(|f| (f.upload_timestamp, f.size)).collect();
        (listed, files.total_bytes())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pagination_does_not_change_enumeration() {
        let entries = vec![
            file_entry(1700000001, 100),
            file_entry(1700000002, 250),
            file_entry(1700000003, 75),
        ];

        let single = vec![json!({"entries": entries, "has_more": false})];
        let paged = vec![
            json!({"entries": [entries[0]], "has_more": true, "cursor": "c1"}),
            json!({"entries": [entries[1]], "has_more": true, "cursor": "c2"}),
            json!({"entries": [entries[2]], "has_more": false}),
        ];

        let (single_files, single_total) = enumerate(single).await;
        let (paged_files, paged_total) = enumerate(paged).await;

        assert_eq!(single_files, paged_files);
        assert_eq!(single_total, 425);
        assert_eq!(paged_total, 425);
    }

    #[tokio::test(start_paused = true)]
    async fn test_app_folder_pages_walk_continue_state() {
        let mut h = harness(5);
        h.api
            .respond(200, root_with_app_folder())
            .respond(
                200,
                json!({"entries": [file_entry(10, 1)], "has_more": true, "cursor": "c1"}),
            )
            .respond(
                200,
                json!({"entries": [file_entry(11, 1)], "has_more": true, "cursor": "c2"}),
            )
            .respond(200, json!({"entries": [], "has_more": false}));
        drop(h.sender);

        h.publisher.run().await.unwrap();

        let events = drain_events(&mut h.events);
        assert_eq!(
            &states(&events)[..5],
            &[
                ListingRootFolder,
                ListingAppFolder,
                ListingAppFolderContinue,
                ListingAppFolderContinue,
                Idle
            ]
        );
        assert!(events.contains(&PublisherEvent::Ready {
            files: 2,
            total_bytes: 2
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploads_follow_push_order() {
        let mut h = harness(5);
        h.api
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        h.content.echo_uploads(10);
        for seq in 0..10 {
            h.sender.push(chunk(seq, seq == 9)).unwrap();
        }

        h.publisher.run().await.unwrap();

        let bodies: Vec<Vec<u8>> = h.content.requests().into_iter().map(|r| r.body).collect();
        let expected: Vec<Vec<u8>> = (0..10).map(|seq| chunk(seq, false).data().to_vec()).collect();
        assert_eq!(bodies, expected);

        // remote names are strictly increasing
        let stamps: Vec<u64> = h
            .publisher
            .remote_files()
            .iter()
            .map(|f| f.upload_timestamp)
            .collect();
        assert_eq!(stamps.len(), 10);
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(h.publisher.stats().chunks_uploaded, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_adds_exactly_chunk_size() {
        let mut h = harness(5);
        h.api.respond(200, root_with_app_folder()).respond(
            200,
            json!({"entries": [file_entry(1000, 500)], "has_more": false}),
        );
        h.content.echo_uploads(1);
        let payload = chunk(7, true);
        let size = payload.len() as u64;
        h.sender.push(payload).unwrap();

        h.publisher.run().await.unwrap();

        let files = h.publisher.remote_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files.total_bytes(), 500 + size);
        assert_eq!(
            files.total_bytes(),
            files.iter().map(|f| f.size).sum::<u64>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success() {
        let mut h = harness(5);
        h.api
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        h.content
            .respond(503, json!({"error": "busy"}))
            .fail(TransportError::Timeout {
                endpoint: Endpoint::Content,
            })
            .echo_uploads(1);
        let payload = chunk(3, true);
        let size = payload.len() as u64;
        h.sender.push(payload).unwrap();

        h.publisher.run().await.unwrap();

        let events = drain_events(&mut h.events);
        let seen = states(&events);
        let start = seen.iter().position(|s| *s == SendingSegment).unwrap();
        assert_eq!(
            &seen[start..start + 6],
            &[
                SendingSegment,
                SendingSegmentRetryTimer,
                SendingSegmentRetry,
                SendingSegmentRetryTimer,
                SendingSegmentRetry,
                Idle
            ]
        );

        // every attempt targets the same remote name
        let uploads = h.content.requests();
        assert_eq!(uploads.len(), 3);
        assert!(uploads.iter().all(|r| r.api_arg == uploads[0].api_arg));

        // retry n waits initial * (1 + n)
        assert!(uploads[1].at - uploads[0].at >= Duration::from_secs(4));
        assert!(uploads[2].at - uploads[1].at >= Duration::from_secs(6));

        assert_eq!(h.publisher.remote_files().total_bytes(), size);
        assert_eq!(h.publisher.stats().retries, 2);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, PublisherEvent::ChunkUploaded { .. }))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_upload_response_is_retried() {
        let mut h = harness(5);
        h.api
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        h.content
            .respond(200, json!({"name": "x"}))
            .echo_uploads(1);
        h.sender.push(chunk(1, true)).unwrap();

        h.publisher.run().await.unwrap();

        assert_eq!(h.content.requests().len(), 2);
        assert_eq!(h.publisher.remote_files().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_fatal() {
        let mut h = harness(3);
        h.api
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        for _ in 0..3 {
            h.content.respond(500, json!({"error": "internal"}));
        }
        h.content.echo_uploads(1);
        h.sender.push(chunk(1, false)).unwrap();
        h.sender.push(chunk(2, true)).unwrap();

        let err = h.publisher.run().await.unwrap_err();

        assert!(matches!(
            err,
            PublisherError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(h.publisher.state(), Failed);
        // no further request for this chunk or the next one
        assert_eq!(h.content.requests().len(), 3);
        assert!(h.publisher.remote_files().is_empty());

        let events = drain_events(&mut h.events);
        assert!(!events.contains(&PublisherEvent::LastSent));
        assert_eq!(states(&events).last(), Some(&Failed));
    }

    struct Tracked {
        data: Vec<u8>,
        released: Arc<AtomicUsize>,
    }

    impl AsRef<[u8]> for Tracked {
        fn as_ref(&self) -> &[u8] {
            &self.data
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_buffer_released_once_across_retries() {
        let mut h = harness(5);
        h.api
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        h.content
            .fail(TransportError::ConnectionLost {
                endpoint: Endpoint::Content,
                message: "reset by peer".to_string(),
            })
            .respond(502, json!({}))
            .respond(200, json!("not an object"))
            .echo_uploads(1);

        let released = Arc::new(AtomicUsize::new(0));
        let data = Bytes::from_owner(Tracked {
            data: vec![42u8; 256],
            released: released.clone(),
        });
        h.sender.push(Chunk::new(data, true)).unwrap();

        h.publisher.run().await.unwrap();

        assert_eq!(h.content.requests().len(), 4);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_chunk_ends_with_single_last_sent() {
        let mut h = harness(5);
        h.api
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        h.content.echo_uploads(3);
        h.sender.push(chunk(1, false)).unwrap();
        h.sender.push(chunk(2, false)).unwrap();
        h.sender.push(chunk(3, true)).unwrap();

        h.publisher.run().await.unwrap();

        let events = drain_events(&mut h.events);
        let last_sent: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| **e == PublisherEvent::LastSent)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(last_sent.len(), 1);
        assert!(!states(&events[last_sent[0]..]).contains(&PoppingSegment));
        assert_eq!(states(&events).last(), Some(&TerminatingVideo));
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_gone_without_final_terminates() {
        let mut h = harness(5);
        h.api
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        h.content.echo_uploads(1);
        h.sender.push(chunk(1, false)).unwrap();
        drop(h.sender);

        h.publisher.run().await.unwrap();

        assert_eq!(h.publisher.remote_files().len(), 1);
        assert!(drain_events(&mut h.events).contains(&PublisherEvent::LastSent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_final_chunk_is_not_uploaded() {
        let mut h = harness(5);
        h.api
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        h.content.echo_uploads(1);
        h.sender.push(chunk(1, false)).unwrap();
        h.sender.push(Chunk::new(Vec::new(), true)).unwrap();

        h.publisher.run().await.unwrap();

        assert_eq!(h.content.requests().len(), 1);
        assert_eq!(h.publisher.stats().empty_chunks_skipped, 1);
        assert_eq!(h.publisher.state(), TerminatingVideo);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_is_reported() {
        let mut h = harness(5);
        h.api
            .respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        h.content
            .fail(TransportError::ConnectionLost {
                endpoint: Endpoint::Content,
                message: "closed".to_string(),
            })
            .echo_uploads(1);
        h.sender.push(chunk(1, true)).unwrap();

        h.publisher.run().await.unwrap();

        let events = drain_events(&mut h.events);
        assert!(events.contains(&PublisherEvent::ConnectionLost(Endpoint::Content)));
        assert_eq!(h.publisher.remote_files().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_names_continue_after_existing_files() {
        let far_future = wall_clock_secs() + 10_000;
        let mut h = harness(5);
        h.api.respond(200, root_with_app_folder()).respond(
            200,
            json!({"entries": [file_entry(far_future, 1)], "has_more": false}),
        );
        h.content.echo_uploads(1);
        h.sender.push(chunk(1, true)).unwrap();

        h.publisher.run().await.unwrap();

        let expected = format!(r#"{{"path":"/_seccam_/{}"}}"#, far_future + 1);
        assert_eq!(h.content.requests()[0].api_arg.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn test_namer_is_monotonic_within_a_second() {
        let mut namer = ChunkNamer::new(0);
        assert_eq!(namer.next(1700000000), Some(1700000000));
        assert_eq!(namer.next(1700000000), Some(1700000001));
        assert_eq!(namer.next(1700000000), Some(1700000002));
        assert_eq!(namer.next(1700000010), Some(1700000010));
        assert_eq!(namer.next(1699999999), Some(1700000011));
    }

    #[test]
    fn test_namer_refuses_to_wrap() {
        let mut namer = ChunkNamer::new(u64::MAX - 1);
        assert_eq!(namer.next(0), Some(u64::MAX));
        assert_eq!(namer.next(0), None);
        assert_eq!(namer.next(u64::MAX), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newest_remote_name_at_limit_fails_upload() {
        let mut h = harness(5);
        h.api.respond(200, root_with_app_folder()).respond(
            200,
            json!({"entries": [file_entry(u64::MAX, 1)], "has_more": false}),
        );
        h.content.echo_uploads(1);
        h.sender.push(chunk(1, true)).unwrap();

        let err = h.publisher.run().await.unwrap_err();

        assert!(matches!(
            err,
            PublisherError::NamesExhausted { last: u64::MAX }
        ));
        assert_eq!(h.publisher.state(), Failed);
        assert!(h.content.requests().is_empty());
    }

    fn mock_publisher(api: MockTransport) -> (Publisher<MockTransport, QueueReceiver>, QueueSender) {
        let (sender, receiver) = queue::channel(16);
        let (events_tx, _) = mpsc::unbounded_channel();
        let publisher = Publisher::new(settings(5), api, MockTransport::new(), receiver, events_tx);
        (publisher, sender)
    }

    #[tokio::test]
    async fn test_malformed_bootstrap_response_stops() {
        let mut api = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        api.expect_request()
            .withf(|r| r.path == LIST_FOLDER_PATH)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::new(200, empty_listing().to_string())));
        api.expect_request()
            .withf(|r| r.path == CREATE_FOLDER_PATH)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::new(200, "<html>oops</html>")));

        let (mut publisher, _sender) = mock_publisher(api);
        let err = publisher.run().await.unwrap_err();

        assert!(matches!(
            err,
            PublisherError::BootstrapProtocol {
                operation: "create_folder",
                ..
            }
        ));
        assert_eq!(publisher.state(), Failed);
    }

    #[tokio::test]
    async fn test_has_more_without_cursor_stops() {
        let mut api = MockTransport::new();
        api.expect_request().times(1).returning(|_| {
            Ok(ApiResponse::new(
                200,
                json!({"entries": [], "has_more": true}).to_string(),
            ))
        });

        let (mut publisher, _sender) = mock_publisher(api);
        let err = publisher.run().await.unwrap_err();

        assert!(matches!(
            err,
            PublisherError::BootstrapProtocol {
                source: ApiError::MissingCursor,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_bootstrap_gives_up_loudly() {
        let mut api = MockTransport::new();
        api.expect_request()
            .withf(|r| r.path == LIST_FOLDER_PATH)
            .times(3)
            .returning(|_| Ok(ApiResponse::new(503, "unavailable")));

        let (mut publisher, _sender) = mock_publisher(api);
        let err = publisher.run().await.unwrap_err();

        assert!(matches!(
            err,
            PublisherError::BootstrapUnreachable {
                operation: "list_root_folder",
                attempts: 3,
                ..
            }
        ));
        assert_eq!(publisher.state(), Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_bootstrap_failure_recovers() {
        let mut api = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        api.expect_request()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(TransportError::ConnectionLost {
                    endpoint: Endpoint::Api,
                    message: "dns".to_string(),
                })
            });
        api.expect_request()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::new(200, root_with_app_folder().to_string())));
        api.expect_request()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApiResponse::new(200, empty_listing().to_string())));

        let (mut publisher, sender) = mock_publisher(api);
        drop(sender);
        publisher.run().await.unwrap();

        assert_eq!(publisher.state(), TerminatingVideo);
    }

    struct CorruptReceiver;

    #[async_trait]
    impl ChunkReceiver for CorruptReceiver {
        async fn drain_into(&mut self, _out: &mut VecDeque<Chunk>) -> Result<usize, ChannelError> {
            Err(ChannelError::ShortToken(3))
        }

        fn try_drain_into(&mut self, _out: &mut VecDeque<Chunk>) -> Result<usize, ChannelError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_corrupt_channel_is_fatal() {
        let api = FakeTransport::default();
        api.respond(200, root_with_app_folder())
            .respond(200, empty_listing());
        let (events_tx, _events) = mpsc::unbounded_channel();
        let mut publisher = Publisher::new(
            settings(5),
            api,
            FakeTransport::default(),
            CorruptReceiver,
            events_tx,
        );

        let err = publisher.run().await.unwrap_err();
        assert!(matches!(
            err,
            PublisherError::Channel(ChannelError::ShortToken(3))
        ));
        assert_eq!(publisher.state(), Failed);
    }
}
