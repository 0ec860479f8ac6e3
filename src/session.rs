use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::Client;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::{self, ChatCompletionError, CompletionApi, HttpCompletionApi};
use crate::realtime;
use crate::recorder::{RecorderError, RecordingBlob};
use crate::reveal;
use crate::settings::ClientConfig;
use crate::trace;
use crate::transcript::{Attachment, Message, MessageId, MessageStatus, Sender, Transcript};
use crate::upload::{
    HttpUploadCoordinator, ProgressFn, RemoteFileRef, UploadApi, UploadError, UploadRequest,
};

const VOICE_MESSAGE_BODY: &str = "Voice message";

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// Typed events applied by the single transition function. User submissions
// apply theirs synchronously; every async source (upload task, completion
// task, reveal ticker, realtime reader) posts onto one queue instead of
// mutating the transcript from its own callback.
#[derive(Debug)]
pub enum SessionEvent {
    UploadProgress {
        correlation_id: String,
        percent: u8,
    },
    UploadFinished {
        correlation_id: String,
        result: Result<RemoteFileRef, UploadError>,
    },
    CompletionFinished {
        message_id: MessageId,
        result: Result<String, ChatCompletionError>,
    },
    RevealStep {
        message_id: MessageId,
        body: String,
    },
    RevealCompleted {
        message_id: MessageId,
    },
    TranscriptionReceived {
        text: String,
        correlation_id: Option<String>,
    },
    RecorderFailed {
        code: String,
        message: String,
    },
}

// A file handed over by the embedding UI: picked from the native file dialog
// or assembled from a finished recording. `preview_url` is the local object
// URL the UI created, if any.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Audio,
    Other,
}

#[derive(Debug)]
struct PendingUpload {
    message_id: MessageId,
    kind: PendingKind,
    file_name: String,
    has_preview: bool,
}

struct SessionInner {
    session_id: String,
    config: ClientConfig,
    data_dir: PathBuf,
    transcript: Mutex<Transcript>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    tx: UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
    completion: Arc<dyn CompletionApi>,
    uploader: Arc<dyn UploadApi>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn start(config: ClientConfig, data_dir: PathBuf) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let client = Client::new();
        let completion = Arc::new(HttpCompletionApi::new(
            client.clone(),
            config.api_base.clone(),
            data_dir.clone(),
            session_id.clone(),
        ));
        let uploader = Arc::new(HttpUploadCoordinator::new(
            client,
            config.api_base.clone(),
            config.upload_chunk_bytes,
            data_dir.clone(),
            session_id.clone(),
        ));
        Self::new_inner(session_id, config, data_dir, completion, uploader)
    }

    pub fn with_components(
        config: ClientConfig,
        data_dir: PathBuf,
        completion: Arc<dyn CompletionApi>,
        uploader: Arc<dyn UploadApi>,
    ) -> Self {
        Self::new_inner(
            Uuid::new_v4().to_string(),
            config,
            data_dir,
            completion,
            uploader,
        )
    }

    fn new_inner(
        session_id: String,
        config: ClientConfig,
        data_dir: PathBuf,
        completion: Arc<dyn CompletionApi>,
        uploader: Arc<dyn UploadApi>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let realtime_url = config.realtime_url.clone();
        let inner = Arc::new(SessionInner {
            session_id,
            config,
            data_dir,
            transcript: Mutex::new(Transcript::new()),
            uploads: Mutex::new(HashMap::new()),
            tx,
            shutdown: CancellationToken::new(),
            completion,
            uploader,
        });

        trace::event(
            &inner.data_dir,
            Some(&inner.session_id),
            "Session",
            "SESSION.start",
            "ok",
            Some(serde_json::json!({ "has_realtime": realtime_url.is_some() })),
        );

        spawn_pump(&inner, rx);
        if let Some(url) = realtime_url {
            realtime::spawn_channel(
                url,
                inner.data_dir.clone(),
                inner.session_id.clone(),
                inner.tx.clone(),
                inner.shutdown.child_token(),
            );
        }
        Self { inner }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.inner.transcript.lock().unwrap().snapshot()
    }

    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.inner.transcript.lock().unwrap().get(id).cloned()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // Rule 1: resolved user message + pending assistant message, then the
    // completion call resolves or errors the assistant entry.
    pub fn submit_text(&self, text: &str) -> Option<MessageId> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let assistant_id = append_chat_pair(&self.inner, text)?;
        trace::event(
            &self.inner.data_dir,
            Some(&self.inner.session_id),
            "Session",
            "SESSION.text_submit",
            "ok",
            Some(serde_json::json!({ "chars": text.chars().count() })),
        );
        spawn_completion(&self.inner, assistant_id, text.to_string());
        Some(assistant_id)
    }

    // Rules 2 and 3: pending user message carrying the attachment, then one
    // upload in flight for this submission. Returns the correlation id the
    // backend is expected to echo in the transcription event.
    pub fn submit_attachment(&self, file: LocalFile) -> Option<String> {
        if self.inner.shutdown.is_cancelled() {
            return None;
        }
        let correlation_id = Uuid::new_v4().to_string();
        let attachment = attachment_for(&file);
        let kind = if file.content_type.starts_with("audio/") {
            PendingKind::Audio
        } else {
            PendingKind::Other
        };
        let body = if kind == PendingKind::Audio {
            VOICE_MESSAGE_BODY
        } else {
            ""
        };
        let has_preview = attachment.has_preview();
        let file_name = file.file_name.clone();

        let message_id = {
            let mut t = self.inner.transcript.lock().unwrap();
            if self.inner.shutdown.is_cancelled() {
                return None;
            }
            t.append(Message::pending_upload(body, attachment))
        };
        self.inner.uploads.lock().unwrap().insert(
            correlation_id.clone(),
            PendingUpload {
                message_id,
                kind,
                file_name: file_name.clone(),
                has_preview,
            },
        );

        trace::event(
            &self.inner.data_dir,
            Some(&self.inner.session_id),
            "Session",
            "SESSION.attachment_submit",
            "ok",
            Some(serde_json::json!({
                "file_name": file_name,
                "content_type": file.content_type,
                "correlation_id": correlation_id,
                "bytes": file.bytes.len(),
            })),
        );

        spawn_upload(
            &self.inner,
            correlation_id.clone(),
            UploadRequest {
                file_name,
                content_type: file.content_type,
                correlation_id: correlation_id.clone(),
                bytes: file.bytes,
            },
        );
        Some(correlation_id)
    }

    pub fn submit_voice(&self, blob: RecordingBlob) -> Option<String> {
        let ext = blob.mime.rsplit('/').next().unwrap_or("mp3");
        let file_name = format!("recording-{}.{ext}", now_ms());
        let preview_url = local_preview(&file_name);
        self.submit_attachment(LocalFile {
            file_name,
            content_type: blob.mime,
            bytes: blob.bytes,
            preview_url: Some(preview_url),
        })
    }

    // Microphone failures have no transcript entry to attach to; they land as
    // a fresh system-role message.
    pub fn report_recorder_error(&self, err: &RecorderError) {
        apply(
            &self.inner,
            SessionEvent::RecorderFailed {
                code: err.code.clone(),
                message: err.message.clone(),
            },
        );
    }

    // Feed a transcription event from a transport the embedder owns. The
    // built-in realtime channel posts the same event through the queue.
    pub fn handle_transcription(&self, text: String, correlation_id: Option<String>) {
        apply(
            &self.inner,
            SessionEvent::TranscriptionReceived {
                text,
                correlation_id,
            },
        );
    }

    // The single disposal routine: stops the pump, the realtime channel and
    // every reveal timer. After this returns no event mutates the transcript.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        trace::event(
            &self.inner.data_dir,
            Some(&self.inner.session_id),
            "Session",
            "SESSION.shutdown",
            "ok",
            None,
        );
        self.inner.shutdown.cancel();
        // Barrier: an apply already holding the transcript lock finishes
        // before shutdown returns; later ones observe the cancelled token.
        let _t = self.inner.transcript.lock().unwrap();
    }
}

fn local_preview(file_name: &str) -> String {
    format!("local://{file_name}")
}

fn attachment_for(file: &LocalFile) -> Attachment {
    if file.content_type.starts_with("image/") {
        Attachment::Image {
            preview_url: file
                .preview_url
                .clone()
                .unwrap_or_else(|| local_preview(&file.file_name)),
            file_name: file.file_name.clone(),
        }
    } else if file.content_type.starts_with("audio/") {
        Attachment::Audio {
            preview_url: file
                .preview_url
                .clone()
                .unwrap_or_else(|| local_preview(&file.file_name)),
            file_name: file.file_name.clone(),
        }
    } else {
        Attachment::File {
            file_name: file.file_name.clone(),
        }
    }
}

fn spawn_pump(inner: &Arc<SessionInner>, mut rx: UnboundedReceiver<SessionEvent>) {
    let weak = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        loop {
            let ev = tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            let Some(inner) = weak.upgrade() else { break };
            apply(&inner, ev);
        }
    });
}

fn spawn_completion(inner: &SessionInner, message_id: MessageId, text: String) {
    let completion = inner.completion.clone();
    let tx = inner.tx.clone();
    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            r = completion.complete(&text) => r,
        };
        let _ = tx.send(SessionEvent::CompletionFinished { message_id, result });
    });
}

// Uploads are not cancellable once started; a terminal event always lands on
// the queue and the pump decides whether the session still cares.
fn spawn_upload(inner: &SessionInner, correlation_id: String, req: UploadRequest) {
    let uploader = inner.uploader.clone();
    let tx = inner.tx.clone();
    let progress: ProgressFn = {
        let tx = tx.clone();
        let cid = correlation_id.clone();
        Arc::new(move |percent| {
            let _ = tx.send(SessionEvent::UploadProgress {
                correlation_id: cid.clone(),
                percent,
            });
        })
    };
    tokio::spawn(async move {
        let result = uploader.upload(req, progress).await;
        let _ = tx.send(SessionEvent::UploadFinished {
            correlation_id,
            result,
        });
    });
}

fn append_chat_pair(inner: &SessionInner, text: &str) -> Option<MessageId> {
    let mut t = inner.transcript.lock().unwrap();
    if inner.shutdown.is_cancelled() {
        return None;
    }
    t.append(Message::resolved(Sender::User, text));
    Some(t.append(Message::pending(Sender::Assistant)))
}

fn mutate(inner: &SessionInner, id: MessageId, f: impl FnOnce(&mut Message)) {
    let mut t = inner.transcript.lock().unwrap();
    if inner.shutdown.is_cancelled() {
        return;
    }
    if let Some(m) = t.get_mut(id) {
        f(m);
    }
}

// The transition function: (transcript, event) -> transcript. Terminal
// statuses are never left, whatever order the async sources resolve in.
fn apply(inner: &SessionInner, ev: SessionEvent) {
    if inner.shutdown.is_cancelled() {
        return;
    }
    match ev {
        SessionEvent::UploadProgress {
            correlation_id,
            percent,
        } => {
            let target = {
                let uploads = inner.uploads.lock().unwrap();
                uploads
                    .get(&correlation_id)
                    .map(|p| (p.message_id, p.has_preview))
            };
            if let Some((message_id, has_preview)) = target {
                if !has_preview {
                    mutate(inner, message_id, |m| {
                        if m.status == MessageStatus::Pending {
                            m.body = format!("Uploading {percent}%");
                        }
                    });
                }
            }
        }

        SessionEvent::UploadFinished {
            correlation_id,
            result,
        } => match result {
            Ok(remote) => {
                let done = {
                    let mut uploads = inner.uploads.lock().unwrap();
                    match uploads.get(&correlation_id).map(|p| p.kind) {
                        // Audio stays pending until its transcription event
                        // arrives (rule 4); the table entry keeps correlating.
                        Some(PendingKind::Audio) => None,
                        Some(PendingKind::Other) => uploads
                            .remove(&correlation_id)
                            .map(|p| (p.message_id, p.file_name)),
                        None => None,
                    }
                };
                trace::event(
                    &inner.data_dir,
                    Some(&inner.session_id),
                    "Session",
                    "SESSION.upload_finished",
                    "ok",
                    Some(serde_json::json!({
                        "correlation_id": correlation_id,
                        "remote_url": remote.url,
                    })),
                );
                if let Some((message_id, file_name)) = done {
                    mutate(inner, message_id, |m| {
                        if m.status == MessageStatus::Pending {
                            m.status = MessageStatus::Resolved;
                            m.body = format!("Uploaded {file_name}");
                        }
                    });
                }
            }
            Err(e) => {
                let target = {
                    let mut uploads = inner.uploads.lock().unwrap();
                    uploads.remove(&correlation_id).map(|p| p.message_id)
                };
                trace::event(
                    &inner.data_dir,
                    Some(&inner.session_id),
                    "Session",
                    "SESSION.upload_finished",
                    "err",
                    Some(serde_json::json!({
                        "correlation_id": correlation_id,
                        "code": e.code,
                        "file_name": e.file_name,
                    })),
                );
                if let Some(message_id) = target {
                    let file_name = e.file_name.clone();
                    mutate(inner, message_id, |m| {
                        if !m.status.is_terminal() {
                            m.status = MessageStatus::Errored;
                            m.body = format!("Error uploading {file_name}");
                        }
                    });
                }
            }
        },

        SessionEvent::CompletionFinished { message_id, result } => match result {
            Ok(raw) => {
                let text = chat::sanitize_response(&raw);
                let mut entered = false;
                mutate(inner, message_id, |m| {
                    if m.status == MessageStatus::Pending {
                        m.status = MessageStatus::Streaming;
                        entered = true;
                    }
                });
                if entered {
                    reveal::spawn_reveal(
                        message_id,
                        text,
                        inner.config.reveal_interval,
                        inner.tx.clone(),
                        inner.shutdown.child_token(),
                    );
                }
            }
            Err(e) => {
                mutate(inner, message_id, |m| {
                    if m.status == MessageStatus::Pending {
                        m.status = MessageStatus::Errored;
                        m.body = e.message.clone();
                    }
                });
            }
        },

        SessionEvent::RevealStep { message_id, body } => {
            mutate(inner, message_id, |m| {
                if m.status == MessageStatus::Streaming {
                    m.body = body;
                }
            });
        }

        SessionEvent::RevealCompleted { message_id } => {
            mutate(inner, message_id, |m| {
                if m.status == MessageStatus::Streaming {
                    m.status = MessageStatus::Resolved;
                }
            });
        }

        SessionEvent::TranscriptionReceived {
            text,
            correlation_id,
        } => {
            let mut target = {
                let mut uploads = inner.uploads.lock().unwrap();
                correlation_id
                    .as_deref()
                    .and_then(|cid| uploads.remove(cid))
                    .map(|p| p.message_id)
            };
            if target.is_none() {
                // Last-pending-wins fallback for id-less events.
                target = inner.transcript.lock().unwrap().last_pending();
                if let Some(mid) = target {
                    inner
                        .uploads
                        .lock()
                        .unwrap()
                        .retain(|_, p| p.message_id != mid);
                }
            }
            trace::event(
                &inner.data_dir,
                Some(&inner.session_id),
                "Session",
                "SESSION.transcription",
                "ok",
                Some(serde_json::json!({
                    "had_correlation_id": correlation_id.is_some(),
                    "matched": target.is_some(),
                    "text_chars": text.chars().count(),
                })),
            );
            if let Some(mid) = target {
                mutate(inner, mid, |m| {
                    if !m.status.is_terminal() {
                        m.status = MessageStatus::Resolved;
                        // The attachment stands alone.
                        m.body.clear();
                    }
                });
            }
            // Treat the transcription as a fresh text submit (rule 4).
            if let Some(assistant_id) = append_chat_pair(inner, &text) {
                spawn_completion(inner, assistant_id, text);
            }
        }

        SessionEvent::RecorderFailed { code, message } => {
            trace::event(
                &inner.data_dir,
                Some(&inner.session_id),
                "Session",
                "SESSION.recorder_failed",
                "err",
                Some(serde_json::json!({ "code": code })),
            );
            let mut t = inner.transcript.lock().unwrap();
            if inner.shutdown.is_cancelled() {
                return;
            }
            t.append(Message::errored(Sender::System, message));
        }
    }
}
