mod chat;
mod data_dir;
mod realtime;
mod recorder;
mod recording_cache;
mod reveal;
mod safe_print;
mod session;
mod settings;
mod trace;
mod transcript;
mod upload;

pub use chat::{
    sanitize_response, ChatCompletionError, CompletionApi, HttpCompletionApi, BOT_REPLY_PREFIX,
    GENERIC_CHAT_ERROR,
};
pub use data_dir::data_dir;
pub use realtime::TranscriptionEvent;
pub use recorder::{
    AudioChunk, CaptureSource, CaptureStream, Recorder, RecorderError, RecordingBlob,
    E_MIC_PERMISSION_DENIED, E_MIC_UNAVAILABLE,
};
pub use recording_cache::{
    clear as clear_last_recording, load as load_last_recording, CachedRecording,
};
pub use session::{ChatSession, LocalFile, SessionEvent};
pub use settings::{
    load_config, load_settings, save_settings, ClientConfig, Settings, DEFAULT_API_BASE,
};
pub use transcript::{Attachment, Message, MessageId, MessageStatus, Sender, Transcript};
pub use upload::{
    HttpUploadCoordinator, ProgressFn, RemoteFileRef, UploadApi, UploadError, UploadRequest,
};
