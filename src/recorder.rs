use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::recording_cache;
use crate::trace;

pub const E_MIC_PERMISSION_DENIED: &str = "E_MIC_PERMISSION_DENIED";
pub const E_MIC_UNAVAILABLE: &str = "E_MIC_UNAVAILABLE";
pub const E_MIC_BUSY: &str = "E_MIC_BUSY";
pub const E_MIC_CAPTURE_FAILED: &str = "E_MIC_CAPTURE_FAILED";

#[derive(Debug, Clone)]
pub struct RecorderError {
    pub code: String,
    pub message: String,
}

impl RecorderError {
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self {
            code: E_MIC_PERMISSION_DENIED.to_string(),
            message: message.into(),
        }
    }

    pub fn device_unavailable(message: impl Into<String>) -> Self {
        Self {
            code: E_MIC_UNAVAILABLE.to_string(),
            message: message.into(),
        }
    }

    fn busy() -> Self {
        Self {
            code: E_MIC_BUSY.to_string(),
            message: "a recording is already in progress".to_string(),
        }
    }

    fn capture_failed(message: impl Into<String>) -> Self {
        Self {
            code: E_MIC_CAPTURE_FAILED.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RecorderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RecorderError {}

#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
    // Peak amplitude of the chunk, 0.0..=1.0, feeds the live visualizer.
    pub peak: f32,
}

// The platform microphone is an external collaborator; embedders provide the
// capture seam. `open` fails with E_MIC_PERMISSION_DENIED or E_MIC_UNAVAILABLE
// when the capability is missing.
pub trait CaptureSource: Send {
    fn open(&mut self) -> Result<Box<dyn CaptureStream>, RecorderError>;
}

pub trait CaptureStream: Send {
    // Blocking pull; Ok(None) means the stream ended. The stream observes the
    // recorder's stop flag at chunk granularity.
    fn next_chunk(&mut self) -> Result<Option<AudioChunk>, RecorderError>;

    fn mime(&self) -> &str {
        "audio/mp3"
    }
}

#[derive(Debug, Clone)]
pub struct RecordingBlob {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub duration_ms: u128,
}

struct ActiveCapture {
    started: Instant,
    mime: String,
    stop: CancellationToken,
    chunks: Arc<Mutex<Vec<u8>>>,
    drain: JoinHandle<Result<(), RecorderError>>,
}

#[derive(Default)]
struct RecorderInner {
    active: Option<ActiveCapture>,
    finalized: Option<RecordingBlob>,
}

#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Mutex<RecorderInner>>,
    amplitude_tx: Arc<watch::Sender<f32>>,
    amplitude_rx: watch::Receiver<f32>,
    data_dir: PathBuf,
}

impl Recorder {
    pub fn new(data_dir: PathBuf) -> Self {
        let (amplitude_tx, amplitude_rx) = watch::channel(0.0f32);
        Self {
            inner: Arc::new(Mutex::new(RecorderInner::default())),
            amplitude_tx: Arc::new(amplitude_tx),
            amplitude_rx,
            data_dir,
        }
    }

    // Live amplitude signal for visualization; resets to 0.0 when capture ends.
    pub fn amplitude(&self) -> watch::Receiver<f32> {
        self.amplitude_rx.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().unwrap().active.is_some()
    }

    pub fn start(&self, source: &mut dyn CaptureSource) -> Result<(), RecorderError> {
        let mut g = self.inner.lock().unwrap();
        if g.active.is_some() {
            return Err(RecorderError::busy());
        }

        let mut stream = source.open()?;
        let mime = stream.mime().to_string();
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();

        let chunks2 = chunks.clone();
        let stop2 = stop.clone();
        let amplitude = self.amplitude_tx.clone();
        let drain = tokio::task::spawn_blocking(move || {
            loop {
                if stop2.is_cancelled() {
                    break;
                }
                match stream.next_chunk() {
                    Ok(Some(chunk)) => {
                        chunks2.lock().unwrap().extend_from_slice(&chunk.bytes);
                        let _ = amplitude.send(chunk.peak);
                    }
                    Ok(None) => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        });

        trace::event(
            &self.data_dir,
            None,
            "Record",
            "RECORD.start",
            "ok",
            Some(serde_json::json!({ "mime": mime })),
        );

        g.finalized = None;
        g.active = Some(ActiveCapture {
            started: Instant::now(),
            mime,
            stop,
            chunks,
            drain,
        });
        Ok(())
    }

    // Finalizes the capture into a single blob and best-effort caches it for
    // crash recovery. No-op when not recording.
    pub async fn stop(&self) -> Result<Option<RecordingBlob>, RecorderError> {
        let active = { self.inner.lock().unwrap().active.take() };
        let Some(active) = active else {
            return Ok(None);
        };

        active.stop.cancel();
        let drain_res = active.drain.await;
        let _ = self.amplitude_tx.send(0.0);
        match drain_res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                trace::event(
                    &self.data_dir,
                    None,
                    "Record",
                    "RECORD.stop",
                    "err",
                    Some(serde_json::json!({ "code": e.code, "message": e.message })),
                );
                return Err(e);
            }
            Err(e) => {
                return Err(RecorderError::capture_failed(format!(
                    "capture task join failed: {e}"
                )));
            }
        }

        let bytes = std::mem::take(&mut *active.chunks.lock().unwrap());
        let blob = RecordingBlob {
            bytes,
            mime: active.mime,
            duration_ms: active.started.elapsed().as_millis(),
        };

        if let Err(e) = recording_cache::store(&self.data_dir, &blob.mime, &blob.bytes) {
            crate::safe_eprintln!("recording cache store failed: {e:#}");
        }
        trace::event(
            &self.data_dir,
            None,
            "Record",
            "RECORD.stop",
            "ok",
            Some(serde_json::json!({
                "bytes": blob.bytes.len(),
                "duration_ms": blob.duration_ms,
            })),
        );

        self.inner.lock().unwrap().finalized = Some(blob.clone());
        Ok(Some(blob))
    }

    // Discards the finalized blob (and any in-flight capture) without
    // submitting it.
    pub async fn cancel(&self) {
        let active = { self.inner.lock().unwrap().active.take() };
        if let Some(active) = active {
            active.stop.cancel();
            let _ = active.drain.await;
            let _ = self.amplitude_tx.send(0.0);
        }
        self.inner.lock().unwrap().finalized = None;
        trace::event(&self.data_dir, None, "Record", "RECORD.cancel", "ok", None);
    }

    pub fn take_recording(&self) -> Option<RecordingBlob> {
        self.inner.lock().unwrap().finalized.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FakeSource {
        open_result: Option<RecorderError>,
        chunks: Vec<AudioChunk>,
        endless: bool,
    }

    impl FakeSource {
        fn with_chunks(chunks: Vec<AudioChunk>) -> Self {
            Self {
                open_result: None,
                chunks,
                endless: false,
            }
        }

        fn endless() -> Self {
            Self {
                open_result: None,
                chunks: Vec::new(),
                endless: true,
            }
        }

        fn failing(err: RecorderError) -> Self {
            Self {
                open_result: Some(err),
                chunks: Vec::new(),
                endless: false,
            }
        }
    }

    struct FakeStream {
        chunks: std::vec::IntoIter<AudioChunk>,
        endless: bool,
    }

    impl CaptureSource for FakeSource {
        fn open(&mut self) -> Result<Box<dyn CaptureStream>, RecorderError> {
            if let Some(e) = self.open_result.take() {
                return Err(e);
            }
            Ok(Box::new(FakeStream {
                chunks: std::mem::take(&mut self.chunks).into_iter(),
                endless: self.endless,
            }))
        }
    }

    impl CaptureStream for FakeStream {
        fn next_chunk(&mut self) -> Result<Option<AudioChunk>, RecorderError> {
            if let Some(c) = self.chunks.next() {
                return Ok(Some(c));
            }
            if self.endless {
                std::thread::sleep(Duration::from_millis(1));
                return Ok(Some(AudioChunk {
                    bytes: vec![7u8],
                    peak: 0.4,
                }));
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn start_stop_accumulates_chunks_and_caches() {
        let td = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new(td.path().to_path_buf());
        let mut source = FakeSource::with_chunks(vec![
            AudioChunk {
                bytes: vec![1, 2],
                peak: 0.2,
            },
            AudioChunk {
                bytes: vec![3],
                peak: 0.9,
            },
        ]);

        recorder.start(&mut source).expect("start");
        let blob = recorder
            .stop()
            .await
            .expect("stop")
            .expect("finalized blob");
        assert_eq!(blob.bytes, vec![1, 2, 3]);
        assert_eq!(blob.mime, "audio/mp3");

        let cached = recording_cache::load(td.path())
            .expect("cache load")
            .expect("cached recording");
        assert_eq!(cached.bytes, vec![1, 2, 3]);

        assert_eq!(recorder.take_recording().expect("take").bytes, vec![1, 2, 3]);
        assert!(recorder.take_recording().is_none());
    }

    #[tokio::test]
    async fn amplitude_updates_while_recording() {
        let td = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new(td.path().to_path_buf());
        let mut rx = recorder.amplitude();
        let mut source = FakeSource::endless();

        recorder.start(&mut source).expect("start");
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("amplitude update before timeout")
            .expect("sender alive");
        assert!(*rx.borrow() > 0.0);

        let blob = recorder.stop().await.expect("stop").expect("blob");
        assert!(!blob.bytes.is_empty());
        assert_eq!(*recorder.amplitude().borrow(), 0.0);
    }

    #[tokio::test]
    async fn stop_without_recording_is_a_noop() {
        let td = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new(td.path().to_path_buf());
        assert!(recorder.stop().await.expect("stop").is_none());
    }

    #[tokio::test]
    async fn cancel_discards_finalized_blob() {
        let td = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new(td.path().to_path_buf());
        let mut source = FakeSource::with_chunks(vec![AudioChunk {
            bytes: vec![9],
            peak: 0.1,
        }]);

        recorder.start(&mut source).expect("start");
        recorder.stop().await.expect("stop");
        recorder.cancel().await;
        assert!(recorder.take_recording().is_none());
    }

    #[tokio::test]
    async fn permission_denied_propagates_from_open() {
        let td = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new(td.path().to_path_buf());
        let mut source =
            FakeSource::failing(RecorderError::permission_denied("microphone access denied"));
        let err = recorder.start(&mut source).expect_err("must fail");
        assert_eq!(err.code, E_MIC_PERMISSION_DENIED);
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn second_start_while_recording_is_rejected() {
        let td = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new(td.path().to_path_buf());
        let mut source = FakeSource::endless();
        recorder.start(&mut source).expect("start");

        let mut second = FakeSource::endless();
        let err = recorder.start(&mut second).expect_err("busy");
        assert_eq!(err.code, E_MIC_BUSY);

        recorder.stop().await.expect("stop");
    }
}
