use crate::error::{Capability, Result, SafetyError};
use crate::events::{emit, EventSender, SafetyEvent};
use crate::platform::AudioRecorder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Recording,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSnapshot {
    pub state: RecordingState,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub artifact_uri: Option<String>,
}

struct Inner {
    state: RecordingState,
    started_at: Option<DateTime<Utc>>,
    elapsed_seconds: u64,
    artifact_uri: Option<String>,
    ticker: Option<JoinHandle<()>>,
    /// Permission prompt or recorder start in progress
    starting: bool,
    /// Recorder finalize in progress
    finalizing: bool,
    /// Set by `teardown()`; no recording may begin afterwards
    closed: bool,
    generation: u64,
}

/// Evidence recording, independent of location and SOS
pub struct AudioRecordingSession {
    recorder: Arc<dyn AudioRecorder>,
    events: EventSender,
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl AudioRecordingSession {
    pub fn new(recorder: Arc<dyn AudioRecorder>, events: EventSender) -> Self {
        Self {
            recorder,
            events,
            inner: Arc::new(Mutex::new(Inner {
                state: RecordingState::Idle,
                started_at: None,
                elapsed_seconds: 0,
                artifact_uri: None,
                ticker: None,
                starting: false,
                finalizing: false,
                closed: false,
                generation: 0,
            })),
        }
    }

    pub fn snapshot(&self) -> RecordingSnapshot {
        let inner = lock(&self.inner);
        RecordingSnapshot {
            state: inner.state,
            started_at: inner.started_at,
            elapsed_seconds: inner.elapsed_seconds,
            artifact_uri: inner.artifact_uri.clone(),
        }
    }

    pub fn state(&self) -> RecordingState {
        lock(&self.inner).state
    }

    /// Begin capturing. A finished recording may be followed by a new one;
    /// starting while one is active is `ResourceBusy`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut inner = lock(&self.inner);
            if inner.closed {
                return Err(SafetyError::ShutDown("Recording"));
            }
            if inner.state == RecordingState::Recording || inner.starting {
                return Err(SafetyError::ResourceBusy("Recording"));
            }
            inner.starting = true;
        }

        let permission = self.recorder.request_permission().await;
        if self.abandon_if_closed() {
            return Err(SafetyError::ShutDown("Recording"));
        }
        if !permission.is_granted() {
            lock(&self.inner).starting = false;
            log::warn!("Microphone permission denied");
            emit(
                &self.events,
                SafetyEvent::notice(
                    "Permission Required",
                    "Microphone access is needed to record audio evidence.",
                ),
            );
            return Err(SafetyError::PermissionDenied(Capability::Microphone));
        }

        if let Err(e) = self.recorder.start().await {
            lock(&self.inner).starting = false;
            log::error!("Recorder failed to start: {}", e);
            return Err(e);
        }

        if self.abandon_if_closed() {
            // torn down while the recorder spun up; release it again
            if let Err(e) = self.recorder.stop().await {
                log::warn!("Recorder release after teardown: {}", e);
            }
            return Err(SafetyError::ShutDown("Recording"));
        }

        {
            let mut inner = lock(&self.inner);
            inner.starting = false;
            inner.state = RecordingState::Recording;
            inner.started_at = Some(Utc::now());
            inner.elapsed_seconds = 0;
            inner.artifact_uri = None;
            inner.generation += 1;
            let generation = inner.generation;
            inner.ticker = Some(tokio::spawn(run_ticker(
                Arc::clone(&self.inner),
                self.events.clone(),
                generation,
            )));
        }
        log::info!("Recording started");
        emit(&self.events, SafetyEvent::RecordingStarted);
        Ok(())
    }

    /// Finalize the active recording and return its artifact URI.
    ///
    /// With nothing recording this only logs a warning and returns `Ok(None)`.
    pub async fn stop(&self) -> Result<Option<String>> {
        {
            let mut inner = lock(&self.inner);
            if inner.state != RecordingState::Recording || inner.finalizing {
                log::warn!("No active recording to stop");
                return Ok(None);
            }
            inner.finalizing = true;
            if let Some(ticker) = inner.ticker.take() {
                ticker.abort();
            }
        }

        let result = self.recorder.stop().await;

        let mut inner = lock(&self.inner);
        inner.finalizing = false;
        inner.state = RecordingState::Stopped;
        match result {
            Ok(uri) => {
                inner.artifact_uri = Some(uri.clone());
                let elapsed = inner.elapsed_seconds;
                drop(inner);
                log::info!("Recording stopped after {}s: {}", elapsed, uri);
                emit(
                    &self.events,
                    SafetyEvent::RecordingStopped {
                        artifact_uri: Some(uri.clone()),
                    },
                );
                Ok(Some(uri))
            }
            Err(e) => {
                inner.artifact_uri = None;
                drop(inner);
                log::error!("Recording finalize failed: {}", e);
                emit(
                    &self.events,
                    SafetyEvent::RecordingStopped { artifact_uri: None },
                );
                Err(e)
            }
        }
    }

    /// Clears `starting` and reports true when `teardown()` ran meanwhile
    fn abandon_if_closed(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.closed {
            inner.starting = false;
        }
        inner.closed
    }

    /// Finalize anything still recording and refuse later starts. Idempotent.
    pub async fn teardown(&self) {
        lock(&self.inner).closed = true;
        if let Err(e) = self.stop_if_recording().await {
            log::warn!("Recording teardown: {}", e);
        }
    }

    async fn stop_if_recording(&self) -> Result<()> {
        if self.state() == RecordingState::Recording {
            self.stop().await?;
        }
        Ok(())
    }
}

async fn run_ticker(inner: Arc<Mutex<Inner>>, events: EventSender, generation: u64) {
    let mut ticker = interval_at(Instant::now() + TICK, TICK);
    loop {
        ticker.tick().await;
        let elapsed = {
            let mut inner = lock(&inner);
            if inner.generation != generation || inner.state != RecordingState::Recording {
                return;
            }
            inner.elapsed_seconds += 1;
            inner.elapsed_seconds
        };
        emit(
            &events,
            SafetyEvent::RecordingTick {
                elapsed_seconds: elapsed,
            },
        );
    }
}
