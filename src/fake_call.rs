//! Decoy incoming call: countdown, ringing, answer/decline.
//!
//! ```text
//! Idle ──schedule──▶ Scheduled ──timer──▶ Ringing ──accept/decline──▶ Ended ──▶ Idle
//!   ▲                   │  ▲  │
//!   └─────cancel────────┘  └──┘ schedule (replaces pending call)
//! ```
//!
//! The controller is the only owner of the ringtone player.

use crate::error::{Result, SafetyError};
use crate::events::{emit, EventSender, SafetyEvent};
use crate::platform::RingtonePlayer;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

const TICK: Duration = Duration::from_secs(1);

/// User input for a fake call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FakeCallConfig {
    pub caller_name: String,
    pub caller_number: String,
    pub delay_seconds: u32,
}

impl FakeCallConfig {
    pub fn validate(&self) -> Result<()> {
        if self.caller_name.trim().is_empty() {
            return Err(SafetyError::Validation("Caller name is required".into()));
        }
        if self.delay_seconds == 0 {
            return Err(SafetyError::Validation(
                "Delay must be at least one second".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FakeCallState {
    Idle,
    Scheduled,
    Ringing,
    Ended,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FakeCallSession {
    pub state: FakeCallState,
    pub remaining_seconds: u32,
    pub caller: Option<FakeCallConfig>,
}

struct Inner {
    state: FakeCallState,
    remaining_seconds: u32,
    config: Option<FakeCallConfig>,
    /// Bumped on every schedule/cancel so stale timers recognise themselves
    generation: u64,
    countdown: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    ringtone_loaded: bool,
}

impl Inner {
    fn clear_timers(&mut self) {
        if let Some(countdown) = self.countdown.take() {
            countdown.abort();
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn is_current(&self, generation: u64, state: FakeCallState) -> bool {
        self.generation == generation && self.state == state
    }
}

struct Shared {
    inner: Mutex<Inner>,
    ringtone: Arc<dyn RingtonePlayer>,
    events: EventSender,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn run_countdown(self: Arc<Self>, generation: u64) {
        let mut ticker = interval_at(Instant::now() + TICK, TICK);
        loop {
            ticker.tick().await;
            let remaining = {
                let mut inner = self.lock();
                if !inner.is_current(generation, FakeCallState::Scheduled) {
                    return;
                }
                inner.remaining_seconds = inner.remaining_seconds.saturating_sub(1);
                inner.remaining_seconds
            };
            emit(
                &self.events,
                SafetyEvent::FakeCallCountdown {
                    remaining_seconds: remaining,
                },
            );
            if remaining == 0 {
                return;
            }
        }
    }

    async fn ring_after(self: Arc<Self>, generation: u64, delay: Duration) {
        sleep(delay).await;

        let (config, needs_load) = {
            let mut inner = self.lock();
            if !inner.is_current(generation, FakeCallState::Scheduled) {
                return;
            }
            inner.state = FakeCallState::Ringing;
            inner.remaining_seconds = 0;
            if let Some(countdown) = inner.countdown.take() {
                countdown.abort();
            }
            // this task's own handle; dropping it just detaches
            inner.timer.take();
            let needs_load = !inner.ringtone_loaded;
            inner.ringtone_loaded = true;
            (inner.config.clone(), needs_load)
        };

        let Some(config) = config else { return };
        log::info!("Fake call ringing: {}", config.caller_name);
        emit(
            &self.events,
            SafetyEvent::FakeCallRinging {
                caller_name: config.caller_name,
                caller_number: config.caller_number,
            },
        );

        if needs_load {
            if let Err(e) = self.ringtone.load().await {
                log::warn!("Ringtone load failed: {}", e);
            }
        }
        if let Err(e) = self.ringtone.play_looping().await {
            log::warn!("Ringtone playback failed: {}", e);
        }

        // the call may have been answered while playback was starting
        let still_ringing = self.lock().is_current(generation, FakeCallState::Ringing);
        if !still_ringing {
            self.silence().await;
        }
    }

    async fn silence(&self) {
        if let Err(e) = self.ringtone.stop().await {
            log::warn!("Ringtone stop failed: {}", e);
        }
        if let Err(e) = self.ringtone.rewind().await {
            log::warn!("Ringtone rewind failed: {}", e);
        }
    }
}

pub struct FakeCallController {
    shared: Arc<Shared>,
}

impl FakeCallController {
    pub fn new(ringtone: Arc<dyn RingtonePlayer>, events: EventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: FakeCallState::Idle,
                    remaining_seconds: 0,
                    config: None,
                    generation: 0,
                    countdown: None,
                    timer: None,
                    ringtone_loaded: false,
                }),
                ringtone,
                events,
            }),
        }
    }

    pub fn session(&self) -> FakeCallSession {
        let inner = self.shared.lock();
        FakeCallSession {
            state: inner.state,
            remaining_seconds: inner.remaining_seconds,
            caller: inner.config.clone(),
        }
    }

    pub fn state(&self) -> FakeCallState {
        self.shared.lock().state
    }

    /// Schedule a call `delay_seconds` from now. A pending call is replaced,
    /// not queued. Rejected while a call is ringing.
    pub fn schedule(&self, config: FakeCallConfig) -> Result<()> {
        config.validate()?;

        let mut inner = self.shared.lock();
        if inner.state == FakeCallState::Ringing {
            return Err(SafetyError::ResourceBusy("Fake call"));
        }
        if inner.state == FakeCallState::Scheduled {
            log::info!("Replacing pending fake call");
        }
        inner.clear_timers();
        inner.generation += 1;
        let generation = inner.generation;
        let delay = Duration::from_secs(u64::from(config.delay_seconds));

        inner.state = FakeCallState::Scheduled;
        inner.remaining_seconds = config.delay_seconds;
        inner.config = Some(config.clone());
        inner.countdown = Some(tokio::spawn(
            Arc::clone(&self.shared).run_countdown(generation),
        ));
        inner.timer = Some(tokio::spawn(
            Arc::clone(&self.shared).ring_after(generation, delay),
        ));
        drop(inner);

        log::info!(
            "Fake call from {} in {}s",
            config.caller_name,
            config.delay_seconds
        );
        emit(
            &self.shared.events,
            SafetyEvent::FakeCallScheduled {
                caller_name: config.caller_name,
                delay_seconds: config.delay_seconds,
            },
        );
        Ok(())
    }

    /// Cancel a pending call. Returns false when nothing was scheduled.
    pub fn cancel(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.state != FakeCallState::Scheduled {
            log::debug!("No scheduled fake call to cancel ({:?})", inner.state);
            return false;
        }
        inner.clear_timers();
        inner.generation += 1;
        inner.state = FakeCallState::Idle;
        inner.remaining_seconds = 0;
        inner.config = None;
        drop(inner);

        log::info!("Fake call cancelled");
        emit(&self.shared.events, SafetyEvent::FakeCallCancelled);
        true
    }

    pub async fn accept(&self) -> bool {
        self.end_call("accepted").await
    }

    pub async fn decline(&self) -> bool {
        self.end_call("declined").await
    }

    /// Accepting and declining look the same: the decoy call simply ends.
    async fn end_call(&self, how: &str) -> bool {
        {
            let mut inner = self.shared.lock();
            if inner.state != FakeCallState::Ringing {
                log::debug!("Fake call not ringing ({:?}), ignoring {}", inner.state, how);
                return false;
            }
            inner.state = FakeCallState::Ended;
        }
        log::info!("Fake call {}", how);
        emit(&self.shared.events, SafetyEvent::FakeCallEnded);

        self.shared.silence().await;

        let mut inner = self.shared.lock();
        // a new call may already have been scheduled while the ringtone stopped
        if inner.state == FakeCallState::Ended {
            inner.state = FakeCallState::Idle;
            inner.config = None;
        }
        true
    }

    /// Drop timers, silence and unload the ringtone. Idempotent.
    pub async fn teardown(&self) {
        let (was_ringing, was_loaded) = {
            let mut inner = self.shared.lock();
            inner.clear_timers();
            inner.generation += 1;
            let was_ringing = inner.state == FakeCallState::Ringing;
            inner.state = FakeCallState::Idle;
            inner.remaining_seconds = 0;
            inner.config = None;
            let was_loaded = std::mem::replace(&mut inner.ringtone_loaded, false);
            (was_ringing, was_loaded)
        };

        if was_ringing {
            self.shared.silence().await;
        }
        if was_loaded {
            if let Err(e) = self.shared.ringtone.unload().await {
                log::warn!("Ringtone unload failed: {}", e);
            }
        }
    }
}
