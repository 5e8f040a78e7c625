use crate::config::LocationConfig;
use crate::error::{Capability, Result, SafetyError};
use crate::events::{emit, EventSender, SafetyEvent};
use crate::gateway::BackendGateway;
use crate::platform::{LocationProvider, WatchOptions};
use crate::types::LocationSample;
use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type FixListeners = Arc<Mutex<Vec<mpsc::UnboundedSender<LocationSample>>>>;

/// Drops samples until both the time and the distance since the last
/// delivered sample reach their minimums. The first sample always passes.
#[derive(Debug, Clone)]
pub struct SampleThrottle {
    min_interval: ChronoDuration,
    min_distance_m: f64,
    last_delivered: Option<LocationSample>,
}

impl SampleThrottle {
    pub fn new(config: &LocationConfig) -> Self {
        Self {
            min_interval: ChronoDuration::milliseconds(config.min_interval_ms as i64),
            min_distance_m: config.min_distance_m,
            last_delivered: None,
        }
    }

    pub fn admit(&mut self, sample: &LocationSample) -> bool {
        if let Some(last) = &self.last_delivered {
            let elapsed = sample.captured_at - last.captured_at;
            if elapsed < self.min_interval {
                return false;
            }
            if sample.coords.distance_m(&last.coords) < self.min_distance_m {
                return false;
            }
        }
        self.last_delivered = Some(sample.clone());
        true
    }
}

/// Outcome of a successful `start()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingStarted {
    /// Background permission is an enhancement only
    pub background_granted: bool,
}

/// Foreground location watch that publishes the latest fix and forwards each
/// delivered fix to the backend
pub struct LocationTrackingSession {
    provider: Arc<dyn LocationProvider>,
    gateway: Arc<BackendGateway>,
    config: LocationConfig,
    current: Arc<watch::Sender<Option<LocationSample>>>,
    listeners: FixListeners,
    events: EventSender,
    subscription: Mutex<Option<JoinHandle<()>>>,
    delivered: Arc<AtomicU64>,
    background_granted: AtomicBool,
}

impl LocationTrackingSession {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        gateway: Arc<BackendGateway>,
        config: LocationConfig,
        events: EventSender,
    ) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            provider,
            gateway,
            config,
            current: Arc::new(current),
            listeners: Arc::new(Mutex::new(Vec::new())),
            events,
            subscription: Mutex::new(None),
            delivered: Arc::new(AtomicU64::new(0)),
            background_granted: AtomicBool::new(false),
        }
    }

    /// Latest delivered fix, if any
    pub fn current(&self) -> Option<LocationSample> {
        self.current.borrow().clone()
    }

    /// Receiver that observes replacements of the current fix. Fixes that
    /// land between two reads collapse into the newest.
    pub fn subscribe(&self) -> watch::Receiver<Option<LocationSample>> {
        self.current.subscribe()
    }

    /// Every delivered fix, in order and without coalescing. Dropping the
    /// receiver unregisters it.
    pub fn fixes(&self) -> mpsc::UnboundedReceiver<LocationSample> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    pub fn is_tracking(&self) -> bool {
        self.subscription
            .lock()
            .ok()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Ask for permissions and begin watching.
    ///
    /// Returns `PermissionDenied` when foreground access is refused, in which
    /// case nothing is subscribed. Calling `start()` while already tracking is
    /// a no-op.
    pub async fn start(&self) -> Result<TrackingStarted> {
        if self.is_tracking() {
            log::debug!("Location tracking already running");
            return Ok(TrackingStarted {
                background_granted: self.background_granted.load(Ordering::Relaxed),
            });
        }

        if !self.provider.request_foreground_permission().await.is_granted() {
            log::warn!("Location permission denied");
            emit(
                &self.events,
                SafetyEvent::notice(
                    "Location Permission Required",
                    "Please grant location access to use safety features.",
                ),
            );
            return Err(SafetyError::PermissionDenied(Capability::Location));
        }

        let background_granted = self
            .provider
            .request_background_permission()
            .await
            .is_granted();
        self.background_granted
            .store(background_granted, Ordering::Relaxed);
        if !background_granted {
            log::info!("Background location not granted; tracking in foreground only");
            emit(
                &self.events,
                SafetyEvent::notice(
                    "Background Location Permission",
                    "Background location is recommended for continuous tracking even when the app is closed.",
                ),
            );
        }

        let options = WatchOptions {
            min_interval: self.config.min_interval(),
            min_distance_m: self.config.min_distance_m,
        };
        let mut stream = self.provider.watch_position(options).await?;

        let mut throttle = SampleThrottle::new(&self.config);
        let current = self.current.clone();
        let listeners = self.listeners.clone();
        let gateway = self.gateway.clone();
        let events = self.events.clone();
        let delivered = self.delivered.clone();

        let handle = tokio::spawn(async move {
            while let Some(sample) = stream.recv().await {
                if !throttle.admit(&sample) {
                    log::trace!("Location sample throttled");
                    continue;
                }
                delivered.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Location fix {:.6}, {:.6}",
                    sample.coords.latitude,
                    sample.coords.longitude
                );
                current.send_replace(Some(sample.clone()));
                if let Ok(mut listeners) = listeners.lock() {
                    listeners.retain(|tx| tx.send(sample.clone()).is_ok());
                }
                emit(&events, SafetyEvent::LocationUpdated(sample.clone()));

                // fire and forget: the stream never waits on the network
                let gateway = gateway.clone();
                let coords = sample.coords;
                tokio::spawn(async move {
                    if let Err(e) = gateway.push_location(coords).await {
                        log::warn!("Location push failed: {}", e);
                    }
                });
            }
            log::debug!("Location stream ended");
        });

        match self.subscription.lock() {
            Ok(mut slot) => {
                if let Some(previous) = slot.replace(handle) {
                    previous.abort();
                }
            }
            Err(_) => {
                handle.abort();
                return Err(SafetyError::Platform("location session lock poisoned".into()));
            }
        }
        log::info!("Location tracking started");
        Ok(TrackingStarted { background_granted })
    }

    /// Release the watch; no-op when not running
    pub fn stop(&self) {
        let handle = self.subscription.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = handle {
            handle.abort();
            log::info!("Location tracking stopped");
        }
    }
}

impl Drop for LocationTrackingSession {
    fn drop(&mut self) {
        self.stop();
    }
}
