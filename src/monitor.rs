//! Top-level composition of the safety components.
//!
//! `SafetyMonitor` owns every session object plus the event bus and wires
//! them together:
//! - every location fix feeds the geofence and kicks a zone refresh
//! - shakes dispatch an SOS
//! - push registration runs once at start
//!
//! `teardown()` releases everything exactly once, whichever path calls it.

use crate::config::SafetyConfig;
use crate::contacts::TrustedContacts;
use crate::error::Result;
use crate::events::{emit, event_bus, EventSender, SafetyEvent};
use crate::fake_call::{FakeCallConfig, FakeCallController};
use crate::gateway::BackendGateway;
use crate::geofence::{GeofenceEngine, ZoneAlert};
use crate::location::LocationTrackingSession;
use crate::notifications::PushRegistrar;
use crate::platform::Platform;
use crate::recording::AudioRecordingSession;
use crate::shake::{ShakeEvent, ShakeWatcher};
use crate::sos::{SosDispatcher, SosOutcome};
use crate::status::{current_timestamp, SafetyStatus};
use crate::types::{LocationSample, SosTrigger};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const ZONE_WARNING: &str = "You are currently in a potentially unsafe area. \
Please be vigilant and consider finding a safer route.";

/// What came up during `start()`. Nothing here is fatal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartReport {
    pub tracking: bool,
    pub background_location: bool,
    pub shake_armed: bool,
    pub push_token: Option<String>,
}

pub struct SafetyMonitor {
    config: SafetyConfig,
    platform: Platform,
    events: EventSender,
    gateway: Arc<BackendGateway>,
    contacts: Arc<TrustedContacts>,
    location: Arc<LocationTrackingSession>,
    geofence: Arc<GeofenceEngine>,
    shake: ShakeWatcher,
    sos: Arc<SosDispatcher>,
    fake_call: FakeCallController,
    recording: AudioRecordingSession,
    push: PushRegistrar,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    zone_refresh: Arc<Mutex<Option<JoinHandle<()>>>>,
    shakes_detected: Arc<AtomicU64>,
    started_at: Instant,
    torn_down: AtomicBool,
}

impl SafetyMonitor {
    pub fn new(config: SafetyConfig, platform: Platform) -> Result<Self> {
        config.validate()?;
        let (events, _) = event_bus();
        let gateway = Arc::new(BackendGateway::new(&config.backend));
        let contacts = Arc::new(TrustedContacts::new(gateway.clone()));

        Ok(Self {
            location: Arc::new(LocationTrackingSession::new(
                platform.location.clone(),
                gateway.clone(),
                config.location.clone(),
                events.clone(),
            )),
            geofence: Arc::new(GeofenceEngine::new(
                config.geofence.alert_mode,
                events.clone(),
            )),
            shake: ShakeWatcher::new(config.shake.clone(), events.clone()),
            sos: Arc::new(SosDispatcher::new(
                gateway.clone(),
                contacts.clone(),
                events.clone(),
            )),
            fake_call: FakeCallController::new(platform.ringtone.clone(), events.clone()),
            recording: AudioRecordingSession::new(platform.recorder.clone(), events.clone()),
            push: PushRegistrar::new(platform.push.clone(), gateway.clone(), events.clone()),
            tasks: Mutex::new(Vec::new()),
            zone_refresh: Arc::new(Mutex::new(None)),
            shakes_detected: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
            torn_down: AtomicBool::new(false),
            config,
            platform,
            events,
            gateway,
            contacts,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn gateway(&self) -> &BackendGateway {
        &self.gateway
    }

    pub fn contacts(&self) -> &TrustedContacts {
        &self.contacts
    }

    pub fn geofence(&self) -> &GeofenceEngine {
        &self.geofence
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Bring every component up. Failures degrade the monitor instead of
    /// aborting it: without location it runs "waiting for location".
    ///
    /// A `teardown()` that lands while a permission prompt is open wins: the
    /// component that was starting is released again and nothing else starts.
    pub async fn start(&self) -> StartReport {
        let mut report = StartReport::default();
        if self.is_torn_down() {
            log::warn!("Monitor already torn down; not starting");
            return report;
        }

        let fixes = self.location.fixes();
        match self.location.start().await {
            Ok(started) => {
                if self.is_torn_down() {
                    self.location.stop();
                    return self.abandon_start(report);
                }
                report.tracking = true;
                report.background_location = started.background_granted;
                self.spawn_zone_watch(fixes);
            }
            Err(e) => log::warn!("Location unavailable ({}); waiting for location", e),
        }

        let (shake_tx, shake_rx) = mpsc::unbounded_channel();
        match self
            .shake
            .subscribe(self.platform.accelerometer.as_ref(), shake_tx)
            .await
        {
            Ok(()) => {
                if self.is_torn_down() {
                    self.shake.unsubscribe();
                    return self.abandon_start(report);
                }
                report.shake_armed = true;
                self.spawn_shake_to_sos(shake_rx);
            }
            Err(e) => log::warn!("Shake detection unavailable: {}", e),
        }

        match self.push.register().await {
            Ok(token) => report.push_token = token,
            Err(e) => log::warn!("Push registration failed: {}", e),
        }
        if let Err(e) = self.push.listen().await {
            log::warn!("Foreground notifications unavailable: {}", e);
        }
        if self.is_torn_down() {
            self.push.stop();
            return self.abandon_start(report);
        }

        log::info!(
            "Safety monitor started (tracking={}, shake={}, push={})",
            report.tracking,
            report.shake_armed,
            report.push_token.is_some()
        );
        report
    }

    fn abandon_start(&self, report: StartReport) -> StartReport {
        log::warn!("Torn down during start; releasing what came up");
        StartReport {
            tracking: false,
            shake_armed: false,
            ..report
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        if self.is_torn_down() {
            handle.abort();
            return;
        }
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => handle.abort(),
        }
    }

    /// Every fix is checked against the current zones, in delivery order.
    /// With a token present each fix also kicks a zone refresh; the fetch
    /// runs on its own task so a slow backend never delays evaluation.
    fn spawn_zone_watch(&self, mut fixes: mpsc::UnboundedReceiver<LocationSample>) {
        let geofence = self.geofence.clone();
        let gateway = self.gateway.clone();
        let events = self.events.clone();
        let zone_refresh = self.zone_refresh.clone();

        self.track(tokio::spawn(async move {
            while let Some(sample) = fixes.recv().await {
                if let Some(alert) = geofence.on_position(sample.coords) {
                    warn_zone(&events, &alert);
                }
                if !gateway.is_authenticated() {
                    log::debug!("No auth token; skipping danger zone refresh");
                    continue;
                }
                kick_zone_refresh(&zone_refresh, &geofence, &gateway, &events);
            }
        }));
    }

    fn spawn_shake_to_sos(&self, mut shakes: mpsc::UnboundedReceiver<ShakeEvent>) {
        let sos = self.sos.clone();
        let counter = self.shakes_detected.clone();
        self.track(tokio::spawn(async move {
            while let Some(shake) = shakes.recv().await {
                counter.fetch_add(1, Ordering::Relaxed);
                log::warn!("Shake ({:.2}) -> SOS", shake.magnitude);
                // dispatched on its own task so a shake during an in-flight
                // alert is coalesced rather than queued
                let sos = sos.clone();
                tokio::spawn(async move {
                    sos.trigger(SosTrigger::Shake).await;
                });
            }
        }));
    }

    pub async fn trigger_sos(&self) -> SosOutcome {
        self.sos.trigger(SosTrigger::Manual).await
    }

    pub fn schedule_fake_call(&self, config: FakeCallConfig) -> Result<()> {
        self.fake_call.schedule(config)
    }

    pub fn cancel_fake_call(&self) -> bool {
        self.fake_call.cancel()
    }

    pub async fn accept_fake_call(&self) -> bool {
        self.fake_call.accept().await
    }

    pub async fn decline_fake_call(&self) -> bool {
        self.fake_call.decline().await
    }

    pub async fn start_recording(&self) -> Result<()> {
        self.recording.start().await
    }

    pub async fn stop_recording(&self) -> Result<Option<String>> {
        self.recording.stop().await
    }

    /// Open the dialer on the emergency number. Returns false (after a
    /// notice) on devices that cannot place calls.
    pub async fn call_emergency(&self) -> Result<bool> {
        let uri = format!("tel:{}", self.config.emergency_number);
        if !self.platform.dialer.can_open(&uri).await {
            log::warn!("Dialer cannot open {}", uri);
            emit(
                &self.events,
                SafetyEvent::notice(
                    "Error",
                    "Phone call not supported on this device or emulator.",
                ),
            );
            return Ok(false);
        }
        log::info!("Dialing {}", uri);
        self.platform.dialer.open(&uri).await?;
        Ok(true)
    }

    /// Fetch danger zones now and re-check the last known position
    pub async fn refresh_zones(&self) -> Result<usize> {
        let refresh = self.geofence.refresh(&self.gateway).await?;
        if let Some(alert) = &refresh.alert {
            warn_zone(&self.events, alert);
        }
        Ok(refresh.count)
    }

    pub fn status(&self) -> SafetyStatus {
        let position = self.location.current().map(|s| s.coords);
        let current_zone = self.geofence.current_zone();
        let call = self.fake_call.session();
        let recording = self.recording.snapshot();

        SafetyStatus {
            timestamp: current_timestamp(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            authenticated: self.gateway.is_authenticated(),
            tracking: self.location.is_tracking(),
            waiting_for_location: position.is_none(),
            position,
            location_fixes: self.location.delivered_count(),
            in_danger_zone: current_zone.is_some(),
            current_zone,
            zone_count: self.geofence.snapshot().len(),
            shake_armed: self.shake.is_subscribed(),
            sos_in_flight: self.sos.is_in_flight(),
            sos_sent: self.sos.sent_count(),
            shakes_detected: self.shakes_detected.load(Ordering::Relaxed),
            fake_call_state: call.state,
            fake_call_remaining_seconds: call.remaining_seconds,
            recording_state: recording.state,
            recording_elapsed_seconds: recording.elapsed_seconds,
            recording_artifact: recording.artifact_uri,
        }
    }

    /// Release every subscription, timer and native resource. Only the first
    /// call does anything.
    pub async fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            log::debug!("Teardown already done");
            return false;
        }

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
        if let Some(task) = lock_slot(&self.zone_refresh).take() {
            task.abort();
        }

        self.location.stop();
        self.shake.unsubscribe();
        self.push.stop();
        self.fake_call.teardown().await;
        self.recording.teardown().await;
        log::info!("Safety monitor torn down");
        true
    }
}

fn lock_slot(slot: &Mutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Start a zone fetch unless one is already running. The running fetch
/// re-checks the newest position when it lands, so skipping loses nothing.
fn kick_zone_refresh(
    slot: &Mutex<Option<JoinHandle<()>>>,
    geofence: &Arc<GeofenceEngine>,
    gateway: &Arc<BackendGateway>,
    events: &EventSender,
) {
    let mut running = lock_slot(slot);
    if running.as_ref().is_some_and(|task| !task.is_finished()) {
        log::trace!("Danger zone refresh already in flight");
        return;
    }

    let geofence = geofence.clone();
    let gateway = gateway.clone();
    let events = events.clone();
    *running = Some(tokio::spawn(async move {
        match geofence.refresh(&gateway).await {
            Ok(refresh) => {
                if let Some(alert) = refresh.alert {
                    warn_zone(&events, &alert);
                }
            }
            Err(e) => log::warn!("Danger zone refresh failed: {}", e),
        }
    }));
}

fn warn_zone(events: &EventSender, alert: &ZoneAlert) {
    log::warn!("Zone alert {} ({})", alert.zone_id, alert.severity);
    emit(events, SafetyEvent::notice("WARNING!", ZONE_WARNING));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::error::SafetyError;
    use crate::events::drain;
    use crate::platform::testing::{FakeDialer, FakeLocation, Fakes};
    use crate::platform::PermissionStatus;
    use crate::types::{LocationSample, ShakeSample};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tokio::sync::Notify;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> SafetyConfig {
        SafetyConfig {
            backend: BackendConfig {
                base_url: server.uri(),
                auth_token: Some("tok".into()),
                timeout_secs: 5,
            },
            ..SafetyConfig::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    async fn mount_ok(server: &MockServer, verb: &str, route: &str, body: serde_json::Value) {
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_location_denied_runs_degraded() {
        let server = MockServer::start().await;
        let mut fakes = Fakes::all_granted();
        fakes.location = FakeLocation::new(PermissionStatus::Denied, PermissionStatus::Denied);
        let monitor = SafetyMonitor::new(config(&server), fakes.platform()).unwrap();

        let report = monitor.start().await;
        assert!(!report.tracking);
        assert!(report.shake_armed);

        let status = monitor.status();
        assert!(status.waiting_for_location);
        assert!(!status.tracking);
        monitor.teardown().await;
    }

    #[tokio::test]
    async fn test_fix_inside_zone_raises_warning() {
        let server = MockServer::start().await;
        mount_ok(&server, "PUT", "/api/safety/location", serde_json::json!({"location": {}})).await;
        mount_ok(&server, "POST", "/api/notifications/token", serde_json::json!({"msg": "ok"})).await;
        mount_ok(
            &server,
            "GET",
            "/api/dangerzones",
            serde_json::json!([{
                "_id": "z1",
                "coordinates": [[10.0, 10.0], [10.0, 20.0], [20.0, 20.0], [20.0, 10.0]],
                "severity": "high"
            }]),
        )
        .await;

        let fakes = Fakes::all_granted();
        let monitor = SafetyMonitor::new(config(&server), fakes.platform()).unwrap();
        let mut rx = monitor.subscribe();
        let report = monitor.start().await;
        assert!(report.tracking);
        assert_eq!(report.push_token.as_deref(), Some("ExponentPushToken[test]"));

        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(fakes.location.emit(LocationSample::new(15.0, 15.0, at)).await);
        settle().await;

        assert_eq!(monitor.geofence().current_zone().as_deref(), Some("z1"));
        let status = monitor.status();
        assert!(status.in_danger_zone);
        assert_eq!(status.zone_count, 1);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SafetyEvent::Notice { title, .. } if title == "WARNING!"
        )));
        monitor.teardown().await;
    }

    #[tokio::test]
    async fn test_slow_zone_fetch_does_not_skip_fixes() {
        let server = MockServer::start().await;
        mount_ok(&server, "PUT", "/api/safety/location", serde_json::json!({"location": {}})).await;
        mount_ok(&server, "POST", "/api/notifications/token", serde_json::json!({"msg": "ok"})).await;
        Mock::given(method("GET"))
            .and(path("/api/dangerzones"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{
                        "_id": "z1",
                        "coordinates": [[10.0, 10.0], [10.0, 20.0], [20.0, 20.0], [20.0, 10.0]],
                        "severity": "high"
                    }]))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let fakes = Fakes::all_granted();
        let monitor = SafetyMonitor::new(config(&server), fakes.platform()).unwrap();
        assert_eq!(monitor.refresh_zones().await, Ok(1));
        let mut rx = monitor.subscribe();
        assert!(monitor.start().await.tracking);

        // outside, inside, outside again while the first fix's zone fetch is
        // still waiting on the backend
        let at = |s: i64| Utc.timestamp_opt(1_700_000_000 + s, 0).unwrap();
        for (i, (lat, lng)) in [(5.0, 5.0), (15.0, 15.0), (5.0, 5.5)].into_iter().enumerate() {
            assert!(fakes.location.emit(LocationSample::new(lat, lng, at(6 * i as i64))).await);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let events = drain(&mut rx);
        let entered = events
            .iter()
            .filter(|e| matches!(e, SafetyEvent::ZoneEntered { zone_id, .. } if zone_id == "z1"))
            .count();
        let exited = events
            .iter()
            .filter(|e| matches!(e, SafetyEvent::ZoneExited { .. }))
            .count();
        assert_eq!(monitor.status().location_fixes, 3);
        assert_eq!(entered, 1);
        assert_eq!(exited, 1);
        assert!(events.iter().any(|e| matches!(
            e,
            SafetyEvent::Notice { title, .. } if title == "WARNING!"
        )));
        assert_eq!(monitor.geofence().current_zone(), None);
        monitor.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_during_location_prompt_leaves_nothing_running() {
        let server = MockServer::start().await;
        let fakes = Fakes::all_granted();
        let gate = Arc::new(Notify::new());
        *fakes.location.prompt_gate.lock().unwrap() = Some(gate.clone());
        let monitor = Arc::new(SafetyMonitor::new(config(&server), fakes.platform()).unwrap());

        let starting = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.start().await }
        });
        tokio::task::yield_now().await;

        assert!(monitor.teardown().await);
        gate.notify_one();
        let report = starting.await.unwrap();
        assert!(!report.tracking);
        assert!(!report.shake_armed);
        settle().await;

        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(!fakes.location.emit(LocationSample::new(1.0, 1.0, at)).await);
        assert!(!fakes.accelerometer.emit(ShakeSample::new(9.0, 0.0, 0.0, at)).await);
        let status = monitor.status();
        assert!(!status.tracking);
        assert!(!status.shake_armed);
    }

    #[tokio::test]
    async fn test_recording_refused_after_teardown() {
        let server = MockServer::start().await;
        let fakes = Fakes::all_granted();
        let monitor = SafetyMonitor::new(config(&server), fakes.platform()).unwrap();
        monitor.teardown().await;
        assert_eq!(
            monitor.start_recording().await,
            Err(SafetyError::ShutDown("Recording"))
        );
        assert_eq!(fakes.recorder.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shake_dispatches_one_sos() {
        let server = MockServer::start().await;
        mount_ok(&server, "GET", "/api/safety/trusted-contacts", serde_json::json!([])).await;
        Mock::given(method("POST"))
            .and(path("/api/safety/sos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"msg": "sent"})))
            .expect(1)
            .mount(&server)
            .await;

        let fakes = Fakes::all_granted();
        let monitor = SafetyMonitor::new(config(&server), fakes.platform()).unwrap();
        monitor.start().await;

        let at = |ms: i64| Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap();
        assert!(fakes.accelerometer.emit(ShakeSample::new(3.0, 0.0, 0.0, at(0))).await);
        assert!(fakes.accelerometer.emit(ShakeSample::new(3.0, 0.0, 0.0, at(500))).await);
        settle().await;

        let status = monitor.status();
        assert_eq!(status.shakes_detected, 1);
        assert_eq!(status.sos_sent, 1);
        monitor.teardown().await;
    }

    #[tokio::test]
    async fn test_call_emergency() {
        let server = MockServer::start().await;
        let fakes = Fakes::all_granted();
        let monitor = SafetyMonitor::new(config(&server), fakes.platform()).unwrap();
        assert_eq!(monitor.call_emergency().await, Ok(true));
        assert_eq!(*fakes.dialer.opened.lock().unwrap(), vec!["tel:100".to_string()]);

        let mut fakes = Fakes::all_granted();
        fakes.dialer = FakeDialer::new(false);
        let monitor = SafetyMonitor::new(config(&server), fakes.platform()).unwrap();
        let mut rx = monitor.subscribe();
        assert_eq!(monitor.call_emergency().await, Ok(false));
        assert!(fakes.dialer.opened.lock().unwrap().is_empty());
        assert!(matches!(drain(&mut rx).as_slice(), [SafetyEvent::Notice { .. }]));
    }

    #[tokio::test]
    async fn test_teardown_runs_once_and_releases_everything() {
        let server = MockServer::start().await;
        let fakes = Fakes::all_granted();
        let monitor = SafetyMonitor::new(config(&server), fakes.platform()).unwrap();
        monitor.start().await;
        monitor
            .schedule_fake_call(FakeCallConfig {
                caller_name: "Mom".into(),
                caller_number: "+91 00000".into(),
                delay_seconds: 30,
            })
            .unwrap();
        monitor.start_recording().await.unwrap();

        assert!(monitor.teardown().await);
        assert!(!monitor.teardown().await);
        settle().await;

        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(!fakes.location.emit(LocationSample::new(1.0, 1.0, at)).await);
        assert!(!fakes.accelerometer.emit(ShakeSample::new(9.0, 0.0, 0.0, at)).await);
        assert!(!fakes.push.deliver("t", "b").await);

        let status = monitor.status();
        assert_eq!(status.fake_call_state, crate::fake_call::FakeCallState::Idle);
        assert_eq!(status.recording_state, crate::recording::RecordingState::Stopped);
        assert!(monitor.is_torn_down());
        assert!(!monitor.start().await.tracking);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let fakes = Fakes::all_granted();
        let mut config = SafetyConfig::default();
        config.backend.base_url = String::new();
        assert!(matches!(
            SafetyMonitor::new(config, fakes.platform()),
            Err(SafetyError::Config(_))
        ));
    }
}
