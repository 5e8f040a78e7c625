use crate::config::ShakeConfig;
use crate::error::Result;
use crate::events::{emit, EventSender, SafetyEvent};
use crate::platform::Accelerometer;
use crate::types::ShakeSample;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone, Debug, PartialEq)]
pub struct ShakeEvent {
    pub magnitude: f64,
    pub detected_at: DateTime<Utc>,
}

/// Threshold + cooldown debounce over accelerometer magnitude
pub struct ShakeDetector {
    threshold: f64,
    cooldown: ChronoDuration,
    last_trigger: Option<DateTime<Utc>>,
}

impl ShakeDetector {
    pub fn new(config: &ShakeConfig) -> Self {
        Self {
            threshold: config.threshold,
            cooldown: ChronoDuration::milliseconds(config.cooldown_ms as i64),
            last_trigger: None,
        }
    }

    /// Feed one sample. Fires when the magnitude exceeds the threshold and the
    /// previous trigger is more than one cooldown old; every other crossing
    /// inside the window is swallowed.
    pub fn process(&mut self, sample: &ShakeSample) -> Option<ShakeEvent> {
        let magnitude = sample.magnitude();
        if magnitude <= self.threshold {
            return None;
        }

        let now = sample.captured_at;
        if let Some(last) = self.last_trigger {
            if now - last <= self.cooldown {
                return None;
            }
        }

        self.last_trigger = Some(now);
        Some(ShakeEvent {
            magnitude,
            detected_at: now,
        })
    }
}

/// Owns the accelerometer subscription that feeds a `ShakeDetector`
pub struct ShakeWatcher {
    config: ShakeConfig,
    events: EventSender,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ShakeWatcher {
    pub fn new(config: ShakeConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            task: Mutex::new(None),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.task
            .lock()
            .ok()
            .map(|t| t.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Start sampling. Detected shakes are published on the event bus and sent
    /// to `shakes`. A second subscribe replaces the first.
    pub async fn subscribe(
        &self,
        accelerometer: &dyn Accelerometer,
        shakes: mpsc::UnboundedSender<ShakeEvent>,
    ) -> Result<()> {
        let mut samples = accelerometer
            .subscribe(self.config.sample_interval())
            .await?;
        let mut detector = ShakeDetector::new(&self.config);
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let mut sample_count = 0u64;
            while let Some(sample) = samples.recv().await {
                sample_count += 1;
                if sample_count % 600 == 0 {
                    log::debug!("[shake] {} samples", sample_count);
                }
                if let Some(shake) = detector.process(&sample) {
                    log::info!("Shake detected (magnitude {:.2})", shake.magnitude);
                    emit(
                        &events,
                        SafetyEvent::ShakeDetected {
                            magnitude: shake.magnitude,
                        },
                    );
                    if shakes.send(shake).is_err() {
                        log::debug!("[shake] no listener for shake events");
                    }
                }
            }
            log::debug!("[shake] accelerometer stream closed after {} samples", sample_count);
        });

        if let Ok(mut slot) = self.task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
        Ok(())
    }

    /// Stop sampling; safe to call any number of times
    pub fn unsubscribe(&self) {
        let handle = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            // aborting drops the receiver, which releases the sensor listener
            handle.abort();
            log::info!("Accelerometer unsubscribed");
        }
    }
}

impl Drop for ShakeWatcher {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bus;
    use crate::platform::testing::FakeAccelerometer;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    /// Sample with the given magnitude along x
    fn sample(magnitude: f64, ms: i64) -> ShakeSample {
        ShakeSample::new(magnitude, 0.0, 0.0, at_ms(ms))
    }

    #[test]
    fn test_cooldown_swallows_second_shake() {
        let mut detector = ShakeDetector::new(&ShakeConfig::default());
        let fired: Vec<_> = [sample(3.0, 0), sample(3.0, 500)]
            .iter()
            .filter_map(|s| detector.process(s))
            .collect();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].detected_at, at_ms(0));
    }

    #[test]
    fn test_fires_again_after_cooldown() {
        let mut detector = ShakeDetector::new(&ShakeConfig::default());
        assert!(detector.process(&sample(3.0, 0)).is_some());
        assert!(detector.process(&sample(3.0, 2900)).is_none());
        // exactly one cooldown later is still inside the window
        assert!(detector.process(&sample(3.0, 3000)).is_none());
        assert!(detector.process(&sample(3.0, 3001)).is_some());
    }

    #[test]
    fn test_below_threshold_never_fires() {
        let mut detector = ShakeDetector::new(&ShakeConfig::default());
        assert!(detector.process(&sample(2.0, 0)).is_none());
        assert!(detector.process(&sample(1.0, 10_000)).is_none());
        // a swallowed sample does not arm the cooldown
        assert!(detector.process(&sample(2.5, 10_100)).is_some());
    }

    #[test]
    fn test_magnitude_uses_all_axes() {
        let mut detector = ShakeDetector::new(&ShakeConfig::default());
        // each axis below threshold, combined magnitude ~2.54
        let s = ShakeSample::new(1.5, 1.5, 1.4, at_ms(0));
        assert!(detector.process(&s).is_some());
    }

    #[tokio::test]
    async fn test_watcher_forwards_and_unsubscribes() {
        let (tx, _rx) = event_bus();
        let accel = FakeAccelerometer::default();
        let watcher = ShakeWatcher::new(ShakeConfig::default(), tx);
        let (shake_tx, mut shake_rx) = mpsc::unbounded_channel();

        watcher.subscribe(&accel, shake_tx).await.unwrap();
        assert!(watcher.is_subscribed());

        assert!(accel.emit(sample(3.0, 0)).await);
        assert!(accel.emit(sample(3.0, 500)).await);
        let shake = tokio::time::timeout(Duration::from_secs(1), shake_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shake.magnitude, 3.0);

        watcher.unsubscribe();
        watcher.unsubscribe();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(!watcher.is_subscribed());
        assert!(!accel.emit(sample(3.0, 10_000)).await);
        assert!(shake_rx.try_recv().is_err());
    }
}
