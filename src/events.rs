use crate::types::{LocationSample, Severity, SosEvent, SosTrigger};
use serde::Serialize;
use tokio::sync::broadcast;

/// Everything the core tells the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SafetyEvent {
    LocationUpdated(LocationSample),
    ZoneEntered {
        zone_id: String,
        severity: Severity,
    },
    ZoneExited {
        zone_id: String,
    },
    ZonesRefreshed {
        count: usize,
    },
    ShakeDetected {
        magnitude: f64,
    },
    SosSent(SosEvent),
    SosFailed {
        triggered_by: SosTrigger,
        message: String,
    },
    FakeCallScheduled {
        caller_name: String,
        delay_seconds: u32,
    },
    FakeCallCountdown {
        remaining_seconds: u32,
    },
    FakeCallRinging {
        caller_name: String,
        caller_number: String,
    },
    FakeCallCancelled,
    FakeCallEnded,
    RecordingStarted,
    RecordingTick {
        elapsed_seconds: u64,
    },
    RecordingStopped {
        artifact_uri: Option<String>,
    },
    /// User-facing notice (alert dialog in a UI)
    Notice {
        title: String,
        body: String,
    },
}

impl SafetyEvent {
    pub fn notice(title: impl Into<String>, body: impl Into<String>) -> Self {
        SafetyEvent::Notice {
            title: title.into(),
            body: body.into(),
        }
    }
}

pub type EventSender = broadcast::Sender<SafetyEvent>;

/// Capacity of the event bus; slow subscribers see `Lagged` rather than
/// stalling producers.
pub const EVENT_BUS_CAPACITY: usize = 256;

pub fn event_bus() -> (EventSender, broadcast::Receiver<SafetyEvent>) {
    broadcast::channel(EVENT_BUS_CAPACITY)
}

/// Publish an event. Having no subscriber is not an error.
pub fn emit(tx: &EventSender, event: SafetyEvent) {
    if tx.send(event).is_err() {
        log::trace!("event dropped: no subscribers");
    }
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<SafetyEvent>) -> Vec<SafetyEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
