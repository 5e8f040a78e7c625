use crate::contacts::TrustedContacts;
use crate::error::SafetyError;
use crate::events::{emit, EventSender, SafetyEvent};
use crate::gateway::BackendGateway;
use crate::types::{SosEvent, SosTrigger};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// What happened to one `trigger()` call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SosOutcome {
    Sent(SosEvent),
    Failed {
        triggered_by: SosTrigger,
        message: String,
    },
    /// Another dispatch was already running; nothing was sent
    Coalesced,
}

/// Clears the in-flight flag when dropped, whichever way the dispatch ends
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-flight SOS dispatch
pub struct SosDispatcher {
    gateway: Arc<BackendGateway>,
    contacts: Arc<TrustedContacts>,
    in_flight: AtomicBool,
    sent: AtomicU64,
    events: EventSender,
}

impl SosDispatcher {
    pub fn new(
        gateway: Arc<BackendGateway>,
        contacts: Arc<TrustedContacts>,
        events: EventSender,
    ) -> Self {
        Self {
            gateway,
            contacts,
            in_flight: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            events,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Number of alerts the backend accepted
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Dispatch an SOS unless one is already running.
    ///
    /// The contact refresh is best-effort; its failure never blocks the alert.
    pub async fn trigger(&self, source: SosTrigger) -> SosOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::info!("SOS ({}) ignored: dispatch already in flight", source);
            return SosOutcome::Coalesced;
        }
        let _guard = InFlightGuard(&self.in_flight);

        log::warn!("SOS triggered ({})", source);
        match self.contacts.refresh().await {
            Ok(count) => log::info!("Notifying {} trusted contact(s)", count),
            Err(e) => log::warn!("Could not refresh trusted contacts before SOS: {}", e),
        }

        let outcome = match self.gateway.send_sos().await {
            Ok(ack) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                log::info!("SOS accepted: {}", ack.as_deref().unwrap_or("ok"));
                SosOutcome::Sent(SosEvent {
                    triggered_by: source,
                    dispatched_at: Utc::now(),
                })
            }
            Err(e) => {
                log::error!("SOS dispatch failed: {}", e);
                SosOutcome::Failed {
                    triggered_by: source,
                    message: failure_message(&e),
                }
            }
        };

        match &outcome {
            SosOutcome::Sent(event) => {
                emit(&self.events, SafetyEvent::SosSent(event.clone()));
                emit(
                    &self.events,
                    SafetyEvent::notice(
                        "SOS Sent!",
                        "Your trusted contacts have been notified.",
                    ),
                );
            }
            SosOutcome::Failed {
                triggered_by,
                message,
            } => {
                emit(
                    &self.events,
                    SafetyEvent::SosFailed {
                        triggered_by: *triggered_by,
                        message: message.clone(),
                    },
                );
                emit(&self.events, SafetyEvent::notice("SOS Failed", message.clone()));
            }
            SosOutcome::Coalesced => {}
        }
        outcome
    }
}

fn failure_message(error: &SafetyError) -> String {
    match error {
        SafetyError::NotAuthenticated => "You must be logged in to send an SOS alert.".to_string(),
        SafetyError::Network { status: None, .. } => {
            "Could not connect to the server for SOS. Please try again later.".to_string()
        }
        other => other
            .server_message()
            .map(str::to_string)
            .unwrap_or_else(|| "Could not send SOS alert.".to_string()),
    }
}
