use crate::error::Result;
use crate::events::{emit, EventSender, SafetyEvent};
use crate::gateway::BackendGateway;
use crate::platform::PushService;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

const PERMISSION_NOTICE: &str = "Failed to get push token for push notification! \
Please enable notifications in your device settings.";

/// Registers the device push token with the backend and relays foreground
/// notifications onto the event bus
pub struct PushRegistrar {
    push: Arc<dyn PushService>,
    gateway: Arc<BackendGateway>,
    events: EventSender,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PushRegistrar {
    pub fn new(push: Arc<dyn PushService>, gateway: Arc<BackendGateway>, events: EventSender) -> Self {
        Self {
            push,
            gateway,
            events,
            listener: Mutex::new(None),
        }
    }

    /// Returns the registered token, or `None` when the user refused
    /// notifications (reported as a notice).
    pub async fn register(&self) -> Result<Option<String>> {
        let mut status = self.push.permission_status().await;
        if !status.is_granted() {
            status = self.push.request_permission().await;
        }
        if !status.is_granted() {
            log::warn!("Notification permission not granted");
            emit(&self.events, SafetyEvent::notice("Permission Required", PERMISSION_NOTICE));
            return Ok(None);
        }

        let token = self.push.device_token().await?;
        log::debug!("Push token: {}", token);
        self.gateway.register_push_token(&token).await?;
        log::info!("Push token registered");
        Ok(Some(token))
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .ok()
            .map(|l| l.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Forward foreground notifications as `Notice` events until `stop()`.
    pub async fn listen(&self) -> Result<()> {
        let mut notifications = self.push.foreground_notifications().await?;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            while let Some(n) = notifications.recv().await {
                log::info!("Notification received: {}", n.title);
                emit(&events, SafetyEvent::notice(n.title, n.body));
            }
        });

        if let Ok(mut slot) = self.listener.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        let handle = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
            log::debug!("Notification listener removed");
        }
    }
}

impl Drop for PushRegistrar {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::events::{drain, event_bus};
    use crate::platform::testing::FakePush;
    use crate::platform::PermissionStatus;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> Arc<BackendGateway> {
        Arc::new(BackendGateway::new(&BackendConfig {
            base_url: server.uri(),
            auth_token: Some("tok".into()),
            timeout_secs: 5,
        }))
    }

    #[tokio::test]
    async fn test_register_requests_permission_then_posts_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/notifications/token"))
            .and(header("x-auth-token", "tok"))
            .and(body_json(serde_json::json!({"token": "ExponentPushToken[test]"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"msg": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let push = FakePush::new(PermissionStatus::Undetermined, PermissionStatus::Granted);
        let (tx, _rx) = event_bus();
        let registrar = PushRegistrar::new(push.clone(), gateway(&server), tx);

        let token = registrar.register().await.unwrap();
        assert_eq!(token.as_deref(), Some("ExponentPushToken[test]"));
        assert_eq!(push.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_permission_is_a_notice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let push = FakePush::new(PermissionStatus::Denied, PermissionStatus::Denied);
        let (tx, mut rx) = event_bus();
        let registrar = PushRegistrar::new(push, gateway(&server), tx);

        assert_eq!(registrar.register().await, Ok(None));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [SafetyEvent::Notice { title, .. }] if title == "Permission Required"
        ));
    }

    #[tokio::test]
    async fn test_foreground_notifications_become_notices() {
        let server = MockServer::start().await;
        let push = FakePush::new(PermissionStatus::Granted, PermissionStatus::Granted);
        let (tx, mut rx) = event_bus();
        let registrar = PushRegistrar::new(push.clone(), gateway(&server), tx);

        registrar.listen().await.unwrap();
        assert!(registrar.is_listening());
        assert!(push.deliver("SOS from Asha", "Asha needs help").await);
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SafetyEvent::notice("SOS from Asha", "Asha needs help"));

        registrar.stop();
        registrar.stop();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(!registrar.is_listening());
        assert!(!push.deliver("late", "ignored").await);
    }
}
