use crate::error::{Result, SafetyError};
use crate::gateway::{BackendGateway, ContactPayload};
use crate::types::TrustedContact;
use std::sync::{Arc, RwLock};

/// Contact form input before it is sent to the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactDraft {
    pub name: String,
    pub phone: String,
    pub email: String,
}

impl ContactDraft {
    /// A name plus at least one way to reach the person
    pub fn validate(&self) -> Result<ContactPayload> {
        let name = self.name.trim();
        let phone = self.phone.trim();
        let email = self.email.trim();
        if name.is_empty() || (phone.is_empty() && email.is_empty()) {
            return Err(SafetyError::Validation(
                "Name and at least one of Phone or Email are required.".to_string(),
            ));
        }
        Ok(ContactPayload {
            name: name.to_string(),
            phone: phone.to_string(),
            email: email.to_string(),
        })
    }
}

/// Latest known trusted-contact list plus CRUD over the backend
pub struct TrustedContacts {
    gateway: Arc<BackendGateway>,
    list: RwLock<Arc<Vec<TrustedContact>>>,
}

impl TrustedContacts {
    pub fn new(gateway: Arc<BackendGateway>) -> Self {
        Self {
            gateway,
            list: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<TrustedContact>> {
        match self.list.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-fetch the list; on failure the previous list is kept.
    pub async fn refresh(&self) -> Result<usize> {
        let contacts = self.gateway.fetch_trusted_contacts().await?;
        let count = contacts.len();
        let fresh = Arc::new(contacts);
        match self.list.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        log::debug!("Trusted contacts refreshed: {}", count);
        Ok(count)
    }

    pub async fn add(&self, draft: &ContactDraft) -> Result<()> {
        let payload = draft.validate()?;
        self.gateway.add_contact(&payload).await?;
        self.refresh_after_change().await;
        Ok(())
    }

    pub async fn update(&self, id: &str, draft: &ContactDraft) -> Result<()> {
        let payload = draft.validate()?;
        self.gateway.update_contact(id, &payload).await?;
        self.refresh_after_change().await;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.gateway.delete_contact(id).await?;
        self.refresh_after_change().await;
        Ok(())
    }

    async fn refresh_after_change(&self) {
        if let Err(e) = self.refresh().await {
            log::warn!("Contact saved but list refresh failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn draft(name: &str, phone: &str, email: &str) -> ContactDraft {
        ContactDraft {
            name: name.into(),
            phone: phone.into(),
            email: email.into(),
        }
    }

    #[test]
    fn test_draft_validation() {
        assert!(draft("Asha", "+91000", "").validate().is_ok());
        assert!(draft("Asha", "", "a@example.com").validate().is_ok());
        assert!(matches!(
            draft("Asha", "", "").validate(),
            Err(SafetyError::Validation(_))
        ));
        assert!(matches!(
            draft("  ", "+91000", "").validate(),
            Err(SafetyError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_add_posts_and_refreshes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/safety/trusted-contacts"))
            .and(body_json(serde_json::json!({"name": "Asha", "phone": "+91000", "email": ""})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/safety/trusted-contacts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"_id": "c1", "name": "Asha", "phone": "+91000"}
            ])))
            .mount(&server)
            .await;

        let gateway = Arc::new(BackendGateway::new(&BackendConfig {
            base_url: server.uri(),
            auth_token: Some("tok".into()),
            timeout_secs: 5,
        }));
        let contacts = TrustedContacts::new(gateway);
        contacts.add(&draft(" Asha ", "+91000", "")).await.unwrap();
        assert_eq!(contacts.snapshot().len(), 1);
        assert_eq!(contacts.snapshot()[0].name, "Asha");
    }

    #[tokio::test]
    async fn test_invalid_draft_never_reaches_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let gateway = Arc::new(BackendGateway::new(&BackendConfig {
            base_url: server.uri(),
            auth_token: Some("tok".into()),
            timeout_secs: 5,
        }));
        let contacts = TrustedContacts::new(gateway);
        assert!(contacts.add(&draft("Asha", "", "")).await.is_err());
    }
}
