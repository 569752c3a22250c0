use async_trait::async_trait;
use serde::Deserialize;

use crate::gateway::{DeliveryReceipt, GatewayError, NotificationGateway};

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// SMS gateway backed by the Twilio Messages API.
///
/// Messages are sent through a messaging service, so the sender number is
/// picked by Twilio.
#[derive(Clone)]
pub struct Twilio {
    client: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
    messaging_service_sid: String,
}

impl Twilio {
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        messaging_service_sid: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: API_BASE.to_owned(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            messaging_service_sid: messaging_service_sid.into(),
        }
    }

    /// Point the client at another API root, e.g. a local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.base_url.trim_end_matches('/'),
            self.account_sid
        )
    }
}

#[derive(Deserialize)]
struct MessageResource {
    sid: String,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[async_trait]
impl NotificationGateway for Twilio {
    #[tracing::instrument(skip(self, body))]
    async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, GatewayError> {
        let params = [
            ("To", to),
            ("MessagingServiceSid", self.messaging_service_sid.as_str()),
            ("Body", body),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(GatewayError::request)?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ApiError>().await {
                Ok(err) => err.message,
                Err(_) => status.canonical_reason().unwrap_or("unknown").to_owned(),
            };
            return Err(GatewayError::rejected(status.as_u16(), message));
        }

        let resource: MessageResource = response.json().await.map_err(GatewayError::response)?;
        Ok(DeliveryReceipt { id: resource.sid })
    }
}
