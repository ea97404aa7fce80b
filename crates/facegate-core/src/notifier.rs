//! `EditPerson` commands announcing newly registered identities to the fleet.

use crate::backend::{PublishError, Publisher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const EDIT_PERSON_OPERATOR: &str = "EditPerson";

/// Command envelope understood by the cameras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPersonCommand {
    pub message_id: String,
    pub operator: String,
    pub info: EditPersonInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPersonInfo {
    pub custom_id: String,
    pub name: String,
    /// 0 = ordinary person on the device whitelist.
    pub person_type: u8,
    #[serde(rename = "picURI")]
    pub pic_uri: String,
}

/// Best-effort publisher of `EditPerson` commands.
#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn Publisher>,
    public_base_url: String,
    timeout: Duration,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn Publisher>, public_base_url: &str, timeout: Duration) -> Self {
        Self {
            publisher,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Absolute URL the cameras download the registration photo from.
    pub fn public_url(&self, public_path: &str) -> String {
        format!(
            "{}/{}",
            self.public_base_url,
            public_path.trim_start_matches('/')
        )
    }

    pub fn command(&self, identifier: &str, display_name: &str, public_path: &str) -> EditPersonCommand {
        EditPersonCommand {
            message_id: Uuid::new_v4().simple().to_string(),
            operator: EDIT_PERSON_OPERATOR.to_string(),
            info: EditPersonInfo {
                custom_id: identifier.to_string(),
                name: display_name.to_string(),
                person_type: 0,
                pic_uri: self.public_url(public_path),
            },
        }
    }

    /// Publish an `EditPerson` command on `topic`. Never fails the caller:
    /// errors are logged and reported as `false`.
    pub async fn announce(
        &self,
        topic: &str,
        identifier: &str,
        display_name: &str,
        public_path: &str,
    ) -> bool {
        let command = self.command(identifier, display_name, public_path);
        match self.send(topic, &command).await {
            Ok(()) => {
                tracing::info!(topic, custom_id = identifier, message_id = %command.message_id, "EditPerson published");
                true
            }
            Err(e) => {
                tracing::warn!(topic, custom_id = identifier, error = %e, "EditPerson publish failed");
                false
            }
        }
    }

    async fn send(&self, topic: &str, command: &EditPersonCommand) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(command)?;
        tokio::time::timeout(self.timeout, self.publisher.publish(topic, payload))
            .await
            .unwrap_or(Err(PublishError::Timeout(self.timeout)))
    }
}
