use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Pub/Sub push body carrying a Cloud Storage change notification.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default, alias = "message_id")]
    pub message_id: Option<String>,
}

/// The object a notification is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    #[serde(default)]
    pub bucket: String,
    pub name: String,
}

impl PushEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|err| StoreError::InvalidPayload(format!("malformed push envelope: {err}")))
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message.message_id.as_deref()
    }

    /// Decodes `data` (base64 JSON `{bucket, name}`), falling back to the
    /// `bucketId` / `objectId` attributes Cloud Storage sets on every
    /// notification.
    pub fn decode(&self) -> Result<ChangeNotification> {
        if let Some(data) = self.message.data.as_deref().filter(|data| !data.is_empty()) {
            let bytes = STANDARD.decode(data.trim()).map_err(|err| {
                StoreError::InvalidPayload(format!("message data is not base64: {err}"))
            })?;
            let notification: ChangeNotification = serde_json::from_slice(&bytes).map_err(|err| {
                StoreError::InvalidPayload(format!("message data is not a notification: {err}"))
            })?;
            if notification.name.is_empty() {
                return Err(StoreError::InvalidPayload(
                    "notification has an empty object name".into(),
                ));
            }
            return Ok(notification);
        }

        let attributes = &self.message.attributes;
        match attributes.get("objectId").filter(|name| !name.is_empty()) {
            Some(name) => Ok(ChangeNotification {
                bucket: attributes.get("bucketId").cloned().unwrap_or_default(),
                name: name.clone(),
            }),
            None => Err(StoreError::InvalidPayload(
                "message carries neither data nor an objectId attribute".into(),
            )),
        }
    }
}

/// Builds the push body a subscription would deliver for `notification`.
pub fn encode_push(notification: &ChangeNotification, message_id: &str) -> Result<Vec<u8>> {
    let data = STANDARD.encode(serde_json::to_vec(notification)?);
    let envelope = serde_json::json!({
        "message": {
            "data": data,
            "messageId": message_id,
            "attributes": {
                "bucketId": notification.bucket,
                "objectId": notification.name,
            },
        },
        "subscription": "projects/local/subscriptions/bucketdb",
    });
    Ok(serde_json::to_vec(&envelope)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_base64_data() {
        let data = STANDARD.encode(br#"{"bucket":"ventures-dev","name":"env/dev/snapshots/ideas/I1.json","size":"12"}"#);
        let body = serde_json::to_vec(&json!({
            "message": { "data": data, "messageId": "42" },
            "subscription": "projects/p/subscriptions/indices"
        }))
        .unwrap();
        let envelope = PushEnvelope::parse(&body).unwrap();
        assert_eq!(envelope.message_id(), Some("42"));
        assert_eq!(
            envelope.decode().unwrap(),
            ChangeNotification {
                bucket: "ventures-dev".into(),
                name: "env/dev/snapshots/ideas/I1.json".into(),
            }
        );
    }

    #[test]
    fn falls_back_to_storage_attributes() {
        let body = serde_json::to_vec(&json!({
            "message": {
                "attributes": { "bucketId": "ventures-dev", "objectId": "env/dev/snapshots/ideas/I1.json" }
            }
        }))
        .unwrap();
        let notification = PushEnvelope::parse(&body).unwrap().decode().unwrap();
        assert_eq!(notification.name, "env/dev/snapshots/ideas/I1.json");
    }

    #[test]
    fn rejects_garbage() {
        assert!(PushEnvelope::parse(b"not json").is_err());
        let envelope = PushEnvelope::parse(br#"{"message":{"data":"%%%"}}"#).unwrap();
        assert!(matches!(envelope.decode(), Err(StoreError::InvalidPayload(_))));
        let envelope = PushEnvelope::parse(br#"{"message":{}}"#).unwrap();
        assert!(envelope.decode().is_err());
    }

    #[test]
    fn encoded_push_round_trips_through_decode() {
        let notification = ChangeNotification {
            bucket: "b".into(),
            name: "env/dev/snapshots/ideas/I1.json".into(),
        };
        let body = encode_push(&notification, "1").unwrap();
        assert_eq!(PushEnvelope::parse(&body).unwrap().decode().unwrap(), notification);
    }
}
