//! Notification job payloads.

use serde::{Deserialize, Serialize};

use echoboard_feedback::{Author, FeedbackRecord};

/// Values interpolated into a notification template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

impl TemplateData {
    pub fn for_user(name: impl Into<String>) -> Self {
        Self {
            user_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Data describing a feedback record and its author.
    pub fn for_feedback(record: &FeedbackRecord) -> Self {
        Self {
            user_name: Some(record.author.name.clone()),
            feedback_title: Some(record.title.clone()),
            feedback_message: Some(record.message.clone()),
            feedback_rating: Some(record.rating.value()),
            feedback_id: Some(record.id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_dashboard_url(mut self, url: impl Into<String>) -> Self {
        self.dashboard_url = Some(url.into());
        self
    }

    pub fn with_admin_name(mut self, name: impl Into<String>) -> Self {
        self.admin_name = Some(name.into());
        self
    }
}

/// Payload carried by every email-channel job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    /// Overrides the template subject when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub data: TemplateData,
}

impl EmailPayload {
    pub fn new(to: impl Into<String>, data: TemplateData) -> Self {
        Self {
            to: to.into(),
            subject: None,
            data,
        }
    }

    /// Addressed to the author of a feedback record.
    pub fn for_feedback(record: &FeedbackRecord) -> Self {
        Self::new(record.author.email.clone(), TemplateData::for_feedback(record))
    }

    pub fn for_user(user: &Author) -> Self {
        Self::new(user.email.clone(), TemplateData::for_user(user.name.clone()))
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_payload_deserializes() {
        let payload: EmailPayload =
            serde_json::from_value(serde_json::json!({"to": "a@x.com"})).unwrap();

        assert_eq!(payload.to, "a@x.com");
        assert_eq!(payload.subject, None);
        assert_eq!(payload.data, TemplateData::default());
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let payload = EmailPayload::new("a@x.com", TemplateData::for_user("Ada"));
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"to": "a@x.com", "data": {"user_name": "Ada"}})
        );
    }
}
