//! Subject and body rendering per notification kind.
//!
//! Bodies live in `templates/email/` and are rendered with askama; the HTML
//! part auto-escapes every interpolated value, the text part does not.

use askama::Template;

use crate::jobs::NotificationKind;

use super::payload::TemplateData;

/// A fully rendered message, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

struct Content {
    subject: String,
    heading: &'static str,
    paragraphs: Vec<String>,
    details: Vec<Detail>,
    link: Option<Link>,
}

struct Detail {
    label: &'static str,
    value: String,
}

impl Detail {
    fn new(label: &'static str, value: impl Into<String>) -> Self {
        Self {
            label,
            value: value.into(),
        }
    }
}

struct Link {
    label: &'static str,
    url: String,
}

#[derive(Template)]
#[template(path = "email/notification.html")]
struct HtmlBody<'a> {
    content: &'a Content,
    greeting: &'a str,
}

#[derive(Template)]
#[template(path = "email/notification.txt")]
struct TextBody<'a> {
    content: &'a Content,
    greeting: &'a str,
}

/// Render a notification for `kind` from `data`.
pub fn render(kind: NotificationKind, data: &TemplateData) -> Result<RenderedEmail, askama::Error> {
    let content = content_for(kind, data);
    let greeting = greeting(data);

    let html = HtmlBody {
        content: &content,
        greeting: &greeting,
    }
    .render()?;
    let text = TextBody {
        content: &content,
        greeting: &greeting,
    }
    .render()?;

    Ok(RenderedEmail {
        subject: content.subject,
        html,
        text,
    })
}

fn content_for(kind: NotificationKind, data: &TemplateData) -> Content {
    let title = data.feedback_title.clone().unwrap_or_default();
    let feedback_details = || {
        let mut details = vec![Detail::new("Title", title.clone())];
        if let Some(rating) = data.feedback_rating {
            details.push(Detail::new("Rating", format!("{rating}/5")));
        }
        if let Some(message) = &data.feedback_message {
            details.push(Detail::new("Message", message.clone()));
        }
        details
    };
    let dashboard = data
        .dashboard_url
        .clone()
        .map(|url| Link {
            label: "View your dashboard",
            url,
        });

    match kind {
        NotificationKind::FeedbackCreated => Content {
            subject: format!("Feedback Received: {title}"),
            heading: "Thank you for your feedback!",
            paragraphs: vec![
                "We've received your feedback and our team will review it shortly.".to_string(),
            ],
            details: feedback_details(),
            link: None,
        },
        NotificationKind::FeedbackUpdated => Content {
            subject: format!("Feedback Updated: {title}"),
            heading: "Your feedback has been updated",
            paragraphs: vec![
                "Your feedback has been reviewed and updated by our admin team.".to_string(),
            ],
            details: feedback_details(),
            link: None,
        },
        NotificationKind::FeedbackApproved => {
            let mut details = feedback_details();
            details.push(Detail::new("Status", "Approved"));
            let mut paragraphs = vec![
                "Great news! Your feedback has been reviewed and approved by our team.".to_string(),
            ];
            if let Some(admin) = &data.admin_name {
                paragraphs.push(format!("Reviewed by {admin}."));
            }
            Content {
                subject: "Great News! Your Feedback Has Been Approved".to_string(),
                heading: "Your Feedback Has Been Approved!",
                paragraphs,
                details,
                link: dashboard,
            }
        }
        NotificationKind::FeedbackRejected => {
            let mut details = feedback_details();
            details.push(Detail::new("Status", "Not Approved"));
            Content {
                subject: "Feedback Update: Your Submission Status".to_string(),
                heading: "Feedback Status Update",
                paragraphs: vec![
                    "Thank you for your feedback submission. After careful review, we've decided not to move forward with this particular suggestion.".to_string(),
                ],
                details,
                link: dashboard,
            }
        }
        NotificationKind::WelcomeEmail => Content {
            subject: "Welcome to EchoBoard!".to_string(),
            heading: "Welcome to EchoBoard!",
            paragraphs: vec![
                "Welcome to EchoBoard! We're excited to have you on board.".to_string(),
                "If you have any questions, feel free to reach out to our support team.".to_string(),
            ],
            details: Vec::new(),
            link: dashboard,
        },
        NotificationKind::ReminderEmail => Content {
            subject: "Reminder: Share Your Feedback on EchoBoard".to_string(),
            heading: "We'd Love to Hear from You!",
            paragraphs: vec![
                "It's been a while since you last shared feedback with us. Your input is valuable and helps us improve our services.".to_string(),
            ],
            details: Vec::new(),
            link: dashboard,
        },
    }
}

fn greeting(data: &TemplateData) -> String {
    match data.user_name.as_deref() {
        Some(name) if !name.is_empty() => format!("Hi {name},"),
        _ => "Hi there,".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback_data() -> TemplateData {
        TemplateData {
            user_name: Some("Ada".to_string()),
            feedback_title: Some("Dark mode".to_string()),
            feedback_message: Some("Please add <b>dark</b> mode".to_string()),
            feedback_rating: Some(4),
            feedback_id: Some("f-1".to_string()),
            admin_name: None,
            dashboard_url: Some("https://echoboard.dev".to_string()),
        }
    }

    #[test]
    fn created_subject_includes_title() {
        let email = render(NotificationKind::FeedbackCreated, &feedback_data()).unwrap();
        assert_eq!(email.subject, "Feedback Received: Dark mode");
        assert!(email.text.contains("Rating: 4/5"));
        assert!(email.text.contains("Hi Ada,"));
    }

    #[test]
    fn html_escapes_user_content() {
        let email = render(NotificationKind::FeedbackCreated, &feedback_data()).unwrap();
        assert!(email.html.contains("Please add "));
        assert!(!email.html.contains("<b>dark</b>"));
        assert!(email.text.contains("Please add <b>dark</b> mode"));
    }

    #[test]
    fn status_templates_carry_status_and_dashboard_link() {
        let approved = render(NotificationKind::FeedbackApproved, &feedback_data()).unwrap();
        assert_eq!(approved.subject, "Great News! Your Feedback Has Been Approved");
        assert!(approved.text.contains("Status: Approved"));
        assert!(approved.html.contains("<a href="));
        assert!(approved.text.contains("View your dashboard: https://echoboard.dev"));

        let rejected = render(NotificationKind::FeedbackRejected, &feedback_data()).unwrap();
        assert_eq!(rejected.subject, "Feedback Update: Your Submission Status");
        assert!(rejected.text.contains("Status: Not Approved"));
    }

    #[test]
    fn welcome_without_name_uses_generic_greeting() {
        let email = render(NotificationKind::WelcomeEmail, &TemplateData::default()).unwrap();
        assert_eq!(email.subject, "Welcome to EchoBoard!");
        assert!(email.text.contains("Hi there,"));
    }

    #[test]
    fn html_escapes_names_and_links() {
        let data = TemplateData {
            user_name: Some("O'Brien & <Co>".to_string()),
            dashboard_url: Some("https://echoboard.dev/?a=1&b=\"2\"".to_string()),
            ..TemplateData::default()
        };
        let email = render(NotificationKind::ReminderEmail, &data).unwrap();

        assert!(email.html.contains("Brien"));
        assert!(!email.html.contains("O'Brien & <Co>"));
        assert!(!email.html.contains("b=\"2\""));
        assert!(email.text.contains("Hi O'Brien & <Co>,"));
        assert!(email.text.contains("https://echoboard.dev/?a=1&b=\"2\""));
    }

    #[test]
    fn text_part_lists_details_and_sign_off() {
        let email = render(NotificationKind::FeedbackUpdated, &feedback_data()).unwrap();
        assert!(email.text.starts_with("Your feedback has been updated"));
        assert!(email.text.contains("Title: Dark mode"));
        assert!(email.text.contains("Message: Please add <b>dark</b> mode"));
        assert!(email.text.trim_end().ends_with("The EchoBoard Team"));
        assert!(!email.text.contains("View your dashboard"));
    }
}
