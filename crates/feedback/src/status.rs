use core::str::FromStr;

use serde::{Deserialize, Serialize};

use echoboard_core::DomainError;

/// Feedback moderation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    Pending,
    Approved,
    Rejected,
    Archived,
}

impl FeedbackStatus {
    pub const ALL: [FeedbackStatus; 4] = [
        FeedbackStatus::Pending,
        FeedbackStatus::Approved,
        FeedbackStatus::Rejected,
        FeedbackStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackStatus::Pending => "pending",
            FeedbackStatus::Approved => "approved",
            FeedbackStatus::Rejected => "rejected",
            FeedbackStatus::Archived => "archived",
        }
    }
}

impl Default for FeedbackStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl core::fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(FeedbackStatus::Pending),
            "approved" => Ok(FeedbackStatus::Approved),
            "rejected" => Ok(FeedbackStatus::Rejected),
            "archived" => Ok(FeedbackStatus::Archived),
            other => Err(DomainError::validation(format!(
                "unknown feedback status '{other}' (expected pending, approved, rejected or archived)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Approved".parse::<FeedbackStatus>().unwrap(), FeedbackStatus::Approved);
        assert_eq!(" archived ".parse::<FeedbackStatus>().unwrap(), FeedbackStatus::Archived);
        assert!("deleted".parse::<FeedbackStatus>().is_err());
    }

    #[test]
    fn display_matches_wire_name() {
        for status in FeedbackStatus::ALL {
            assert_eq!(status.to_string().parse::<FeedbackStatus>().unwrap(), status);
        }
    }
}
