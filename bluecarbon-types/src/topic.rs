//! Topic names.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// A named channel of related entities that can be subscribed to independently.
///
/// Topic names are compared exactly; `carbon_credits` and `carbon-credits`
/// are different topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub const PROJECTS: &'static str = "projects";
    pub const CARBON_CREDITS: &'static str = "carbon_credits";
    pub const FIELD_DATA: &'static str = "field_data";
    pub const SYSTEM_STATUS: &'static str = "system_status";
    pub const NOTIFICATIONS: &'static str = "notifications";

    /// Creates a topic. Leading and trailing whitespace is dropped.
    pub fn new(name: impl Into<String>) -> Result<Self, crate::Error> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidTopic("topic name is empty".into()));
        }
        if trimmed.contains(char::is_whitespace) || trimmed.contains('/') {
            return Err(crate::Error::InvalidTopic(format!(
                "topic name contains whitespace or '/': {trimmed:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `projects` topic.
    #[must_use]
    pub fn projects() -> Self {
        Self(Self::PROJECTS.to_string())
    }

    /// The `carbon_credits` topic.
    #[must_use]
    pub fn carbon_credits() -> Self {
        Self(Self::CARBON_CREDITS.to_string())
    }

    /// The `field_data` topic.
    #[must_use]
    pub fn field_data() -> Self {
        Self(Self::FIELD_DATA.to_string())
    }

    /// The `system_status` topic.
    #[must_use]
    pub fn system_status() -> Self {
        Self(Self::SYSTEM_STATUS.to_string())
    }

    /// The `notifications` topic.
    #[must_use]
    pub fn notifications() -> Self {
        Self(Self::NOTIFICATIONS.to_string())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Topic {
    type Error = crate::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for Topic {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
