//! Alert notifications
//!
//! Fire-and-forget delivery of rendered alert messages to the user groups
//! routed by category.

use async_trait::async_trait;
use convoy_core::domain::alert::AlertCategory;

/// Routes alerts of one category to a set of user groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRule {
    pub category: AlertCategory,
    pub user_groups: Vec<String>,
}

impl NotificationRule {
    pub fn new(category: AlertCategory, user_groups: Vec<String>) -> Self {
        Self {
            category,
            user_groups,
        }
    }
}

/// Selects the rules that apply to a category
pub fn rules_for(rules: &[NotificationRule], category: AlertCategory) -> Vec<NotificationRule> {
    rules
        .iter()
        .filter(|r| r.category == category)
        .cloned()
        .collect()
}

/// Notification delivery contract
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, message: &str, rules: &[NotificationRule]);
}

/// Sender that writes notifications to the log
#[derive(Debug, Clone, Default)]
pub struct TracingNotificationSender;

#[async_trait]
impl NotificationSender for TracingNotificationSender {
    async fn send(&self, message: &str, rules: &[NotificationRule]) {
        let groups: Vec<&str> = rules
            .iter()
            .flat_map(|r| r.user_groups.iter().map(String::as_str))
            .collect();
        tracing::info!("Notification to {:?}: {}", groups, message);
    }
}
