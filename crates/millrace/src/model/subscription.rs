//! Subscription rules: how one workflow observes another's events

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Wildcard accepted for both the source workflow id and the event type.
pub const WILDCARD: &str = "*";

/// Internal subscription: a workflow subscribes to events from another
/// workflow (or any workflow of the type, via `"*"`).
///
/// `tags` filters with ANY semantics (at least one must match), `tags_all`
/// with ALL semantics. Both match against the union of event tags and the
/// source instance's workflow tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sub {
    /// Source workflow id, or `"*"` for all instances
    pub workflow_id: String,
    /// Event type to observe, or `"*"` for all types
    pub event_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tags_all: Vec<String>,
}

impl Sub {
    pub fn new(workflow_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            event_type: event_type.into(),
            tags: Vec::new(),
            tags_all: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tags_all(mut self, tags_all: Vec<String>) -> Self {
        self.tags_all = tags_all;
        self
    }

    /// Check the tag filters against the union of event and workflow tags.
    pub fn matches_tags(&self, event_tags: &[String], workflow_tags: &[String]) -> bool {
        let all: HashSet<&str> = event_tags
            .iter()
            .chain(workflow_tags.iter())
            .map(String::as_str)
            .collect();

        if !self.tags.is_empty() && !self.tags.iter().any(|t| all.contains(t.as_str())) {
            return false;
        }
        if !self.tags_all.is_empty() && !self.tags_all.iter().all(|t| all.contains(t.as_str())) {
            return false;
        }
        true
    }

    /// Full match: source id, event type, and tag filters.
    pub fn matches_event(
        &self,
        event_workflow_id: &str,
        event_type: &str,
        event_tags: &[String],
        workflow_tags: &[String],
    ) -> bool {
        if self.workflow_id != WILDCARD && self.workflow_id != event_workflow_id {
            return false;
        }
        if self.event_type != WILDCARD && self.event_type != event_type {
            return false;
        }
        self.matches_tags(event_tags, workflow_tags)
    }
}

/// External subscription: a workflow subscribes to a broker message topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSub {
    pub topic: String,
}

impl ExternalSub {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_match() {
        let sub = Sub::new("source", "event_a");
        assert!(sub.matches_event("source", "event_a", &[], &[]));
        assert!(!sub.matches_event("other", "event_a", &[], &[]));
        assert!(!sub.matches_event("source", "event_b", &[], &[]));
    }

    #[test]
    fn test_wildcard_workflow_and_event_type() {
        let sub = Sub::new(WILDCARD, "event_a");
        assert!(sub.matches_event("anyone", "event_a", &[], &[]));

        let sub = Sub::new("source", WILDCARD);
        assert!(sub.matches_event("source", "whatever", &[], &[]));
    }

    #[test]
    fn test_tags_any_semantics() {
        let sub = Sub::new(WILDCARD, WILDCARD).with_tags(tags(&["red", "blue"]));
        assert!(sub.matches_event("s", "e", &tags(&["blue"]), &[]));
        assert!(sub.matches_event("s", "e", &[], &tags(&["red"])));
        assert!(!sub.matches_event("s", "e", &tags(&["green"]), &[]));
    }

    #[test]
    fn test_tags_all_semantics() {
        let sub = Sub::new(WILDCARD, WILDCARD).with_tags_all(tags(&["red", "blue"]));
        assert!(!sub.matches_event("s", "e", &tags(&["red"]), &[]));
        // Union of event and workflow tags satisfies ALL
        assert!(sub.matches_event("s", "e", &tags(&["red"]), &tags(&["blue"])));
    }

    #[test]
    fn test_combined_any_and_all() {
        let sub = Sub::new(WILDCARD, WILDCARD)
            .with_tags(tags(&["priority"]))
            .with_tags_all(tags(&["region-eu"]));
        assert!(sub.matches_event("s", "e", &tags(&["priority", "region-eu"]), &[]));
        assert!(!sub.matches_event("s", "e", &tags(&["priority"]), &[]));
        assert!(!sub.matches_event("s", "e", &tags(&["region-eu"]), &[]));
    }

    #[test]
    fn test_empty_filters_always_match() {
        let sub = Sub::new("source", "event_a");
        assert!(sub.matches_tags(&tags(&["anything"]), &[]));
        assert!(sub.matches_tags(&[], &[]));
    }
}
