//! Per-runner in-memory subscription cache.
//!
//! Loaded once from the subscription table at startup and kept coherent by
//! the runner itself: after every successful `process_command` the new
//! state's declared subscriptions replace the cached entry. The database
//! is consulted only on cold start.

use std::collections::HashMap;

use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::model::subscription::Sub;
use crate::stream::ReaderError;

/// One cached subscription rule.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSubscription {
    /// The subscribing workflow
    pub workflow_id: String,
    /// `"*"` or a specific source workflow id
    pub subscribed_to_workflow: String,
    /// `"*"` or a specific event type
    pub subscribed_to_event_type: String,
    pub tags: Vec<String>,
    pub tags_all: Vec<String>,
}

impl CachedSubscription {
    fn rule(&self) -> Sub {
        Sub {
            workflow_id: self.subscribed_to_workflow.clone(),
            event_type: self.subscribed_to_event_type.clone(),
            tags: self.tags.clone(),
            tags_all: self.tags_all.clone(),
        }
    }

    pub fn matches_event(
        &self,
        event_workflow_id: &str,
        event_type: &str,
        event_tags: &[String],
        workflow_tags: &[String],
    ) -> bool {
        self.rule()
            .matches_event(event_workflow_id, event_type, event_tags, workflow_tags)
    }
}

#[derive(Default)]
struct CacheInner {
    by_subscriber: HashMap<String, Vec<CachedSubscription>>,
    initialized: bool,
    has_tag_subscriptions: bool,
}

/// Subscription cache for one runner.
pub struct SubscriptionCache {
    workflow_type: String,
    inner: RwLock<CacheInner>,
}

impl SubscriptionCache {
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            inner: RwLock::new(CacheInner::default()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().initialized
    }

    /// Whether any cached rule filters on tags. When none do, the reader
    /// can skip fetching event metadata entirely.
    pub fn has_tag_subscriptions(&self) -> bool {
        self.inner.read().has_tag_subscriptions
    }

    /// Cold-start load of every subscription for this workflow type.
    pub async fn load(&self, pool: &PgPool) -> Result<usize, ReaderError> {
        info!(workflow_type = %self.workflow_type, "loading subscription cache");
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, subscribed_to_workflow, subscribed_to_event_type,
                   tags, tags_all
            FROM subscriptions
            WHERE workflow_type = $1
            "#,
        )
        .bind(&self.workflow_type)
        .fetch_all(pool)
        .await
        .map_err(|e| ReaderError::Database(e.to_string()))?;

        let mut by_subscriber: HashMap<String, Vec<CachedSubscription>> = HashMap::new();
        let mut count = 0;
        for row in rows {
            let sub = CachedSubscription {
                workflow_id: row
                    .try_get("workflow_id")
                    .map_err(|e| ReaderError::Database(e.to_string()))?,
                subscribed_to_workflow: row
                    .try_get("subscribed_to_workflow")
                    .map_err(|e| ReaderError::Database(e.to_string()))?,
                subscribed_to_event_type: row
                    .try_get("subscribed_to_event_type")
                    .map_err(|e| ReaderError::Database(e.to_string()))?,
                tags: row
                    .try_get("tags")
                    .map_err(|e| ReaderError::Database(e.to_string()))?,
                tags_all: row
                    .try_get("tags_all")
                    .map_err(|e| ReaderError::Database(e.to_string()))?,
            };
            by_subscriber
                .entry(sub.workflow_id.clone())
                .or_default()
                .push(sub);
            count += 1;
        }

        let has_tags = by_subscriber
            .values()
            .flatten()
            .any(|s| !s.tags.is_empty() || !s.tags_all.is_empty());

        let mut inner = self.inner.write();
        inner.by_subscriber = by_subscriber;
        inner.initialized = true;
        inner.has_tag_subscriptions = has_tags;
        info!(
            workflow_type = %self.workflow_type,
            count,
            subscribers = inner.by_subscriber.len(),
            tag_filtering = has_tags,
            "subscription cache loaded"
        );
        Ok(count)
    }

    /// Subscribers whose rules match this event. At most one entry per
    /// subscriber, whatever the number of matching rules.
    pub fn matching_subscribers(
        &self,
        event_workflow_id: &str,
        event_type: &str,
        event_tags: &[String],
        workflow_tags: &[String],
    ) -> Vec<String> {
        let inner = self.inner.read();
        let mut matched = Vec::new();
        for (subscriber, rules) in &inner.by_subscriber {
            if rules
                .iter()
                .any(|r| r.matches_event(event_workflow_id, event_type, event_tags, workflow_tags))
            {
                matched.push(subscriber.clone());
            }
        }
        matched
    }

    /// Replace the cached rules for one subscriber with the subscriptions
    /// its new state declares. Called after every successful command.
    pub fn update_subscriber(&self, workflow_id: &str, subscriptions: &[Sub]) {
        let mut inner = self.inner.write();
        if !inner.initialized {
            return;
        }
        if subscriptions.is_empty() {
            inner.by_subscriber.remove(workflow_id);
            debug!(workflow_id, "removed subscriptions from cache");
            return;
        }
        let cached: Vec<CachedSubscription> = subscriptions
            .iter()
            .map(|sub| CachedSubscription {
                workflow_id: workflow_id.to_string(),
                subscribed_to_workflow: sub.workflow_id.clone(),
                subscribed_to_event_type: sub.event_type.clone(),
                tags: sub.tags.clone(),
                tags_all: sub.tags_all.clone(),
            })
            .collect();
        if cached.iter().any(|s| !s.tags.is_empty() || !s.tags_all.is_empty()) {
            inner.has_tag_subscriptions = true;
        }
        debug!(
            workflow_id,
            count = cached.len(),
            "updated subscription cache"
        );
        inner.by_subscriber.insert(workflow_id.to_string(), cached);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(cache: &SubscriptionCache) {
        // Mark initialized without a database.
        cache.inner.write().initialized = true;
    }

    fn sub(workflow_id: &str, event_type: &str) -> Sub {
        Sub::new(workflow_id, event_type)
    }

    #[test]
    fn test_update_and_match() {
        let cache = SubscriptionCache::new("orders");
        seed(&cache);

        cache.update_subscriber("listener", &[sub("source", "event_a")]);
        let matched = cache.matching_subscribers("source", "event_a", &[], &[]);
        assert_eq!(matched, vec!["listener".to_string()]);

        assert!(cache
            .matching_subscribers("source", "event_b", &[], &[])
            .is_empty());
        assert!(cache
            .matching_subscribers("other", "event_a", &[], &[])
            .is_empty());
    }

    #[test]
    fn test_one_entry_per_subscriber() {
        let cache = SubscriptionCache::new("orders");
        seed(&cache);

        cache.update_subscriber(
            "listener",
            &[sub("source", "event_a"), sub("*", "event_a")],
        );
        let matched = cache.matching_subscribers("source", "event_a", &[], &[]);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_empty_subscriptions_remove_entry() {
        let cache = SubscriptionCache::new("orders");
        seed(&cache);

        cache.update_subscriber("listener", &[sub("source", "event_a")]);
        cache.update_subscriber("listener", &[]);
        assert!(cache
            .matching_subscribers("source", "event_a", &[], &[])
            .is_empty());
    }

    #[test]
    fn test_tag_flag_flips_on_first_tagged_rule() {
        let cache = SubscriptionCache::new("orders");
        seed(&cache);
        assert!(!cache.has_tag_subscriptions());

        cache.update_subscriber(
            "listener",
            &[sub("*", "*").with_tags(vec!["vip".to_string()])],
        );
        assert!(cache.has_tag_subscriptions());

        let matched =
            cache.matching_subscribers("anyone", "anything", &[], &["vip".to_string()]);
        assert_eq!(matched, vec!["listener".to_string()]);
    }

    #[test]
    fn test_updates_before_initialization_are_ignored() {
        let cache = SubscriptionCache::new("orders");
        cache.update_subscriber("listener", &[sub("source", "event_a")]);
        assert!(!cache.is_initialized());
        assert!(cache
            .matching_subscribers("source", "event_a", &[], &[])
            .is_empty());
    }
}
