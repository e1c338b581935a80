//! External message ingress from the broker.
//!
//! Applications publish opaque payloads on
//! `messages.{workflow_type}.{routing}.{detail}`; the consumer resolves
//! target instances (fanout, by tag, by id, or by topic subscription),
//! parses the payload with a caller-supplied parser, and delivers the
//! resulting command through the command processor.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use futures::StreamExt;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::workflow::Workflow;
use crate::persistence::repo::{CommandOutcome, Repo, RepoError};
use crate::runner::PartitionRule;

/// Subject prefix for external messages.
pub const EXTERNAL_SUBJECT_PREFIX: &str = "messages.";

/// Durable consumer name for one workflow type's ingress.
pub fn external_consumer_name(workflow_type: &str) -> String {
    format!("{workflow_type}_external_consumer")
}

/// Wildcard subject covering one workflow type's ingress.
pub fn external_subject_wildcard(workflow_type: &str) -> String {
    format!("messages.{workflow_type}.>")
}

/// How an external message picks its target instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Every instance of the workflow type
    All,
    /// Instances whose workflow tags contain the detail value
    Tag,
    /// A single instance named by the detail value
    Id,
    /// Instances with an external subscription on the detail topic
    Topic,
}

impl Routing {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "tag" => Some(Self::Tag),
            "id" => Some(Self::Id),
            "topic" => Some(Self::Topic),
            _ => None,
        }
    }
}

/// Parse `messages.{workflow_type}.{routing}.{detail}` for the expected
/// workflow type. The detail may itself contain dots (topics).
pub fn parse_subject(subject: &str, expected_workflow_type: &str) -> Option<(Routing, String)> {
    let rest = subject.strip_prefix(EXTERNAL_SUBJECT_PREFIX)?;
    let mut parts = rest.splitn(3, '.');
    let workflow_type = parts.next()?;
    let routing = parts.next()?;
    let detail = parts.next().unwrap_or("");
    if workflow_type != expected_workflow_type {
        return None;
    }
    Some((Routing::parse(routing)?, detail.to_string()))
}

/// Error type for external message handling.
#[derive(Debug, thiserror::Error)]
pub enum ExternalMessageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl From<sqlx::Error> for ExternalMessageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Resolve the target workflow ids for one routing decision, filtered by
/// the runner's partition rule.
pub async fn resolve_workflow_ids(
    pool: &PgPool,
    routing: Routing,
    detail: &str,
    workflow_type: &str,
    wf_id_rule: Option<&PartitionRule>,
) -> Result<Vec<String>, ExternalMessageError> {
    let mut workflow_ids: Vec<String> = match routing {
        Routing::All => {
            sqlx::query_scalar(
                "SELECT DISTINCT workflow_id FROM events WHERE workflow_type = $1",
            )
            .bind(workflow_type)
            .fetch_all(pool)
            .await?
        }
        Routing::Tag => {
            sqlx::query_scalar(
                "SELECT workflow_id FROM workflow_metadata \
                 WHERE workflow_type = $1 AND tags @> ARRAY[$2]",
            )
            .bind(workflow_type)
            .bind(detail)
            .fetch_all(pool)
            .await?
        }
        Routing::Id => {
            if detail.is_empty() {
                Vec::new()
            } else {
                vec![detail.to_string()]
            }
        }
        Routing::Topic => {
            sqlx::query_scalar(
                "SELECT DISTINCT workflow_id FROM external_subscriptions \
                 WHERE workflow_type = $1 AND topic = $2",
            )
            .bind(workflow_type)
            .bind(detail)
            .fetch_all(pool)
            .await?
        }
    };

    if let Some(rule) = wf_id_rule {
        workflow_ids.retain(|id| rule(id));
    }
    Ok(workflow_ids)
}

/// Caller-supplied payload parser; returning `None` drops the message.
pub type MessageParser<C> = Arc<dyn Fn(&[u8]) -> Option<C> + Send + Sync>;

/// Consumes external messages for one workflow type and routes them to
/// workflow instances as commands.
pub struct ExternalMessageConsumer<W: Workflow> {
    pool: PgPool,
    repo: Repo<W>,
    context: jetstream::Context,
    stream_name: String,
    parser: MessageParser<W::Command>,
    wf_id_rule: Option<PartitionRule>,
    batch_size: usize,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<W: Workflow> ExternalMessageConsumer<W> {
    pub fn new(
        pool: PgPool,
        repo: Repo<W>,
        context: jetstream::Context,
        stream_name: impl Into<String>,
        parser: MessageParser<W::Command>,
    ) -> Self {
        Self {
            pool,
            repo,
            context,
            stream_name: stream_name.into(),
            parser,
            wf_id_rule: None,
            batch_size: 100,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_partition_rule(mut self, rule: PartitionRule) -> Self {
        self.wf_id_rule = Some(rule);
        self
    }

    /// Ensure the ingress stream and durable consumer exist, then start
    /// the consumption loop.
    pub async fn start(&mut self) -> Result<(), ExternalMessageError> {
        if self.task.is_some() {
            return Ok(());
        }
        let subject = external_subject_wildcard(W::TYPE);
        let consumer_name = external_consumer_name(W::TYPE);

        let stream = self
            .context
            .get_or_create_stream(jetstream::stream::Config {
                name: self.stream_name.clone(),
                subjects: vec![subject.clone()],
                storage: jetstream::stream::StorageType::File,
                duplicate_window: Duration::from_secs(300),
                ..Default::default()
            })
            .await
            .map_err(|e| ExternalMessageError::Broker(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    max_deliver: 3,
                    ack_wait: Duration::from_secs(30),
                    filter_subject: subject,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ExternalMessageError::Broker(e.to_string()))?;

        let pool = self.pool.clone();
        let repo = self.repo.clone();
        let parser = Arc::clone(&self.parser);
        let wf_id_rule = self.wf_id_rule.clone();
        let batch_size = self.batch_size;
        let shutdown = self.shutdown.clone();
        self.task = Some(tokio::spawn(async move {
            info!(workflow_type = W::TYPE, "external message consumer started");
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let result = consume_batch::<W>(
                    &pool,
                    &repo,
                    &consumer,
                    &parser,
                    wf_id_rule.as_ref(),
                    batch_size,
                )
                .await;
                if let Err(e) = result {
                    error!(error = %e, "error consuming external messages");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
            info!(workflow_type = W::TYPE, "external message consumer stopped");
        }));
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn consume_batch<W: Workflow>(
    pool: &PgPool,
    repo: &Repo<W>,
    consumer: &jetstream::consumer::PullConsumer,
    parser: &MessageParser<W::Command>,
    wf_id_rule: Option<&PartitionRule>,
    batch_size: usize,
) -> Result<(), ExternalMessageError> {
    let mut messages = consumer
        .fetch()
        .max_messages(batch_size)
        .expires(Duration::from_secs(1))
        .messages()
        .await
        .map_err(|e| ExternalMessageError::Broker(e.to_string()))?;

    while let Some(message) = messages.next().await {
        let message = message.map_err(|e| ExternalMessageError::Broker(e.to_string()))?;

        let Some((routing, detail)) = parse_subject(&message.subject, W::TYPE) else {
            debug!(subject = %message.subject, "ignoring unroutable subject");
            ack(&message).await?;
            continue;
        };

        let Some(cmd) = parser(&message.payload) else {
            debug!(subject = %message.subject, "parser dropped external message");
            ack(&message).await?;
            continue;
        };

        let workflow_ids =
            resolve_workflow_ids(pool, routing, &detail, W::TYPE, wf_id_rule).await?;
        if workflow_ids.is_empty() {
            debug!(subject = %message.subject, "no targets for external message");
            ack(&message).await?;
            continue;
        }

        let mut delivered = true;
        for workflow_id in &workflow_ids {
            match repo.process_command(workflow_id, &cmd).await {
                Ok(CommandOutcome::Accepted { .. }) => {}
                Ok(CommandOutcome::Rejected(rejection)) => {
                    debug!(workflow_id, %rejection, "external message rejected");
                }
                Err(RepoError::WorkflowNotFound(_)) => {
                    debug!(workflow_id, "external message for absent workflow");
                }
                Err(e) => {
                    // Leave the message unacked; the broker redelivers.
                    warn!(workflow_id, error = %e, "external message delivery failed");
                    delivered = false;
                    break;
                }
            }
        }
        if delivered {
            ack(&message).await?;
        }
    }
    Ok(())
}

async fn ack(message: &jetstream::Message) -> Result<(), ExternalMessageError> {
    message
        .ack()
        .await
        .map_err(|e| ExternalMessageError::Broker(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subject_all_routings() {
        assert_eq!(
            parse_subject("messages.orders.all.x", "orders"),
            Some((Routing::All, "x".to_string()))
        );
        assert_eq!(
            parse_subject("messages.orders.tag.vip", "orders"),
            Some((Routing::Tag, "vip".to_string()))
        );
        assert_eq!(
            parse_subject("messages.orders.id.order-1", "orders"),
            Some((Routing::Id, "order-1".to_string()))
        );
        assert_eq!(
            parse_subject("messages.orders.topic.billing.invoice.created", "orders"),
            Some((Routing::Topic, "billing.invoice.created".to_string()))
        );
    }

    #[test]
    fn test_parse_subject_rejects_foreign_and_malformed() {
        assert_eq!(parse_subject("messages.other.all.x", "orders"), None);
        assert_eq!(parse_subject("events.orders.all.x", "orders"), None);
        assert_eq!(parse_subject("messages.orders", "orders"), None);
        assert_eq!(parse_subject("messages.orders.bogus.x", "orders"), None);
    }

    #[test]
    fn test_consumer_name() {
        assert_eq!(external_consumer_name("orders"), "orders_external_consumer");
        assert_eq!(external_subject_wildcard("orders"), "messages.orders.>");
    }
}
