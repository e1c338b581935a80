//! External message ingress routing.

mod external;

pub use external::{
    external_consumer_name, external_subject_wildcard, parse_subject, resolve_workflow_ids,
    ExternalMessageConsumer, ExternalMessageError, MessageParser, Routing,
    EXTERNAL_SUBJECT_PREFIX,
};
