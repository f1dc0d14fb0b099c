//! In-memory topics keyed by [`Identity`], with a meta-topic that reports
//! every topic creation, subscriber change and close.

mod registry;
mod topic;

pub use registry::{META_TOPIC_KEY, Registry, RegistrySnapshot, meta_topic_id};
pub use topic::{AnyMessage, Message, MetaTopicInfo, Subscription, Topic, TopicInfo};

use kestrel_process::Identity;

use crate::error::{Classify, ErrorKind};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic already exists: {0}")]
    Exists(Identity),
    #[error("topic does not exist: {0}")]
    DoesntExist(Identity),
    #[error("topic is closed: {0}")]
    Closed(Identity),
    #[error("topic category is reserved: {0}")]
    Reserved(Identity),
    #[error("topic {id} does not carry {expected}")]
    TypeMismatch { id: Identity, expected: &'static str },
}

impl Classify for TopicError {
    fn kind(&self) -> ErrorKind {
        match self {
            TopicError::Exists(_) => ErrorKind::AlreadyExists,
            TopicError::DoesntExist(_) => ErrorKind::NotFound,
            TopicError::Closed(_) => ErrorKind::ClosedResource,
            TopicError::Reserved(_) | TopicError::TypeMismatch { .. } => ErrorKind::InvalidInput,
        }
    }
}
