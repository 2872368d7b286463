//! Domain model (IDs, envelopes, outcomes, errors).

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod payload;

pub use envelope::{BrokeredMessage, CONTENT_TYPE_PROPERTY, LockedMessage, MessageEnvelope, MessageType};
pub use errors::{
    BrokerCondition, BrokerError, DispatchError, ErrorKind, HandlerError, SendError,
    ValidationError,
};
pub use ids::{CorrelationId, LockToken, MessageId, QueueName, SessionId};
pub use outcome::{DeliveryOutcome, OutcomeKind};
pub use payload::QueueTestMessage;
