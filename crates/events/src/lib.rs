//! Job messages, completion events and the broker abstraction they travel over.

pub mod broker;
pub mod envelope;
pub mod event;
pub mod in_memory_broker;
pub mod notify;
pub mod processor;
pub mod registry;

pub use broker::{BrokerError, Message, Settlement, Subscription, Topic, JSON_CONTENT_TYPE};
pub use envelope::{CodecError, JobEnvelope};
pub use event::{EventType, JobEvent};
pub use in_memory_broker::{DeadLetter, InMemoryBroker, InMemorySubscription, InMemoryTopic};
pub use notify::{ClientResolver, InMemoryClientResolver, Notifier, NotifyError, ResolveError};
pub use processor::{JobContext, Processor};
pub use registry::{ProcessorRegistry, Registration, RegistryError};
