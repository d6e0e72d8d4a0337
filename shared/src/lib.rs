//! Pieces shared by every SAGA participant: the event protocol, error
//! classification, the consumer-side idempotency gate, and the
//! transactional outbox.

pub mod consumer;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod outbox;

pub use consumer::{run_consumer, EventDispatch};
pub use error::{is_unique_violation, ErrorCode, SagaError};
pub use events::*;
pub use idempotency::{event_key, IdempotencyStore, InMemoryStore, RedisStore, PROCESSED_TTL};
pub use outbox::{enqueue, DbPool, OutboxRelay};
