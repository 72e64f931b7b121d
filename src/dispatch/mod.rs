//! 派发层：退避策略、投递通道、派发引擎

pub mod backoff;
pub mod engine;
pub mod mock;
pub mod transport;

pub use backoff::{RecordingSleeper, RetryPolicy, Sleeper, TokioSleeper};
pub use engine::{AttemptOutcome, DeliveryAttempt, DeliveryPayload, DeliveryResult, DispatchEngine, ProbeReport};
pub use mock::{MockTransport, RecordedDelivery};
pub use transport::{DeliveryTransport, HttpTransport, TransportError, TransportResponse};
