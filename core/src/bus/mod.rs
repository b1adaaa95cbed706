// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Result bus boundary.
//!
//! The bus is an at-least-once pub/sub with consumer-group semantics and
//! explicit commit: a delivery that is never acked comes back. Handlers on
//! the consuming side must therefore be idempotent. Workers publish raw
//! results keyed by test id; the aggregator is the single consumer group.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBus;
pub use self::redis::RedisBus;

use async_trait::async_trait;

use crate::error::OrchestratorResult;

/// One message delivered to a consumer, pending explicit ack
#[derive(Debug, Clone)]
pub struct BusDelivery {
    /// Bus-assigned delivery id, used for the commit
    pub id: String,
    /// Message key (the test id)
    pub key: String,
    /// Serialized raw-result payload
    pub payload: Vec<u8>,
}

/// Producer/consumer contract for the result bus
#[async_trait]
pub trait ResultBus: Send + Sync {
    /// Publish a keyed payload to the topic
    async fn publish(&self, key: &str, payload: &[u8]) -> OrchestratorResult<()>;

    /// Join the topic as a member of `group` and start consuming
    async fn subscribe(&self, group: &str) -> OrchestratorResult<Box<dyn BusConsumer>>;
}

/// A consumer-group member's view of the topic
#[async_trait]
pub trait BusConsumer: Send {
    /// Await the next delivery. `None` means the bus has shut down.
    async fn next(&mut self) -> OrchestratorResult<Option<BusDelivery>>;

    /// Commit a delivery after its payload has been durably processed.
    /// Deliveries left unacked are redelivered.
    async fn ack(&mut self, delivery: &BusDelivery) -> OrchestratorResult<()>;
}
