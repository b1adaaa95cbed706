// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory bus backend.
//!
//! Single-process stand-in for the real bus with the same at-least-once
//! contract: deliveries sit in an in-flight set until acked, and
//! [`MemoryBus::redeliver_unacked`] puts them back on the queue the way a
//! broker would after a consumer crash. Used by the test suite and by
//! single-node deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::bus::{BusConsumer, BusDelivery, ResultBus};
use crate::error::OrchestratorResult;

#[derive(Default)]
struct BusState {
    queue: VecDeque<BusDelivery>,
    in_flight: HashMap<String, BusDelivery>,
    closed: bool,
}

/// In-memory implementation of the bus contract
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Requeue every unacked delivery, simulating a broker handing a crashed
    /// consumer's pending entries to the next member of the group
    pub fn redeliver_unacked(&self) {
        let mut state = self.state.lock();
        let pending: Vec<BusDelivery> = state.in_flight.drain().map(|(_, d)| d).collect();
        for delivery in pending {
            state.queue.push_back(delivery);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Number of deliveries awaiting ack
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Close the bus; consumers drain the queue and then see end-of-stream
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

#[async_trait]
impl ResultBus for MemoryBus {
    async fn publish(&self, key: &str, payload: &[u8]) -> OrchestratorResult<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delivery = BusDelivery {
            id: format!("mem-{id}"),
            key: key.to_string(),
            payload: payload.to_vec(),
        };
        self.state.lock().queue.push_back(delivery);
        self.notify.notify_one();
        Ok(())
    }

    async fn subscribe(&self, _group: &str) -> OrchestratorResult<Box<dyn BusConsumer>> {
        Ok(Box::new(MemoryConsumer { bus: self.clone() }))
    }
}

struct MemoryConsumer {
    bus: MemoryBus,
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn next(&mut self) -> OrchestratorResult<Option<BusDelivery>> {
        loop {
            let notified = self.bus.notify.notified();
            {
                let mut state = self.bus.state.lock();
                if let Some(delivery) = state.queue.pop_front() {
                    state
                        .in_flight
                        .insert(delivery.id.clone(), delivery.clone());
                    return Ok(Some(delivery));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, delivery: &BusDelivery) -> OrchestratorResult<()> {
        self.bus.state.lock().in_flight.remove(&delivery.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let bus = MemoryBus::new();
        bus.publish("t-1", b"payload-a").await.unwrap();
        bus.publish("t-2", b"payload-b").await.unwrap();

        let mut consumer = bus.subscribe("group").await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.key, "t-1");
        assert_eq!(first.payload, b"payload-a");
        consumer.ack(&first).await.unwrap();

        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.key, "t-2");
        consumer.ack(&second).await.unwrap();
        assert_eq!(bus.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_unacked_deliveries_come_back() {
        let bus = MemoryBus::new();
        bus.publish("t-1", b"payload").await.unwrap();

        let mut consumer = bus.subscribe("group").await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(bus.in_flight_len(), 1);

        // Consumer "crashes" without acking
        drop(consumer);
        bus.redeliver_unacked();

        let mut consumer = bus.subscribe("group").await.unwrap();
        let redelivered = consumer.next().await.unwrap().unwrap();
        assert_eq!(redelivered.id, delivery.id);
        assert_eq!(redelivered.payload, b"payload");
        consumer.ack(&redelivered).await.unwrap();
        assert_eq!(bus.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let bus = MemoryBus::new();
        bus.publish("t-1", b"payload").await.unwrap();
        bus.close();

        let mut consumer = bus.subscribe("group").await.unwrap();
        assert!(consumer.next().await.unwrap().is_some());
        assert!(consumer.next().await.unwrap().is_none());
    }
}
