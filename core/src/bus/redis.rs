// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Redis Streams bus backend.
//!
//! One stream key is the topic; XADD publishes, a consumer group created
//! with MKSTREAM reads via XREADGROUP, and XACK is the offset commit.
//! Entries that are read but never acked stay in the group's pending list
//! and are claimed again on restart, which carries the at-least-once
//! contract end to end.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::bus::{BusConsumer, BusDelivery, ResultBus};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Stream field carrying the message key
const FIELD_KEY: &str = "key";
/// Stream field carrying the serialized payload
const FIELD_PAYLOAD: &str = "payload";

/// Redis Streams implementation of the bus contract
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
    topic: String,
}

impl RedisBus {
    /// Connect to the broker
    pub async fn connect(url: &str, topic: &str) -> OrchestratorResult<Self> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            publisher,
            topic: topic.to_string(),
        })
    }

    async fn ensure_group(&self, group: &str) -> OrchestratorResult<()> {
        let mut conn = self.publisher.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.topic, group, "$")
            .await;
        match created {
            Ok(()) => debug!(topic = %self.topic, group, "created consumer group"),
            Err(err) if err.to_string().contains("BUSYGROUP") => {
                // Group already exists; a rejoin after restart
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

#[async_trait]
impl ResultBus for RedisBus {
    async fn publish(&self, key: &str, payload: &[u8]) -> OrchestratorResult<()> {
        let mut conn = self.publisher.clone();
        let _: String = conn
            .xadd(
                &self.topic,
                "*",
                &[(FIELD_KEY, key.as_bytes()), (FIELD_PAYLOAD, payload)],
            )
            .await?;
        Ok(())
    }

    async fn subscribe(&self, group: &str) -> OrchestratorResult<Box<dyn BusConsumer>> {
        self.ensure_group(group).await?;

        // A dedicated connection: XREADGROUP blocks, which would stall a
        // shared multiplexed connection.
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(OrchestratorError::from)?;

        Ok(Box::new(RedisConsumer {
            conn,
            topic: self.topic.clone(),
            group: group.to_string(),
            consumer_name: format!("consumer-{}", uuid::Uuid::new_v4()),
            replay_pending: true,
        }))
    }
}

struct RedisConsumer {
    conn: redis::aio::MultiplexedConnection,
    topic: String,
    group: String,
    consumer_name: String,
    /// First reads replay this consumer group's unacked entries before
    /// switching to new ones
    replay_pending: bool,
}

impl RedisConsumer {
    fn delivery_from_entry(entry: &redis::streams::StreamId) -> Option<BusDelivery> {
        let key: String = entry.get(FIELD_KEY)?;
        let payload: Vec<u8> = entry.get(FIELD_PAYLOAD)?;
        Some(BusDelivery {
            id: entry.id.clone(),
            key,
            payload,
        })
    }
}

#[async_trait]
impl BusConsumer for RedisConsumer {
    async fn next(&mut self) -> OrchestratorResult<Option<BusDelivery>> {
        loop {
            let cursor = if self.replay_pending { "0" } else { ">" };
            let options = StreamReadOptions::default()
                .group(&self.group, &self.consumer_name)
                .count(1)
                .block(1000);

            let reply: StreamReadReply = self
                .conn
                .xread_options(&[&self.topic], &[cursor], &options)
                .await?;

            let entry = reply
                .keys
                .iter()
                .flat_map(|k| k.ids.iter())
                .next()
                .cloned();

            match entry {
                Some(entry) => match Self::delivery_from_entry(&entry) {
                    Some(delivery) => return Ok(Some(delivery)),
                    None => {
                        // Malformed entry: commit it away rather than looping
                        warn!(id = %entry.id, "dropping malformed bus entry");
                        let _: i64 = self
                            .conn
                            .xack(&self.topic, &self.group, &[&entry.id])
                            .await?;
                    }
                },
                None if self.replay_pending => {
                    // Pending backlog drained; read new entries from now on
                    self.replay_pending = false;
                }
                None => {
                    // Block timeout with nothing new; poll again
                }
            }
        }
    }

    async fn ack(&mut self, delivery: &BusDelivery) -> OrchestratorResult<()> {
        let _: i64 = self
            .conn
            .xack(&self.topic, &self.group, &[&delivery.id])
            .await?;
        Ok(())
    }
}
