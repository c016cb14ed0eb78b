// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Pull-style reading of one queue.

use crate::{
    channel::AmqpChannel,
    client::MqClient,
    errors::AmqpError,
    message::{Message, TypedMessage},
    queue::QueueDefinition,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Reads a queue one message at a time. Each `next` acknowledges the message returned
/// by the previous one.
pub struct MessageQueue {
    channel: Arc<dyn AmqpChannel>,
    queue: String,
    previous: Mutex<Option<u64>>,
}

impl MessageQueue {
    pub(crate) async fn open(
        client: &MqClient,
        queue: &str,
        queue_type: Option<&str>,
        ttl: u32,
    ) -> Result<MessageQueue, AmqpError> {
        let handle = client.connector().open().await?;

        let definition = QueueDefinition::new(queue)
            .durable(client.config().durable)
            .queue_type(queue_type)
            .ttl(ttl);
        handle
            .channel
            .queue_declare(&definition.name, definition.durable, definition.arguments())
            .await?;

        Ok(MessageQueue {
            channel: handle.channel,
            queue: queue.to_owned(),
            previous: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.queue
    }

    /// Next message of the queue, `None` when it is empty.
    pub async fn next(&self) -> Result<Option<Message>, AmqpError> {
        let mut previous = self.previous.lock().await;

        if let Some(delivery_tag) = previous.take() {
            self.channel.ack(delivery_tag, false).await?;
        }

        let Some(delivery) = self.channel.get(&self.queue).await? else {
            debug!(queue = self.queue.as_str(), "queue is empty");
            return Ok(None);
        };

        *previous = Some(delivery.delivery_tag);
        Ok(Some(Message::from_delivery(&delivery)))
    }

    pub async fn next_typed<T>(&self) -> Result<Option<TypedMessage<T>>, AmqpError> {
        Ok(self.next().await?.map(|message| message.cast::<T>()))
    }

    pub async fn message_count(&self) -> Result<u32, AmqpError> {
        self.channel.message_count(&self.queue).await
    }

    /// Acknowledges the last message and closes the channel.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if let Some(delivery_tag) = self.previous.lock().await.take() {
            self.channel.ack(delivery_tag, false).await?;
        }
        self.channel.close().await;
        Ok(())
    }
}
