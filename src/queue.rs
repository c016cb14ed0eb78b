// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining queues and their bindings. Queue
//! definitions carry the arguments the courier relies on: the queue type selector,
//! the dead letter exchange and the message time-to-live.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the argument selecting the queue type
pub const AMQP_ARGS_QUEUE_TYPE: &str = "x-queue-type";
/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_ARGS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify message TTL
pub const AMQP_ARGS_MESSAGE_TTL: &str = "x-message-ttl";

/// The default queue type.
pub const QUEUE_TYPE_CLASSIC: &str = "classic";
/// Replicated queue type, available since RabbitMQ 3.8.
pub const QUEUE_TYPE_QUORUM: &str = "quorum";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) queue_type: Option<String>,
    pub(crate) ttl: Option<u32>,
    pub(crate) dead_letter_exchange: Option<String>,
}

impl QueueDefinition {
    /// Creates a new, non durable, queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets the queue type. Blank types are ignored.
    pub fn queue_type(mut self, queue_type: Option<&str>) -> Self {
        self.queue_type = queue_type
            .filter(|kind| !kind.trim().is_empty())
            .map(str::to_owned);
        self
    }

    /// Sets the message Time-To-Live (TTL) in milliseconds. Zero means no TTL.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = (ttl > 0).then_some(ttl);
        self
    }

    /// Routes rejected and expired messages to the given exchange.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Builds the declaration arguments.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::<ShortString, AMQPValue>::new();

        if let Some(queue_type) = &self.queue_type {
            args.insert(
                ShortString::from(AMQP_ARGS_QUEUE_TYPE),
                AMQPValue::LongString(LongString::from(queue_type.as_str())),
            );
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_ARGS_MESSAGE_TTL),
                AMQPValue::LongUInt(ttl),
            );
        }

        FieldTable::from(args)
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue. The exchange name and
    /// routing key are empty until set.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
