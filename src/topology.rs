// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the broker topology behind a route.
//!
//! Every route owns a queue named after its routing key, bound to the primary
//! exchange `x.<type>`. Routes in dead letter mode additionally own:
//! - `<key>.retry`, bound to `x.<type>.retry`, whose expired messages dead-letter back
//!   to the primary exchange;
//! - `<key>.failed`, bound to `x.<type>.failed`, the terminal store receiving the
//!   messages the primary queue rejects.

use crate::{
    binding::RouteSpec,
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, ExchangeMode},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use tracing::debug;

/// Time messages wait in a retry queue when the route defines no TTL.
pub const DEFAULT_RETRY_TTL_MS: u32 = 6_000;

/// Names of the three exchanges of one exchange type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeNames {
    pub kind: ExchangeKind,
    pub primary: String,
    pub retry: String,
    pub failed: String,
}

impl ExchangeNames {
    pub fn new(kind: ExchangeKind) -> Self {
        ExchangeNames {
            kind,
            primary: format!("x.{kind}"),
            retry: format!("x.{kind}.retry"),
            failed: format!("x.{kind}.failed"),
        }
    }
}

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Creates the exchanges, then the queues, then the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology<'tp> {
    channel: &'tp dyn AmqpChannel,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: &'tp dyn AmqpChannel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Topology of one route.
    pub fn route(
        channel: &'tp dyn AmqpChannel,
        names: &ExchangeNames,
        durable: bool,
        spec: &RouteSpec,
    ) -> AmqpTopology<'tp> {
        let key = spec.routing_key();
        let queue_type = spec.queue_type();

        let mut primary_queue = QueueDefinition::new(key)
            .durable(durable)
            .queue_type(queue_type)
            .ttl(spec.ttl());

        let topology = AmqpTopology::new(channel).exchange(
            ExchangeDefinition::new(&names.primary)
                .kind(names.kind)
                .durable(durable),
        );

        if spec.mode() != ExchangeMode::DeadLetter {
            return topology.queue(primary_queue).queue_binding(
                QueueBinding::new(key)
                    .exchange(&names.primary)
                    .routing_key(key),
            );
        }

        let retry_queue = format!("{key}.retry");
        let failed_queue = format!("{key}.failed");
        let retry_ttl = match spec.ttl() {
            0 => DEFAULT_RETRY_TTL_MS,
            ttl => ttl,
        };

        primary_queue = primary_queue.dead_letter_exchange(&names.failed);

        topology
            .exchange(
                ExchangeDefinition::new(&names.retry)
                    .kind(names.kind)
                    .durable(durable),
            )
            .exchange(
                ExchangeDefinition::new(&names.failed)
                    .kind(names.kind)
                    .durable(durable),
            )
            .queue(primary_queue)
            .queue(
                QueueDefinition::new(&retry_queue)
                    .durable(durable)
                    .queue_type(queue_type)
                    .ttl(retry_ttl)
                    .dead_letter_exchange(&names.primary),
            )
            .queue(
                QueueDefinition::new(&failed_queue)
                    .durable(durable)
                    .queue_type(queue_type),
            )
            .queue_binding(
                QueueBinding::new(key)
                    .exchange(&names.primary)
                    .routing_key(key),
            )
            .queue_binding(
                QueueBinding::new(&retry_queue)
                    .exchange(&names.retry)
                    .routing_key(key),
            )
            .queue_binding(
                QueueBinding::new(&failed_queue)
                    .exchange(&names.failed)
                    .routing_key(key),
            )
    }
}

#[async_trait]
impl Topology for AmqpTopology<'_> {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.exchanges.contains(&def) {
            self.exchanges.push(def);
        }
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology<'_> {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel
                .exchange_declare(&exch.name, exch.kind, exch.durable)
                .await?;
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            self.channel
                .queue_declare(&def.name, def.durable, def.arguments())
                .await?;
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                )
                .await?;
        }

        Ok(())
    }
}

/// Declares the exchanges, queues and bindings of `spec`.
pub async fn set_route(
    channel: &dyn AmqpChannel,
    names: &ExchangeNames,
    durable: bool,
    spec: &RouteSpec,
) -> Result<(), AmqpError> {
    AmqpTopology::route(channel, names, durable, spec)
        .install()
        .await?;

    debug!(routing_key = spec.routing_key(), "route declared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAmqpChannel,
        queue::{AMQP_ARGS_DEAD_LETTER_EXCHANGE, AMQP_ARGS_MESSAGE_TTL, AMQP_ARGS_QUEUE_TYPE},
    };
    use lapin::types::{AMQPValue, FieldTable, LongString};
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<String>>>;
    type Queues = Arc<Mutex<Vec<(String, FieldTable)>>>;

    fn recording_channel(calls: &Calls, queues: &Queues) -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();

        let log = calls.clone();
        channel
            .expect_exchange_declare()
            .returning(move |name, kind, _| {
                log.lock()
                    .unwrap()
                    .push(format!("exchange {} {}", name, kind));
                Ok(())
            });

        let log = calls.clone();
        let declared = queues.clone();
        channel
            .expect_queue_declare()
            .returning(move |name, _, args| {
                log.lock().unwrap().push(format!("queue {}", name));
                declared.lock().unwrap().push((name.to_string(), args));
                Ok(())
            });

        let log = calls.clone();
        channel
            .expect_queue_bind()
            .returning(move |queue, exchange, key| {
                log.lock()
                    .unwrap()
                    .push(format!("bind {} {} {}", queue, exchange, key));
                Ok(())
            });

        channel
    }

    fn long_string(value: &str) -> AMQPValue {
        AMQPValue::LongString(LongString::from(value))
    }

    #[tokio::test]
    async fn normal_route_declares_a_single_queue() {
        let calls = Calls::default();
        let queues = Queues::default();
        let channel = recording_channel(&calls, &queues);

        set_route(
            &channel,
            &ExchangeNames::new(ExchangeKind::Direct),
            true,
            &RouteSpec::new("hello"),
        )
        .await
        .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "exchange x.direct direct",
                "queue hello",
                "bind hello x.direct hello",
            ]
        );
        assert!(queues.lock().unwrap()[0].1.inner().is_empty());
    }

    #[tokio::test]
    async fn dead_letter_route_wires_retry_and_failed_paths() {
        let calls = Calls::default();
        let queues = Queues::default();
        let channel = recording_channel(&calls, &queues);

        set_route(
            &channel,
            &ExchangeNames::new(ExchangeKind::Direct),
            true,
            &RouteSpec::new("enter")
                .with_mode(ExchangeMode::DeadLetter)
                .with_queue_type("quorum"),
        )
        .await
        .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "exchange x.direct direct",
                "exchange x.direct.retry direct",
                "exchange x.direct.failed direct",
                "queue enter",
                "queue enter.retry",
                "queue enter.failed",
                "bind enter x.direct enter",
                "bind enter.retry x.direct.retry enter",
                "bind enter.failed x.direct.failed enter",
            ]
        );

        let queues = queues.lock().unwrap();
        let primary = queues[0].1.inner();
        assert_eq!(
            primary.get(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
            Some(&long_string("x.direct.failed"))
        );
        assert_eq!(primary.get(AMQP_ARGS_QUEUE_TYPE), Some(&long_string("quorum")));

        let retry = queues[1].1.inner();
        assert_eq!(
            retry.get(AMQP_ARGS_DEAD_LETTER_EXCHANGE),
            Some(&long_string("x.direct"))
        );
        assert_eq!(
            retry.get(AMQP_ARGS_MESSAGE_TTL),
            Some(&AMQPValue::LongUInt(DEFAULT_RETRY_TTL_MS))
        );

        let failed = queues[2].1.inner();
        assert_eq!(failed.get(AMQP_ARGS_DEAD_LETTER_EXCHANGE), None);
        assert_eq!(failed.get(AMQP_ARGS_QUEUE_TYPE), Some(&long_string("quorum")));
    }

    #[tokio::test]
    async fn route_ttl_overrides_the_retry_default() {
        let calls = Calls::default();
        let queues = Queues::default();
        let channel = recording_channel(&calls, &queues);

        set_route(
            &channel,
            &ExchangeNames::new(ExchangeKind::Topic),
            false,
            &RouteSpec::new("num")
                .with_mode(ExchangeMode::DeadLetter)
                .with_ttl(20_000),
        )
        .await
        .unwrap();

        let queues = queues.lock().unwrap();
        assert_eq!(
            queues[1].1.inner().get(AMQP_ARGS_MESSAGE_TTL),
            Some(&AMQPValue::LongUInt(20_000))
        );
        assert_eq!(calls.lock().unwrap()[0], "exchange x.topic topic");
    }

    #[tokio::test]
    async fn declaration_failure_stops_the_setup() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_exchange_declare().returning(|_, _, _| Ok(()));
        channel
            .expect_queue_declare()
            .returning(|name, _, _| Err(AmqpError::DeclareQueueError(name.to_string())));
        channel.expect_queue_bind().never();

        let result = set_route(
            &channel,
            &ExchangeNames::new(ExchangeKind::Direct),
            true,
            &RouteSpec::new("hello"),
        )
        .await;

        assert_eq!(result, Err(AmqpError::DeclareQueueError("hello".to_owned())));
    }
}
