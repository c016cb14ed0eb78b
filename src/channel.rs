// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines the transport seam the courier is built on and its `lapin`
//! implementation.
//!
//! - `Connector` opens a fresh connection and channel pair, exclusively owned by the
//!   component that asked for it, and probes broker connectivity.
//! - `AmqpChannel` is the set of channel operations the courier needs: declarations,
//!   publishing with publisher confirms, consuming, settlement and closing.
//! - `ChannelEvent` carries publisher confirms and channel shutdowns to the owner of
//!   the channel, in the order the transport reported them.

use crate::{config::MqConfig, errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[cfg(test)]
pub(crate) mod fake;

/// Stream of deliveries of one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Receiving side of the events of one channel.
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// Asynchronous notifications emitted by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The broker accepted the publish `delivery_tag` (and all before it if `multiple`).
    Ack { delivery_tag: u64, multiple: bool },
    /// The broker refused the publish `delivery_tag` (and all before it if `multiple`).
    Nack { delivery_tag: u64, multiple: bool },
    /// The channel or its connection went away.
    Shutdown { cause: String },
}

/// A message delivered by the broker, detached from the transport's acker.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// A freshly opened channel together with its event stream.
pub struct ChannelHandle {
    pub channel: Arc<dyn AmqpChannel>,
    pub events: EventReceiver,
}

/// Opens connection and channel pairs.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection and a channel on it.
    async fn open(&self) -> Result<ChannelHandle, AmqpError>;

    /// Lightweight connectivity check used while recovering from a shutdown.
    async fn probe(&self) -> bool;
}

/// Channel operations used by producers, consumers and route bindings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Passive declaration returning the number of ready messages.
    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Puts the channel in publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Publishes a message and returns its delivery tag. Tags are only meaningful on
    /// channels in confirm mode, where they increase monotonically from 1.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<u64, AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    /// Closes the channel, then its connection.
    async fn close(&self);
}

/// Creates a new AMQP connection and a channel on it.
///
/// Every configured host is tried in order; the first successful connection wins.
pub async fn new_amqp_channel(cfg: &MqConfig) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");

    let mut connection = None;
    for uri in cfg.uris() {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        match Connection::connect(&uri, options).await {
            Ok(conn) => {
                connection = Some(conn);
                break;
            }
            Err(err) => error!(error = err.to_string(), "failure to connect"),
        }
    }

    let Some(conn) = connection else {
        return Err(AmqpError::ConnectionError);
    };
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// `Connector` backed by `lapin`.
pub struct LapinConnector {
    config: MqConfig,
}

impl LapinConnector {
    pub fn new(config: MqConfig) -> Self {
        LapinConnector { config }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn open(&self) -> Result<ChannelHandle, AmqpError> {
        let (connection, channel) = new_amqp_channel(&self.config).await?;
        let (sender, events) = mpsc::unbounded_channel();

        let tx = sender.clone();
        channel.on_error(move |err| {
            warn!(error = err.to_string(), "channel error");
            let _ = tx.send(ChannelEvent::Shutdown {
                cause: err.to_string(),
            });
        });

        let tx = sender.clone();
        connection.on_error(move |err| {
            warn!(error = err.to_string(), "connection error");
            let _ = tx.send(ChannelEvent::Shutdown {
                cause: err.to_string(),
            });
        });

        let channel = Arc::new(LapinChannel {
            connection,
            channel,
            events: sender,
            confirms: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        });

        Ok(ChannelHandle { channel, events })
    }

    async fn probe(&self) -> bool {
        match new_amqp_channel(&self.config).await {
            Ok((connection, channel)) => {
                let _ = channel.close(200, "probe").await;
                let _ = connection.close(200, "probe").await;
                true
            }
            Err(_) => false,
        }
    }
}

/// A `lapin` channel with the connection it exclusively owns.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
    events: mpsc::UnboundedSender<ChannelEvent>,
    confirms: AtomicBool,
    sequence: AtomicU64,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|q| q.message_count())
            .map_err(|_| AmqpError::InspectQueueError(queue.to_owned()))
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ConfirmSelectError
            })?;

        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<u64, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })?;

        if !self.confirms.load(Ordering::SeqCst) {
            return Ok(0);
        }

        let delivery_tag = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match confirm.await {
                Ok(Confirmation::Nack(_)) => ChannelEvent::Nack {
                    delivery_tag,
                    multiple: false,
                },
                Ok(_) => ChannelEvent::Ack {
                    delivery_tag,
                    multiple: false,
                },
                Err(err) => {
                    warn!(error = err.to_string(), delivery_tag, "publisher confirm lost");
                    ChannelEvent::Nack {
                        delivery_tag,
                        multiple: false,
                    }
                }
            };
            let _ = events.send(event);
        });

        Ok(delivery_tag)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ChannelClosed(err.to_string()))
            })
            .boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        self.channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map(|message| message.map(|m| Delivery::from(m.delivery)))
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to get message");
                AmqpError::GetMessageError(queue.to_owned())
            })
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected() && self.connection.status().connected()
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(200, "closing").await {
            debug!(error = err.to_string(), "channel already closed");
        }
        if let Err(err) = self.connection.close(200, "closing").await {
            debug!(error = err.to_string(), "connection already closed");
        }
    }
}
