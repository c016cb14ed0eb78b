// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Settlement
//!
//! Every delivered message goes through `Settler::settle`:
//!
//! 1. the handler runs inside a consumer span; errors and panics count as failures;
//! 2. when the message carries a reply-to key, the reply is published there through a
//!    cached reply producer and the delivery is acknowledged;
//! 3. otherwise the outcome settles the delivery. A failure on a dead-letter route
//!    is forwarded to the retry exchange with an expiration growing with the death
//!    count found in the `x-death` header, and rejected to the failed queue once that
//!    count reaches the retry ceiling. A failure on a plain route is rejected at once.
//!
//! Rejected messages are appended to the `consume_failed` backup.

use crate::{
    backup::BackupSink,
    binding::RouteSpec,
    channel::{AmqpChannel, Delivery},
    client::MqClient,
    errors::AmqpError,
    exchange::ExchangeMode,
    handler::{MessageHandler, Outcome},
    message::Message,
    otel,
    publisher::MessageProducer,
    topology::ExchangeNames,
};
use futures_util::FutureExt;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Deaths after which a failed message is rejected instead of retried.
pub const MAX_DEATH_COUNT: i64 = 3;
/// Expiration step of the retry path, in milliseconds.
pub const RETRY_STEP_MS: i64 = 10_000;

/// How a delivery ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Unsettled,
    /// Forwarded to the retry exchange with this expiration, then acked.
    Retried { expiration_ms: i64 },
    /// Rejected to the failed queue and backed up.
    DeadLettered,
    /// Rejected without retry path and backed up.
    Rejected,
}

/// Lazily created producers sending replies, one per reply-to key.
pub(crate) struct ReplyProducers {
    client: MqClient,
    producers: tokio::sync::Mutex<HashMap<String, Arc<MessageProducer>>>,
}

impl ReplyProducers {
    pub(crate) fn new(client: MqClient) -> Self {
        ReplyProducers {
            client,
            producers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn reply(
        &self,
        reply_to: &str,
        payload: String,
        correlation_id: &str,
    ) -> Result<(), AmqpError> {
        let producer = {
            let mut producers = self.producers.lock().await;
            match producers.get(reply_to) {
                Some(producer) => producer.clone(),
                None => {
                    let producer = Arc::new(self.client.producer().await?);
                    producer.bind(RouteSpec::new(reply_to)).await?;
                    producers.insert(reply_to.to_owned(), producer.clone());
                    producer
                }
            }
        };

        producer
            .publish(payload, Some(correlation_id.to_owned()))
            .await
            .map(|_| ())
    }

    pub(crate) async fn dispose(&self) {
        let producers: Vec<_> = self.producers.lock().await.drain().collect();
        for (reply_to, producer) in producers {
            debug!(reply_to, "disposing reply producer");
            producer.dispose().await;
        }
    }
}

/// Settles the deliveries of one route.
#[derive(Clone)]
pub(crate) struct Settler {
    pub(crate) channel: Arc<dyn AmqpChannel>,
    pub(crate) names: ExchangeNames,
    pub(crate) spec: RouteSpec,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) replies: Arc<ReplyProducers>,
    pub(crate) backup: BackupSink,
}

impl Settler {
    pub(crate) async fn settle(&self, delivery: &Delivery) -> Result<Settlement, AmqpError> {
        let routing_key = self.spec.routing_key();
        let mut span = otel::new_span(
            &delivery.properties,
            &global::tracer("amqp consumer"),
            routing_key,
        );

        let message = Message::from_delivery(delivery);
        debug!(
            routing_key,
            correlation_id = message.correlation_id(),
            "message received"
        );

        let outcome = match AssertUnwindSafe(self.handler.handle(&message))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(err)) => {
                error!(error = err.to_string(), routing_key, "handler failure");
                span.record_error(err.as_ref());
                None
            }
            Err(_) => {
                error!(routing_key, "handler panicked");
                None
            }
        };

        let success = match (outcome, message.reply_to()) {
            (None, _) => false,
            (Some(outcome), Some(reply_to)) => self.reply(reply_to, &message, outcome).await,
            (Some(Outcome::Ignore), None) => {
                debug!(routing_key, "message left unsettled");
                return Ok(Settlement::Unsettled);
            }
            (Some(Outcome::Failure), None) => false,
            (Some(Outcome::Success | Outcome::Reply(_)), None) => true,
        };

        let settlement = if success {
            self.channel.ack(delivery.delivery_tag, false).await?;
            Settlement::Acked
        } else {
            self.fail(delivery, &message).await?
        };

        match &settlement {
            Settlement::Acked => span.set_status(Status::Ok),
            other => span.set_status(Status::Error {
                description: Cow::from(format!("{other:?}")),
            }),
        }
        span.end();

        Ok(settlement)
    }

    /// Publishes the reply and tells whether the delivery succeeded.
    async fn reply(&self, reply_to: &str, message: &Message, outcome: Outcome) -> bool {
        let payload = match outcome {
            Outcome::Reply(payload) => payload,
            Outcome::Success => true.to_string(),
            Outcome::Failure => false.to_string(),
            Outcome::Ignore => return false,
        };

        match self
            .replies
            .reply(reply_to, payload, message.correlation_id())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                error!(error = err.to_string(), reply_to, "failure to reply");
                false
            }
        }
    }

    async fn fail(&self, delivery: &Delivery, message: &Message) -> Result<Settlement, AmqpError> {
        let routing_key = self.spec.routing_key();

        if self.spec.mode() == ExchangeMode::DeadLetter {
            let count = death_count(&delivery.properties);

            if count < MAX_DEATH_COUNT {
                let expiration_ms = (count + 1) * RETRY_STEP_MS;
                warn!(
                    routing_key,
                    death_count = count,
                    expiration_ms,
                    "handler failure, sending to retry"
                );

                self.channel
                    .publish(
                        &self.names.retry,
                        routing_key,
                        delivery
                            .properties
                            .clone()
                            .with_expiration(ShortString::from(expiration_ms.to_string())),
                        &delivery.data,
                    )
                    .await?;
                self.channel.ack(delivery.delivery_tag, false).await?;

                return Ok(Settlement::Retried { expiration_ms });
            }

            error!(routing_key, death_count = count, "too many attempts, dead lettering");
            self.channel
                .nack(delivery.delivery_tag, false, false)
                .await?;
            self.back_up(message).await;
            return Ok(Settlement::DeadLettered);
        }

        error!(routing_key, "handler failure, rejecting");
        self.channel
            .nack(delivery.delivery_tag, false, false)
            .await?;
        self.back_up(message).await;
        Ok(Settlement::Rejected)
    }

    async fn back_up(&self, message: &Message) {
        let path = self.backup.path(self.spec.routing_key());
        if let Err(err) = message.backup(&path).await {
            error!(error = err.to_string(), "failure to back up message");
        }
    }
}

/// Number of times the message went through dead lettering, read from the first
/// `x-death` entry.
pub(crate) fn death_count(props: &AMQPProperties) -> i64 {
    let Some(headers) = props.headers() else {
        return 0;
    };

    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(|death| death.as_field_table())
        .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
        .and_then(as_integer)
        .unwrap_or_default()
}

fn as_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}
