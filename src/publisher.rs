// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! A `MessageProducer` owns one channel in publisher confirm mode and publishes every
//! message to each routing key it is bound to, on the primary exchange.
//!
//! Publishing is fire-and-forget: the message is recorded as outstanding under the
//! delivery tag the channel assigned to it and the call returns. Confirms are handled
//! in the background:
//!
//! - an ack removes the record and emits `PublishOutcome::Confirmed`;
//! - a nack republishes the record with the same correlation id, until the third nack
//!   of the same correlation id and routing key. The message is then appended to the
//!   `publish_failed` backup and `PublishOutcome::Failed` is emitted.
//!
//! When the channel shuts down the producer reboots: bindings are declared again in
//! their original order and every unconfirmed publish is replayed on the new channel.

use crate::{
    backup::BackupSink,
    binding::{Bindings, RouteBinding, RouteSpec},
    channel::{AmqpChannel, ChannelEvent, EventReceiver},
    client::MqClient,
    errors::AmqpError,
    handler::MessageHandler,
    link::{Link, LinkState, Restore},
    message::{Message, TypedMessage},
    otel,
    teardown::Teardown,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    sync::{Arc, RwLock, Weak},
    time::Duration,
};
use tokio::{
    sync::{broadcast, Mutex, Notify},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

/// Number of broker refusals after which a publish is backed up.
pub const MAX_PUBLISH_ATTEMPTS: u32 = 3;

const OUTCOME_CAPACITY: usize = 1024;

/// Terminal confirmation state of a publish, per correlation id and routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Confirmed {
        correlation_id: String,
        routing_key: String,
    },
    Failed {
        correlation_id: String,
        routing_key: String,
    },
}

impl PublishOutcome {
    /// Correlation id of the settled publish.
    pub fn correlation_id(&self) -> &str {
        match self {
            PublishOutcome::Confirmed { correlation_id, .. }
            | PublishOutcome::Failed { correlation_id, .. } => correlation_id,
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    routing_key: String,
    message: Message,
}

#[derive(Default)]
struct Outstanding {
    records: BTreeMap<u64, Pending>,
    /// Refused publishes whose republish failed on a dead channel, replayed on reboot.
    stranded: Vec<Pending>,
    failures: HashMap<(String, String), u32>,
}

impl Outstanding {
    fn len(&self) -> usize {
        self.records.len() + self.stranded.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&mut self, delivery_tag: u64, multiple: bool) -> Vec<Pending> {
        if !multiple {
            return self.records.remove(&delivery_tag).into_iter().collect();
        }

        let rest = self.records.split_off(&(delivery_tag + 1));
        std::mem::replace(&mut self.records, rest)
            .into_values()
            .collect()
    }
}

struct ProducerInner {
    client: MqClient,
    link: Link,
    bindings: Bindings,
    outstanding: Mutex<Outstanding>,
    reply_to: RwLock<Option<String>>,
    outcomes: broadcast::Sender<PublishOutcome>,
    settled: Notify,
    backup: BackupSink,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    teardown: Teardown,
}

impl ProducerInner {
    fn properties(&self, message: &Message) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_correlation_id(ShortString::from(message.correlation_id()))
            .with_headers(FieldTable::from(otel::context_headers()));

        if self.client.config().durable {
            properties = properties.with_delivery_mode(2);
        }

        if let Some(reply_to) = message.reply_to() {
            properties = properties.with_reply_to(ShortString::from(reply_to));
        }

        properties
    }

    /// Publishes `message` on the primary exchange and returns its delivery tag.
    /// Callers record it while holding the outstanding lock so its confirm cannot be
    /// handled first.
    async fn send(
        &self,
        channel: &dyn AmqpChannel,
        routing_key: &str,
        message: &Message,
    ) -> Result<u64, AmqpError> {
        channel
            .publish(
                &self.client.exchanges().primary,
                routing_key,
                self.properties(message),
                message.body(),
            )
            .await
    }

    async fn publish(&self, message: &Message) -> Result<(), AmqpError> {
        let channel = self.link.channel().await;

        let routes = self.bindings.snapshot().await;
        if routes.is_empty() {
            return Err(AmqpError::NoRouteBound);
        }

        let mut outstanding = self.outstanding.lock().await;
        for route in routes {
            let delivery_tag = self
                .send(channel.as_ref(), route.routing_key(), message)
                .await?;
            outstanding.records.insert(
                delivery_tag,
                Pending {
                    routing_key: route.routing_key().to_owned(),
                    message: message.clone(),
                },
            );
        }

        debug!(correlation_id = message.correlation_id(), "message published");
        Ok(())
    }

    fn notify(&self, outcome: PublishOutcome) {
        let _ = self.outcomes.send(outcome);
    }

    async fn on_ack(&self, delivery_tag: u64, multiple: bool) {
        let mut outstanding = self.outstanding.lock().await;

        for pending in outstanding.take(delivery_tag, multiple) {
            let correlation_id = pending.message.correlation_id().to_owned();
            outstanding
                .failures
                .remove(&(correlation_id.clone(), pending.routing_key.clone()));

            self.notify(PublishOutcome::Confirmed {
                correlation_id,
                routing_key: pending.routing_key,
            });
        }

        if outstanding.is_empty() {
            self.settled.notify_waiters();
        }
    }

    async fn on_nack(&self, delivery_tag: u64, multiple: bool) {
        let channel = self.link.channel().await;
        let mut outstanding = self.outstanding.lock().await;
        let mut exhausted = vec![];

        for pending in outstanding.take(delivery_tag, multiple) {
            let key = (
                pending.message.correlation_id().to_owned(),
                pending.routing_key.clone(),
            );
            let failures = {
                let failures = outstanding.failures.entry(key.clone()).or_insert(0);
                *failures += 1;
                *failures
            };

            if failures < MAX_PUBLISH_ATTEMPTS {
                warn!(
                    correlation_id = key.0.as_str(),
                    routing_key = key.1.as_str(),
                    failures,
                    "publish refused, republishing"
                );
                match self
                    .send(channel.as_ref(), &pending.routing_key, &pending.message)
                    .await
                {
                    Ok(delivery_tag) => {
                        outstanding.records.insert(delivery_tag, pending);
                    }
                    Err(err) => {
                        warn!(
                            error = err.to_string(),
                            correlation_id = key.0.as_str(),
                            "failure to republish, holding until reboot"
                        );
                        outstanding.stranded.push(pending);
                    }
                }
                continue;
            }

            outstanding.failures.remove(&key);
            exhausted.push(pending);
        }

        if outstanding.is_empty() {
            self.settled.notify_waiters();
        }
        drop(outstanding);
        drop(channel);

        for pending in exhausted {
            error!(
                correlation_id = pending.message.correlation_id(),
                routing_key = pending.routing_key.as_str(),
                "publish failed, backing up"
            );
            if let Err(err) = pending
                .message
                .backup(&self.backup.path(&pending.routing_key))
                .await
            {
                error!(error = err.to_string(), "failure to back up message");
            }

            self.notify(PublishOutcome::Failed {
                correlation_id: pending.message.correlation_id().to_owned(),
                routing_key: pending.routing_key,
            });
        }
    }

    async fn dispose(&self) {
        self.teardown.run().await;
    }
}

#[async_trait]
impl Restore for ProducerInner {
    async fn restore(&self, channel: &Arc<dyn AmqpChannel>) -> Result<(), AmqpError> {
        channel.confirm_select().await?;
        self.bindings.rebind(channel).await?;

        let mut outstanding = self.outstanding.lock().await;
        if !outstanding.is_empty() {
            warn!(
                count = outstanding.len() as u64,
                "replaying unconfirmed publishes"
            );
        }

        let mut replayed = BTreeMap::new();
        for pending in outstanding.records.values().chain(&outstanding.stranded) {
            let delivery_tag = self
                .send(channel.as_ref(), &pending.routing_key, &pending.message)
                .await?;
            replayed.insert(delivery_tag, pending.clone());
        }
        outstanding.records = replayed;
        outstanding.stranded.clear();

        Ok(())
    }
}

async fn watch(inner: Weak<ProducerInner>, mut events: EventReceiver) {
    loop {
        let Some(event) = events.recv().await else {
            debug!("producer event stream closed");
            return;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match event {
            ChannelEvent::Ack {
                delivery_tag,
                multiple,
            } => inner.on_ack(delivery_tag, multiple).await,
            ChannelEvent::Nack {
                delivery_tag,
                multiple,
            } => inner.on_nack(delivery_tag, multiple).await,
            ChannelEvent::Shutdown { cause } => {
                warn!(cause, "producer channel shut down");
                events = inner.link.reboot(inner.as_ref()).await;
            }
        }
    }
}

/// Publishes messages with confirms, retries and reboot.
pub struct MessageProducer {
    inner: Arc<ProducerInner>,
}

impl MessageProducer {
    pub(crate) async fn open(client: MqClient) -> Result<MessageProducer, AmqpError> {
        let config = client.config();
        let (link, events) =
            Link::open(client.connector(), config.reconnect_interval()).await?;
        link.channel().await.confirm_select().await?;

        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        let inner = Arc::new(ProducerInner {
            bindings: Bindings::new(
                client.exchanges().clone(),
                config.durable,
                config.refresh_interval(),
            ),
            backup: BackupSink::publish_failed(&config.backup_dir),
            client: client.clone(),
            link,
            outstanding: Mutex::new(Outstanding::default()),
            reply_to: RwLock::new(None),
            outcomes,
            settled: Notify::new(),
            watcher: std::sync::Mutex::new(None),
            teardown: Teardown::new(),
        });

        let watcher = tokio::spawn(watch(Arc::downgrade(&inner), events));
        *inner.watcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(watcher);

        let weak = Arc::downgrade(&inner);
        inner.teardown.push(Box::new(move || {
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Some(watcher) = inner
                    .watcher
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .take()
                {
                    watcher.abort();
                }
                inner.link.close().await;
                inner.bindings.clear().await;
                debug!("producer disposed");
            }
            .boxed()
        }));

        Ok(MessageProducer { inner })
    }

    /// Declares the route of `spec` unless its routing key is already bound.
    pub async fn bind(&self, spec: RouteSpec) -> Result<Arc<RouteBinding>, AmqpError> {
        let channel = self.inner.link.channel().await;
        let (binding, _) = self.inner.bindings.bind(channel.clone(), spec).await?;
        Ok(binding)
    }

    /// Bound routes, in binding order.
    pub async fn bindings(&self) -> Vec<Arc<RouteBinding>> {
        self.inner.bindings.snapshot().await
    }

    /// Routing key sent as reply-to with every subsequent publish.
    pub fn reply_to(&self, routing_key: impl Into<String>) {
        *self
            .inner
            .reply_to
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(routing_key.into());
    }

    /// Reply-to key set by `reply_to` or `reply_with`, if any.
    pub fn reply_to_key(&self) -> Option<String> {
        self.inner
            .reply_to
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Sets reply-to and consumes the replies with `handler`, on `routing_key` or by
    /// default on `r.<first bound routing key>`. The reply consumer is disposed with
    /// the producer.
    pub async fn reply_with(
        &self,
        handler: Arc<dyn MessageHandler>,
        routing_key: Option<String>,
    ) -> Result<String, AmqpError> {
        let routing_key = match routing_key {
            Some(key) => key,
            None => {
                let routes = self.inner.bindings.snapshot().await;
                let first = routes.first().ok_or(AmqpError::NoRouteBound)?;
                format!("r.{}", first.routing_key())
            }
        };

        let consumer = self.inner.client.consumer().await?;
        consumer.bind(RouteSpec::new(routing_key.clone())).await?;
        consumer.subscribe(handler).await?;

        self.inner.teardown.push(Box::new(move || {
            async move { consumer.dispose().await }.boxed()
        }));
        self.reply_to(routing_key.clone());

        Ok(routing_key)
    }

    /// Publishes `content` to every bound routing key. A correlation id is generated
    /// when none is given.
    pub async fn publish(
        &self,
        content: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Result<Message, AmqpError> {
        let message = Message::new(content, correlation_id).with_reply_to(self.reply_to_key());
        self.inner.publish(&message).await?;
        Ok(message)
    }

    pub(crate) async fn publish_message(&self, message: &Message) -> Result<(), AmqpError> {
        self.inner.publish(message).await
    }

    /// Receiver of the terminal outcome of every publish made after this call.
    pub fn outcomes(&self) -> broadcast::Receiver<PublishOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// `Recovering` while the producer waits for the broker to come back. Publishes
    /// made meanwhile wait for the reboot.
    pub fn link_state(&self) -> LinkState {
        self.inner.link.state()
    }

    /// Number of publishes not yet confirmed or backed up, including those waiting
    /// for a reboot to be replayed.
    pub async fn outstanding(&self) -> usize {
        self.inner.outstanding.lock().await.len()
    }

    /// Waits until every outstanding publish is confirmed or backed up.
    pub async fn wait_for_confirms_or_die(&self, timeout: Duration) -> Result<(), AmqpError> {
        let settled = async {
            loop {
                let notified = self.inner.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.inner.outstanding.lock().await.is_empty() {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, settled).await.map_err(|_| {
            error!(timeout_ms = timeout.as_millis() as u64, "publishes not confirmed in time");
            AmqpError::ConfirmTimeout(timeout.as_millis())
        })
    }

    /// Stops confirm handling, closes the channel and disposes the reply consumer.
    /// Disposing again does nothing.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

impl Drop for MessageProducer {
    fn drop(&mut self) {
        if self.inner.teardown.is_done() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            runtime.spawn(async move { inner.dispose().await });
        }
    }
}

/// Producer of JSON encoded values of type `T`.
pub struct TypedMessageProducer<T> {
    producer: MessageProducer,
    _value: PhantomData<fn(T)>,
}

impl<T: Serialize> TypedMessageProducer<T> {
    pub(crate) fn new(producer: MessageProducer) -> Self {
        TypedMessageProducer {
            producer,
            _value: PhantomData,
        }
    }

    /// Publishes `value` JSON encoded to every bound routing key.
    pub async fn publish(
        &self,
        value: T,
        correlation_id: Option<String>,
    ) -> Result<TypedMessage<T>, AmqpError> {
        let typed = TypedMessage::new(value, correlation_id)?
            .with_reply_to(self.producer.reply_to_key());
        self.producer.publish_message(typed.message()).await?;
        Ok(typed)
    }

    /// See [`MessageProducer::bind`].
    pub async fn bind(&self, spec: RouteSpec) -> Result<Arc<RouteBinding>, AmqpError> {
        self.producer.bind(spec).await
    }

    /// See [`MessageProducer::reply_with`].
    pub async fn reply_with_typed(
        &self,
        handler: Arc<dyn MessageHandler>,
        routing_key: Option<String>,
    ) -> Result<String, AmqpError> {
        self.producer.reply_with(handler, routing_key).await
    }

    /// Untyped producer underneath.
    pub fn producer(&self) -> &MessageProducer {
        &self.producer
    }
}
