// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! A `MessageConsumer` owns one channel, binds any number of routes on it and, once
//! subscribed, runs one delivery loop per bound queue. Deliveries of a queue are
//! settled one after the other by `consumer::Settler`.
//!
//! Binding a route after subscribing starts its delivery loop right away. When the
//! channel shuts down, the loops stop, the channel is rebuilt, every route is declared
//! again in its original order and the loops resume with the same handler. Messages
//! left unacknowledged by the dead channel are redelivered by the broker.

use crate::{
    backup::BackupSink,
    binding::{Bindings, RouteBinding, RouteSpec},
    channel::{AmqpChannel, ChannelEvent, EventReceiver},
    client::MqClient,
    consumer::{ReplyProducers, Settler},
    errors::AmqpError,
    handler::{typed_handler_fn, HandlerError, MessageHandler, Outcome},
    link::{Link, LinkState, Restore},
    message::TypedMessage,
    teardown::Teardown,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    sync::{Arc, Mutex, RwLock, Weak},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

struct ConsumerInner {
    client: MqClient,
    link: Link,
    bindings: Bindings,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
    replies: Arc<ReplyProducers>,
    backup: BackupSink,
    watcher: Mutex<Option<JoinHandle<()>>>,
    teardown: Teardown,
}

impl ConsumerInner {
    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Starts the delivery loop of `spec` on `channel`, replacing any previous loop of
    /// the same routing key.
    async fn start_worker(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        spec: &RouteSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        let routing_key = spec.routing_key().to_owned();
        let consumer_tag = format!("{routing_key}.{}", Uuid::new_v4().simple());
        let mut deliveries = channel.consume(&routing_key, &consumer_tag).await?;

        let settler = Settler {
            channel: channel.clone(),
            names: self.client.exchanges().clone(),
            spec: spec.clone(),
            handler,
            replies: self.replies.clone(),
            backup: self.backup.clone(),
        };

        let worker = tokio::spawn(async move {
            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) = settler.settle(&delivery).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        break;
                    }
                }
            }
            debug!(consumer_tag, "delivery loop stopped");
        });

        if let Some(previous) = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(routing_key, worker)
        {
            previous.abort();
        }

        Ok(())
    }

    fn stop_workers(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for (_, worker) in workers.drain() {
            worker.abort();
        }
    }
}

#[async_trait]
impl Restore for ConsumerInner {
    async fn restore(&self, channel: &Arc<dyn AmqpChannel>) -> Result<(), AmqpError> {
        if self.client.config().fairly {
            channel.qos(1).await?;
        }
        self.bindings.rebind(channel).await?;

        if let Some(handler) = self.handler() {
            for route in self.bindings.snapshot().await {
                self.start_worker(channel, route.spec(), handler.clone())
                    .await?;
            }
        }

        Ok(())
    }
}

async fn watch(inner: Weak<ConsumerInner>, mut events: EventReceiver) {
    loop {
        let Some(event) = events.recv().await else {
            debug!("consumer event stream closed");
            return;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };

        if let ChannelEvent::Shutdown { cause } = event {
            warn!(cause, "consumer channel shut down");
            inner.stop_workers();
            events = inner.link.reboot(inner.as_ref()).await;
        }
    }
}

/// Consumes the queues of its routes with one handler.
pub struct MessageConsumer {
    inner: Arc<ConsumerInner>,
}

impl MessageConsumer {
    pub(crate) async fn open(client: MqClient) -> Result<MessageConsumer, AmqpError> {
        let config = client.config();
        let (link, events) =
            Link::open(client.connector(), config.reconnect_interval()).await?;
        if config.fairly {
            link.channel().await.qos(1).await?;
        }

        let inner = Arc::new(ConsumerInner {
            bindings: Bindings::new(
                client.exchanges().clone(),
                config.durable,
                config.refresh_interval(),
            ),
            backup: BackupSink::consume_failed(&config.backup_dir),
            replies: Arc::new(ReplyProducers::new(client.clone())),
            client: client.clone(),
            link,
            handler: RwLock::new(None),
            workers: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
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
                inner.stop_workers();
                inner.link.close().await;
                inner.bindings.clear().await;
                inner.replies.dispose().await;
                debug!("consumer disposed");
            }
            .boxed()
        }));

        Ok(MessageConsumer { inner })
    }

    /// Declares the route of `spec` unless its routing key is already bound. Once
    /// subscribed, the queue of a new route is consumed right away.
    pub async fn bind(&self, spec: RouteSpec) -> Result<Arc<RouteBinding>, AmqpError> {
        let channel = self.inner.link.channel().await;
        let (binding, created) = self.inner.bindings.bind(channel.clone(), spec).await?;

        if created {
            if let Some(handler) = self.inner.handler() {
                self.inner
                    .start_worker(&channel, binding.spec(), handler)
                    .await?;
            }
        }

        Ok(binding)
    }

    /// Bound routes, in binding order.
    pub async fn bindings(&self) -> Vec<Arc<RouteBinding>> {
        self.inner.bindings.snapshot().await
    }

    /// Consumes every bound queue with `handler`. Subscribing again replaces the
    /// handler.
    pub async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<(), AmqpError> {
        let channel = self.inner.link.channel().await;

        let previous = self
            .inner
            .handler
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handler.clone());
        if previous.is_some() {
            warn!("replacing the handler of a subscribed consumer");
        }

        for route in self.inner.bindings.snapshot().await {
            self.inner
                .start_worker(&channel, route.spec(), handler.clone())
                .await?;
        }

        Ok(())
    }

    /// `Recovering` while the consumer waits for the broker to come back.
    pub fn link_state(&self) -> LinkState {
        self.inner.link.state()
    }

    /// Cancels the workers, closes the channel and disposes the reply producers.
    pub async fn dispose(&self) {
        self.inner.teardown.run().await;
    }
}

impl Drop for MessageConsumer {
    fn drop(&mut self) {
        if self.inner.teardown.is_done() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            runtime.spawn(async move { inner.teardown.run().await });
        }
    }
}

/// Consumer of JSON encoded values of type `T`.
pub struct TypedMessageConsumer<T> {
    consumer: MessageConsumer,
    _value: PhantomData<fn() -> T>,
}

impl<T> TypedMessageConsumer<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(consumer: MessageConsumer) -> Self {
        TypedMessageConsumer {
            consumer,
            _value: PhantomData,
        }
    }

    /// See [`MessageConsumer::bind`].
    pub async fn bind(&self, spec: RouteSpec) -> Result<Arc<RouteBinding>, AmqpError> {
        self.consumer.bind(spec).await
    }

    /// Consumes decoded values. Payloads that fail to decode are handling failures.
    pub async fn subscribe<F, Fut>(&self, f: F) -> Result<(), AmqpError>
    where
        F: Fn(TypedMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
    {
        self.consumer.subscribe(typed_handler_fn(f)).await
    }

    /// Untyped consumer underneath.
    pub fn consumer(&self) -> &MessageConsumer {
        &self.consumer
    }

    pub async fn dispose(&self) {
        self.consumer.dispose().await;
    }
}
