// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Remote Procedures
//!
//! A `RemoteProcedure` is built from one-way messaging plus correlation:
//!
//! - the caller side publishes requests on the routing key with reply-to set to
//!   `r.<routing key>`, and consumes that reply queue to complete pending calls;
//! - the answer side consumes the request queue. The reply forwarding of the consumer
//!   sends whatever the answer handler returns back to the reply-to key.
//!
//! Each call registers a pending record under a fresh correlation id before the
//! request is published. A call that times out removes its record, so a late reply
//! finds no waiter and is dropped.

use crate::{
    binding::RouteSpec,
    client::MqClient,
    dispatcher::MessageConsumer,
    errors::AmqpError,
    handler::{handler_fn, HandlerError, Outcome},
    message::{new_correlation_id, Message, TypedMessage},
    publisher::MessageProducer,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{oneshot, OnceCell},
    task::JoinHandle,
};
use tracing::{debug, error};

/// Prefix of the reply routing key of a procedure.
pub const REPLY_PREFIX: &str = "r.";

/// Waiters of in-flight calls, by correlation id.
#[derive(Default)]
struct PendingCalls {
    waiters: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl PendingCalls {
    fn register(&self, correlation_id: &str) -> oneshot::Receiver<Message> {
        let (sender, receiver) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(correlation_id.to_owned(), sender);
        receiver
    }

    fn evict(&self, correlation_id: &str) {
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(correlation_id);
    }

    fn reply(&self, message: Message) -> bool {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(message.correlation_id());

        match waiter {
            Some(waiter) => waiter.send(message).is_ok(),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

struct Caller {
    producer: MessageProducer,
    replies: MessageConsumer,
}

/// Request/response over a routing key.
pub struct RemoteProcedure {
    client: MqClient,
    spec: RouteSpec,
    calls: Arc<PendingCalls>,
    caller: OnceCell<Caller>,
    answerer: OnceCell<MessageConsumer>,
}

impl RemoteProcedure {
    pub(crate) fn new(client: MqClient, spec: RouteSpec) -> Self {
        RemoteProcedure {
            client,
            spec,
            calls: Arc::new(PendingCalls::default()),
            caller: OnceCell::new(),
            answerer: OnceCell::new(),
        }
    }

    /// Routing key requests are published to.
    pub fn routing_key(&self) -> &str {
        self.spec.routing_key()
    }

    /// Routing key replies come back on, `r.<routing key>`.
    pub fn reply_key(&self) -> String {
        format!("{REPLY_PREFIX}{}", self.spec.routing_key())
    }

    /// Sets up the caller side: the request producer and the reply consumer. Binding
    /// again is a no-op.
    pub async fn bind(&self) -> Result<(), AmqpError> {
        self.caller
            .get_or_try_init(|| async {
                let reply_key = self.reply_key();

                let producer = self.client.producer().await?;
                producer.bind(self.spec.clone()).await?;
                producer.reply_to(reply_key.clone());

                let replies = self.client.consumer().await?;
                replies.bind(RouteSpec::new(reply_key)).await?;

                let calls = self.calls.clone();
                replies
                    .subscribe(handler_fn(move |message: Message| {
                        let calls = calls.clone();
                        async move {
                            let correlation_id = message.correlation_id().to_owned();
                            if !calls.reply(message) {
                                debug!(correlation_id, "reply without waiter dropped");
                            }
                            Ok::<_, HandlerError>(Outcome::Success)
                        }
                    }))
                    .await?;

                Ok::<_, AmqpError>(Caller { producer, replies })
            })
            .await
            .map(|_| ())
    }

    /// Completes the call waiting on the correlation id of `message`. Returns whether
    /// a waiter was found.
    pub fn reply(&self, message: Message) -> bool {
        self.calls.reply(message)
    }

    /// Publishes `content` and waits up to `timeout` for the reply. A call without
    /// reply in time returns `None`.
    pub async fn call(
        &self,
        content: impl Into<String>,
        timeout: Duration,
    ) -> Result<Option<Message>, AmqpError> {
        let caller = self.caller.get().ok_or(AmqpError::NoRouteBound)?;

        let correlation_id = new_correlation_id();
        let waiter = self.calls.register(&correlation_id);

        if let Err(err) = caller
            .producer
            .publish(content, Some(correlation_id.clone()))
            .await
        {
            self.calls.evict(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => {
                error!(correlation_id, "missing reply");
                Ok(None)
            }
            Err(_) => {
                self.calls.evict(&correlation_id);
                error!(
                    correlation_id,
                    routing_key = self.spec.routing_key(),
                    timeout_ms = timeout.as_millis() as u64,
                    "call timed out"
                );
                Ok(None)
            }
        }
    }

    /// Runs `call` in the background.
    /// Runs `call` on its own task.
    pub fn spawn_call(
        self: &Arc<Self>,
        content: impl Into<String>,
        timeout: Duration,
    ) -> JoinHandle<Result<Option<Message>, AmqpError>> {
        let procedure = self.clone();
        let content = content.into();
        tokio::spawn(async move { procedure.call(content, timeout).await })
    }

    /// Serves the procedure: every request is answered with what `f` returns.
    pub async fn answer<F, Fut>(&self, f: F) -> Result<(), AmqpError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, HandlerError>> + Send + 'static,
    {
        let answerer = self
            .answerer
            .get_or_try_init(|| async {
                let consumer = self.client.consumer().await?;
                consumer.bind(self.spec.clone()).await?;
                Ok::<_, AmqpError>(consumer)
            })
            .await?;

        answerer
            .subscribe(handler_fn(move |message: Message| {
                let answer = f(message);
                async move { answer.await.map(Outcome::Reply) }
            }))
            .await
    }

    /// Number of calls waiting for their reply.
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Disposes whichever of the caller and answerer sides were set up.
    pub async fn dispose(&self) {
        if let Some(caller) = self.caller.get() {
            caller.replies.dispose().await;
            caller.producer.dispose().await;
        }
        if let Some(answerer) = self.answerer.get() {
            answerer.dispose().await;
        }
    }
}

/// Remote procedure taking `S` and returning `R`, both JSON encoded.
pub struct TypedRemoteProcedure<S, R> {
    procedure: Arc<RemoteProcedure>,
    _types: PhantomData<fn(S) -> R>,
}

impl<S, R> TypedRemoteProcedure<S, R>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(procedure: RemoteProcedure) -> Self {
        TypedRemoteProcedure {
            procedure: Arc::new(procedure),
            _types: PhantomData,
        }
    }

    /// See [`RemoteProcedure::bind`].
    pub async fn bind(&self) -> Result<(), AmqpError> {
        self.procedure.bind().await
    }

    /// Calls the procedure with `value`. A call without reply in time returns `None`.
    pub async fn call(&self, value: S, timeout: Duration) -> Result<Option<R>, AmqpError> {
        let request = TypedMessage::new(value, None)?;

        match self
            .procedure
            .call(request.content(), timeout)
            .await?
        {
            Some(reply) => reply.cast::<R>().into_value().map(Some),
            None => Ok(None),
        }
    }

    pub fn spawn_call(
        &self,
        value: S,
        timeout: Duration,
    ) -> JoinHandle<Result<Option<R>, AmqpError>> {
        let typed = TypedRemoteProcedure {
            procedure: self.procedure.clone(),
            _types: PhantomData,
        };
        tokio::spawn(async move { typed.call(value, timeout).await })
    }

    /// Answers requests decoded as `S` with the JSON encoded `R` returned by `f`.
    pub async fn answer<F, Fut>(&self, f: F) -> Result<(), AmqpError>
    where
        F: Fn(TypedMessage<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.procedure
            .answer(move |message: Message| {
                let f = f.clone();
                async move {
                    let request = message.cast::<S>();
                    request.value()?;
                    let result = f.as_ref()(request).await?;
                    serde_json::to_string(&result).map_err(HandlerError::from)
                }
            })
            .await
    }

    /// Untyped procedure underneath.
    pub fn procedure(&self) -> &RemoteProcedure {
        &self.procedure
    }

    pub async fn dispose(&self) {
        self.procedure.dispose().await;
    }
}
