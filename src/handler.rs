// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A `MessageHandler` processes one delivered message and tells the consumer how to
//! settle it through an `Outcome`. Closures can be used directly through
//! `handler_fn` and `typed_handler_fn`.

use crate::message::{Message, TypedMessage};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::{future::Future, marker::PhantomData, sync::Arc};

/// Error returned by handlers. Any error counts as a processing failure.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// How a delivery should be settled once handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Leave the delivery unsettled.
    Ignore,
    Success,
    Failure,
    /// Processed, with a payload to send back to the reply-to key of the delivery.
    Reply(String),
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

impl From<String> for Outcome {
    fn from(payload: String) -> Self {
        Outcome::Reply(payload)
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Outcome, HandlerError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<Outcome, HandlerError> {
        (self.f)(message.clone()).await
    }
}

/// Wraps an async closure into a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

struct TypedFnHandler<T, F> {
    f: F,
    _value: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> MessageHandler for TypedFnHandler<T, F>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(TypedMessage<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<Outcome, HandlerError> {
        let typed = message.cast::<T>();
        typed.value()?;
        (self.f)(typed).await
    }
}

/// Wraps an async closure over decoded values. Payloads that fail to decode are
/// handling failures.
pub fn typed_handler_fn<T, F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(TypedMessage<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, HandlerError>> + Send + 'static,
{
    Arc::new(TypedFnHandler {
        f,
        _value: PhantomData,
    })
}
