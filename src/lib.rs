// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod link;
mod otel;
mod teardown;

pub mod backup;
pub mod binding;
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod message_queue;
pub mod publisher;
pub mod queue;
pub mod rpc;
pub mod topology;

pub use binding::{RouteBinding, RouteSpec};
pub use client::MqClient;
pub use config::MqConfig;
pub use dispatcher::{MessageConsumer, TypedMessageConsumer};
pub use errors::AmqpError;
pub use exchange::{ExchangeKind, ExchangeMode};
pub use handler::{handler_fn, typed_handler_fn, HandlerError, MessageHandler, Outcome};
pub use link::LinkState;
pub use message::{Message, TypedMessage};
pub use message_queue::MessageQueue;
pub use publisher::{MessageProducer, PublishOutcome, TypedMessageProducer};
pub use rpc::{RemoteProcedure, TypedRemoteProcedure};
