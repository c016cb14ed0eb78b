// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client
//!
//! `MqClient` is the entry point of the crate. It holds the configuration and the
//! connector every component opens its own channel with, derives the exchange names
//! from the configured exchange type and creates producers, consumers, remote
//! procedures and queue readers.

use crate::{
    binding::RouteSpec,
    channel::{AmqpChannel, Connector, LapinConnector},
    config::MqConfig,
    dispatcher::{MessageConsumer, TypedMessageConsumer},
    errors::AmqpError,
    message_queue::MessageQueue,
    publisher::{MessageProducer, TypedMessageProducer},
    rpc::{RemoteProcedure, TypedRemoteProcedure},
    topology::{self, ExchangeNames},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{path::Path, sync::Arc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct MqClient {
    config: Arc<MqConfig>,
    connector: Arc<dyn Connector>,
    exchanges: ExchangeNames,
}

impl MqClient {
    /// Client connecting to the configured brokers with `lapin`.
    pub fn new(config: MqConfig) -> MqClient {
        let connector = Arc::new(LapinConnector::new(config.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: MqConfig, connector: Arc<dyn Connector>) -> MqClient {
        MqClient {
            exchanges: ExchangeNames::new(config.exchange_type),
            config: Arc::new(config),
            connector,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<MqClient, AmqpError> {
        Ok(Self::new(MqConfig::from_file(path)?))
    }

    pub fn config(&self) -> &MqConfig {
        &self.config
    }

    pub fn exchanges(&self) -> &ExchangeNames {
        &self.exchanges
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    /// Checks that a broker accepts connections.
    pub async fn test_connection(&self) -> bool {
        let reachable = self.connector.probe().await;
        if reachable {
            info!("broker reachable");
        } else {
            warn!("broker unreachable");
        }
        reachable
    }

    /// Declares the route of `spec` on `channel` with this client's exchanges.
    pub async fn set_route(
        &self,
        channel: &dyn AmqpChannel,
        spec: &RouteSpec,
    ) -> Result<(), AmqpError> {
        topology::set_route(channel, &self.exchanges, self.config.durable, spec).await
    }

    pub async fn producer(&self) -> Result<MessageProducer, AmqpError> {
        MessageProducer::open(self.clone()).await
    }

    pub async fn typed_producer<T: Serialize>(
        &self,
    ) -> Result<TypedMessageProducer<T>, AmqpError> {
        Ok(TypedMessageProducer::new(self.producer().await?))
    }

    pub async fn consumer(&self) -> Result<MessageConsumer, AmqpError> {
        MessageConsumer::open(self.clone()).await
    }

    pub async fn typed_consumer<T>(&self) -> Result<TypedMessageConsumer<T>, AmqpError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Ok(TypedMessageConsumer::new(self.consumer().await?))
    }

    /// Remote procedure on the routing key of `spec`. Nothing is declared until it is
    /// bound or answered.
    pub fn remote_procedure(&self, spec: RouteSpec) -> RemoteProcedure {
        RemoteProcedure::new(self.clone(), spec)
    }

    pub fn typed_remote_procedure<S, R>(&self, spec: RouteSpec) -> TypedRemoteProcedure<S, R>
    where
        S: Serialize + DeserializeOwned + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        TypedRemoteProcedure::new(self.remote_procedure(spec))
    }

    /// Pull reader over `queue`, declared with the given queue type and TTL.
    pub async fn message_queue(
        &self,
        queue: &str,
        queue_type: Option<&str>,
        ttl: u32,
    ) -> Result<MessageQueue, AmqpError> {
        MessageQueue::open(self, queue, queue_type, ttl).await
    }
}
