// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Route Bindings
//!
//! A `RouteSpec` describes a route: routing key, exchange mode, queue type and TTL.
//! A `RouteBinding` is a route declared on a channel. It keeps a gauge of the queue
//! depth, refreshed in the background for as long as the binding lives.
//!
//! `Bindings` is the ordered set of routes owned by one producer or consumer: binding
//! a routing key twice is a no-op, and after a reboot every route is declared again
//! in its original order.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeMode,
    topology::{self, ExchangeNames},
};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Declaration parameters of a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteSpec {
    routing_key: String,
    mode: ExchangeMode,
    queue_type: Option<String>,
    ttl: u32,
}

impl RouteSpec {
    pub fn new(routing_key: impl Into<String>) -> Self {
        RouteSpec {
            routing_key: routing_key.into(),
            mode: ExchangeMode::Normal,
            queue_type: None,
            ttl: 0,
        }
    }

    pub fn with_mode(mut self, mode: ExchangeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_queue_type(mut self, queue_type: impl Into<String>) -> Self {
        self.queue_type = Some(queue_type.into());
        self
    }

    /// Message TTL in milliseconds. Zero means none.
    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Same parameters on another routing key.
    pub fn with_routing_key(&self, routing_key: impl Into<String>) -> Self {
        RouteSpec {
            routing_key: routing_key.into(),
            ..self.clone()
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn mode(&self) -> ExchangeMode {
        self.mode
    }

    pub fn queue_type(&self) -> Option<&str> {
        self.queue_type.as_deref()
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }
}

/// A route declared on a channel.
#[derive(Debug)]
pub struct RouteBinding {
    spec: RouteSpec,
    message_count: Arc<AtomicU32>,
    refresher: JoinHandle<()>,
}

impl RouteBinding {
    /// Declares `spec` on `channel` and starts the depth refresher.
    pub async fn declare(
        channel: Arc<dyn AmqpChannel>,
        names: &ExchangeNames,
        durable: bool,
        spec: RouteSpec,
        refresh_interval: Duration,
    ) -> Result<RouteBinding, AmqpError> {
        topology::set_route(channel.as_ref(), names, durable, &spec).await?;

        let message_count = Arc::new(AtomicU32::new(0));
        let refresher = tokio::spawn(refresh(
            channel,
            spec.routing_key.clone(),
            message_count.clone(),
            refresh_interval,
        ));

        Ok(RouteBinding {
            spec,
            message_count,
            refresher,
        })
    }

    pub fn spec(&self) -> &RouteSpec {
        &self.spec
    }

    pub fn routing_key(&self) -> &str {
        &self.spec.routing_key
    }

    pub fn mode(&self) -> ExchangeMode {
        self.spec.mode
    }

    pub fn queue_type(&self) -> Option<&str> {
        self.spec.queue_type.as_deref()
    }

    pub fn ttl(&self) -> u32 {
        self.spec.ttl
    }

    /// Last known number of ready messages in the queue.
    pub fn message_count(&self) -> u32 {
        self.message_count.load(Ordering::Relaxed)
    }
}

impl Drop for RouteBinding {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

async fn refresh(
    channel: Arc<dyn AmqpChannel>,
    queue: String,
    message_count: Arc<AtomicU32>,
    interval: Duration,
) {
    while channel.is_open() {
        match channel.message_count(&queue).await {
            Ok(count) => message_count.store(count, Ordering::Relaxed),
            Err(err) => warn!(error = err.to_string(), queue, "failure to refresh queue depth"),
        }
        tokio::time::sleep(interval).await;
    }
    debug!(queue, "queue depth refresher stopped");
}

/// Ordered, idempotent set of routes.
pub(crate) struct Bindings {
    names: ExchangeNames,
    durable: bool,
    refresh_interval: Duration,
    routes: tokio::sync::Mutex<Vec<Arc<RouteBinding>>>,
}

impl Bindings {
    pub(crate) fn new(names: ExchangeNames, durable: bool, refresh_interval: Duration) -> Self {
        Bindings {
            names,
            durable,
            refresh_interval,
            routes: tokio::sync::Mutex::new(vec![]),
        }
    }

    /// Declares `spec` unless its routing key is already bound. Returns the binding and
    /// whether it was declared by this call.
    pub(crate) async fn bind(
        &self,
        channel: Arc<dyn AmqpChannel>,
        spec: RouteSpec,
    ) -> Result<(Arc<RouteBinding>, bool), AmqpError> {
        let mut routes = self.routes.lock().await;

        if let Some(existing) = routes
            .iter()
            .find(|b| b.routing_key() == spec.routing_key())
        {
            return Ok((existing.clone(), false));
        }

        let binding = Arc::new(
            RouteBinding::declare(
                channel,
                &self.names,
                self.durable,
                spec,
                self.refresh_interval,
            )
            .await?,
        );
        routes.push(binding.clone());

        Ok((binding, true))
    }

    /// Declares every route again on `channel`, in the original order. The set is only
    /// replaced when every declaration succeeded.
    pub(crate) async fn rebind(&self, channel: &Arc<dyn AmqpChannel>) -> Result<(), AmqpError> {
        let mut routes = self.routes.lock().await;

        let mut rebuilt = Vec::with_capacity(routes.len());
        for route in routes.iter() {
            rebuilt.push(Arc::new(
                RouteBinding::declare(
                    channel.clone(),
                    &self.names,
                    self.durable,
                    route.spec().clone(),
                    self.refresh_interval,
                )
                .await?,
            ));
        }

        *routes = rebuilt;
        Ok(())
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<RouteBinding>> {
        self.routes.lock().await.clone()
    }

    pub(crate) async fn clear(&self) {
        self.routes.lock().await.clear();
    }
}
