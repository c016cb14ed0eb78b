// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Link and Reboot Protocol
//!
//! A `Link` holds the channel of one component and rebuilds it when the transport
//! reports a shutdown:
//!
//! 1. the link enters `Recovering` and takes the channel exclusively, so callers
//!    asking for the channel wait instead of failing;
//! 2. the old channel and connection are closed;
//! 3. connectivity is probed every reconnect interval until the broker answers;
//! 4. a new channel is opened and the owner restores its state on it (bindings,
//!    confirm mode, subscriptions);
//! 5. the new channel is swapped in and the link is `Active` again.
//!
//! Recovery has no deadline: it stops only once the broker is reachable again.

use crate::{
    channel::{AmqpChannel, Connector, EventReceiver},
    errors::AmqpError,
};
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Active,
    Recovering,
}

/// State a component re-applies on a freshly opened channel.
#[async_trait]
pub(crate) trait Restore: Send + Sync {
    async fn restore(&self, channel: &Arc<dyn AmqpChannel>) -> Result<(), AmqpError>;
}

pub(crate) struct Link {
    connector: Arc<dyn Connector>,
    channel: RwLock<Arc<dyn AmqpChannel>>,
    state: Mutex<LinkState>,
    reconnect_interval: Duration,
}

impl Link {
    pub(crate) async fn open(
        connector: Arc<dyn Connector>,
        reconnect_interval: Duration,
    ) -> Result<(Link, EventReceiver), AmqpError> {
        let handle = connector.open().await?;

        Ok((
            Link {
                connector,
                channel: RwLock::new(handle.channel),
                state: Mutex::new(LinkState::Active),
                reconnect_interval,
            },
            handle.events,
        ))
    }

    /// Shared access to the current channel; waits while the link is recovering.
    pub(crate) async fn channel(&self) -> RwLockReadGuard<'_, Arc<dyn AmqpChannel>> {
        self.channel.read().await
    }

    pub(crate) async fn current(&self) -> Arc<dyn AmqpChannel> {
        self.channel.read().await.clone()
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Rebuilds the channel and returns the events of the new one.
    pub(crate) async fn reboot(&self, restorer: &dyn Restore) -> EventReceiver {
        let mut current = self.channel.write().await;
        self.set_state(LinkState::Recovering);
        warn!("channel lost, rebooting");

        current.close().await;

        loop {
            while !self.connector.probe().await {
                warn!(
                    retry_in_ms = self.reconnect_interval.as_millis() as u64,
                    "broker unreachable"
                );
                tokio::time::sleep(self.reconnect_interval).await;
            }

            match self.connector.open().await {
                Ok(handle) => match restorer.restore(&handle.channel).await {
                    Ok(()) => {
                        *current = handle.channel;
                        self.set_state(LinkState::Active);
                        info!("channel rebooted");
                        return handle.events;
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "failure to restore channel state");
                        handle.channel.close().await;
                    }
                },
                Err(err) => error!(error = err.to_string(), "failure to reopen channel"),
            }

            tokio::time::sleep(self.reconnect_interval).await;
        }
    }

    pub(crate) async fn close(&self) {
        self.channel.read().await.close().await;
    }
}
