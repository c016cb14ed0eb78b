// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport seam for tests.
//!
//! Publishes to the default exchange go to the queue named by the routing key; other
//! exchanges route by exact routing key match. Channels in confirm mode ack every
//! publish unless a confirm plan says otherwise.

use super::{AmqpChannel, ChannelEvent, ChannelHandle, Connector, Delivery, DeliveryStream};
use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{types::FieldTable, BasicProperties};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc;

/// Polls `condition` until it holds, failing the test after a few seconds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[derive(Debug, Clone)]
pub(crate) enum Call {
    ExchangeDeclare { channel: usize, name: String },
    QueueDeclare { channel: usize, name: String, arguments: FieldTable },
    QueueBind { channel: usize, queue: String, exchange: String, routing_key: String },
    Qos { channel: usize, prefetch_count: u16 },
    Ack { channel: usize, delivery_tag: u64 },
    Nack { channel: usize, delivery_tag: u64, requeue: bool },
}

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub channel: usize,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    consumers: Vec<(usize, mpsc::UnboundedSender<Delivery>)>,
    next: usize,
}

struct ChannelState {
    open: bool,
    events: Option<mpsc::UnboundedSender<ChannelEvent>>,
    confirms: bool,
    publish_seq: u64,
    delivery_seq: u64,
}

#[derive(Default)]
struct State {
    channels: Vec<ChannelState>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
    calls: Vec<Call>,
    published: Vec<Published>,
    confirm_plan: VecDeque<bool>,
    hold_confirms: bool,
    offline: bool,
    probes: usize,
}

pub(crate) struct FakeBroker {
    state: Mutex<State>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker {
            state: Mutex::new(State::default()),
        })
    }

    pub(crate) fn connector(self: &Arc<Self>) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Next publishes on confirm channels are acked (`true`) or nacked (`false`).
    pub(crate) fn plan_confirms(&self, plan: impl IntoIterator<Item = bool>) {
        self.state().confirm_plan.extend(plan);
    }

    /// While held, publishes on confirm channels get no confirm at all.
    pub(crate) fn hold_confirms(&self, hold: bool) {
        self.state().hold_confirms = hold;
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.state().offline = !online;
    }

    pub(crate) fn probes(&self) -> usize {
        self.state().probes
    }

    pub(crate) fn opened(&self) -> usize {
        self.state().channels.len()
    }

    /// Closes the most recently opened channel and reports it to its owner.
    pub(crate) fn shutdown_last(&self, cause: &str) {
        let mut state = self.state();
        let id = state.channels.len() - 1;
        let events = close_channel(&mut state, id);
        if let Some(events) = events {
            let _ = events.send(ChannelEvent::Shutdown {
                cause: cause.to_owned(),
            });
        }
    }

    /// Shuts down channel `id`.
    pub(crate) fn shutdown(&self, id: usize, cause: &str) {
        let mut state = self.state();
        if let Some(events) = close_channel(&mut state, id) {
            let _ = events.send(ChannelEvent::Shutdown {
                cause: cause.to_owned(),
            });
        }
    }

    /// Emits a raw confirm event on channel `id`.
    pub(crate) fn emit(&self, id: usize, event: ChannelEvent) {
        let state = self.state();
        if let Some(events) = &state.channels[id].events {
            let _ = events.send(event);
        }
    }

    pub(crate) fn enqueue(&self, queue: &str, body: &[u8]) {
        self.deliver(queue, body, BasicProperties::default());
    }

    /// Delivers a message straight into `queue`, as if routed there by `queue` key.
    pub(crate) fn deliver(&self, queue: &str, body: &[u8], properties: BasicProperties) {
        let mut state = self.state();
        let delivery = Delivery {
            delivery_tag: 0,
            exchange: String::new(),
            routing_key: queue.to_owned(),
            redelivered: false,
            properties,
            data: body.to_vec(),
        };
        dispatch(&mut state, queue, delivery);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub(crate) fn queue_declarations(&self, queue: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::QueueDeclare { name, .. } if name == queue))
            .count()
    }

    /// Queue names declared on channel `id`, in order.
    pub(crate) fn queues_declared_on(&self, id: usize) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::QueueDeclare { channel, name, .. } if channel == id => Some(name),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    pub(crate) fn published_to(&self, exchange: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.exchange == exchange)
            .collect()
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Ack { delivery_tag, .. } => Some(delivery_tag),
                _ => None,
            })
            .collect()
    }

    /// `(delivery_tag, requeue)` of every nack.
    pub(crate) fn nacks(&self) -> Vec<(u64, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Nack {
                    delivery_tag,
                    requeue,
                    ..
                } => Some((delivery_tag, requeue)),
                _ => None,
            })
            .collect()
    }

    fn with_open(&self, id: usize) -> Result<MutexGuard<'_, State>, AmqpError> {
        let state = self.state();
        if !state.channels[id].open {
            return Err(AmqpError::ChannelClosed(format!("channel {id}")));
        }
        Ok(state)
    }
}

fn close_channel(
    state: &mut State,
    id: usize,
) -> Option<mpsc::UnboundedSender<ChannelEvent>> {
    state.channels[id].open = false;
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|(channel, _)| *channel != id);
    }
    state.channels[id].events.take()
}

fn dispatch(state: &mut State, queue: &str, mut delivery: Delivery) {
    let State {
        queues, channels, ..
    } = state;
    let queue = queues.entry(queue.to_owned()).or_default();

    if queue.consumers.is_empty() {
        queue.ready.push_back(delivery);
        return;
    }

    let index = queue.next % queue.consumers.len();
    queue.next += 1;
    let (channel, sender) = &queue.consumers[index];
    channels[*channel].delivery_seq += 1;
    delivery.delivery_tag = channels[*channel].delivery_seq;
    let _ = sender.send(delivery);
}

pub(crate) struct FakeConnector {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self) -> Result<ChannelHandle, AmqpError> {
        let mut state = self.broker.state();
        if state.offline {
            return Err(AmqpError::ConnectionError);
        }

        let (sender, events) = mpsc::unbounded_channel();
        state.channels.push(ChannelState {
            open: true,
            events: Some(sender),
            confirms: false,
            publish_seq: 0,
            delivery_seq: 0,
        });
        let id = state.channels.len() - 1;

        Ok(ChannelHandle {
            channel: Arc::new(FakeChannel {
                id,
                broker: self.broker.clone(),
            }),
            events,
        })
    }

    async fn probe(&self) -> bool {
        let mut state = self.broker.state();
        state.probes += 1;
        !state.offline
    }
}

pub(crate) struct FakeChannel {
    id: usize,
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        _kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.with_open(self.id)?;
        state.calls.push(Call::ExchangeDeclare {
            channel: self.id,
            name: name.to_owned(),
        });
        Ok(())
    }

    async fn queue_declare(
        &self,
        name: &str,
        _durable: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.with_open(self.id)?;
        state.queues.entry(name.to_owned()).or_default();
        state.calls.push(Call::QueueDeclare {
            channel: self.id,
            name: name.to_owned(),
            arguments,
        });
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.with_open(self.id)?;
        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        state.calls.push(Call::QueueBind {
            channel: self.id,
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u32, AmqpError> {
        let state = self.broker.with_open(self.id)?;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u32)
            .ok_or_else(|| AmqpError::InspectQueueError(queue.to_owned()))
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.with_open(self.id)?;
        state.calls.push(Call::Qos {
            channel: self.id,
            prefetch_count,
        });
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.with_open(self.id)?;
        state.channels[self.id].confirms = true;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<u64, AmqpError> {
        let mut state = self.broker.with_open(self.id)?;

        let mut delivery_tag = 0;
        let mut accepted = true;
        if state.channels[self.id].confirms {
            state.channels[self.id].publish_seq += 1;
            delivery_tag = state.channels[self.id].publish_seq;
            accepted = state.confirm_plan.pop_front().unwrap_or(true);

            let event = if accepted {
                ChannelEvent::Ack {
                    delivery_tag,
                    multiple: false,
                }
            } else {
                ChannelEvent::Nack {
                    delivery_tag,
                    multiple: false,
                }
            };
            if !state.hold_confirms {
                if let Some(events) = &state.channels[self.id].events {
                    let _ = events.send(event);
                }
            }
        }

        state.published.push(Published {
            channel: self.id,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            body: body.to_vec(),
            delivery_tag,
        });

        if accepted {
            let targets: Vec<String> = if exchange.is_empty() {
                vec![routing_key.to_owned()]
            } else {
                state
                    .bindings
                    .iter()
                    .filter(|(_, ex, key)| ex == exchange && key == routing_key)
                    .map(|(queue, _, _)| queue.clone())
                    .collect()
            };

            for queue in targets {
                let delivery = Delivery {
                    delivery_tag: 0,
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                    properties: properties.clone(),
                    data: body.to_vec(),
                };
                dispatch(&mut state, &queue, delivery);
            }
        }

        Ok(delivery_tag)
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.broker.with_open(self.id)?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let ready: Vec<Delivery> = {
            let queue = state.queues.entry(queue.to_owned()).or_default();
            queue.consumers.push((self.id, sender));
            queue.ready.drain(..).collect()
        };
        for delivery in ready {
            dispatch(&mut state, queue, delivery);
        }

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|d| (Ok(d), receiver))
        })
        .boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        let mut state = self.broker.with_open(self.id)?;
        let Some(mut delivery) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
        else {
            return Ok(None);
        };

        state.channels[self.id].delivery_seq += 1;
        delivery.delivery_tag = state.channels[self.id].delivery_seq;
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_tag: u64, _multiple: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.with_open(self.id)?;
        state.calls.push(Call::Ack {
            channel: self.id,
            delivery_tag,
        });
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        _multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.with_open(self.id)?;
        state.calls.push(Call::Nack {
            channel: self.id,
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state().channels[self.id].open
    }

    async fn close(&self) {
        let mut state = self.broker.state();
        close_channel(&mut state, self.id);
    }
}
