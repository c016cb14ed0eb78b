// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Ordered teardown list of a component.
//!
//! Each component registers the release of what it owns (tasks, channel, dependent
//! producers and consumers) as it acquires it. `run` executes the steps once, in
//! registration order; later calls are no-ops.

use futures_util::future::BoxFuture;
use std::sync::Mutex;
use tracing::debug;

pub(crate) type Step = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub(crate) struct Teardown {
    steps: Mutex<Option<Vec<Step>>>,
}

impl Teardown {
    pub(crate) fn new() -> Self {
        Teardown {
            steps: Mutex::new(Some(vec![])),
        }
    }

    /// Registers a step. When the teardown already ran, the step runs right away in
    /// the background.
    pub(crate) fn push(&self, step: Step) {
        let mut steps = self.steps.lock().unwrap_or_else(|p| p.into_inner());
        match steps.as_mut() {
            Some(steps) => steps.push(step),
            None => {
                tokio::spawn(step());
            }
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.steps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_none()
    }

    pub(crate) async fn run(&self) {
        let steps = self
            .steps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        let Some(steps) = steps else {
            return;
        };

        debug!(steps = steps.len(), "tearing down");
        for step in steps {
            step().await;
        }
    }
}
