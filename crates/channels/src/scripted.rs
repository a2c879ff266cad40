//! Scripted sender for tests and local runs: replays queued outcomes, then
//! succeeds, and records every call it receives.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use campaign_core::types::Channel;

use crate::sender::{ChannelSender, OutboundMessage, SendOutcome};

pub struct ScriptedSender {
    channel: Channel,
    script: Mutex<VecDeque<SendOutcome>>,
    calls: Mutex<Vec<OutboundMessage>>,
    delay: Option<Duration>,
}

impl ScriptedSender {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue an outcome for the next call.
    pub fn push(&self, outcome: SendOutcome) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    /// Queue the same failure `times` times.
    pub fn fail_times(&self, times: usize, code: &str) {
        for _ in 0..times {
            self.push(SendOutcome::failed(code, format!("scripted failure {code}")));
        }
    }

    pub fn calls(&self) -> Vec<OutboundMessage> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| {
            SendOutcome::delivered(format!("scripted-{}", message.idempotency_key))
        })
    }
}
