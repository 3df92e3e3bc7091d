//-
// Copyright (c) 2024, the Tidemail developers
//
// This file is part of Tidemail.
//
// Tidemail is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tidemail is distributed  in the hope that it  will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tidemail. If not, see <http://www.gnu.org/licenses/>.

//! The outbound retry queue.
//!
//! Messages whose immediate relay attempt failed transiently are parked
//! here and retried on an interval. The queue is in-memory only; a restart
//! forgets it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use log::{error, info, warn};

use crate::context::Context;
use crate::support::system_config::SmtpConfig;

#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub sender: String,
    pub recipients: Vec<String>,
    pub content: Vec<u8>,
    pub attempts: u32,
}

pub struct RelayQueue {
    entries: Mutex<VecDeque<QueuedMessage>>,
    retry_interval: Duration,
    max_retries: u32,
}

impl RelayQueue {
    pub fn new(config: &SmtpConfig) -> Self {
        RelayQueue {
            entries: Mutex::new(VecDeque::new()),
            retry_interval: Duration::from_secs(config.retry_interval.max(1)),
            max_retries: config.max_retries,
        }
    }

    /// Parks a message for a later delivery attempt.
    pub fn enqueue(
        &self,
        sender: String,
        recipients: Vec<String>,
        content: Vec<u8>,
    ) {
        if self.max_retries == 0 {
            warn!(
                "Relay retries disabled; dropping queued mail from <{}>",
                sender
            );
            return;
        }

        info!(
            "Queueing mail from <{}> for {} recipient(s)",
            sender,
            recipients.len()
        );
        self.entries.lock().unwrap().push_back(QueuedMessage {
            sender,
            recipients,
            content,
            attempts: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_all(&self) -> Vec<QueuedMessage> {
        self.entries.lock().unwrap().drain(..).collect()
    }

    fn requeue(&self, message: QueuedMessage) {
        self.entries.lock().unwrap().push_back(message);
    }

    /// Drains the queue forever at the configured interval. Runs as its own
    /// task for the lifetime of the process.
    pub async fn run(ctx: Context) {
        let mut ticker =
            tokio::time::interval(ctx.relay_queue.retry_interval);
        ticker.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );
        // The first tick of a tokio interval is immediate.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            Self::drain(&ctx).await;
        }
    }

    /// One pass over the queue: every recipient of every entry gets a fresh
    /// delivery attempt. Entries that keep failing transiently go back in
    /// until `max_retries` is spent.
    pub async fn drain(ctx: &Context) {
        let pending = ctx.relay_queue.take_all();
        if pending.is_empty() {
            return;
        }

        info!("Relay queue drain: {} message(s)", pending.len());

        for mut message in pending {
            message.attempts += 1;
            let mut remaining = Vec::new();

            for recipient in &message.recipients {
                match super::deliver_remote(
                    ctx,
                    &message.sender,
                    recipient,
                    &message.content,
                )
                .await
                {
                    Ok(()) => {
                        info!(
                            "Queued mail from <{}> delivered to <{}> \
                             on attempt {}",
                            message.sender, recipient, message.attempts
                        );
                    },
                    Err(failure) if failure.transient => {
                        remaining.push(recipient.clone());
                    },
                    Err(failure) => {
                        error!(
                            "Dropping <{}> from queued mail from <{}>: {}",
                            recipient, message.sender, failure.message
                        );
                    },
                }
            }

            if remaining.is_empty() {
                continue;
            }

            if message.attempts >= ctx.relay_queue.max_retries {
                error!(
                    "Giving up on queued mail from <{}> after {} attempts; \
                     {} recipient(s) undelivered",
                    message.sender,
                    message.attempts,
                    remaining.len()
                );
            } else {
                message.recipients = remaining;
                ctx.relay_queue.requeue(message);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use crate::context::test_context;
    use crate::support::system_config::SystemConfig;

    fn config_with_retries(max_retries: u32) -> SystemConfig {
        let mut config = SystemConfig::default();
        config.smtp.max_retries = max_retries;
        config
    }

    #[test]
    fn enqueue_with_retries_disabled_drops() {
        let root = TempDir::new().unwrap();
        let ctx = test_context(root.path(), config_with_retries(0));

        ctx.relay_queue.enqueue(
            "a@example.com".to_owned(),
            vec!["b@other.example".to_owned()],
            b"x".to_vec(),
        );
        assert!(ctx.relay_queue.is_empty());
    }

    #[tokio::test]
    async fn drain_requeues_transient_failures_until_exhausted() {
        let root = TempDir::new().unwrap();
        // No resolver in the test context, so every attempt fails
        // transiently.
        let ctx = test_context(root.path(), config_with_retries(2));

        ctx.relay_queue.enqueue(
            "a@example.com".to_owned(),
            vec!["b@other.example".to_owned()],
            b"x".to_vec(),
        );
        assert_eq!(1, ctx.relay_queue.len());

        super::RelayQueue::drain(&ctx).await;
        assert_eq!(1, ctx.relay_queue.len());

        // The second failed attempt exhausts max_retries.
        super::RelayQueue::drain(&ctx).await;
        assert!(ctx.relay_queue.is_empty());
    }
}
