use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChannelId, MessageRef, ThreadRef},
    errors::Error,
    messaging::{
        port::{MessagingPort, ThreadingPort},
        types::{Embed, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls to the same channel.
    pub per_channel_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_channel_min_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Port decorator that rate-limits outbound calls.
///
/// Messages and thread operations share one global slot and one slot per
/// channel, so position threads and relayed messages are spaced together.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    threads: Option<Arc<dyn ThreadingPort>>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_channel: Mutex<HashMap<ChannelId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            threads: None,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_channel: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_threads(mut self, threads: Arc<dyn ThreadingPort>) -> Self {
        self.threads = Some(threads);
        self
    }

    fn threads(&self) -> Result<&dyn ThreadingPort> {
        self.threads
            .as_deref()
            .ok_or_else(|| Error::Unsupported("threads".to_string()))
    }

    async fn limiter_for_channel(&self, channel_id: ChannelId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_channel.lock().await;
        map.entry(channel_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_channel_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_channel(&self, channel_id: ChannelId) {
        let global_wait = { self.global.lock().await.reserve() };
        let channel_wait = {
            let lim = self.limiter_for_channel(channel_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(channel_wait);
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send(
        &self,
        channel_id: ChannelId,
        content: &str,
        embeds: &[Embed],
    ) -> Result<MessageRef> {
        self.throttle_channel(channel_id).await;
        self.inner.send(channel_id, content, embeds).await
    }

    async fn edit(&self, msg: MessageRef, content: &str) -> Result<()> {
        self.throttle_channel(msg.channel_id).await;
        self.inner.edit(msg, content).await
    }

    async fn delete(&self, msg: MessageRef) -> Result<()> {
        self.throttle_channel(msg.channel_id).await;
        self.inner.delete(msg).await
    }
}

#[async_trait]
impl ThreadingPort for ThrottledMessenger {
    async fn create_thread(&self, channel_id: ChannelId, title: &str, seed_text: &str) -> Result<ThreadRef> {
        let threads = self.threads()?;
        self.throttle_channel(channel_id).await;
        threads.create_thread(channel_id, title, seed_text).await
    }

    async fn rename_thread(&self, thread: ThreadRef, title: &str) -> Result<()> {
        let threads = self.threads()?;
        self.throttle_channel(thread.channel_id).await;
        threads.rename_thread(thread, title).await
    }

    async fn post_to_thread(&self, thread: ThreadRef, text: &str) -> Result<()> {
        let threads = self.threads()?;
        self.throttle_channel(thread.channel_id).await;
        threads.post_to_thread(thread, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingMessenger {
        sent_at: StdMutex<Vec<(ChannelId, Instant)>>,
    }

    #[async_trait]
    impl ThreadingPort for RecordingMessenger {
        async fn create_thread(&self, channel_id: ChannelId, _title: &str, _seed: &str) -> Result<ThreadRef> {
            self.sent_at
                .lock()
                .unwrap()
                .push((channel_id, Instant::now()));
            Ok(ThreadRef {
                channel_id,
                thread_id: 1,
            })
        }

        async fn rename_thread(&self, _thread: ThreadRef, _title: &str) -> Result<()> {
            Ok(())
        }

        async fn post_to_thread(&self, thread: ThreadRef, _text: &str) -> Result<()> {
            self.sent_at
                .lock()
                .unwrap()
                .push((thread.channel_id, Instant::now()));
            Ok(())
        }
    }

    #[async_trait]
    impl MessagingPort for RecordingMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_edit: true,
                supports_threads: false,
                supports_history: false,
                max_message_len: 2000,
            }
        }

        async fn send(
            &self,
            channel_id: ChannelId,
            _content: &str,
            _embeds: &[Embed],
        ) -> Result<MessageRef> {
            self.sent_at
                .lock()
                .unwrap()
                .push((channel_id, Instant::now()));
            Ok(MessageRef {
                channel_id,
                message_id: MessageId(1),
            })
        }

        async fn edit(&self, _msg: MessageRef, _content: &str) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _msg: MessageRef) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_out_sends_to_the_same_channel() {
        let inner = Arc::new(RecordingMessenger::default());
        let throttled = ThrottledMessenger::new(
            inner.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(10),
                per_channel_min_interval: Duration::from_millis(500),
            },
        );

        throttled.send(ChannelId(1), "a", &[]).await.unwrap();
        throttled.send(ChannelId(1), "b", &[]).await.unwrap();
        throttled.send(ChannelId(2), "c", &[]).await.unwrap();

        let sent = inner.sent_at.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent[1].1 - sent[0].1 >= Duration::from_millis(500));
        // A different channel only waits for the global slot.
        assert!(sent[2].1 - sent[1].1 < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn thread_calls_share_the_channel_slot_with_sends() {
        let inner = Arc::new(RecordingMessenger::default());
        let throttled = ThrottledMessenger::new(
            inner.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(10),
                per_channel_min_interval: Duration::from_millis(500),
            },
        )
        .with_threads(inner.clone());

        throttled.send(ChannelId(1), "a", &[]).await.unwrap();
        let thread = throttled.create_thread(ChannelId(1), "t", "seed").await.unwrap();
        throttled.post_to_thread(thread, "update").await.unwrap();

        let sent = inner.sent_at.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent[1].1 - sent[0].1 >= Duration::from_millis(500));
        assert!(sent[2].1 - sent[1].1 >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn thread_calls_without_a_thread_port_are_unsupported() {
        let throttled = ThrottledMessenger::new(
            Arc::new(RecordingMessenger::default()),
            ThrottleConfig::default(),
        );
        let err = throttled.create_thread(ChannelId(1), "t", "seed").await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
