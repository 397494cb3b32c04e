//! Cross-context marshaling onto the publisher identity's loop.
//!
//! The dispatcher runs on the listener's event loop and never touches the
//! publisher connection directly. It holds a [`PublisherMailbox`], which turns
//! every port call into a [`PublisherCommand`] sent over an mpsc channel. The
//! publisher identity drains the shared [`PublisherInbox`] on its own loop and
//! answers over a oneshot. A restarted publisher takes over the same inbox.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ChannelId, MessageRef, ThreadRef},
    errors::Error,
    messaging::{
        port::{MessagingPort, ThreadingPort},
        types::{Embed, MessagingCapabilities},
    },
    Result,
};

const DEFAULT_MAILBOX_CAPACITY: usize = 1024;
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

type Reply<T> = oneshot::Sender<Result<T>>;

pub enum PublisherCommand {
    Send {
        channel_id: ChannelId,
        content: String,
        embeds: Vec<Embed>,
        reply: Reply<MessageRef>,
    },
    Edit {
        msg: MessageRef,
        content: String,
        reply: Reply<()>,
    },
    Delete {
        msg: MessageRef,
        reply: Reply<()>,
    },
    CreateThread {
        channel_id: ChannelId,
        title: String,
        seed_text: String,
        reply: Reply<ThreadRef>,
    },
    RenameThread {
        thread: ThreadRef,
        title: String,
        reply: Reply<()>,
    },
    PostToThread {
        thread: ThreadRef,
        text: String,
        reply: Reply<()>,
    },
}

/// Sending half, cloned into the dispatcher, tracker effects and status reporter.
#[derive(Clone)]
pub struct PublisherMailbox {
    tx: mpsc::Sender<PublisherCommand>,
    capabilities: MessagingCapabilities,
    reply_timeout: Duration,
}

/// Receiving half, shared by successive publisher instances.
#[derive(Clone)]
pub struct PublisherInbox {
    rx: Arc<Mutex<mpsc::Receiver<PublisherCommand>>>,
}

pub fn publisher_channel(capabilities: MessagingCapabilities) -> (PublisherMailbox, PublisherInbox) {
    let (tx, rx) = mpsc::channel(DEFAULT_MAILBOX_CAPACITY);
    (
        PublisherMailbox {
            tx,
            capabilities,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        },
        PublisherInbox {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl PublisherMailbox {
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> PublisherCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.try_send(build(reply_tx)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Transport {
                target: "publisher".to_string(),
                reason: "mailbox full".to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => {
                Error::Closed("publisher mailbox".to_string())
            }
        })?;

        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(Error::Closed("publisher dropped the request".to_string())),
            Err(_) => Err(Error::Transport {
                target: "publisher".to_string(),
                reason: format!("no reply within {:?}", self.reply_timeout),
            }),
        }
    }
}

#[async_trait]
impl MessagingPort for PublisherMailbox {
    fn capabilities(&self) -> MessagingCapabilities {
        self.capabilities
    }

    async fn send(
        &self,
        channel_id: ChannelId,
        content: &str,
        embeds: &[Embed],
    ) -> Result<MessageRef> {
        self.call(|reply| PublisherCommand::Send {
            channel_id,
            content: content.to_string(),
            embeds: embeds.to_vec(),
            reply,
        })
        .await
    }

    async fn edit(&self, msg: MessageRef, content: &str) -> Result<()> {
        self.call(|reply| PublisherCommand::Edit {
            msg,
            content: content.to_string(),
            reply,
        })
        .await
    }

    async fn delete(&self, msg: MessageRef) -> Result<()> {
        self.call(|reply| PublisherCommand::Delete { msg, reply })
            .await
    }
}

#[async_trait]
impl ThreadingPort for PublisherMailbox {
    async fn create_thread(
        &self,
        channel_id: ChannelId,
        title: &str,
        seed_text: &str,
    ) -> Result<ThreadRef> {
        self.call(|reply| PublisherCommand::CreateThread {
            channel_id,
            title: title.to_string(),
            seed_text: seed_text.to_string(),
            reply,
        })
        .await
    }

    async fn rename_thread(&self, thread: ThreadRef, title: &str) -> Result<()> {
        self.call(|reply| PublisherCommand::RenameThread {
            thread,
            title: title.to_string(),
            reply,
        })
        .await
    }

    async fn post_to_thread(&self, thread: ThreadRef, text: &str) -> Result<()> {
        self.call(|reply| PublisherCommand::PostToThread {
            thread,
            text: text.to_string(),
            reply,
        })
        .await
    }
}

impl PublisherInbox {
    /// Execute queued commands against the real connection until `cancel` fires
    /// or every mailbox has been dropped.
    ///
    /// Returns the number of commands served.
    pub async fn serve(
        &self,
        messenger: &dyn MessagingPort,
        threads: &dyn ThreadingPort,
        cancel: &CancellationToken,
    ) -> usize {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return 0,
            guard = self.rx.lock() => guard,
        };

        let mut served = 0usize;
        loop {
            let cmd = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => cmd,
            };
            let Some(cmd) = cmd else {
                break;
            };
            execute(cmd, messenger, threads).await;
            served += 1;
        }
        served
    }
}

async fn execute(cmd: PublisherCommand, messenger: &dyn MessagingPort, threads: &dyn ThreadingPort) {
    // A dropped receiver means the caller timed out; nothing to report back.
    match cmd {
        PublisherCommand::Send {
            channel_id,
            content,
            embeds,
            reply,
        } => {
            let _ = reply.send(messenger.send(channel_id, &content, &embeds).await);
        }
        PublisherCommand::Edit {
            msg,
            content,
            reply,
        } => {
            let _ = reply.send(messenger.edit(msg, &content).await);
        }
        PublisherCommand::Delete { msg, reply } => {
            let _ = reply.send(messenger.delete(msg).await);
        }
        PublisherCommand::CreateThread {
            channel_id,
            title,
            seed_text,
            reply,
        } => {
            let _ = reply.send(threads.create_thread(channel_id, &title, &seed_text).await);
        }
        PublisherCommand::RenameThread {
            thread,
            title,
            reply,
        } => {
            let _ = reply.send(threads.rename_thread(thread, &title).await);
        }
        PublisherCommand::PostToThread {
            thread,
            text,
            reply,
        } => {
            let _ = reply.send(threads.post_to_thread(thread, &text).await);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakePublisher {
        sent: StdMutex<Vec<(ChannelId, String)>>,
        threads: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl MessagingPort for FakePublisher {
        fn capabilities(&self) -> MessagingCapabilities {
            caps()
        }

        async fn send(
            &self,
            channel_id: ChannelId,
            content: &str,
            _embeds: &[Embed],
        ) -> Result<MessageRef> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((channel_id, content.to_string()));
            Ok(MessageRef {
                channel_id,
                message_id: MessageId(sent.len() as i64),
            })
        }

        async fn edit(&self, _msg: MessageRef, _content: &str) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _msg: MessageRef) -> Result<()> {
            Err(Error::Unsupported("delete".to_string()))
        }
    }

    #[async_trait]
    impl ThreadingPort for FakePublisher {
        async fn create_thread(
            &self,
            channel_id: ChannelId,
            title: &str,
            _seed_text: &str,
        ) -> Result<ThreadRef> {
            self.threads.lock().unwrap().push(title.to_string());
            Ok(ThreadRef {
                channel_id,
                thread_id: 77,
            })
        }

        async fn rename_thread(&self, _thread: ThreadRef, _title: &str) -> Result<()> {
            Ok(())
        }

        async fn post_to_thread(&self, _thread: ThreadRef, _text: &str) -> Result<()> {
            Ok(())
        }
    }

    fn caps() -> MessagingCapabilities {
        MessagingCapabilities {
            supports_edit: true,
            supports_threads: true,
            supports_history: false,
            max_message_len: 2000,
        }
    }

    #[tokio::test]
    async fn commands_are_executed_on_the_serving_loop() {
        let (mailbox, inbox) = publisher_channel(caps());
        let publisher = Arc::new(FakePublisher::default());
        let cancel = CancellationToken::new();

        let server = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                inbox
                    .serve(publisher.as_ref(), publisher.as_ref(), &cancel)
                    .await
            })
        };

        let sent = mailbox.send(ChannelId(5), "hello", &[]).await.unwrap();
        assert_eq!(sent.channel_id, ChannelId(5));
        let thread = mailbox
            .create_thread(ChannelId(5), "title", "seed")
            .await
            .unwrap();
        assert_eq!(thread.thread_id, 77);
        assert!(mailbox.delete(sent).await.is_err());

        cancel.cancel();
        assert_eq!(server.await.unwrap(), 3);
        assert_eq!(
            publisher.sent.lock().unwrap().clone(),
            vec![(ChannelId(5), "hello".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unserved_mailbox_times_out_instead_of_hanging() {
        let (mailbox, _inbox) = publisher_channel(caps());
        let mailbox = mailbox.with_reply_timeout(Duration::from_secs(2));

        let err = mailbox.send(ChannelId(1), "x", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn restarted_publisher_takes_over_the_same_inbox() {
        let (mailbox, inbox) = publisher_channel(caps());
        let publisher = Arc::new(FakePublisher::default());

        let first = CancellationToken::new();
        first.cancel();
        assert_eq!(
            inbox
                .serve(publisher.as_ref(), publisher.as_ref(), &first)
                .await,
            0
        );

        let second = CancellationToken::new();
        let server = {
            let publisher = publisher.clone();
            let inbox = inbox.clone();
            let second = second.clone();
            tokio::spawn(async move {
                inbox
                    .serve(publisher.as_ref(), publisher.as_ref(), &second)
                    .await
            })
        };
        mailbox.send(ChannelId(9), "after restart", &[]).await.unwrap();
        second.cancel();
        assert_eq!(server.await.unwrap(), 1);
    }
}
