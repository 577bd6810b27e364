//! Channel → listener registry backed by one subscriber connection.
//!
//! A single background task owns the subscriber connection. Adding the first
//! listener for a channel asks the task to reopen the connection with the
//! full channel set; the caller waits until the subscription is live.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use redis::RedisResult;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::transport::{ChannelMessage, Transport};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

type Listeners = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>>;
type Ack = oneshot::Sender<RedisResult<()>>;

struct Worker {
    refresh: mpsc::UnboundedSender<Ack>,
    cancel: CancellationToken,
}

pub(crate) struct Subscriptions {
    transport: Arc<dyn Transport>,
    listeners: Listeners,
    worker: Mutex<Option<Worker>>,
}

impl Subscriptions {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            worker: Mutex::new(None),
        }
    }

    /// Registers a listener; resolves once the channel is subscribed.
    pub(crate) async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<Value>, StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let is_new = {
            let mut listeners = self.listeners.lock();
            let entry = listeners.entry(channel.to_string()).or_default();
            entry.push(tx);
            entry.len() == 1
        };
        if !is_new {
            return Ok(rx);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.refresh_sender().send(ack_tx).map_err(|_| {
            StorageError::connection("subscriber task stopped before subscribing")
        })?;
        let outcome = ack_rx.await.map_err(|_| {
            StorageError::connection("subscriber task stopped before subscribing")
        })?;

        if let Err(e) = outcome {
            error!(channel, error = %e, "Failed to subscribe");
            self.listeners.lock().remove(channel);
            return Err(StorageError::backend(
                "SUBSCRIBE",
                vec![channel.to_string()],
                e,
            ));
        }
        info!(channel, "Subscribed");
        Ok(rx)
    }

    /// Drops every listener and closes the subscriber connection.
    pub(crate) fn unsubscribe_all(&self) {
        self.listeners.lock().clear();
        if let Some(worker) = self.worker.lock().take() {
            worker.cancel.cancel();
        }
    }

    fn refresh_sender(&self) -> mpsc::UnboundedSender<Ack> {
        let mut worker = self.worker.lock();
        if let Some(w) = worker.as_ref() {
            if !w.refresh.is_closed() {
                return w.refresh.clone();
            }
        }

        let (refresh, commands) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_subscriber(
            self.transport.clone(),
            self.listeners.clone(),
            commands,
            cancel.clone(),
        ));
        *worker = Some(Worker {
            refresh: refresh.clone(),
            cancel,
        });
        refresh
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel.cancel();
        }
    }
}

async fn run_subscriber(
    transport: Arc<dyn Transport>,
    listeners: Listeners,
    mut commands: mpsc::UnboundedReceiver<Ack>,
    cancel: CancellationToken,
) {
    let mut stream: Option<BoxStream<'static, ChannelMessage>> = None;
    let mut backoff = INITIAL_BACKOFF;
    let mut retry_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => {
                let Some(ack) = command else { break };
                let result = open(&*transport, &listeners).await;
                let reply = match result {
                    Ok(opened) => {
                        stream = opened;
                        backoff = INITIAL_BACKOFF;
                        retry_at = None;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = ack.send(reply);
            }
            message = next_message(&mut stream) => match message {
                Some(message) => dispatch(&listeners, message),
                None => {
                    warn!(backoff_secs = backoff.as_secs(), "Subscriber connection lost, reconnecting");
                    stream = None;
                    retry_at = Some(Instant::now() + backoff);
                }
            },
            _ = sleep_until(retry_at) => {
                match open(&*transport, &listeners).await {
                    Ok(opened) => {
                        info!("Subscriber connection restored");
                        stream = opened;
                        backoff = INITIAL_BACKOFF;
                        retry_at = None;
                    }
                    Err(e) => {
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        error!(error = %e, backoff_secs = backoff.as_secs(), "Subscriber reconnect failed");
                        retry_at = Some(Instant::now() + backoff);
                    }
                }
            }
        }
    }
    debug!("Subscriber task stopped");
}

async fn open(
    transport: &dyn Transport,
    listeners: &Listeners,
) -> RedisResult<Option<BoxStream<'static, ChannelMessage>>> {
    let channels: Vec<String> = listeners.lock().keys().cloned().collect();
    if channels.is_empty() {
        return Ok(None);
    }
    transport.open_messages(&channels).await.map(Some)
}

async fn next_message(
    stream: &mut Option<BoxStream<'static, ChannelMessage>>,
) -> Option<ChannelMessage> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn dispatch(listeners: &Listeners, message: ChannelMessage) {
    let payload: Value = match serde_json::from_str(&message.payload) {
        Ok(payload) => payload,
        Err(e) => {
            error!(
                channel = %message.channel,
                payload = %message.payload,
                error = %e,
                "Could not decode published message"
            );
            return;
        }
    };

    let mut listeners = listeners.lock();
    if let Some(senders) = listeners.get_mut(&message.channel) {
        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        debug!(channel = %message.channel, listeners = senders.len(), "Dispatched message");
    }
}
