use std::{
    any::Any,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use kestrel_process::Identity;
use serde::Serialize;
use tokio::sync::mpsc;

use super::TopicError;

/// One published value and the topic counter it was published at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message<T> {
    pub counter: i32,
    pub data: T,
}

/// A message whose payload has been erased to JSON.
pub type AnyMessage = Message<serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicInfo {
    pub id: Identity,
    pub closed: bool,
    pub counter: i32,
    pub subscriber_count: usize,
}

/// Events carried by the registry's meta-topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum MetaTopicInfo {
    Update(TopicInfo),
    Close(TopicInfo),
}

struct TopicState<T> {
    counter: i32,
    closed: bool,
    next_subscriber: u64,
    subscribers: Vec<(u64, mpsc::Sender<Message<T>>)>,
}

/// A closeable broadcast channel.
///
/// Publishing is serialized per topic, so every subscriber observes the same
/// order. Each subscriber has a bounded buffer; a full buffer makes
/// [`Topic::publish`] wait for that subscriber.
pub struct Topic<T> {
    id: Identity,
    buffer: usize,
    state: Mutex<TopicState<T>>,
    publish_lock: tokio::sync::Mutex<()>,
    meta: Option<mpsc::Sender<MetaTopicInfo>>,
}

impl<T> std::fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<T> Topic<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(id: Identity, buffer: usize, meta: Option<mpsc::Sender<MetaTopicInfo>>) -> Self {
        Self {
            id,
            buffer: buffer.max(1),
            state: Mutex::new(TopicState {
                counter: 0,
                closed: false,
                next_subscriber: 0,
                subscribers: Vec::new(),
            }),
            publish_lock: tokio::sync::Mutex::new(()),
            meta,
        }
    }

    fn state(&self) -> MutexGuard<'_, TopicState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &Identity {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn info(&self) -> TopicInfo {
        let state = self.state();
        self.info_locked(&state)
    }

    fn info_locked(&self, state: &TopicState<T>) -> TopicInfo {
        TopicInfo {
            id: self.id.clone(),
            closed: state.closed,
            counter: state.counter,
            subscriber_count: state.subscribers.len(),
        }
    }

    fn notify(&self, event: MetaTopicInfo) {
        let Some(meta) = &self.meta else {
            return;
        };
        if let Err(e) = meta.try_send(event) {
            tracing::debug!(topic = %self.id, error = %e, "meta-topic event dropped");
        }
    }

    /// Sends `data` to every current subscriber. A no-op once closed.
    pub async fn publish(&self, data: T) {
        let _guard = self.publish_lock.lock().await;
        let (counter, targets) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            let counter = state.counter;
            state.counter = counter.wrapping_add(1);
            let targets = state
                .subscribers
                .iter()
                .map(|(_, tx)| tx.clone())
                .collect::<Vec<_>>();
            (counter, targets)
        };

        for tx in targets {
            // A send error only means that subscriber went away.
            let _ = tx
                .send(Message {
                    counter,
                    data: data.clone(),
                })
                .await;
        }
    }

    /// Marks the topic closed and ends every subscription. Idempotent.
    pub fn close(&self) {
        let info = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.subscribers.clear();
            self.info_locked(&state)
        };
        self.notify(MetaTopicInfo::Close(info));
    }

    pub fn subscribe(self: &Arc<Self>) -> Result<Subscription<T>, TopicError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let (subscriber, info) = {
            let mut state = self.state();
            if state.closed {
                return Err(TopicError::Closed(self.id.clone()));
            }
            let subscriber = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.push((subscriber, tx));
            (subscriber, self.info_locked(&state))
        };
        self.notify(MetaTopicInfo::Update(info));

        let slot: Arc<dyn SubscriberSlot> = self.clone();
        Ok(Subscription {
            rx,
            slot: Some((slot, subscriber)),
        })
    }
}

pub(crate) trait SubscriberSlot: Send + Sync {
    fn remove_subscriber(&self, subscriber: u64);
}

impl<T> SubscriberSlot for Topic<T>
where
    T: Clone + Send + 'static,
{
    fn remove_subscriber(&self, subscriber: u64) {
        let info = {
            let mut state = self.state();
            let before = state.subscribers.len();
            state.subscribers.retain(|(id, _)| *id != subscriber);
            if state.closed || state.subscribers.len() == before {
                return;
            }
            self.info_locked(&state)
        };
        self.notify(MetaTopicInfo::Update(info));
    }
}

/// Receiving end of a topic. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Message<T>>,
    slot: Option<(Arc<dyn SubscriberSlot>, u64)>,
}

impl<T> Subscription<T> {
    /// A subscription fed by a relay task instead of a topic directly.
    fn relayed(rx: mpsc::Receiver<Message<T>>) -> Self {
        Self { rx, slot: None }
    }

    /// The next message, or `None` once the topic closed or this
    /// subscription was cancelled and its buffer drained.
    pub async fn recv(&mut self) -> Option<Message<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message<T>> {
        self.rx.try_recv().ok()
    }

    /// Stops delivery. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some((slot, subscriber)) = self.slot.take() {
            slot.remove_subscriber(subscriber);
        }
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Type-erased view of a topic, as stored by the registry.
pub(crate) trait ErasedTopic: Send + Sync {
    fn info(&self) -> TopicInfo;
    fn is_closed(&self) -> bool;
    fn close(&self);
    fn subscribe_any(self: Arc<Self>) -> Result<Subscription<serde_json::Value>, TopicError>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> ErasedTopic for Topic<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    fn info(&self) -> TopicInfo {
        Topic::info(self)
    }

    fn is_closed(&self) -> bool {
        Topic::is_closed(self)
    }

    fn close(&self) {
        Topic::close(self)
    }

    fn subscribe_any(self: Arc<Self>) -> Result<Subscription<serde_json::Value>, TopicError> {
        let mut upstream = self.subscribe()?;
        let (tx, rx) = mpsc::channel(self.buffer);
        let topic = self.id.clone();

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = tx.closed() => break,
                    msg = upstream.recv() => msg,
                };
                let Some(msg) = msg else {
                    break;
                };
                let data = match serde_json::to_value(&msg.data) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "dropping message that does not serialize");
                        continue;
                    }
                };
                let relayed = Message {
                    counter: msg.counter,
                    data,
                };
                if tx.send(relayed).await.is_err() {
                    break;
                }
            }
            upstream.unsubscribe();
        });

        Ok(Subscription::relayed(rx))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
