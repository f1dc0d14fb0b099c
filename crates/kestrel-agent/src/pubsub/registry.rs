use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use kestrel_process::Identity;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{
    TopicError,
    topic::{ErasedTopic, MetaTopicInfo, Subscription, Topic, TopicInfo},
};

pub const META_TOPIC_KEY: &str = "meta";

/// Capacity of the mailbox between topic mutations and the meta-topic.
const META_MAILBOX: usize = 64;

pub fn meta_topic_id() -> Identity {
    Identity::from_parts(["topics"], META_TOPIC_KEY)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// Number of topics created since the registry started.
    pub global_counter: u64,
    pub topics: BTreeMap<String, TopicInfo>,
}

/// Owns every topic. Cheap to clone; clones share the same topics.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    topics: Mutex<HashMap<String, Arc<dyn ErasedTopic>>>,
    meta: Arc<Topic<MetaTopicInfo>>,
    meta_tx: mpsc::Sender<MetaTopicInfo>,
    created: AtomicU64,
    buffer: usize,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("created", &self.inner.created.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Creates the registry and its meta-topic. Must run inside a Tokio
    /// runtime: the meta-topic is fed by a task spawned here.
    pub fn new(subscriber_buffer: usize) -> Self {
        let (meta_tx, mut meta_rx) = mpsc::channel::<MetaTopicInfo>(META_MAILBOX);
        let meta = Arc::new(Topic::new(meta_topic_id(), subscriber_buffer, None));

        // Topic mutations only enqueue; this task is the single publisher.
        let relay = meta.clone();
        tokio::spawn(async move {
            while let Some(event) = meta_rx.recv().await {
                relay.publish(event).await;
            }
        });

        let mut topics: HashMap<String, Arc<dyn ErasedTopic>> = HashMap::new();
        topics.insert(meta.id().to_string(), meta.clone());

        Self {
            inner: Arc::new(RegistryInner {
                topics: Mutex::new(topics),
                meta,
                meta_tx,
                created: AtomicU64::new(0),
                buffer: subscriber_buffer,
            }),
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn ErasedTopic>>> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn meta_topic(&self) -> Arc<Topic<MetaTopicInfo>> {
        self.inner.meta.clone()
    }

    /// Registers a new topic. Fails if an open topic already holds `id`; a
    /// closed one is replaced.
    pub fn create_topic<T>(&self, id: &Identity) -> Result<Arc<Topic<T>>, TopicError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        if id.is_reserved() {
            return Err(TopicError::Reserved(id.clone()));
        }
        let mut topics = self.topics();
        if topics.get(&id.to_string()).is_some_and(|t| !t.is_closed()) {
            return Err(TopicError::Exists(id.clone()));
        }
        Ok(self.insert_locked(&mut topics, id))
    }

    /// Returns the open topic at `id`, creating it when absent or closed.
    pub fn get_or_create<T>(&self, id: &Identity) -> Result<Arc<Topic<T>>, TopicError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        if id.is_reserved() {
            return Err(TopicError::Reserved(id.clone()));
        }
        let mut topics = self.topics();
        if let Some(existing) = topics.get(&id.to_string()).filter(|t| !t.is_closed()) {
            return downcast(id, existing.clone());
        }
        Ok(self.insert_locked(&mut topics, id))
    }

    fn insert_locked<T>(
        &self,
        topics: &mut HashMap<String, Arc<dyn ErasedTopic>>,
        id: &Identity,
    ) -> Arc<Topic<T>>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let topic = Arc::new(Topic::<T>::new(
            id.clone(),
            self.inner.buffer,
            Some(self.inner.meta_tx.clone()),
        ));
        topics.insert(id.to_string(), topic.clone());
        self.inner.created.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.inner.meta_tx.try_send(MetaTopicInfo::Update(topic.info())) {
            tracing::debug!(topic = %id, error = %e, "meta-topic event dropped");
        }
        tracing::debug!(topic = %id, "topic created");
        topic
    }

    /// The typed topic stored at `id`, open or closed.
    pub fn topic<T>(&self, id: &Identity) -> Result<Arc<Topic<T>>, TopicError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let erased = self.lookup(id)?;
        downcast(id, erased)
    }

    fn lookup(&self, id: &Identity) -> Result<Arc<dyn ErasedTopic>, TopicError> {
        self.topics()
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| TopicError::DoesntExist(id.clone()))
    }

    pub fn subscribe<T>(&self, id: &Identity) -> Result<Subscription<T>, TopicError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        self.topic::<T>(id)?.subscribe()
    }

    /// Subscribes without knowing the element type; payloads arrive as JSON.
    pub fn subscribe_any(&self, id: &Identity) -> Result<Subscription<serde_json::Value>, TopicError> {
        self.lookup(id)?.subscribe_any()
    }

    /// Closes the topic at `id` if there is one. Returns whether it existed.
    pub fn close_topic(&self, id: &Identity) -> bool {
        match self.lookup(id) {
            Ok(topic) => {
                topic.close();
                true
            }
            Err(_) => false,
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let topics = self.topics();
        RegistrySnapshot {
            global_counter: self.inner.created.load(Ordering::Relaxed),
            topics: topics
                .iter()
                .map(|(key, topic)| (key.clone(), topic.info()))
                .collect(),
        }
    }
}

fn downcast<T>(id: &Identity, erased: Arc<dyn ErasedTopic>) -> Result<Arc<Topic<T>>, TopicError>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    erased
        .into_any()
        .downcast::<Topic<T>>()
        .map_err(|_| TopicError::TypeMismatch {
            id: id.clone(),
            expected: std::any::type_name::<T>(),
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn id(key: &str) -> Identity {
        Identity::from_parts(["test"], key)
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message_in_order() {
        let registry = Registry::new(8);
        let topic = registry.create_topic::<u32>(&id("fanout")).unwrap();

        let mut readers = Vec::new();
        for _ in 0..10 {
            let mut sub = registry.subscribe::<u32>(&id("fanout")).unwrap();
            readers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(msg) = sub.recv().await {
                    seen.push((msg.counter, msg.data));
                }
                seen
            }));
        }

        let publisher = topic.clone();
        tokio::spawn(async move {
            for n in 0..100u32 {
                publisher.publish(n).await;
            }
            publisher.close();
        })
        .await
        .unwrap();

        let expected = (0..100).map(|n| (n as i32, n)).collect::<Vec<_>>();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn close_ends_subscriptions_and_is_idempotent() {
        let registry = Registry::new(8);
        let topic = registry.create_topic::<String>(&id("close")).unwrap();
        let mut a = topic.subscribe().unwrap();
        let mut b = registry.subscribe::<String>(&id("close")).unwrap();

        topic.close();
        topic.close();
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());

        topic.publish("ignored".to_string()).await;
        assert_eq!(topic.info().counter, 0);
        assert_eq!(
            registry.subscribe::<String>(&id("close")).err(),
            Some(TopicError::Closed(id("close")))
        );
    }

    #[tokio::test]
    async fn create_conflicts_only_while_open() {
        let registry = Registry::new(8);
        let first = registry.create_topic::<u8>(&id("dup")).unwrap();
        assert_eq!(
            registry.create_topic::<u8>(&id("dup")).err(),
            Some(TopicError::Exists(id("dup")))
        );

        first.close();
        let second = registry.create_topic::<u8>(&id("dup")).unwrap();
        assert!(!second.is_closed());
        assert_eq!(registry.snapshot().global_counter, 2);
    }

    #[tokio::test]
    async fn reserved_namespace_is_rejected() {
        let registry = Registry::new(8);
        let reserved = Identity::from_parts(["topics"], "mine");
        assert_eq!(
            registry.create_topic::<u8>(&reserved).err(),
            Some(TopicError::Reserved(reserved.clone()))
        );
        assert!(matches!(
            registry.create_topic::<u8>(&meta_topic_id()),
            Err(TopicError::Reserved(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_checks_existence_and_type() {
        let registry = Registry::new(8);
        assert_eq!(
            registry.subscribe::<u8>(&id("missing")).err(),
            Some(TopicError::DoesntExist(id("missing")))
        );

        registry.create_topic::<u8>(&id("typed")).unwrap();
        assert!(matches!(
            registry.subscribe::<String>(&id("typed")),
            Err(TopicError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn subscribe_any_relays_json_and_cleans_up() {
        let registry = Registry::new(8);
        let topic = registry.create_topic::<Vec<u8>>(&id("any")).unwrap();
        let mut sub = registry.subscribe_any(&id("any")).unwrap();
        eventually(|| topic.info().subscriber_count == 1).await;

        topic.publish(vec![1, 2]).await;
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.counter, 0);
        assert_eq!(msg.data, serde_json::json!([1, 2]));

        sub.unsubscribe();
        sub.unsubscribe();
        // The relay only notices on its next wakeup.
        topic.publish(vec![3]).await;
        eventually(|| topic.info().subscriber_count == 0).await;
    }

    #[tokio::test]
    async fn relay_ends_when_topic_closes() {
        let registry = Registry::new(8);
        let topic = registry.create_topic::<u8>(&id("relay-close")).unwrap();
        let mut sub = registry.subscribe_any(&id("relay-close")).unwrap();
        topic.close();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let registry = Registry::new(8);
        let topic = registry.create_topic::<u8>(&id("drop")).unwrap();
        let sub = topic.subscribe().unwrap();
        assert_eq!(topic.info().subscriber_count, 1);
        drop(sub);
        assert_eq!(topic.info().subscriber_count, 0);
    }

    #[tokio::test]
    async fn meta_topic_reports_create_and_close() {
        let registry = Registry::new(8);
        let mut meta = registry
            .subscribe::<MetaTopicInfo>(&meta_topic_id())
            .unwrap();

        let topic = registry.create_topic::<u8>(&id("watched")).unwrap();
        topic.close();

        let mut events = Vec::new();
        while events.len() < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(2), meta.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(msg.data);
        }
        assert!(matches!(&events[0], MetaTopicInfo::Update(info) if info.id == id("watched")));
        assert!(matches!(&events[1], MetaTopicInfo::Close(info) if info.closed));
    }

    #[tokio::test]
    async fn snapshot_lists_topics() {
        let registry = Registry::new(8);
        let topic = registry.create_topic::<u8>(&id("snap")).unwrap();
        let _sub = topic.subscribe().unwrap();
        topic.publish(1).await;

        let snap = registry.snapshot();
        let info = &snap.topics[&id("snap").to_string()];
        assert_eq!(info.counter, 1);
        assert_eq!(info.subscriber_count, 1);
        assert!(snap.topics.contains_key(&meta_topic_id().to_string()));
    }

    #[tokio::test]
    async fn get_or_create_reuses_open_topic() {
        let registry = Registry::new(8);
        let a = registry.get_or_create::<u8>(&id("reuse")).unwrap();
        let b = registry.get_or_create::<u8>(&id("reuse")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        a.close();
        let c = registry.get_or_create::<u8>(&id("reuse")).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
