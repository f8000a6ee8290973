//! Topic transport: publications, subscriptions and the per-node manager
//! that registers them with the registry.

mod handle;
mod publication;
pub(crate) mod queue;
mod subscription;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rn_domain::{Error, Result};
use rn_protocol::xmlrpc::Value;
use rn_protocol::{ConnectionHeader, RosMessage};

use crate::master::RegistrationKind;
use crate::tcpros::{reject, FrameStream, TransportContext};
use crate::types::{AdvertiseOptions, OverflowPolicy, SubscribeOptions};

pub use handle::{Publisher, Subscriber};
pub(crate) use publication::Publication;
pub(crate) use queue::BoundedQueue;
pub(crate) use subscription::{spawn_dispatcher, Subscription};

/// The schema both ends of a topic connection must agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TopicSchema {
    pub msg_type: String,
    pub md5sum: String,
    pub definition: String,
}

impl TopicSchema {
    pub fn of<M: RosMessage>() -> Self {
        Self {
            msg_type: M::msg_type(),
            md5sum: M::md5sum(),
            definition: M::message_definition(),
        }
    }
}

/// Traffic counters of one peer connection.
#[derive(Debug, Default)]
pub(crate) struct LinkStats {
    pub bytes: AtomicU64,
    pub messages: AtomicU64,
    pub dropped: AtomicU64,
}

impl LinkStats {
    /// `frame_len` includes the length prefix.
    pub fn record(&self, frame_len: usize) {
        self.bytes.fetch_add(frame_len as u64, Ordering::Relaxed);
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn as_row(&self, id: u64) -> Value {
        let clamp = |v: u64| Value::Int(v.min(i32::MAX as u64) as i32);
        Value::Array(vec![
            Value::Int(id as i32),
            clamp(self.bytes.load(Ordering::Relaxed)),
            clamp(self.messages.load(Ordering::Relaxed)),
            true.into(),
        ])
    }
}

/// Owns every publication and subscription of one node.
pub struct TopicManager {
    ctx: Arc<TransportContext>,
    publications: Mutex<HashMap<String, Arc<Publication>>>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    next_sink_id: AtomicU64,
}

impl TopicManager {
    pub(crate) fn new(ctx: Arc<TransportContext>) -> Self {
        Self {
            ctx,
            publications: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_sink_id: AtomicU64::new(1),
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Publishing
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Share or create the publication for `topic`.  The first advertiser
    /// registers it with the registry; later ones must use the same schema.
    pub(crate) async fn advertise(
        &self,
        topic: &str,
        schema: TopicSchema,
        opts: &AdvertiseOptions,
    ) -> Result<Arc<Publication>> {
        let (publication, first) = {
            let mut pubs = self.publications.lock();
            match pubs.get(topic) {
                Some(existing) => {
                    if existing.schema().md5sum != schema.md5sum {
                        return Err(Error::HandshakeMismatch(format!(
                            "{topic} is already advertised as {}",
                            existing.schema().msg_type
                        )));
                    }
                    existing.acquire();
                    (existing.clone(), false)
                }
                None => {
                    let created = Arc::new(Publication::new(topic, schema, opts, &self.ctx));
                    created.acquire();
                    pubs.insert(topic.to_owned(), created.clone());
                    (created, true)
                }
            }
        };

        if first {
            let registered = self
                .ctx
                .master
                .register(
                    RegistrationKind::Publisher,
                    topic,
                    &publication.schema().msg_type,
                    self.ctx.master.caller_api(),
                )
                .await;
            match registered {
                Ok(subscribers) => {
                    tracing::info!(
                        topic,
                        msg_type = %publication.schema().msg_type,
                        subscribers = subscribers.len(),
                        "advertised topic"
                    );
                }
                Err(e) => {
                    self.forget_publication(topic, &publication);
                    publication.close();
                    return Err(e);
                }
            }
        }
        Ok(publication)
    }

    /// Drop one local handle; the last one unregisters the topic.
    pub(crate) async fn unadvertise(&self, publication: &Arc<Publication>) {
        if publication.release() > 0 {
            return;
        }
        let topic = publication.topic().to_owned();
        self.forget_publication(&topic, publication);
        publication.close();
        if let Err(e) = self
            .ctx
            .master
            .unregister(RegistrationKind::Publisher, &topic, self.ctx.master.caller_api())
            .await
        {
            tracing::warn!(topic = %topic, error = %e, "failed to unregister publisher");
        }
    }

    fn forget_publication(&self, topic: &str, publication: &Arc<Publication>) {
        let mut pubs = self.publications.lock();
        if pubs.get(topic).is_some_and(|p| Arc::ptr_eq(p, publication)) {
            pubs.remove(topic);
        }
    }

    pub(crate) async fn accept_subscriber(
        &self,
        header: ConnectionHeader,
        mut framed: FrameStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let topic = header.require("topic")?.to_owned();
        let publication = self.publications.lock().get(&topic).cloned();
        match publication {
            Some(publication) => publication.accept(&self.ctx, header, framed, peer).await,
            None => {
                let reason = format!("{} does not publish {topic}", self.ctx.caller_id);
                reject(&mut framed, &reason).await;
                Err(Error::HandshakeMismatch(reason))
            }
        }
    }

    pub fn is_publishing(&self, topic: &str) -> bool {
        self.publications.lock().contains_key(topic)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Subscribing
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Attach a callback queue to the subscription for `topic`, creating and
    /// registering the subscription on first use.  Returns the sink id.
    pub(crate) async fn subscribe(
        &self,
        topic: &str,
        schema: TopicSchema,
        opts: &SubscribeOptions,
    ) -> Result<(Arc<Subscription>, u64, Arc<BoundedQueue<Bytes>>)> {
        let capacity = match opts.throttle {
            Some(_) => 1,
            None => opts.queue_size.unwrap_or(self.ctx.config.default_queue_size),
        };
        let queue = Arc::new(BoundedQueue::new(capacity, OverflowPolicy::DropOldest));
        let sink_id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);

        let (subscription, first) = {
            let mut subs = self.subscriptions.lock();
            match subs.get(topic) {
                Some(existing) => {
                    if existing.schema().md5sum != schema.md5sum {
                        return Err(Error::HandshakeMismatch(format!(
                            "{topic} is already subscribed as {}",
                            existing.schema().msg_type
                        )));
                    }
                    existing.add_sink(sink_id, queue.clone());
                    (existing.clone(), false)
                }
                None => {
                    let created = Arc::new(Subscription::new(topic, schema, opts, self.ctx.clone()));
                    created.add_sink(sink_id, queue.clone());
                    subs.insert(topic.to_owned(), created.clone());
                    (created, true)
                }
            }
        };

        if first {
            let registered = self
                .ctx
                .master
                .register(
                    RegistrationKind::Subscriber,
                    topic,
                    &subscription.schema().msg_type,
                    self.ctx.master.caller_api(),
                )
                .await;
            match registered {
                Ok(publishers) => {
                    tracing::info!(topic, publishers = publishers.len(), "subscribed to topic");
                    subscription.reconcile(publishers);
                }
                Err(e) => {
                    self.forget_subscription(topic, &subscription);
                    subscription.close();
                    return Err(e);
                }
            }
        }
        Ok((subscription, sink_id, queue))
    }

    /// Detach one callback; the last one unregisters the subscription.
    pub(crate) async fn unsubscribe(&self, subscription: &Arc<Subscription>, sink_id: u64) {
        if subscription.remove_sink(sink_id) > 0 {
            return;
        }
        let topic = subscription.topic().to_owned();
        self.forget_subscription(&topic, subscription);
        subscription.close();
        if let Err(e) = self
            .ctx
            .master
            .unregister(RegistrationKind::Subscriber, &topic, self.ctx.master.caller_api())
            .await
        {
            tracing::warn!(topic = %topic, error = %e, "failed to unregister subscriber");
        }
    }

    fn forget_subscription(&self, topic: &str, subscription: &Arc<Subscription>) {
        let mut subs = self.subscriptions.lock();
        if subs.get(topic).is_some_and(|s| Arc::ptr_eq(s, subscription)) {
            subs.remove(topic);
        }
    }

    /// Apply a `publisherUpdate`.  Returns false if we do not subscribe to `topic`.
    pub fn publisher_update(&self, topic: &str, publishers: Vec<String>) -> bool {
        let subscription = self.subscriptions.lock().get(topic).cloned();
        match subscription {
            Some(s) => {
                s.reconcile(publishers);
                true
            }
            None => false,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Introspection
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// `(topic, type)` of every publication, sorted by topic.
    pub fn publications(&self) -> Vec<(String, String)> {
        let mut rows: Vec<_> = self
            .publications
            .lock()
            .values()
            .map(|p| (p.topic().to_owned(), p.schema().msg_type.clone()))
            .collect();
        rows.sort();
        rows
    }

    pub fn subscriptions(&self) -> Vec<(String, String)> {
        let mut rows: Vec<_> = self
            .subscriptions
            .lock()
            .values()
            .map(|s| (s.topic().to_owned(), s.schema().msg_type.clone()))
            .collect();
        rows.sort();
        rows
    }

    pub(crate) fn bus_info(&self) -> Vec<Value> {
        let pubs: Vec<_> = self.publications.lock().values().cloned().collect();
        let subs: Vec<_> = self.subscriptions.lock().values().cloned().collect();
        pubs.iter()
            .flat_map(|p| p.bus_info())
            .chain(subs.iter().flat_map(|s| s.bus_info()))
            .collect()
    }

    /// `[publishStats, subscribeStats]`.
    pub(crate) fn bus_stats(&self) -> (Vec<Value>, Vec<Value>) {
        let pubs = self
            .publications
            .lock()
            .values()
            .map(|p| p.bus_stats())
            .collect();
        let subs = self
            .subscriptions
            .lock()
            .values()
            .map(|s| s.bus_stats())
            .collect();
        (pubs, subs)
    }

    /// Close every connection and unregister everything, best effort.
    pub(crate) async fn shutdown(&self) {
        let pubs: Vec<_> = self.publications.lock().drain().collect();
        let subs: Vec<_> = self.subscriptions.lock().drain().collect();
        let api = self.ctx.master.caller_api().to_owned();

        for (topic, publication) in pubs {
            publication.close();
            if let Err(e) = self
                .ctx
                .master
                .unregister(RegistrationKind::Publisher, &topic, &api)
                .await
            {
                tracing::warn!(topic = %topic, error = %e, "failed to unregister publisher");
            }
        }
        for (topic, subscription) in subs {
            subscription.close();
            if let Err(e) = self
                .ctx
                .master
                .unregister(RegistrationKind::Subscriber, &topic, &api)
                .await
            {
                tracing::warn!(topic = %topic, error = %e, "failed to unregister subscriber");
            }
        }
    }
}
