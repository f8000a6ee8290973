//! Typed publisher and subscriber handles.
//!
//! Handles share the underlying publication or subscription with every
//! other handle on the same topic.  Dropping a handle (or calling
//! `shutdown`) releases it; the last one unregisters the topic.

use std::marker::PhantomData;
use std::sync::Arc;

use rn_domain::{Error, Result};
use rn_protocol::RosMessage;
use tokio_util::sync::CancellationToken;

use super::{spawn_dispatcher, Publication, Subscription, TopicManager, TopicSchema};
use crate::types::{AdvertiseOptions, SubscribeOptions};

pub struct Publisher<M> {
    topic: String,
    inner: Option<(Arc<TopicManager>, Arc<Publication>)>,
    _marker: PhantomData<fn(&M)>,
}

impl<M: RosMessage> Publisher<M> {
    pub(crate) async fn start(
        topics: Arc<TopicManager>,
        topic: &str,
        opts: &AdvertiseOptions,
    ) -> Result<Self> {
        let publication = topics.advertise(topic, TopicSchema::of::<M>(), opts).await?;
        Ok(Self {
            topic: topic.to_owned(),
            inner: Some((topics, publication)),
            _marker: PhantomData,
        })
    }

    /// Serialize once and queue for every connected subscriber.  Never
    /// blocks on slow subscribers.
    pub fn publish(&self, msg: &M) -> Result<()> {
        let (_, publication) = self.inner.as_ref().ok_or(Error::Shutdown)?;
        publication.publish(&msg.to_bytes())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn num_subscribers(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |(_, p)| p.num_subscribers())
    }

    /// Messages published on this topic by this node so far.
    pub fn published(&self) -> u64 {
        self.inner.as_ref().map_or(0, |(_, p)| p.published())
    }

    pub async fn shutdown(mut self) {
        if let Some((topics, publication)) = self.inner.take() {
            topics.unadvertise(&publication).await;
        }
    }
}

impl<M> Drop for Publisher<M> {
    fn drop(&mut self) {
        if let Some((topics, publication)) = self.inner.take() {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { topics.unadvertise(&publication).await });
            }
        }
    }
}

pub struct Subscriber {
    topic: String,
    inner: Option<(Arc<TopicManager>, Arc<Subscription>, u64)>,
    dispatcher: CancellationToken,
}

impl Subscriber {
    pub(crate) async fn start<M, F>(
        topics: Arc<TopicManager>,
        topic: &str,
        opts: &SubscribeOptions,
        callback: F,
    ) -> Result<Self>
    where
        M: RosMessage,
        F: Fn(M) + Send + Sync + 'static,
    {
        let (subscription, sink_id, queue) = topics
            .subscribe(topic, TopicSchema::of::<M>(), opts)
            .await?;
        let dispatcher = topics.ctx.cancel.child_token();
        spawn_dispatcher::<M, F>(
            topic.to_owned(),
            queue,
            opts.throttle,
            dispatcher.clone(),
            callback,
        );
        Ok(Self {
            topic: topic.to_owned(),
            inner: Some((topics, subscription, sink_id)),
            dispatcher,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishers with an established connection.
    pub fn num_publishers(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |(_, s, _)| s.num_publishers())
    }

    pub async fn shutdown(mut self) {
        self.dispatcher.cancel();
        if let Some((topics, subscription, sink_id)) = self.inner.take() {
            topics.unsubscribe(&subscription, sink_id).await;
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.dispatcher.cancel();
        if let Some((topics, subscription, sink_id)) = self.inner.take() {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { topics.unsubscribe(&subscription, sink_id).await });
            }
        }
    }
}
