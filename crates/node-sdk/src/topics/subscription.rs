//! Subscriber side of a topic: one connection task per publisher the
//! registry lists, fanning frames out to every local callback queue.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rn_domain::{Error, Result};
use rn_protocol::header::schema_matches;
use rn_protocol::xmlrpc::{split_status, Value, STATUS_SUCCESS};
use rn_protocol::{ConnectionHeader, RosMessage, TCPROS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::{BoundedQueue, PushOutcome};
use super::{LinkStats, TopicSchema};
use crate::tcpros::{connect, read_header, write_header, TransportContext};
use crate::types::SubscribeOptions;

struct PublisherLink {
    id: u64,
    connected: Arc<AtomicBool>,
    stats: Arc<LinkStats>,
    cancel: CancellationToken,
}

struct CallbackSink {
    id: u64,
    queue: Arc<BoundedQueue<Bytes>>,
}

pub(crate) struct Subscription {
    topic: String,
    schema: TopicSchema,
    ctx: Arc<TransportContext>,
    retry_delay: Option<Duration>,
    tcp_nodelay: bool,
    publishers: Mutex<HashMap<String, PublisherLink>>,
    sinks: Mutex<Vec<CallbackSink>>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        topic: &str,
        schema: TopicSchema,
        opts: &SubscribeOptions,
        ctx: Arc<TransportContext>,
    ) -> Self {
        let cancel = ctx.cancel.child_token();
        Self {
            topic: topic.to_owned(),
            schema,
            ctx,
            retry_delay: opts.retry_delay,
            tcp_nodelay: opts.tcp_nodelay,
            publishers: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Vec::new()),
            cancel,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn schema(&self) -> &TopicSchema {
        &self.schema
    }

    pub fn num_publishers(&self) -> usize {
        self.publishers
            .lock()
            .values()
            .filter(|l| l.connected.load(Ordering::Acquire))
            .count()
    }

    pub fn add_sink(&self, id: u64, queue: Arc<BoundedQueue<Bytes>>) {
        self.sinks.lock().push(CallbackSink { id, queue });
    }

    /// Returns the number of sinks left.
    pub fn remove_sink(&self, id: u64) -> usize {
        let mut sinks = self.sinks.lock();
        sinks.retain(|s| {
            if s.id == id {
                s.queue.close();
            }
            s.id != id
        });
        sinks.len()
    }

    /// Bring the publisher connections in line with the registry's list:
    /// drop links to publishers no longer listed, start links to new ones.
    pub fn reconcile(self: &Arc<Self>, uris: Vec<String>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let wanted: HashSet<String> = uris.into_iter().collect();
        let mut publishers = self.publishers.lock();

        publishers.retain(|uri, link| {
            let keep = wanted.contains(uri);
            if !keep {
                tracing::info!(topic = %self.topic, publisher = %uri, "publisher gone, closing link");
                link.cancel.cancel();
            }
            keep
        });

        for uri in wanted {
            if publishers.contains_key(&uri) {
                continue;
            }
            let link = PublisherLink {
                id: self.ctx.next_connection_id(),
                connected: Arc::new(AtomicBool::new(false)),
                stats: Arc::new(LinkStats::default()),
                cancel: self.cancel.child_token(),
            };
            let this = self.clone();
            let (id, connected, stats, cancel) = (
                link.id,
                link.connected.clone(),
                link.stats.clone(),
                link.cancel.clone(),
            );
            let task_uri = uri.clone();
            publishers.insert(uri, link);
            tokio::spawn(async move {
                this.run_link(task_uri, id, connected, stats, cancel).await;
            });
        }
    }

    async fn run_link(
        self: Arc<Self>,
        uri: String,
        id: u64,
        connected: Arc<AtomicBool>,
        stats: Arc<LinkStats>,
        cancel: CancellationToken,
    ) {
        loop {
            let outcome = tokio::select! {
                r = self.connect_and_read(&uri, &connected, &stats) => r,
                _ = cancel.cancelled() => return,
            };
            connected.store(false, Ordering::Release);

            let retryable = match &outcome {
                Ok(()) => {
                    tracing::info!(topic = %self.topic, publisher = %uri, "publisher closed connection");
                    true
                }
                Err(e @ Error::HandshakeMismatch(_)) => {
                    tracing::warn!(topic = %self.topic, publisher = %uri, error = %e, "handshake rejected");
                    false
                }
                Err(e) => {
                    tracing::warn!(topic = %self.topic, publisher = %uri, error = %e, "publisher link failed");
                    true
                }
            };

            match self.retry_delay {
                Some(delay) if retryable => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                _ => break,
            }
        }

        // Forget the link so a later publisher update can reconnect.
        let mut publishers = self.publishers.lock();
        if publishers.get(&uri).is_some_and(|l| l.id == id) {
            publishers.remove(&uri);
        }
    }

    async fn connect_and_read(
        &self,
        uri: &str,
        connected: &AtomicBool,
        stats: &LinkStats,
    ) -> Result<()> {
        let (host, port) = self.request_topic(uri).await?;
        let stream = connect((host.as_str(), port), self.ctx.handshake_timeout()).await?;
        stream.set_nodelay(self.tcp_nodelay)?;
        let mut framed = self.ctx.framed(stream);

        let header = ConnectionHeader::new()
            .with("callerid", self.ctx.caller_id.as_str())
            .with("topic", self.topic.as_str())
            .with("type", self.schema.msg_type.as_str())
            .with("md5sum", self.schema.md5sum.as_str())
            .with("message_definition", self.schema.definition.as_str())
            .with("tcp_nodelay", if self.tcp_nodelay { "1" } else { "0" });
        write_header(&mut framed, &header).await?;

        let reply = read_header(&mut framed, self.ctx.handshake_timeout()).await?;
        check_publisher_reply(&self.topic, &self.schema, &reply)?;

        connected.store(true, Ordering::Release);
        tracing::info!(topic = %self.topic, publisher = %uri, host = %host, port, "connected to publisher");

        while let Some(frame) = framed.next().await {
            let frame = frame?.freeze();
            stats.record(frame.len());
            self.deliver(frame);
        }
        Ok(())
    }

    /// Ask a publisher's slave API for a TCPROS endpoint.
    async fn request_topic(&self, uri: &str) -> Result<(String, u16)> {
        let protocols = Value::Array(vec![Value::Array(vec![TCPROS.into()])]);
        let response = self
            .ctx
            .rpc
            .call(
                uri,
                "requestTopic",
                vec![
                    self.ctx.caller_id.as_str().into(),
                    self.topic.as_str().into(),
                    protocols,
                ],
            )
            .await?;
        let (code, message, payload) = split_status(response)?;
        if code != STATUS_SUCCESS {
            return Err(Error::Rpc(format!("requestTopic refused by {uri}: {message}")));
        }
        match payload.as_array() {
            Some([proto, host, port]) if proto.as_str() == Some(TCPROS) => {
                let host = host
                    .as_str()
                    .ok_or_else(|| Error::Rpc("requestTopic: host is not a string".into()))?;
                let port = port
                    .as_i32()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| Error::Rpc("requestTopic: invalid port".into()))?;
                Ok((host.to_owned(), port))
            }
            _ => Err(Error::Rpc(format!(
                "requestTopic: unsupported protocol parameters from {uri}"
            ))),
        }
    }

    fn deliver(&self, frame: Bytes) {
        for sink in self.sinks.lock().iter() {
            if sink.queue.push(frame.clone()) == PushOutcome::DroppedOldest {
                tracing::trace!(topic = %self.topic, "subscriber queue full, dropped oldest");
            }
        }
    }

    pub fn bus_info(&self) -> Vec<Value> {
        self.publishers
            .lock()
            .iter()
            .map(|(uri, link)| {
                Value::Array(vec![
                    Value::Int(link.id as i32),
                    uri.as_str().into(),
                    "i".into(),
                    TCPROS.into(),
                    self.topic.as_str().into(),
                    link.connected.load(Ordering::Acquire).into(),
                ])
            })
            .collect()
    }

    /// `getBusStats` subscribe entry: `[topic, [[id, bytes, msgs, connected]]]`.
    pub fn bus_stats(&self) -> Value {
        let conns = self
            .publishers
            .lock()
            .values()
            .map(|link| link.stats.as_row(link.id))
            .collect::<Vec<Value>>();
        Value::Array(vec![self.topic.as_str().into(), Value::Array(conns)])
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.publishers.lock().clear();
        for sink in self.sinks.lock().drain(..) {
            sink.queue.close();
        }
    }
}

/// The publisher's reply must carry the md5sum and, when it names one, the
/// message type this subscription was created with.
fn check_publisher_reply(topic: &str, schema: &TopicSchema, reply: &ConnectionHeader) -> Result<()> {
    if let Some(reason) = reply.rejection() {
        return Err(Error::HandshakeMismatch(reason.to_owned()));
    }
    let md5sum = reply.require("md5sum")?;
    let msg_type = reply.get("type").unwrap_or("*");
    if !schema_matches(&schema.md5sum, md5sum) || !schema_matches(&schema.msg_type, msg_type) {
        return Err(Error::HandshakeMismatch(format!(
            "{topic} publishes {msg_type}/{md5sum}, expected {}/{}",
            schema.msg_type, schema.md5sum
        )));
    }
    Ok(())
}

/// Run a typed callback over a sink queue until it closes or `cancel` fires.
///
/// With a throttle window the queue holds only the newest message and the
/// task sleeps out the window after each delivery.  A panicking callback
/// is logged and the task keeps going.
pub(crate) fn spawn_dispatcher<M, F>(
    topic: String,
    queue: Arc<BoundedQueue<Bytes>>,
    throttle: Option<Duration>,
    cancel: CancellationToken,
    callback: F,
) -> JoinHandle<()>
where
    M: RosMessage,
    F: Fn(M) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                f = queue.pop() => match f {
                    Some(f) => f,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            match M::from_bytes(&frame) {
                Ok(msg) => {
                    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(msg))).is_err() {
                        tracing::error!(topic = %topic, "subscriber callback panicked");
                    }
                }
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "dropping undecodable message");
                }
            }
            if let Some(window) = throttle {
                tokio::select! {
                    _ = tokio::time::sleep(window) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TopicSchema {
        TopicSchema {
            msg_type: "std_msgs/String".into(),
            md5sum: "992ce8a1687cec8c8bd883ec73ca41d1".into(),
            definition: "string data".into(),
        }
    }

    fn reply(msg_type: &str, md5sum: &str) -> ConnectionHeader {
        ConnectionHeader::new()
            .with("callerid", "/talker")
            .with("type", msg_type)
            .with("md5sum", md5sum)
    }

    #[test]
    fn matching_reply_is_accepted() {
        let s = schema();
        assert!(check_publisher_reply("/chatter", &s, &reply(&s.msg_type, &s.md5sum)).is_ok());
        assert!(check_publisher_reply("/chatter", &s, &reply("*", "*")).is_ok());
        let untyped = ConnectionHeader::new().with("md5sum", s.md5sum.as_str());
        assert!(check_publisher_reply("/chatter", &s, &untyped).is_ok());
    }

    #[test]
    fn type_swapped_behind_same_md5_is_rejected() {
        let s = schema();
        let err = check_publisher_reply("/chatter", &s, &reply("other_msgs/Text", &s.md5sum))
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeMismatch(_)), "{err}");
    }

    #[test]
    fn md5_mismatch_and_rejection_are_reported() {
        let s = schema();
        assert!(matches!(
            check_publisher_reply("/chatter", &s, &reply(&s.msg_type, "0000")),
            Err(Error::HandshakeMismatch(_))
        ));
        let rejected = ConnectionHeader::error("wrong topic");
        match check_publisher_reply("/chatter", &s, &rejected) {
            Err(Error::HandshakeMismatch(reason)) => assert_eq!(reason, "wrong topic"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
