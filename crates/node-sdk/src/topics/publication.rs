//! Publisher side of a topic: one outbound queue and writer task per
//! connected subscriber.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rn_domain::{Error, Result};
use rn_protocol::header::schema_matches;
use rn_protocol::{encode_frame, ConnectionHeader};
use rn_protocol::xmlrpc::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::queue::{BoundedQueue, PushOutcome};
use super::{LinkStats, TopicSchema};
use crate::tcpros::{reject, write_header, FrameStream, TransportContext};
use crate::types::{AdvertiseOptions, OverflowPolicy};

struct SubscriberLink {
    caller_id: String,
    peer: SocketAddr,
    queue: Arc<BoundedQueue<Bytes>>,
    stats: Arc<LinkStats>,
    cancel: CancellationToken,
}

pub(crate) struct Publication {
    topic: String,
    schema: TopicSchema,
    latch: bool,
    queue_size: usize,
    overflow: OverflowPolicy,
    max_frame_bytes: usize,
    links: Mutex<HashMap<u64, SubscriberLink>>,
    latched: Mutex<Option<Bytes>>,
    published: AtomicU64,
    handles: AtomicUsize,
    cancel: CancellationToken,
}

impl Publication {
    pub fn new(
        topic: &str,
        schema: TopicSchema,
        opts: &AdvertiseOptions,
        ctx: &TransportContext,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            schema,
            latch: opts.latch,
            queue_size: opts.queue_size.unwrap_or(ctx.config.default_queue_size),
            overflow: opts.overflow,
            max_frame_bytes: ctx.config.max_frame_bytes,
            links: Mutex::new(HashMap::new()),
            latched: Mutex::new(None),
            published: AtomicU64::new(0),
            handles: AtomicUsize::new(0),
            cancel: ctx.cancel.child_token(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn schema(&self) -> &TopicSchema {
        &self.schema
    }

    pub fn num_subscribers(&self) -> usize {
        self.links.lock().len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Another local handle now shares this publication.
    pub fn acquire(&self) {
        self.handles.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of local handles still holding the publication.
    pub fn release(&self) -> usize {
        self.handles.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    /// Frame `payload` once and queue it for every connected subscriber.
    ///
    /// An oversized payload fails before anything is queued.  Subscribers
    /// whose queue overflows under [`OverflowPolicy::Disconnect`] are dropped.
    pub fn publish(&self, payload: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut links = self.links.lock();
        if self.latch {
            *self.latched.lock() = Some(frame.clone());
        }
        let mut overflowed = Vec::new();
        for (id, link) in links.iter() {
            match link.queue.push(frame.clone()) {
                PushOutcome::Queued | PushOutcome::Closed => {}
                PushOutcome::DroppedOldest => {
                    link.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                PushOutcome::Overflow => overflowed.push(*id),
            }
        }
        for id in overflowed {
            if let Some(link) = links.remove(&id) {
                tracing::warn!(
                    topic = %self.topic,
                    subscriber = %link.caller_id,
                    peer = %link.peer,
                    "subscriber queue overflowed, disconnecting"
                );
                link.cancel.cancel();
                link.queue.close();
            }
        }
        Ok(())
    }

    /// Complete the handshake with an inbound subscriber and start its
    /// writer task.  The latched message, if any, is queued first.
    pub async fn accept(
        self: &Arc<Self>,
        ctx: &TransportContext,
        header: ConnectionHeader,
        mut framed: FrameStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let caller_id = header.get("callerid").unwrap_or("unknown").to_owned();
        let md5sum = header.require("md5sum")?;
        let msg_type = header.get("type").unwrap_or("*");
        if !schema_matches(&self.schema.md5sum, md5sum)
            || !schema_matches(&self.schema.msg_type, msg_type)
        {
            let reason = format!(
                "{} expects {}/{} but {caller_id} asked for {msg_type}/{md5sum}",
                self.topic, self.schema.msg_type, self.schema.md5sum
            );
            reject(&mut framed, &reason).await;
            return Err(Error::HandshakeMismatch(reason));
        }

        let reply = ConnectionHeader::new()
            .with("callerid", ctx.caller_id.as_str())
            .with("topic", self.topic.as_str())
            .with("type", self.schema.msg_type.as_str())
            .with("md5sum", self.schema.md5sum.as_str())
            .with("message_definition", self.schema.definition.as_str())
            .with("latching", if self.latch { "1" } else { "0" });
        write_header(&mut framed, &reply).await?;

        let stream = framed.into_inner();
        stream.set_nodelay(header.flag("tcp_nodelay"))?;

        let id = ctx.next_connection_id();
        let queue = Arc::new(BoundedQueue::new(self.queue_size, self.overflow));
        let stats = Arc::new(LinkStats::default());
        let cancel = self.cancel.child_token();
        {
            let mut links = self.links.lock();
            if let Some(frame) = self.latched.lock().clone() {
                queue.push(frame);
            }
            links.insert(
                id,
                SubscriberLink {
                    caller_id: caller_id.clone(),
                    peer,
                    queue: queue.clone(),
                    stats: stats.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        tracing::info!(topic = %self.topic, subscriber = %caller_id, peer = %peer, "subscriber connected");

        let publication = self.clone();
        tokio::spawn(async move {
            publication.write_loop(id, stream, queue, stats, cancel).await;
        });
        Ok(())
    }

    async fn write_loop(
        &self,
        id: u64,
        stream: TcpStream,
        queue: Arc<BoundedQueue<Bytes>>,
        stats: Arc<LinkStats>,
        cancel: CancellationToken,
    ) {
        let (reader, mut writer) = stream.into_split();
        let eof = wait_for_eof(reader);
        tokio::pin!(eof);

        loop {
            let batch = tokio::select! {
                b = queue.pop_all() => b,
                _ = &mut eof => {
                    tracing::debug!(topic = %self.topic, "subscriber closed connection");
                    break;
                }
                _ = cancel.cancelled() => break,
            };
            let Some(frames) = batch else { break };
            let mut failed = false;
            for frame in frames {
                if let Err(e) = writer.write_all(&frame).await {
                    tracing::debug!(topic = %self.topic, error = %e, "write to subscriber failed");
                    failed = true;
                    break;
                }
                stats.record(frame.len());
            }
            if failed {
                break;
            }
        }

        queue.close();
        if let Some(link) = self.links.lock().remove(&id) {
            tracing::info!(topic = %self.topic, subscriber = %link.caller_id, "subscriber disconnected");
        }
    }

    /// `getBusInfo` rows for this topic's connections.
    pub fn bus_info(&self) -> Vec<Value> {
        self.links
            .lock()
            .iter()
            .map(|(id, link)| {
                Value::Array(vec![
                    Value::Int(*id as i32),
                    link.caller_id.as_str().into(),
                    "o".into(),
                    rn_protocol::TCPROS.into(),
                    self.topic.as_str().into(),
                    true.into(),
                ])
            })
            .collect()
    }

    /// `getBusStats` publish entry: `[topic, messageCount, [[id, bytes, msgs, connected]]]`.
    pub fn bus_stats(&self) -> Value {
        let conns = self
            .links
            .lock()
            .iter()
            .map(|(id, link)| link.stats.as_row(*id))
            .collect::<Vec<Value>>();
        Value::Array(vec![
            self.topic.as_str().into(),
            Value::Int(self.published().min(i32::MAX as u64) as i32),
            Value::Array(conns),
        ])
    }

    /// Disconnect every subscriber and refuse further publishes.
    pub fn close(&self) {
        self.cancel.cancel();
        for (_, link) in self.links.lock().drain() {
            link.queue.close();
        }
    }
}

/// Resolves when the peer closes its side (or the socket errors).
/// Subscribers send nothing after their header, so any data is discarded.
async fn wait_for_eof(mut reader: OwnedReadHalf) {
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
