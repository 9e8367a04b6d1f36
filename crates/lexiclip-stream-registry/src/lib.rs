//! Process-local table of active streaming-analysis calls. Guarantees
//! at-most-one upstream call per fingerprint: the first subscriber to a
//! fingerprint becomes the owner and drives the upstream call; everyone else
//! attaches as a fan-out subscriber, optionally replaying accumulated
//! output first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lexiclip_analysis_cache::{replay_delay_ms, ChunkLogEntry};
use tokio::sync::mpsc;

const MAX_ACTIVE_STREAMS: usize = 100;
const EVICTION_FRACTION: usize = 10;
const CLEANUP_DELAY_ON_COMPLETE: Duration = Duration::from_secs(5 * 60);
const CLEANUP_DELAY_ON_ERROR: Duration = Duration::from_secs(1);
const REPLAY_TAIL_POLL_DELAY_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub sentence: String,
    pub target_word: String,
    pub target_language: String,
    pub native_language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Active,
    Completed,
    Errored,
}

#[derive(Debug, Clone)]
pub enum ServerFrame {
    Chunk { text: String },
    Done { full_response: String },
    Error { message: String },
}

struct Subscriber {
    sender: mpsc::UnboundedSender<ServerFrame>,
    replaying: bool,
}

/// Chunk log and subscriber table live behind one lock so that appending a
/// chunk and flipping a subscriber between replaying and live are never
/// observed as two separate moments — see `publish_chunk` and
/// `try_finish_replay`.
#[derive(Default)]
struct StreamState {
    chunk_log: Vec<ChunkLogEntry>,
    subscribers: HashMap<u64, Subscriber>,
}

pub struct ActiveStream {
    pub fingerprint: String,
    pub params: StreamParams,
    state: Mutex<StreamState>,
    accumulated_text: Mutex<String>,
    status: RwLock<StreamStatus>,
    error: Mutex<Option<String>>,
    created_at: Instant,
    next_subscriber_id: AtomicU64,
}

impl ActiveStream {
    fn new(fingerprint: String, params: StreamParams) -> Self {
        Self {
            fingerprint,
            params,
            state: Mutex::new(StreamState::default()),
            accumulated_text: Mutex::new(String::new()),
            status: RwLock::new(StreamStatus::Active),
            error: Mutex::new(None),
            created_at: Instant::now(),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.read().unwrap()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    fn elapsed_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    /// Appends a chunk to the log and broadcasts it to every non-replaying
    /// subscriber under a single lock acquisition, so a subscriber caught
    /// mid-transition by `try_finish_replay` can never miss this chunk or
    /// see it twice. A dead write removes that subscriber.
    pub fn publish_chunk(&self, text: &str) {
        let timestamp_ms = self.elapsed_ms();
        self.accumulated_text.lock().unwrap().push_str(text);
        let mut state = self.state.lock().unwrap();
        state.chunk_log.push(ChunkLogEntry {
            text: text.to_string(),
            timestamp_ms,
        });
        let frame = ServerFrame::Chunk { text: text.to_string() };
        state
            .subscribers
            .retain(|_, sub| sub.replaying || sub.sender.send(frame.clone()).is_ok());
    }

    pub fn complete(&self) {
        *self.status.write().unwrap() = StreamStatus::Completed;
        let full_response = self.accumulated_text.lock().unwrap().clone();
        self.broadcast_live_and_close(ServerFrame::Done { full_response });
    }

    pub fn fail(&self, message: String) {
        *self.status.write().unwrap() = StreamStatus::Errored;
        *self.error.lock().unwrap() = Some(message.clone());
        self.broadcast_live_and_close(ServerFrame::Error { message });
    }

    /// Sends the terminal frame to every non-replaying subscriber, then
    /// drops them so their connection is torn down.
    fn broadcast_live_and_close(&self, frame: ServerFrame) {
        let mut state = self.state.lock().unwrap();
        let live_ids: Vec<u64> = state
            .subscribers
            .iter()
            .filter(|(_, sub)| !sub.replaying)
            .map(|(id, _)| *id)
            .collect();
        for id in live_ids {
            if let Some(sub) = state.subscribers.get(&id) {
                let _ = sub.sender.send(frame.clone());
            }
            state.subscribers.remove(&id);
        }
    }

    /// Registers a subscriber and decides whether it needs a replay task in
    /// one lock acquisition, so the `replaying` flag this stores and the
    /// spawn decision `subscribe` makes from the return value are always in
    /// agreement: a subscriber is replaying if and only if a replay task runs
    /// for it.
    fn add_subscriber(&self, sender: mpsc::UnboundedSender<ServerFrame>) -> (u64, bool) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let replaying = !state.chunk_log.is_empty();
        state.subscribers.insert(id, Subscriber { sender, replaying });
        (id, replaying)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.state.lock().unwrap().subscribers.remove(&id);
    }

    /// Snapshot of the chunk log so far, for a driver task to persist once
    /// the stream reaches a terminal status.
    pub fn chunk_log(&self) -> Vec<ChunkLogEntry> {
        self.chunk_log_snapshot()
    }

    pub fn accumulated_text(&self) -> String {
        self.accumulated_text.lock().unwrap().clone()
    }

    fn chunk_log_snapshot(&self) -> Vec<ChunkLogEntry> {
        self.state.lock().unwrap().chunk_log.clone()
    }

    fn send_to_subscriber(&self, id: u64, frame: ServerFrame) -> bool {
        let state = self.state.lock().unwrap();
        match state.subscribers.get(&id) {
            Some(sub) => sub.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Atomically checks whether the log has grown past `caught_up_to` and,
    /// if not, flips the subscriber to live in the same critical section.
    /// Racing with `publish_chunk` resolves one of two ways: the append
    /// lands first, so this sees a longer log and keeps replaying instead of
    /// going live stale; or this lands first, so the subscriber is already
    /// live by the time the append's broadcast runs. Either way the chunk is
    /// delivered exactly once.
    fn try_finish_replay(&self, subscriber_id: u64, caught_up_to: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.chunk_log.len() != caught_up_to {
            return false;
        }
        if let Some(sub) = state.subscribers.get_mut(&subscriber_id) {
            sub.replaying = false;
        }
        true
    }
}

/// Runs the paced replay of `stream`'s chunk log for the late joiner
/// `subscriber_id`, starting from the beginning of the log. Guarantees no
/// chunk is lost crossing the replay-to-live transition and none is
/// delivered twice.
async fn run_replay(stream: std::sync::Arc<ActiveStream>, subscriber_id: u64) {
    let mut index = 0usize;

    loop {
        let log = stream.chunk_log_snapshot();

        if index >= log.len() {
            if stream.status() != StreamStatus::Active {
                let terminal = match stream.status() {
                    StreamStatus::Completed => ServerFrame::Done {
                        full_response: stream.accumulated_text.lock().unwrap().clone(),
                    },
                    StreamStatus::Errored => ServerFrame::Error {
                        message: stream
                            .error
                            .lock()
                            .unwrap()
                            .clone()
                            .unwrap_or_default(),
                    },
                    StreamStatus::Active => unreachable!(),
                };
                stream.send_to_subscriber(subscriber_id, terminal);
                stream.unsubscribe(subscriber_id);
                return;
            }

            tokio::time::sleep(Duration::from_millis(REPLAY_TAIL_POLL_DELAY_MS)).await;
            if stream.status() == StreamStatus::Active && stream.try_finish_replay(subscriber_id, index) {
                return;
            }
            continue;
        }

        let entry = &log[index];
        let delivered = stream.send_to_subscriber(
            subscriber_id,
            ServerFrame::Chunk {
                text: entry.text.clone(),
            },
        );
        if !delivered {
            return;
        }

        if index + 1 < log.len() {
            let delay = replay_delay_ms(entry.timestamp_ms, log[index + 1].timestamp_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        index += 1;
    }
}

#[derive(Clone)]
pub struct StreamRegistry {
    streams: std::sync::Arc<DashMap<String, std::sync::Arc<ActiveStream>>>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Returns the existing registration for `fingerprint`, or creates one
    /// and spawns `drive` as its single upstream-driving task.
    pub fn get_or_create<F, Fut>(
        &self,
        fingerprint: &str,
        params: StreamParams,
        drive: F,
    ) -> std::sync::Arc<ActiveStream>
    where
        F: FnOnce(std::sync::Arc<ActiveStream>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some(existing) = self.streams.get(fingerprint) {
            return existing.clone();
        }

        self.evict_if_at_capacity();

        match self.streams.entry(fingerprint.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let stream = std::sync::Arc::new(ActiveStream::new(fingerprint.to_string(), params));
                entry.insert(stream.clone());
                tokio::spawn(drive(stream.clone()));
                stream
            }
        }
    }

    pub fn subscribe(
        &self,
        fingerprint: &str,
    ) -> Option<(u64, mpsc::UnboundedReceiver<ServerFrame>, std::sync::Arc<ActiveStream>)> {
        let stream = self.streams.get(fingerprint)?.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, replaying) = stream.add_subscriber(tx);

        if replaying {
            let stream_for_replay = stream.clone();
            tokio::spawn(run_replay(stream_for_replay, id));
        }

        Some((id, rx, stream))
    }

    pub fn unsubscribe(&self, fingerprint: &str, id: u64) {
        if let Some(stream) = self.streams.get(fingerprint) {
            stream.unsubscribe(id);
        }
    }

    /// Schedules removal of a terminal, subscriber-free stream after the
    /// spec's delay for its terminal status.
    pub fn schedule_cleanup(&self, fingerprint: &str) {
        let delay = match self.streams.get(fingerprint).map(|s| s.status()) {
            Some(StreamStatus::Completed) => CLEANUP_DELAY_ON_COMPLETE,
            Some(StreamStatus::Errored) => CLEANUP_DELAY_ON_ERROR,
            _ => return,
        };
        let fingerprint = fingerprint.to_string();
        let streams = self.streams.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(stream) = streams.get(&fingerprint) {
                if stream.subscriber_count() == 0 {
                    drop(stream);
                    streams.remove(&fingerprint);
                }
            }
        });
    }

    fn evict_if_at_capacity(&self) {
        if self.streams.len() < MAX_ACTIVE_STREAMS {
            return;
        }

        let mut eligible: Vec<(String, Instant)> = self
            .streams
            .iter()
            .filter(|entry| entry.status() != StreamStatus::Active && entry.subscriber_count() == 0)
            .map(|entry| (entry.key().clone(), entry.created_at))
            .collect();
        eligible.sort_by_key(|(_, created_at)| *created_at);

        let evict_count = (eligible.len() / EVICTION_FRACTION).max(1).min(eligible.len());
        for (fingerprint, _) in eligible.into_iter().take(evict_count) {
            self.streams.remove(&fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StreamParams {
        StreamParams {
            sentence: "hello world".into(),
            target_word: "hello".into(),
            target_language: "en".into(),
            native_language: "fr".into(),
        }
    }

    #[tokio::test]
    async fn get_or_create_drives_once_for_duplicate_calls() {
        let registry = StreamRegistry::new();
        let drive_count = std::sync::Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let drive_count = drive_count.clone();
            registry.get_or_create("fp1", params(), move |_stream| async move {
                drive_count.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::task::yield_now().await;
        assert_eq!(drive_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_chunk_reaches_live_subscriber() {
        let registry = StreamRegistry::new();
        let stream = registry.get_or_create("fp2", params(), |_s| async {});
        let (_, mut rx, _) = registry.subscribe("fp2").unwrap();

        stream.publish_chunk("hi");
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, ServerFrame::Chunk { text } if text == "hi"));
    }

    #[tokio::test]
    async fn late_subscriber_replays_then_goes_live() {
        let registry = StreamRegistry::new();
        let stream = registry.get_or_create("fp3", params(), |_s| async {});
        stream.publish_chunk("a");
        stream.publish_chunk("b");

        let (_, mut rx, _) = registry.subscribe("fp3").unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, ServerFrame::Chunk { text } if text == "a"));
        assert!(matches!(second, ServerFrame::Chunk { text } if text == "b"));

        stream.publish_chunk("c");
        let third = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(third, ServerFrame::Chunk { text } if text == "c"));
    }

    #[tokio::test]
    async fn complete_emits_done_and_closes_live_subscribers() {
        let registry = StreamRegistry::new();
        let stream = registry.get_or_create("fp4", params(), |_s| async {});
        let (_, mut rx, _) = registry.subscribe("fp4").unwrap();

        stream.publish_chunk("hi");
        rx.recv().await.unwrap();
        stream.complete();

        let done = rx.recv().await.unwrap();
        assert!(matches!(done, ServerFrame::Done { full_response } if full_response == "hi"));
        assert!(rx.recv().await.is_none());
    }
}
