//! Connection registry: fans push events out to every live channel a user
//! has. This map is the one piece of truly shared mutable state across
//! concurrent deliveries, so it is sharded with a lock per shard.
//!
//! Single-process by design; `send_to_user`/`broadcast` are the seam a
//! broker-backed implementation would slot behind.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::event::{EventKind, PushEvent};

pub type UserId = i64;
pub type ChannelId = u64;

const SHARD_COUNT: usize = 16;

/// Delivery to a channel failed; the registry prunes the channel.
#[derive(Error, Debug)]
#[error("push channel error: {0}")]
pub struct ChannelError(pub String);

/// One live client connection. Implementations serialize the frame onto
/// whatever transport the API layer speaks.
pub trait PushChannel: Send + Sync {
    fn send(&self, frame: &PushEvent) -> Result<(), ChannelError>;
}

struct ChannelEntry {
    channel: Arc<dyn PushChannel>,
    last_seen: Instant,
    ping_sent: Option<Instant>,
}

type Shard = HashMap<UserId, HashMap<ChannelId, ChannelEntry>>;

pub struct ConnectionRegistry {
    shards: Vec<RwLock<Shard>>,
    next_channel_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn read_shard(lock: &RwLock<Shard>) -> RwLockReadGuard<'_, Shard> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Registry shard lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn write_shard(lock: &RwLock<Shard>) -> RwLockWriteGuard<'_, Shard> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Registry shard lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            next_channel_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, user_id: UserId) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Adds a channel for a user and returns its id.
    pub fn register(&self, user_id: UserId, channel: Arc<dyn PushChannel>) -> ChannelId {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let mut shard = write_shard(self.shard(user_id));
        shard.entry(user_id).or_default().insert(
            id,
            ChannelEntry {
                channel,
                last_seen: Instant::now(),
                ping_sent: None,
            },
        );
        log::info!("User {} connected (channel {})", user_id, id);
        id
    }

    /// Removes one channel. Removing the last channel drops the user
    /// entry entirely so one-shot connections cannot accumulate.
    pub fn unregister(&self, user_id: UserId, channel_id: ChannelId) {
        let mut shard = write_shard(self.shard(user_id));
        if let Some(channels) = shard.get_mut(&user_id) {
            channels.remove(&channel_id);
            if channels.is_empty() {
                shard.remove(&user_id);
            }
        }
        log::info!("User {} disconnected (channel {})", user_id, channel_id);
    }

    /// Delivers an event to every channel of a user. A failing channel is
    /// pruned without aborting delivery to its siblings. Sending to a
    /// user with no channels is a no-op. Returns the delivered count.
    pub fn send_to_user(&self, user_id: UserId, event: &PushEvent) -> usize {
        let mut shard = write_shard(self.shard(user_id));
        let Some(channels) = shard.get_mut(&user_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut broken = Vec::new();
        for (id, entry) in channels.iter() {
            match entry.channel.send(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Dropping channel {} of user {}: {}", id, user_id, e);
                    broken.push(*id);
                }
            }
        }
        for id in broken {
            channels.remove(&id);
        }
        if channels.is_empty() {
            shard.remove(&user_id);
        }
        delivered
    }

    /// Delivers an event to every known channel, with the same per-channel
    /// fault isolation as `send_to_user`.
    pub fn broadcast(&self, event: &PushEvent) -> usize {
        let mut delivered = 0;
        for lock in &self.shards {
            let mut shard = write_shard(lock);
            let mut empty_users = Vec::new();
            for (user_id, channels) in shard.iter_mut() {
                let mut broken = Vec::new();
                for (id, entry) in channels.iter() {
                    match entry.channel.send(event) {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            log::warn!("Dropping channel {} of user {}: {}", id, user_id, e);
                            broken.push(*id);
                        }
                    }
                }
                for id in broken {
                    channels.remove(&id);
                }
                if channels.is_empty() {
                    empty_users.push(*user_id);
                }
            }
            for user_id in empty_users {
                shard.remove(&user_id);
            }
        }
        delivered
    }

    /// Records inbound traffic on a channel, clearing any pending probe.
    pub fn touch(&self, user_id: UserId, channel_id: ChannelId) {
        let mut shard = write_shard(self.shard(user_id));
        if let Some(entry) = shard.get_mut(&user_id).and_then(|c| c.get_mut(&channel_id)) {
            entry.last_seen = Instant::now();
            entry.ping_sent = None;
        }
    }

    /// Handles a raw inbound frame from a client: any traffic counts as
    /// liveness, and a client ping gets a pong back.
    pub fn handle_client_frame(&self, user_id: UserId, channel_id: ChannelId, raw: &str) {
        self.touch(user_id, channel_id);
        match serde_json::from_str::<PushEvent>(raw) {
            Ok(frame) if frame.kind == EventKind::Ping => {
                let channel = {
                    let shard = read_shard(self.shard(user_id));
                    shard
                        .get(&user_id)
                        .and_then(|c| c.get(&channel_id))
                        .map(|entry| Arc::clone(&entry.channel))
                };
                if let Some(channel) = channel {
                    if let Err(e) = channel.send(&PushEvent::pong()) {
                        log::warn!("Pong to channel {} of user {} failed: {}", channel_id, user_id, e);
                        self.unregister(user_id, channel_id);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("Invalid frame from user {}: {}", user_id, e);
            }
        }
    }

    /// Probes channels with no traffic inside `idle_window` and removes
    /// the ones that stayed silent after a probe. Called periodically by
    /// the keepalive loop.
    pub fn sweep_idle(&self, idle_window: Duration) {
        self.sweep_idle_at(Instant::now(), idle_window);
    }

    fn sweep_idle_at(&self, now: Instant, idle_window: Duration) {
        for lock in &self.shards {
            let mut shard = write_shard(lock);
            let mut empty_users = Vec::new();
            for (user_id, channels) in shard.iter_mut() {
                let mut dead = Vec::new();
                for (id, entry) in channels.iter_mut() {
                    match entry.ping_sent {
                        // Probed and still silent past the window: gone.
                        Some(pinged) if now.duration_since(pinged) > idle_window => {
                            dead.push(*id);
                        }
                        Some(_) => {}
                        None if now.duration_since(entry.last_seen) > idle_window => {
                            match entry.channel.send(&PushEvent::ping()) {
                                Ok(()) => entry.ping_sent = Some(now),
                                Err(e) => {
                                    log::warn!(
                                        "Keepalive ping to channel {} of user {} failed: {}",
                                        id,
                                        user_id,
                                        e
                                    );
                                    dead.push(*id);
                                }
                            }
                        }
                        None => {}
                    }
                }
                for id in dead {
                    log::info!("Removing unresponsive channel {} of user {}", id, user_id);
                    channels.remove(&id);
                }
                if channels.is_empty() {
                    empty_users.push(*user_id);
                }
            }
            for user_id in empty_users {
                shard.remove(&user_id);
            }
        }
    }

    pub fn is_user_connected(&self, user_id: UserId) -> bool {
        read_shard(self.shard(user_id))
            .get(&user_id)
            .is_some_and(|c| !c.is_empty())
    }

    pub fn connected_users(&self) -> Vec<UserId> {
        let mut users = Vec::new();
        for lock in &self.shards {
            users.extend(read_shard(lock).keys().copied());
        }
        users
    }

    pub fn channel_count(&self) -> usize {
        self.shards
            .iter()
            .map(|lock| read_shard(lock).values().map(HashMap::len).sum::<usize>())
            .sum()
    }
}

/// Handle for the background keepalive loop.
pub struct KeepaliveHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveHandle {
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Keepalive thread panicked");
            }
        }
    }
}

/// Spawns a thread that probes idle channels every `interval`.
pub fn spawn_keepalive(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    idle_window: Duration,
) -> KeepaliveHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let handle = std::thread::spawn(move || {
        log::debug!("Keepalive loop started");
        while !flag.load(Ordering::Acquire) {
            std::thread::sleep(interval);
            if flag.load(Ordering::Acquire) {
                break;
            }
            registry.sweep_idle(idle_window);
        }
        log::debug!("Keepalive loop stopped");
    });
    KeepaliveHandle {
        shutdown,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestChannel {
        sent: Mutex<Vec<PushEvent>>,
        fail: AtomicBool,
    }

    impl TestChannel {
        fn arc() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn sent(&self) -> Vec<PushEvent> {
            self.sent.lock().unwrap().clone()
        }

        fn break_channel(&self) {
            self.fail.store(true, Ordering::Relaxed);
        }
    }

    impl PushChannel for TestChannel {
        fn send(&self, frame: &PushEvent) -> Result<(), ChannelError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(ChannelError("closed".to_string()));
            }
            self.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    fn update_event() -> PushEvent {
        PushEvent::generation(super::super::event::GenerationUpdate {
            book_id: 1,
            task_id: "t".to_string(),
            status: super::super::event::UpdateStatus::Processing,
            progress: 20,
            message: "working".to_string(),
            current_step: None,
        })
    }

    #[test]
    fn test_send_to_user_reaches_all_channels() {
        let registry = ConnectionRegistry::new();
        let a = TestChannel::arc();
        let b = TestChannel::arc();
        registry.register(1, a.clone());
        registry.register(1, b.clone());

        let delivered = registry.send_to_user(1, &update_event());
        assert_eq!(delivered, 2);
        assert_eq!(a.sent().len(), 1);
        assert_eq!(b.sent().len(), 1);
    }

    #[test]
    fn test_send_to_unknown_user_is_noop() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.send_to_user(42, &update_event()), 0);
    }

    #[test]
    fn test_broken_channel_pruned_but_siblings_delivered() {
        let registry = ConnectionRegistry::new();
        let healthy = TestChannel::arc();
        let broken = TestChannel::arc();
        broken.break_channel();
        registry.register(1, broken);
        registry.register(1, healthy.clone());

        let delivered = registry.send_to_user(1, &update_event());
        assert_eq!(delivered, 1);
        assert_eq!(healthy.sent().len(), 1);
        assert_eq!(registry.channel_count(), 1);

        // Second send no longer sees the broken channel.
        assert_eq!(registry.send_to_user(1, &update_event()), 1);
    }

    #[test]
    fn test_unregister_last_channel_removes_user() {
        let registry = ConnectionRegistry::new();
        let id = registry.register(1, TestChannel::arc());
        assert!(registry.is_user_connected(1));

        registry.unregister(1, id);
        assert!(!registry.is_user_connected(1));
        assert!(registry.connected_users().is_empty());
    }

    #[test]
    fn test_all_channels_broken_removes_user() {
        let registry = ConnectionRegistry::new();
        let broken = TestChannel::arc();
        broken.break_channel();
        registry.register(5, broken);

        registry.send_to_user(5, &update_event());
        assert!(!registry.is_user_connected(5));
    }

    #[test]
    fn test_broadcast_reaches_every_user() {
        let registry = ConnectionRegistry::new();
        let a = TestChannel::arc();
        let b = TestChannel::arc();
        registry.register(1, a.clone());
        registry.register(2, b.clone());

        let delivered = registry.broadcast(&update_event());
        assert_eq!(delivered, 2);
        assert_eq!(a.sent().len(), 1);
        assert_eq!(b.sent().len(), 1);
    }

    #[test]
    fn test_client_ping_gets_pong() {
        let registry = ConnectionRegistry::new();
        let channel = TestChannel::arc();
        let id = registry.register(1, channel.clone());

        registry.handle_client_frame(1, id, r#"{"type":"ping"}"#);

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EventKind::Pong);
    }

    #[test]
    fn test_idle_channel_is_probed_then_removed() {
        let registry = ConnectionRegistry::new();
        let channel = TestChannel::arc();
        registry.register(1, channel.clone());

        let window = Duration::from_secs(30);
        let start = Instant::now();

        // Inside the window: nothing happens.
        registry.sweep_idle_at(start + Duration::from_secs(10), window);
        assert!(channel.sent().is_empty());

        // Past the window: probed with a ping.
        registry.sweep_idle_at(start + Duration::from_secs(40), window);
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EventKind::Ping);
        assert!(registry.is_user_connected(1));

        // Still silent one window after the probe: unregistered.
        registry.sweep_idle_at(start + Duration::from_secs(80), window);
        assert!(!registry.is_user_connected(1));
    }

    #[test]
    fn test_traffic_after_probe_keeps_channel() {
        let registry = ConnectionRegistry::new();
        let channel = TestChannel::arc();
        let id = registry.register(1, channel.clone());

        let window = Duration::from_secs(30);
        let start = Instant::now();

        registry.sweep_idle_at(start + Duration::from_secs(40), window);
        assert_eq!(channel.sent().len(), 1); // probe

        // Client answers (any inbound traffic clears the probe).
        registry.handle_client_frame(1, id, r#"{"type":"pong"}"#);

        registry.sweep_idle_at(start + Duration::from_secs(80), window);
        assert!(registry.is_user_connected(1));
    }

    #[test]
    fn test_keepalive_loop_runs_and_stops() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handle = spawn_keepalive(
            Arc::clone(&registry),
            Duration::from_millis(10),
            Duration::from_secs(30),
        );
        std::thread::sleep(Duration::from_millis(30));
        handle.stop();
    }

    #[test]
    fn test_many_users_shard_without_interference() {
        let registry = ConnectionRegistry::new();
        let channels: Vec<_> = (0..100)
            .map(|user_id| {
                let c = TestChannel::arc();
                registry.register(user_id, c.clone());
                c
            })
            .collect();

        assert_eq!(registry.channel_count(), 100);
        registry.send_to_user(17, &update_event());
        for (user_id, channel) in channels.iter().enumerate() {
            let expected = usize::from(user_id == 17);
            assert_eq!(channel.sent().len(), expected, "user {user_id}");
        }
    }
}
