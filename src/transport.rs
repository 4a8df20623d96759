// ===============================
// src/transport.rs (client registry + store rooms)
// ===============================
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::ClientId;
use crate::metrics::WS_CLIENTS;

/// A serialized frame, shared by every recipient of one emit.
pub type Frame = Arc<str>;

// per-client outbound queue; a client this far behind loses frames
const CLIENT_QUEUE: usize = 256;

pub fn room_name(store_id: &str) -> String {
    format!("store_{store_id}")
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, mpsc::Sender<Frame>>,
    rooms: HashMap<String, HashSet<ClientId>>,
    memberships: HashMap<ClientId, HashSet<String>>,
}

/// Connected realtime clients and their room memberships.
///
/// The lock is only taken for synchronous bookkeeping and `try_send`,
/// never across an `.await`.
#[derive(Default)]
pub struct Transport {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl Transport {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connect(&self) -> (ClientId, mpsc::Receiver<Frame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let mut reg = self.lock();
        reg.clients.insert(id, tx);
        WS_CLIENTS.set(reg.clients.len() as i64);
        (id, rx)
    }

    /// Drops the client and every room membership it held.
    pub fn disconnect(&self, id: ClientId) {
        let mut reg = self.lock();
        reg.clients.remove(&id);
        if let Some(rooms) = reg.memberships.remove(&id) {
            for room in rooms {
                let empty = match reg.rooms.get_mut(&room) {
                    Some(members) => {
                        members.remove(&id);
                        members.is_empty()
                    }
                    None => false,
                };
                if empty {
                    reg.rooms.remove(&room);
                }
            }
        }
        WS_CLIENTS.set(reg.clients.len() as i64);
    }

    /// Adds the client to the store's room and returns the room name.
    pub fn join(&self, id: ClientId, store_id: &str) -> Option<String> {
        let room = room_name(store_id);
        let mut reg = self.lock();
        if !reg.clients.contains_key(&id) {
            return None;
        }
        reg.rooms.entry(room.clone()).or_default().insert(id);
        reg.memberships.entry(id).or_default().insert(room.clone());
        Some(room)
    }

    pub fn send_all(&self, frame: &Frame) -> usize {
        let reg = self.lock();
        reg.clients.iter().filter(|(id, tx)| deliver(**id, tx, frame)).count()
    }

    pub fn send_room(&self, store_id: &str, frame: &Frame) -> usize {
        let reg = self.lock();
        let Some(members) = reg.rooms.get(&room_name(store_id)) else {
            return 0;
        };
        members
            .iter()
            .filter_map(|id| reg.clients.get(id).map(|tx| (*id, tx)))
            .filter(|(id, tx)| deliver(*id, tx, frame))
            .count()
    }

    pub fn send_to(&self, id: ClientId, frame: &Frame) -> bool {
        let reg = self.lock();
        reg.clients.get(&id).map(|tx| deliver(id, tx, frame)).unwrap_or(false)
    }

    pub fn client_count(&self) -> usize { self.lock().clients.len() }

    #[cfg(test)]
    pub fn room_size(&self, store_id: &str) -> usize {
        self.lock().rooms.get(&room_name(store_id)).map(|m| m.len()).unwrap_or(0)
    }
}

fn deliver(id: ClientId, tx: &mpsc::Sender<Frame>, frame: &Frame) -> bool {
    match tx.try_send(frame.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(client = id, "client queue full, frame dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Frame { Arc::from(s) }

    #[test]
    fn room_sends_reach_members_only() {
        let t = Transport::new();
        let (a, mut rx_a) = t.connect();
        let (_b, mut rx_b) = t.connect();
        assert_eq!(t.join(a, "7").as_deref(), Some("store_7"));

        assert_eq!(t.send_room("7", &frame("room")), 1);
        assert_eq!(t.send_all(&frame("all")), 2);

        assert_eq!(&*rx_a.try_recv().unwrap(), "room");
        assert_eq!(&*rx_a.try_recv().unwrap(), "all");
        assert_eq!(&*rx_b.try_recv().unwrap(), "all");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn disconnect_clears_memberships() {
        let t = Transport::new();
        let (a, _rx) = t.connect();
        t.join(a, "s1");
        t.join(a, "s2");
        assert_eq!(t.room_size("s1"), 1);

        t.disconnect(a);
        assert_eq!(t.room_size("s1"), 0);
        assert_eq!(t.room_size("s2"), 0);
        assert_eq!(t.client_count(), 0);
        assert_eq!(t.send_room("s1", &frame("x")), 0);
        assert!(t.join(a, "s1").is_none());
    }

    #[test]
    fn slow_client_drops_instead_of_blocking() {
        let t = Transport::new();
        let (a, _rx) = t.connect();
        for _ in 0..CLIENT_QUEUE {
            assert!(t.send_to(a, &frame("x")));
        }
        assert!(!t.send_to(a, &frame("overflow")));
    }
}
