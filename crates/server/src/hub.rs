//! Room registry and fan-out.
//!
//! Every live connection owns a bounded outbox. Publishing walks the room's
//! subscriber set and `try_send`s into each outbox, so a slow or dead
//! subscriber never stalls the publisher or its neighbours. Subscriptions are
//! tied to a [`HubConnection`] and vanish when it is dropped, or earlier when
//! the owning user loses access to the room.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use chatroom_storage::Message;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedMutexGuard};
use uuid::Uuid;

pub type ConnectionId = Uuid;
pub type Outbox = mpsc::Receiver<Arc<str>>;

const ROOM_LOCK_PRUNE_THRESHOLD: usize = 256;

/// Frames pushed to clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame<'a> {
    Message { data: &'a Message },
    Error { message: &'a str },
}

impl ServerFrame<'_> {
    pub fn encode(&self) -> serde_json::Result<Arc<str>> {
        serde_json::to_string(self).map(Arc::from)
    }
}

#[derive(Clone)]
struct Subscriber {
    user_id: Uuid,
    sender: mpsc::Sender<Arc<str>>,
}

type Subscribers = HashMap<ConnectionId, Subscriber>;

struct HubInner {
    rooms: RwLock<HashMap<Uuid, Subscribers>>,
    writers: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    outbox_capacity: usize,
}

#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<HubInner>,
}

impl RoomHub {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: RwLock::new(HashMap::new()),
                writers: Mutex::new(HashMap::new()),
                outbox_capacity: outbox_capacity.max(1),
            }),
        }
    }

    /// Registers a new connection for `user_id`. Nothing is delivered until it
    /// subscribes.
    pub fn connect(&self, user_id: Uuid) -> (HubConnection, Outbox) {
        let (sender, outbox) = mpsc::channel(self.inner.outbox_capacity);
        let connection = HubConnection {
            id: Uuid::new_v4(),
            user_id,
            hub: self.clone(),
            sender,
            rooms: HashSet::new(),
        };
        (connection, outbox)
    }

    /// Delivers `payload` to every connection subscribed to `room_id` and
    /// returns the ids that accepted it.
    pub fn publish(&self, room_id: Uuid, payload: Arc<str>) -> Vec<ConnectionId> {
        let rooms = self
            .inner
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = rooms.get(&room_id) else {
            return Vec::new();
        };

        let mut delivered = Vec::with_capacity(subscribers.len());
        for (connection_id, subscriber) in subscribers {
            match subscriber.sender.try_send(payload.clone()) {
                Ok(()) => delivered.push(*connection_id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection_id = %connection_id,
                        room_id = %room_id,
                        "subscriber outbox full; dropping frame"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Drops every subscription `user_id` holds on `room_id` and returns how
    /// many connections were affected.
    pub fn evict_user(&self, room_id: Uuid, user_id: Uuid) -> usize {
        let mut rooms = self
            .inner
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = rooms.get_mut(&room_id) else {
            return 0;
        };
        let before = subscribers.len();
        subscribers.retain(|_, subscriber| subscriber.user_id != user_id);
        let evicted = before - subscribers.len();
        if subscribers.is_empty() {
            rooms.remove(&room_id);
        }
        evicted
    }

    /// Drops every subscription on `room_id`.
    pub fn close_room(&self, room_id: Uuid) {
        self.inner
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&room_id);
    }

    pub fn subscriber_count(&self, room_id: Uuid) -> usize {
        self.inner
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&room_id)
            .map_or(0, HashMap::len)
    }

    /// Serialises writers of one room so persistence order and delivery order agree.
    pub async fn lock_room(&self, room_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut writers = self
                .inner
                .writers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if writers.len() > ROOM_LOCK_PRUNE_THRESHOLD {
                writers.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            writers.entry(room_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn subscribe(&self, room_id: Uuid, connection_id: ConnectionId, subscriber: Subscriber) {
        self.inner
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(room_id)
            .or_default()
            .insert(connection_id, subscriber);
    }

    fn unsubscribe(&self, connection_id: ConnectionId, rooms: impl IntoIterator<Item = Uuid>) {
        let mut map = self
            .inner
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for room_id in rooms {
            if let Some(subscribers) = map.get_mut(&room_id) {
                subscribers.remove(&connection_id);
                if subscribers.is_empty() {
                    map.remove(&room_id);
                }
            }
        }
    }
}

/// A registered connection. Dropping it removes every subscription it holds.
pub struct HubConnection {
    id: ConnectionId,
    user_id: Uuid,
    hub: RoomHub,
    sender: mpsc::Sender<Arc<str>>,
    rooms: HashSet<Uuid>,
}

impl HubConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Uuid> {
        self.rooms.iter()
    }

    /// Idempotent per room.
    pub fn subscribe(&mut self, room_id: Uuid) {
        if self.rooms.insert(room_id) {
            let subscriber = Subscriber {
                user_id: self.user_id,
                sender: self.sender.clone(),
            };
            self.hub.subscribe(room_id, self.id, subscriber);
        }
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id, self.rooms.drain());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn payload(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[test]
    fn every_subscriber_receives_exactly_one_copy() {
        let hub = RoomHub::new(8);
        let room = Uuid::new_v4();
        let mut connections = Vec::new();
        for _ in 0..5 {
            let (mut connection, outbox) = hub.connect(Uuid::new_v4());
            connection.subscribe(room);
            connection.subscribe(room);
            connections.push((connection, outbox));
        }

        let delivered = hub.publish(room, payload("hello"));
        assert_eq!(delivered.len(), 5);

        for (connection, outbox) in &mut connections {
            assert!(delivered.contains(&connection.id()));
            assert_eq!(outbox.try_recv().unwrap().as_ref(), "hello");
            assert!(matches!(outbox.try_recv(), Err(TryRecvError::Empty)));
        }
    }

    #[test]
    fn dropped_connections_receive_nothing_and_leave_no_subscription() {
        let hub = RoomHub::new(8);
        let room = Uuid::new_v4();
        let (mut stays, mut stays_outbox) = hub.connect(Uuid::new_v4());
        let (mut leaves, mut leaves_outbox) = hub.connect(Uuid::new_v4());
        stays.subscribe(room);
        leaves.subscribe(room);
        assert_eq!(hub.subscriber_count(room), 2);

        drop(leaves);
        assert_eq!(hub.subscriber_count(room), 1);

        let delivered = hub.publish(room, payload("after"));
        assert_eq!(delivered, vec![stays.id()]);
        assert_eq!(stays_outbox.try_recv().unwrap().as_ref(), "after");
        assert!(matches!(
            leaves_outbox.try_recv(),
            Err(TryRecvError::Disconnected)
        ));

        drop(stays);
        assert_eq!(hub.subscriber_count(room), 0);
    }

    #[test]
    fn full_outbox_does_not_block_other_subscribers() {
        let hub = RoomHub::new(1);
        let room = Uuid::new_v4();
        let (mut slow, _slow_outbox) = hub.connect(Uuid::new_v4());
        let (mut fast, mut fast_outbox) = hub.connect(Uuid::new_v4());
        slow.subscribe(room);
        fast.subscribe(room);

        assert_eq!(hub.publish(room, payload("one")).len(), 2);
        assert_eq!(fast_outbox.try_recv().unwrap().as_ref(), "one");

        let delivered = hub.publish(room, payload("two"));
        assert_eq!(delivered, vec![fast.id()]);
        assert_eq!(fast_outbox.try_recv().unwrap().as_ref(), "two");
    }

    #[test]
    fn publishing_is_scoped_to_the_room() {
        let hub = RoomHub::new(4);
        let (mut connection, mut outbox) = hub.connect(Uuid::new_v4());
        let subscribed = Uuid::new_v4();
        connection.subscribe(subscribed);

        assert!(hub.publish(Uuid::new_v4(), payload("elsewhere")).is_empty());
        assert!(matches!(outbox.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(connection.rooms().count(), 1);
    }

    #[test]
    fn evicting_a_user_only_drops_their_connections() {
        let hub = RoomHub::new(4);
        let room = Uuid::new_v4();
        let other_room = Uuid::new_v4();
        let removed = Uuid::new_v4();
        let (mut phone, mut phone_outbox) = hub.connect(removed);
        let (mut laptop, _laptop_outbox) = hub.connect(removed);
        let (mut stays, mut stays_outbox) = hub.connect(Uuid::new_v4());
        phone.subscribe(room);
        phone.subscribe(other_room);
        laptop.subscribe(room);
        stays.subscribe(room);

        assert_eq!(hub.evict_user(room, removed), 2);
        assert_eq!(hub.evict_user(room, removed), 0);
        assert_eq!(hub.publish(room, payload("private")), vec![stays.id()]);
        assert_eq!(stays_outbox.try_recv().unwrap().as_ref(), "private");
        assert!(matches!(phone_outbox.try_recv(), Err(TryRecvError::Empty)));

        assert_eq!(hub.publish(other_room, payload("still here")), vec![phone.id()]);
        drop(phone);
        drop(laptop);
        assert_eq!(hub.subscriber_count(room), 1);
        assert_eq!(hub.subscriber_count(other_room), 0);

        hub.close_room(room);
        assert_eq!(hub.subscriber_count(room), 0);
        assert!(hub.publish(room, payload("gone")).is_empty());
    }

    #[test]
    fn frames_serialise_with_type_tag() {
        let frame = ServerFrame::Error {
            message: "nope",
        };
        let value: serde_json::Value =
            serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "nope");
    }

    #[tokio::test]
    async fn room_lock_serialises_writers() {
        let hub = RoomHub::new(4);
        let room = Uuid::new_v4();
        let guard = hub.lock_room(room).await;

        let contender = {
            let hub = hub.clone();
            tokio::spawn(async move {
                let _guard = hub.lock_room(room).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
