//! In-process directory
//!
//! Shared by every session in the process that is given the same `Arc`.
//! Notifications are delivered synchronously from inside the mutating call,
//! which is at-least-once by construction.

use super::{
    DirectoryResult, DirectoryService, EnvelopeId, RecordChange, ServerRecord, StoredEnvelope,
    SubscriptionId,
};
use crate::core::{BoxFuture, Clock, DirectoryError, Notify, PeerId};
use crate::signaling::SignalingEnvelope;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::ready;
use std::sync::Arc;
use tracing::trace;

enum Subscriber {
    Mailbox {
        host: PeerId,
        recipient: PeerId,
        sink: Notify<StoredEnvelope>,
    },
    Record {
        id: PeerId,
        sink: Notify<RecordChange>,
    },
}

#[derive(Default)]
struct DirectoryState {
    servers: HashMap<PeerId, ServerRecord>,
    mailboxes: HashMap<PeerId, Vec<StoredEnvelope>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscription: u64,
    reachable: bool,
}

/// Directory held entirely in memory
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryDirectory {
    /// Create an empty, reachable directory stamping with `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(DirectoryState {
                reachable: true,
                ..Default::default()
            }),
            clock,
        }
    }

    /// Simulate the store going offline (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Insert a record with an explicit heartbeat time, bypassing server stamping
    pub fn insert_record(&self, record: ServerRecord) {
        let mut state = self.state.lock();
        Self::notify_record(&state, &record.id, RecordChange::Present(record.clone()));
        state.servers.insert(record.id.clone(), record);
    }

    /// Snapshot of a record
    pub fn record(&self, id: &PeerId) -> Option<ServerRecord> {
        self.state.lock().servers.get(id).cloned()
    }

    /// Number of advertised hosts
    pub fn server_count(&self) -> usize {
        self.state.lock().servers.len()
    }

    /// Envelopes currently waiting in `host`'s mailbox
    pub fn mailbox(&self, host: &PeerId) -> Vec<StoredEnvelope> {
        self.state
            .lock()
            .mailboxes
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn check(state: &DirectoryState) -> DirectoryResult<()> {
        if state.reachable {
            Ok(())
        } else {
            Err(DirectoryError::Unavailable("directory unreachable".into()))
        }
    }

    fn notify_record(state: &DirectoryState, id: &PeerId, change: RecordChange) {
        for subscriber in state.subscribers.values() {
            if let Subscriber::Record { id: watched, sink } = subscriber {
                if watched == id {
                    sink(change.clone());
                }
            }
        }
    }

    fn notify_mailbox(state: &DirectoryState, stored: &StoredEnvelope) {
        for subscriber in state.subscribers.values() {
            if let Subscriber::Mailbox { host, recipient, sink } = subscriber {
                if *host == stored.host && *recipient == stored.envelope.to {
                    sink(stored.clone());
                }
            }
        }
    }

    fn latest(&self) -> DirectoryResult<Option<ServerRecord>> {
        let state = self.state.lock();
        Self::check(&state)?;
        Ok(state
            .servers
            .values()
            .max_by_key(|record| record.last_heartbeat)
            .cloned())
    }

    fn create(&self, id: &PeerId) -> DirectoryResult<ServerRecord> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        let record = ServerRecord {
            id: id.clone(),
            last_heartbeat: self.clock.now_ms(),
            joinable: true,
        };
        state.servers.insert(id.clone(), record.clone());
        Self::notify_record(&state, id, RecordChange::Present(record.clone()));
        Ok(record)
    }

    fn touch(&self, id: &PeerId) -> DirectoryResult<ServerRecord> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        let now = self.clock.now_ms();
        let record = state
            .servers
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        record.last_heartbeat = now;
        let record = record.clone();
        Self::notify_record(&state, id, RecordChange::Present(record.clone()));
        Ok(record)
    }

    fn delete(&self, id: &PeerId) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        state.mailboxes.remove(id);
        if state.servers.remove(id).is_some() {
            Self::notify_record(&state, id, RecordChange::Deleted);
        }
        Ok(())
    }

    fn post(&self, host: &PeerId, mut envelope: SignalingEnvelope) -> DirectoryResult<EnvelopeId> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        if !state.servers.contains_key(host) {
            return Err(DirectoryError::Delivery(format!("no mailbox for {}", host)));
        }
        envelope.timestamp = Some(self.clock.now_ms());
        let stored = StoredEnvelope {
            host: host.clone(),
            id: EnvelopeId::random(),
            envelope,
        };
        trace!(
            "mailbox {}: {} {} -> {}",
            host,
            stored.envelope.kind.as_str(),
            stored.envelope.from,
            stored.envelope.to
        );
        state
            .mailboxes
            .entry(host.clone())
            .or_default()
            .push(stored.clone());
        Self::notify_mailbox(&state, &stored);
        Ok(stored.id)
    }

    fn remove_envelope(&self, host: &PeerId, id: EnvelopeId) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        Self::check(&state)?;
        if let Some(mailbox) = state.mailboxes.get_mut(host) {
            mailbox.retain(|stored| stored.id != id);
        }
        Ok(())
    }

    fn add_subscriber(state: &mut DirectoryState, subscriber: Subscriber) -> SubscriptionId {
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscribers.insert(id, subscriber);
        SubscriptionId(id)
    }
}

impl DirectoryService for MemoryDirectory {
    fn latest_server(&self) -> BoxFuture<'_, DirectoryResult<Option<ServerRecord>>> {
        Box::pin(ready(self.latest()))
    }

    fn create_server(&self, id: &PeerId) -> BoxFuture<'_, DirectoryResult<ServerRecord>> {
        Box::pin(ready(self.create(id)))
    }

    fn touch_server(&self, id: &PeerId) -> BoxFuture<'_, DirectoryResult<ServerRecord>> {
        Box::pin(ready(self.touch(id)))
    }

    fn delete_server(&self, id: &PeerId) -> BoxFuture<'_, DirectoryResult<()>> {
        Box::pin(ready(self.delete(id)))
    }

    fn post_envelope(
        &self,
        host: &PeerId,
        envelope: SignalingEnvelope,
    ) -> BoxFuture<'_, DirectoryResult<EnvelopeId>> {
        Box::pin(ready(self.post(host, envelope)))
    }

    fn delete_envelope(&self, host: &PeerId, id: EnvelopeId) -> BoxFuture<'_, DirectoryResult<()>> {
        Box::pin(ready(self.remove_envelope(host, id)))
    }

    fn subscribe_mailbox(
        &self,
        host: &PeerId,
        recipient: &PeerId,
        sink: Notify<StoredEnvelope>,
    ) -> DirectoryResult<SubscriptionId> {
        let mut state = self.state.lock();
        Self::check(&state)?;

        // Initial snapshot: everything already waiting counts as "added"
        if let Some(mailbox) = state.mailboxes.get(host) {
            for stored in mailbox.iter().filter(|s| s.envelope.to == *recipient) {
                sink(stored.clone());
            }
        }

        Ok(Self::add_subscriber(
            &mut state,
            Subscriber::Mailbox {
                host: host.clone(),
                recipient: recipient.clone(),
                sink,
            },
        ))
    }

    fn watch_server(&self, id: &PeerId, sink: Notify<RecordChange>) -> DirectoryResult<SubscriptionId> {
        let mut state = self.state.lock();
        Self::check(&state)?;

        let current = match state.servers.get(id) {
            Some(record) => RecordChange::Present(record.clone()),
            None => RecordChange::Deleted,
        };
        sink(current);

        Ok(Self::add_subscriber(
            &mut state,
            Subscriber::Record {
                id: id.clone(),
                sink,
            },
        ))
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        self.state.lock().subscribers.remove(&subscription.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::signaling::{PeerSignal, SessionDescription};

    fn setup() -> (Arc<ManualClock>, MemoryDirectory) {
        let clock = Arc::new(ManualClock::new(10_000));
        let directory = MemoryDirectory::new(clock.clone());
        (clock, directory)
    }

    fn offer(from: &str, to: &str) -> SignalingEnvelope {
        SignalingEnvelope::new(
            PeerId::from(from),
            PeerId::from(to),
            PeerSignal::Offer(SessionDescription::offer("v=0")),
        )
    }

    fn collector<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Notify<T>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: Notify<T> = Arc::new(move |value| sink_seen.lock().push(value));
        (seen, sink)
    }

    #[tokio::test]
    async fn latest_server_prefers_most_recent_heartbeat() {
        let (clock, directory) = setup();
        let a = PeerId::from("game_aa222");
        let b = PeerId::from("game_bb333");

        directory.create_server(&a).await.unwrap();
        clock.advance(5_000);
        directory.create_server(&b).await.unwrap();
        assert_eq!(directory.latest_server().await.unwrap().unwrap().id, b);

        clock.advance(5_000);
        directory.touch_server(&a).await.unwrap();
        let latest = directory.latest_server().await.unwrap().unwrap();
        assert_eq!(latest.id, a);
        assert_eq!(latest.last_heartbeat, 20_000);
        assert!(latest.joinable);
    }

    #[tokio::test]
    async fn mailbox_subscription_filters_by_recipient_and_replays() {
        let (_clock, directory) = setup();
        let host = PeerId::from("game_aa222");
        directory.create_server(&host).await.unwrap();

        directory.post_envelope(&host, offer("client_cc444", "game_aa222")).await.unwrap();
        directory.post_envelope(&host, offer("game_aa222", "client_cc444")).await.unwrap();

        let (seen, sink) = collector::<StoredEnvelope>();
        directory.subscribe_mailbox(&host, &host, sink).unwrap();
        assert_eq!(seen.lock().len(), 1, "existing envelope replayed");

        directory.post_envelope(&host, offer("client_dd555", "game_aa222")).await.unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|s| s.envelope.to == host));
        assert_eq!(seen[1].envelope.timestamp, Some(10_000));
    }

    #[tokio::test]
    async fn envelope_delete_is_idempotent() {
        let (_clock, directory) = setup();
        let host = PeerId::from("game_aa222");
        directory.create_server(&host).await.unwrap();
        let id = directory.post_envelope(&host, offer("client_cc444", "game_aa222")).await.unwrap();

        directory.delete_envelope(&host, id).await.unwrap();
        directory.delete_envelope(&host, id).await.unwrap();
        assert!(directory.mailbox(&host).is_empty());
    }

    #[tokio::test]
    async fn watch_reports_existence_and_deletion() {
        let (_clock, directory) = setup();
        let host = PeerId::from("game_aa222");
        directory.create_server(&host).await.unwrap();

        let (seen, sink) = collector::<RecordChange>();
        let sub = directory.watch_server(&host, sink).unwrap();
        directory.delete_server(&host).await.unwrap();
        directory.delete_server(&host).await.unwrap();

        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 2);
            assert!(matches!(seen[0], RecordChange::Present(_)));
            assert_eq!(seen[1], RecordChange::Deleted);
        }

        directory.unsubscribe(sub);
        assert_eq!(directory.subscription_count(), 0);
        directory.create_server(&host).await.unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn unreachable_directory_fails_every_call() {
        let (_clock, directory) = setup();
        directory.set_reachable(false);
        let host = PeerId::from("game_aa222");
        assert!(matches!(
            directory.latest_server().await,
            Err(DirectoryError::Unavailable(_))
        ));
        assert!(directory.create_server(&host).await.is_err());
        let (_seen, sink) = collector::<RecordChange>();
        assert!(directory.watch_server(&host, sink).is_err());
    }

    #[tokio::test]
    async fn posting_to_missing_host_is_delivery_failure() {
        let (_clock, directory) = setup();
        let err = directory
            .post_envelope(&PeerId::from("game_zz999"), offer("client_cc444", "game_zz999"))
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Delivery(_)));
    }
}
