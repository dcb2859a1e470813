use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fc_core::config::RealtimeConfig;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{HubError, Result};
use crate::event_bus::{EventBus, InternalEvent};
use crate::protocol::{ClientMessage, ServerMessage, SessionAction, TerminalAction};

/// Verifies a presented token against whatever external identity provider
/// issued it. Token *issuance* is out of scope for this crate; callers
/// inject an implementation (backed by the real auth service) at
/// construction. Comparisons must be constant-time to avoid leaking token
/// prefixes through response timing.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, user_id: &str, token: &str) -> bool;
}

/// A verifier backed by a static per-user token map, useful for tests and
/// for deployments that provision tokens out of band.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, user_id: &str, token: &str) -> bool {
        match self.tokens.get(user_id) {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(token.as_bytes())),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Outbound {
    queue: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    cap: usize,
    dropped: AtomicU64,
}

impl Outbound {
    fn new(cap: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), notify: Notify::new(), cap, dropped: AtomicU64::new(0) }
    }

    /// Never blocks. If the queue is at capacity the oldest message is
    /// dropped to make room, and the drop counter is incremented.
    async fn push(&self, msg: ServerMessage) {
        let mut q = self.queue.lock().await;
        if q.len() >= self.cap {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(msg);
        self.notify.notify_one();
    }

    async fn drain(&self) -> Vec<ServerMessage> {
        let mut q = self.queue.lock().await;
        q.drain(..).collect()
    }
}

pub struct Connection {
    pub client_id: Uuid,
    pub user_id: Mutex<Option<String>>,
    subscribed_sessions: Mutex<HashSet<Uuid>>,
    subscribed_runners: Mutex<HashSet<Uuid>>,
    pub connected_at: DateTime<Utc>,
    pub authenticated_at: Mutex<Option<DateTime<Utc>>>,
    pub last_ping_at: Mutex<DateTime<Utc>>,
    outbound: Outbound,
}

impl Connection {
    fn new(queue_cap: usize) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            client_id: Uuid::new_v4(),
            user_id: Mutex::new(None),
            subscribed_sessions: Mutex::new(HashSet::new()),
            subscribed_runners: Mutex::new(HashSet::new()),
            connected_at: now,
            authenticated_at: Mutex::new(None),
            last_ping_at: Mutex::new(now),
            outbound: Outbound::new(queue_cap),
        })
    }

    pub async fn is_authenticated(&self) -> bool {
        self.authenticated_at.lock().await.is_some()
    }

    pub async fn drain_outbound(&self) -> Vec<ServerMessage> {
        self.outbound.drain().await
    }

    pub fn dropped_count(&self) -> u64 {
        self.outbound.dropped.load(Ordering::Relaxed)
    }
}

const DEFAULT_QUEUE_CAP: usize = 256;

// ---------------------------------------------------------------------------
// RealtimeHub
// ---------------------------------------------------------------------------

pub struct RealtimeHub {
    config: RealtimeConfig,
    verifier: Arc<dyn TokenVerifier>,
    connections: DashMap<Uuid, Arc<Connection>>,
    user_connections: DashMap<String, HashSet<Uuid>>,
    events: Arc<EventBus>,
}

impl RealtimeHub {
    pub fn new(config: RealtimeConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self::with_event_bus(config, verifier, Arc::new(EventBus::new()))
    }

    /// Like [`new`](Self::new), but shares an [`EventBus`] with the caller
    /// instead of creating a private one, so published `InternalEvent`s
    /// (e.g. `TerminalInput`) reach subscribers outside this hub.
    pub fn with_event_bus(config: RealtimeConfig, verifier: Arc<dyn TokenVerifier>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            verifier,
            connections: DashMap::new(),
            user_connections: DashMap::new(),
            events,
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Register a new connection and return its id. The caller is
    /// responsible for sending the resulting `connected` event.
    pub fn connect(&self) -> Arc<Connection> {
        let conn = Connection::new(DEFAULT_QUEUE_CAP);
        self.connections.insert(conn.client_id, conn.clone());
        conn
    }

    pub fn disconnect(&self, client_id: Uuid) {
        if let Some((_, conn)) = self.connections.remove(&client_id) {
            let user_id = conn.user_id.try_lock().ok().and_then(|g| g.clone());
            if let Some(user_id) = user_id {
                if let Some(mut set) = self.user_connections.get_mut(&user_id) {
                    set.remove(&client_id);
                }
            }
        }
    }

    fn get(&self, client_id: Uuid) -> Result<Arc<Connection>> {
        self.connections.get(&client_id).map(|c| c.clone()).ok_or(HubError::ConnectionNotFound(client_id))
    }

    pub async fn authenticate(&self, client_id: Uuid, token: &str, user_id: &str) -> Result<()> {
        let conn = self.get(client_id)?;

        if token.is_empty() || user_id.is_empty() {
            return Err(HubError::AuthFailed);
        }
        if !self.verifier.verify(user_id, token) {
            return Err(HubError::AuthFailed);
        }

        let current = self.user_connections.entry(user_id.to_string()).or_default();
        if current.len() as u32 >= self.config.max_connections_per_user {
            drop(current);
            return Err(HubError::ConnectionLimit);
        }
        drop(current);

        *conn.user_id.lock().await = Some(user_id.to_string());
        *conn.authenticated_at.lock().await = Some(Utc::now());
        self.user_connections.entry(user_id.to_string()).or_default().insert(client_id);

        self.send(client_id, ServerMessage::Event { event: "authenticated".into(), payload: None }).await?;
        Ok(())
    }

    pub async fn subscribe(&self, client_id: Uuid, session_id: Option<Uuid>, runner_id: Option<Uuid>) -> Result<()> {
        let conn = self.get(client_id)?;
        if !conn.is_authenticated().await {
            return Err(HubError::NotAuthenticated);
        }
        if let Some(sid) = session_id {
            conn.subscribed_sessions.lock().await.insert(sid);
        }
        if let Some(rid) = runner_id {
            conn.subscribed_runners.lock().await.insert(rid);
        }
        self.send(client_id, ServerMessage::Event { event: "subscribed".into(), payload: None }).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, client_id: Uuid, session_id: Option<Uuid>, runner_id: Option<Uuid>) -> Result<()> {
        let conn = self.get(client_id)?;
        if let Some(sid) = session_id {
            conn.subscribed_sessions.lock().await.remove(&sid);
        }
        if let Some(rid) = runner_id {
            conn.subscribed_runners.lock().await.remove(&rid);
        }
        self.send(client_id, ServerMessage::Event { event: "unsubscribed".into(), payload: None }).await?;
        Ok(())
    }

    /// Validates the caller is authenticated and subscribed, then publishes
    /// the input onto the shared event bus. The Session Coordinator (or
    /// whatever else subscribed) is responsible for routing it to the
    /// runner actually running `session_id`.
    pub async fn handle_terminal_input(&self, client_id: Uuid, session_id: Uuid, data: String) -> Result<()> {
        let conn = self.get(client_id)?;
        if !conn.is_authenticated().await {
            return Err(HubError::NotAuthenticated);
        }
        if !conn.subscribed_sessions.lock().await.contains(&session_id) {
            return Err(HubError::NotSubscribed);
        }
        self.events.publish(InternalEvent::TerminalInput { client_id, session_id, data });
        Ok(())
    }

    pub async fn handle_ping(&self, client_id: Uuid) -> Result<()> {
        let conn = self.get(client_id)?;
        *conn.last_ping_at.lock().await = Utc::now();
        self.send(client_id, ServerMessage::Pong).await
    }

    pub async fn dispatch(&self, client_id: Uuid, msg: ClientMessage) -> Result<()> {
        match msg {
            ClientMessage::Authenticate { token, user_id } => self.authenticate(client_id, &token, &user_id).await,
            ClientMessage::Subscribe { session_id, runner_id } => self.subscribe(client_id, session_id, runner_id).await,
            ClientMessage::Unsubscribe { session_id, runner_id } => self.unsubscribe(client_id, session_id, runner_id).await,
            ClientMessage::Terminal { session_id, action, data } => {
                if action != TerminalAction::Input {
                    return Err(HubError::InvalidMessage);
                }
                self.handle_terminal_input(client_id, session_id, data).await
            }
            ClientMessage::Ping => self.handle_ping(client_id).await,
        }
    }

    async fn send(&self, client_id: Uuid, msg: ServerMessage) -> Result<()> {
        let conn = self.get(client_id)?;
        conn.outbound.push(msg).await;
        Ok(())
    }

    // ----- broadcast primitives (spec §4.4) -----

    pub async fn broadcast_session_event(&self, session_id: Uuid, action: SessionAction, payload: serde_json::Value) {
        let msg = ServerMessage::Session { session_id, action, payload };
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.subscribed_sessions.lock().await.contains(&session_id) {
                conn.outbound.push(msg.clone()).await;
            }
        }
    }

    pub async fn broadcast_terminal_output(&self, session_id: Uuid, data: String) {
        let msg = ServerMessage::Terminal { session_id, action: TerminalAction::Output, data };
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.subscribed_sessions.lock().await.contains(&session_id) {
                conn.outbound.push(msg.clone()).await;
            }
        }
    }

    /// Broadcast to every authenticated client, regardless of subscription.
    pub async fn broadcast_event(&self, event: &str, payload: Option<serde_json::Value>) {
        let msg = ServerMessage::Event { event: event.to_string(), payload };
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.is_authenticated().await {
                conn.outbound.push(msg.clone()).await;
            }
        }
    }

    pub async fn send_to_user(&self, user_id: &str, msg: ServerMessage) {
        if let Some(ids) = self.user_connections.get(user_id) {
            for id in ids.iter() {
                if let Some(conn) = self.connections.get(id) {
                    conn.outbound.push(msg.clone()).await;
                }
            }
        }
    }

    /// Liveness sweep: close connections whose last ping predates
    /// `connection_timeout_ms`. Returns the ids closed.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let timeout = chrono::Duration::milliseconds(self.config.connection_timeout_ms as i64);
        let mut stale = Vec::new();
        for entry in self.connections.iter() {
            let last_ping = *entry.value().last_ping_at.lock().await;
            if now - last_ping > timeout {
                stale.push(*entry.key());
            }
        }
        for id in &stale {
            self.disconnect(*id);
        }
        stale
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> Arc<dyn TokenVerifier> {
        let mut tokens = HashMap::new();
        tokens.insert("u1".to_string(), "secret".to_string());
        Arc::new(StaticTokenVerifier::new(tokens))
    }

    #[tokio::test]
    async fn subscribe_before_auth_rejected() {
        let hub = RealtimeHub::new(RealtimeConfig::default(), verifier());
        let conn = hub.connect();
        let err = hub.subscribe(conn.client_id, Some(Uuid::new_v4()), None).await.unwrap_err();
        assert!(matches!(err, HubError::NotAuthenticated));
    }

    #[tokio::test]
    async fn auth_then_subscribe_then_unsubscribe_round_trips() {
        let hub = RealtimeHub::new(RealtimeConfig::default(), verifier());
        let conn = hub.connect();
        hub.authenticate(conn.client_id, "secret", "u1").await.unwrap();

        let sid = Uuid::new_v4();
        hub.subscribe(conn.client_id, Some(sid), None).await.unwrap();
        hub.broadcast_session_event(sid, SessionAction::Output, serde_json::json!({"chunk": "hi"})).await;

        let drained = conn.drain_outbound().await;
        assert!(drained.iter().any(|m| matches!(m, ServerMessage::Session { .. })));

        hub.unsubscribe(conn.client_id, Some(sid), None).await.unwrap();
        hub.broadcast_session_event(sid, SessionAction::Output, serde_json::json!({"chunk": "bye"})).await;
        let drained2 = conn.drain_outbound().await;
        assert!(!drained2.iter().any(|m| matches!(m, ServerMessage::Session { .. })));
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let hub = RealtimeHub::new(RealtimeConfig::default(), verifier());
        let conn = hub.connect();
        let err = hub.authenticate(conn.client_id, "wrong", "u1").await.unwrap_err();
        assert!(matches!(err, HubError::AuthFailed));
    }

    #[tokio::test]
    async fn connection_limit_enforced() {
        let mut cfg = RealtimeConfig::default();
        cfg.max_connections_per_user = 1;
        let hub = RealtimeHub::new(cfg, verifier());

        let c1 = hub.connect();
        hub.authenticate(c1.client_id, "secret", "u1").await.unwrap();

        let c2 = hub.connect();
        let err = hub.authenticate(c2.client_id, "secret", "u1").await.unwrap_err();
        assert!(matches!(err, HubError::ConnectionLimit));
    }

    #[tokio::test]
    async fn terminal_input_requires_subscription() {
        let hub = RealtimeHub::new(RealtimeConfig::default(), verifier());
        let conn = hub.connect();
        hub.authenticate(conn.client_id, "secret", "u1").await.unwrap();

        let sid = Uuid::new_v4();
        let err = hub.handle_terminal_input(conn.client_id, sid, "ls".into()).await.unwrap_err();
        assert!(matches!(err, HubError::NotSubscribed));

        hub.subscribe(conn.client_id, Some(sid), None).await.unwrap();
        assert!(hub.handle_terminal_input(conn.client_id, sid, "ls".into()).await.is_ok());
    }

    #[tokio::test]
    async fn terminal_input_reaches_event_bus_subscribers() {
        let hub = RealtimeHub::new(RealtimeConfig::default(), verifier());
        let rx = hub.event_bus().subscribe();
        let conn = hub.connect();
        hub.authenticate(conn.client_id, "secret", "u1").await.unwrap();

        let sid = Uuid::new_v4();
        hub.subscribe(conn.client_id, Some(sid), None).await.unwrap();
        hub.dispatch(conn.client_id, ClientMessage::Terminal { session_id: sid, action: TerminalAction::Input, data: "ls -la".into() }).await.unwrap();

        let event = rx.try_recv().expect("event bus should have received the terminal input");
        match event {
            InternalEvent::TerminalInput { session_id, data, .. } => {
                assert_eq!(session_id, sid);
                assert_eq!(data, "ls -la");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_oldest() {
        let hub = RealtimeHub::new(RealtimeConfig::default(), verifier());
        let conn = hub.connect();
        hub.authenticate(conn.client_id, "secret", "u1").await.unwrap();

        for i in 0..(DEFAULT_QUEUE_CAP + 10) {
            hub.broadcast_event("tick", Some(serde_json::json!({"i": i}))).await;
        }
        assert!(conn.dropped_count() >= 10);
        let drained = conn.drain_outbound().await;
        assert_eq!(drained.len(), DEFAULT_QUEUE_CAP);
    }
}
