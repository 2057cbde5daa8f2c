//! The reconnecting subscription client
//!
//! One [`ConnectionManager`] drives one logical link. All mutable state sits
//! in a single `ManagerState` behind a `parking_lot::Mutex` that is never
//! held across an `.await` nor while listeners run. Every spawned task
//! (attempt, reconnect delay, reader, heartbeat, health monitor, display
//! timer) carries the generation it was started for; tearing a link down
//! bumps the generation, so a task that wakes up late finds itself stale
//! and does nothing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use super::health::{HealthOutcome, HealthProbe, HealthReport};
use super::status::{ConnectionState, ConnectionStatus, DebounceDecision, StatusDebouncer};
use super::transport::{redact, Connector, Link, LinkEvent, NORMAL_CLOSE};
use crate::backoff::ReconnectPolicy;
use crate::config::ConnectionConfig;
use crate::error::{ConnectionFailure, Error, Result};
use crate::observer::{ListenerHandle, ListenerSet};
use crate::protocol::{Inbound, Push, Topic, WireProtocol};

/// Unanswered heartbeats after which the link is reported unhealthy
pub const MISSED_HEARTBEAT_LIMIT: u32 = 3;

/// Timing knobs of a manager
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub policy: ReconnectPolicy,
    /// Deadline for a health probe, a socket open and the handshake
    pub request_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub health_check_interval: Option<Duration>,
    pub status_debounce: Duration,
    pub connecting_display_delay: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            policy: config.reconnect_policy(),
            request_timeout: config.request_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            health_check_interval: config.health_check_interval(),
            status_debounce: config.status_debounce(),
            connecting_display_delay: config.connecting_display_delay(),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Per-subscription bookkeeping, reset on every successful connection
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionHealth {
    pub topic: Topic,
    pub is_active: bool,
    pub error_count: u32,
    pub missed_heartbeats: u32,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl SubscriptionHealth {
    fn new(topic: Topic, is_active: bool) -> Self {
        Self {
            topic,
            is_active,
            error_count: 0,
            missed_heartbeats: 0,
            last_message_at: None,
        }
    }
}

type PushCallback = Arc<dyn Fn(&Push) + Send + Sync>;
type SharedAttempt = Shared<BoxFuture<'static, Result<()>>>;

struct SubscriptionRecord {
    callback: PushCallback,
    health: SubscriptionHealth,
}

#[derive(Default)]
struct Tasks {
    attempt: Option<AbortHandle>,
    reconnect: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    display: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_link(&mut self) {
        for task in [self.reader.take(), self.heartbeat.take(), self.health.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_link();
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        for task in [self.reconnect.take(), self.display.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

struct ManagerState {
    phase: ConnectionState,
    attempts: u32,
    generation: u64,
    link: Option<mpsc::UnboundedSender<String>>,
    /// Topics the server currently has a subscribe frame for
    subscribed: BTreeSet<Topic>,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionRecord>,
    next_subscription: u64,
    /// Encoded frames waiting for a connection, oldest first
    pending: VecDeque<String>,
    last_event_at: Option<DateTime<Utc>>,
    last_health: Option<HealthReport>,
    last_error: Option<String>,
    awaiting_heartbeat: bool,
    missed_heartbeats: u32,
    display: StatusDebouncer,
    in_flight: Option<SharedAttempt>,
    tasks: Tasks,
}

impl ManagerState {
    fn topics(&self) -> BTreeSet<Topic> {
        self.subscriptions.values().map(|r| r.health.topic).collect()
    }

    fn is_healthy(&self) -> bool {
        self.phase == ConnectionState::Connected
            && self
                .last_health
                .as_ref()
                .is_some_and(|report| report.outcome.is_healthy())
            && self.missed_heartbeats < MISSED_HEARTBEAT_LIMIT
    }

    fn snapshot(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.phase,
            display_state: self.display.visible(),
            is_healthy: self.is_healthy(),
            subscription_count: self.subscriptions.len(),
            reconnect_attempts: self.attempts,
            missed_heartbeats: self.missed_heartbeats,
            pending_messages: self.pending.len(),
            last_event_at: self.last_event_at,
            last_health_check: self.last_health.as_ref().map(|r| r.checked_at),
            error: self.last_error.clone(),
        }
    }

    /// Drop the current link and fence every task that belonged to it.
    fn teardown_link(&mut self) {
        self.generation += 1;
        self.tasks.abort_link();
        self.link = None;
        self.subscribed.clear();
        self.awaiting_heartbeat = false;
        self.missed_heartbeats = 0;
        for record in self.subscriptions.values_mut() {
            record.health.is_active = false;
        }
    }
}

struct Inner {
    url: String,
    settings: ManagerSettings,
    connector: Arc<dyn Connector>,
    protocol: Arc<dyn WireProtocol>,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<ManagerState>,
    listeners: ListenerSet<ConnectionStatus>,
}

/// Reconnecting, health-monitored subscription client
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        url: impl Into<String>,
        settings: ManagerSettings,
        connector: Arc<dyn Connector>,
        protocol: Arc<dyn WireProtocol>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let display =
            StatusDebouncer::new(settings.status_debounce, settings.connecting_display_delay);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                settings,
                connector,
                protocol,
                probe,
                state: Mutex::new(ManagerState {
                    phase: ConnectionState::Disconnected,
                    attempts: 0,
                    generation: 0,
                    link: None,
                    subscribed: BTreeSet::new(),
                    subscriptions: BTreeMap::new(),
                    next_subscription: 0,
                    pending: VecDeque::new(),
                    last_event_at: None,
                    last_health: None,
                    last_error: None,
                    awaiting_heartbeat: false,
                    missed_heartbeats: 0,
                    display,
                    in_flight: None,
                    tasks: Tasks::default(),
                }),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Connect, or join the attempt already in flight.
    ///
    /// Resolves once the health probe and the subscription handshake have
    /// both succeeded. Calling it while connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let attempt = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.phase == ConnectionState::Connected {
                return Ok(());
            }
            match &state.in_flight {
                Some(attempt) => attempt.clone(),
                None => {
                    if let Some(timer) = state.tasks.reconnect.take() {
                        timer.abort();
                    }
                    self.inner.begin_attempt(state)
                }
            }
        };
        self.inner.publish();
        attempt.await
    }

    /// Close the link and cancel every timer. Subscriptions and queued
    /// messages are kept for the next `connect()`.
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock();
            state.tasks.abort_all();
            state.teardown_link();
            state.in_flight = None;
            state.attempts = 0;
            state.phase = ConnectionState::Disconnected;
            state.display.force(ConnectionState::Disconnected);
        }
        tracing::info!(url = %redact(&self.inner.url), "Disconnected");
        self.inner.publish();
    }

    /// Manual recovery: reset the attempt counter and reconnect now.
    pub async fn retry(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.tasks.abort_all();
            state.teardown_link();
            state.in_flight = None;
            state.attempts = 0;
            state.last_error = None;
            state.phase = ConnectionState::Disconnected;
        }
        tracing::info!(url = %redact(&self.inner.url), "Manual retry");
        self.connect().await
    }

    /// Send now if connected (`true`), otherwise queue until the next
    /// successful connection (`false`).
    pub fn send(&self, message: &serde_json::Value) -> bool {
        let mut frame = self.inner.protocol.encode(message);
        let queued = {
            let mut state = self.inner.state.lock();
            if state.phase == ConnectionState::Connected {
                if let Some(link) = &state.link {
                    match link.send(frame) {
                        Ok(()) => return true,
                        Err(returned) => frame = returned.0,
                    }
                }
            }
            state.pending.push_back(frame);
            state.pending.len()
        };
        tracing::debug!(queued, "Queued message until connected");
        self.inner.publish();
        false
    }

    /// Register a push callback for `topic`.
    ///
    /// The first subscriber of a topic sends the protocol's subscribe frame;
    /// the last one to leave sends the unsubscribe frame. Removing the last
    /// subscription of any topic disconnects.
    pub fn subscribe(
        &self,
        topic: Topic,
        callback: impl Fn(&Push) + Send + Sync + 'static,
    ) -> (SubscriptionId, ListenerHandle) {
        let id = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let id = SubscriptionId(state.next_subscription);
            state.next_subscription += 1;

            let connected = state.phase == ConnectionState::Connected;
            state.subscriptions.insert(
                id,
                SubscriptionRecord {
                    callback: Arc::new(callback),
                    health: SubscriptionHealth::new(topic, connected),
                },
            );
            if connected && state.subscribed.insert(topic) {
                if let Some(link) = &state.link {
                    let _ = link.send(self.inner.protocol.subscribe_frame(topic));
                }
            }
            id
        };
        tracing::debug!(topic = topic.as_str(), "Subscribed");
        self.inner.publish();

        let weak = Arc::downgrade(&self.inner);
        let handle = ListenerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unsubscribe(id);
            }
        });
        (id, handle)
    }

    pub fn subscription_health(&self, id: SubscriptionId) -> Option<SubscriptionHealth> {
        self.inner
            .state
            .lock()
            .subscriptions
            .get(&id)
            .map(|record| record.health.clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Probe the backend now and apply the outcome to the state machine.
    pub async fn check_health(&self) -> bool {
        let generation = self.inner.state.lock().generation;
        let outcome =
            probe_with_timeout(self.inner.probe.as_ref(), self.inner.settings.request_timeout)
                .await;
        self.inner.apply_health(generation, outcome)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().snapshot()
    }

    /// Called synchronously with a fresh snapshot after every transition
    pub fn on_status_change(
        &self,
        listener: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.add(listener)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.tasks.abort_all();
        state.teardown_link();
        state.in_flight = None;
    }
}

impl Inner {
    fn publish(&self) {
        let status = self.state.lock().snapshot();
        self.listeners.notify(&status);
    }

    fn set_phase(self: &Arc<Self>, state: &mut ManagerState, phase: ConnectionState) {
        state.phase = phase;
        let shown = if phase == ConnectionState::Connecting && state.attempts > 0 {
            ConnectionState::Retrying
        } else {
            phase
        };
        match state.display.observe(shown, Instant::now()) {
            DebounceDecision::Defer(delay) => self.arm_display(state, delay),
            DebounceDecision::Show(_) | DebounceDecision::Collapse => {
                if let Some(timer) = state.tasks.display.take() {
                    timer.abort();
                }
            }
            DebounceDecision::Unchanged => {}
        }
    }

    fn arm_display(self: &Arc<Self>, state: &mut ManagerState, delay: Duration) {
        if let Some(timer) = state.tasks.display.take() {
            timer.abort();
        }
        let weak = Arc::downgrade(self);
        state.tasks.display = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let shown = inner.state.lock().display.fire(Instant::now());
            if shown.is_some() {
                inner.publish();
            }
        }));
    }

    fn begin_attempt(self: &Arc<Self>, state: &mut ManagerState) -> SharedAttempt {
        let generation = state.generation;
        self.set_phase(state, ConnectionState::Connecting);
        tracing::info!(
            url = %redact(&self.url),
            attempt = state.attempts,
            "Connecting"
        );

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.run_attempt(generation).await });
        state.tasks.attempt = Some(task.abort_handle());

        let attempt = async move {
            match task.await {
                Ok(result) => result,
                Err(_) => Err(Error::cancelled()),
            }
        }
        .boxed()
        .shared();
        state.in_flight = Some(attempt.clone());
        attempt
    }

    async fn run_attempt(self: Arc<Self>, generation: u64) -> Result<()> {
        match self.establish(generation).await {
            Ok((link, early, handshaken)) => self.commit(generation, link, early, handshaken),
            Err(err) => {
                self.fail_attempt(generation, &err);
                Err(err)
            }
        }
    }

    async fn establish(&self, generation: u64) -> Result<(Link, Vec<LinkEvent>, Vec<Topic>)> {
        let timeout = self.settings.request_timeout;

        let outcome = probe_with_timeout(self.probe.as_ref(), timeout).await;
        {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.last_health = Some(HealthReport {
                    outcome: outcome.clone(),
                    checked_at: Utc::now(),
                });
            }
        }
        match outcome {
            HealthOutcome::Healthy => {}
            HealthOutcome::Transient(message) => {
                return Err(Error::protocol(format!("health probe failed: {}", message)))
            }
            HealthOutcome::Unreachable(message) => return Err(Error::unreachable(message)),
            HealthOutcome::Rejected(message) => return Err(Error::Authentication(message)),
        }

        let mut link = tokio::time::timeout(timeout, self.connector.connect(&self.url))
            .await
            .map_err(|_| Error::Timeout(timeout))??;

        let topics: Vec<Topic> = self.state.lock().topics().into_iter().collect();
        let early = handshake(self.protocol.as_ref(), &mut link, &topics, timeout).await?;
        Ok((link, early, topics))
    }

    fn commit(
        self: &Arc<Self>,
        generation: u64,
        link: Link,
        early: Vec<LinkEvent>,
        handshaken: Vec<Topic>,
    ) -> Result<()> {
        let Link { outbound, inbound } = link;
        let flushed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != generation {
                return Err(Error::cancelled());
            }
            state.in_flight = None;
            state.tasks.attempt = None;
            state.attempts = 0;
            state.last_error = None;
            state.awaiting_heartbeat = false;
            state.missed_heartbeats = 0;

            // Subscriptions may have changed while the handshake ran
            let wanted = state.topics();
            let handshaken: BTreeSet<Topic> = handshaken.into_iter().collect();
            for topic in wanted.difference(&handshaken) {
                let _ = outbound.send(self.protocol.subscribe_frame(*topic));
            }
            for topic in handshaken.difference(&wanted) {
                let _ = outbound.send(self.protocol.unsubscribe_frame(*topic));
            }
            state.subscribed = wanted;
            for record in state.subscriptions.values_mut() {
                record.health = SubscriptionHealth::new(record.health.topic, true);
            }

            let flushed = state.pending.len();
            for frame in state.pending.drain(..) {
                let _ = outbound.send(frame);
            }
            state.link = Some(outbound);

            self.set_phase(state, ConnectionState::Connected);
            self.start_link_tasks(state, generation, inbound, early);
            flushed
        };

        tracing::info!(url = %redact(&self.url), flushed, "Connected");
        self.publish();
        Ok(())
    }

    fn fail_attempt(self: &Arc<Self>, generation: u64, err: &Error) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != generation {
                return;
            }
            state.in_flight = None;
            state.tasks.attempt = None;
            state.last_error = Some(err.to_string());
            self.set_phase(state, ConnectionState::Error);

            if err.is_terminal() {
                tracing::warn!(error = %err, "Connection rejected; not retrying automatically");
            } else {
                tracing::warn!(error = %err, attempt = state.attempts, "Connection attempt failed");
                self.schedule_reconnect(state);
            }
        }
        self.publish();
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ManagerState) {
        let policy = &self.settings.policy;
        if policy.exhausted(state.attempts) {
            let message = match &state.last_error {
                Some(last) => format!(
                    "reconnection gave up after {} attempts: {}",
                    state.attempts, last
                ),
                None => format!("reconnection gave up after {} attempts", state.attempts),
            };
            tracing::error!(attempts = state.attempts, "Giving up on reconnection");
            state.last_error = Some(message);
            self.set_phase(state, ConnectionState::Error);
            return;
        }

        let delay = policy.delay_for(state.attempts);
        let generation = state.generation;
        tracing::debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = state.attempts + 1,
            "Scheduling reconnect"
        );

        if let Some(timer) = state.tasks.reconnect.take() {
            timer.abort();
        }
        let weak = Arc::downgrade(self);
        state.tasks.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut guard = inner.state.lock();
                let state = &mut *guard;
                if state.generation != generation
                    || state.in_flight.is_some()
                    || state.phase == ConnectionState::Connected
                {
                    return;
                }
                state.attempts += 1;
                // Nobody awaits a scheduled attempt; its outcome lands in the state
                drop(inner.begin_attempt(state));
            }
            inner.publish();
        }));
    }

    fn start_link_tasks(
        self: &Arc<Self>,
        state: &mut ManagerState,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
        early: Vec<LinkEvent>,
    ) {
        let weak = Arc::downgrade(self);
        state.tasks.reader = Some(tokio::spawn(async move {
            for event in early {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.dispatch(generation, event) {
                    return;
                }
            }
            loop {
                let event = inbound.recv().await.unwrap_or(LinkEvent::Closed {
                    code: None,
                    reason: "link dropped".to_string(),
                });
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.dispatch(generation, event) {
                    return;
                }
            }
        }));

        if let Some(every) = self.settings.heartbeat_interval {
            let weak = Arc::downgrade(self);
            state.tasks.heartbeat = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if !inner.beat(generation) {
                        return;
                    }
                }
            }));
        }

        if let Some(every) = self.settings.health_check_interval {
            let weak = Arc::downgrade(self);
            let timeout = self.settings.request_timeout;
            state.tasks.health = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(probe) = weak.upgrade().map(|inner| Arc::clone(&inner.probe)) else {
                        return;
                    };
                    let outcome = probe_with_timeout(probe.as_ref(), timeout).await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    inner.apply_health(generation, outcome);
                }
            }));
        }
    }

    /// Handle one inbound link event; `false` ends the reader.
    fn dispatch(self: &Arc<Self>, generation: u64, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Message(text) => self.handle_frame(generation, &text),
            LinkEvent::Closed { code, reason } => {
                self.handle_close(generation, code, &reason);
                false
            }
            LinkEvent::Error(message) => {
                self.handle_link_failure(generation, format!("socket error: {}", message));
                false
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, generation: u64, text: &str) -> bool {
        let inbound = match self.protocol.decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable frame");
                return true;
            }
        };

        match inbound {
            Inbound::Push(push) => {
                let topic = push.topic();
                let callbacks: Vec<PushCallback> = {
                    let mut state = self.state.lock();
                    if state.generation != generation {
                        return false;
                    }
                    let now = Utc::now();
                    state.last_event_at = Some(now);
                    state
                        .subscriptions
                        .values_mut()
                        .filter(|r| r.health.topic == topic && r.health.is_active)
                        .map(|r| {
                            r.health.last_message_at = Some(now);
                            Arc::clone(&r.callback)
                        })
                        .collect()
                };
                for callback in callbacks {
                    callback(&push);
                }
            }
            Inbound::Heartbeat => {
                let recovered = {
                    let mut state = self.state.lock();
                    if state.generation != generation {
                        return false;
                    }
                    state.awaiting_heartbeat = false;
                    let recovered = state.missed_heartbeats > 0;
                    state.missed_heartbeats = 0;
                    for record in state.subscriptions.values_mut() {
                        record.health.missed_heartbeats = 0;
                    }
                    recovered
                };
                if recovered {
                    self.publish();
                }
            }
            Inbound::Ack(topic) => {
                tracing::debug!(topic = topic.as_str(), "Subscription acknowledged");
            }
            Inbound::ServerError(message) => {
                tracing::warn!(error = %message, "Server reported an error");
                let mut state = self.state.lock();
                if state.generation != generation {
                    return false;
                }
                for record in state.subscriptions.values_mut() {
                    if record.health.is_active {
                        record.health.error_count += 1;
                    }
                }
            }
            Inbound::ChannelError(message) => {
                self.handle_link_failure(generation, message);
                return false;
            }
            Inbound::Ignored => {}
        }
        true
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: Option<u16>, reason: &str) {
        let code = LinkEvent::close_code(code);
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != generation || state.phase != ConnectionState::Connected {
                return;
            }
            state.teardown_link();
            self.set_phase(state, ConnectionState::Disconnected);

            if code == NORMAL_CLOSE {
                tracing::info!(reason, "Link closed normally");
            } else {
                tracing::warn!(code, reason, "Link closed unexpectedly");
                self.schedule_reconnect(state);
            }
        }
        self.publish();
    }

    fn handle_link_failure(self: &Arc<Self>, generation: u64, message: String) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != generation || state.phase != ConnectionState::Connected {
                return;
            }
            tracing::warn!(error = %message, "Link failed");
            state.teardown_link();
            state.last_error = Some(message);
            self.set_phase(state, ConnectionState::Error);
            self.schedule_reconnect(state);
        }
        self.publish();
    }

    /// Send a heartbeat, counting the previous one as missed if unanswered.
    fn beat(&self, generation: u64) -> bool {
        let missed = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            let Some(link) = state.link.clone() else {
                return false;
            };

            let missed = state.awaiting_heartbeat;
            if missed {
                state.missed_heartbeats += 1;
                for record in state.subscriptions.values_mut() {
                    record.health.missed_heartbeats += 1;
                }
                tracing::warn!(missed = state.missed_heartbeats, "Heartbeat unanswered");
            }
            let _ = link.send(self.protocol.heartbeat_frame());
            state.awaiting_heartbeat = true;
            missed
        };
        if missed {
            self.publish();
        }
        true
    }

    fn apply_health(self: &Arc<Self>, generation: u64, outcome: HealthOutcome) -> bool {
        let healthy = outcome.is_healthy();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.generation != generation {
                return healthy;
            }
            state.last_health = Some(HealthReport {
                outcome: outcome.clone(),
                checked_at: Utc::now(),
            });

            if state.phase == ConnectionState::Connected && outcome.is_persistent_failure() {
                let rejected = matches!(outcome, HealthOutcome::Rejected(_));
                let detail = outcome.detail().unwrap_or_default();
                let error = if rejected {
                    format!("authentication rejected: {}", detail)
                } else {
                    format!("backend unreachable: {}", detail)
                };
                tracing::warn!(%error, "Health probe failed; dropping link");
                state.teardown_link();
                state.last_error = Some(error);
                self.set_phase(state, ConnectionState::Error);
                // Rejected credentials will not fix themselves
                if !rejected {
                    self.schedule_reconnect(state);
                }
            } else if let HealthOutcome::Transient(message) = &outcome {
                tracing::warn!(error = %message, "Health probe failed; keeping connection");
            }
        }
        self.publish();
        healthy
    }

    fn unsubscribe(self: &Arc<Self>, id: SubscriptionId) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(record) = state.subscriptions.remove(&id) else {
                return;
            };

            let topic = record.health.topic;
            let topic_in_use = state.subscriptions.values().any(|r| r.health.topic == topic);
            if !topic_in_use && state.subscribed.remove(&topic) {
                if let Some(link) = &state.link {
                    let _ = link.send(self.protocol.unsubscribe_frame(topic));
                }
            }

            // A pending reconnect timer must die too, even while disconnected
            if state.subscriptions.is_empty() {
                state.tasks.abort_all();
                state.teardown_link();
                state.in_flight = None;
                state.attempts = 0;
                state.phase = ConnectionState::Disconnected;
                // The display timer was aborted with the rest
                state.display.force(ConnectionState::Disconnected);
                tracing::info!("Last subscription removed; link closed");
            }
        }
        self.publish();
    }
}

async fn probe_with_timeout(probe: &dyn HealthProbe, timeout: Duration) -> HealthOutcome {
    match tokio::time::timeout(timeout, probe.probe()).await {
        Ok(outcome) => outcome,
        Err(_) => HealthOutcome::from_error(&Error::Timeout(timeout)),
    }
}

/// Send subscribe frames and, when the protocol wants acknowledgments,
/// wait for one per topic. Pushes that race ahead of the acks are returned
/// so the reader can replay them in order.
async fn handshake(
    protocol: &dyn WireProtocol,
    link: &mut Link,
    topics: &[Topic],
    timeout: Duration,
) -> Result<Vec<LinkEvent>> {
    let closed = || Error::connection(ConnectionFailure::Closed, "link closed during handshake");

    for topic in topics {
        link.outbound
            .send(protocol.subscribe_frame(*topic))
            .map_err(|_| closed())?;
    }
    if !protocol.requires_ack() || topics.is_empty() {
        return Ok(Vec::new());
    }

    let mut waiting: BTreeSet<Topic> = topics.iter().copied().collect();
    let mut early = Vec::new();
    let acked = tokio::time::timeout(timeout, async {
        while !waiting.is_empty() {
            match link.inbound.recv().await.ok_or_else(closed)? {
                LinkEvent::Message(text) => match protocol.decode(&text) {
                    Ok(Inbound::Ack(topic)) => {
                        waiting.remove(&topic);
                    }
                    Ok(Inbound::ChannelError(message)) => return Err(Error::protocol(message)),
                    Ok(Inbound::Push(_)) => early.push(LinkEvent::Message(text)),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Dropping undecodable frame"),
                },
                LinkEvent::Closed { code, reason } => {
                    return Err(Error::connection(
                        ConnectionFailure::Closed,
                        format!(
                            "link closed during handshake ({}): {}",
                            LinkEvent::close_code(code),
                            reason
                        ),
                    ))
                }
                LinkEvent::Error(message) => {
                    return Err(Error::connection(ConnectionFailure::Closed, message))
                }
            }
        }
        Ok(())
    })
    .await;

    match acked {
        Ok(Ok(())) => Ok(early),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}
