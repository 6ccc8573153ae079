// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! [`ConnectionManager`] owns the consumer side's single connection and
//! single channel. It creates both lazily, notices when the broker drops the
//! connection and reconnects on a fixed interval until it succeeds or the
//! configured number of failed attempts is used up.
//!
//! All connection and channel creation happens while holding one async lock,
//! so callers arriving during an outage queue behind the attempt in flight
//! and share its result instead of racing to connect.

use crate::{
    config::ComponentConfig,
    errors::AmqpError,
    timer::TimerSlot,
    transport::{AmqpChannel, AmqpConnection, FailureListener, Transport},
};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, Mutex, Notify},
};
use tracing::{debug, error, warn};

/// Name under which the reconnection notification is published.
pub const RE_ESTABLISHED_CONNECTION: &str = "re-established-connection";

const EVENTS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A lost connection was re-established and its channel set up again.
    ReEstablished,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::ReEstablished => f.write_str(RE_ESTABLISHED_CONNECTION),
        }
    }
}

/// Runs on every freshly created channel before anyone else can use it.
#[async_trait]
pub trait ChannelSetup: Send + Sync {
    async fn on_channel_created(&self, channel: &Arc<dyn AmqpChannel>) -> Result<(), AmqpError>;
}

#[derive(Default)]
struct State {
    connection: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
    // bumped per connection so listeners of replaced connections are ignored
    generation: u64,
    failures: u32,
    exhausted: bool,
    lost: bool,
    stopped: bool,
}

struct Inner {
    config: Arc<ComponentConfig>,
    transport: Arc<dyn Transport>,
    setup: Option<Arc<dyn ChannelSetup>>,
    state: Mutex<State>,
    retry_timer: TimerSlot,
    // set before `stop` takes the state lock so a retry wait holding it
    // can give up
    stopping: AtomicBool,
    stop_signal: Notify,
    events: broadcast::Sender<ConnectionEvent>,
    runtime: Handle,
}

/// Shared handle to the consumer-side connection and channel.
///
/// Must be created inside a tokio runtime; reconnect work is spawned on it.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: Arc<ComponentConfig>, transport: Arc<dyn Transport>) -> ConnectionManager {
        Self::build(config, transport, None)
    }

    /// Creates a manager that runs `setup` on every new channel.
    pub fn with_setup(
        config: Arc<ComponentConfig>,
        transport: Arc<dyn Transport>,
        setup: Arc<dyn ChannelSetup>,
    ) -> ConnectionManager {
        Self::build(config, transport, Some(setup))
    }

    fn build(
        config: Arc<ComponentConfig>,
        transport: Arc<dyn Transport>,
        setup: Option<Arc<dyn ChannelSetup>>,
    ) -> ConnectionManager {
        let runtime = Handle::current();
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        ConnectionManager {
            inner: Arc::new(Inner {
                config,
                transport,
                setup,
                state: Mutex::new(State::default()),
                retry_timer: TimerSlot::new(runtime.clone()),
                stopping: AtomicBool::new(false),
                stop_signal: Notify::new(),
                events,
                runtime,
            }),
        }
    }

    /// Returns the live connection, connecting first if there is none.
    ///
    /// Failed attempts are retried every `consumer.interval` milliseconds until
    /// one succeeds or `consumer.retries` attempts have failed.
    pub async fn get_connection(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let mut state = self.inner.state.lock().await;
        self.inner.ensure_connection(&mut state).await
    }

    /// Returns the live channel, creating it (and the connection) if needed.
    pub async fn get_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.acquire_channel().await.map(|(channel, _)| channel)
    }

    /// Like [`Self::get_channel`], also reporting whether the channel was
    /// created by this call and therefore already went through setup.
    pub(crate) async fn acquire_channel(&self) -> Result<(Arc<dyn AmqpChannel>, bool), AmqpError> {
        let mut state = self.inner.state.lock().await;
        self.inner.ensure_channel(&mut state).await
    }

    pub(crate) fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribes to connection lifecycle notifications.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Schedules a check that recreates a missing or dead channel.
    pub(crate) async fn request_recovery(&self) {
        let state = self.inner.state.lock().await;
        if state.stopped {
            return;
        }
        self.inner.schedule_reconnect(&state);
    }

    pub async fn failures(&self) -> u32 {
        self.inner.state.lock().await.failures
    }

    pub fn is_retry_pending(&self) -> bool {
        self.inner.retry_timer.is_armed()
    }

    /// Closes the channel, then the connection.
    ///
    /// Both closes are attempted; the first error is returned. The manager
    /// refuses any further use afterwards. A request waiting out an outage
    /// gives up with [`AmqpError::Stopped`].
    pub async fn stop(&self) -> Result<(), AmqpError> {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.stop_signal.notify_waiters();

        let mut state = self.inner.state.lock().await;
        state.stopped = true;
        self.inner.retry_timer.cancel();

        let mut first_error = None;

        if let Some(channel) = state.channel.take() {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close channel");
                first_error.get_or_insert(err);
            }
        }

        if let Some(connection) = state.connection.take() {
            if let Err(err) = connection.close().await {
                warn!(error = err.to_string(), "failure to close connection");
                first_error.get_or_insert(err);
            }
        }

        debug!("connection manager stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Non-owning handle held by components the manager itself owns.
#[derive(Clone)]
pub(crate) struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    pub(crate) fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl Inner {
    async fn ensure_connection(self: &Arc<Self>, state: &mut State) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        if state.stopped || self.stopping.load(Ordering::SeqCst) {
            return Err(AmqpError::Stopped);
        }

        if let Some(connection) = &state.connection {
            if connection.is_live() {
                return Ok(connection.clone());
            }
            debug!("discarding dead connection");
            state.connection = None;
            state.channel = None;
            state.lost = true;
        }

        loop {
            if state.exhausted {
                return Err(AmqpError::RetriesExhausted(self.config.consumer.retries));
            }

            match self.connect_once(state).await {
                Ok(connection) => return Ok(connection),
                Err(err) if state.exhausted => return Err(err),
                Err(_) => self.wait_for_retry().await?,
            }
        }
    }

    async fn wait_for_retry(&self) -> Result<(), AmqpError> {
        let stop = self.stop_signal.notified();
        if self.stopping.load(Ordering::SeqCst) {
            return Err(AmqpError::Stopped);
        }

        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_interval()) => Ok(()),
            _ = stop => {
                debug!("retry wait abandoned, manager stopping");
                Err(AmqpError::Stopped)
            }
        }
    }

    async fn ensure_channel(self: &Arc<Self>, state: &mut State) -> Result<(Arc<dyn AmqpChannel>, bool), AmqpError> {
        let connection = self.ensure_connection(state).await?;

        if let Some(channel) = &state.channel {
            if channel.is_live() {
                return Ok((channel.clone(), false));
            }
            debug!("discarding closed channel");
            state.channel = None;
        }

        let channel = self.open_channel(state, &connection).await?;
        Ok((channel, true))
    }

    async fn connect_once(self: &Arc<Self>, state: &mut State) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        match self.transport.connect(&self.config.connection).await {
            Ok(connection) => {
                state.generation += 1;
                state.failures = 0;
                self.retry_timer.cancel();

                connection.on_failure(self.failure_listener(state.generation));
                state.connection = Some(connection.clone());
                debug!("connection created");
                Ok(connection)
            }
            Err(err) => {
                state.failures += 1;
                if self.config.may_retry(state.failures) {
                    warn!(
                        error = err.to_string(),
                        attempt = state.failures,
                        "connection attempt failed, retrying in {} ms",
                        self.config.consumer.interval
                    );
                } else {
                    error!(
                        error = err.to_string(),
                        attempts = state.failures,
                        "connection attempts exhausted"
                    );
                    state.exhausted = true;
                }
                Err(err)
            }
        }
    }

    async fn open_channel(
        &self,
        state: &mut State,
        connection: &Arc<dyn AmqpConnection>,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = connection.create_channel().await?;

        if let Some(setup) = &self.setup {
            if let Err(err) = setup.on_channel_created(&channel).await {
                error!(error = err.to_string(), "failure to set up channel");
                if let Err(close_err) = channel.close().await {
                    warn!(error = close_err.to_string(), "failure to close channel");
                }
                return Err(err);
            }
        }

        state.channel = Some(channel.clone());

        if state.lost {
            state.lost = false;
            debug!("{}", ConnectionEvent::ReEstablished);
            // no receivers is fine
            let _ = self.events.send(ConnectionEvent::ReEstablished);
        }

        Ok(channel)
    }

    fn failure_listener(self: &Arc<Self>, generation: u64) -> FailureListener {
        let weak = Arc::downgrade(self);
        let runtime = self.runtime.clone();

        Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                runtime.spawn(inner.on_connection_failure(generation, err));
            }
        })
    }

    async fn on_connection_failure(self: Arc<Self>, generation: u64, err: AmqpError) {
        let mut state = self.state.lock().await;
        if state.stopped || state.generation != generation || state.connection.is_none() {
            return;
        }

        warn!(error = err.to_string(), "connection lost");
        state.connection = None;
        state.channel = None;
        state.lost = true;
        self.schedule_reconnect(&state);
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &State) {
        if state.exhausted || state.stopped {
            return;
        }

        let weak = Arc::downgrade(self);
        self.retry_timer
            .arm(self.config.retry_interval(), async move {
                if let Some(inner) = weak.upgrade() {
                    inner.reconnect().await;
                }
            });
    }

    async fn reconnect(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.stopped {
            return;
        }

        let connection = match state.connection.clone().filter(|c| c.is_live()) {
            Some(connection) => connection,
            None => {
                debug!(attempt = state.failures + 1, "reconnecting");
                match self.connect_once(&mut state).await {
                    Ok(connection) => connection,
                    Err(_) => {
                        self.schedule_reconnect(&state);
                        return;
                    }
                }
            }
        };

        if state.channel.as_ref().is_some_and(|c| c.is_live()) {
            return;
        }

        if let Err(err) = self.open_channel(&mut state, &connection).await {
            warn!(error = err.to_string(), "failure to recreate channel");
            self.schedule_reconnect(&state);
        }
    }
}
