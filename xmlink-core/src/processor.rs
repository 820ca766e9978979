//! Command processor: correlation ids, sending, and blocking waits.
//!
//! The processor owns the [`MessageStream`] and is the only writer of
//! command traffic. Commands and unsolicited events share the connection,
//! so every wait also dispatches: whatever arrives while waiting that is not
//! the awaited response (or claimed by a [`Consumer`]) goes to the
//! [`HandlerChain`], in arrival order, before the wait returns.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::SessionConfig;
use crate::error::LinkError;
use crate::handler::{BuildEvents, Consumer, Disposition, HandlerChain, HandlerRef, ResponseHook};
use crate::message::{ATTR_SEQUENCE_ID, Message};
use crate::network::stream::{Inbound, MessageStream};

/// Scope of subscription management commands.
pub const SUBSCRIPTION_SCOPE: &str = "Subscription";

/// Subscription delivering build and run progress events.
pub const BUILD_EVENTS: &str = "build-events";

struct Subscription {
    id: String,
    handler: Option<HandlerRef>,
}

// ── CommandProcessor ─────────────────────────────────────────────

pub struct CommandProcessor<S = TcpStream> {
    stream: MessageStream<S>,
    handlers: HandlerChain,
    /// Last correlation id handed out; the first command gets 1.
    last_id: u64,
    default_scope: Option<String>,
    envelope_open: Vec<u8>,
    envelope_close: Vec<u8>,
    subscriptions: HashMap<String, Subscription>,
}

impl<S> CommandProcessor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: MessageStream<S>, config: &SessionConfig) -> Self {
        Self {
            stream,
            handlers: HandlerChain::new(),
            last_id: 0,
            default_scope: config.default_scope.clone(),
            envelope_open: config.envelope_open(),
            envelope_close: config.envelope_close(),
            subscriptions: HashMap::new(),
        }
    }

    /// Wrap a connected socket.
    pub fn from_io(io: S, config: &SessionConfig) -> Result<Self, LinkError> {
        Ok(Self::new(MessageStream::new(io, config)?, config))
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn handlers(&self) -> &HandlerChain {
        &self.handlers
    }

    pub fn add_handler(&self, handler: HandlerRef) -> bool {
        self.handlers.add(handler)
    }

    pub fn remove_handler(&self, handler: &HandlerRef) -> bool {
        self.handlers.remove(handler)
    }

    pub fn stream(&self) -> &MessageStream<S> {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut MessageStream<S> {
        &mut self.stream
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    // ── Command construction ─────────────────────────────────────

    /// Next correlation id. Never reused for the life of the connection.
    pub fn allocate_id(&mut self) -> String {
        self.last_id += 1;
        self.last_id.to_string()
    }

    /// New command in the configured default scope.
    pub fn command(&mut self, name: &str) -> Command {
        let id = self.allocate_id();
        Command::new(id, name, self.default_scope.as_deref())
    }

    /// New command addressed to `scope`.
    pub fn command_in(&mut self, name: &str, scope: &str) -> Command {
        let id = self.allocate_id();
        Command::new(id, name, Some(scope))
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Open the conversation envelope. Sent once, right after connecting.
    pub async fn begin(&mut self) -> Result<(), LinkError> {
        let open = self.envelope_open.clone();
        self.stream.send_raw(&open).await
    }

    /// Fire and forget.
    pub async fn send(&mut self, cmd: Command) -> Result<(), LinkError> {
        debug!("send {cmd}");
        self.stream.send(cmd.message()).await
    }

    /// Send `cmd` and wait for the response carrying its id.
    ///
    /// A response reporting failure is logged and still returned. Fails
    /// with [`LinkError::ConnectionLost`] if the peer goes away first.
    pub async fn execute(&mut self, cmd: Command) -> Result<Message, LinkError> {
        let id = cmd.id().to_owned();
        let name = cmd.name().to_owned();
        debug!("execute {cmd}");
        self.stream.send(cmd.message()).await?;

        let resp = self
            .wait_for(|msg| msg.attr(ATTR_SEQUENCE_ID) == Some(id.as_str()), None)
            .await?
            .ok_or_else(|| LinkError::ConnectionLost(format!("response to {name} ({id})")))?;

        if resp.is_success() {
            debug!("  resp {resp}");
        } else {
            error!("execute {name} ({id}) failed");
            error!("  resp {resp}");
        }
        Ok(resp)
    }

    /// Wait for the first message satisfying `matches`, dispatching
    /// everything before it.
    ///
    /// `timeout` is measured from the start of the wait and checked once
    /// per received step; `None` or zero waits indefinitely. Returns
    /// `Ok(None)` when the timeout expires.
    pub async fn wait_for<P>(
        &mut self,
        mut matches: P,
        timeout: Option<Duration>,
    ) -> Result<Option<Message>, LinkError>
    where
        P: FnMut(&Message) -> bool,
    {
        let deadline = timeout.filter(|t| !t.is_zero());
        let started = Instant::now();

        loop {
            match self.stream.recv().await? {
                None => {
                    warn!("peer unexpectedly disconnected");
                    return Err(LinkError::ConnectionLost("matching message".into()));
                }
                Some(Inbound::Message(msg)) => {
                    if matches(&msg) {
                        return Ok(Some(msg));
                    }
                    self.handlers.dispatch(&msg);
                }
                Some(Inbound::Idle) => {}
            }

            if let Some(limit) = deadline {
                if started.elapsed() > limit {
                    return Ok(None);
                }
            }
        }
    }

    /// Send `cmd`, then feed inbound traffic to `consumer` until it reports
    /// [`Disposition::Done`].
    pub async fn submit(&mut self, cmd: Command, consumer: &mut dyn Consumer) -> Result<(), LinkError> {
        debug!("submit {cmd}");
        self.stream.send(cmd.message()).await?;
        self.wait_for_consumer(consumer).await
    }

    /// Feed inbound traffic to `consumer` until it reports
    /// [`Disposition::Done`]. Messages it ignores are dispatched.
    pub async fn wait_for_consumer(&mut self, consumer: &mut dyn Consumer) -> Result<(), LinkError> {
        loop {
            let Some(inbound) = self.stream.recv().await? else {
                warn!("peer unexpectedly disconnected");
                return Err(LinkError::ConnectionLost("consumer completion".into()));
            };
            let msg = inbound.message();
            match consumer.advance(msg) {
                Disposition::Done => return Ok(()),
                Disposition::Consumed => {}
                Disposition::Ignored => {
                    if let Some(msg) = msg {
                        self.handlers.dispatch(msg);
                    }
                }
            }
        }
    }

    /// Send `cmd` without waiting; `on_response` runs when a later wait
    /// observes the response.
    pub async fn post(
        &mut self,
        cmd: Command,
        on_response: impl FnOnce(&Message) + Send + 'static,
    ) -> Result<(), LinkError> {
        debug!("post {cmd}");
        self.handlers
            .add(std::sync::Arc::new(ResponseHook::new(cmd.id(), on_response)));
        self.stream.send(cmd.message()).await
    }

    /// Dispatch everything that arrives until the peer closes.
    pub async fn listen(&mut self) -> Result<(), LinkError> {
        while let Some(inbound) = self.stream.recv().await? {
            if let Inbound::Message(msg) = inbound {
                self.handlers.dispatch(&msg);
            }
        }
        Ok(())
    }

    /// Collect messages until the next idle read, without dispatching.
    pub async fn read_available(&mut self) -> Result<Vec<Message>, LinkError> {
        self.stream.read_available().await
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Start receiving `name` events, optionally registering `handler` for
    /// them first.
    pub async fn subscribe(
        &mut self,
        name: &str,
        handler: Option<HandlerRef>,
    ) -> Result<Message, LinkError> {
        if let Some(handler) = &handler {
            self.handlers.add(handler.clone());
        }
        let cmd = self.command_in(name, SUBSCRIPTION_SCOPE);
        let id = cmd.id().to_owned();
        let resp = self.execute(cmd).await?;
        self.subscriptions
            .insert(name.to_owned(), Subscription { id, handler });
        Ok(resp)
    }

    /// Stop receiving `name` events and drop the handler registered with
    /// them. Returns `None` if there was no such subscription.
    pub async fn unsubscribe(&mut self, name: &str) -> Result<Option<Message>, LinkError> {
        let Some(sub) = self.subscriptions.remove(name) else {
            return Ok(None);
        };

        // The peer identifies the subscription by its original id.
        let cmd = Command::new(sub.id, "unsubscribe", Some(SUBSCRIPTION_SCOPE));
        let resp = self.execute(cmd).await?;

        if let Some(handler) = &sub.handler {
            self.handlers.remove(handler);
        }
        Ok(Some(resp))
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.subscriptions.contains_key(name)
    }

    /// Run a build or simulation command and wait until it has completely
    /// finished.
    ///
    /// Subscribes to build events for the duration of the call when not
    /// already subscribed. The command is created by `make` after that
    /// subscription so ids still go out in increasing order. Completion is
    /// decided by `consumer`, or by a fresh [`BuildEvents`] when `None`.
    pub async fn run_to_completion<F>(
        &mut self,
        make: F,
        consumer: Option<&mut dyn Consumer>,
    ) -> Result<(), LinkError>
    where
        F: FnOnce(&mut Self) -> Command,
    {
        let auto_subscribe = !self.is_subscribed(BUILD_EVENTS);
        if auto_subscribe {
            self.subscribe(BUILD_EVENTS, None).await?;
        }

        let cmd = make(self);
        info!("run {} ({})", cmd.name(), cmd.id());
        let mut fallback = BuildEvents::new();
        let consumer = consumer.unwrap_or(&mut fallback);
        self.submit(cmd, consumer).await?;

        if auto_subscribe {
            self.unsubscribe(BUILD_EVENTS).await?;
        }
        Ok(())
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Orderly shutdown: close the envelope, half-close, drain what the
    /// peer still sends, close every handler, release the socket.
    ///
    /// Returns the drained messages.
    pub async fn close_connection(&mut self) -> Result<Vec<Message>, LinkError> {
        let close = self.envelope_close.clone();
        if let Err(e) = self.stream.send_raw(&close).await {
            warn!("error sending closing envelope: {e}");
        }
        self.stream.tx_close().await;

        let drained = self.stream.read_available().await;
        self.handlers.close_all();
        self.stream.close().await;
        info!("connection closed");
        drained
    }
}
