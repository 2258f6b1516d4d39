//! Background I/O worker.
//!
//! A [`Worker`] owns one thread running a single-threaded tokio runtime. The
//! owner drives it through a message-based control channel:
//!
//! ```text
//! ┌──────────────────────────────┐            ┌──────────────────────────────────┐
//! │ Owner thread (sync)          │            │ Worker thread                    │
//! │                              │  control   │  current_thread runtime          │
//! │  Worker::send_command() ─────┼──(bounded)─┼─►  select! {                     │
//! │                              │            │      control_rx.recv() => ...    │
//! │  Worker::wait_for_status() ◄─┼──(status)──┼──    handler.next_event() => ... │
//! │                              │            │    }                             │
//! └──────────────────────────────┘            └──────────────────────────────────┘
//! ```
//!
//! Everything the handler creates in [`WorkerHandler::init`] (sockets,
//! connections) lives on the worker thread only. The channels are the only
//! path between the two threads.

use ocd_common::error::{DiError, DiResult};
use ocd_common::packet::Packet;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of the owner-to-worker control channel.
pub const CONTROL_CHANNEL_CAPACITY: usize = 256;

/// Sent by the worker once `init` has completed (or failed).
pub const STATUS_INIT_DONE: &str = "I-WORKER-INIT-DONE";
/// Ends the event loop.
pub const CMD_TERMINATE: &str = "$TERM";

/// Connect to the host controller.
pub const CMD_CONNECT: &str = "I-CONNECT";
/// Reply to [`CMD_CONNECT`].
pub const STATUS_CONNECT_DONE: &str = "I-CONNECT-DONE";
/// Disconnect from the host controller.
pub const CMD_DISCONNECT: &str = "I-DISCONNECT";
/// Reply to [`CMD_DISCONNECT`].
pub const STATUS_DISCONNECT_DONE: &str = "I-DISCONNECT-DONE";
/// Unsolicited: the host-controller connection dropped.
pub const STATUS_CONNECTION_LOST: &str = "I-CONNECTION-LOST";

/// Payload of a control or status message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    /// A diaddr or subnet address.
    Address(u16),
    Packet(Packet),
    Error(DiError),
}

/// A named message on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub name: &'static str,
    pub payload: Payload,
}

impl ControlMessage {
    pub fn new(name: &'static str, payload: Payload) -> Self {
        Self { name, payload }
    }

    pub fn empty(name: &'static str) -> Self {
        Self::new(name, Payload::Empty)
    }

    /// Status message carrying the outcome of an operation.
    pub fn outcome(name: &'static str, result: DiResult<Payload>) -> Self {
        match result {
            Ok(payload) => Self::new(name, payload),
            Err(e) => Self::new(name, Payload::Error(e)),
        }
    }

    /// Turn an `Error` payload into `Err`.
    pub fn into_result(self) -> DiResult<Payload> {
        match self.payload {
            Payload::Error(e) => Err(e),
            payload => Ok(payload),
        }
    }
}

/// Worker-side handle for reporting status to the owner.
pub struct WorkerContext {
    name: String,
    status_tx: std_mpsc::Sender<ControlMessage>,
}

impl WorkerContext {
    /// Name of the worker (also the thread name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post a status message to the owner.
    pub fn send_status(&self, msg: ControlMessage) {
        if self.status_tx.send(msg).is_err() {
            debug!(worker = %self.name, "owner is gone, status dropped");
        }
    }
}

/// Behavior plugged into a [`Worker`].
///
/// All methods run on the worker thread. The futures do not need to be
/// `Send`; the runtime is single-threaded.
pub trait WorkerHandler: Send + 'static {
    /// Event produced by the handler's own sources (network, channels).
    type Event;

    /// Create thread-affine resources. A failure is reported to
    /// [`Worker::start`].
    fn init(&mut self, ctx: &WorkerContext) -> impl Future<Output = DiResult<()>>;

    /// Wait for the next event from the handler's sources.
    ///
    /// Must be cancel-safe: it is polled inside `select!` and dropped
    /// whenever a control message arrives first. A handler without active
    /// sources returns a future that never completes.
    fn next_event(&mut self) -> impl Future<Output = Self::Event>;

    /// Process an event returned by [`WorkerHandler::next_event`].
    fn handle_event(
        &mut self,
        ctx: &WorkerContext,
        event: Self::Event,
    ) -> impl Future<Output = ()>;

    /// Process a control message that is not a worker command.
    fn handle_request(
        &mut self,
        ctx: &WorkerContext,
        msg: ControlMessage,
    ) -> impl Future<Output = ()>;

    /// Release resources. Runs after the loop ended or `init` failed.
    fn teardown(&mut self, ctx: &WorkerContext) -> impl Future<Output = ()>;
}

/// Owner-side handle of a worker thread.
pub struct Worker {
    name: String,
    control_tx: mpsc::Sender<ControlMessage>,
    status_rx: std_mpsc::Receiver<ControlMessage>,
    /// Status messages received while waiting for a different one.
    backlog: VecDeque<ControlMessage>,
    control_timeout: Duration,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread and wait until `init` has run.
    ///
    /// `control_timeout` bounds every [`Worker::wait_for_status`].
    pub fn start<H: WorkerHandler>(
        name: &str,
        handler: H,
        control_timeout: Duration,
    ) -> DiResult<Self> {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = std_mpsc::channel();

        let ctx = WorkerContext {
            name: name.to_string(),
            status_tx,
        };
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_thread(handler, ctx, control_rx))
            .map_err(|e| DiError::failure(format!("unable to spawn worker thread: {e}")))?;

        let mut worker = Self {
            name: name.to_string(),
            control_tx,
            status_rx,
            backlog: VecDeque::new(),
            control_timeout,
            thread: Some(thread),
        };

        match worker.wait_for_status(STATUS_INIT_DONE) {
            Ok(_) => {
                debug!(worker = %worker.name, "worker started");
                Ok(worker)
            }
            Err(e) => {
                error!(worker = %worker.name, error = %e, "worker initialization failed");
                worker.reap();
                Err(e)
            }
        }
    }

    /// Name of the worker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a command without blocking.
    pub fn send_command(&self, msg: ControlMessage) -> DiResult<()> {
        send_control(&self.control_tx, msg)
    }

    /// A sender for commands that bypasses the owner handle.
    ///
    /// Used for fire-and-forget traffic that must not wait for connection
    /// transitions.
    pub fn command_sender(&self) -> mpsc::Sender<ControlMessage> {
        self.control_tx.clone()
    }

    /// Block until the status `name` arrives.
    ///
    /// Other status messages arriving in the meantime are kept and can be
    /// fetched with [`Worker::take_unsolicited`].
    pub fn wait_for_status(&mut self, name: &str) -> DiResult<Payload> {
        if let Some(pos) = self.backlog.iter().position(|m| m.name == name) {
            if let Some(msg) = self.backlog.remove(pos) {
                return msg.into_result();
            }
        }

        let deadline = Instant::now() + self.control_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.status_rx.recv_timeout(remaining) {
                Ok(msg) if msg.name == name => return msg.into_result(),
                Ok(msg) => {
                    debug!(worker = %self.name, status = msg.name, "queued unsolicited status");
                    self.backlog.push_back(msg);
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    warn!(worker = %self.name, status = name, "timed out waiting for status");
                    return Err(DiError::Timeout);
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(DiError::failure(format!(
                        "worker '{}' exited while waiting for {name}",
                        self.name
                    )));
                }
            }
        }
    }

    /// Send a command and wait for its status reply.
    pub fn request(&mut self, msg: ControlMessage, reply: &str) -> DiResult<Payload> {
        self.send_command(msg)?;
        self.wait_for_status(reply)
    }

    /// Drain status messages nobody waited for.
    pub fn take_unsolicited(&mut self) -> Vec<ControlMessage> {
        let mut msgs: Vec<_> = self.backlog.drain(..).collect();
        msgs.extend(self.status_rx.try_iter());
        msgs
    }

    /// Whether the worker thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// End the event loop, run teardown and join the thread.
    ///
    /// Calling `stop` on a stopped worker is a no-op.
    pub fn stop(&mut self) -> DiResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if let Err(e) = self.send_command(ControlMessage::empty(CMD_TERMINATE)) {
            // a finished thread has dropped its receiver
            debug!(worker = %self.name, error = %e, "terminate command not delivered");
        }
        thread
            .join()
            .map_err(|_| DiError::failure(format!("worker '{}' panicked", self.name)))?;
        info!(worker = %self.name, "worker stopped");
        Ok(())
    }

    /// Clean up after a failed start.
    fn reap(&mut self) {
        match self.thread.take() {
            Some(thread) if thread.is_finished() => {
                if thread.join().is_err() {
                    error!(worker = %self.name, "worker panicked during initialization");
                }
            }
            Some(_) => {
                if let Err(e) = self.send_command(ControlMessage::empty(CMD_TERMINATE)) {
                    debug!(worker = %self.name, error = %e, "terminate command not delivered");
                }
                warn!(worker = %self.name, "worker did not report initialization, detaching");
            }
            None => {}
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(worker = %self.name, error = %e, "failed to stop worker");
        }
    }
}

/// Enqueue on a control channel from synchronous code.
pub fn send_control(tx: &mpsc::Sender<ControlMessage>, msg: ControlMessage) -> DiResult<()> {
    tx.try_send(msg).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => DiError::failure("worker control channel is full"),
        mpsc::error::TrySendError::Closed(_) => DiError::failure("worker has stopped"),
    })
}

fn run_thread<H: WorkerHandler>(
    mut handler: H,
    ctx: WorkerContext,
    control_rx: mpsc::Receiver<ControlMessage>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            ctx.send_status(ControlMessage::new(
                STATUS_INIT_DONE,
                Payload::Error(DiError::failure(format!("unable to build runtime: {e}"))),
            ));
            return;
        }
    };

    rt.block_on(async {
        if let Err(e) = handler.init(&ctx).await {
            handler.teardown(&ctx).await;
            ctx.send_status(ControlMessage::new(STATUS_INIT_DONE, Payload::Error(e)));
            return;
        }
        ctx.send_status(ControlMessage::empty(STATUS_INIT_DONE));

        event_loop(&mut handler, &ctx, control_rx).await;

        handler.teardown(&ctx).await;
    });
}

async fn event_loop<H: WorkerHandler>(
    handler: &mut H,
    ctx: &WorkerContext,
    mut control_rx: mpsc::Receiver<ControlMessage>,
) {
    loop {
        tokio::select! {
            biased;

            msg = control_rx.recv() => match msg {
                Some(msg) if msg.name == CMD_TERMINATE => break,
                Some(msg) => handler.handle_request(ctx, msg).await,
                None => {
                    debug!(worker = %ctx.name, "control channel closed");
                    break;
                }
            },
            event = handler.next_event() => handler.handle_event(ctx, event).await,
        }
    }
}
