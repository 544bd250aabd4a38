//! Streaming sessions.
//!
//! A streaming route keeps its connection open and pushes discrete messages
//! down it for as long as the handler likes. The session walks one way
//! through its states:
//!
//! ```text
//! Created ──write_header──▶ HeaderSent ──write──▶ Writing(n) ──fail──▶ Closed
//! ```
//!
//! The header is written through the [`Context`](crate::Context); messages
//! through the [`Stream`]. A write that misses its deadline, finds the remote
//! gone, or cannot be marshalled closes the session, and every hook
//! registered with [`Stream::on_close`] runs before the failing `write`
//! returns. Hooks also run when the handler drops the stream.
//!
//! Messages usually arrive from other requests. [`mailbox`] gives the handler
//! a capacity-one channel whose sending half never waits: if the session is
//! not ready for another message, [`Mailbox::offer`] drops it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::StreamError;
use crate::marshal::{self, Marshaller};

/// Where a streaming session is in its life.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Created,
    HeaderSent,
    /// Messages written so far.
    Writing(u64),
    Closed,
}

/// State shared by a session's [`Context`](crate::Context) and [`Stream`].
#[derive(Clone, Debug)]
pub(crate) struct SharedState(Arc<Mutex<StreamState>>);

impl SharedState {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(StreamState::Created)))
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn get(&self) -> StreamState {
        *self.lock()
    }

    pub(crate) fn set(&self, state: StreamState) {
        *self.lock() = state;
    }
}

type Hook = Box<dyn FnOnce() + Send + Sync + 'static>;

/// The writing half of a streaming session.
pub struct Stream {
    field: Arc<str>,
    frames: mpsc::Sender<Bytes>,
    state: SharedState,
    deadline: Option<Instant>,
    marshaller: Arc<dyn Marshaller>,
    on_close: Vec<Hook>,
}

impl Stream {
    pub(crate) fn new(
        field: Arc<str>,
        frames: mpsc::Sender<Bytes>,
        state: SharedState,
        marshaller: Arc<dyn Marshaller>,
    ) -> Self {
        Self { field, frames, state, deadline: None, marshaller, on_close: Vec::new() }
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    /// Sets the deadline for subsequent writes. Without one, a write waits
    /// for as long as the connection takes to accept it.
    pub fn set_deadline(&mut self, deadline: impl Into<Instant>) {
        self.deadline = Some(deadline.into());
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    /// Registers cleanup to run once, when the session closes.
    pub fn on_close(&mut self, hook: impl FnOnce() + Send + Sync + 'static) {
        if self.state() == StreamState::Closed {
            hook();
            return;
        }
        self.on_close.push(Box::new(hook));
    }

    /// Marshals `message` with the route's codec and writes it as one frame.
    pub async fn write<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), StreamError> {
        self.ready()?;
        let frame = match marshal::to_value(message).and_then(|value| self.marshaller.marshal(&value)) {
            Ok(frame) => frame,
            Err(e) => return Err(self.fail(e.into())),
        };
        self.send(Bytes::from(frame)).await
    }

    /// Writes raw bytes as one frame.
    pub async fn write_bytes(&mut self, frame: impl Into<Bytes>) -> Result<(), StreamError> {
        self.ready()?;
        self.send(frame.into()).await
    }

    /// Resolves once the remote end has gone away. Lets a handler notice a
    /// disconnect while it has nothing to write.
    pub async fn disconnected(&self) {
        self.frames.closed().await;
    }

    fn ready(&mut self) -> Result<(), StreamError> {
        match self.state() {
            StreamState::Created => Err(StreamError::HeaderNotSent),
            StreamState::Closed => {
                self.close();
                Err(StreamError::Closed)
            }
            StreamState::HeaderSent | StreamState::Writing(_) => Ok(()),
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), StreamError> {
        let sent = match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StreamError::DeadlineExceeded),
            Some(deadline) => match tokio::time::timeout_at(deadline, self.frames.send(frame)).await {
                Ok(sent) => sent.map_err(|_| StreamError::Disconnected),
                Err(_) => Err(StreamError::DeadlineExceeded),
            },
            None => self.frames.send(frame).await.map_err(|_| StreamError::Disconnected),
        };

        match sent {
            Ok(()) => {
                let written = match self.state() {
                    StreamState::Writing(n) => n + 1,
                    _ => 1,
                };
                self.state.set(StreamState::Writing(written));
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, error: StreamError) -> StreamError {
        debug!(field = %self.field, %error, "stream write failed");
        self.close();
        error
    }

    fn close(&mut self) {
        if self.state() != StreamState::Closed {
            debug!(field = %self.field, "stream closed");
        }
        self.state.set(StreamState::Closed);
        for hook in self.on_close.drain(..) {
            hook();
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("field", &self.field)
            .field("state", &self.state())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Creates a best-effort message channel for feeding a streaming session.
pub fn mailbox<T>() -> (Mailbox<T>, Inbox<T>) {
    let (tx, rx) = mpsc::channel(1);
    (Mailbox(tx), Inbox(rx))
}

/// Sending half of [`mailbox`]. Cheap to clone.
#[derive(Debug)]
pub struct Mailbox<T>(mpsc::Sender<T>);

impl<T> Mailbox<T> {
    /// Offers `message` without waiting. Returns whether it was accepted; a
    /// full or closed mailbox drops it.
    pub fn offer(&self, message: T) -> bool {
        self.0.try_send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Receiving half of [`mailbox`].
#[derive(Debug)]
pub struct Inbox<T>(mpsc::Receiver<T>);

impl<T> Inbox<T> {
    /// Waits for the next message. `None` once every [`Mailbox`] is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }
}
