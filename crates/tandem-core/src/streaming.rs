//! The receiving half of a call: an ordered sequence of messages ending in
//! exactly one terminal outcome.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_core::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};

use crate::channel::{ChannelHandle, ChannelSender};
use crate::{CallContext, Encoding, Frame, Status};

type Outcome = Option<Result<(), Status>>;

/// Messages arriving on one call.
///
/// Pull with [`Streaming::message`]. `Ok(Some(_))` is the next message,
/// `Ok(None)` means the call completed, `Err(status)` is the terminal
/// failure. A failure is reported once; later pulls return `Ok(None)` and
/// the status stays available from [`Streaming::outcome`].
///
/// Every pull races the call's context: once the context is cancelled or
/// its deadline passes, no further messages are delivered.
///
/// The peer may run at most one receive window ahead of the puller; room is
/// granted back in half-window batches as messages are taken.
pub struct Streaming<T> {
    rx: mpsc::Receiver<Frame>,
    handle: Arc<ChannelHandle>,
    ctx: CallContext,
    encoding: Encoding,
    sender: ChannelSender,
    /// Set on the calling side, where abandoning the call notifies the peer.
    cancel_on_abandon: bool,
    grant_batch: u32,
    consumed: u32,
    finished: bool,
    completion: watch::Sender<Outcome>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Streaming<T> {
    pub(crate) fn new(
        rx: mpsc::Receiver<Frame>,
        handle: Arc<ChannelHandle>,
        ctx: CallContext,
        sender: ChannelSender,
        window: u32,
    ) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            rx,
            handle,
            ctx,
            encoding: sender.encoding(),
            sender,
            cancel_on_abandon: false,
            grant_batch: (window / 2).max(1),
            consumed: 0,
            finished: false,
            completion,
            _marker: PhantomData,
        }
    }

    pub(crate) fn cancel_on_abandon(mut self) -> Self {
        self.cancel_on_abandon = true;
        self
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// How the call ended, once it has.
    pub fn outcome(&self) -> Option<Result<(), Status>> {
        self.completion.borrow().clone()
    }

    /// A handle that resolves when this stream reaches its terminal outcome.
    pub fn completion(&self) -> CallCompletion {
        CallCompletion {
            rx: self.completion.subscribe(),
        }
    }

    fn finish(&mut self, outcome: Result<(), Status>) {
        self.finished = true;
        // Frames still in flight are refused rather than queued.
        self.rx.close();
        match &outcome {
            Ok(()) => tracing::trace!(channel_id = self.handle.channel_id(), "call completed"),
            Err(status) => tracing::debug!(
                channel_id = self.handle.channel_id(),
                code = %status.code(),
                message = status.message(),
                "call failed"
            ),
        }
        self.completion.send_replace(Some(outcome));
    }

    fn fail(&mut self, status: Status) -> Status {
        self.finish(Err(status.clone()));
        status
    }

    fn abandon(&mut self, status: Status) -> Status {
        if self.cancel_on_abandon {
            self.sender.spawn_cancel();
        }
        self.fail(status)
    }

    fn consumed_one(&mut self) {
        self.consumed += 1;
        if self.consumed >= self.grant_batch {
            self.sender.spawn_credit(self.consumed);
            self.consumed = 0;
        }
    }
}

impl<T: DeserializeOwned> Streaming<T> {
    /// Next message, `Ok(None)` once the call has completed.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        loop {
            if self.finished {
                return Ok(None);
            }

            let next = tokio::select! {
                biased;
                status = self.ctx.done() => Err(status),
                frame = self.rx.recv() => Ok(frame),
            };
            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(self.fail(Status::unavailable("connection closed"))),
                Err(status) => return Err(self.abandon(status)),
            };

            if let Some(status) = frame.status() {
                return Err(self.fail(status));
            }
            if frame.is_data() {
                let value = match self.encoding.decode::<T>(&frame.payload) {
                    Ok(value) => value,
                    Err(e) => return Err(self.abandon(Status::from(e))),
                };
                if frame.is_eos() {
                    self.finish(Ok(()));
                } else {
                    self.consumed_one();
                }
                return Ok(Some(value));
            }
            if frame.is_eos() {
                self.finish(Ok(()));
                return Ok(None);
            }
            tracing::trace!(
                channel_id = self.handle.channel_id(),
                flags = ?frame.desc.flags,
                "ignoring frame without message"
            );
        }
    }

    /// Exactly one message followed by completion.
    pub(crate) async fn single(&mut self) -> Result<T, Status> {
        let Some(value) = self.message().await? else {
            return Err(self.fail(Status::internal("call completed without a message")));
        };
        match self.message().await? {
            None => Ok(value),
            Some(_) => Err(self.abandon(Status::internal("expected a single message"))),
        }
    }

    /// Drain the remaining messages.
    pub async fn collect_all(mut self) -> Result<Vec<T>, Status> {
        let mut out = Vec::new();
        while let Some(value) = self.message().await? {
            out.push(value);
        }
        Ok(out)
    }

    /// Adapt into a [`Stream`] that ends after the terminal outcome.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Status>> + Send + 'static
    where
        T: Send + 'static,
    {
        futures_util::stream::unfold(self, |mut streaming| async move {
            match streaming.message().await {
                Ok(Some(value)) => Some((Ok(value), streaming)),
                Ok(None) => None,
                Err(status) => Some((Err(status), streaming)),
            }
        })
    }
}

impl<T> Drop for Streaming<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // A caller walking away from a live call cancels it on the peer.
        if self.cancel_on_abandon && tokio::runtime::Handle::try_current().is_ok() {
            self.sender.spawn_cancel();
        }
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("channel_id", &self.handle.channel_id())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Resolves with a call's terminal outcome.
#[derive(Clone, Debug)]
pub struct CallCompletion {
    rx: watch::Receiver<Outcome>,
}

impl CallCompletion {
    /// `Ok(())` for a clean completion, otherwise the terminal status.
    ///
    /// If the receiving half is dropped before the call ends, this reports
    /// `Cancelled`.
    pub async fn wait(&mut self) -> Result<(), Status> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
            Err(_) => Err(Status::cancelled("call abandoned before completion")),
        }
    }

    /// The outcome if the call has already ended.
    pub fn peek(&self) -> Option<Result<(), Status>> {
        self.rx.borrow().clone()
    }
}
