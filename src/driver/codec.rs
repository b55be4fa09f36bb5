//! per request response channel decoding.

use core::{
    future::Future,
    task::{Context, Poll, ready},
};

use std::sync::Arc;

use postgres_protocol::message::backend;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use xitca_io::bytes::BytesMut;

use crate::error::{DriverDownReceiving, Error, PipelineAborted};

use super::request::{PipelineStatus, Shared};

pub(crate) type ResponseSender = UnboundedSender<BytesMut>;

pub(crate) type ResponseReceiver = UnboundedReceiver<BytesMut>;

/// receiving end of a single request's response messages.
///
/// messages arrive in the order the driver read them from the socket. the
/// driver closes the channel once the request's terminal message was routed.
pub struct Response {
    rx: ResponseReceiver,
    buf: BytesMut,
    sync: bool,
    shared: Arc<Shared>,
}

impl Response {
    pub(crate) fn new(rx: ResponseReceiver, sync: bool, shared: Arc<Shared>) -> Self {
        Self {
            rx,
            buf: BytesMut::new(),
            sync,
            shared,
        }
    }

    /// request was encoded with a trailing sync, making ready-for-query its
    /// terminal message.
    pub(crate) fn is_sync(&self) -> bool {
        self.sync
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn recv(&mut self) -> impl Future<Output = Result<backend::Message, Error>> + Send + '_ {
        core::future::poll_fn(|cx| self.poll_recv(cx))
    }

    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<backend::Message, Error>> {
        if self.buf.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(msg) => self.buf = msg,
                None => return Poll::Ready(Err(self.closed_err())),
            }
        }
        Poll::Ready(self.parse_message())
    }

    #[cold]
    #[inline(never)]
    fn closed_err(&self) -> Error {
        // the driver drops queued response senders without routing anything to
        // them when a pipelined request ahead of them failed.
        if self.shared.pipeline_status() == PipelineStatus::Aborted {
            PipelineAborted.into()
        } else {
            DriverDownReceiving.into()
        }
    }

    fn parse_message(&mut self) -> Result<backend::Message, Error> {
        match backend::Message::parse(&mut self.buf)? {
            Some(backend::Message::ErrorResponse(body)) => Err(Error::db(&mut body.fields())),
            Some(msg) => Ok(msg),
            None => Err(Error::unexpected()),
        }
    }
}

// Extract the number of rows affected from a command tag.
pub(crate) fn body_to_tag(body: &backend::CommandCompleteBody) -> Result<Box<str>, Error> {
    body.tag().map(Into::into).map_err(Error::from)
}
