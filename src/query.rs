//! streaming access to the responses of an executed request.

use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use std::sync::Arc;

use postgres_protocol::message::backend;

use super::{
    driver::codec::{Response, body_to_tag},
    error::{DbError, Error, InvalidState},
    row::{Completion, Row, RowInfo},
};

/// verdict of a row callback handed to [RowStream::process].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowProcessing {
    /// keep delivering rows.
    Continue,
    /// stop immediately, leaving the remaining rows in the stream.
    Suspend,
    /// skip the remaining rows and finish the response.
    Complete,
}

/// rows of one executed request, delivered one at a time as the server streams
/// them, terminated by the command [Completion].
///
/// dropping the stream midway leaves unread response data to be discarded by
/// the session driver.
pub struct RowStream {
    res: Response,
    info: Option<Arc<RowInfo>>,
    // format the execution requested. row descriptions arriving in band carry
    // no decided format and are overridden with it.
    result_format: Option<crate::data::DataFormat>,
    completion: Option<Completion>,
    consumed_error: Option<DbError>,
    finished: bool,
}

impl RowStream {
    pub(crate) fn new(
        res: Response,
        info: Option<Arc<RowInfo>>,
        result_format: Option<crate::data::DataFormat>,
    ) -> Self {
        Self {
            res,
            info,
            result_format,
            completion: None,
            consumed_error: None,
            finished: false,
        }
    }

    /// Metadata of the streamed rows. `None` until the server described the
    /// row set, which for an unnamed statement execution happens right before
    /// the first row arrives.
    pub fn info(&self) -> Option<&Arc<RowInfo>> {
        self.info.as_ref()
    }

    /// The completion of the request, available once the stream is drained.
    /// For a multi statement simple query this is the completion of the last
    /// command.
    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    /// The server error the installed error handler consumed, if any.
    pub fn consumed_error(&self) -> Option<&DbError> {
        self.consumed_error.as_ref()
    }

    /// The next row of the response.
    pub async fn try_next(&mut self) -> Result<Option<Row>, Error> {
        core::future::poll_fn(|cx| self.poll_try_next(cx)).await
    }

    pub(crate) fn poll_try_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Row>, Error>> {
        loop {
            if self.finished {
                return Poll::Ready(Ok(None));
            }
            match ready!(self.res.poll_recv(cx)) {
                Ok(msg) => match msg {
                    backend::Message::ParseComplete
                    | backend::Message::BindComplete
                    | backend::Message::ParameterDescription(_)
                    | backend::Message::NoData
                    | backend::Message::CloseComplete
                    | backend::Message::PortalSuspended => {}
                    backend::Message::RowDescription(body) => {
                        let info = RowInfo::parse(&body)?;
                        self.info = Some(match self.result_format {
                            Some(format) => info.with_format(format),
                            None => info,
                        });
                    }
                    backend::Message::DataRow(body) => {
                        let info = self.info.clone().unwrap_or_else(RowInfo::empty);
                        return Poll::Ready(Row::try_new(info, body).map(Some));
                    }
                    backend::Message::CommandComplete(body) => {
                        self.completion = Some(Completion::new(body_to_tag(&body)?));
                        if !self.res.is_sync() {
                            self.finished = true;
                        }
                    }
                    backend::Message::EmptyQueryResponse => {
                        self.completion = Some(Completion::new(""));
                        if !self.res.is_sync() {
                            self.finished = true;
                        }
                    }
                    backend::Message::ReadyForQuery(_) => self.finished = true,
                    backend::Message::CopyInResponse(_) | backend::Message::CopyOutResponse(_) => {
                        self.finished = true;
                        return Poll::Ready(Err(InvalidState(
                            "copy statement must be executed through a copier",
                        )
                        .into()));
                    }
                    _ => {
                        self.finished = true;
                        return Poll::Ready(Err(Error::unexpected()));
                    }
                },
                Err(e) => match self.try_consume_error(e) {
                    Ok(()) => {}
                    Err(e) => {
                        self.finished = true;
                        return Poll::Ready(Err(e));
                    }
                },
            }
        }
    }

    // a server error may be consumed by the session's error handler, in which
    // case the stream ends quietly instead of propagating it.
    fn try_consume_error(&mut self, e: Error) -> Result<(), Error> {
        let Some(db) = e.downcast_ref::<DbError>().cloned() else {
            return Err(e);
        };

        let consumed = {
            let mut handlers = self.res.shared().handlers.lock().unwrap();
            match handlers.error.as_mut() {
                Some(handler) => handler(&db),
                None => false,
            }
        };

        if !consumed {
            return Err(e);
        }

        self.consumed_error = Some(db);
        if !self.res.is_sync() {
            // without a synchronization point to drain up to, the response
            // ends right here.
            self.finished = true;
        }
        Ok(())
    }

    /// Delivers rows to `f` until the response finishes or the callback asks
    /// otherwise.
    ///
    /// Returns the completion, or `None` when the callback suspended the
    /// stream or a server error was consumed by the error handler.
    pub async fn process<F>(&mut self, mut f: F) -> Result<Option<Completion>, Error>
    where
        F: FnMut(Row) -> RowProcessing,
    {
        let mut deliver = true;
        while let Some(row) = self.try_next().await? {
            if !deliver {
                continue;
            }
            match f(row) {
                RowProcessing::Continue => {}
                RowProcessing::Suspend => return Ok(None),
                RowProcessing::Complete => deliver = false,
            }
        }
        Ok(self.completion.clone())
    }

    /// Discards the remaining rows and returns the completion of the request.
    pub async fn complete(mut self) -> Result<Completion, Error> {
        while self.try_next().await?.is_some() {}
        Ok(self.completion.take().unwrap_or_else(|| Completion::new("")))
    }
}

impl futures_core::Stream for RowStream {
    type Item = Result<Row, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_try_next(cx).map(Result::transpose)
    }
}
