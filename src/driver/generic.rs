//! socket owning driver loop: batches queued writes, reads backend messages
//! and routes every response to the request at the front of the queue.

use core::{convert::Infallible, future::poll_fn, pin::Pin};

use std::{collections::VecDeque, io, sync::Arc};

use postgres_protocol::message::backend::{self, Header};
use xitca_io::{
    bytes::{BufInterest, BufRead, BufWrite, BytesMut, WriteBuf},
    io::{AsyncIo, Interest},
};
use xitca_unsafe_collection::futures::{Select as _, SelectOutput};

use crate::error::{DbError, Error};

use super::request::{Descriptor, DriverRx, Request, RequestKind, Shared};

type PagedBytesMut = xitca_unsafe_collection::bytes::PagedBytesMut<4096>;

// backend message tags the demultiplexer dispatches on.
const CLOSE_COMPLETE_TAG: u8 = b'3';
const COMMAND_COMPLETE_TAG: u8 = b'C';
const COPY_DONE_TAG: u8 = b'c';
const COPY_IN_RESPONSE_TAG: u8 = b'G';
const COPY_OUT_RESPONSE_TAG: u8 = b'H';
const EMPTY_QUERY_RESPONSE_TAG: u8 = b'I';
const ERROR_RESPONSE_TAG: u8 = b'E';
const NO_DATA_TAG: u8 = b'n';
const PORTAL_SUSPENDED_TAG: u8 = b's';
const ROW_DESCRIPTION_TAG: u8 = b'T';

pub(crate) struct GenericDriver<Io> {
    io: Io,
    write_buf: WriteBuf,
    read_buf: PagedBytesMut,
    state: DriverState,
    res: VecDeque<Descriptor>,
    shared: Arc<Shared>,
}

enum DriverState {
    Running(DriverRx),
    Closing(Option<io::Error>),
}

impl<Io> GenericDriver<Io>
where
    Io: AsyncIo + Send,
{
    pub(crate) fn new(io: Io, rx: DriverRx, shared: Arc<Shared>) -> Self {
        Self {
            io,
            write_buf: WriteBuf::new(),
            read_buf: PagedBytesMut::new(),
            state: DriverState::Running(rx),
            res: VecDeque::new(),
            shared,
        }
    }

    /// direct send used during session establishment, before the channel
    /// driven loop takes over.
    pub(crate) async fn send(&mut self, msg: BytesMut) -> Result<(), Error> {
        self.write_buf_extend(&msg);
        loop {
            self.try_write()?;
            if self.write_buf.is_empty() {
                return Ok(());
            }
            self.io.ready(Interest::WRITABLE).await?;
        }
    }

    /// direct receive used during session establishment. error responses are
    /// surfaced as [DbError].
    pub(crate) async fn recv(&mut self) -> Result<backend::Message, Error> {
        loop {
            match backend::Message::parse(self.read_buf.get_mut())? {
                Some(backend::Message::ErrorResponse(body)) => return Err(Error::db(&mut body.fields())),
                Some(msg) => return Ok(msg),
                None => {}
            }
            self.io.ready(Interest::READABLE).await?;
            self.try_read()?;
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), Error> {
        let res = self.run_inner().await;
        self.shared.mark_closed();
        res
    }

    async fn run_inner(&mut self) -> Result<(), Error> {
        loop {
            self.try_decode()?;

            let interest = if self.write_buf.want_write_io() {
                Interest::READABLE.add(Interest::WRITABLE)
            } else {
                Interest::READABLE
            };

            let select = match self.state {
                DriverState::Running(ref mut rx) => rx.recv().select(self.io.ready(interest)).await,
                DriverState::Closing(ref mut e) => {
                    if !interest.is_writable() && self.res.is_empty() {
                        // no pending write and every response is finished.
                        // shutdown io and exit.
                        poll_fn(|cx| Pin::new(&mut self.io).poll_shutdown(cx)).await?;
                        return e.take().map(|e| Err(e.into())).unwrap_or(Ok(()));
                    }
                    SelectOutput::B(self.io.ready(interest).await)
                }
            };

            match select {
                SelectOutput::A(Some(Request { descriptor, msg })) => {
                    if let Some(descriptor) = descriptor {
                        self.res.push_back(descriptor);
                    }
                    self.write_buf_extend(&msg);
                }
                SelectOutput::A(None) => self.state = DriverState::Closing(None),
                SelectOutput::B(ready) => {
                    let ready = ready?;
                    if ready.is_readable() {
                        self.try_read()?;
                    }
                    if ready.is_writable() {
                        if let Err(e) = self.try_write() {
                            // write failed. half close into read only mode so
                            // already received responses still drain, then
                            // shut down.
                            self.write_buf.clear();
                            self.state = DriverState::Closing(Some(e));
                        }
                    }
                }
            }
        }
    }

    fn write_buf_extend(&mut self, buf: &[u8]) {
        let _ = self.write_buf.write_buf(|w| {
            w.extend_from_slice(buf);
            Ok::<_, Infallible>(())
        });
    }

    fn try_read(&mut self) -> Result<(), Error> {
        self.read_buf.do_io(&mut self.io).map_err(Into::into)
    }

    fn try_write(&mut self) -> io::Result<()> {
        self.write_buf.do_io(&mut self.io)
    }

    // drains every complete message currently buffered.
    fn try_decode(&mut self) -> Result<(), Error> {
        loop {
            let buf = self.read_buf.get_mut();
            let Some(header) = Header::parse(&buf[..])? else { return Ok(()) };
            let len = header.len() as usize + 1;
            if buf.len() < len {
                return Ok(());
            }

            match header.tag() {
                backend::NOTICE_RESPONSE_TAG | backend::NOTIFICATION_RESPONSE_TAG | backend::PARAMETER_STATUS_TAG => {
                    let msg = backend::Message::parse(buf)?
                        .expect("a full message is buffered. parser must produce it");
                    self.handle_async_message(msg)?;
                }
                tag => {
                    let msg = buf.split_to(len);
                    self.route(tag, msg)?;
                }
            }
        }
    }

    // routes one response message to the front request and pops the request
    // once its terminal message is seen.
    fn route(&mut self, tag: u8, msg: BytesMut) -> Result<(), Error> {
        match tag {
            backend::READY_FOR_QUERY_TAG => {
                // body is a single status byte past the length field.
                self.shared.set_transaction_status(msg[5]);
                self.shared.set_copy_in_progress(false);
                self.shared.recover_pipeline();
            }
            COPY_IN_RESPONSE_TAG | COPY_OUT_RESPONSE_TAG => self.shared.set_copy_in_progress(true),
            COPY_DONE_TAG | COMMAND_COMPLETE_TAG => self.shared.set_copy_in_progress(false),
            _ => {}
        }

        let Some(front) = self.res.front() else {
            return self.orphan_message(tag, msg);
        };

        let terminal = is_terminal(front, tag);
        let aborts_pipeline = tag == ERROR_RESPONSE_TAG && !front.sync;

        let _ = front.tx.send(msg);

        if terminal {
            if let Some(done) = self.res.pop_front() {
                if !done.internal {
                    self.shared.complete_request();
                }
            }
        }

        if aborts_pipeline {
            self.shared.abort_pipeline();
            self.shared.set_copy_in_progress(false);
            // the server discards the rest of the pipeline up to the next
            // synchronization point. drop the doomed requests so their
            // awaiters resolve instead of hanging.
            while self
                .res
                .front()
                .is_some_and(|d| d.kind != RequestKind::Sync)
            {
                if let Some(dropped) = self.res.pop_front() {
                    if !dropped.internal {
                        self.shared.complete_request();
                    }
                }
            }
        }

        Ok(())
    }

    #[cold]
    #[inline(never)]
    fn orphan_message(&mut self, tag: u8, mut msg: BytesMut) -> Result<(), Error> {
        // a message with no owning request. a fatal server error, e.g. an
        // administrative shutdown, is reported through the driver exit.
        if tag == ERROR_RESPONSE_TAG {
            return match backend::Message::parse(&mut msg)? {
                Some(backend::Message::ErrorResponse(body)) => Err(Error::db(&mut body.fields())),
                _ => Err(Error::unexpected()),
            };
        }
        tracing::debug!("discarding unowned message with tag {}", tag as char);
        Ok(())
    }

    fn handle_async_message(&mut self, msg: backend::Message) -> Result<(), Error> {
        match msg {
            backend::Message::NoticeResponse(body) => {
                let notice = DbError::parse(&mut body.fields())?;
                let mut handlers = self.shared.handlers.lock().unwrap();
                match handlers.notice.as_mut() {
                    Some(handler) => invoke_handler(|| handler(notice)),
                    None => tracing::info!("notice: {notice}"),
                }
            }
            backend::Message::NotificationResponse(body) => {
                let notification = crate::session::Notification {
                    process_id: body.process_id(),
                    channel: body.channel()?.into(),
                    payload: body.message()?.into(),
                };
                let mut handlers = self.shared.handlers.lock().unwrap();
                match handlers.notification.as_mut() {
                    Some(handler) => invoke_handler(|| handler(notification)),
                    None => tracing::debug!("unhandled notification from channel {}", body.channel()?),
                }
            }
            backend::Message::ParameterStatus(body) => {
                let name = body.name()?.into();
                let value = body.value()?.to_string();
                self.shared.parameters.lock().unwrap().insert(name, value);
            }
            _ => return Err(Error::unexpected()),
        }
        Ok(())
    }
}

// a panicking handler must not poison the driver loop.
fn invoke_handler(f: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        tracing::error!("session handler panicked. the event is dropped");
    }
}

// the terminal message of a request depends on its kind and on whether it was
// encoded with a trailing sync.
fn is_terminal(descriptor: &Descriptor, tag: u8) -> bool {
    if descriptor.sync {
        return tag == backend::READY_FOR_QUERY_TAG;
    }
    match descriptor.kind {
        RequestKind::Execute => matches!(
            tag,
            COMMAND_COMPLETE_TAG | EMPTY_QUERY_RESPONSE_TAG | PORTAL_SUSPENDED_TAG | ERROR_RESPONSE_TAG
        ),
        RequestKind::Prepare | RequestKind::Describe => {
            matches!(tag, ROW_DESCRIPTION_TAG | NO_DATA_TAG | ERROR_RESPONSE_TAG)
        }
        RequestKind::Unprepare => matches!(tag, CLOSE_COMPLETE_TAG | ERROR_RESPONSE_TAG),
        RequestKind::Sync | RequestKind::Query => tag == backend::READY_FOR_QUERY_TAG,
    }
}
