//! request descriptors and the session state shared between the session object
//! and its driver task.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
};

use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use xitca_io::bytes::BytesMut;

use crate::{
    error::{DbError, DriverDown, Error},
    session::Notification,
};

use super::codec::{Response, ResponseSender};

/// What kind of response terminates a request. The front of the request queue
/// always identifies the response currently being demultiplexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    /// extended protocol execution. rows may precede the terminal completion.
    Execute,
    /// simple protocol query. always terminated by ready-for-query.
    Query,
    /// parse plus statement description.
    Prepare,
    /// statement description only.
    Describe,
    /// statement close.
    Unprepare,
    /// explicit synchronization point.
    Sync,
}

pub(crate) struct Descriptor {
    pub(crate) kind: RequestKind,
    /// request was encoded with a trailing sync message, making
    /// ready-for-query its terminal response.
    pub(crate) sync: bool,
    /// housekeeping request issued behind the user's back, e.g. a rollback
    /// fired from a drop path. keeps positional response routing intact
    /// without occupying the observable request queue.
    pub(crate) internal: bool,
    pub(crate) tx: ResponseSender,
}

pub(crate) struct Request {
    pub(crate) descriptor: Option<Descriptor>,
    pub(crate) msg: BytesMut,
}

/// `pipeline_status()` of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// requests are answered one at a time.
    Disabled,
    /// multiple requests may be queued before their responses are drained.
    Enabled,
    /// a pipelined request failed. queued requests are discarded until the
    /// next synchronization point is drained.
    Aborted,
}

const PIPELINE_DISABLED: u8 = 0;
const PIPELINE_ENABLED: u8 = 1;
const PIPELINE_ABORTED: u8 = 2;

/// server reported transaction status of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    Uncommitted,
    Failed,
    Unknown,
}

type NoticeHandler = Box<dyn FnMut(DbError) + Send>;
type NotificationHandler = Box<dyn FnMut(Notification) + Send>;
type ErrorHandler = Box<dyn FnMut(&DbError) -> bool + Send>;

#[derive(Default)]
pub(crate) struct Handlers {
    pub(crate) notice: Option<NoticeHandler>,
    pub(crate) notification: Option<NotificationHandler>,
    pub(crate) error: Option<ErrorHandler>,
}

/// state observable from the session object while the driver task owns the
/// socket. all members are updated by the driver as responses arrive.
pub(crate) struct Shared {
    pending: AtomicUsize,
    pipeline: AtomicU8,
    transaction: AtomicU8,
    copy: AtomicBool,
    closed: AtomicBool,
    pub(crate) handlers: Mutex<Handlers>,
    pub(crate) parameters: Mutex<HashMap<Box<str>, String>>,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(0),
            pipeline: AtomicU8::new(PIPELINE_DISABLED),
            transaction: AtomicU8::new(0),
            copy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
            parameters: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn request_queue_size(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn add_request(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn complete_request(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn pipeline_status(&self) -> PipelineStatus {
        match self.pipeline.load(Ordering::Acquire) {
            PIPELINE_ENABLED => PipelineStatus::Enabled,
            PIPELINE_ABORTED => PipelineStatus::Aborted,
            _ => PipelineStatus::Disabled,
        }
    }

    pub(crate) fn set_pipeline_status(&self, status: PipelineStatus) {
        let raw = match status {
            PipelineStatus::Disabled => PIPELINE_DISABLED,
            PipelineStatus::Enabled => PIPELINE_ENABLED,
            PipelineStatus::Aborted => PIPELINE_ABORTED,
        };
        self.pipeline.store(raw, Ordering::Release);
    }

    // the server error aborted an active pipeline.
    pub(crate) fn abort_pipeline(&self) {
        let _ = self.pipeline.compare_exchange(
            PIPELINE_ENABLED,
            PIPELINE_ABORTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    // a synchronization point was drained. an aborted pipeline recovers.
    pub(crate) fn recover_pipeline(&self) {
        let _ = self.pipeline.compare_exchange(
            PIPELINE_ABORTED,
            PIPELINE_ENABLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn transaction_status(&self) -> TransactionStatus {
        match self.transaction.load(Ordering::Acquire) {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::Uncommitted,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Unknown,
        }
    }

    pub(crate) fn set_transaction_status(&self, raw: u8) {
        self.transaction.store(raw, Ordering::Release);
    }

    pub(crate) fn is_copy_in_progress(&self) -> bool {
        self.copy.load(Ordering::Acquire)
    }

    pub(crate) fn set_copy_in_progress(&self, on: bool) {
        self.copy.store(on, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub(crate) type DriverRx = tokio::sync::mpsc::UnboundedReceiver<Request>;

/// sending half connecting a session to its driver task.
pub(crate) struct DriverTx {
    tx: UnboundedSender<Request>,
    pub(crate) shared: Arc<Shared>,
}

impl DriverTx {
    pub(crate) fn new(tx: UnboundedSender<Request>, shared: Arc<Shared>) -> Self {
        Self { tx, shared }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.shared.is_closed()
    }

    /// queues a tracked request. the descriptor is pushed before the write is
    /// handed to the driver and rolled back when that hand off fails.
    pub(crate) fn send<F>(&self, kind: RequestKind, sync: bool, encode: F) -> Result<Response, Error>
    where
        F: FnOnce(&mut BytesMut) -> Result<(), Error>,
    {
        let mut msg = BytesMut::new();
        encode(&mut msg)?;

        let (tx, rx) = unbounded_channel();
        self.shared.add_request();
        match self.tx.send(Request {
            descriptor: Some(Descriptor {
                kind,
                sync,
                internal: false,
                tx,
            }),
            msg,
        }) {
            Ok(_) => Ok(Response::new(rx, sync, self.shared.clone())),
            Err(_) => {
                self.shared.complete_request();
                Err(DriverDown.into())
            }
        }
    }

    /// queues a housekeeping request whose response is thrown away. it holds a
    /// queue position for response routing without being observable.
    pub(crate) fn send_internal<F>(&self, kind: RequestKind, encode: F) -> Result<(), Error>
    where
        F: FnOnce(&mut BytesMut) -> Result<(), Error>,
    {
        let mut msg = BytesMut::new();
        encode(&mut msg)?;

        let (tx, _) = unbounded_channel();
        self.tx
            .send(Request {
                descriptor: Some(Descriptor {
                    kind,
                    sync: true,
                    internal: true,
                    tx,
                }),
                msg,
            })
            .map_err(|_| DriverDown.into())
    }

    /// queues bytes that elicit no response at all, e.g. copy data or flush.
    pub(crate) fn send_one_way<F>(&self, encode: F) -> Result<(), Error>
    where
        F: FnOnce(&mut BytesMut) -> Result<(), Error>,
    {
        let mut msg = BytesMut::new();
        encode(&mut msg)?;
        self.tx
            .send(Request { descriptor: None, msg })
            .map_err(|_| DriverDown.into())
    }

    /// best effort variant of [DriverTx::send_one_way] for drop paths.
    pub(crate) fn do_send<F>(&self, encode: F)
    where
        F: FnOnce(&mut BytesMut) -> Result<(), Error>,
    {
        let _ = self.send_one_way(encode);
    }
}
