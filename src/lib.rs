#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod column;
mod config;
mod connection;
mod data;
mod driver;
mod prepared;
mod query;
mod row;
mod session;

pub mod copy;
pub mod error;
pub mod large_object;
pub mod pool;
pub mod statement;
pub mod transaction;

pub use self::{
    column::Column,
    config::{ChannelBinding, Config, Host, SslMode, TargetSessionAttrs},
    connection::{Connection, PendingDescribe, PendingPrepare, PendingUnprepare, SyncPoint},
    data::{Data, DataFormat, DataView},
    driver::request::{PipelineStatus, TransactionStatus},
    error::Error,
    prepared::{Arg, PreparedStatement},
    query::{RowProcessing, RowStream},
    row::{Completion, Row, RowIndex, RowInfo},
    session::{CancelToken, Notification},
    statement::{MAX_PARAMETER_COUNT, Statement, StatementVector, Tuple},
    transaction::TransactionGuard,
};

use core::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

// names generated for cache managed server side statements.
pub(crate) fn next_statement_id() -> usize {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

fn _assert_send<F: Send>(_: F) {}
fn _assert_send2<F: Send>() {}

fn _assert_types_send() {
    _assert_send2::<Connection>();
    _assert_send2::<RowStream>();
    _assert_send2::<PreparedStatement>();
}

fn _assert_connect_send(mut c: Connection) {
    _assert_send(async move { c.connect().await });
}
