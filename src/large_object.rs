//! large object streaming over the server side `lo_*` function calls.
//!
//! All of this API must be used inside a transaction block: the server closes
//! every large object descriptor at transaction end, and using a descriptor
//! outside of one fails with a server error.

use core::ops::BitOr;

use std::{
    io::{Read, Write},
    path::Path,
    sync::{Arc, Weak},
};

use postgres_types::{Oid, Type};

use super::{
    connection::{Connection, ConnInner},
    error::{DbError, Error, InvalidState},
};

// io chunk of the import/export helpers.
const FILE_CHUNK: usize = 16 * 1024;

/// open mode of a large object. `READING` and `WRITING` are orthogonal bits
/// and may be combined.
///
/// Reading an object opened with `READING` reflects the transaction snapshot
/// taken when it was opened; opening with `WRITING` makes reads see writes of
/// other committed transactions as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeObjectMode(i32);

impl LargeObjectMode {
    pub const READING: Self = Self(0x40000);
    pub const WRITING: Self = Self(0x20000);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn as_i32(self) -> i32 {
        self.0
    }
}

impl BitOr for LargeObjectMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// seek origin of [LargeObject::seek].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Begin,
    Current,
    End,
}

impl SeekWhence {
    fn as_i32(self) -> i32 {
        match self {
            Self::Begin => 0,
            Self::Current => 1,
            Self::End => 2,
        }
    }
}

/// A descriptor of an open server side large object.
///
/// The handle owns the exclusive right to its descriptor. It is invalidated by
/// [LargeObject::close] and by the end of the session it was opened on; the
/// server additionally closes all descriptors when the surrounding transaction
/// ends, after which `close` is a no-op reporting success.
pub struct LargeObject {
    conn: Weak<ConnInner>,
    epoch: u64,
    descriptor: i32,
    valid: bool,
}

impl Connection {
    /// Creates a large object, returning its OID. Passing an OID asks the
    /// server for that specific one.
    pub async fn create_large_object(&self, oid: Option<Oid>) -> Result<Oid, Error> {
        let inner = self.inner()?;
        inner
            .fetch_scalar("SELECT lo_create($1)", &[(&oid.unwrap_or(0), Type::OID)])
            .await
    }

    /// Removes the large object `oid`.
    pub async fn remove_large_object(&self, oid: Oid) -> Result<(), Error> {
        let inner = self.inner()?;
        inner
            .fetch_scalar::<i32>("SELECT lo_unlink($1)", &[(&oid, Type::OID)])
            .await
            .map(|_| ())
    }

    /// Opens the large object `oid` in the given mode, scoped to the current
    /// transaction.
    pub async fn open_large_object(&self, oid: Oid, mode: LargeObjectMode) -> Result<LargeObject, Error> {
        let inner = self.inner()?;
        let descriptor = inner
            .fetch_scalar::<i32>(
                "SELECT lo_open($1, $2)",
                &[(&oid, Type::OID), (&mode.as_i32(), Type::INT4)],
            )
            .await?;
        Ok(LargeObject {
            conn: Arc::downgrade(inner),
            epoch: inner.epoch(),
            descriptor,
            valid: true,
        })
    }

    /// Imports a local file into a new large object, returning its OID.
    ///
    /// Runs inside the current transaction, or inside a transaction of its
    /// own when the session is not in one.
    pub async fn import_large_object(&self, path: impl AsRef<Path>, oid: Option<Oid>) -> Result<Oid, Error> {
        let mut file = std::fs::File::open(path)?;

        let own_transaction = self.begin_unless_in_transaction().await?;
        let res = async {
            let oid = self.create_large_object(oid).await?;
            let mut lo = self.open_large_object(oid, LargeObjectMode::WRITING).await?;

            let mut chunk = vec![0u8; FILE_CHUNK];
            loop {
                let n = file.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                let mut written = 0;
                while written < n {
                    written += lo.write(&chunk[written..n]).await?;
                }
            }
            lo.close().await?;
            Ok(oid)
        }
        .await;
        self.finish_own_transaction(own_transaction, res.is_ok()).await?;
        res
    }

    /// Exports the large object `oid` into a local file.
    ///
    /// Runs inside the current transaction, or inside a transaction of its
    /// own when the session is not in one.
    pub async fn export_large_object(&self, oid: Oid, path: impl AsRef<Path>) -> Result<(), Error> {
        let mut file = std::fs::File::create(path)?;

        let own_transaction = self.begin_unless_in_transaction().await?;
        let res = async {
            let mut lo = self.open_large_object(oid, LargeObjectMode::READING).await?;

            loop {
                let chunk = lo.read(FILE_CHUNK).await?;
                if chunk.is_empty() {
                    break;
                }
                file.write_all(&chunk)?;
            }
            lo.close().await?;
            file.flush()?;
            Ok(())
        }
        .await;
        self.finish_own_transaction(own_transaction, res.is_ok()).await?;
        res
    }

    async fn begin_unless_in_transaction(&self) -> Result<bool, Error> {
        if self.is_transaction_uncommitted() {
            return Ok(false);
        }
        self.execute_text("BEGIN").await?;
        Ok(true)
    }

    async fn finish_own_transaction(&self, own: bool, success: bool) -> Result<(), Error> {
        if !own {
            return Ok(());
        }
        self.execute_text(if success { "COMMIT" } else { "ROLLBACK" })
            .await
            .map(|_| ())
    }
}

impl LargeObject {
    /// `true` while the handle has not been closed and its session is alive.
    pub fn is_valid(&self) -> bool {
        self.valid && self.conn().is_ok()
    }

    pub fn descriptor(&self) -> i32 {
        self.descriptor
    }

    /// Moves the position of the descriptor, returning the new position.
    pub async fn seek(&mut self, offset: i64, whence: SeekWhence) -> Result<i64, Error> {
        let conn = self.usable()?;
        conn.fetch_scalar(
            "SELECT lo_lseek64($1, $2, $3)",
            &[
                (&self.descriptor, Type::INT4),
                (&offset, Type::INT8),
                (&whence.as_i32(), Type::INT4),
            ],
        )
        .await
    }

    /// The current position of the descriptor.
    pub async fn tell(&mut self) -> Result<i64, Error> {
        let conn = self.usable()?;
        conn.fetch_scalar("SELECT lo_tell64($1)", &[(&self.descriptor, Type::INT4)])
            .await
    }

    /// Reads up to `size` bytes from the current position. A short or empty
    /// buffer marks the end of the object.
    pub async fn read(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        let conn = self.usable()?;
        let size = i32::try_from(size).map_err(|_| InvalidState("read size out of range"))?;
        conn.fetch_scalar(
            "SELECT loread($1, $2)",
            &[(&self.descriptor, Type::INT4), (&size, Type::INT4)],
        )
        .await
    }

    /// Writes `data` at the current position, returning the count of bytes
    /// the server accepted.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let conn = self.usable()?;
        let written = conn
            .fetch_scalar::<i32>(
                "SELECT lowrite($1, $2)",
                &[(&self.descriptor, Type::INT4), (&data, Type::BYTEA)],
            )
            .await?;
        Ok(written as usize)
    }

    /// Truncates (or zero extends) the object to `size` bytes.
    pub async fn truncate(&mut self, size: i64) -> Result<(), Error> {
        let conn = self.usable()?;
        conn.fetch_scalar::<i32>(
            "SELECT lo_truncate64($1, $2)",
            &[(&self.descriptor, Type::INT4), (&size, Type::INT8)],
        )
        .await
        .map(|_| ())
    }

    /// Closes the descriptor and invalidates the handle.
    ///
    /// Closing after the surrounding transaction already ended, or after the
    /// session went away, reports success: the server has closed the
    /// descriptor on its side either way.
    pub async fn close(&mut self) -> Result<(), Error> {
        if !self.valid {
            return Ok(());
        }
        self.valid = false;

        let Ok(conn) = self.conn() else { return Ok(()) };
        match conn
            .fetch_scalar::<i32>("SELECT lo_close($1)", &[(&self.descriptor, Type::INT4)])
            .await
        {
            Ok(_) => Ok(()),
            // the transaction ended and took the descriptor with it.
            Err(e) if e.downcast_ref::<DbError>().is_some() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn conn(&self) -> Result<Arc<ConnInner>, Error> {
        self.conn
            .upgrade()
            .filter(|c| c.epoch() == self.epoch && !c.is_closed())
            .ok_or_else(|| InvalidState("large object outlived its session").into())
    }

    fn usable(&self) -> Result<Arc<ConnInner>, Error> {
        if !self.valid {
            return Err(InvalidState("large object is closed").into());
        }
        self.conn()
    }
}

impl Drop for LargeObject {
    fn drop(&mut self) {
        if !self.valid {
            return;
        }
        if let Ok(conn) = self.conn() {
            conn.do_send_when_idle_typed("SELECT lo_close($1)", &[(&self.descriptor, Type::INT4)]);
        }
    }
}
