//! scoped transaction management.

use super::{
    connection::Connection,
    error::Error,
    statement::Statement,
};

const DEFAULT_SAVEPOINT: &str = "quill_savepoint";

/// A guard that opens a transaction (or a savepoint when the session is
/// already inside an uncommitted transaction) and rolls it back unless
/// committed.
///
/// When an explicit [TransactionGuard::rollback] itself fails the guard
/// disconnects the session: a session whose rollback failed is in no state
/// worth keeping.
///
/// # Examples
/// ```no_run
/// use quill_postgres::{Connection, TransactionGuard};
///
/// # async fn run(conn: &mut Connection) -> Result<(), quill_postgres::Error> {
/// let tx = TransactionGuard::begin(conn).await?;
/// tx.connection().execute_text("INSERT INTO t VALUES (1)").await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct TransactionGuard<'c> {
    conn: &'c mut Connection,
    savepoint: Option<String>,
    open: bool,
}

impl<'c> TransactionGuard<'c> {
    /// Begins a transaction, or defines a savepoint named `quill_savepoint`
    /// when the session is already inside one.
    pub async fn begin(conn: &'c mut Connection) -> Result<Self, Error> {
        Self::with_savepoint_name(conn, DEFAULT_SAVEPOINT).await
    }

    /// Like [TransactionGuard::begin] with an explicit savepoint name for the
    /// subtransaction case.
    pub async fn with_savepoint_name(conn: &'c mut Connection, savepoint: impl Into<String>) -> Result<Self, Error> {
        let savepoint = conn.is_transaction_uncommitted().then(|| savepoint.into());

        match &savepoint {
            Some(name) => {
                let stmt = savepoint_stmt(r#"SAVEPOINT :"s""#, name)?;
                conn.execute(&stmt, &[]).await?;
            }
            None => {
                conn.execute_text("BEGIN").await?;
            }
        }

        Ok(Self {
            conn,
            savepoint,
            open: true,
        })
    }

    /// The guarded session. All work belonging to the transaction goes
    /// through it.
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// Mutable access to the guarded session, e.g. for opening a nested
    /// guard on it.
    pub fn connection_mut(&mut self) -> &mut Connection {
        self.conn
    }

    /// `true` when this guard manages a savepoint inside an enclosing
    /// transaction rather than a top level transaction.
    pub fn is_subtransaction(&self) -> bool {
        self.savepoint.is_some()
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    /// `true` until the guarded transaction was committed or rolled back.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Commits the transaction, or releases the savepoint of a
    /// subtransaction.
    pub async fn commit(mut self) -> Result<(), Error> {
        self.commit_with("COMMIT").await
    }

    /// Commits like [TransactionGuard::commit] and immediately begins a new
    /// transaction with the same characteristics. A subtransaction reopens
    /// its savepoint instead.
    pub async fn commit_and_chain(&mut self) -> Result<(), Error> {
        if !self.open {
            return Ok(());
        }
        match &self.savepoint {
            Some(name) => {
                let release = savepoint_stmt(r#"RELEASE :"s""#, name)?;
                self.conn.execute(&release, &[]).await?;
                let reopen = savepoint_stmt(r#"SAVEPOINT :"s""#, name)?;
                self.conn.execute(&reopen, &[]).await?;
            }
            None => {
                self.conn.execute_text("COMMIT AND CHAIN").await?;
            }
        }
        Ok(())
    }

    /// Rolls the transaction back (or rolls back to the savepoint),
    /// disconnecting the session when even that fails.
    pub async fn rollback(mut self) -> Result<(), Error> {
        self.open = false;
        let res = match &self.savepoint {
            Some(name) => {
                let stmt = savepoint_stmt(r#"ROLLBACK TO SAVEPOINT :"s""#, name)?;
                self.conn.execute(&stmt, &[]).await.map(|_| ())
            }
            None => self.conn.execute_text("ROLLBACK").await.map(|_| ()),
        };
        if res.is_err() {
            self.conn.disconnect();
        }
        res
    }

    async fn commit_with(&mut self, query: &str) -> Result<(), Error> {
        if !self.open {
            return Ok(());
        }
        match &self.savepoint {
            Some(name) => {
                let stmt = savepoint_stmt(r#"RELEASE :"s""#, name)?;
                self.conn.execute(&stmt, &[]).await?;
            }
            None => {
                self.conn.execute_text(query).await?;
            }
        }
        // a failed commit leaves the guard open so the drop path still rolls
        // the transaction back.
        self.open = false;
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        // best effort rollback. an explicit rollback() is the place where
        // failures can be observed.
        let sql = match &self.savepoint {
            Some(name) => match savepoint_stmt(r#"ROLLBACK TO SAVEPOINT :"s""#, name) {
                Ok(stmt) => match stmt.to_query_string() {
                    Ok(sql) => sql,
                    Err(_) => return,
                },
                Err(_) => return,
            },
            None => "ROLLBACK".to_string(),
        };
        if let Ok(inner) = self.conn.inner() {
            inner.do_send_when_idle(crate::driver::request::RequestKind::Query, |buf| {
                postgres_protocol::message::frontend::query(&sql, buf).map_err(Into::into)
            });
        }
    }
}

fn savepoint_stmt(template: &str, name: &str) -> Result<Statement, Error> {
    let mut stmt = Statement::try_from(template)?;
    stmt.bind("s", name.to_string())?;
    Ok(stmt)
}
