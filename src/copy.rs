//! scoped bulk transfer facade for `COPY ... FROM STDIN` / `COPY ... TO STDOUT`.

use std::sync::{Arc, Weak};

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::{backend, frontend};
use xitca_io::bytes::{Buf, Bytes};

use super::{
    connection::{Connection, with_timeout},
    data::DataFormat,
    driver::{
        codec::{Response, body_to_tag},
        request::RequestKind,
    },
    error::{Error, InvalidState},
    row::Completion,
    statement::Statement,
};

use crate::connection::ConnInner;

/// transfer direction of a running COPY, determined by the statement that
/// started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// `COPY ... FROM STDIN`: the client sends data rows.
    In,
    /// `COPY ... TO STDOUT`: the client receives data rows.
    Out,
}

/// A handle for the bulk data transfer of one COPY command.
///
/// The copier owns the data direction of its session until it is finished:
/// regular requests fail with a not-ready error while the copy is in
/// progress. Dropping an unfinished copy-in aborts the transfer.
pub struct Copier {
    conn: Weak<ConnInner>,
    res: Response,
    direction: CopyDirection,
    overall_format: DataFormat,
    formats: Box<[DataFormat]>,
    ended: bool,
}

impl Connection {
    /// Executes a COPY statement and returns the copier driving its data
    /// phase. Not available while pipelining.
    pub async fn copier(&self, stmt: &Statement) -> Result<Copier, Error> {
        let inner = self.inner()?;
        let sql = stmt.to_query_string()?;
        let mut res = inner.issue(RequestKind::Query, |buf, _| {
            frontend::query(&sql, buf).map_err(Into::into)
        })?;

        let fut = async {
            let (direction, overall, formats) = loop {
                let msg = res.recv().await?;
                match msg {
                    backend::Message::CopyInResponse(body) => {
                        let mut formats = body.column_formats();
                        break (CopyDirection::In, body.format(), collect_formats(&mut formats)?);
                    }
                    backend::Message::CopyOutResponse(body) => {
                        let mut formats = body.column_formats();
                        break (CopyDirection::Out, body.format(), collect_formats(&mut formats)?);
                    }
                    backend::Message::RowDescription(_) | backend::Message::DataRow(_) => {}
                    backend::Message::EmptyQueryResponse | backend::Message::CommandComplete(_) => {
                        return Err(InvalidState("statement started no copy").into());
                    }
                    _ => return Err(Error::unexpected()),
                }
            };
            Copier::new(inner, res, direction, overall, formats)
        };
        with_timeout(inner.wait_timeout(), fut).await
    }
}

fn collect_formats(
    formats: &mut backend::ColumnFormats<'_>,
) -> Result<Box<[DataFormat]>, Error> {
    let mut out = Vec::new();
    while let Some(raw) = formats.next()? {
        out.push(DataFormat::from_raw(raw)?);
    }
    Ok(out.into_boxed_slice())
}

impl Copier {
    fn new(
        conn: &Arc<ConnInner>,
        res: Response,
        direction: CopyDirection,
        overall_format: u8,
        formats: Box<[DataFormat]>,
    ) -> Result<Self, Error> {
        Ok(Self {
            conn: Arc::downgrade(conn),
            res,
            direction,
            overall_format: DataFormat::from_raw(overall_format.into())?,
            formats,
            ended: false,
        })
    }

    pub fn direction(&self) -> CopyDirection {
        self.direction
    }

    /// The count of columns being transferred.
    pub fn field_count(&self) -> usize {
        self.formats.len()
    }

    /// The format of the column at `index`. Always text for textual and csv
    /// copies.
    pub fn data_format(&self, index: usize) -> Option<DataFormat> {
        self.formats.get(index).copied()
    }

    /// The overall format of the copy stream.
    pub fn format(&self) -> DataFormat {
        self.overall_format
    }

    /// Sends a chunk of copy data. Only valid for a copy-in.
    ///
    /// Data is chunked at the sender's convenience; chunk boundaries carry no
    /// meaning for the server.
    pub fn send(&self, data: impl Buf) -> Result<(), Error> {
        if self.direction != CopyDirection::In || self.ended {
            return Err(InvalidState("copier is not sending").into());
        }
        let conn = self.conn()?;
        let data = frontend::CopyData::new(data)?;
        conn.send_one_way(|buf| {
            data.write(buf);
            Ok(())
        })
    }

    /// Finishes a copy-in and collects its completion. A non empty
    /// `error_message` makes the server fail the COPY instead, which surfaces
    /// as the resulting error.
    pub async fn end(mut self, error_message: Option<&str>) -> Result<Completion, Error> {
        if self.direction != CopyDirection::In {
            return Err(InvalidState("copier is not sending").into());
        }
        let conn = self.conn()?;
        self.ended = true;
        conn.send_one_way(|buf| {
            match error_message {
                Some(msg) if !msg.is_empty() => frontend::copy_fail(msg, buf)?,
                _ => frontend::copy_done(buf),
            }
            Ok(())
        })?;
        let timeout = conn.wait_timeout();
        with_timeout(timeout, self.completion()).await
    }

    /// Receives the next chunk of copy data of a copy-out. `None` marks the
    /// end of the transfer, after which [Copier::finish] collects the
    /// completion.
    pub async fn receive(&mut self) -> Result<Option<Bytes>, Error> {
        if self.direction != CopyDirection::Out {
            return Err(InvalidState("copier is not receiving").into());
        }
        if self.ended {
            return Ok(None);
        }
        match self.res.recv().await? {
            backend::Message::CopyData(body) => Ok(Some(body.into_bytes())),
            backend::Message::CopyDone => {
                self.ended = true;
                Ok(None)
            }
            _ => Err(Error::unexpected()),
        }
    }

    /// Drains the rest of a copy-out and returns its completion.
    pub async fn finish(mut self) -> Result<Completion, Error> {
        while self.receive().await?.is_some() {}
        let timeout = self.conn()?.wait_timeout();
        with_timeout(timeout, self.completion()).await
    }

    async fn completion(&mut self) -> Result<Completion, Error> {
        let mut completion = None;
        loop {
            match self.res.recv().await? {
                backend::Message::CommandComplete(body) => {
                    completion = Some(Completion::new(body_to_tag(&body)?));
                }
                backend::Message::CopyDone | backend::Message::CopyData(_) => {}
                backend::Message::ReadyForQuery(_) => {
                    return Ok(completion.unwrap_or_else(|| Completion::new("COPY")));
                }
                _ => return Err(Error::unexpected()),
            }
        }
    }

    fn conn(&self) -> Result<Arc<ConnInner>, Error> {
        self.conn
            .upgrade()
            .filter(|c| !c.is_closed())
            .ok_or_else(|| InvalidState("copier outlived its session").into())
    }
}

impl Drop for Copier {
    fn drop(&mut self) {
        // abort a copy-in left unfinished so the session does not hang in the
        // copy state.
        if self.direction == CopyDirection::In && !self.ended {
            if let Ok(conn) = self.conn() {
                conn.do_send(|buf| {
                    frontend::copy_fail("copy aborted by client", buf)?;
                    Ok(())
                });
            }
        }
    }
}
