//! client side handles of server prepared statements.

use std::sync::{Arc, Weak};

use postgres_types::Type;

use super::{
    connection::ConnInner,
    data::{Data, DataFormat},
    driver::request::RequestKind,
    error::{Error, InvalidState, StatementError},
    query::RowStream,
    row::{Completion, RowInfo},
    statement::{MAX_PARAMETER_COUNT, Statement},
};

/// an argument of a statement execution or a routine invocation.
///
/// named arguments address a named parameter of the statement or routine and
/// may not precede positional ones.
pub enum Arg {
    Positional(Option<Data>),
    Named(Box<str>, Option<Data>),
}

impl Arg {
    pub fn new(value: impl Into<Data>) -> Self {
        Self::Positional(Some(value.into()))
    }

    pub fn null() -> Self {
        Self::Positional(None)
    }

    pub fn named(name: impl Into<Box<str>>, value: impl Into<Data>) -> Self {
        Self::Named(name.into(), Some(value.into()))
    }

    pub fn named_null(name: impl Into<Box<str>>) -> Self {
        Self::Named(name.into(), None)
    }
}

impl<T> From<T> for Arg
where
    T: Into<Data>,
{
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

// distributes arguments over the parameter slots of the generated query:
// positional arguments fill slots left to right, named arguments address the
// statement's named parameters. unfilled slots execute as null.
pub(crate) fn bind_args(stmt: &Statement, args: &[Arg]) -> Result<Vec<Option<Data>>, Error> {
    let mut values: Vec<Option<Data>> = vec![None; stmt.query_parameter_count()];

    let mut named_seen = false;
    let mut next = 0usize;
    for arg in args {
        match arg {
            Arg::Positional(value) => {
                if named_seen {
                    return Err(StatementError::InvalidArgumentOrder.into());
                }
                let slot = values
                    .get_mut(next)
                    .ok_or_else(|| StatementError::InvalidParameterPosition((next + 1).to_string()))?;
                *slot = value.clone();
                next += 1;
            }
            Arg::Named(name, value) => {
                named_seen = true;
                let idx = stmt
                    .query_parameter_index(name)
                    .ok_or_else(|| StatementError::UnknownParameter(name.to_string()))?;
                values[idx] = value.clone();
            }
        }
    }

    Ok(values)
}

#[derive(Clone)]
pub(crate) struct ParamSlot {
    pub(crate) name: Option<Box<str>>,
    pub(crate) ty: Option<Type>,
    value: Option<Option<Data>>,
}

impl ParamSlot {
    fn unbound(name: Option<Box<str>>, ty: Option<Type>) -> Self {
        Self { name, ty, value: None }
    }

    pub(crate) fn described(name: Option<Box<str>>, ty: Type) -> Self {
        Self::unbound(name, Some(ty))
    }
}

/// A handle of a statement prepared on a particular session.
///
/// The handle stays bound to the session that prepared it: it is invalidated
/// when that session is closed or reconnected, surfacing as an invalid state
/// error on use.
///
/// Two kinds exist. A *preparsed* handle originates from a [Statement] and
/// knows its parameter names before the server describes anything. An *opaque*
/// handle originates from a describe request and knows only what the server
/// reported.
#[derive(Clone)]
pub struct PreparedStatement {
    name: Box<str>,
    conn: Weak<ConnInner>,
    epoch: u64,
    preparsed: bool,
    described: bool,
    params: Vec<ParamSlot>,
    result_format: DataFormat,
    row_info: Option<Arc<RowInfo>>,
}

impl PreparedStatement {
    pub(crate) fn new(
        name: Box<str>,
        conn: &Arc<ConnInner>,
        preparsed: bool,
        described: bool,
        params: Vec<ParamSlot>,
        row_info: Option<Arc<RowInfo>>,
    ) -> Self {
        Self {
            name,
            conn: Arc::downgrade(conn),
            epoch: conn.epoch(),
            preparsed,
            described,
            params,
            result_format: conn.result_format(),
            row_info,
        }
    }

    /// The server side name of the statement. Empty for the unnamed statement.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` while the owning session is alive and has not been reconnected
    /// since this handle was created.
    pub fn is_valid(&self) -> bool {
        self.conn().is_ok()
    }

    /// `true` when the parameter schema came from client side statement
    /// parsing rather than a server describe response.
    pub fn is_preparsed(&self) -> bool {
        self.preparsed
    }

    /// `true` once a describe response attached row metadata and parameter
    /// types to the handle.
    pub fn is_described(&self) -> bool {
        self.described
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    pub fn parameter_name(&self, index: usize) -> Option<&str> {
        self.params.get(index).and_then(|p| p.name.as_deref())
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name.as_deref() == Some(name))
    }

    /// The server reported type of the parameter at `index`. `None` before the
    /// statement is described.
    pub fn parameter_type(&self, index: usize) -> Option<&Type> {
        self.params.get(index).and_then(|p| p.ty.as_ref())
    }

    /// Metadata of the rows this statement produces, `None` when it produces
    /// no rows or is not yet described.
    pub fn row_info(&self) -> Option<&Arc<RowInfo>> {
        self.row_info.as_ref()
    }

    /// The format the server delivers result values in when this statement is
    /// executed.
    pub fn result_format(&self) -> DataFormat {
        self.result_format
    }

    pub fn set_result_format(&mut self, format: DataFormat) -> &mut Self {
        self.result_format = format;
        self
    }

    /// Binds the parameter at `index` to `value`.
    ///
    /// An opaque statement grows its parameter list when `index` is past the
    /// current end; a preparsed one rejects indexes beyond its known schema.
    pub fn bind(&mut self, index: usize, value: impl Into<Data>) -> Result<&mut Self, Error> {
        self.bind_slot(index, Some(value.into()))
    }

    /// Binds the parameter at `index` to SQL `NULL`.
    pub fn bind_null(&mut self, index: usize) -> Result<&mut Self, Error> {
        self.bind_slot(index, None)
    }

    pub fn bind_named(&mut self, name: &str, value: impl Into<Data>) -> Result<&mut Self, Error> {
        let index = self
            .parameter_index(name)
            .ok_or_else(|| StatementError::UnknownParameter(name.to_string()))?;
        self.bind_slot(index, Some(value.into()))
    }

    pub fn bind_named_null(&mut self, name: &str) -> Result<&mut Self, Error> {
        let index = self
            .parameter_index(name)
            .ok_or_else(|| StatementError::UnknownParameter(name.to_string()))?;
        self.bind_slot(index, None)
    }

    fn bind_slot(&mut self, index: usize, value: Option<Data>) -> Result<&mut Self, Error> {
        if index >= self.params.len() {
            if self.preparsed || index >= MAX_PARAMETER_COUNT {
                return Err(StatementError::InvalidParameterPosition((index + 1).to_string()).into());
            }
            self.params
                .resize_with(index + 1, || ParamSlot::unbound(None, None));
        }
        self.params[index].value = Some(value);
        Ok(self)
    }

    /// The value bound at `index`: `None` when unbound, `Some(None)` for a
    /// bound SQL `NULL`.
    pub fn bound(&self, index: usize) -> Option<Option<&Data>> {
        self.params
            .get(index)
            .and_then(|p| p.value.as_ref())
            .map(|v| v.as_ref())
    }

    /// Enqueues an execution of this statement with its currently bound
    /// parameters, returning the row stream of the response. Unbound
    /// parameters execute as SQL `NULL`.
    pub fn send_execute(&self) -> Result<RowStream, Error> {
        let conn = self.conn()?;
        let values = self
            .params
            .iter()
            .map(|p| p.value.clone().unwrap_or(None))
            .collect::<Vec<_>>();
        let res = conn.issue(RequestKind::Execute, |buf, sync| {
            crate::connection::encode_execute(buf, &self.name, &values, self.result_format, sync)
        })?;
        let info = self.row_info.as_ref().map(|i| i.with_format(self.result_format));
        Ok(RowStream::new(res, info, Some(self.result_format)))
    }

    /// Executes the statement and returns its completion, discarding any rows.
    pub async fn execute(&self) -> Result<Completion, Error> {
        let stream = self.send_execute()?;
        let timeout = self.conn()?.wait_timeout();
        crate::connection::with_timeout(timeout, stream.complete()).await
    }

    pub(crate) fn conn(&self) -> Result<Arc<ConnInner>, Error> {
        self.conn
            .upgrade()
            .filter(|c| c.epoch() == self.epoch && !c.is_closed())
            .ok_or_else(|| InvalidState("statement outlived the session that prepared it").into())
    }
}

impl core::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("name", &self.name)
            .field("preparsed", &self.preparsed)
            .field("described", &self.described)
            .field("parameter_count", &self.params.len())
            .finish_non_exhaustive()
    }
}
