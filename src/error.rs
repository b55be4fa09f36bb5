//! library error types with typed downcast based error handling

mod sql_state;

pub use postgres_types::{WasNull, WrongType};

pub use self::sql_state::SqlState;

use core::{
    convert::Infallible,
    fmt,
    ops::{Deref, DerefMut},
};

use std::{error, io};

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::ErrorFields;

/// public facing error type. providing basic format and display based error handling.
///
/// for typed based error handling runtime type cast is needed with the help of other
/// public error types offered by this module.
///
/// # Example
/// ```rust
/// use quill_postgres::error::{DriverDown, Error};
///
/// fn is_driver_down(e: Error) -> bool {
///     // downcast error to DriverDown error type to check if the session driver is gone.
///     e.downcast_ref::<DriverDown>().is_some()
/// }
/// ```
pub struct Error(Box<dyn error::Error + Send + Sync>);

impl Error {
    /// `true` when the session driver task is gone and the connection is unusable.
    pub fn is_driver_down(&self) -> bool {
        self.0.is::<DriverDown>() || self.0.is::<DriverDownReceiving>()
    }

    /// `true` when the error is a server reported error with the given SQLSTATE code.
    pub fn is_sql_state(&self, state: &SqlState) -> bool {
        self.downcast_ref::<DbError>().is_some_and(|e| e.code() == state)
    }

    pub(crate) fn db(fields: &mut ErrorFields<'_>) -> Self {
        match DbError::parse(fields) {
            Ok(e) => Self(Box::new(e)),
            Err(e) => Self(Box::new(e)),
        }
    }

    pub(crate) fn unexpected() -> Self {
        Self(Box::new(UnexpectedMessage))
    }
}

impl Deref for Error {
    type Target = dyn error::Error + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for Error {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

macro_rules! from_impl {
    ($ty:ty) => {
        impl From<$ty> for Error {
            fn from(e: $ty) -> Self {
                Self(Box::new(e))
            }
        }
    };
}

/// error indicate the session driver task is dropped and can't be accessed anymore when
/// sending a request to it.
///
/// a database query related to this error has not been sent to database and it's safe to
/// retry the operation if desired.
#[derive(Debug, Default)]
pub struct DriverDown;

impl fmt::Display for DriverDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection lost. driver task is dropped and unaccessible")
    }
}

impl error::Error for DriverDown {}

from_impl!(DriverDown);

/// error indicate the session driver task is dropped and can't be accessed anymore when
/// receiving a response from server.
///
/// all mid flight responses and unfinished response data are lost. a database query related
/// to this error may or may not have executed successfully and must not be retried blindly.
#[derive(Debug)]
pub struct DriverDownReceiving;

impl fmt::Display for DriverDownReceiving {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection lost. response data is unrecoverable")
    }
}

impl error::Error for DriverDownReceiving {}

from_impl!(DriverDownReceiving);

/// error indicate an operation did not finish within its time budget.
///
/// the session state is not mutated beyond buffered partial input and the operation
/// may be retried with a larger budget.
#[derive(Debug)]
pub struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl error::Error for TimedOut {}

from_impl!(TimedOut);

/// error indicate a request can not be issued in the current session state:
/// a response of a previous request is still pending while pipeline is disabled,
/// or the pipeline is in aborted state.
#[derive(Debug)]
pub struct NotReadyForRequest;

impl fmt::Display for NotReadyForRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("session is not ready for another request")
    }
}

impl error::Error for NotReadyForRequest {}

from_impl!(NotReadyForRequest);

/// error indicate a pipelined request was discarded because an earlier request in the
/// same pipeline failed. the session recovers once the next synchronization point is
/// drained.
#[derive(Debug)]
pub struct PipelineAborted;

impl fmt::Display for PipelineAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pipeline is aborted by an earlier error")
    }
}

impl error::Error for PipelineAborted {}

from_impl!(PipelineAborted);

/// error indicate an operation that requires an idle session was called while requests
/// are in flight. e.g. toggling pipeline mode mid query.
#[derive(Debug)]
pub struct Busy;

impl fmt::Display for Busy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("session is busy with uncompleted requests")
    }
}

impl error::Error for Busy {}

from_impl!(Busy);

/// error indicate a handle (prepared statement, large object) is used after the session
/// it belongs to was closed or reconnected, or an operation was called in a wrong state
/// (e.g. copy operation outside of COPY).
#[derive(Debug)]
pub struct InvalidState(pub(crate) &'static str);

impl fmt::Display for InvalidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid state: {}", self.0)
    }
}

impl error::Error for InvalidState {}

from_impl!(InvalidState);

/// error produced by the statement preparser and the parameter binding engine.
#[derive(Debug, PartialEq, Eq)]
pub enum StatementError {
    /// positional parameter index is outside of `[1, 65535]` range.
    InvalidParameterPosition(String),
    /// total count of positional slots and distinct named parameters exceeds 65535.
    TooManyParameters(usize),
    /// dollar quote tag contains invalid characters.
    InvalidDollarQuoteTag,
    /// input ended inside a quoted region, comment or dollar quote.
    Unterminated(&'static str),
    /// statement references positional slots that no fragment provides.
    MissingParameters,
    /// named parameter is not part of the statement.
    UnknownParameter(String),
    /// named parameter name must contain at least one letter.
    InvalidParameterName(String),
    /// quoted named parameter has no bound value to render.
    UnboundParameter(String),
    /// named argument appears before a positional one in an argument list.
    InvalidArgumentOrder,
    /// statement name must not be empty for this operation.
    EmptyName,
}

impl fmt::Display for StatementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameterPosition(pos) => write!(f, "invalid parameter position \"{pos}\""),
            Self::TooManyParameters(count) => {
                write!(f, "parameter count ({count}) exceeds the maximum (65535)")
            }
            Self::InvalidDollarQuoteTag => f.write_str("invalid dollar quote tag"),
            Self::Unterminated(what) => write!(f, "invalid SQL input. unterminated {what}"),
            Self::MissingParameters => f.write_str("statement has missing positional parameters"),
            Self::UnknownParameter(name) => write!(f, "no parameter \"{name}\" in statement"),
            Self::InvalidParameterName(name) => write!(f, "invalid parameter name \"{name}\""),
            Self::UnboundParameter(name) => write!(f, "no value bound to parameter \"{name}\""),
            Self::InvalidArgumentOrder => {
                f.write_str("named arguments must not precede positional arguments")
            }
            Self::EmptyName => f.write_str("name must not be empty"),
        }
    }
}

impl error::Error for StatementError {}

from_impl!(StatementError);

/// error indicate a [`Data`] value can not be interpreted in the requested format.
///
/// [`Data`]: crate::data::Data
#[derive(Debug)]
pub struct InvalidDataFormat;

impl fmt::Display for InvalidDataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid data format")
    }
}

impl error::Error for InvalidDataFormat {}

from_impl!(InvalidDataFormat);

/// error happens when library user failed to provide valid authentication info to database server.
#[derive(Debug)]
pub enum AuthenticationError {
    MissingUserName,
    MissingPassWord,
    WrongPassWord,
    UnsupportedMechanism,
    /// server requires channel binding but the transport can not offer it,
    /// or the `channel_binding` option forbids what the server offers.
    ChannelBinding,
    /// unix socket peer does not run as the user required by the configuration.
    PeerUserMismatch,
}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MissingUserName => f.write_str("username is missing")?,
            Self::MissingPassWord => f.write_str("password is missing")?,
            Self::WrongPassWord => f.write_str("password is wrong")?,
            Self::UnsupportedMechanism => f.write_str("no supported SASL mechanism offered")?,
            Self::ChannelBinding => f.write_str("channel binding requirement can not be satisfied")?,
            Self::PeerUserMismatch => f.write_str("unix socket peer user does not match")?,
        }
        f.write_str(" for authentication")
    }
}

impl error::Error for AuthenticationError {}

from_impl!(AuthenticationError);

#[non_exhaustive]
#[derive(Debug)]
pub enum SystemError {
    Unix,
}

impl fmt::Display for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Unix => f.write_str("unix")?,
        }
        f.write_str(" system is not available")
    }
}

impl error::Error for SystemError {}

from_impl!(SystemError);

/// error indicate functionality the library knows about but does not implement.
#[non_exhaustive]
#[derive(Debug)]
pub enum FeatureError {
    Tls,
    Kerberos,
}

impl fmt::Display for FeatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Tls => f.write_str("tls feature is not enabled"),
            Self::Kerberos => f.write_str("kerberos authentication is not implemented"),
        }
    }
}

impl error::Error for FeatureError {}

from_impl!(FeatureError);

#[derive(Debug)]
pub struct UnexpectedMessage;

impl fmt::Display for UnexpectedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unexpected message from database")
    }
}

impl error::Error for UnexpectedMessage {}

from_impl!(UnexpectedMessage);

impl From<Infallible> for Error {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self(Box::new(e))
    }
}

impl From<WrongType> for Error {
    fn from(e: WrongType) -> Self {
        Self(Box::new(e))
    }
}

impl From<Box<dyn error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn error::Error + Send + Sync>) -> Self {
        Self(e)
    }
}

#[cold]
#[inline(never)]
pub(crate) fn unexpected_eof_err() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "zero byte read. remote close connection unexpectedly",
    )
}

/// A Postgres error or notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    severity: String,
    parsed_severity: Option<Severity>,
    code: SqlState,
    message: String,
    detail: Option<String>,
    hint: Option<String>,
    position: Option<ErrorPosition>,
    where_: Option<String>,
    schema: Option<String>,
    table: Option<String>,
    column: Option<String>,
    datatype: Option<String>,
    constraint: Option<String>,
    file: Option<String>,
    line: Option<u32>,
    routine: Option<String>,
}

impl DbError {
    #[cold]
    #[inline(never)]
    pub(crate) fn parse(fields: &mut ErrorFields<'_>) -> io::Result<DbError> {
        let mut severity = None;
        let mut parsed_severity = None;
        let mut code = None;
        let mut message = None;
        let mut detail = None;
        let mut hint = None;
        let mut normal_position = None;
        let mut internal_position = None;
        let mut internal_query = None;
        let mut where_ = None;
        let mut schema = None;
        let mut table = None;
        let mut column = None;
        let mut datatype = None;
        let mut constraint = None;
        let mut file = None;
        let mut line = None;
        let mut routine = None;

        while let Some(field) = fields.next()? {
            let value = String::from_utf8_lossy(field.value_bytes());
            match field.type_() {
                b'S' => severity = Some(value.into_owned()),
                b'C' => code = Some(SqlState::from_code(&value)),
                b'M' => message = Some(value.into_owned()),
                b'D' => detail = Some(value.into_owned()),
                b'H' => hint = Some(value.into_owned()),
                b'P' => {
                    normal_position = Some(value.parse::<u32>().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "`P` field did not contain an integer")
                    })?);
                }
                b'p' => {
                    internal_position = Some(value.parse::<u32>().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "`p` field did not contain an integer")
                    })?);
                }
                b'q' => internal_query = Some(value.into_owned()),
                b'W' => where_ = Some(value.into_owned()),
                b's' => schema = Some(value.into_owned()),
                b't' => table = Some(value.into_owned()),
                b'c' => column = Some(value.into_owned()),
                b'd' => datatype = Some(value.into_owned()),
                b'n' => constraint = Some(value.into_owned()),
                b'F' => file = Some(value.into_owned()),
                b'L' => {
                    line = Some(value.parse::<u32>().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "`L` field did not contain an integer")
                    })?);
                }
                b'R' => routine = Some(value.into_owned()),
                b'V' => {
                    parsed_severity = Some(Severity::from_str(&value).ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidInput, "`V` field contained an invalid value")
                    })?);
                }
                _ => {}
            }
        }

        Ok(DbError {
            severity: severity.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "`S` field missing"))?,
            parsed_severity,
            code: code.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "`C` field missing"))?,
            message: message.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "`M` field missing"))?,
            detail,
            hint,
            position: match normal_position {
                Some(position) => Some(ErrorPosition::Original(position)),
                None => match internal_position {
                    Some(position) => Some(ErrorPosition::Internal {
                        position,
                        query: internal_query.ok_or_else(|| {
                            io::Error::new(io::ErrorKind::InvalidInput, "`q` field missing but `p` field present")
                        })?,
                    }),
                    None => None,
                },
            },
            where_,
            schema,
            table,
            column,
            datatype,
            constraint,
            file,
            line,
            routine,
        })
    }

    /// The field contents are ERROR, FATAL, or PANIC (in an error message),
    /// or WARNING, NOTICE, DEBUG, INFO, or LOG (in a notice message), or a
    /// localized translation of one of these.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// A parsed, nonlocalized version of `severity`. (PostgreSQL 9.6+)
    pub fn parsed_severity(&self) -> Option<Severity> {
        self.parsed_severity
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &SqlState {
        &self.code
    }

    /// The primary human-readable error message.
    ///
    /// This should be accurate but terse (typically one line).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// An optional secondary error message carrying more detail about the
    /// problem.
    ///
    /// Might run to multiple lines.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// An optional suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// An optional error cursor position into either the original query string
    /// or an internally generated query.
    pub fn position(&self) -> Option<&ErrorPosition> {
        self.position.as_ref()
    }

    /// An indication of the context in which the error occurred.
    pub fn where_(&self) -> Option<&str> {
        self.where_.as_deref()
    }

    /// If the error was associated with a specific database object, the name
    /// of the schema containing that object, if any. (PostgreSQL 9.3+)
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// If the error was associated with a specific table, the name of the
    /// table. (PostgreSQL 9.3+)
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// If the error was associated with a specific table column, the name of
    /// the column.
    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    /// If the error was associated with a specific data type, the name of the
    /// data type. (PostgreSQL 9.3+)
    pub fn datatype(&self) -> Option<&str> {
        self.datatype.as_deref()
    }

    /// If the error was associated with a specific constraint, the name of the
    /// constraint. (PostgreSQL 9.3+)
    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    /// The file name of the source-code location where the error was reported.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// The line number of the source-code location where the error was
    /// reported.
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// The name of the source-code routine reporting the error.
    pub fn routine(&self) -> Option<&str> {
        self.routine.as_deref()
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: {}", self.severity, self.message)?;
        if let Some(detail) = &self.detail {
            write!(fmt, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(fmt, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl error::Error for DbError {}

from_impl!(DbError);

/// The severity of a Postgres error or notice.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Severity {
    /// PANIC
    Panic,
    /// FATAL
    Fatal,
    /// ERROR
    Error,
    /// WARNING
    Warning,
    /// NOTICE
    Notice,
    /// DEBUG
    Debug,
    /// INFO
    Info,
    /// LOG
    Log,
}

impl fmt::Display for Severity {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Severity::Panic => "PANIC",
            Severity::Fatal => "FATAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Log => "LOG",
        };
        fmt.write_str(s)
    }
}

impl Severity {
    fn from_str(s: &str) -> Option<Severity> {
        match s {
            "PANIC" => Some(Severity::Panic),
            "FATAL" => Some(Severity::Fatal),
            "ERROR" => Some(Severity::Error),
            "WARNING" => Some(Severity::Warning),
            "NOTICE" => Some(Severity::Notice),
            "DEBUG" => Some(Severity::Debug),
            "INFO" => Some(Severity::Info),
            "LOG" => Some(Severity::Log),
            _ => None,
        }
    }
}

/// Represents the position of an error in a query.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ErrorPosition {
    /// A position in the original query.
    Original(u32),
    /// A position in an internally generated query.
    Internal {
        /// The byte position.
        position: u32,
        /// A query generated by the Postgres server.
        query: String,
    },
}
