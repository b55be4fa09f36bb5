//! typed response carriers: row metadata, rows and command completions.

use core::{fmt, ops::Range};

use std::sync::Arc;

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::{DataRowBody, RowDescriptionBody};
use postgres_types::{FromSql, Type};

use super::{
    column::Column,
    data::DataView,
    error::{Error, InvalidState, WrongType},
};

/// Metadata of a row set, produced from the server's row description.
///
/// Shared by every [Row] of the same response through reference counting.
pub struct RowInfo {
    columns: Box<[Column]>,
}

impl RowInfo {
    pub(crate) fn parse(body: &RowDescriptionBody) -> Result<Arc<Self>, Error> {
        let mut columns = Vec::new();
        let mut fields = body.fields();
        while let Some(field) = fields.next()? {
            columns.push(Column::from_field(&field));
        }
        Ok(Arc::new(Self {
            columns: columns.into_boxed_slice(),
        }))
    }

    pub(crate) fn from_columns(columns: Vec<Column>) -> Arc<Self> {
        Arc::new(Self {
            columns: columns.into_boxed_slice(),
        })
    }

    pub(crate) fn empty() -> Arc<Self> {
        Arc::new(Self { columns: Box::new([]) })
    }

    // a row description reports the value format only as "not decided yet";
    // the format actually delivered is the one the execution asked for.
    pub(crate) fn with_format(&self, format: crate::data::DataFormat) -> Arc<Self> {
        Self::from_columns(self.columns.iter().map(|c| c.with_format(format)).collect())
    }

    /// The count of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// The index of the first column named `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }
}

impl fmt::Debug for RowInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowInfo").field("columns", &self.columns).finish()
    }
}

/// A column address: either a zero based index or a column name.
pub trait RowIndex {
    #[doc(hidden)]
    fn __index(&self, info: &RowInfo) -> Option<usize>;
}

impl RowIndex for usize {
    fn __index(&self, info: &RowInfo) -> Option<usize> {
        (*self < info.len()).then_some(*self)
    }
}

impl RowIndex for &str {
    fn __index(&self, info: &RowInfo) -> Option<usize> {
        info.index_of(self)
    }
}

impl<T> RowIndex for &T
where
    T: RowIndex + ?Sized,
{
    fn __index(&self, info: &RowInfo) -> Option<usize> {
        T::__index(self, info)
    }
}

/// A row of data returned from the database by a query.
///
/// The row holds a reference counted handle to the response buffer it was
/// parsed from and stays valid after the stream that produced it advances.
pub struct Row {
    info: Arc<RowInfo>,
    body: DataRowBody,
    ranges: Box<[Option<Range<usize>>]>,
}

impl Row {
    pub(crate) fn try_new(info: Arc<RowInfo>, body: DataRowBody) -> Result<Self, Error> {
        let mut ranges = Vec::with_capacity(info.len());
        let mut iter = body.ranges();
        while let Some(range) = iter.next()? {
            ranges.push(range);
        }
        Ok(Self {
            info,
            body,
            ranges: ranges.into_boxed_slice(),
        })
    }

    /// Returns information about the columns of data in the row.
    pub fn info(&self) -> &Arc<RowInfo> {
        &self.info
    }

    pub fn columns(&self) -> &[Column] {
        self.info.columns()
    }

    /// Determines if the row contains no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of values in the row.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// A zero copy view of the raw value at `idx`, or `None` for SQL `NULL`.
    ///
    /// # Panics
    ///
    /// Panics when `idx` addresses no column of the row.
    pub fn data(&self, idx: impl RowIndex + fmt::Display) -> Option<DataView<'_>> {
        self.try_data(&idx)
            .unwrap_or_else(|e| panic!("error retrieving column {idx}: {e}"))
    }

    /// Like [Row::data], but returns an error instead of panicking.
    pub fn try_data(&self, idx: impl RowIndex + fmt::Display) -> Result<Option<DataView<'_>>, Error> {
        let idx = idx.__index(&self.info).ok_or(InvalidState("no such column"))?;
        let format = self.info.columns()[idx].format();
        Ok(self
            .col_buffer(idx)
            .map(|bytes| DataView::new(bytes, format)))
    }

    /// Deserializes a value from the row.
    ///
    /// The value can be specified either by its numeric index in the row, or by its column name.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds or if the value cannot be converted to the specified type.
    pub fn get<'s, T>(&'s self, idx: impl RowIndex + fmt::Display) -> T
    where
        T: FromSql<'s>,
    {
        self.try_get(&idx)
            .unwrap_or_else(|e| panic!("error retrieving column {idx}: {e}"))
    }

    /// Like [Row::get], but returns a `Result` rather than panicking.
    pub fn try_get<'s, T>(&'s self, idx: impl RowIndex + fmt::Display) -> Result<T, Error>
    where
        T: FromSql<'s>,
    {
        let idx = idx.__index(&self.info).ok_or(InvalidState("no such column"))?;
        let ty = self.info.columns()[idx].r#type();

        if !T::accepts(ty) {
            return Err(WrongType::new::<T>(ty.clone()).into());
        }

        FromSql::from_sql_nullable(ty, self.col_buffer(idx)).map_err(Error::from)
    }

    /// The raw text of the value at `idx` for responses delivered in text
    /// format, e.g. rows of a simple query.
    pub fn text(&self, idx: impl RowIndex + fmt::Display) -> Result<Option<&str>, Error> {
        let idx = idx.__index(&self.info).ok_or(InvalidState("no such column"))?;
        FromSql::from_sql_nullable(&Type::TEXT, self.col_buffer(idx)).map_err(Error::from)
    }

    fn col_buffer(&self, idx: usize) -> Option<&[u8]> {
        self.ranges[idx].clone().map(|range| &self.body.buffer()[range])
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row").field("columns", &self.columns()).finish()
    }
}

/// The completion tag of an executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    tag: Box<str>,
}

impl Completion {
    pub(crate) fn new(tag: impl Into<Box<str>>) -> Self {
        Self { tag: tag.into() }
    }

    /// The full command tag as reported by the server, e.g. `INSERT 0 3`.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The operation of the tag, e.g. `SELECT` for `SELECT 3`.
    pub fn operation(&self) -> &str {
        let tag = self.tag.trim_end_matches(|c: char| c.is_ascii_digit() || c == ' ');
        if tag.is_empty() {
            &self.tag
        } else {
            tag
        }
    }

    /// The count of rows affected by the command, when the tag carries one.
    pub fn rows_affected(&self) -> Option<u64> {
        self.tag.rsplit(' ').next().and_then(|last| last.parse().ok())
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

#[cfg(test)]
mod test {
    use super::Completion;

    #[test]
    fn completion_tags() {
        let c = Completion::new("INSERT 0 3");
        assert_eq!(c.operation(), "INSERT");
        assert_eq!(c.rows_affected(), Some(3));

        let c = Completion::new("SELECT 42");
        assert_eq!(c.operation(), "SELECT");
        assert_eq!(c.rows_affected(), Some(42));

        let c = Completion::new("CREATE TABLE");
        assert_eq!(c.operation(), "CREATE TABLE");
        assert_eq!(c.rows_affected(), None);
    }
}
