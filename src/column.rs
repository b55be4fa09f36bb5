//! column metadata of a query response.

use core::fmt;

use postgres_protocol::message::backend::Field;
use postgres_types::{Oid, Type};

use super::data::DataFormat;

/// Information about a column of a row set.
#[derive(Clone)]
pub struct Column {
    name: Box<str>,
    ty: Type,
    format: DataFormat,
    table_oid: Oid,
    table_column: i16,
    type_size: i16,
    type_modifier: i32,
}

impl Column {
    pub(crate) fn from_field(field: &Field<'_>) -> Self {
        Self {
            name: field.name().into(),
            ty: Type::from_oid(field.type_oid()).unwrap_or(Type::UNKNOWN),
            format: match field.format() {
                0 => DataFormat::Text,
                _ => DataFormat::Binary,
            },
            table_oid: field.table_oid(),
            table_column: field.column_id(),
            type_size: field.type_size(),
            type_modifier: field.type_modifier(),
        }
    }

    pub(crate) fn with_format(&self, format: DataFormat) -> Self {
        let mut column = self.clone();
        column.format = format;
        column
    }

    /// The name of the column.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type of the column.
    pub fn r#type(&self) -> &Type {
        &self.ty
    }

    /// The wire format the column's values are delivered in.
    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// The OID of the table the column originates from, or `0` for a computed
    /// column.
    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    /// The attribute number of the column in its table, or `0` for a computed
    /// column.
    pub fn table_column(&self) -> i16 {
        self.table_column
    }

    /// The size of the column type in bytes, negative for variable width types.
    pub fn type_size(&self) -> i16 {
        self.type_size
    }

    /// The type specific modifier of the column, e.g. the length limit of a
    /// `varchar(n)`.
    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("type", &self.ty)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}
