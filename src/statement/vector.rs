//! ordered collection of statements parsed from a multi statement source.

use core::{fmt, ops::Index};

use crate::error::Error;

use super::Statement;

/// Statements of a multi statement SQL source, e.g. the content of a file with
/// several commands, each optionally tagged through dollar quoted comment
/// associations.
///
/// ```
/// use quill_postgres::StatementVector;
///
/// let sql = "-- $id$plus_one$id$\nSELECT :n + 1;\n\n-- $id$digit$id$\nSELECT 1";
/// let bunch = StatementVector::parse(sql).unwrap();
/// assert_eq!(bunch.index_of("id", "plus_one"), Some(0));
/// assert_eq!(bunch.index_of("id", "digit"), Some(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct StatementVector {
    statements: Vec<Statement>,
}

impl StatementVector {
    /// Parses the whole input, splitting on top level semicolons.
    ///
    /// Text following the last semicolon forms a trailing statement even when
    /// it only holds comments.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut statements = Vec::new();
        let mut rest = input;
        while !rest.is_empty() {
            let (stmt, consumed) = Statement::parse(rest)?;
            statements.push(stmt);
            rest = &rest[consumed..];
        }
        Ok(Self { statements })
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// The count of statements that carry an actual query, i.e. are not made
    /// of comments and blank text only.
    pub fn non_empty_count(&self) -> usize {
        self.statements.iter().filter(|s| !s.is_query_empty()).count()
    }

    /// The index of the first statement whose extra data has a field `name`
    /// with text value `value`.
    pub fn index_of(&self, name: &str, value: &str) -> Option<usize> {
        self.index_of_at(name, value, 0, 0)
    }

    /// Like [StatementVector::index_of], starting the statement lookup at
    /// `offset` and the per statement extra data lookup at `extra_offset`.
    ///
    /// Statements whose extra data fails to extract are skipped.
    pub fn index_of_at(&self, name: &str, value: &str, offset: usize, extra_offset: usize) -> Option<usize> {
        self.statements
            .iter()
            .enumerate()
            .skip(offset)
            .find(|(_, s)| {
                s.extra().is_ok_and(|extra| {
                    extra
                        .index_of(name, extra_offset)
                        .and_then(|i| extra.get(i))
                        .and_then(|d| d.as_str().ok().map(|v| v == value))
                        .unwrap_or(false)
                })
            })
            .map(|(i, _)| i)
    }

    pub fn get(&self, index: usize) -> Option<&Statement> {
        self.statements.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Statement> {
        self.statements.get_mut(index)
    }

    pub fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    /// Inserts `statement` before the statement at `index`.
    pub fn insert(&mut self, index: usize, statement: Statement) {
        self.statements.insert(index, statement);
    }

    pub fn remove(&mut self, index: usize) -> Statement {
        self.statements.remove(index)
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn into_vec(self) -> Vec<Statement> {
        self.statements
    }

    pub fn iter(&self) -> impl Iterator<Item = &Statement> {
        self.statements.iter()
    }
}

impl Index<usize> for StatementVector {
    type Output = Statement;

    fn index(&self, index: usize) -> &Self::Output {
        &self.statements[index]
    }
}

impl From<Vec<Statement>> for StatementVector {
    fn from(statements: Vec<Statement>) -> Self {
        Self { statements }
    }
}

impl fmt::Display for StatementVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, s) in self.statements.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            f.write_str(&s.to_text())?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for StatementVector {
    type Error = Error;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        Self::parse(input)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SOURCE: &str = "-- Comment 1 (comment of the empty statement)\n;\n\n\
                          -- Comment 2 (unrelated comment)\n\n\
                          -- Comment 3 (related comment)\n\
                          -- $id$plus_one$id$\n\
                          SELECT :n + 1;\n\n\
                          -- $id$digit$id$\n\
                          SELECT 1;\n\n\
                          -- A footer\n";

    #[test]
    fn splits_on_top_level_semicolons() {
        let bunch = StatementVector::parse(SOURCE).unwrap();
        assert_eq!(bunch.len(), 4);
        assert_eq!(bunch.non_empty_count(), 2);
        assert!(bunch[0].is_query_empty());
        assert!(!bunch[1].is_query_empty());
        assert!(bunch[3].is_query_empty());
    }

    #[test]
    fn lookup_by_extra_field() {
        let bunch = StatementVector::parse(SOURCE).unwrap();
        assert_eq!(bunch.index_of("id", "plus_one"), Some(1));
        assert_eq!(bunch.index_of("id", "digit"), Some(2));
        assert_eq!(bunch.index_of("id", "unknown"), None);

        let plus_one = &bunch[bunch.index_of("id", "plus_one").unwrap()];
        assert_eq!(plus_one.named_parameter_count(), 1);
        assert_eq!(plus_one.to_query_string().unwrap(), "\n\n\nSELECT $1 + 1");
    }

    #[test]
    fn offset_lookup() {
        let bunch = StatementVector::parse(
            "-- $id$a$id$\nSELECT 1;\n-- $id$a$id$\nSELECT 2",
        )
        .unwrap();
        assert_eq!(bunch.index_of("id", "a"), Some(0));
        assert_eq!(bunch.index_of_at("id", "a", 1, 0), Some(1));
        assert_eq!(bunch.index_of_at("id", "a", 2, 0), None);
    }

    #[test]
    fn mutation() {
        let mut bunch = StatementVector::parse("SELECT 1; SELECT 2").unwrap();
        assert_eq!(bunch.len(), 2);
        bunch.push(Statement::try_from("SELECT 3").unwrap());
        bunch.insert(0, Statement::try_from("SELECT 0").unwrap());
        assert_eq!(bunch.len(), 4);
        let removed = bunch.remove(0);
        assert_eq!(removed.to_text(), "SELECT 0");
        assert_eq!(bunch.len(), 3);
    }

    #[test]
    fn semicolons_inside_tokens_do_not_split() {
        let bunch = StatementVector::parse("SELECT ';'; SELECT \";\" , a[1;2]").unwrap();
        assert_eq!(bunch.len(), 2);
    }

    #[test]
    fn display_round_trips() {
        let bunch = StatementVector::parse("SELECT 1; -- t\nSELECT :a").unwrap();
        let rendered = bunch.to_string();
        let reparsed = StatementVector::parse(&rendered).unwrap();
        assert_eq!(reparsed.len(), bunch.len());
        assert_eq!(reparsed.to_string(), rendered);
    }
}
