//! extra data carried in dollar quoted segments of comments adjacent to a statement.

use crate::{
    data::Data,
    error::{Error, StatementError},
};

use super::{Fragment, FragmentKind, is_blank};

/// An ordered collection of named [Data] fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple {
    fields: Vec<(Box<str>, Data)>,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The index of the first field named `name` at or past `offset`, or
    /// `None` when there is no such field.
    pub fn index_of(&self, name: &str, offset: usize) -> Option<usize> {
        self.fields
            .iter()
            .skip(offset)
            .position(|(n, _)| &**n == name)
            .map(|i| i + offset)
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(|(n, _)| &**n)
    }

    pub fn get(&self, index: usize) -> Option<&Data> {
        self.fields.get(index).map(|(_, d)| d)
    }

    /// The data of the first field named `name`.
    pub fn data(&self, name: &str) -> Option<&Data> {
        self.index_of(name, 0).and_then(|i| self.get(i))
    }

    /// Appends a field. Duplicate names are allowed; lookups resolve to the
    /// first occurrence unless an offset is given.
    pub fn add(&mut self, name: impl Into<Box<str>>, data: impl Into<Data>) -> &mut Self {
        self.fields.push((name.into(), data.into()));
        self
    }

    /// Moves all fields of `other` to the end of this tuple.
    pub fn append(&mut self, mut other: Tuple) -> &mut Self {
        self.fields.append(&mut other.fields);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Data)> {
        self.fields.iter().map(|(n, d)| (&**n, d))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CommentKind {
    OneLine,
    MultiLine,
}

/// Extracts `(tag, data)` associations from the statement's related comments.
///
/// Related comments are the run of comments separated from the first non blank
/// query text by at most one newline. Dollar quoted sequences inside their
/// joined text become tuple fields.
pub(crate) fn extract(fragments: &[Fragment]) -> Result<Tuple, Error> {
    let mut result = Tuple::new();
    for (text, kind) in joined_related_comments(fragments) {
        extract_from_comment(&text, kind, &mut result)?;
    }
    Ok(result)
}

// newlines separating a text fragment from what precedes it. a one line
// comment swallows its terminating newline, which still counts as separation.
fn separating_newlines(fragments: &[Fragment], index: usize) -> usize {
    let implicit = usize::from(index > 0 && fragments[index - 1].kind == FragmentKind::OneLineComment);
    let mut newlines = implicit;
    for c in fragments[index].str.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines > 1 {
                break;
            }
        } else if !c.is_whitespace() {
            break;
        }
    }
    newlines
}

// `true` when no more than one newline separates the fragment from the
// preceding one.
fn is_nearby(fragments: &[Fragment], index: usize) -> bool {
    separating_newlines(fragments, index) <= 1
}

// the runs of same kind comments that immediately precede the first
// significant fragment, joined into one string per run.
fn joined_related_comments(fragments: &[Fragment]) -> Vec<(String, CommentKind)> {
    // find the first fragment the comments could relate to. a parameter as the
    // first significant fragment means there is no related text at all.
    let Some(end) = fragments.iter().enumerate().position(|(i, f)| match f.kind {
        FragmentKind::Text => is_nearby(fragments, i) && !is_blank(&f.str),
        FragmentKind::OneLineComment | FragmentKind::MultiLineComment => false,
        _ => true,
    }) else {
        return Vec::new();
    };
    if end == 0 || fragments[end].kind != FragmentKind::Text {
        return Vec::new();
    }

    // walk back over the adjacent comment block.
    let mut start = end;
    for (i, f) in fragments[..end].iter().enumerate().rev() {
        if f.kind == FragmentKind::Text && !is_nearby(fragments, i) {
            break;
        }
        start = i;
    }

    let mut result = Vec::new();
    let mut i = start;
    while i < end {
        let kind = match fragments[i].kind {
            FragmentKind::OneLineComment => CommentKind::OneLine,
            FragmentKind::MultiLineComment => CommentKind::MultiLine,
            _ => {
                i += 1;
                continue;
            }
        };

        let mut joined = String::new();
        while i < end && comment_kind(&fragments[i]) == Some(kind) {
            joined.push_str(&fragments[i].str);
            if kind == CommentKind::OneLine {
                joined.push('\n');
            }
            i += 1;
        }
        result.push((joined, kind));
    }
    result
}

fn comment_kind(f: &Fragment) -> Option<CommentKind> {
    match f.kind {
        FragmentKind::OneLineComment => Some(CommentKind::OneLine),
        FragmentKind::MultiLineComment => Some(CommentKind::MultiLine),
        _ => None,
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

// scans the joined comment text for `$tag$content$tag$` associations.
fn extract_from_comment(input: &str, kind: CommentKind, out: &mut Tuple) -> Result<(), Error> {
    enum State {
        Top,
        Dollar,
        LeadingTag,
        Quote,
        QuoteDollar,
    }

    let mut state = State::Top;
    let mut content = String::new();
    let mut leading_tag = String::new();
    let mut trailing_tag = String::new();

    for c in input.chars() {
        match state {
            State::Top => {
                if c == '$' {
                    state = State::Dollar;
                }
            }
            State::Dollar => {
                if is_tag_char(c) {
                    state = State::LeadingTag;
                    leading_tag.push(c);
                }
            }
            State::LeadingTag => {
                if c == '$' {
                    state = State::Quote;
                } else if is_tag_char(c) {
                    leading_tag.push(c);
                } else {
                    return Err(StatementError::InvalidDollarQuoteTag.into());
                }
            }
            State::Quote => {
                if c == '$' {
                    state = State::QuoteDollar;
                } else {
                    content.push(c);
                }
            }
            State::QuoteDollar => {
                if c == '$' {
                    if leading_tag == trailing_tag {
                        state = State::Top;
                        let cleaned = cleaned_content(core::mem::take(&mut content), kind);
                        out.add(core::mem::take(&mut leading_tag), Data::text(cleaned));
                    } else {
                        state = State::Quote;
                    }
                    trailing_tag.clear();
                } else {
                    trailing_tag.push(c);
                }
            }
        }
    }

    match state {
        State::Top => Ok(()),
        _ => Err(StatementError::Unterminated("dollar quote in comment").into()),
    }
}

// split a line into its leading space count and the rest past a `* ` border
// marker. `Some((border, ""))` marks a line of nothing but the border.
fn border_split(line: &str) -> Option<(usize, &str)> {
    let border = line.len() - line.trim_start_matches(' ').len();
    let rest = &line[border..];
    let rest = rest.strip_prefix('*')?;
    match rest.strip_prefix(' ') {
        Some(rest) => Some((border, rest)),
        None => rest.trim_end_matches(' ').is_empty().then_some((border, "")),
    }
}

fn leading_spaces(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

fn is_blank_line(line: &str) -> bool {
    line.chars().all(|c| c == ' ' || c == '\t')
}

/// Removes the comment indentation of a multi line association content.
///
/// Content that begins with a non newline character is kept exactly as
/// provided. Otherwise lines are left aligned: lines sitting on the minimum
/// `* ` border lose the border, deeper lines keep their position relative to
/// it, and a plain block without borders is aligned to its least indented
/// line. Stripping never reaches into content. One leading and one trailing
/// newline are trimmed, interior newlines are preserved.
fn cleaned_content(content: String, kind: CommentKind) -> String {
    if !content.starts_with('\n') && !content.starts_with("\r\n") {
        return trim_edge_newlines(content);
    }

    let lines = content
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect::<Vec<_>>();
    // lines[0] is the (empty) run before the leading newline.
    let body = &lines[1..];

    let cleaned = match kind {
        CommentKind::MultiLine => {
            let mut min_border = None::<usize>;
            let mut min_plain = None::<usize>;
            for line in body {
                match border_split(line) {
                    Some((_, "")) => {}
                    Some((border, _)) => {
                        min_border = Some(min_border.map_or(border, |b| b.min(border)));
                    }
                    None if is_blank_line(line) => {}
                    None => {
                        let indent = leading_spaces(line);
                        min_plain = Some(min_plain.map_or(indent, |p| p.min(indent)));
                    }
                }
            }

            let strip = min_border.or(min_plain).unwrap_or(0);
            body.iter()
                .map(|line| match border_split(line) {
                    Some((_, "")) => "",
                    Some((border, rest)) if Some(border) == min_border => rest,
                    _ if is_blank_line(line) => "",
                    _ => &line[strip.min(leading_spaces(line))..],
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        CommentKind::OneLine => {
            let all_indented = body
                .iter()
                .filter(|l| !is_blank_line(l))
                .all(|l| l.starts_with(' '));
            let strip = usize::from(all_indented);
            body.iter()
                .map(|line| {
                    if is_blank_line(line) {
                        ""
                    } else {
                        &line[strip.min(leading_spaces(line))..]
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    };

    trim_edge_newlines(cleaned)
}

// removes at most one leading and one trailing `\r?\n`.
fn trim_edge_newlines(mut s: String) -> String {
    if s.starts_with('\r') {
        s.remove(0);
    }
    if s.starts_with('\n') {
        s.remove(0);
    }
    if s.ends_with('\n') {
        s.pop();
    }
    if s.ends_with('\r') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod test {
    use crate::Statement;

    use super::*;

    fn extra(s: &str) -> Tuple {
        Statement::try_from(s).unwrap().extra().unwrap()
    }

    #[test]
    fn related_and_unrelated_comments() {
        let t = extra(
            "-- $id$unrelated$id$\n\
             \n\
             -- $id$select-all$id$\n\
             SELECT * FROM t",
        );
        assert_eq!(t.len(), 1);
        assert_eq!(t.data("id").unwrap().as_str().unwrap(), "select-all");
    }

    #[test]
    fn comment_only_statement_has_no_related_comments() {
        let t = extra("-- $id$floating$id$\n   ");
        assert!(t.is_empty());
    }

    #[test]
    fn extraction_after_append() {
        let mut s = Statement::try_from("\n      /*\n       * $id$unknown-query$id$\n       */").unwrap();
        assert!(s.is_query_empty());
        assert!(s.extra().unwrap().is_empty());

        s.extra_mut().add("description", "This is an unknown query");
        assert_eq!(s.extra().unwrap().len(), 1);

        s.append(&Statement::try_from("SELECT 1").unwrap()).unwrap();
        let t = s.extra().unwrap();
        assert_eq!(t.len(), 2);
        assert!(t.index_of("description", 0).is_some());
        assert_eq!(t.data("id").unwrap().as_str().unwrap(), "unknown-query");
    }

    #[test]
    fn misaligned_multi_line_content() {
        let t = extra(
            "/*\n * $text1$\n   * one\n     * two\n   * three\n * $text1$\n */\nSELECT 1, 2, 3",
        );
        assert_eq!(t.data("text1").unwrap().as_str().unwrap(), "one\n  * two\nthree");
    }

    #[test]
    fn aligned_multi_line_content() {
        let t = extra(
            "/*\n * $text2$\n * one\n * two\n * three\n * $text2$\n */\nSELECT 1, 2, 3",
        );
        assert_eq!(t.data("text2").unwrap().as_str().unwrap(), "one\ntwo\nthree");
    }

    #[test]
    fn one_line_comment_sequence_content() {
        let t = extra(
            "-- $text3$\n--one\n-- two\n-- three\n-- $text3$\nSELECT 1, 2, 3",
        );
        assert_eq!(t.data("text3").unwrap().as_str().unwrap(), "one\n two\n three");
    }

    #[test]
    fn tag_charset() {
        let t = extra("-- $select-all_2$x$select-all_2$\nSELECT 1");
        assert_eq!(t.data("select-all_2").unwrap().as_str().unwrap(), "x");
    }

    #[test]
    fn dollar_inside_tag_is_rejected() {
        // the inner dollar terminates the opening tag early and the leftover
        // text forms a malformed quote.
        let s = Statement::try_from("-- $ta$g$x$ta$g$\nSELECT 1").unwrap();
        assert!(s.extra().is_err());
    }

    #[test]
    fn multiple_associations_in_one_comment_block() {
        let t = extra("-- $a$1$a$ and $b$2$b$\nSELECT 1");
        assert_eq!(t.len(), 2);
        assert_eq!(t.data("a").unwrap().as_str().unwrap(), "1");
        assert_eq!(t.data("b").unwrap().as_str().unwrap(), "2");
    }

    #[test]
    fn tuple_lookup_with_offset() {
        let mut t = Tuple::new();
        t.add("k", "1").add("other", "x").add("k", "2");
        assert_eq!(t.index_of("k", 0), Some(0));
        assert_eq!(t.index_of("k", 1), Some(2));
        assert_eq!(t.index_of("k", 3), None);
    }
}
