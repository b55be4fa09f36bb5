//! SQL statement preparser.
//!
//! A dollar sign (`$`) followed by digits denotes a parameter with an explicit
//! position. A colon (`:`) followed by an identifier denotes a named parameter
//! with an automatically assigned position. Quoting the name of a named
//! parameter with single or double quotes makes the bound value render as a
//! quoted literal or a quoted identifier when the query string is generated.
//!
//! ```
//! use quill_postgres::Statement;
//!
//! let stmt = Statement::try_from("SELECT $1::int, :name::text").unwrap();
//! assert_eq!(stmt.positional_parameter_count(), 1);
//! assert_eq!(stmt.named_parameter_count(), 1);
//! assert_eq!(stmt.to_query_string().unwrap(), "SELECT $1::int, $2::text");
//! ```

mod extra;
mod vector;

pub use extra::Tuple;
pub use vector::StatementVector;

use core::fmt;

use super::error::{Error, StatementError};

/// Hard cap of the extended protocol. Positional parameter indices and the
/// total parameter count must stay within it.
pub const MAX_PARAMETER_COUNT: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragmentKind {
    Text,
    OneLineComment,
    MultiLineComment,
    PositionalParameter,
    NamedParameter,
    NamedParameterLiteral,
    NamedParameterIdentifier,
}

impl FragmentKind {
    fn is_named_parameter(self) -> bool {
        matches!(
            self,
            Self::NamedParameter | Self::NamedParameterLiteral | Self::NamedParameterIdentifier
        )
    }

    fn is_comment(self) -> bool {
        matches!(self, Self::OneLineComment | Self::MultiLineComment)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Fragment {
    pub(crate) kind: FragmentKind,
    pub(crate) str: String,
}

impl Fragment {
    fn new(kind: FragmentKind, str: String) -> Self {
        Self { kind, str }
    }
}

/// Per distinct named parameter bookkeeping: kind of the first occurrence and
/// the optionally bound replacement value.
#[derive(Debug, Clone)]
struct NamedParam {
    name: String,
    kind: FragmentKind,
    value: Option<String>,
}

/// A preparsed SQL statement.
///
/// Parsing stops at the first top level semicolon (consumed) or at the end of
/// input. Comments are preserved and may carry dollar quoted extra data, see
/// [Statement::extra].
#[derive(Debug, Clone, Default)]
pub struct Statement {
    fragments: Vec<Fragment>,
    // presence bitmap of positional parameters: positional[i] == true when some
    // fragment references `$(i + 1)`.
    positional: Vec<bool>,
    // distinct named parameters in first appearance order.
    named: Vec<NamedParam>,
    // extra data added by the user on top of what related comments carry.
    extra_user: Tuple,
}

impl Statement {
    /// Parses one statement from the input.
    ///
    /// Returns the statement and the byte offset just past the consumed
    /// terminator, which is where parsing of the next statement of a multi
    /// statement source would begin.
    pub fn parse(input: &str) -> Result<(Self, usize), Error> {
        parse_statement(input)
    }

    /// An empty statement.
    pub fn new() -> Self {
        Self::default()
    }

    /// The count of positional parameter slots, i.e. the highest referenced
    /// positional index.
    pub fn positional_parameter_count(&self) -> usize {
        self.positional.len()
    }

    /// The count of distinct named parameters.
    pub fn named_parameter_count(&self) -> usize {
        self.named.len()
    }

    /// Positional slots plus distinct named parameters. Named parameters
    /// occupy the tail of the index space `[0, parameter_count())`.
    pub fn parameter_count(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn has_positional_parameters(&self) -> bool {
        !self.positional.is_empty()
    }

    pub fn has_named_parameters(&self) -> bool {
        !self.named.is_empty()
    }

    pub fn has_parameters(&self) -> bool {
        self.has_positional_parameters() || self.has_named_parameters()
    }

    /// The name of the parameter at `index`.
    ///
    /// `index` must address the named tail of the parameter space, i.e. be in
    /// `[positional_parameter_count(), parameter_count())`.
    pub fn parameter_name(&self, index: usize) -> Result<&str, Error> {
        self.named_at(index).map(|p| p.name.as_str())
    }

    /// The index of the named parameter `name`, or `None` when the statement
    /// has no such parameter.
    ///
    /// The index is stable under fragment insertions that preserve the
    /// relative order of distinct named parameters.
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.named
            .iter()
            .position(|p| p.name == name)
            .map(|i| self.positional.len() + i)
    }

    /// `true` when this statement contains no fragments at all.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// `true` when this statement consists only of comments and blank text.
    pub fn is_query_empty(&self) -> bool {
        self.fragments
            .iter()
            .all(|f| f.kind.is_comment() || (f.kind == FragmentKind::Text && is_blank(&f.str)))
    }

    /// `false` when some fragment references the positional parameter
    /// `$(index + 1)`.
    ///
    /// `index` must be below `positional_parameter_count()`.
    pub fn is_parameter_missing(&self, index: usize) -> Result<bool, Error> {
        self.positional
            .get(index)
            .map(|present| !present)
            .ok_or_else(|| StatementError::InvalidParameterPosition((index + 1).to_string()).into())
    }

    /// `true` when a positional slot below the maximum referenced one has no
    /// referencing fragment. Missing parameters can be eliminated with
    /// [Statement::append] or [Statement::replace_parameter].
    pub fn has_missing_parameters(&self) -> bool {
        self.positional.iter().any(|present| !present)
    }

    /// `true` when the parameter at `index` is a literal parameter (`:'name'`)
    /// whose bound value renders as a quoted literal.
    pub fn is_parameter_literal(&self, index: usize) -> Result<bool, Error> {
        self.named_at(index).map(|p| p.kind == FragmentKind::NamedParameterLiteral)
    }

    /// `true` when the parameter at `index` is an identifier parameter
    /// (`:"name"`) whose bound value renders as a quoted identifier.
    pub fn is_parameter_identifier(&self, index: usize) -> Result<bool, Error> {
        self.named_at(index)
            .map(|p| p.kind == FragmentKind::NamedParameterIdentifier)
    }

    /// Binds the named parameter `name` with `value`.
    ///
    /// The bound value substitutes the parameter when the query string is
    /// generated. Binding `None` clears a previous binding.
    pub fn bind(&mut self, name: &str, value: impl Into<Option<String>>) -> Result<&mut Self, Error> {
        let param = self
            .named
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| StatementError::UnknownParameter(name.to_string()))?;
        param.value = value.into();
        Ok(self)
    }

    /// The value bound to the named parameter `name`.
    pub fn bound(&self, name: &str) -> Result<Option<&str>, Error> {
        self.named
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_deref())
            .ok_or_else(|| StatementError::UnknownParameter(name.to_string()).into())
    }

    /// The count of named parameters with a bound value.
    pub fn bound_parameter_count(&self) -> usize {
        self.named.iter().filter(|p| p.value.is_some()).count()
    }

    pub fn has_bound_parameters(&self) -> bool {
        self.named.iter().any(|p| p.value.is_some())
    }

    /// Appends `appendix` to this statement.
    ///
    /// Fragment lists are merged and the positional presence bitmap is the
    /// union of both sides. When this statement was query empty its related
    /// comments become related to the appended content, which makes their
    /// extra data visible through [Statement::extra].
    pub fn append(&mut self, appendix: &Statement) -> Result<(), Error> {
        let mut fragments = self.fragments.clone();
        fragments.extend(appendix.fragments.iter().cloned());
        self.commit_fragments(fragments, &[&appendix.named])
    }

    /// Replaces every occurrence of the named parameter `name` with the
    /// fragments of `replacement`. Extra data is not affected.
    pub fn replace_parameter(&mut self, name: &str, replacement: &Statement) -> Result<(), Error> {
        if self.parameter_index(name).is_none() {
            return Err(StatementError::UnknownParameter(name.to_string()).into());
        }

        let mut fragments = Vec::with_capacity(self.fragments.len() + replacement.fragments.len());
        for f in &self.fragments {
            if f.kind.is_named_parameter() && f.str == name {
                fragments.extend(replacement.fragments.iter().cloned());
            } else {
                fragments.push(f.clone());
            }
        }
        self.commit_fragments(fragments, &[&replacement.named])
    }

    /// The statement rendered back to SQL text. Comments and parameters are
    /// preserved, so `Statement::parse` of the result produces an equivalent
    /// statement.
    pub fn to_text(&self) -> String {
        let mut result = String::with_capacity(self.text_size_hint());
        for f in &self.fragments {
            match f.kind {
                FragmentKind::Text => result.push_str(&f.str),
                FragmentKind::OneLineComment => {
                    result.push_str("--");
                    result.push_str(&f.str);
                    result.push('\n');
                }
                FragmentKind::MultiLineComment => {
                    result.push_str("/*");
                    result.push_str(&f.str);
                    result.push_str("*/");
                }
                FragmentKind::PositionalParameter => {
                    result.push('$');
                    result.push_str(&f.str);
                }
                FragmentKind::NamedParameter => {
                    result.push(':');
                    result.push_str(&f.str);
                }
                FragmentKind::NamedParameterLiteral => {
                    result.push_str(":'");
                    result.push_str(&f.str);
                    result.push('\'');
                }
                FragmentKind::NamedParameterIdentifier => {
                    result.push_str(":\"");
                    result.push_str(&f.str);
                    result.push('"');
                }
            }
        }
        result
    }

    /// The query string that is actually sent to the server:
    ///
    /// - positional parameters stay `$N`;
    /// - unquoted named parameters are renumbered to dense positional numbers
    ///   following the positional slots, in first appearance order;
    /// - literal and identifier named parameters are substituted with the
    ///   server quoted form of their bound value;
    /// - comments are stripped.
    ///
    /// Fails when positional parameters are missing or a quoted named
    /// parameter has no bound value.
    pub fn to_query_string(&self) -> Result<String, Error> {
        if self.has_missing_parameters() {
            return Err(StatementError::MissingParameters.into());
        }

        // dense numbering covers only parameters the server will see.
        let mut query_params = Vec::new();
        for p in &self.named {
            if p.kind == FragmentKind::NamedParameter {
                query_params.push(p.name.as_str());
            }
        }

        let mut result = String::with_capacity(self.text_size_hint());
        for f in &self.fragments {
            match f.kind {
                FragmentKind::Text => result.push_str(&f.str),
                FragmentKind::OneLineComment | FragmentKind::MultiLineComment => {}
                FragmentKind::PositionalParameter => {
                    result.push('$');
                    result.push_str(&f.str);
                }
                FragmentKind::NamedParameter => {
                    let idx = query_params
                        .iter()
                        .position(|n| *n == f.str)
                        .expect("named parameter cache must cover every named fragment");
                    result.push('$');
                    result.push_str(&(self.positional.len() + idx + 1).to_string());
                }
                FragmentKind::NamedParameterLiteral => {
                    let value = self.require_bound(&f.str)?;
                    result.push_str(&postgres_protocol::escape::escape_literal(value));
                }
                FragmentKind::NamedParameterIdentifier => {
                    let value = self.require_bound(&f.str)?;
                    result.push_str(&postgres_protocol::escape::escape_identifier(value));
                }
            }
        }
        Ok(result)
    }

    /// The count of parameters of the generated query string: positional slots
    /// plus distinct unquoted named parameters. Quoted named parameters are
    /// substituted client side and do not reach the server.
    pub(crate) fn query_parameter_count(&self) -> usize {
        self.positional.len()
            + self
                .named
                .iter()
                .filter(|p| p.kind == FragmentKind::NamedParameter)
                .count()
    }

    // position of the named parameter in the generated query string's
    // parameter space, or `None` for unknown and client substituted names.
    pub(crate) fn query_parameter_index(&self, name: &str) -> Option<usize> {
        let mut index = self.positional.len();
        for p in &self.named {
            if p.kind != FragmentKind::NamedParameter {
                continue;
            }
            if p.name == name {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    // names of the generated query string's parameters: `None` for positional
    // slots, the parameter name for the named tail.
    pub(crate) fn query_parameter_names(&self) -> Vec<Option<Box<str>>> {
        let mut names: Vec<Option<Box<str>>> = vec![None; self.positional.len()];
        for p in &self.named {
            if p.kind == FragmentKind::NamedParameter {
                names.push(Some(p.name.clone().into_boxed_str()));
            }
        }
        names
    }

    /// The extra data of this statement: entries added through
    /// [Statement::extra_mut] followed by associations extracted from related
    /// dollar quoted comments.
    ///
    /// Fails when a related comment contains a malformed dollar quote.
    pub fn extra(&self) -> Result<Tuple, Error> {
        let mut result = self.extra_user.clone();
        result.append(extra::extract(&self.fragments)?);
        Ok(result)
    }

    /// User supplied extra data entries.
    pub fn extra_mut(&mut self) -> &mut Tuple {
        &mut self.extra_user
    }

    fn named_at(&self, index: usize) -> Result<&NamedParam, Error> {
        index
            .checked_sub(self.positional.len())
            .and_then(|i| self.named.get(i))
            .ok_or_else(|| StatementError::UnknownParameter(index.to_string()).into())
    }

    fn require_bound(&self, name: &str) -> Result<&str, Error> {
        self.bound(name)?
            .ok_or_else(|| StatementError::UnboundParameter(name.to_string()).into())
    }

    fn text_size_hint(&self) -> usize {
        self.fragments.iter().map(|f| f.str.len() + 4).sum()
    }

    // replaces the fragment list, recomputing both parameter caches. bound
    // values survive by name; `donors` provide values for names this statement
    // did not have before. nothing is mutated when validation fails.
    fn commit_fragments(&mut self, fragments: Vec<Fragment>, donors: &[&[NamedParam]]) -> Result<(), Error> {
        let mut positional = Vec::new();
        let mut named = Vec::<NamedParam>::new();

        for f in &fragments {
            match f.kind {
                FragmentKind::PositionalParameter => {
                    let position = parse_position(&f.str)?;
                    if positional.len() < position {
                        positional.resize(position, false);
                    }
                    positional[position - 1] = true;
                }
                kind if kind.is_named_parameter() => {
                    if !named.iter().any(|p| p.name == f.str) {
                        let value = self
                            .named
                            .iter()
                            .chain(donors.iter().copied().flatten())
                            .find(|p| p.name == f.str)
                            .and_then(|p| p.value.clone());
                        named.push(NamedParam {
                            name: f.str.clone(),
                            kind,
                            value,
                        });
                    }
                }
                _ => {}
            }
        }

        if positional.len() + named.len() > MAX_PARAMETER_COUNT {
            return Err(StatementError::TooManyParameters(positional.len() + named.len()).into());
        }

        self.fragments = fragments;
        self.positional = positional;
        self.named = named;
        Ok(())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl TryFrom<&str> for Statement {
    type Error = Error;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        Statement::parse(input).map(|(stmt, _)| stmt)
    }
}

impl TryFrom<&String> for Statement {
    type Error = Error;

    fn try_from(input: &String) -> Result<Self, Self::Error> {
        Statement::try_from(input.as_str())
    }
}

fn parse_position(digits: &str) -> Result<usize, Error> {
    match digits.parse::<usize>() {
        Ok(position) if (1..=MAX_PARAMETER_COUNT).contains(&position) => Ok(position),
        _ => Err(StatementError::InvalidParameterPosition(digits.to_string()).into()),
    }
}

/// `true` for characters that may appear in an unquoted SQL identifier.
/// Anything beyond ASCII counts as an identifier character, matching the
/// server side lexer.
fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

fn is_blank(s: &str) -> bool {
    s.chars().all(char::is_whitespace)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Top,
    Bracket,
    Colon,
    NamedParameter,
    QuotedNamedParameter,
    QuotedNamedParameterQuote,
    Dollar,
    PositionalParameter,
    DollarQuoteLeadingTag,
    DollarQuote,
    DollarQuoteDollar,
    Quote,
    QuoteQuote,
    Dash,
    OneLineComment,
    Slash,
    MultiLineComment,
    MultiLineCommentStar,
}

struct ParseOutput {
    fragments: Vec<Fragment>,
}

impl ParseOutput {
    fn push(&mut self, kind: FragmentKind, str: &mut String) {
        if !(str.is_empty() && kind == FragmentKind::Text) {
            self.fragments.push(Fragment::new(kind, core::mem::take(str)));
        } else {
            str.clear();
        }
    }

    fn push_named(&mut self, quote: Option<char>, str: &mut String) -> Result<(), Error> {
        // a parameter name of digits only would be ambiguous with a positional
        // reference, and a name without a single letter is a typo in practice.
        if !str.chars().any(|c| c.is_ascii_alphabetic() || !c.is_ascii()) {
            return Err(StatementError::InvalidParameterName(core::mem::take(str)).into());
        }
        let kind = match quote {
            None => FragmentKind::NamedParameter,
            Some('\'') => FragmentKind::NamedParameterLiteral,
            Some(_) => FragmentKind::NamedParameterIdentifier,
        };
        self.push(kind, str);
        Ok(())
    }
}

/// A single pass scanner producing the fragment list of one statement.
///
/// The grammar follows the server lexer where it matters: quoted regions with
/// doubled quote escapes, depth counted brackets and block comments, dollar
/// quoted literals with matching tags. A dollar or colon attached to an
/// identifier stays literal text.
fn parse_statement(input: &str) -> Result<(Statement, usize), Error> {
    use State::*;

    let mut state = Top;
    let mut output = ParseOutput { fragments: Vec::new() };
    let mut fragment = String::new();
    let mut depth = 0u32;
    let mut previous_char = '\0';
    let mut current_char = '\0';
    let mut quote_char = '\0';
    let mut leading_tag = String::new();
    let mut trailing_tag = String::new();
    let mut consumed = input.len();

    let mut chars = input.char_indices();

    'scan: loop {
        let Some((offset, c)) = chars.next() else { break };
        previous_char = core::mem::replace(&mut current_char, c);

        macro_rules! finish {
            () => {{
                consumed = offset + c.len_utf8();
                break 'scan;
            }};
        }

        match state {
            Top => match c {
                '\'' | '"' => {
                    state = Quote;
                    quote_char = c;
                    fragment.push(c);
                }
                '[' => {
                    state = Bracket;
                    depth = 1;
                    fragment.push(c);
                }
                '$' => {
                    // a dollar right after an identifier character is part of
                    // the identifier, not a parameter or dollar quote opener.
                    if !is_ident_char(previous_char) {
                        state = Dollar;
                    } else {
                        fragment.push(c);
                    }
                }
                ':' => {
                    if previous_char != ':' {
                        state = Colon;
                    } else {
                        fragment.push(c);
                    }
                }
                '-' => state = Dash,
                '/' => state = Slash,
                ';' => finish!(),
                _ => fragment.push(c),
            },

            Bracket => {
                if c == ']' {
                    depth -= 1;
                } else if c == '[' {
                    depth += 1;
                }
                if depth == 0 {
                    state = Top;
                }
                fragment.push(c);
            }

            Dollar => {
                debug_assert_eq!(previous_char, '$');
                if c.is_ascii_digit() {
                    state = PositionalParameter;
                    output.push(FragmentKind::Text, &mut fragment);
                    fragment.push(c);
                } else if is_ident_char(c) {
                    if c == '$' {
                        state = DollarQuote;
                    } else {
                        state = DollarQuoteLeadingTag;
                        leading_tag.push(c);
                    }
                    fragment.push(previous_char);
                    fragment.push(c);
                } else {
                    state = Top;
                    fragment.push(previous_char);
                    fragment.push(c);
                }
            }

            PositionalParameter => {
                if !c.is_ascii_digit() {
                    state = Top;
                    parse_position(&fragment)?;
                    output.push(FragmentKind::PositionalParameter, &mut fragment);
                    if c == ';' {
                        finish!();
                    }
                }
                fragment.push(c);
            }

            DollarQuoteLeadingTag => {
                if c == '$' {
                    state = DollarQuote;
                    fragment.push(c);
                } else if is_ident_char(c) && c != '$' {
                    leading_tag.push(c);
                    fragment.push(c);
                } else {
                    return Err(StatementError::InvalidDollarQuoteTag.into());
                }
            }

            DollarQuote => {
                if c == '$' {
                    state = DollarQuoteDollar;
                }
                fragment.push(c);
            }

            DollarQuoteDollar => {
                if c == '$' {
                    if leading_tag == trailing_tag {
                        state = Top;
                        leading_tag.clear();
                    } else {
                        state = DollarQuote;
                    }
                    trailing_tag.clear();
                } else {
                    trailing_tag.push(c);
                }
                fragment.push(c);
            }

            Colon => {
                debug_assert_eq!(previous_char, ':');
                if c == '\'' || c == '"' {
                    state = QuotedNamedParameter;
                    quote_char = c;
                    output.push(FragmentKind::Text, &mut fragment);
                } else if is_ident_char(c) {
                    state = NamedParameter;
                    output.push(FragmentKind::Text, &mut fragment);
                    fragment.push(c);
                } else {
                    state = Top;
                    fragment.push(previous_char);
                    if c == ';' {
                        finish!();
                    }
                    fragment.push(c);
                }
            }

            NamedParameter => {
                if !is_ident_char(c) {
                    state = Top;
                    output.push_named(None, &mut fragment)?;
                    if c == ';' {
                        finish!();
                    }
                }
                fragment.push(c);
            }

            QuotedNamedParameter => {
                if c == quote_char {
                    state = QuotedNamedParameterQuote;
                } else {
                    fragment.push(c);
                }
            }

            QuotedNamedParameterQuote => {
                if c == quote_char {
                    // doubled quote stays part of the name.
                    state = QuotedNamedParameter;
                    fragment.push(c);
                } else {
                    state = Top;
                    output.push_named(Some(quote_char), &mut fragment)?;
                    if c == ';' {
                        finish!();
                    }
                    fragment.push(c);
                }
            }

            Quote => {
                if c == quote_char {
                    state = QuoteQuote;
                } else {
                    fragment.push(c);
                }
            }

            QuoteQuote => {
                debug_assert_eq!(previous_char, quote_char);
                if c == quote_char {
                    state = Quote;
                    // the previous quote is skipped, this one is kept below.
                } else {
                    state = Top;
                    fragment.push(previous_char);
                    if c == ';' {
                        finish!();
                    }
                }
                fragment.push(c);
            }

            Dash => {
                debug_assert_eq!(previous_char, '-');
                if c == '-' {
                    state = OneLineComment;
                    output.push(FragmentKind::Text, &mut fragment);
                } else {
                    state = Top;
                    fragment.push(previous_char);
                    if c == ';' {
                        finish!();
                    }
                    fragment.push(c);
                }
            }

            OneLineComment => {
                if c == '\n' {
                    state = Top;
                    if fragment.ends_with('\r') {
                        fragment.pop();
                    }
                    output.push(FragmentKind::OneLineComment, &mut fragment);
                } else {
                    fragment.push(c);
                }
            }

            Slash => {
                debug_assert_eq!(previous_char, '/');
                if c == '*' {
                    state = MultiLineComment;
                    if depth > 0 {
                        // nested comments stay as text of the outermost one.
                        fragment.push(previous_char);
                        fragment.push(c);
                    } else {
                        output.push(FragmentKind::Text, &mut fragment);
                    }
                    depth += 1;
                } else {
                    state = if depth == 0 { Top } else { MultiLineComment };
                    fragment.push(previous_char);
                    fragment.push(c);
                }
            }

            MultiLineComment => {
                if c == '/' {
                    state = Slash;
                } else if c == '*' {
                    state = MultiLineCommentStar;
                } else {
                    fragment.push(c);
                }
            }

            MultiLineCommentStar => {
                debug_assert_eq!(previous_char, '*');
                if c == '/' {
                    depth -= 1;
                    if depth == 0 {
                        state = Top;
                        // trailing "*/" is not part of the content.
                        output.push(FragmentKind::MultiLineComment, &mut fragment);
                    } else {
                        state = MultiLineComment;
                        fragment.push(previous_char);
                        fragment.push(c);
                    }
                } else {
                    state = MultiLineComment;
                    fragment.push(previous_char);
                    fragment.push(c);
                }
            }
        }
    }

    match state {
        Top => output.push(FragmentKind::Text, &mut fragment),
        QuoteQuote => {
            fragment.push(current_char);
            output.push(FragmentKind::Text, &mut fragment);
        }
        OneLineComment => {
            if fragment.ends_with('\r') {
                fragment.pop();
            }
            output.push(FragmentKind::OneLineComment, &mut fragment);
        }
        PositionalParameter => {
            parse_position(&fragment)?;
            output.push(FragmentKind::PositionalParameter, &mut fragment);
        }
        NamedParameter => output.push_named(None, &mut fragment)?,
        // the closing quote was consumed, only a doubled quote could have
        // extended the name.
        QuotedNamedParameterQuote => output.push_named(Some(quote_char), &mut fragment)?,
        Quote => return Err(StatementError::Unterminated("quoted region").into()),
        MultiLineComment | MultiLineCommentStar | Slash => {
            return Err(StatementError::Unterminated("block comment").into())
        }
        DollarQuote | DollarQuoteDollar | DollarQuoteLeadingTag => {
            return Err(StatementError::Unterminated("dollar quoted literal").into())
        }
        QuotedNamedParameter => {
            return Err(StatementError::Unterminated("quoted parameter name").into())
        }
        Bracket => return Err(StatementError::Unterminated("bracketed expression").into()),
        Colon | Dollar | Dash => return Err(StatementError::Unterminated("statement").into()),
    }

    let mut statement = Statement::default();
    statement.commit_fragments(output.fragments, &[])?;
    Ok((statement, consumed))
}

#[cfg(test)]
mod test {
    use super::*;

    fn stmt(s: &str) -> Statement {
        Statement::try_from(s).unwrap()
    }

    #[test]
    fn simple_statement_without_parameters() {
        let s = stmt("-- Id: simple\r\nSELECT /* comment */ 1::integer /*, $1::integer*/");
        assert_eq!(s.positional_parameter_count(), 0);
        assert_eq!(s.named_parameter_count(), 0);
        assert_eq!(s.parameter_count(), 0);
        assert!(!s.has_parameters());
        assert!(!s.is_empty());
        assert!(!s.has_missing_parameters());
    }

    #[test]
    fn mixed_parameters() {
        let s = stmt(
            "SELECT :last_name::text, /* c */ :age, $2, f(:age), 'simple', $$dq$$, $t$dq$t$",
        );
        assert_eq!(s.positional_parameter_count(), 2);
        assert_eq!(s.named_parameter_count(), 2);
        assert_eq!(s.parameter_count(), 4);
        assert_eq!(s.parameter_name(2).unwrap(), "last_name");
        assert_eq!(s.parameter_name(3).unwrap(), "age");
        assert_eq!(s.parameter_index("last_name"), Some(2));
        assert_eq!(s.parameter_index("age"), Some(3));
        assert!(s.is_parameter_missing(0).unwrap());
        assert!(s.has_missing_parameters());
    }

    #[test]
    fn append_eliminates_missing_parameters() {
        let mut s = stmt("SELECT :p, $2");
        assert!(s.has_missing_parameters());
        s.append(&stmt(" WHERE $1")).unwrap();
        assert!(!s.is_parameter_missing(0).unwrap());
        assert!(!s.has_missing_parameters());
    }

    #[test]
    fn replace_parameter_keeps_first_appearance_order() {
        let mut s = stmt("SELECT :last_name, $2, f(:age) WHERE $1");
        s.replace_parameter("age", &stmt("g(:first_name, :age, :p2) + 1")).unwrap();
        assert_eq!(s.parameter_index("last_name"), Some(2));
        assert_eq!(s.parameter_index("first_name"), Some(3));
        assert_eq!(s.parameter_index("age"), Some(4));
        assert_eq!(s.parameter_index("p2"), Some(5));
    }

    #[test]
    fn round_trip() {
        let text = "SELECT :a, $1, 'it''s', $$x$$, \"col\" -- trail\n";
        let s = stmt(text);
        let reparsed = stmt(&s.to_text());
        assert_eq!(s.to_text(), reparsed.to_text());
    }

    #[test]
    fn query_string_renumbers_named_parameters() {
        let s = stmt("SELECT :b, :a, :b, $1");
        assert_eq!(s.to_query_string().unwrap(), "SELECT $2, $3, $2, $1");
    }

    #[test]
    fn query_string_strips_comments() {
        let s = stmt("/* c */ SELECT 1 -- one\n + 2");
        let q = s.to_query_string().unwrap();
        assert!(!q.contains("c"));
        assert!(!q.contains("one"));
        assert_eq!(q, " SELECT 1  + 2");
    }

    #[test]
    fn quoted_named_parameters() {
        let mut s = stmt("SELECT :'text' AS :\"name\"");
        assert_eq!(s.named_parameter_count(), 2);
        assert!(s.is_parameter_literal(0).unwrap());
        assert!(s.is_parameter_identifier(1).unwrap());

        // unbound quoted parameters can not render.
        assert!(s.to_query_string().is_err());

        s.bind("text", "it's".to_string()).unwrap();
        s.bind("name", "weird\"name".to_string()).unwrap();
        assert_eq!(s.to_query_string().unwrap(), "SELECT 'it''s' AS \"weird\"\"name\"");
        assert_eq!(s.bound_parameter_count(), 2);
    }

    #[test]
    fn bind_survives_append() {
        let mut s = stmt("WHERE :who");
        s.bind("who", "x".to_string()).unwrap();
        s.append(&stmt(" AND :who IS NOT NULL")).unwrap();
        assert_eq!(s.bound("who").unwrap(), Some("x"));
    }

    #[test]
    fn dollar_after_identifier_is_literal() {
        let s = stmt("SELECT a$1, b$$x$$");
        assert_eq!(s.parameter_count(), 0);
        assert_eq!(s.to_text(), "SELECT a$1, b$$x$$");
    }

    #[test]
    fn double_colon_is_not_a_parameter() {
        let s = stmt("SELECT 1::int");
        assert_eq!(s.named_parameter_count(), 0);
        assert_eq!(s.to_text(), "SELECT 1::int");
    }

    #[test]
    fn terminator_is_consumed() {
        let (s, consumed) = Statement::parse("SELECT 1; SELECT 2").unwrap();
        assert_eq!(s.to_text(), "SELECT 1");
        assert_eq!(&"SELECT 1; SELECT 2"[consumed..], " SELECT 2");
    }

    #[test]
    fn empty_and_comment_only() {
        let s = stmt("");
        assert!(s.is_empty());
        assert!(s.is_query_empty());

        let s = stmt("-- only a comment\n  ");
        assert!(!s.is_empty());
        assert!(s.is_query_empty());
    }

    #[test]
    fn positional_bounds() {
        assert!(Statement::try_from("SELECT $0").is_err());
        assert!(Statement::try_from("SELECT $65536").is_err());
        assert!(Statement::try_from("SELECT $65535").is_ok());
        assert!(Statement::try_from("SELECT $1").is_ok());
    }

    #[test]
    fn named_parameter_needs_a_letter() {
        assert!(Statement::try_from("SELECT :123").is_err());
        assert!(Statement::try_from("SELECT :_1").is_err());
        assert!(Statement::try_from("SELECT :a1").is_ok());
    }

    #[test]
    fn nested_block_comments() {
        let s = stmt("/* a /* b */ c */ SELECT 1");
        assert_eq!(s.to_text(), "/* a /* b */ c */ SELECT 1");
        assert!(Statement::try_from("/* a /* b */").is_err());
    }

    #[test]
    fn quotes_swallow_parameter_syntax() {
        let s = stmt("SELECT ':name', \"$1\", $$:x$$");
        assert_eq!(s.parameter_count(), 0);
    }

    #[test]
    fn bracketed_expression_is_opaque() {
        let s = stmt("SELECT a[1; 2] FROM t");
        assert_eq!(s.to_text(), "SELECT a[1; 2] FROM t");
    }

    #[test]
    fn semicolon_right_after_parameter() {
        let (s, _) = Statement::parse("SELECT $1;").unwrap();
        assert_eq!(s.positional_parameter_count(), 1);
        let (s, _) = Statement::parse("SELECT :n;").unwrap();
        assert_eq!(s.named_parameter_count(), 1);
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(Statement::try_from("SELECT 'abc").is_err());
        assert!(Statement::try_from("SELECT $tag$abc$tag").is_err());
    }
}
