//! SQL rendering with Postgres `$n` placeholders

use super::args::Arg;
use crate::error::{Error, Result};
use crate::value::Value;

/// A fragment string with `?` placeholders and its positional args
#[derive(Debug, Clone)]
pub struct Fragment {
    pub sql: String,
    pub args: Vec<Arg>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

/// Split a fragment into the text around its placeholders
///
/// `?` is text inside single-quoted literals, double-quoted identifiers,
/// `--` and `/* */` comments and `$tag$` dollar-quoted bodies. Elsewhere `??`
/// is a literal `?` (for the jsonb `?` operators). A fragment with `n`
/// placeholders yields `n + 1` pieces.
pub fn split_placeholders(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut pieces = Vec::new();
    let mut current = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let next = chars.get(i + 1).copied();
        let end = match (chars[i], next) {
            (quote @ ('\'' | '"'), _) => closing(&chars, i + 1, &[quote]),
            ('-', Some('-')) => chars[i..]
                .iter()
                .position(|&c| c == '\n')
                .map_or(chars.len(), |p| i + p + 1),
            ('/', Some('*')) => block_comment_end(&chars, i),
            ('$', _) => match dollar_tag(&chars, i) {
                Some(tag) => closing(&chars, i + tag.len(), &tag),
                None => i + 1,
            },
            ('?', Some('?')) => {
                current.push('?');
                i += 2;
                continue;
            }
            ('?', _) => {
                pieces.push(std::mem::take(&mut current));
                i += 1;
                continue;
            }
            _ => i + 1,
        };
        current.extend(&chars[i..end]);
        i = end;
    }
    pieces.push(current);
    pieces
}

/// Index just past the next occurrence of `delimiter` at or after `from`
fn closing(chars: &[char], from: usize, delimiter: &[char]) -> usize {
    (from..chars.len())
        .find(|&at| chars[at..].starts_with(delimiter))
        .map_or(chars.len(), |at| at + delimiter.len())
}

/// Postgres block comments nest
fn block_comment_end(chars: &[char], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < chars.len() {
        match (chars[i], chars[i + 1]) {
            ('/', '*') => {
                depth += 1;
                i += 2;
            }
            ('*', '/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    chars.len()
}

/// The opening `$tag$` at `start`, if one begins there
///
/// `$1` is a positional parameter and `a$b` part of an identifier, not quotes.
fn dollar_tag(chars: &[char], start: usize) -> Option<Vec<char>> {
    let ident = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
    if start > 0 && ident(chars[start - 1]) {
        return None;
    }
    let mut end = start + 1;
    if let Some(&first) = chars.get(end) {
        if first != '$' && !(first.is_alphabetic() || first == '_') {
            return None;
        }
    }
    while let Some(&c) = chars.get(end) {
        if c == '$' {
            return Some(chars[start..=end].to_vec());
        }
        if !(c.is_alphanumeric() || c == '_') {
            return None;
        }
        end += 1;
    }
    None
}

pub fn count_placeholders(sql: &str) -> usize {
    split_placeholders(sql).len() - 1
}

/// Accumulates a statement and its bind values
#[derive(Debug, Default)]
pub struct SqlWriter {
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append a bind value and its `$n` placeholder
    ///
    /// NULL is written as a literal so Postgres types it from context; a
    /// parameter would arrive typed as text.
    pub fn bind(&mut self, value: Value) -> &mut Self {
        if value.is_null() {
            self.sql.push_str("NULL");
        } else {
            let placeholder = self.param(value);
            self.sql.push_str(&placeholder);
        }
        self
    }

    /// Register a bind value without writing it; the placeholder may be used repeatedly
    pub fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    pub fn fragment(&mut self, fragment: &Fragment) -> Result<&mut Self> {
        let pieces = split_placeholders(&fragment.sql);
        if pieces.len() - 1 != fragment.args.len() {
            return Err(arity_error(&fragment.sql, pieces.len() - 1, fragment.args.len()));
        }

        let mut args = fragment.args.iter();
        for (i, piece) in pieces.iter().enumerate() {
            if i > 0 {
                // arity was checked above
                if let Some(arg) = args.next() {
                    self.arg(arg)?;
                }
            }
            self.sql.push_str(piece);
        }
        Ok(self)
    }

    fn arg(&mut self, arg: &Arg) -> Result<()> {
        match arg {
            Arg::Value(Value::Array(items)) if items.is_empty() => {
                self.push("(NULL)");
            }
            Arg::Value(Value::Array(items)) => {
                self.push("(");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.bind(item.clone());
                }
                self.push(")");
            }
            Arg::Value(value) => {
                self.bind(value.clone());
            }
            Arg::Query(query) => {
                self.push("(");
                query.write_select(self)?;
                self.push(")");
            }
        }
        Ok(())
    }

    pub fn finish(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}

pub(crate) fn arity_error(sql: &str, placeholders: usize, args: usize) -> Error {
    Error::not_valid(format!(
        "fragment `{sql}` has {placeholders} placeholder(s) but {args} argument(s)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::args::IntoArg;

    fn render(sql: &str, args: Vec<Arg>) -> (String, Vec<Value>) {
        let mut w = SqlWriter::new();
        w.fragment(&Fragment::new(sql, args)).unwrap();
        w.finish()
    }

    #[test]
    fn test_placeholders_are_numbered() {
        let (sql, params) = render(
            "age > ? AND name = ?",
            vec![18.into_arg(), "ada".into_arg()],
        );
        assert_eq!(sql, "age > $1 AND name = $2");
        assert_eq!(params, vec![Value::I32(18), Value::String("ada".into())]);
    }

    #[test]
    fn test_quoted_question_marks_are_text() {
        let (sql, params) = render(
            r#"note <> 'why?' AND "what?" = ? AND tags ?? 'x'"#,
            vec![1.into_arg()],
        );
        assert_eq!(sql, r#"note <> 'why?' AND "what?" = $1 AND tags ? 'x'"#);
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_arrays_expand() {
        let (sql, params) = render("id IN ?", vec![vec![3i64, 5, 8].into_arg()]);
        assert_eq!(sql, "id IN ($1, $2, $3)");
        assert_eq!(params.len(), 3);

        let (sql, params) = render("id IN ?", vec![Vec::<i64>::new().into_arg()]);
        assert_eq!(sql, "id IN (NULL)");
        assert!(params.is_empty());
    }

    #[test]
    fn test_arity_mismatch() {
        let mut w = SqlWriter::new();
        let err = w
            .fragment(&Fragment::new("a = ? AND b = ?", vec![1.into_arg()]))
            .unwrap_err();
        assert!(err.is(crate::ErrorKind::NotValid));

        assert_eq!(count_placeholders("'?' ?? \"?\""), 0);
    }

    #[test]
    fn test_null_is_written_inline() {
        let (sql, params) = render(
            "UPDATE t SET n = ?, label = ?",
            vec![Value::Null.into_arg(), "x".into_arg()],
        );
        assert_eq!(sql, "UPDATE t SET n = NULL, label = $1");
        assert_eq!(params, vec![Value::String("x".into())]);
    }

    #[test]
    fn test_comments_and_dollar_quotes_are_text() {
        let ddl = "CREATE FUNCTION f(x int) RETURNS int AS $body$ SELECT x -- why?\n $body$ LANGUAGE sql; -- done?\n/* a? /* nested? */ b? */ SELECT ?";
        let pieces = split_placeholders(ddl);
        assert_eq!(pieces.len(), 2);
        assert!(pieces[0].ends_with("b? */ SELECT "));

        assert_eq!(count_placeholders("DO $$ BEGIN PERFORM 1 WHERE 'a' ? 'b'; END $$"), 0);
        assert_eq!(count_placeholders("SELECT a$b FROM t WHERE c = ?"), 1);
        assert_eq!(count_placeholders("x - ? - -1"), 1);
    }
}
