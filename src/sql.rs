//! Textual parameter interpolation for the simple protocol.
//!
//! The extended protocol binds parameters out of band; the simple protocol
//! has no Bind step, so `$n` placeholders are replaced with quoted literals
//! before the single `Query` message is sent. The lexer only needs to know
//! where placeholders can NOT appear: string literals, quoted identifiers,
//! comments and dollar-quoted bodies.
//!
//! Interpolation assumes `standard_conforming_strings=on`; the executor
//! checks the runtime parameter before taking this path.
use crate::{Error, Result, encode::Encoded, value::ValueRef};

/// Type that represent sql string.
pub trait Sql {
    /// Returns sql string.
    fn sql(&self) -> &str;

    /// Return `true` if the prepared statement should be cached under a
    /// server-side name.
    fn persistent(&self) -> bool;
}

impl Sql for &str {
    fn sql(&self) -> &str {
        self
    }

    fn persistent(&self) -> bool {
        true
    }
}

impl Sql for String {
    fn sql(&self) -> &str {
        self
    }

    fn persistent(&self) -> bool {
        true
    }
}

/// Non persistent query string: prepared as the unnamed statement and
/// never cached.
#[derive(Debug)]
pub struct SqlOnce<'sql>(&'sql str);

impl Sql for SqlOnce<'_> {
    fn sql(&self) -> &str {
        self.0
    }

    fn persistent(&self) -> bool {
        false
    }
}

/// Extension trait for easier query persistence config.
pub trait SqlExt<'a> {
    /// Disable statement caching.
    fn once(self) -> SqlOnce<'a>;
}

impl<'a> SqlExt<'a> for &'a str {
    fn once(self) -> SqlOnce<'a> {
        SqlOnce(self)
    }
}

impl<'a> SqlExt<'a> for SqlOnce<'a> {
    fn once(self) -> SqlOnce<'a> {
        self
    }
}

/// Replace each `$n` placeholder in `sql` with the quoted literal of
/// `params[n-1]`.
pub fn interpolate(sql: &str, params: &[Encoded]) -> Result<String> {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let quote = bytes[i];
                let end = skip_quoted(bytes, i, quote);
                out.push_str(&sql[i..end]);
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = bytes[i..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |n| i + n + 1);
                out.push_str(&sql[i..end]);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = skip_block_comment(bytes, i);
                out.push_str(&sql[i..end]);
                i = end;
            }
            b'$' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                let mut end = i + 1;
                while bytes.get(end).is_some_and(u8::is_ascii_digit) {
                    end += 1;
                }
                let n: usize = sql[i + 1..end].parse().map_err(|_| {
                    Error::usage(format!("invalid parameter placeholder {}", &sql[i..end]))
                })?;
                let param = n
                    .checked_sub(1)
                    .and_then(|idx| params.get(idx))
                    .ok_or_else(|| {
                        Error::usage(format!(
                            "placeholder ${n} references a missing parameter, {} given",
                            params.len(),
                        ))
                    })?;
                write_literal(&mut out, param);
                i = end;
            }
            b'$' => {
                let end = skip_dollar_quoted(bytes, i);
                out.push_str(&sql[i..end]);
                i = end;
            }
            _ => {
                let ch = &sql[i..];
                let len = ch.chars().next().map_or(1, char::len_utf8);
                out.push_str(&sql[i..i + len]);
                i += len;
            }
        }
    }

    Ok(out)
}

/// Past the closing quote, honoring `''` / `""` escapes.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    let mut depth = 1usize;
    while i + 1 < bytes.len() {
        match &bytes[i..i + 2] {
            b"/*" => {
                depth += 1;
                i += 2;
            }
            b"*/" => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Past a `$tag$ ... $tag$` body, `$$` included.
fn skip_dollar_quoted(bytes: &[u8], start: usize) -> usize {
    let mut tag_end = start + 1;
    while tag_end < bytes.len() && (bytes[tag_end].is_ascii_alphanumeric() || bytes[tag_end] == b'_') {
        tag_end += 1;
    }
    if bytes.get(tag_end) != Some(&b'$') {
        // a lone dollar, not a quote opener
        return start + 1;
    }
    let tag = &bytes[start..tag_end + 1];

    let mut i = tag_end + 1;
    while i + tag.len() <= bytes.len() {
        if &bytes[i..i + tag.len()] == tag {
            return i + tag.len();
        }
        i += 1;
    }
    bytes.len()
}

fn write_literal(out: &mut String, param: &Encoded) {
    match param.value() {
        ValueRef::Null => out.push_str("NULL"),
        ValueRef::Bool(true) => out.push_str("TRUE"),
        ValueRef::Bool(false) => out.push_str("FALSE"),
        ValueRef::Int2(n) => out.push_str(itoa::Buffer::new().format(*n)),
        ValueRef::Int4(n) => out.push_str(itoa::Buffer::new().format(*n)),
        ValueRef::Int8(n) => out.push_str(itoa::Buffer::new().format(*n)),
        ValueRef::Float4(n) => out.push_str(&n.to_string()),
        ValueRef::Float8(n) => out.push_str(&n.to_string()),
        ValueRef::Text(t) => write_quoted(out, t),
        ValueRef::String(s) => write_quoted(out, s),
        ValueRef::Slice(b) => write_bytea(out, b),
        ValueRef::Bytes(b) => write_bytea(out, b),
    }
}

fn write_quoted(out: &mut String, value: &str) {
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
}

/// `'\x0123'` hex form, the bytea input syntax under conforming strings.
fn write_bytea(out: &mut String, value: &[u8]) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out.push_str("'\\x");
    for b in value {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0xf) as usize] as char);
    }
    out.push('\'');
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encode::Encode;

    #[test]
    fn substitutes_placeholders() {
        let params = [42i32.encode(), "it's".encode()];
        let sql = interpolate("SELECT $1, $2", &params).unwrap();
        assert_eq!(sql, "SELECT 42, 'it''s'");
    }

    #[test]
    fn quoted_placeholder_untouched() {
        let params = [1i32.encode()];
        let sql = interpolate("SELECT '$1', \"$1\", $1 -- $1\n/* $1 */", &params).unwrap();
        assert_eq!(sql, "SELECT '$1', \"$1\", 1 -- $1\n/* $1 */");
    }

    #[test]
    fn dollar_quoted_body_untouched() {
        let params = [1i32.encode()];
        let sql = interpolate("SELECT $tag$ $1 $tag$, $1", &params).unwrap();
        assert_eq!(sql, "SELECT $tag$ $1 $tag$, 1");
    }

    #[test]
    fn null_and_bytes() {
        let params = [None::<i32>.encode(), (&b"\x01\xff"[..]).encode()];
        let sql = interpolate("VALUES ($1, $2)", &params).unwrap();
        assert_eq!(sql, "VALUES (NULL, '\\x01ff')");
    }

    #[test]
    fn missing_parameter() {
        let err = interpolate("SELECT $3", &[1i32.encode()]).unwrap_err();
        assert!(matches!(err.kind(), crate::ErrorKind::Usage(_)));
    }
}
