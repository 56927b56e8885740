use std::io::{self, Write};
use std::ops::Range;

use tracing::Metadata;
use tracing_subscriber::fmt::writer::MakeWriter;

pub const REDACTED: &str = "***REDACTED***";

/// Mask URL userinfo and the values of sensitive `key=value`, `key: value`
/// and `"key":"value"` pairs.
pub fn redact_secrets(input: &str) -> String {
    mask_assignments(&mask_url_userinfo(input))
}

fn mask_url_userinfo(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut copied = 0;
    let mut search_from = 0;

    while let Some(offset) = input[search_from..].find("://") {
        let host_start = search_from + offset + 3;
        let host_end = input[host_start..]
            .find(|c: char| c.is_whitespace() || "/?#\"'<>".contains(c))
            .map_or(input.len(), |end| host_start + end);
        search_from = host_end;

        if let Some(at) = input[host_start..host_end].rfind('@').filter(|at| *at > 0) {
            out.push_str(&input[copied..host_start]);
            out.push_str(REDACTED);
            copied = host_start + at;
        }
    }

    out.push_str(&input[copied..]);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Secret {
    /// Runs to the next delimiter.
    Token,
    /// A whole `Cookie:` header; its own `;` pairs belong to the value.
    CookieHeader,
}

impl Secret {
    fn classify(key: &str) -> Option<Self> {
        let key = key.to_ascii_lowercase();
        if key == "cookie" || key == "set-cookie" {
            return Some(Self::CookieHeader);
        }
        let sensitive = key == "key"
            || key == "authorization"
            || ["cookie", "token", "secret", "password"]
                .iter()
                .any(|word| key.contains(word))
            || ["_key", "-key", "apikey"].iter().any(|end| key.ends_with(end));
        sensitive.then_some(Self::Token)
    }

    fn ends_at(self, c: char) -> bool {
        match self {
            Self::CookieHeader => matches!(c, '\r' | '\n' | '"' | '\''),
            Self::Token => c.is_whitespace() || "&,;)]}\"'".contains(c),
        }
    }
}

fn mask_assignments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut copied = 0;
    let mut search_from = 0;

    while let Some(offset) = input[search_from..].find(['=', ':']) {
        let separator = search_from + offset;
        search_from = separator + 1;

        let Some(key) = key_before(input, separator, copied) else {
            continue;
        };
        let Some(secret) = Secret::classify(&input[key]) else {
            continue;
        };
        let Some(value) = value_after(input, separator + 1, secret) else {
            continue;
        };

        out.push_str(&input[copied..value.start]);
        out.push_str(REDACTED);
        copied = value.end;
        search_from = value.end;
    }

    out.push_str(&input[copied..]);
    out
}

fn key_before(input: &str, separator: usize, floor: usize) -> Option<Range<usize>> {
    let bytes = input.as_bytes();
    let end = match separator.checked_sub(1) {
        Some(quote) if bytes[quote] == b'"' => quote,
        _ => separator,
    };
    let start = bytes
        .get(floor..end)?
        .iter()
        .rposition(|&b| !(b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.')))
        .map_or(floor, |pos| floor + pos + 1);
    (start < end).then_some(start..end)
}

fn value_after(input: &str, from: usize, secret: Secret) -> Option<Range<usize>> {
    let rest = &input[from..];
    let mut start = from + (rest.len() - rest.trim_start_matches([' ', '\t']).len());
    if input
        .get(start..start + 7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer "))
    {
        start += 7;
    }

    let value = input.get(start..).filter(|value| !value.is_empty())?;
    let range = match value.chars().next() {
        Some(quote @ ('"' | '\'')) => {
            let inner = start + 1;
            let end = input[inner..].find(quote).map_or(input.len(), |end| inner + end);
            inner..end
        }
        _ => {
            let end = value
                .find(|c: char| secret.ends_at(c))
                .map_or(input.len(), |end| start + end);
            start..end
        }
    };
    (!range.is_empty()).then_some(range)
}

/// Wraps a writer factory so every emitted line passes through
/// [`redact_secrets`].
#[derive(Debug, Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for RedactingMakeWriter<M> {
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(meta))
    }
}

/// Buffers until a newline so a secret split across `write` calls is still
/// seen whole.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    line: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    fn emit(&mut self, upto: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.line.drain(..upto).collect();
        let masked = redact_secrets(&String::from_utf8_lossy(&chunk));
        self.inner.write_all(masked.as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        while let Some(newline) = self.line.iter().position(|b| *b == b'\n') {
            self.emit(newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.line.is_empty() {
            self.emit(self.line.len())?;
        }
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
