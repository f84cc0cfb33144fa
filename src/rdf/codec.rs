//! Text encoding of terms, close to N-Triples term syntax.
//!
//! ```text
//! <http://example.org/a>      URI
//! _:b0                        blank node
//! "chat"                      simple literal
//! "chat"@fr                   language tagged literal
//! "1"^^<http://...#integer>   typed literal
//! ?x                          variable
//! ```
//!
//! One buffer always holds exactly one term, so the trailing part of a term
//! (blank node label, variable name, language tag) runs to the end of the buffer.

use super::{Literal, Term};
use crate::error::CodecError;

/// Worst case bytes written for a single input byte: a control character as `\uXXXX`.
const MAX_ESCAPE_EXPANSION: usize = 6;

/// Upper bound on the bytes `encode` writes for `term`.
pub fn max_encoded_size(term: &Term) -> usize {
    let bound = |s: &str| s.len() * MAX_ESCAPE_EXPANSION;

    match term {
        Term::Uri(iri) => 2 + bound(iri),
        Term::BlankNode(label) => 2 + bound(label),
        Term::Variable(name) => 1 + bound(name),
        Term::Literal(Literal::Simple(value)) => 2 + bound(value),
        Term::Literal(Literal::LanguageTagged { value, language }) => 3 + bound(value) + bound(language),
        Term::Literal(Literal::Typed { value, datatype }) => 6 + bound(value) + bound(datatype),
    }
}

/// Encode `term` into `buf`, returning the number of bytes written.
pub fn encode(term: &Term, buf: &mut [u8]) -> Result<usize, CodecError> {
    let mut out = SliceWriter { buf, pos: 0 };
    write_term(term, &mut out)?;
    Ok(out.pos)
}

pub fn encode_to_vec(term: &Term) -> Vec<u8> {
    let mut out = Vec::with_capacity(max_encoded_size(term));
    // writing into a Vec cannot fail
    let _ = write_term(term, &mut out);
    out
}

pub fn encode_to_string(term: &Term) -> String {
    // the encoder only ever emits valid utf-8
    String::from_utf8(encode_to_vec(term)).unwrap_or_default()
}

trait Sink {
    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError>;
}

impl Sink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Sink for SliceWriter<'_> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(CodecError::BufferTooSmall { needed: end, available: self.buf.len() });
        }

        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}

fn write_term<S: Sink>(term: &Term, out: &mut S) -> Result<(), CodecError> {
    match term {
        Term::Uri(iri) => write_iri(iri, out),
        Term::BlankNode(label) => {
            out.put(b"_:")?;
            write_escaped(label, out, false)
        },
        Term::Variable(name) => {
            out.put(b"?")?;
            write_escaped(name, out, false)
        },
        Term::Literal(literal) => {
            out.put(b"\"")?;
            write_escaped(literal.lexical_form(), out, false)?;
            out.put(b"\"")?;

            match literal {
                Literal::Simple(_) => Ok(()),
                Literal::LanguageTagged { language, .. } => {
                    out.put(b"@")?;
                    write_escaped(language, out, false)
                },
                Literal::Typed { datatype, .. } => {
                    out.put(b"^^")?;
                    write_iri(datatype, out)
                },
            }
        },
    }
}

fn write_iri<S: Sink>(iri: &str, out: &mut S) -> Result<(), CodecError> {
    out.put(b"<")?;
    write_escaped(iri, out, true)?;
    out.put(b">")
}

fn write_escaped<S: Sink>(s: &str, out: &mut S, iri: bool) -> Result<(), CodecError> {
    let mut start = 0;

    for (ix, c) in s.char_indices() {
        let needs_escape = c.is_ascii_control()
            || c == '\\'
            || c == '"'
            || (iri && matches!(c, '<' | '>' | '{' | '}' | '|' | '^' | '`' | ' '));

        if !needs_escape {
            continue;
        }

        out.put(&s.as_bytes()[start..ix])?;
        start = ix + c.len_utf8();

        match (c, iri) {
            ('\\', false) => out.put(b"\\\\")?,
            ('"', false) => out.put(b"\\\"")?,
            ('\n', false) => out.put(b"\\n")?,
            ('\r', false) => out.put(b"\\r")?,
            ('\t', false) => out.put(b"\\t")?,
            _ => out.put(format!("\\u{:04X}", c as u32).as_bytes())?,
        }
    }

    out.put(&s.as_bytes()[start..])
}

fn malformed(msg: impl Into<String>) -> CodecError {
    CodecError::Malformed(msg.into())
}

pub fn decode(bytes: &[u8]) -> Result<Term, CodecError> {
    let s = std::str::from_utf8(bytes).map_err(|e| malformed(format!("invalid utf-8: {e}")))?;

    if let Some(rest) = s.strip_prefix("_:") {
        return Ok(Term::BlankNode(unescape(rest)?));
    }

    if let Some(rest) = s.strip_prefix('?') {
        return Ok(Term::Variable(unescape(rest)?));
    }

    if s.starts_with('<') {
        return decode_iri(s).map(Term::Uri);
    }

    if let Some(rest) = s.strip_prefix('"') {
        return decode_literal(rest).map(Term::Literal);
    }

    Err(malformed(format!("unrecognized term form: {s:?}")))
}

fn decode_iri(s: &str) -> Result<String, CodecError> {
    let inner = s
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .ok_or_else(|| malformed(format!("unterminated IRI: {s:?}")))?;

    if inner.contains(['<', '>']) {
        return Err(malformed(format!("unescaped angle bracket in IRI: {s:?}")));
    }

    unescape(inner)
}

/// `s` is the literal without its opening quote.
fn decode_literal(s: &str) -> Result<Literal, CodecError> {
    let mut escaped = false;
    let mut close = None;

    for (ix, c) in s.char_indices() {
        match (escaped, c) {
            (true, _) => escaped = false,
            (false, '\\') => escaped = true,
            (false, '"') => {
                close = Some(ix);
                break;
            },
            _ => (),
        }
    }

    let close = close.ok_or_else(|| malformed("unterminated literal"))?;
    let value = unescape(&s[..close])?;
    let suffix = &s[close + 1..];

    if suffix.is_empty() {
        Ok(Literal::Simple(value))
    } else if let Some(language) = suffix.strip_prefix('@') {
        // an empty tag is still a language-tagged literal, distinct from a simple one
        Ok(Literal::LanguageTagged { value, language: unescape(language)? })
    } else if let Some(datatype) = suffix.strip_prefix("^^") {
        Ok(Literal::Typed { value, datatype: decode_iri(datatype)? })
    } else {
        Err(malformed(format!("unexpected literal suffix: {suffix:?}")))
    }
}

fn unescape(s: &str) -> Result<String, CodecError> {
    if !s.contains('\\') {
        return Ok(s.to_owned());
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('u') => out.push(unescape_hex(&mut chars, 4)?),
            Some('U') => out.push(unescape_hex(&mut chars, 8)?),
            Some(other) => return Err(malformed(format!("unknown escape \\{other}"))),
            None => return Err(malformed("dangling escape at end of input")),
        }
    }

    Ok(out)
}

fn unescape_hex(chars: &mut std::str::Chars<'_>, digits: usize) -> Result<char, CodecError> {
    let hex: String = chars.by_ref().take(digits).collect();
    if hex.len() != digits {
        return Err(malformed("truncated unicode escape"));
    }

    u32::from_str_radix(&hex, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| malformed(format!("invalid unicode escape {hex:?}")))
}
