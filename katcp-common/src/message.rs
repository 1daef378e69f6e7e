//! KATCP message framing.
//!
//! A KATCP message is a single newline-terminated line:
//!
//! ```text
//! <sigil><name>[<mid>] <arg> <arg> ...
//! ```
//!
//! where the sigil is `?` (request), `!` (reply) or `#` (inform), the optional
//! message id is a positive integer in square brackets, and arguments are
//! separated by runs of spaces or tabs. Whitespace and control characters
//! inside arguments are backslash-escaped; `\@` stands for an empty argument.

use std::fmt;

use thiserror::Error;

/// Errors produced while parsing a KATCP line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown message type {0:?}")]
    UnknownType(char),

    #[error("invalid message name {0:?}")]
    InvalidName(String),

    #[error("invalid message id {0:?}")]
    InvalidMid(String),

    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),

    #[error("argument ends with an unterminated escape")]
    TrailingEscape,
}

/// Message type, given by the leading sigil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Reply,
    Inform,
}

impl MessageKind {
    fn from_sigil(sigil: u8) -> Option<Self> {
        match sigil {
            b'?' => Some(Self::Request),
            b'!' => Some(Self::Reply),
            b'#' => Some(Self::Inform),
            _ => None,
        }
    }

    /// The sigil that introduces messages of this kind.
    pub fn sigil(&self) -> char {
        match self {
            Self::Request => '?',
            Self::Reply => '!',
            Self::Inform => '#',
        }
    }
}

/// A decoded KATCP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub name: String,
    pub mid: Option<u32>,
    pub arguments: Vec<String>,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        name: impl Into<String>,
        mid: Option<u32>,
        arguments: Vec<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            mid,
            arguments,
        }
    }

    /// Build a request message.
    pub fn request(name: impl Into<String>, mid: Option<u32>, arguments: Vec<String>) -> Self {
        Self::new(MessageKind::Request, name, mid, arguments)
    }

    /// Build a reply message.
    pub fn reply(name: impl Into<String>, mid: Option<u32>, arguments: Vec<String>) -> Self {
        Self::new(MessageKind::Reply, name, mid, arguments)
    }

    /// Build an inform message.
    pub fn inform(name: impl Into<String>, mid: Option<u32>, arguments: Vec<String>) -> Self {
        Self::new(MessageKind::Inform, name, mid, arguments)
    }

    /// Parse a single line (trailing `\r\n` is ignored).
    ///
    /// Arguments that are not valid UTF-8 are decoded lossily.
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let line = trim_line_ending(line);
        let mut words = line
            .split(|b| *b == b' ' || *b == b'\t')
            .filter(|word| !word.is_empty());

        let head = words.next().ok_or(ProtocolError::Empty)?;
        let kind = MessageKind::from_sigil(head[0])
            .ok_or(ProtocolError::UnknownType(head[0] as char))?;

        let (name, mid) = split_name_and_mid(&head[1..])?;

        let arguments = words.map(unescape).collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            kind,
            name,
            mid,
            arguments,
        })
    }

    /// Encode the message as a newline-terminated wire line.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.name.len() + 16 + self.arguments.iter().map(|a| a.len() + 1).sum::<usize>(),
        );
        out.push(self.kind.sigil() as u8);
        out.extend_from_slice(self.name.as_bytes());
        if let Some(mid) = self.mid {
            out.extend_from_slice(format!("[{}]", mid).as_bytes());
        }
        for argument in &self.arguments {
            out.push(b' ');
            escape_into(argument, &mut out);
        }
        out.push(b'\n');
        out
    }

    /// Get an argument by position.
    pub fn argument(&self, index: usize) -> Option<&str> {
        self.arguments.get(index).map(String::as_str)
    }

    /// Whether this is a reply whose first argument is `ok`.
    pub fn is_ok(&self) -> bool {
        self.kind == MessageKind::Reply && self.argument(0) == Some("ok")
    }

    /// Check kind and name in one go.
    pub fn is(&self, kind: MessageKind, name: &str) -> bool {
        self.kind == kind && self.name == name
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode();
        let text = String::from_utf8_lossy(&encoded);
        write!(f, "{}", text.trim_end_matches('\n'))
    }
}

fn trim_line_ending(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

fn split_name_and_mid(head: &[u8]) -> Result<(String, Option<u32>), ProtocolError> {
    let (name, mid) = match head.iter().position(|b| *b == b'[') {
        Some(open) => {
            let raw_mid = &head[open + 1..];
            let digits = raw_mid
                .strip_suffix(b"]")
                .ok_or_else(|| ProtocolError::InvalidMid(lossy(raw_mid)))?;
            let mid = std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .filter(|mid| *mid > 0)
                .ok_or_else(|| ProtocolError::InvalidMid(lossy(digits)))?;
            (&head[..open], Some(mid))
        }
        None => (head, None),
    };

    let valid = match name.split_first() {
        Some((first, rest)) => {
            first.is_ascii_alphabetic()
                && rest.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        None => false,
    };
    if !valid {
        return Err(ProtocolError::InvalidName(lossy(name)));
    }

    Ok((lossy(name), mid))
}

fn unescape(raw: &[u8]) -> Result<String, ProtocolError> {
    if raw == b"\\@" {
        return Ok(String::new());
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let escaped = *bytes.next().ok_or(ProtocolError::TrailingEscape)?;
        out.push(match escaped {
            b'\\' => b'\\',
            b'_' => b' ',
            b'0' => 0,
            b'n' => b'\n',
            b'r' => b'\r',
            b'e' => 0x1b,
            b't' => b'\t',
            other => return Err(ProtocolError::InvalidEscape(other as char)),
        });
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn escape_into(argument: &str, out: &mut Vec<u8>) {
    if argument.is_empty() {
        out.extend_from_slice(b"\\@");
        return;
    }
    for &b in argument.as_bytes() {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b' ' => out.extend_from_slice(b"\\_"),
            0 => out.extend_from_slice(b"\\0"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0x1b => out.extend_from_slice(b"\\e"),
            b'\t' => out.extend_from_slice(b"\\t"),
            _ => out.push(b),
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
