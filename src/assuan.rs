//! Assuan wire codec: line parsing, percent-escaping, response encoding.
//!
//! The protocol is line-oriented: `COMMAND[ PARAMETER]\n`. Parameters may
//! carry arbitrary text, so carriage returns, line feeds, and literal `%`
//! are percent-escaped (`%0D`, `%0A`, `%25`) to keep the framing intact.
//! Everything here is a pure function over strings; socket I/O lives in
//! [`crate::connection`].

/// Split a raw input line into `(command, param)`.
///
/// The command is the token before the first space; the param is the rest
/// of the line, percent-decoded. A line with no space has an empty param;
/// an empty line yields `("", "")`. This never fails — unparsable input
/// degrades to the empty command, which the dispatcher treats as a no-op.
pub fn parse_line(line: &str) -> (&str, String) {
    match line.split_once(' ') {
        Some((command, rest)) => (command, decode(rest)),
        None => (line, String::new()),
    }
}

/// Percent-decode an Assuan parameter.
///
/// Every `%XX` (upper or lower hex) becomes the corresponding byte value.
/// Sequences that are not exactly `%` + two hex digits pass through
/// verbatim.
pub fn decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];
        match tail.get(..2) {
            Some(hex) if hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
                // Two ASCII hex digits always parse.
                let byte = u8::from_str_radix(hex, 16).unwrap_or_default();
                out.push(char::from(byte));
                rest = &tail[2..];
            }
            _ => {
                out.push('%');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Percent-encode text for inclusion in a response payload.
///
/// Only `\r`, `\n`, and `%` are escaped (uppercase hex, two digits); a
/// human-entered secret containing a newline must not break the
/// line-oriented framing.
pub fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            '%' => out.push_str("%25"),
            c => out.push(c),
        }
    }
    out
}

/// A single response line, ready to be encoded onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `OK` with an optional message.
    Ok(Option<String>),
    /// `Err` with an optional message.
    ///
    /// The keyword is literally `Err`, not the protocol-conventional
    /// `ERR`. The client this daemon was built against expects this exact
    /// casing, so it is kept as a compatibility contract.
    Err(Option<String>),
    /// `D <data>` — carries the requested secret value.
    Data(String),
    /// `END`.
    End,
    /// `# <message>` — comment line.
    Comment(String),
}

impl Response {
    /// Convenience constructor for `OK <message>`.
    pub fn ok(message: impl Into<String>) -> Self {
        Self::Ok(Some(message.into()))
    }

    /// Convenience constructor for `Err <message>`.
    pub fn err(message: impl Into<String>) -> Self {
        Self::Err(Some(message.into()))
    }

    /// Encode this response as one newline-terminated wire line.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Ok(None) => "OK\n".to_string(),
            Self::Ok(Some(msg)) => format!("OK {}\n", encode(msg)),
            Self::Err(None) => "Err\n".to_string(),
            Self::Err(Some(msg)) => format!("Err {}\n", encode(msg)),
            Self::Data(data) => format!("D {}\n", encode(data)),
            Self::End => "END\n".to_string(),
            Self::Comment(msg) => format!("# {}\n", encode(msg)),
        }
    }
}
