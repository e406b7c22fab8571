//! Wire framing for the control protocol.
//!
//! Replies are CRLF-terminated lines of the form `NNNx text`, where `NNN` is
//! a 3-digit status code and `x` is `'-'` (more lines follow), `'+'` (a data
//! block follows, terminated by a lone `.`), or `' '` (final line). Status
//! 650 marks an asynchronous event; everything else answers the command in
//! flight.

use crate::error::{Result, TorError};
use std::collections::HashMap;

/// Status code of asynchronous event replies.
pub const STATUS_ASYNC: u16 = 650;

/// One parsed reply line.
#[derive(Debug, Clone)]
pub struct ReplyLine {
    /// 3-digit status code.
    pub status: u16,
    /// `'-'`, `'+'` or `' '`.
    pub separator: char,
    /// Text after the separator.
    pub text: String,
}

impl ReplyLine {
    /// Parse one line with the CRLF already stripped.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() < 4 || !raw.is_char_boundary(3) {
            return Err(TorError::Parse(format!("reply line too short: {raw:?}")));
        }
        let status: u16 = raw[..3]
            .parse()
            .map_err(|_| TorError::Parse(format!("bad status code in {raw:?}")))?;
        let separator = raw.as_bytes()[3] as char;
        if !matches!(separator, ' ' | '-' | '+') {
            return Err(TorError::Parse(format!(
                "bad separator {separator:?} in {raw:?}"
            )));
        }
        Ok(ReplyLine {
            status,
            separator,
            text: raw[4..].to_string(),
        })
    }

    /// Final line of a reply.
    pub fn is_final(&self) -> bool {
        self.separator == ' '
    }

    /// Line introducing a dot-terminated data block.
    pub fn opens_data(&self) -> bool {
        self.separator == '+'
    }
}

/// A complete reply: one or more lines sharing a command slot.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Status code of the first line.
    pub status: u16,
    /// Text of every line, in order.
    pub lines: Vec<String>,
    /// Contents of any data blocks, unescaped, one entry per `'+'` line.
    pub data: Vec<String>,
}

impl Reply {
    pub(crate) fn from_lines(lines: Vec<ReplyLine>, data: Vec<String>) -> Result<Self> {
        let first = lines
            .first()
            .ok_or_else(|| TorError::Parse("empty reply".into()))?;
        Ok(Reply {
            status: first.status,
            lines: lines.into_iter().map(|l| l.text).collect(),
            data,
        })
    }

    /// 2xx means the command was accepted.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// This reply is an unsolicited event.
    pub fn is_event(&self) -> bool {
        self.status == STATUS_ASYNC
    }

    /// First line's text, or `""`.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    /// Turn a non-success status into [`TorError::Protocol`].
    pub fn ok(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TorError::Protocol {
                code: self.status,
                message: self.lines.join("\n"),
            })
        }
    }

    /// Find the value of a `key=value` line.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find_map(|l| l.strip_prefix(key).and_then(|r| r.strip_prefix('=')))
    }
}

/// Assemble a command line: keyword, space-joined arguments, CRLF.
pub fn format_command(keyword: &str, args: &[&str]) -> String {
    let mut out = String::from(keyword);
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out.push_str("\r\n");
    out
}

/// Quote an argument if it contains anything outside the safe set.
///
/// The control protocol accepts bare keywords unquoted; everything else goes
/// in a QuotedString with `\` escapes.
pub fn quote_arg(s: &str) -> String {
    let bare = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '='));
    if bare {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Unescape a dot-terminated data block line.
pub(crate) fn unescape_data_line(line: &str) -> &str {
    line.strip_prefix('.').map_or(line, |rest| {
        if rest.is_empty() {
            line
        } else {
            rest
        }
    })
}

/// Parse space-separated `KEY=value` pairs, honoring QuotedStrings.
pub fn parse_pairs(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut rest = text.trim_start();
    while let Some(eq) = rest.find('=') {
        // Bare tokens without '=' (severity words, action names) are skipped.
        let key = rest[..eq].rsplit(' ').next().unwrap_or("").to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let (parsed, remainder) = take_quoted(stripped);
            value = parsed;
            rest = remainder;
        } else {
            let end = rest.find(' ').unwrap_or(rest.len());
            value = rest[..end].to_string();
            rest = &rest[end..];
        }
        out.insert(key, value);
        rest = rest.trim_start();
    }
    out
}

/// Consume the body of a QuotedString (opening quote already stripped),
/// returning the unescaped value and the text after the closing quote.
fn take_quoted(s: &str) -> (String, &str) {
    let mut value = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return (value, &s[i + 1..]),
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    value.push(match escaped {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => other,
                    });
                }
            }
            other => value.push(other),
        }
    }
    (value, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_mid_and_data_lines() {
        let fin = ReplyLine::parse("250 OK").unwrap();
        assert_eq!(fin.status, 250);
        assert!(fin.is_final());
        assert_eq!(fin.text, "OK");

        let mid = ReplyLine::parse("250-SocksPort=9050").unwrap();
        assert!(!mid.is_final());
        assert!(!mid.opens_data());

        let data = ReplyLine::parse("250+config-text=").unwrap();
        assert!(data.opens_data());
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(ReplyLine::parse("25").is_err());
        assert!(ReplyLine::parse("").is_err());
        assert!(ReplyLine::parse("abc OK").is_err());
        assert!(ReplyLine::parse("250/OK").is_err());
    }

    #[test]
    fn reply_ok_surfaces_status() {
        let reply = Reply::from_lines(vec![ReplyLine::parse("551 busy").unwrap()], vec![]).unwrap();
        match reply.ok() {
            Err(TorError::Protocol { code, message }) => {
                assert_eq!(code, 551);
                assert_eq!(message, "busy");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn reply_value_lookup() {
        let reply = Reply::from_lines(
            vec![
                ReplyLine::parse("250-version=0.4.8.12").unwrap(),
                ReplyLine::parse("250 OK").unwrap(),
            ],
            vec![],
        )
        .unwrap();
        assert_eq!(reply.value_of("version"), Some("0.4.8.12"));
        assert_eq!(reply.value_of("missing"), None);
    }

    #[test]
    fn event_replies_are_flagged() {
        let reply =
            Reply::from_lines(vec![ReplyLine::parse("650 CIRC 1 BUILT").unwrap()], vec![]).unwrap();
        assert!(reply.is_event());
    }

    #[test]
    fn command_formatting() {
        assert_eq!(
            format_command("GETINFO", &["net/listeners/socks"]),
            "GETINFO net/listeners/socks\r\n"
        );
        assert_eq!(format_command("TAKEOWNERSHIP", &[]), "TAKEOWNERSHIP\r\n");
    }

    #[test]
    fn quoting_rules() {
        assert_eq!(quote_arg("SocksPort=9050"), "SocksPort=9050");
        assert_eq!(quote_arg("80 127.0.0.1:8080"), "\"80 127.0.0.1:8080\"");
        assert_eq!(quote_arg("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote_arg(""), "\"\"");
    }

    #[test]
    fn pair_parsing_handles_quotes() {
        let pairs = parse_pairs("PROGRESS=85 TAG=ap_conn SUMMARY=\"Connecting to relay\"");
        assert_eq!(pairs["PROGRESS"], "85");
        assert_eq!(pairs["SUMMARY"], "Connecting to relay");
    }

    #[test]
    fn pair_parsing_skips_bare_tokens() {
        let pairs = parse_pairs("NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"");
        assert_eq!(pairs["PROGRESS"], "100");
        assert_eq!(pairs["TAG"], "done");
        assert!(!pairs.contains_key("NOTICE BOOTSTRAP PROGRESS"));
    }

    #[test]
    fn pair_parsing_handles_escapes() {
        let pairs = parse_pairs(r#"MSG="line1\nline2" PATH="C:\\tor""#);
        assert_eq!(pairs["MSG"], "line1\nline2");
        assert_eq!(pairs["PATH"], "C:\\tor");
    }

    #[test]
    fn data_line_unescaping() {
        assert_eq!(unescape_data_line("..dotted"), ".dotted");
        assert_eq!(unescape_data_line("plain"), "plain");
    }
}
