//! IRC line parsing and formatting.
//!
//! Wire format: `[@tags] [:prefix] COMMAND [params...] [:trailing]\r\n`

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing command")]
    MissingCommand,
}

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Self {
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut rest = line.trim_end_matches(['\r', '\n']).trim_start();
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut tags = HashMap::new();
        if let Some(tagged) = rest.strip_prefix('@') {
            let (raw_tags, after) = tagged.split_once(' ').unwrap_or((tagged, ""));
            for tag in raw_tags.split(';').filter(|t| !t.is_empty()) {
                let (key, value) = tag.split_once('=').unwrap_or((tag, ""));
                tags.insert(key.to_string(), unescape_tag(value));
            }
            rest = after.trim_start();
        }

        let mut prefix = None;
        if let Some(prefixed) = rest.strip_prefix(':') {
            let (p, after) = prefixed.split_once(' ').unwrap_or((prefixed, ""));
            prefix = Some(p.to_string());
            rest = after.trim_start();
        }

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            let (param, after) = rest.split_once(' ').unwrap_or((rest, ""));
            params.push(param.to_string());
            rest = after;
        }

        Ok(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nick part of the prefix (`nick!user@host`).
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .and_then(|p| p.split('!').next())
            .filter(|n| !n.is_empty())
    }

    /// True if the prefix names a user rather than a server.
    pub fn from_user(&self) -> bool {
        self.prefix.as_deref().is_some_and(|p| p.contains('!'))
    }

    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Strip line breaks so a parameter cannot smuggle a second command.
pub fn sanitize(param: &str) -> String {
    param.chars().filter(|c| *c != '\r' && *c != '\n' && *c != '\0').collect()
}

impl fmt::Display for Message {
    /// Serialize without tags; the last parameter becomes trailing when needed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            let param = sanitize(param);
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_privmsg() {
        let msg = Message::parse(":alice!a@host PRIVMSG #rust :hello there\r\n").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#rust", "hello there"]);
        assert_eq!(msg.source_nick(), Some("alice"));
        assert!(msg.from_user());
    }

    #[test]
    fn parse_tags_and_numeric() {
        let line = "@time=2024-01-01T00:00:00Z;msgid=a\\sb :srv 353 me = #x :@op +v plain";
        let msg = Message::parse(line).unwrap();
        assert_eq!(msg.tags["time"], "2024-01-01T00:00:00Z");
        assert_eq!(msg.tags["msgid"], "a b");
        assert_eq!(msg.command, "353");
        assert_eq!(msg.params, vec!["me", "=", "#x", "@op +v plain"]);
        assert!(!msg.from_user());
    }

    #[test]
    fn parse_without_prefix() {
        let msg = Message::parse("PING :irc.example.net").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.params, vec!["irc.example.net"]);
    }

    #[test]
    fn parse_rejects_empty() {
        assert_eq!(Message::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(Message::parse(":prefix.only"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn display_adds_trailing_and_strips_newlines() {
        let msg = Message::new("PRIVMSG", vec!["#rust", "hi\r\nQUIT :bye"]);
        assert_eq!(msg.to_string(), "PRIVMSG #rust :hiQUIT :bye");
        let msg = Message::new("JOIN", vec!["#rust", "key"]);
        assert_eq!(msg.to_string(), "JOIN #rust key");
    }
}
