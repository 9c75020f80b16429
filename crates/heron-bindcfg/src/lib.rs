//! `named.conf` scanning.
//!
//! Extracts the first `controls { inet ... }` statement and joins it with
//! the referenced `key` clause to produce the rndc control access point.
//! This is a targeted scanner, not a full named.conf grammar: it only
//! understands the statements the agent needs for discovery.

use heron_common::comments::strip_comments;

/// Default rndc control channel port.
pub const DEFAULT_CONTROL_PORT: u16 = 953;

/// Default statistics channel port.
pub const DEFAULT_STATISTICS_PORT: u16 = 80;

/// The control channel of a named instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlChannel {
    pub address: String,
    pub port: u16,
    /// `"<algorithm>:<secret>"` of the referenced key, when resolvable.
    pub key: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindCfgError {
    #[error("no controls statement found")]
    NoControls,
    #[error("malformed controls statement: {0}")]
    Malformed(String),
}

/// Parse the first `controls { inet <addr> [port <n>] ... keys { "<name>"; }; };`
/// statement of a named.conf document and resolve its key reference.
pub fn parse_control_channel(input: &str) -> Result<ControlChannel, BindCfgError> {
    let text = strip_comments(input);
    let controls = block_after_keyword(&text, "controls").ok_or(BindCfgError::NoControls)?;

    let inet_pos = find_keyword(controls, "inet")
        .ok_or_else(|| BindCfgError::Malformed("controls has no inet clause".into()))?;
    let mut tokens = tokenize(&controls[inet_pos + "inet".len()..]);

    let address = tokens
        .next()
        .ok_or_else(|| BindCfgError::Malformed("inet clause has no address".into()))?;
    // A '*' listens on all interfaces; keep the loopback as connect target.
    let address = if address == "*" {
        "127.0.0.1".to_string()
    } else {
        address
    };

    let mut port = DEFAULT_CONTROL_PORT;
    let mut key_name = None;
    while let Some(token) = tokens.next() {
        match token.as_str() {
            "port" => {
                let value = tokens
                    .next()
                    .ok_or_else(|| BindCfgError::Malformed("port clause has no value".into()))?;
                port = value
                    .parse()
                    .map_err(|_| BindCfgError::Malformed(format!("bad port: {value}")))?;
            }
            "keys" => {
                // First quoted name inside the keys block.
                key_name = tokens.find(|t| t.starts_with('"'));
                break;
            }
            _ => {}
        }
    }

    let key = key_name
        .map(|name| name.trim_matches('"').to_string())
        .and_then(|name| resolve_key(&text, &name));

    Ok(ControlChannel { address, port, key })
}

/// Parse the first `statistics-channels { inet <addr> [port <n>] ... };`
/// statement, when present.
pub fn parse_statistics_channel(input: &str) -> Option<ControlChannel> {
    let text = strip_comments(input);
    let block = block_after_keyword(&text, "statistics-channels")?;
    let inet_pos = find_keyword(block, "inet")?;
    let mut tokens = tokenize(&block[inet_pos + "inet".len()..]);

    let address = tokens.next()?;
    let address = if address == "*" {
        "127.0.0.1".to_string()
    } else {
        address
    };

    let mut port = DEFAULT_STATISTICS_PORT;
    while let Some(token) = tokens.next() {
        if token == "port" {
            port = tokens.next()?.parse().ok()?;
            break;
        }
    }

    Some(ControlChannel {
        address,
        port,
        key: None,
    })
}

/// Look up a `key "<name>" { algorithm ...; secret "..."; };` clause and
/// render it as `"<algorithm>:<secret>"`.
fn resolve_key(text: &str, name: &str) -> Option<String> {
    let mut search = 0;
    while let Some(rel) = text[search..].find("key") {
        let start = search + rel;
        search = start + 3;
        // Accept both `key` and `keys` clause spellings.
        let after = text[start..].trim_start_matches("keys").trim_start_matches("key");
        let after = after.trim_start();
        if !after.starts_with('"') {
            continue;
        }
        let clause_name: String = after.chars().skip(1).take_while(|c| *c != '"').collect();
        if clause_name != name {
            continue;
        }
        // Skip the quoted name; an unterminated quote ends the scan.
        let rest_start = 1 + clause_name.len() + 1;
        if rest_start > after.len() {
            return None;
        }
        let body = block_after(&after[rest_start..])?;
        let algorithm = clause_value(body, "algorithm")?;
        let secret = clause_value(body, "secret")?;
        return Some(format!("{algorithm}:{secret}"));
    }
    None
}

/// The `<keyword> ... ;` value inside a block, unquoted.
fn clause_value<'a>(body: &'a str, keyword: &str) -> Option<String> {
    let pos = find_keyword(body, keyword)?;
    let rest = body[pos + keyword.len()..].trim_start();
    let value: String = rest.chars().take_while(|c| *c != ';').collect();
    let value = value.trim().trim_matches('"').to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// The content of the brace block following the first occurrence of
/// `keyword` used as a bare statement.
fn block_after_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let pos = find_keyword(text, keyword)?;
    block_after(&text[pos + keyword.len()..])
}

/// The content between the first `{` and its matching `}`.
fn block_after(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    let mut depth = 0usize;
    for (offset, c) in text[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open + 1..open + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Position of `keyword` delimited by non-identifier characters.
fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    let mut search = 0;
    while let Some(rel) = text[search..].find(keyword) {
        let pos = search + rel;
        let before_ok = pos == 0
            || !text[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_');
        let after = pos + keyword.len();
        let after_ok = !text[after..]
            .chars()
            .next()
            .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_');
        if before_ok && after_ok {
            return Some(pos);
        }
        search = pos + keyword.len();
    }
    None
}

/// Whitespace-and-punctuation tokens; quoted strings are single tokens.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    let mut chars = text.chars().peekable();
    std::iter::from_fn(move || {
        loop {
            match chars.peek() {
                Some(c) if c.is_whitespace() || *c == '{' || *c == '}' || *c == ';' => {
                    chars.next();
                }
                _ => break,
            }
        }
        let first = *chars.peek()?;
        let mut token = String::new();
        if first == '"' {
            token.push(chars.next()?);
            for c in chars.by_ref() {
                token.push(c);
                if c == '"' {
                    break;
                }
            }
            return Some(token);
        }
        while let Some(c) = chars.peek() {
            if c.is_whitespace() || *c == '{' || *c == '}' || *c == ';' {
                break;
            }
            token.push(chars.next()?);
        }
        Some(token)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMED_CONF: &str = r#"
        key "rndc-key" {
            algorithm "hmac-md5";
            secret "abcd";
        };
        controls {
            inet 127.0.0.53 port 5353 allow { localhost; } keys { "rndc-key"; };
        };
    "#;

    #[test]
    fn parses_controls_with_key() {
        let channel = parse_control_channel(NAMED_CONF).unwrap();
        assert_eq!(channel.address, "127.0.0.53");
        assert_eq!(channel.port, 5353);
        assert_eq!(channel.key.as_deref(), Some("hmac-md5:abcd"));
    }

    #[test]
    fn accepts_keys_clause_spelling() {
        let text = r#"
            keys "frog" { algorithm hmac-sha256; secret "c2Vjcg=="; };
            controls { inet 10.0.0.1 keys { "frog"; }; };
        "#;
        let channel = parse_control_channel(text).unwrap();
        assert_eq!(channel.address, "10.0.0.1");
        assert_eq!(channel.port, DEFAULT_CONTROL_PORT);
        assert_eq!(channel.key.as_deref(), Some("hmac-sha256:c2Vjcg=="));
    }

    #[test]
    fn default_port_applies_when_omitted() {
        let text = r#"controls { inet 192.0.2.1 allow { any; }; };"#;
        let channel = parse_control_channel(text).unwrap();
        assert_eq!(channel.port, DEFAULT_CONTROL_PORT);
        assert_eq!(channel.key, None);
    }

    #[test]
    fn wildcard_address_becomes_loopback() {
        let text = r#"controls { inet * port 953 allow { any; }; };"#;
        let channel = parse_control_channel(text).unwrap();
        assert_eq!(channel.address, "127.0.0.1");
    }

    #[test]
    fn missing_controls_is_an_error() {
        assert_eq!(
            parse_control_channel("options { recursion no; };"),
            Err(BindCfgError::NoControls)
        );
        assert_eq!(parse_control_channel(""), Err(BindCfgError::NoControls));
    }

    #[test]
    fn unresolvable_key_reference_yields_none() {
        let text = r#"controls { inet 10.0.0.1 keys { "ghost"; }; };"#;
        let channel = parse_control_channel(text).unwrap();
        assert_eq!(channel.key, None);
    }

    #[test]
    fn parses_statistics_channel() {
        let text = r#"
            statistics-channels {
                inet 127.0.0.1 port 8053 allow { localhost; };
            };
        "#;
        let channel = parse_statistics_channel(text).unwrap();
        assert_eq!(channel.address, "127.0.0.1");
        assert_eq!(channel.port, 8053);
        assert_eq!(channel.key, None);
    }

    #[test]
    fn statistics_channel_default_port() {
        let text = r#"statistics-channels { inet 10.0.0.2; };"#;
        let channel = parse_statistics_channel(text).unwrap();
        assert_eq!(channel.port, DEFAULT_STATISTICS_PORT);
        assert!(parse_statistics_channel("options { };").is_none());
    }

    #[test]
    fn comments_are_stripped_before_parsing() {
        let text = r#"
            // control channel
            controls {
                inet 127.0.0.1 port 9953 /* allow { any; } */ allow { localhost; };
            };
        "#;
        let channel = parse_control_channel(text).unwrap();
        assert_eq!(channel.address, "127.0.0.1");
        assert_eq!(channel.port, 9953);
    }
}
