//! Comment stripping for the Kea and BIND 9 configuration dialects.
//!
//! Both dialects accept shell-style `#`, C++-style `//`, and C-style
//! `/* */` comments outside double-quoted strings.

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Code,
    InString,
    Escape,
    LineComment,
    BlockComment,
    BlockCommentStar,
}

/// Remove `#`, `//`, and `/* */` comments from Kea JSON text.
///
/// Comments are replaced, not interpreted; string literals are left
/// untouched, including ones that contain comment markers. Newlines inside
/// line comments are preserved so parse errors keep usable line numbers.
pub fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut state = State::Code;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '"' => {
                    state = State::InString;
                    out.push(c);
                }
                '#' => state = State::LineComment,
                '/' => match chars.peek() {
                    Some('/') => {
                        chars.next();
                        state = State::LineComment;
                    }
                    Some('*') => {
                        chars.next();
                        state = State::BlockComment;
                    }
                    _ => out.push(c),
                },
                _ => out.push(c),
            },
            State::InString => match c {
                '\\' => {
                    state = State::Escape;
                    out.push(c);
                }
                '"' => {
                    state = State::Code;
                    out.push(c);
                }
                _ => out.push(c),
            },
            State::Escape => {
                state = State::InString;
                out.push(c);
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    out.push(c);
                }
            }
            State::BlockComment => {
                if c == '*' {
                    state = State::BlockCommentStar;
                } else if c == '\n' {
                    out.push(c);
                }
            }
            State::BlockCommentStar => match c {
                '/' => state = State::Code,
                '*' => {}
                _ => {
                    if c == '\n' {
                        out.push(c);
                    }
                    state = State::BlockComment;
                }
            },
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_is_untouched() {
        let text = r#"{ "http-port": 8001 }"#;
        assert_eq!(strip_comments(text), text);
    }

    #[test]
    fn strips_line_comments() {
        let text = "{\n// gone\n\"a\": 1, // also gone\n\"b\": 2\n}";
        let stripped = strip_comments(text);
        assert!(!stripped.contains("gone"));
        let parsed: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(parsed["b"], 2);
    }

    #[test]
    fn strips_hash_comments() {
        let text = "{\n#\"a\": 9,\n\"a\": 1 # trailing\n}";
        let parsed: serde_json::Value =
            serde_json::from_str(&strip_comments(text)).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn strips_block_comments_spanning_lines() {
        let text = "{ /*\n\"a\": 9,\n*/ \"a\": 1 }";
        let parsed: serde_json::Value =
            serde_json::from_str(&strip_comments(text)).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn comment_markers_inside_strings_survive() {
        let text = r##"{ "path": "/usr/lib#not-a-comment", "url": "http://x/*y*/z" }"##;
        let stripped = strip_comments(text);
        let parsed: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(parsed["path"], "/usr/lib#not-a-comment");
        assert_eq!(parsed["url"], "http://x/*y*/z");
    }

    #[test]
    fn escaped_quote_does_not_end_string() {
        let text = r#"{ "a": "quote \" // still string" }"#;
        let parsed: serde_json::Value =
            serde_json::from_str(&strip_comments(text)).unwrap();
        assert_eq!(parsed["a"], "quote \" // still string");
    }
}
