//! Lenient JSON object extraction for model output.
//!
//! Models wrap JSON in prose or code fences, and while streaming the text is
//! a growing prefix of the final object.  [`extract_object`] finds the first
//! complete object in a reply; [`parse_partial_object`] closes a truncated
//! object at the last point where the prefix is still meaningful, so a UI can
//! render fields before the reply is finished.

use serde_json::{Map, Value};

/// The first complete JSON object embedded in `text`, ignoring anything
/// before or after it.
pub fn extract_object(text: &str) -> Option<Map<String, Value>> {
    text.match_indices('{').find_map(|(start, _)| {
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(Value::Object(map))) => Some(map),
            _ => None,
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectState {
    /// After `{` or `,`: a key (or `}`) comes next.
    Key,
    /// After a key: `:` comes next.
    Colon,
    /// After `:`: a value comes next.
    Value,
    /// After a value: `,` or `}` comes next.
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Object(ObjectState),
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringKind {
    Key,
    Value,
}

/// A prefix length plus the suffix that turns that prefix into valid JSON.
#[derive(Debug)]
struct Checkpoint {
    end: usize,
    suffix: String,
}

struct Scanner {
    stack: Vec<Frame>,
    string: Option<StringKind>,
    escaped: bool,
    unicode_left: u8,
    scalar_start: Option<usize>,
    checkpoint: Option<Checkpoint>,
}

impl Scanner {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            string: None,
            escaped: false,
            unicode_left: 0,
            scalar_start: None,
            checkpoint: None,
        }
    }

    fn mark(&mut self, end: usize, inside_string: bool) {
        let mut suffix = String::with_capacity(self.stack.len() + 1);
        if inside_string {
            suffix.push('"');
        }
        for frame in self.stack.iter().rev() {
            suffix.push(match frame {
                Frame::Object(_) => '}',
                Frame::Array => ']',
            });
        }
        self.checkpoint = Some(Checkpoint { end, suffix });
    }

    fn complete_value(&mut self, end: usize) {
        if let Some(Frame::Object(state)) = self.stack.last_mut() {
            *state = ObjectState::Next;
        }
        self.mark(end, false);
    }

    /// Feed one character; returns `false` once scanning should stop.
    fn feed(&mut self, body: &str, at: usize, ch: char) -> bool {
        let next = at + ch.len_utf8();

        if let Some(kind) = self.string {
            let in_value = kind == StringKind::Value;
            if self.unicode_left > 0 {
                self.unicode_left -= 1;
                if self.unicode_left == 0 && in_value {
                    self.mark(next, true);
                }
            } else if self.escaped {
                self.escaped = false;
                if ch == 'u' {
                    self.unicode_left = 4;
                } else if in_value {
                    self.mark(next, true);
                }
            } else if ch == '\\' {
                self.escaped = true;
            } else if ch == '"' {
                self.string = None;
                match kind {
                    StringKind::Key => {
                        if let Some(Frame::Object(state)) = self.stack.last_mut() {
                            *state = ObjectState::Colon;
                        }
                    }
                    StringKind::Value => self.complete_value(next),
                }
            } else if in_value {
                self.mark(next, true);
            }
            return true;
        }

        if let Some(start) = self.scalar_start {
            if is_scalar_char(ch) {
                return true;
            }
            self.scalar_start = None;
            if serde_json::from_str::<Value>(&body[start..at]).is_err() {
                return false;
            }
            self.complete_value(at);
        }

        match ch {
            '{' => {
                self.stack.push(Frame::Object(ObjectState::Key));
                self.mark(next, false);
            }
            '[' => {
                self.stack.push(Frame::Array);
                self.mark(next, false);
            }
            '}' | ']' => {
                self.stack.pop();
                if self.stack.is_empty() {
                    self.mark(next, false);
                    return false;
                }
                self.complete_value(next);
            }
            '"' => {
                let kind = match self.stack.last() {
                    Some(Frame::Object(ObjectState::Key)) => StringKind::Key,
                    _ => StringKind::Value,
                };
                self.string = Some(kind);
                if kind == StringKind::Value {
                    self.mark(next, true);
                }
            }
            ':' => {
                if let Some(Frame::Object(state)) = self.stack.last_mut() {
                    *state = ObjectState::Value;
                }
            }
            ',' => {
                if let Some(Frame::Object(state)) = self.stack.last_mut() {
                    *state = ObjectState::Key;
                }
            }
            c if c.is_whitespace() => {}
            c if is_scalar_char(c) => self.scalar_start = Some(at),
            _ => return false,
        }
        true
    }
}

fn is_scalar_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '+' | '.')
}

/// Best-effort decode of a possibly truncated JSON object.
///
/// The object is cut back to the last position where the prefix is
/// meaningful: inside a value string, after a finished value, or right after
/// an opening bracket.  Keys and bare scalars (numbers, `true`, `null`) are
/// only revealed once they are complete.  Returns `None` when no object has
/// started yet.
pub fn parse_partial_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let body = &text[start..];

    let mut scanner = Scanner::new();
    for (at, ch) in body.char_indices() {
        if !scanner.feed(body, at, ch) {
            break;
        }
    }

    let Checkpoint { end, suffix } = scanner.checkpoint?;
    let mut candidate = String::with_capacity(end + suffix.len());
    candidate.push_str(&body[..end]);
    candidate.push_str(&suffix);

    match serde_json::from_str::<Value>(&candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partial(text: &str) -> Option<Value> {
        parse_partial_object(text).map(Value::Object)
    }

    #[test]
    fn open_string_value_is_revealed() {
        assert_eq!(
            partial(r#"{"chat_message": "Hel"#),
            Some(json!({"chat_message": "Hel"}))
        );
    }

    #[test]
    fn unfinished_key_is_dropped() {
        assert_eq!(
            partial(r#"{"chat_message": "Hello", "mo"#),
            Some(json!({"chat_message": "Hello"}))
        );
        assert_eq!(
            partial(r#"{"chat_message": "Hello", "mood":"#),
            Some(json!({"chat_message": "Hello"}))
        );
    }

    #[test]
    fn open_scalars_wait_for_a_delimiter() {
        assert_eq!(partial(r#"{"n": 12"#), Some(json!({})));
        assert_eq!(partial(r#"{"n": 12,"#), Some(json!({"n": 12})));
        assert_eq!(
            partial(r#"{"ok": true, "b": fal"#),
            Some(json!({"ok": true}))
        );
    }

    #[test]
    fn escapes_are_never_split() {
        assert_eq!(partial(r#"{"a": "x\"#), Some(json!({"a": "x"})));
        assert_eq!(partial(r#"{"a": "x\n"#), Some(json!({"a": "x\n"})));
        assert_eq!(partial(r#"{"a": "x\u00e"#), Some(json!({"a": "x"})));
        assert_eq!(partial(r#"{"a": "xé"#), Some(json!({"a": "xé"})));
    }

    #[test]
    fn nested_containers_are_closed() {
        assert_eq!(
            partial(r#"{"tags": ["x", "y"#),
            Some(json!({"tags": ["x", "y"]}))
        );
        assert_eq!(
            partial(r#"{"a": {"b": 1}, "#),
            Some(json!({"a": {"b": 1}}))
        );
    }

    #[test]
    fn surrounding_prose_is_ignored() {
        assert_eq!(
            partial(r#"Here you go: {"chat_message": "hi"} anything else"#),
            Some(json!({"chat_message": "hi"}))
        );
    }

    #[test]
    fn nothing_before_the_first_brace() {
        assert_eq!(partial(""), None);
        assert_eq!(partial("thinking..."), None);
        assert_eq!(partial("{"), Some(json!({})));
    }

    #[test]
    fn every_prefix_decodes_to_a_growing_message() {
        let full = r#"{"chat_message": "Hello there, friend"}"#;
        let mut previous = String::new();
        for end in (1..=full.len()).filter(|&i| full.is_char_boundary(i)) {
            if let Some(map) = parse_partial_object(&full[..end])
                && let Some(text) = map.get("chat_message").and_then(Value::as_str)
            {
                assert!(text.starts_with(&previous), "{text:?} after {previous:?}");
                previous = text.to_owned();
            }
        }
        assert_eq!(previous, "Hello there, friend");
    }

    #[test]
    fn extract_finds_first_complete_object() {
        let text = "```json\n{\"chat_message\": \"hi\"}\n```";
        assert_eq!(
            extract_object(text).map(Value::Object),
            Some(json!({"chat_message": "hi"}))
        );
        assert_eq!(
            extract_object(r#"{oops} then {"a": 1}"#).map(Value::Object),
            Some(json!({"a": 1}))
        );
        assert_eq!(extract_object(r#"{"a": "#), None);
        assert_eq!(extract_object("[1, 2]"), None);
    }
}
