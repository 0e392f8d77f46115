//! Recover a single structured action (tool name + arguments) from free-form model output.
//!
//! The blob is isolated with a first-`{` / last-`}` heuristic rather than a balanced scan,
//! so narrative text around the object is tolerated. Any decode failure is a hard error:
//! nothing here guesses at what a malformed blob meant.

use serde::Serialize;
use serde_json::{Map, Value};
use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedAction {
    pub name: String,
    pub arguments: Map<String, Value>,
    /// Text preceding the detected blob (e.g. the model's "Thought:" section).
    pub preamble: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    MalformedJson,
    /// The text encodes more than one action; only one is allowed per reply.
    MultipleToolCalls,
    MissingName,
    InvalidArguments,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
#[error("{message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    /// Byte offset into the input text.
    pub position: usize,
    /// Short window of input around `position`.
    pub snippet: String,
    pub message: String,
}

const SNIPPET_BEFORE: usize = 4;
const SNIPPET_AFTER: usize = 5;

/// Literal separator between two adjacent call objects.
const MULTI_CALL_SEPARATOR: &str = "},\n";

fn window(s: &str, pos: usize, before: usize, after: usize) -> String {
    let mut start = pos.saturating_sub(before).min(s.len());
    while !s.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = pos.saturating_add(after).min(s.len());
    while !s.is_char_boundary(end) {
        end += 1;
    }
    s[start..end].to_string()
}

/// Escape raw control characters inside string literals so the blob decodes the way a
/// non-strict JSON reader would accept it.
///
/// Returns the escaped text plus, for every output byte (and one past the end), the
/// offset of the input byte it came from.
fn escape_control_chars_in_strings(blob: &str) -> (String, Vec<usize>) {
    let mut out = String::with_capacity(blob.len());
    let mut origin = Vec::with_capacity(blob.len() + 1);
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in blob.char_indices() {
        if in_string && (ch as u32) < 0x20 {
            let esc = match ch {
                '\n' => "\\n".to_string(),
                '\r' => "\\r".to_string(),
                '\t' => "\\t".to_string(),
                c => format!("\\u{:04x}", c as u32),
            };
            origin.extend(std::iter::repeat(i).take(esc.len()));
            out.push_str(&esc);
            escaped = false;
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if ch == '"' {
            in_string = true;
        }

        origin.extend((0..ch.len_utf8()).map(|k| i + k));
        out.push(ch);
    }
    origin.push(blob.len());
    (out, origin)
}

fn offset_of_line_col(s: &str, line: usize, column: usize) -> usize {
    let line_start = if line <= 1 {
        0
    } else {
        s.match_indices('\n')
            .nth(line - 2)
            .map(|(i, _)| i + 1)
            .unwrap_or(s.len())
    };
    (line_start + column.saturating_sub(1)).min(s.len())
}

struct DecodeFailure {
    /// Byte offset into the blob.
    offset: usize,
    reason: String,
}

/// Decode exactly one JSON value from `blob`, tolerating raw control characters in strings.
fn decode_relaxed(blob: &str) -> Result<Value, DecodeFailure> {
    let (escaped, origin) = escape_control_chars_in_strings(blob);
    let at = |o: usize| origin[o.min(origin.len() - 1)];

    let mut stream = serde_json::Deserializer::from_str(&escaped).into_iter::<Value>();
    match stream.next() {
        None => Err(DecodeFailure {
            offset: 0,
            reason: "expecting value".to_string(),
        }),
        Some(Err(e)) => Err(DecodeFailure {
            offset: at(offset_of_line_col(&escaped, e.line(), e.column())),
            reason: e.to_string(),
        }),
        Some(Ok(value)) => {
            let end = stream.byte_offset();
            let rest = &escaped[end..];
            let trimmed = rest.trim_start_matches([' ', '\t', '\n', '\r']);
            if trimmed.is_empty() {
                Ok(value)
            } else {
                Err(DecodeFailure {
                    offset: at(end + (rest.len() - trimmed.len())),
                    reason: "extra data after JSON value".to_string(),
                })
            }
        }
    }
}

fn arguments_from(value: Option<Value>) -> Option<Map<String, Value>> {
    match value {
        None | Some(Value::Null) => Some(Map::new()),
        Some(Value::Object(m)) => Some(m),
        // Chat-completions tool calls carry arguments as a JSON-encoded string.
        Some(Value::String(s)) if s.trim().is_empty() => Some(Map::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(m)) => Some(m),
            _ => None,
        },
        Some(_) => None,
    }
}

/// Extract one action from `text`.
///
/// If the text has no double quotes, single quotes are first rewritten to double quotes.
/// The blob runs from the first `{` to the last `}`; whatever precedes it is returned as
/// the preamble. An object with no `name` but a `function` envelope is unwrapped.
pub fn parse_action(text: &str) -> Result<ParsedAction, ParseError> {
    let normalized: Cow<'_, str> = if text.contains('"') {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(text.replace('\'', "\""))
    };
    let normalized = normalized.as_ref();

    let (Some(open), Some(close)) = (normalized.find('{'), normalized.rfind('}')) else {
        return Err(ParseError {
            kind: ParseErrorKind::MalformedJson,
            position: 0,
            snippet: window(normalized, 0, 0, SNIPPET_AFTER),
            message: "no JSON object found in action text".to_string(),
        });
    };
    let preamble = normalized[..open].to_string();
    let blob = if close >= open {
        &normalized[open..=close]
    } else {
        ""
    };

    let value = decode_relaxed(blob).map_err(|f| {
        let snippet = window(blob, f.offset, SNIPPET_BEFORE, SNIPPET_AFTER);
        let multi = f.offset >= 1
            && blob.get(f.offset - 1..f.offset + 2) == Some(MULTI_CALL_SEPARATOR);
        if multi {
            ParseError {
                kind: ParseErrorKind::MultipleToolCalls,
                position: open + f.offset,
                snippet,
                message: "invalid JSON: multiple tool calls in one action; provide exactly one"
                    .to_string(),
            }
        } else {
            ParseError {
                kind: ParseErrorKind::MalformedJson,
                position: open + f.offset,
                message: format!(
                    "invalid JSON blob: {} (decoding failed near '{snippet}')",
                    f.reason
                ),
                snippet,
            }
        }
    })?;

    let fail = |kind: ParseErrorKind, message: &str| ParseError {
        kind,
        position: open,
        snippet: window(normalized, open, 0, SNIPPET_AFTER),
        message: message.to_string(),
    };

    let Value::Object(mut obj) = value else {
        return Err(fail(
            ParseErrorKind::MalformedJson,
            "action blob is not a JSON object",
        ));
    };

    if !obj.contains_key("name") {
        if let Some(Value::Object(mut function)) = obj.remove("function") {
            obj = Map::new();
            if let Some(name) = function.remove("name") {
                obj.insert("name".to_string(), name);
            }
            if let Some(args) = function.remove("arguments") {
                obj.insert("arguments".to_string(), args);
            }
        }
    }

    let name = match obj.remove("name") {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        _ => {
            return Err(fail(
                ParseErrorKind::MissingName,
                "action has no non-empty string `name`",
            ))
        }
    };
    let arguments = arguments_from(obj.remove("arguments")).ok_or_else(|| {
        fail(
            ParseErrorKind::InvalidArguments,
            "action `arguments` must be a JSON object",
        )
    })?;

    Ok(ParsedAction {
        name,
        arguments,
        preamble,
    })
}
