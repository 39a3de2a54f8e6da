//! Reply interpretation against pending expectation constraints

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

const TRUE_WORDS: &[&str] = &["yes", "y", "true", "1", "on"];
const FALSE_WORDS: &[&str] = &["no", "n", "false", "0", "off"];

/// Kind of reply a pending expectation is waiting for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReplyType {
    Choice,
    Text,
    Number,
    Boolean,
    /// Unrecognized type name; any non-empty text matches
    Other(String),
}

impl ReplyType {
    pub fn as_str(&self) -> &str {
        match self {
            ReplyType::Choice => "choice",
            ReplyType::Text => "text",
            ReplyType::Number => "number",
            ReplyType::Boolean => "boolean",
            ReplyType::Other(name) => name,
        }
    }
}

impl From<String> for ReplyType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "choice" => ReplyType::Choice,
            "text" => ReplyType::Text,
            "number" => ReplyType::Number,
            "boolean" => ReplyType::Boolean,
            _ => ReplyType::Other(value),
        }
    }
}

impl From<&str> for ReplyType {
    fn from(value: &str) -> Self {
        ReplyType::from(value.to_string())
    }
}

impl From<ReplyType> for String {
    fn from(value: ReplyType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ReplyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interpreted value of a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for ReplyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyValue::Boolean(b) => write!(f, "{}", b),
            ReplyValue::Number(n) => write!(f, "{}", n),
            ReplyValue::Text(t) => f.write_str(t),
        }
    }
}

/// A reply that satisfied an expectation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedReply {
    #[serde(rename = "type")]
    pub reply_type: ReplyType,
    pub value: ReplyValue,
    pub raw_text: String,
    /// Zero-based index into the options (choice only)
    pub option_index: Option<usize>,
}

impl ParsedReply {
    fn new(reply_type: ReplyType, value: ReplyValue, raw_text: &str) -> Self {
        Self {
            reply_type,
            value,
            raw_text: raw_text.to_string(),
            option_index: None,
        }
    }

    /// The 1-based option number for choices, otherwise the value as text
    pub fn response_number(&self) -> String {
        match self.option_index {
            Some(idx) => (idx + 1).to_string(),
            None => self.value.to_string(),
        }
    }
}

/// Interpret `raw_text` as a reply of the given type
///
/// Returns `None` when the text does not satisfy the constraints.
pub fn parse_reply(
    raw_text: &str,
    reply_type: &ReplyType,
    options: Option<&[String]>,
    regex: Option<&str>,
) -> Option<ParsedReply> {
    let text = raw_text.trim();

    match reply_type {
        ReplyType::Choice => parse_choice(text, options.unwrap_or_default()),
        ReplyType::Text => match regex {
            Some(pattern) if !pattern.is_empty() => parse_regex(text, pattern),
            _ => non_empty(text, ReplyType::Text),
        },
        ReplyType::Number => text
            .parse::<f64>()
            .ok()
            .map(|n| ParsedReply::new(ReplyType::Number, ReplyValue::Number(n), text)),
        ReplyType::Boolean => {
            let lower = text.to_lowercase();
            let value = if TRUE_WORDS.contains(&lower.as_str()) {
                true
            } else if FALSE_WORDS.contains(&lower.as_str()) {
                false
            } else {
                return None;
            };
            Some(ParsedReply::new(
                ReplyType::Boolean,
                ReplyValue::Boolean(value),
                text,
            ))
        }
        ReplyType::Other(_) => non_empty(text, reply_type.clone()),
    }
}

fn non_empty(text: &str, reply_type: ReplyType) -> Option<ParsedReply> {
    if text.is_empty() {
        return None;
    }
    Some(ParsedReply::new(
        reply_type,
        ReplyValue::Text(text.to_string()),
        text,
    ))
}

fn parse_regex(text: &str, pattern: &str) -> Option<ParsedReply> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!(pattern = pattern, error = %e, "Invalid reply regex, treating as no match");
            return None;
        }
    };

    re.find(text).map(|m| {
        ParsedReply::new(
            ReplyType::Text,
            ReplyValue::Text(m.as_str().to_string()),
            text,
        )
    })
}

fn parse_choice(text: &str, options: &[String]) -> Option<ParsedReply> {
    // An empty reply (e.g. picture-only message) never selects an option
    if options.is_empty() || text.is_empty() {
        return None;
    }

    let chosen = |idx: usize| ParsedReply {
        reply_type: ReplyType::Choice,
        value: ReplyValue::Text(options[idx].clone()),
        raw_text: text.to_string(),
        option_index: Some(idx),
    };

    // 1-based option number
    if let Ok(num) = text.parse::<i64>() {
        if num >= 1 && (num as usize) <= options.len() {
            return Some(chosen(num as usize - 1));
        }
    }

    let lower = text.to_lowercase();

    if let Some(idx) = options.iter().position(|o| o.to_lowercase() == lower) {
        return Some(chosen(idx));
    }

    options
        .iter()
        .position(|o| {
            let option = o.to_lowercase();
            option.contains(&lower) || lower.contains(&option)
        })
        .map(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_choice_yes_no() {
        let options = opts(&["Yes", "No"]);
        for reply in ["1", "yes", "YES", "y"] {
            let parsed = parse_reply(reply, &ReplyType::Choice, Some(&options), None)
                .unwrap_or_else(|| panic!("{reply} should match"));
            assert_eq!(parsed.option_index, Some(0), "reply {reply}");
            assert_eq!(parsed.value, ReplyValue::Text("Yes".to_string()));
        }
        for reply in ["3", "maybe"] {
            assert!(parse_reply(reply, &ReplyType::Choice, Some(&options), None).is_none());
        }
    }

    #[test]
    fn test_choice_number_beats_text() {
        let options = opts(&["2", "1"]);
        let parsed = parse_reply("1", &ReplyType::Choice, Some(&options), None).unwrap();
        assert_eq!(parsed.option_index, Some(0));
        assert_eq!(parsed.value, ReplyValue::Text("2".to_string()));
    }

    #[test]
    fn test_choice_exact_before_partial() {
        let options = opts(&["Turn lights on", "on"]);
        let parsed = parse_reply("ON", &ReplyType::Choice, Some(&options), None).unwrap();
        assert_eq!(parsed.option_index, Some(1));
    }

    #[test]
    fn test_choice_partial_either_direction() {
        let options = opts(&["Garage", "Front door"]);
        let parsed = parse_reply("open the garage please", &ReplyType::Choice, Some(&options), None)
            .unwrap();
        assert_eq!(parsed.option_index, Some(0));

        let parsed = parse_reply("front", &ReplyType::Choice, Some(&options), None).unwrap();
        assert_eq!(parsed.option_index, Some(1));
    }

    #[test]
    fn test_choice_without_options_or_text() {
        assert!(parse_reply("1", &ReplyType::Choice, None, None).is_none());
        let options = opts(&["A"]);
        assert!(parse_reply("   ", &ReplyType::Choice, Some(&options), None).is_none());
    }

    #[test]
    fn test_text_regex_search() {
        let parsed = parse_reply("code is 4821 ok", &ReplyType::Text, None, Some(r"\d{4}")).unwrap();
        assert_eq!(parsed.value, ReplyValue::Text("4821".to_string()));
        assert_eq!(parsed.raw_text, "code is 4821 ok");
        assert!(parse_reply("no digits", &ReplyType::Text, None, Some(r"\d{4}")).is_none());
    }

    #[test]
    fn test_text_invalid_regex_is_no_match() {
        assert!(parse_reply("anything", &ReplyType::Text, None, Some("([unclosed")).is_none());
    }

    #[test]
    fn test_text_without_regex() {
        let parsed = parse_reply("  hello there  ", &ReplyType::Text, None, None).unwrap();
        assert_eq!(parsed.value, ReplyValue::Text("hello there".to_string()));
        assert!(parse_reply("   ", &ReplyType::Text, None, None).is_none());
    }

    #[test]
    fn test_number() {
        let parsed = parse_reply("72.5", &ReplyType::Number, None, None).unwrap();
        assert_eq!(parsed.value, ReplyValue::Number(72.5));
        assert!(parse_reply("seventy", &ReplyType::Number, None, None).is_none());
    }

    #[test]
    fn test_boolean() {
        for word in ["yes", "Y", "TRUE", "1", "on"] {
            let parsed = parse_reply(word, &ReplyType::Boolean, None, None).unwrap();
            assert_eq!(parsed.value, ReplyValue::Boolean(true), "{word}");
        }
        for word in ["no", "N", "false", "0", "OFF"] {
            let parsed = parse_reply(word, &ReplyType::Boolean, None, None).unwrap();
            assert_eq!(parsed.value, ReplyValue::Boolean(false), "{word}");
        }
        assert!(parse_reply("perhaps", &ReplyType::Boolean, None, None).is_none());
    }

    #[test]
    fn test_unknown_type_accepts_text() {
        let kind = ReplyType::from("mood");
        let parsed = parse_reply("happy", &kind, None, None).unwrap();
        assert_eq!(parsed.reply_type, ReplyType::Other("mood".to_string()));
        assert_eq!(parsed.option_index, None);
        assert!(parse_reply("", &kind, None, None).is_none());
    }

    #[test]
    fn test_response_number() {
        let options = opts(&["A", "B"]);
        let parsed = parse_reply("b", &ReplyType::Choice, Some(&options), None).unwrap();
        assert_eq!(parsed.response_number(), "2");

        let parsed = parse_reply("yes", &ReplyType::Boolean, None, None).unwrap();
        assert_eq!(parsed.response_number(), "true");
    }

    #[test]
    fn test_reply_type_serde() {
        let json = serde_json::to_string(&ReplyType::Choice).unwrap();
        assert_eq!(json, "\"choice\"");
        let back: ReplyType = serde_json::from_str("\"boolean\"").unwrap();
        assert_eq!(back, ReplyType::Boolean);
        let other: ReplyType = serde_json::from_str("\"custom\"").unwrap();
        assert_eq!(other.as_str(), "custom");
    }
}
