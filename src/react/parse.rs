//! 模型输出解析
//!
//! 模型回复统一解析为带标签的结果：Parsed(value) 或 Malformed { raw_text, diagnostic }，
//! 由循环决定重试还是判失败，而不是在深处抛错。

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum ParseOutcome<T> {
    Parsed(T),
    Malformed { raw_text: String, diagnostic: String },
}

impl<T> ParseOutcome<T> {
    pub fn malformed(raw_text: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        ParseOutcome::Malformed {
            raw_text: raw_text.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseOutcome<U> {
        match self {
            ParseOutcome::Parsed(v) => ParseOutcome::Parsed(f(v)),
            ParseOutcome::Malformed { raw_text, diagnostic } => ParseOutcome::Malformed { raw_text, diagnostic },
        }
    }
}

fn fence_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").ok())
        .as_ref()
}

/// 提取 JSON 文本：优先 ```json 围栏，否则取第一个 `{` 到最后一个 `}`
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(inner) = fence_re()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| s.starts_with('{'))
    {
        return Some(inner);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 提取并反序列化为 T
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> ParseOutcome<T> {
    let Some(block) = extract_json_block(text) else {
        return ParseOutcome::malformed(text, "no JSON object found in reply");
    };
    match serde_json::from_str::<T>(block) {
        Ok(value) => ParseOutcome::Parsed(value),
        Err(e) => ParseOutcome::malformed(text, format!("invalid JSON: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json_block(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_bare_object() {
        assert_eq!(extract_json_block("result {\"a\": {\"b\": 2}} done"), Some("{\"a\": {\"b\": 2}}"));
        assert_eq!(extract_json_block("no json here"), None);
        assert_eq!(extract_json_block("} backwards {"), None);
    }

    #[test]
    fn test_parse_reports_diagnostic() {
        let outcome: ParseOutcome<Value> = parse_json_reply("{not json}");
        match outcome {
            ParseOutcome::Malformed { raw_text, diagnostic } => {
                assert_eq!(raw_text, "{not json}");
                assert!(diagnostic.starts_with("invalid JSON"));
            }
            ParseOutcome::Parsed(_) => panic!("expected malformed"),
        }
    }

    #[test]
    fn test_parse_outcome_serializes_tagged() {
        let outcome: ParseOutcome<Value> = ParseOutcome::malformed("x", "bad");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["result"], "malformed");
        assert_eq!(json["value"]["diagnostic"], "bad");
    }
}
