//! Decoding `--output-format json` results

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

/// Strip a surrounding Markdown code fence, if any
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Pull a typed payload out of CLI output.
///
/// Looks for the envelope's `structured_output`, then `result` holding JSON text, then treats
/// the whole output as the payload. Anything unparseable is `None`.
pub fn parse_structured_output<T: DeserializeOwned>(output: &str) -> Option<T> {
    let text = strip_fence(output);
    if text.is_empty() {
        warn!("Empty structured output");
        return None;
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, output = %preview(text), "Structured output is not JSON");
            return None;
        }
    };

    if value.get("is_error").and_then(Value::as_bool) == Some(true) {
        warn!(output = %preview(text), "Structured output reports an error");
        return None;
    }

    let payload = if let Some(structured) = value.get("structured_output").filter(|v| !v.is_null()) {
        structured.clone()
    } else if let Some(result) = value.get("result").and_then(Value::as_str) {
        match serde_json::from_str(strip_fence(result)) {
            Ok(inner) => inner,
            Err(e) => {
                warn!(error = %e, result = %preview(result), "Result text is not JSON");
                return None;
            }
        }
    } else {
        value
    };

    match serde_json::from_value(payload) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(error = %e, "Structured output does not match the expected shape");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Findings {
        items: Vec<String>,
    }

    #[test]
    fn test_structured_output_field() {
        let out = r#"{"type":"result","is_error":false,"structured_output":{"items":["a"]},"result":""}"#;
        assert_eq!(
            parse_structured_output::<Findings>(out),
            Some(Findings { items: vec!["a".into()] })
        );
    }

    #[test]
    fn test_result_text_with_fence() {
        let out = r#"{"type":"result","result":"```json\n{\"items\":[\"b\"]}\n```"}"#;
        assert_eq!(
            parse_structured_output::<Findings>(out).unwrap().items,
            vec!["b".to_string()]
        );
    }

    #[test]
    fn test_bare_payload() {
        let out = "```\n{\"items\": []}\n```\n";
        assert_eq!(parse_structured_output::<Findings>(out).unwrap().items.len(), 0);
    }

    #[test]
    fn test_malformed_is_none() {
        assert!(parse_structured_output::<Findings>("").is_none());
        assert!(parse_structured_output::<Findings>("I could not do that").is_none());
        assert!(parse_structured_output::<Findings>(r#"{"result":"not json"}"#).is_none());
        assert!(parse_structured_output::<Findings>(r#"{"other":1}"#).is_none());
        assert!(parse_structured_output::<Findings>(r#"{"is_error":true,"result":"{}"}"#).is_none());
    }
}
