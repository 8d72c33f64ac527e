use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static TRAILING_COMMA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Recover a JSON value from free-form model output.
///
/// Strips code-fence markers, slices down to the outermost object or array,
/// and on a parse failure attempts one conservative trailing-comma repair
/// before giving up. The error string is fed back into the retry prompt.
pub fn extract_json(text: &str) -> Result<Value, String> {
    let text = strip_fences(text);

    let candidate = outermost_json(text).ok_or_else(|| {
        "response contains no JSON object or array".to_string()
    })?;

    match serde_json::from_str(candidate) {
        Ok(v) => Ok(v),
        Err(first_err) => {
            let repaired = TRAILING_COMMA_RE.replace_all(candidate, "$1");
            serde_json::from_str(&repaired)
                .map_err(|_| format!("response is not valid JSON: {}", first_err))
        }
    }
}

fn strip_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(rest) = text.split("```json").nth(1) {
        return rest.split("```").next().unwrap_or(text).trim();
    }
    if text.contains("```") {
        if let Some(inner) = text.split("```").nth(1) {
            return inner.trim();
        }
    }
    text
}

/// Slice from the first opening brace/bracket to the matching last close of
/// the same family, so prose before or after the payload is ignored.
fn outermost_json(text: &str) -> Option<&str> {
    let obj_start = text.find('{');
    let arr_start = text.find('[');
    let (start, open) = match (obj_start, arr_start) {
        (Some(o), Some(a)) if a < o => (a, '['),
        (Some(o), _) => (o, '{'),
        (None, Some(a)) => (a, '['),
        (None, None) => return None,
    };
    let close = if open == '{' { '}' } else { ']' };
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_object() {
        let v = extract_json(r#"{"confidence": 0.9}"#).unwrap();
        assert_eq!(v["confidence"], 0.9);
    }

    #[test]
    fn fenced_object() {
        let v = extract_json("```json\n{\"records\": []}\n```").unwrap();
        assert!(v["records"].as_array().unwrap().is_empty());
    }

    #[test]
    fn object_with_surrounding_prose() {
        let text = "Here is the extraction:\n{\"records\": [], \"confidence\": 1.0}\nLet me know!";
        let v = extract_json(text).unwrap();
        assert_eq!(v["confidence"], 1.0);
    }

    #[test]
    fn bare_array() {
        let v = extract_json("[1, 2, 3]").unwrap();
        assert_eq!(v.as_array().unwrap().len(), 3);
    }

    #[test]
    fn trailing_comma_repaired() {
        let v = extract_json(r#"{"records": [{"a": 1},], "confidence": 0.8,}"#).unwrap();
        assert_eq!(v["confidence"], 0.8);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(extract_json("I could not find any trades in this document.").is_err());
        assert!(extract_json("{not json at all").is_err());
    }
}
