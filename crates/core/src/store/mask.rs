//! Sensitive-header masking rule (§4.4).

use std::collections::HashSet;

use serde_json::Value;

pub fn default_sensitive_headers() -> HashSet<String> {
    ["x-api-key", "authorization"].into_iter().map(str::to_string).collect()
}

/// Masks every header whose name (case-insensitively) is in `sensitive`.
pub fn mask_headers(headers: &serde_json::Map<String, Value>, sensitive: &HashSet<String>) -> serde_json::Map<String, Value> {
    headers
        .iter()
        .map(|(key, value)| {
            let masked = if sensitive.contains(&key.to_lowercase()) {
                mask_value(value)
            } else {
                value.clone()
            };
            (key.clone(), masked)
        })
        .collect()
}

fn mask_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(mask_string(s)),
        Value::Array(items) => Value::Array(items.iter().map(mask_value).collect()),
        other => other.clone(),
    }
}

fn mask_string(s: &str) -> String {
    let len = s.chars().count();
    if len > 20 {
        let first: String = s.chars().take(10).collect();
        let last: String = s.chars().skip(len - 4).collect();
        format!("{first}...{last}")
    } else if len > 10 {
        let first: String = s.chars().take(6).collect();
        format!("{first}...")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_long_value() {
        let s = "sk-abcdefghijklmnopqrstuvwxyz0123456789";
        let masked = mask_string(s);
        assert_eq!(masked, "sk-abcdefg...6789");
    }

    #[test]
    fn masks_medium_value() {
        assert_eq!(mask_string("abcdefghijk"), "abcdef...");
    }

    #[test]
    fn leaves_short_value_alone() {
        assert_eq!(mask_string("short"), "short");
    }

    #[test]
    fn masks_only_sensitive_keys() {
        let sensitive = default_sensitive_headers();
        let mut headers = serde_json::Map::new();
        headers.insert("x-api-key".to_string(), json!("sk-abcdefghijklmnopqrstuvwxyz0123456789"));
        headers.insert("content-type".to_string(), json!("application/json"));
        let masked = mask_headers(&headers, &sensitive);
        assert_eq!(masked["content-type"], json!("application/json"));
        assert_ne!(masked["x-api-key"], json!("sk-abcdefghijklmnopqrstuvwxyz0123456789"));
    }
}
