//! Single-line JSON logging.
//!
//! Every log record is one JSON object on stdout with `ts`, `module` and
//! whatever fields the caller attaches. Credential-shaped keys are redacted
//! before emission.

use chrono::Utc;
use serde_json::{json, Map, Value};

fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn sanitize(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["api_key", "api_secret", "signature", "API-Sign"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

/// Emit a structured log line for `module` with the given fields.
pub fn json_log(module: &str, fields: Map<String, Value>) {
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("module".to_string(), json!(module));
    for (k, v) in sanitize(fields) {
        entry.insert(k, v);
    }
    println!("{}", Value::Object(entry));
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_sanitize_redacts_credentials() {
        let m = sanitize(obj(&[
            ("api_key", v_str("secret-key")),
            ("price", v_num(0.1)),
        ]));
        assert_eq!(m.get("api_key").unwrap(), "[REDACTED]");
        assert_eq!(m.get("price").unwrap(), 0.1);
    }
}
