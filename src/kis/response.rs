// =============================================================================
// REST Response Envelope — status + vendor return-code interpretation
// =============================================================================
//
// KIS wraps every REST body in `rt_cd` / `msg1` vendor fields. The envelope
// parses the body once, sanitizes key names (hyphens and spaces become
// underscores), and exposes typed accessors. A body that fails to parse is
// replaced by a synthetic `rt_cd="999"` error body so downstream code never
// deals with missing fields.
// =============================================================================

use serde_json::{Map, Value};

/// Vendor return codes that count as success.
const SUCCESS_CODES: [&str; 2] = ["0", ""];

/// Synthetic return code for unparseable bodies.
const PARSE_ERROR_CODE: &str = "999";

/// Parsed KIS REST response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: u16,
    body: Map<String, Value>,
}

impl ApiResponse {
    /// Build from an HTTP status and raw body text.
    pub fn from_parts(status: u16, text: &str) -> Self {
        let body = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => {
                let mut sanitized = Map::with_capacity(map.len());
                for (key, value) in map {
                    sanitized.insert(sanitize_key(&key), value);
                }
                sanitized
            }
            _ => synthetic_body(PARSE_ERROR_CODE, "JSON Decode Error"),
        };
        Self { status, body }
    }

    /// Drain a `reqwest` response into an envelope. Transport-level read
    /// failures become the synthetic decode-error body.
    pub async fn from_response(resp: reqwest::Response) -> Self {
        let status = resp.status().as_u16();
        match resp.text().await {
            Ok(text) => Self::from_parts(status, &text),
            Err(_) => Self {
                status,
                body: synthetic_body(PARSE_ERROR_CODE, "JSON Decode Error"),
            },
        }
    }

    /// Synthetic envelope for error paths with no HTTP response.
    pub fn synthetic(status: u16, rt_cd: &str, msg: &str) -> Self {
        Self {
            status,
            body: synthetic_body(rt_cd, msg),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Vendor return code, `"999"` when absent.
    pub fn rt_cd(&self) -> &str {
        self.body
            .get("rt_cd")
            .and_then(Value::as_str)
            .unwrap_or(PARSE_ERROR_CODE)
    }

    /// Vendor message, empty when absent.
    pub fn msg1(&self) -> &str {
        self.body.get("msg1").and_then(Value::as_str).unwrap_or("")
    }

    /// Success iff HTTP 200 and `rt_cd` is in the vendor success set.
    pub fn is_ok(&self) -> bool {
        self.status == 200 && SUCCESS_CODES.contains(&self.rt_cd())
    }

    pub fn is_error(&self) -> bool {
        !self.is_ok()
    }

    /// A named body field, or `default` when absent.
    pub fn get_output<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.body.get(key).unwrap_or(default)
    }

    /// The conventional `output` field, if present.
    pub fn output(&self) -> Option<&Value> {
        self.body.get("output")
    }

    /// Whole sanitized body.
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }
}

fn sanitize_key(key: &str) -> String {
    key.replace(['-', ' '], "_")
}

fn synthetic_body(rt_cd: &str, msg: &str) -> Map<String, Value> {
    let mut map = Map::with_capacity(2);
    map.insert("rt_cd".into(), Value::String(rt_cd.into()));
    map.insert("msg1".into(), Value::String(msg.into()));
    map
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_requires_200_and_success_code() {
        let ok = ApiResponse::from_parts(200, r#"{"rt_cd":"0","msg1":"Success"}"#);
        assert!(ok.is_ok());

        let empty_code = ApiResponse::from_parts(200, r#"{"rt_cd":"","msg1":"ok"}"#);
        assert!(empty_code.is_ok());

        let vendor_err = ApiResponse::from_parts(200, r#"{"rt_cd":"1","msg1":"nope"}"#);
        assert!(vendor_err.is_error());

        let http_err = ApiResponse::from_parts(500, r#"{"rt_cd":"0","msg1":"ok"}"#);
        assert!(http_err.is_error());

        // Only exactly 200 counts.
        let created = ApiResponse::from_parts(201, r#"{"rt_cd":"0","msg1":"ok"}"#);
        assert!(created.is_error());
    }

    #[test]
    fn parse_failure_synthesizes_999() {
        let resp = ApiResponse::from_parts(200, "<html>oops</html>");
        assert_eq!(resp.rt_cd(), "999");
        assert_eq!(resp.msg1(), "JSON Decode Error");
        assert!(resp.is_error());
    }

    #[test]
    fn non_object_body_synthesizes_999() {
        let resp = ApiResponse::from_parts(200, "[1,2,3]");
        assert_eq!(resp.rt_cd(), "999");
    }

    #[test]
    fn keys_are_sanitized() {
        let resp =
            ApiResponse::from_parts(200, r#"{"rt_cd":"0","msg1":"ok","some-key":1,"a b":2}"#);
        assert_eq!(resp.body().get("some_key"), Some(&json!(1)));
        assert_eq!(resp.body().get("a_b"), Some(&json!(2)));
    }

    #[test]
    fn get_output_with_default() {
        let resp = ApiResponse::from_parts(200, r#"{"rt_cd":"0","msg1":"ok","output":"data"}"#);
        assert_eq!(resp.get_output("output", &Value::Null), &json!("data"));
        let default = json!("fallback");
        assert_eq!(resp.get_output("missing", &default), &default);
        assert!(resp.output().is_some());
    }

    #[test]
    fn vendor_fields_preserved() {
        let resp = ApiResponse::from_parts(
            200,
            r#"{"rt_cd":"42","msg1":"Bad request","msg_cd":"EGW00123"}"#,
        );
        assert_eq!(resp.rt_cd(), "42");
        assert_eq!(resp.msg1(), "Bad request");
        assert_eq!(resp.body().get("msg_cd"), Some(&json!("EGW00123")));
    }
}
