use serde_json::{json, Value};

/// Method names the broker understands for interception purposes. The
/// agent protocol is otherwise opaque; everything outside this list is
/// forwarded without inspection.
pub mod method {
    pub const HANDSHAKE: &str = "initialize";
    pub const SESSION_NEW: &str = "session/new";
    pub const SESSION_LOAD: &str = "session/load";
    pub const SESSION_PROMPT: &str = "session/prompt";
    pub const SESSION_UPDATE: &str = "session/update";
    pub const SHELL: &str = "shell";
    pub const RENAME_SESSION: &str = "rename-session";
}

/// The reserved request id the eager handshake uses. Chosen far outside the
/// broker-originated counter range so the two never collide even if the
/// counter wraps (it won't in a single broker lifetime, but the sentinel
/// being a distinct constant makes that non-obvious invariant explicit).
pub const HANDSHAKE_SENTINEL_ID: i64 = i64::MIN;

pub fn frame_id(frame: &Value) -> Option<&Value> {
    frame.get("id").filter(|v| !v.is_null())
}

pub fn frame_method(frame: &Value) -> Option<&str> {
    frame.get("method").and_then(Value::as_str)
}

/// A request has both a method and an id; a notification has a method and
/// no id; a response has an id and no method. This is the "closed sum type
/// with a passthrough catch-all" the interception pipeline dispatches on,
/// expressed as three predicates over a raw frame rather than a parsed
/// enum, since the overwhelming majority of frames are forwarded
/// byte-for-byte unchanged.
pub fn is_request(frame: &Value) -> bool {
    frame_method(frame).is_some() && frame_id(frame).is_some()
}

pub fn is_notification(frame: &Value) -> bool {
    frame_method(frame).is_some() && frame_id(frame).is_none()
}

pub fn is_response(frame: &Value) -> bool {
    frame_method(frame).is_none() && frame_id(frame).is_some()
}

pub fn make_request(id: Value, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub fn make_result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn make_error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

pub fn make_notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// True if a subprocess error response's message contains the
/// "already loaded" substring the collaborator uses to signal that an
/// agent-session-load failed only because the session is already live.
/// Documented in the design notes as load-bearing but not a stable
/// contract, so it's isolated to this one function.
pub fn is_already_loaded_error(frame: &Value) -> bool {
    frame
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(|m| m.contains("already loaded"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_request() {
        let f = json!({"jsonrpc":"2.0","id":1,"method":"handshake","params":{}});
        assert!(is_request(&f));
        assert!(!is_notification(&f));
        assert!(!is_response(&f));
    }

    #[test]
    fn classifies_notification() {
        let f = json!({"jsonrpc":"2.0","method":"session-update","params":{}});
        assert!(is_notification(&f));
        assert!(!is_request(&f));
    }

    #[test]
    fn classifies_response() {
        let f = json!({"jsonrpc":"2.0","id":1,"result":{}});
        assert!(is_response(&f));
        assert!(!is_request(&f));
    }

    #[test]
    fn already_loaded_substring_match() {
        let f = json!({"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"session already loaded elsewhere"}});
        assert!(is_already_loaded_error(&f));
        let g = json!({"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}});
        assert!(!is_already_loaded_error(&g));
    }
}
