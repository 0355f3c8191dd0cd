//! Response envelope shared by every JSON endpoint.

use serde::Serialize;

use crate::ids::utc_now_iso;

#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            timestamp: utc_now_iso(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            timestamp: utc_now_iso(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_wraps_data() {
        let env = Envelope::ok(serde_json::json!({"x": 1}));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["data"]["x"], 1);
        assert!(json["error"].is_null());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn err_carries_message() {
        let env: Envelope<serde_json::Value> = Envelope::err("boom");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "boom");
        assert!(json["data"].is_null());
    }
}
