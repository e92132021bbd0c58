use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Job envelope: what the ingress persists and the guest reads on stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body: String,
}

impl RequestEnvelope {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// What the guest writes on stdout. A zero status normalizes to 200.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body: String,
}

impl ResponseEnvelope {
    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let mut resp: Self = serde_json::from_slice(raw)?;
        if resp.status == 0 {
            resp.status = 200;
        }
        Ok(resp)
    }
}

/// Origin of an invocation, threaded into host state so host functions can
/// tell request-driven work from queued background work.
#[derive(Debug, Clone)]
pub enum InvocationContext {
    Http { request: RequestEnvelope },
    Background { payload: String },
}

impl InvocationContext {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Background { .. } => "background",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Api-Key".to_string(), vec!["abc".to_string()]);
        let env = RequestEnvelope {
            method: "POST".to_string(),
            uri: "/run?fast=1".to_string(),
            headers,
            body: "hello".to_string(),
        };
        let json = env.to_json().unwrap();
        assert_eq!(RequestEnvelope::from_json(&json).unwrap(), env);
    }

    #[test]
    fn response_status_defaults_to_200() {
        let resp = ResponseEnvelope::from_json(br#"{"body":"ok"}"#).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "ok");
    }

    #[test]
    fn malformed_response_is_an_error() {
        assert!(ResponseEnvelope::from_json(b"not json").is_err());
    }
}
