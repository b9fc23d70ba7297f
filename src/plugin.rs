//! Docker authorization plugin protocol.
//!
//! The daemon posts every client command to `/AuthZPlugin.AuthZReq` before
//! acting on it, and the daemon's reply to `/AuthZPlugin.AuthZRes` before
//! returning it. Requests are turned into `(subject, object, action)` where
//! the object is the decoded request URI and the action the HTTP method.
//!
//! Responses are never enforced: `/AuthZPlugin.AuthZRes` always allows.

use std::collections::HashMap;
use std::string::FromUtf8Error;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::authz::{Enforcer, Request};

pub const INVALID_REQUEST_URI: &str = "Invalid request URI";
pub const ACCESS_DENIED: &str = "Access denied by casbin plugin";

/// Body of `/AuthZPlugin.AuthZReq` and `/AuthZPlugin.AuthZRes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthZRequest {
    /// Authenticated user, empty when the daemon is not using TLS client auth.
    #[serde(default)]
    pub user: String,
    #[serde(default, rename = "UserAuthNMethod")]
    pub user_authn_method: String,
    #[serde(default)]
    pub request_method: String,
    #[serde(default, rename = "RequestURI")]
    pub request_uri: String,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub response_status_code: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthZResponse {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl AuthZResponse {
    pub fn allow() -> Self {
        Self {
            allow: true,
            ..Default::default()
        }
    }

    pub fn deny(msg: impl Into<String>) -> Self {
        Self {
            allow: false,
            msg: msg.into(),
            err: String::new(),
        }
    }

    /// A plugin-side failure; the daemon treats it as a denial.
    pub fn error(err: impl Into<String>) -> Self {
        Self {
            allow: false,
            msg: String::new(),
            err: err.into(),
        }
    }
}

/// Body of `/Plugin.Activate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    pub implements: Vec<String>,
}

impl Default for ActivateResponse {
    fn default() -> Self {
        Self {
            implements: vec!["authz".to_string()],
        }
    }
}

#[derive(Debug, Error)]
pub enum UriError {
    #[error("request URI must start with `/`")]
    NotOriginForm,
    #[error("request URI has a `%` not followed by two hex digits")]
    MalformedEscape,
    #[error("request URI is not valid UTF-8 once decoded")]
    Decode(#[from] FromUtf8Error),
    #[error("request URI contains a control character")]
    ControlCharacter,
}

/// Query-unescape a request URI into the object path matched by policies.
///
/// The raw URI must already be in origin form (`/path?query`); `+` decodes to
/// a space and `%XX` sequences to their bytes. Any other `%` is an error.
pub fn normalize_request_uri(raw: &str) -> Result<String, UriError> {
    if !raw.starts_with('/') {
        return Err(UriError::NotOriginForm);
    }
    let bytes = raw.as_bytes();
    for (i, _) in raw.match_indices('%') {
        let hex = bytes.get(i + 1..i + 3).unwrap_or_default();
        if hex.len() != 2 || !hex.iter().all(u8::is_ascii_hexdigit) {
            return Err(UriError::MalformedEscape);
        }
    }
    let spaced = raw.replace('+', " ");
    let decoded = urlencoding::decode(&spaced)?;
    if decoded.chars().any(|c| c.is_ascii_control()) {
        return Err(UriError::ControlCharacter);
    }
    Ok(decoded.into_owned())
}

/// Authorize one client command.
pub fn authorize_request(enforcer: &Enforcer, req: &AuthZRequest) -> AuthZResponse {
    let object = match normalize_request_uri(&req.request_uri) {
        Ok(object) => object,
        Err(e) => {
            tracing::warn!(uri = %req.request_uri, error = %e, "Failed to parse request URI");
            return AuthZResponse::deny(INVALID_REQUEST_URI);
        }
    };
    let request = Request::new(req.user.as_str(), object, req.request_method.as_str());

    match enforcer.enforce_request(&request) {
        Ok(true) => {
            tracing::info!(obj = %request.object, act = %request.action, "allowed");
            AuthZResponse::allow()
        }
        Ok(false) => {
            tracing::info!(obj = %request.object, act = %request.action, "denied");
            AuthZResponse::deny(ACCESS_DENIED)
        }
        Err(e) => {
            tracing::error!(obj = %request.object, act = %request.action, error = %e, "Enforce error");
            AuthZResponse::deny(format!("Authorization error: {e}"))
        }
    }
}

/// Authorize the daemon's response. Always allowed: response bodies are not
/// inspected by this plugin.
pub fn authorize_response(_req: &AuthZRequest) -> AuthZResponse {
    AuthZResponse::allow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Model, Policy};

    const MODEL: &str = r#"
[request_definition]
r = obj, act

[policy_definition]
p = obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = keyMatch(r.obj, p.obj) && r.act == p.act
"#;

    fn enforcer() -> Enforcer {
        let model: Model = MODEL.parse().unwrap();
        let policy = Policy::from_csv_str(
            &model,
            "p, /v1/containers/json, GET\np, /v1/containers/*, POST\n",
        )
        .unwrap();
        Enforcer::new(model, policy)
    }

    fn request(method: &str, uri: &str) -> AuthZRequest {
        AuthZRequest {
            request_method: method.to_string(),
            request_uri: uri.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_request_uri() {
        assert_eq!(
            normalize_request_uri("/v1/containers/json").unwrap(),
            "/v1/containers/json"
        );
        assert_eq!(
            normalize_request_uri("/v1/containers/json?filters=%7B%22a%22%7D").unwrap(),
            "/v1/containers/json?filters={\"a\"}"
        );
        assert_eq!(normalize_request_uri("/a+b").unwrap(), "/a b");
        assert!(matches!(
            normalize_request_uri("%2Fv1%2Fcontainers%2Fjson"),
            Err(UriError::NotOriginForm)
        ));
        assert!(matches!(
            normalize_request_uri("/v1/%FF"),
            Err(UriError::Decode(_))
        ));
        assert!(matches!(
            normalize_request_uri("/v1/%0A"),
            Err(UriError::ControlCharacter)
        ));
    }

    #[test]
    fn test_malformed_escapes_are_rejected() {
        for uri in ["/containers/%zz", "/containers/%4", "/containers/%", "/a%2G"] {
            assert!(
                matches!(normalize_request_uri(uri), Err(UriError::MalformedEscape)),
                "{uri}"
            );
        }
        assert_eq!(normalize_request_uri("/a%2Fb%2f").unwrap(), "/a/b/");

        // a wildcard rule must not see the undecoded text
        let model: Model = MODEL.parse().unwrap();
        let policy = Policy::from_csv_str(&model, "p, /containers/*, GET\n").unwrap();
        let enforcer = Enforcer::new(model, policy);
        let resp = authorize_request(&enforcer, &request("GET", "/containers/%zz"));
        assert!(!resp.allow);
        assert_eq!(resp.msg, INVALID_REQUEST_URI);
    }

    #[test]
    fn test_allowed_request() {
        let resp = authorize_request(&enforcer(), &request("GET", "/v1/containers/json"));
        assert_eq!(resp, AuthZResponse::allow());
    }

    #[test]
    fn test_denied_request() {
        let resp = authorize_request(&enforcer(), &request("DELETE", "/v1/containers/json"));
        assert!(!resp.allow);
        assert_eq!(resp.msg, ACCESS_DENIED);
    }

    #[test]
    fn test_invalid_uri_is_denied() {
        let resp = authorize_request(&enforcer(), &request("GET", "%2Fv1%2Fcontainers%2Fjson"));
        assert!(!resp.allow);
        assert_eq!(resp.msg, INVALID_REQUEST_URI);
    }

    #[test]
    fn test_evaluation_error_is_denied() {
        let src = MODEL
            .replace("r = obj, act", "r = sub, obj, act")
            .replace("keyMatch(r.obj, p.obj)", "r.sub == \"root\" && keyMatch(r.obj, p.obj)");
        let model: Model = src.parse().unwrap();
        let policy = Policy::from_csv_str(&model, "p, /v1/containers/json, GET\n").unwrap();
        let enforcer = Enforcer::new(model, policy);

        // no TLS user -> empty subject -> evaluation error
        let resp = authorize_request(&enforcer, &request("GET", "/v1/containers/json"));
        assert!(!resp.allow);
        assert!(resp.msg.starts_with("Authorization error: "));

        let mut req = request("GET", "/v1/containers/json");
        req.user = "root".into();
        assert!(authorize_request(&enforcer, &req).allow);
    }

    #[test]
    fn test_response_phase_always_allowed() {
        let mut req = request("DELETE", "/v1/containers/abc");
        req.response_status_code = 500;
        assert!(authorize_response(&req).allow);
    }

    #[test]
    fn test_wire_format() {
        let req: AuthZRequest = serde_json::from_str(
            r#"{"User":"alice","UserAuthNMethod":"TLS","RequestMethod":"GET","RequestURI":"/v1.41/info","RequestBody":null,"RequestHeaders":{"Content-Type":"application/json"}}"#,
        )
        .unwrap();
        assert_eq!(req.user, "alice");
        assert_eq!(req.user_authn_method, "TLS");
        assert_eq!(req.request_uri, "/v1.41/info");
        assert_eq!(req.request_headers.len(), 1);

        let json = serde_json::to_value(AuthZResponse::deny(ACCESS_DENIED)).unwrap();
        assert_eq!(json, serde_json::json!({"Allow": false, "Msg": ACCESS_DENIED}));

        let json = serde_json::to_value(ActivateResponse::default()).unwrap();
        assert_eq!(json, serde_json::json!({"Implements": ["authz"]}));
    }
}
