use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Failed to load `{path}`")]
    #[diagnostic(
        code(docker_authz::authz::load),
        help("Check that the file exists and is readable by the plugin process")
    )]
    LoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid model: {0}")]
    #[diagnostic(
        code(docker_authz::authz::model_parse),
        help("A model needs [request_definition], [policy_definition], [policy_effect] and [matchers] sections")
    )]
    ModelParse(String),

    #[error("Invalid matcher expression: {0}")]
    #[diagnostic(
        code(docker_authz::authz::invalid_matcher),
        help("Supported syntax: ==, !=, &&, ||, !, in (...), r.<field>, p.<field>, keyMatch(..), keyMatch2(..), keyMatch3(..), regexMatch(..), globMatch(..), g(..)")
    )]
    InvalidMatcher(String),

    #[error("Unsupported policy effect `{0}`")]
    #[diagnostic(
        code(docker_authz::authz::unsupported_effect),
        help("Use one of: some(where (p.eft == allow)), !some(where (p.eft == deny)), some(where (p.eft == allow)) && !some(where (p.eft == deny)), priority(p.eft) || deny")
    )]
    UnsupportedEffect(String),

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(docker_authz::authz::invalid_policy),
        help("Each policy line starts with a section key declared by the model, e.g. `p, /v1/containers/json, GET`")
    )]
    InvalidPolicy(String),

    #[error("Policy line {line} for `{key}` has {found} fields, the model declares {expected}")]
    #[diagnostic(
        code(docker_authz::authz::policy_arity),
        help("Make the number of fields match the definition in the model")
    )]
    PolicyArity {
        key: String,
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(docker_authz::authz::kdl_parse),
        help("Check your KDL file syntax, see https://kdl.dev")
    )]
    KdlParse(String),

    #[error("Evaluation error: {0}")]
    #[diagnostic(code(docker_authz::authz::evaluation))]
    Evaluation(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(docker_authz::authz::io))]
    Io(#[from] std::io::Error),
}

impl AuthzError {
    /// Configuration errors are fatal at startup; evaluation errors only deny
    /// the request that triggered them.
    pub fn is_config_error(&self) -> bool {
        !matches!(self, AuthzError::Evaluation(_))
    }
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthzError::Evaluation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "allowed": false, "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
