#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, Response};
use docker_authz::authz::{Enforcer, Model, Policy};
use http_body_util::BodyExt;

pub const BASIC_MODEL: &str = r#"
[request_definition]
r = obj, act

[policy_definition]
p = obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = keyMatch(r.obj, p.obj) && r.act == p.act
"#;

pub const RBAC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act, eft

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow)) && !some(where (p.eft == deny))

[matchers]
m = g(r.sub, p.sub) && keyMatch2(r.obj, p.obj) && r.act == p.act
"#;

pub fn enforcer(model: &str, policy: &str) -> Enforcer {
    let model: Model = model.parse().expect("model");
    let policy = Policy::from_csv_str(&model, policy).expect("policy");
    Enforcer::new(model, policy)
}

pub fn shared(model: &str, policy: &str) -> Arc<Enforcer> {
    Arc::new(enforcer(model, policy))
}

/// The model and policy shipped in `policies/`.
pub fn bundled_enforcer() -> Enforcer {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("policies");
    Enforcer::from_files(&root.join("model.conf"), &root.join("policy.csv"), 10)
        .expect("bundled policy")
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub async fn read_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json")
}
