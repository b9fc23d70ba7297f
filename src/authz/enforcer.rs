use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::authz::effect::RuleEffect;
use crate::authz::errors::AuthzError;
use crate::authz::functions::RegexCache;
use crate::authz::loader::load_policy;
use crate::authz::matcher::{evaluate, Bindings, RoleLookup};
use crate::authz::model::Model;
use crate::authz::policy::Policy;
use crate::authz::role::DEFAULT_MAX_HIERARCHY_LEVEL;
use crate::authz::types::{Decision, Request};

/// The decision engine. Share it behind an `Arc`; every method takes `&self`.
///
/// The model never changes. The policy is a snapshot behind an `ArcSwap`:
/// an evaluation sees exactly one snapshot even if a reload happens meanwhile.
#[derive(Debug)]
pub struct Enforcer {
    model: Model,
    policy: ArcSwap<Policy>,
    regexes: RegexCache,
    max_hierarchy_level: usize,
}

impl Enforcer {
    pub fn new(model: Model, policy: Policy) -> Self {
        Self {
            model,
            policy: ArcSwap::from_pointee(policy),
            regexes: RegexCache::new(),
            max_hierarchy_level: DEFAULT_MAX_HIERARCHY_LEVEL,
        }
    }

    /// Load the model and the policy (file or directory) from disk.
    pub fn from_files(
        model_path: &Path,
        policy_path: &Path,
        max_hierarchy_level: usize,
    ) -> Result<Self, AuthzError> {
        let model = Model::from_file(model_path)?;
        let policy = load_policy(&model, policy_path, max_hierarchy_level)?;
        tracing::info!(
            model = %model_path.display(),
            effect = %model.effect(),
            matcher = model.matcher_source(),
            "Loaded authorization model"
        );
        Ok(Self {
            max_hierarchy_level,
            ..Self::new(model, policy)
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Current policy snapshot.
    pub fn policy(&self) -> Arc<Policy> {
        self.policy.load_full()
    }

    /// Replace the whole policy. In-flight evaluations finish on the old one.
    pub fn reload(&self, policy: Policy) {
        self.policy.store(Arc::new(policy));
        self.regexes.clear();
    }

    /// Re-read the policy from `path`. On error the current policy stays.
    pub fn reload_from(&self, path: &Path) -> Result<(), AuthzError> {
        let policy = load_policy(&self.model, path, self.max_hierarchy_level)?;
        self.reload(policy);
        Ok(())
    }

    /// Positional enforcement: `values` must match the request definition.
    pub fn enforce(&self, values: &[&str]) -> Result<bool, AuthzError> {
        Ok(self.explain(values)?.allowed)
    }

    /// Enforce a `(subject, object, action)` request.
    pub fn enforce_request(&self, request: &Request) -> Result<bool, AuthzError> {
        self.enforce(&self.request_values(request)?)
    }

    pub fn explain_request(&self, request: &Request) -> Result<Decision, AuthzError> {
        self.explain(&self.request_values(request)?)
    }

    /// Map a `(subject, object, action)` request onto the request definition.
    pub fn request_values<'r>(&self, request: &'r Request) -> Result<Vec<&'r str>, AuthzError> {
        self.model
            .request()
            .fields
            .iter()
            .map(|field| match field.as_str() {
                "sub" if request.subject.is_empty() => Err(AuthzError::Evaluation(
                    "the model requires a subject but the request has none".into(),
                )),
                "sub" => Ok(request.subject.as_str()),
                "obj" => Ok(request.object.as_str()),
                "act" => Ok(request.action.as_str()),
                other => Err(AuthzError::Evaluation(format!(
                    "request field `{other}` cannot be bound from (subject, object, action)"
                ))),
            })
            .collect()
    }

    /// Evaluate and report which rule decided.
    pub fn explain(&self, values: &[&str]) -> Result<Decision, AuthzError> {
        let expected = self.model.request().arity();
        if values.len() != expected {
            return Err(AuthzError::Evaluation(format!(
                "request has {} values, the model declares {expected}",
                values.len()
            )));
        }

        let policy = self.policy.load();
        if policy.rules().is_empty() {
            tracing::debug!(request = ?values, "no policy rules loaded");
            return Ok(Decision::deny("no policy rules loaded"));
        }

        let roles = RoleMemo::new(&policy);
        let matcher = self.model.matcher();
        let effect_index = self.model.effect_index();

        let mut matched = Vec::new();
        for (idx, rule) in policy.rules().iter().enumerate() {
            let bindings = Bindings {
                request: values,
                policy: rule.fields(),
                roles: &roles,
                regexes: &self.regexes,
            };
            if !evaluate(matcher, &bindings)? {
                continue;
            }
            let eft = match effect_index {
                Some(i) => RuleEffect::parse(rule.get(i).unwrap_or_default())?,
                None => RuleEffect::Allow,
            };
            matched.push((idx, eft));
        }

        let combined = self.model.effect().combine(matched);
        let rule = combined.rule.and_then(|i| policy.rules().get(i));
        let decision = match (combined.allowed, rule) {
            (true, Some(rule)) => Decision::allow(format!("allowed by rule `{rule}`")),
            (true, None) => Decision::allow("no rule denies"),
            (false, Some(rule)) => Decision::deny(format!("denied by rule `{rule}`")),
            (false, None) => Decision::deny("no matching rule"),
        };

        tracing::debug!(
            request = ?values,
            allowed = decision.allowed,
            rule = ?combined.rule,
            "enforced"
        );
        Ok(decision)
    }
}

/// Per-evaluation cache of resolved role sets, so a subject's hierarchy is
/// walked once per request rather than once per policy row.
struct RoleMemo<'a> {
    policy: &'a Policy,
    resolved: RefCell<HashMap<(String, String, Option<String>), Rc<HashSet<String>>>>,
}

impl<'a> RoleMemo<'a> {
    fn new(policy: &'a Policy) -> Self {
        Self {
            policy,
            resolved: RefCell::new(HashMap::new()),
        }
    }
}

impl RoleLookup for RoleMemo<'_> {
    fn has_link(&self, role_type: &str, member: &str, role: &str, domain: Option<&str>) -> bool {
        if member == role {
            return true;
        }
        let key = (
            role_type.to_string(),
            member.to_string(),
            domain.map(str::to_string),
        );
        let roles = self
            .resolved
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| Rc::new(self.policy.roles_for(role_type, member, domain)))
            .clone();
        roles.contains(role)
    }
}
