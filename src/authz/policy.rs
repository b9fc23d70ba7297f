use std::collections::{BTreeMap, HashSet};
use std::fmt;

use kdl::KdlDocument;

use crate::authz::effect::RuleEffect;
use crate::authz::errors::AuthzError;
use crate::authz::model::Model;
use crate::authz::role::{RoleManager, DEFAULT_MAX_HIERARCHY_LEVEL};

/// One policy row; arity and meaning come from the model's policy definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRule(Vec<String>);

impl PolicyRule {
    pub fn new(fields: Vec<String>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).map(String::as_str)
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

/// A line read from a policy source, not yet checked against a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyLine {
    /// Section key, e.g. `p` or `g`.
    pub key: String,
    pub fields: Vec<String>,
    /// 1-based line (CSV) or node (KDL) number, for diagnostics.
    pub line: usize,
}

/// Policy rows and role links loaded for one model.
#[derive(Debug, Clone)]
pub struct Policy {
    rules: Vec<PolicyRule>,
    roles: BTreeMap<String, RoleManager>,
}

impl Policy {
    /// An empty store with a role manager for every role definition in `model`.
    pub fn new(model: &Model, max_hierarchy_level: usize) -> Self {
        let roles = model
            .role_types()
            .keys()
            .map(|key| (key.clone(), RoleManager::new(max_hierarchy_level)))
            .collect();
        Self {
            rules: Vec::new(),
            roles,
        }
    }

    pub fn from_lines<I>(
        model: &Model,
        lines: I,
        max_hierarchy_level: usize,
    ) -> Result<Self, AuthzError>
    where
        I: IntoIterator<Item = PolicyLine>,
    {
        let mut policy = Self::new(model, max_hierarchy_level);
        for line in lines {
            policy.add_line(model, line)?;
        }
        Ok(policy)
    }

    pub fn from_csv_str(model: &Model, source: &str) -> Result<Self, AuthzError> {
        Self::from_lines(model, parse_csv(source)?, DEFAULT_MAX_HIERARCHY_LEVEL)
    }

    pub fn from_kdl_str(model: &Model, source: &str) -> Result<Self, AuthzError> {
        Self::from_lines(model, parse_kdl(source)?, DEFAULT_MAX_HIERARCHY_LEVEL)
    }

    /// Check `line` against the model and store it as a rule or a role link.
    pub fn add_line(&mut self, model: &Model, line: PolicyLine) -> Result<(), AuthzError> {
        let expected = if line.key == model.policy().key {
            model.policy().arity()
        } else if let Some(&arity) = model.role_types().get(&line.key) {
            arity
        } else {
            return Err(AuthzError::InvalidPolicy(format!(
                "line {}: section `{}` is not declared by the model",
                line.line, line.key
            )));
        };
        if line.fields.len() != expected {
            return Err(AuthzError::PolicyArity {
                key: line.key,
                line: line.line,
                expected,
                found: line.fields.len(),
            });
        }

        if let Some(manager) = self.roles.get_mut(&line.key) {
            let domain = line.fields.get(2).map(String::as_str);
            manager.add_link(&line.fields[0], &line.fields[1], domain);
            return Ok(());
        }

        if let Some(idx) = model.effect_index() {
            RuleEffect::parse(&line.fields[idx]).map_err(|_| {
                AuthzError::InvalidPolicy(format!(
                    "line {}: effect must be `allow` or `deny`, got `{}`",
                    line.line, line.fields[idx]
                ))
            })?;
        }
        self.rules.push(PolicyRule::new(line.fields));
        Ok(())
    }

    /// All rules in insertion order.
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Exact-match lookup of a rule by its fields.
    pub fn has_rule(&self, fields: &[&str]) -> bool {
        self.rules
            .iter()
            .any(|r| r.fields().iter().map(String::as_str).eq(fields.iter().copied()))
    }

    pub fn role_manager(&self, role_type: &str) -> Option<&RoleManager> {
        self.roles.get(role_type)
    }

    /// Transitive roles of `subject` under `role_type`.
    pub fn roles_for(&self, role_type: &str, subject: &str, domain: Option<&str>) -> HashSet<String> {
        self.roles
            .get(role_type)
            .map(|rm| rm.roles_for(subject, domain))
            .unwrap_or_default()
    }

    pub fn link_count(&self) -> usize {
        self.roles.values().map(RoleManager::link_count).sum()
    }
}

/// Parse casbin CSV policy text: `p, /v1/containers/json, GET`.
///
/// Fields are trimmed, `#` starts a comment line and blank lines are skipped.
/// A field containing a comma must be quoted with the quote right after the
/// separator: `p,"a, b",GET`.
pub fn parse_csv(source: &str) -> Result<Vec<PolicyLine>, AuthzError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(source.as_bytes());

    let mut lines = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| AuthzError::InvalidPolicy(e.to_string()))?;
        let line = record
            .position()
            .map(|pos| pos.line() as usize)
            .unwrap_or_default();
        if record.iter().all(str::is_empty) {
            continue;
        }
        let mut fields = record.iter().map(str::to_string);
        let key = fields.next().unwrap_or_default();
        if key.is_empty() {
            return Err(AuthzError::InvalidPolicy(format!(
                "line {line}: missing section key"
            )));
        }
        lines.push(PolicyLine {
            key,
            fields: fields.collect(),
            line,
        });
    }
    Ok(lines)
}

/// Parse KDL policy text: one node per row, e.g. `p "/v1/containers/json" "GET"`.
pub fn parse_kdl(source: &str) -> Result<Vec<PolicyLine>, AuthzError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AuthzError::KdlParse(e.to_string()))?;

    let mut lines = Vec::new();
    for (idx, node) in doc.nodes().iter().enumerate() {
        let key = node.name().value().to_string();
        if node.children().is_some() {
            return Err(AuthzError::InvalidPolicy(format!(
                "node {} (`{key}`) must not have children",
                idx + 1
            )));
        }
        let mut fields = Vec::new();
        for entry in node.entries() {
            if let Some(name) = entry.name() {
                return Err(AuthzError::InvalidPolicy(format!(
                    "node {} (`{key}`) has unexpected property `{}`",
                    idx + 1,
                    name.value()
                )));
            }
            let value = entry.value().as_string().ok_or_else(|| {
                AuthzError::InvalidPolicy(format!(
                    "node {} (`{key}`) arguments must be strings",
                    idx + 1
                ))
            })?;
            fields.push(value.to_string());
        }
        lines.push(PolicyLine {
            key,
            fields,
            line: idx + 1,
        });
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RBAC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act, eft

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow)) && !some(where (p.eft == deny))

[matchers]
m = g(r.sub, p.sub) && keyMatch(r.obj, p.obj) && r.act == p.act
"#;

    fn model() -> Model {
        RBAC_MODEL.parse().unwrap()
    }

    #[test]
    fn test_parse_csv_fields() {
        let lines = parse_csv("p, /v1/containers/json ,GET\np,\"a, b\",\"say \"\"hi\"\"\"\n").unwrap();
        assert_eq!(lines[0].key, "p");
        assert_eq!(lines[0].fields, vec!["/v1/containers/json", "GET"]);
        assert_eq!(lines[1].fields, vec!["a, b", "say \"hi\""]);
        assert_eq!(lines[1].line, 2);
    }

    #[test]
    fn test_parse_csv_rejects_missing_key() {
        assert!(matches!(
            parse_csv(", /v1/info, GET\n"),
            Err(AuthzError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_parse_csv_skips_comments_and_blanks() {
        let lines = parse_csv(
            "# docker policy\n\np, admin, /containers/*, POST, allow\n  \ng, alice, admin\n",
        )
        .unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].key, "p");
        assert_eq!(lines[0].line, 3);
        assert_eq!(lines[1].fields, vec!["alice", "admin"]);
        assert_eq!(lines[1].line, 5);
    }

    #[test]
    fn test_load_rules_and_links() {
        let policy = Policy::from_csv_str(
            &model(),
            "p, admin, /containers/*, POST, allow\n\
             p, admin, /containers/*, POST, allow\n\
             g, alice, admin\n\
             g, admin, root\n",
        )
        .unwrap();
        assert_eq!(policy.rules().len(), 2);
        assert!(policy.has_rule(&["admin", "/containers/*", "POST", "allow"]));
        assert!(!policy.has_rule(&["admin", "/containers/*", "GET", "allow"]));
        assert_eq!(policy.link_count(), 2);
        let roles = policy.roles_for("g", "alice", None);
        assert!(roles.contains("admin") && roles.contains("root"));
        assert!(policy.roles_for("g2", "alice", None).is_empty());
    }

    #[test]
    fn test_arity_mismatch() {
        let err = Policy::from_csv_str(&model(), "p, admin, /containers/*, POST\n").unwrap_err();
        match err {
            AuthzError::PolicyArity {
                key,
                line,
                expected,
                found,
            } => {
                assert_eq!(key, "p");
                assert_eq!(line, 1);
                assert_eq!(expected, 4);
                assert_eq!(found, 3);
            }
            other => panic!("expected PolicyArity, got {other:?}"),
        }

        let err = Policy::from_csv_str(&model(), "g, alice\n").unwrap_err();
        assert!(matches!(err, AuthzError::PolicyArity { .. }));
    }

    #[test]
    fn test_unknown_section_and_bad_effect() {
        let err = Policy::from_csv_str(&model(), "p2, a, b, c, allow\n").unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));

        let err = Policy::from_csv_str(&model(), "p, a, b, c, maybe\n").unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_parse_kdl_rows() {
        let policy = Policy::from_kdl_str(
            &model(),
            r#"
p "admin" "/containers/*" "POST" "allow"
p "admin" "/images/*" "DELETE" "deny"
g "alice" "admin"
"#,
        )
        .unwrap();
        assert_eq!(policy.rules().len(), 2);
        assert_eq!(policy.rules()[1].get(3), Some("deny"));
        assert!(policy.role_manager("g").unwrap().has_link("alice", "admin", None));
    }

    #[test]
    fn test_parse_kdl_rejects_non_strings() {
        assert!(matches!(
            parse_kdl("p \"admin\" 42"),
            Err(AuthzError::InvalidPolicy(_))
        ));
        assert!(matches!(
            parse_kdl("p \"admin\" act=\"GET\""),
            Err(AuthzError::InvalidPolicy(_))
        ));
        assert!(matches!(parse_kdl("p \"unterminated"), Err(AuthzError::KdlParse(_))));
    }

    #[test]
    fn test_rule_display() {
        let rule = PolicyRule::new(vec!["/v1/containers/json".into(), "GET".into()]);
        assert_eq!(rule.to_string(), "/v1/containers/json, GET");
    }
}
