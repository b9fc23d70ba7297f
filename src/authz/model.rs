use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::authz::effect::Effect;
use crate::authz::errors::AuthzError;
use crate::authz::matcher::{self, Expr, Scope};

const REQUEST_SECTION: &str = "request_definition";
const POLICY_SECTION: &str = "policy_definition";
const ROLE_SECTION: &str = "role_definition";
const EFFECT_SECTION: &str = "policy_effect";
const MATCHER_SECTION: &str = "matchers";

/// A named field list such as `r = sub, obj, act`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub key: String,
    pub fields: Vec<String>,
}

impl Definition {
    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }
}

/// Parsed access-control model. Immutable after load.
#[derive(Debug, Clone)]
pub struct Model {
    request: Definition,
    policy: Definition,
    /// role definition key -> arity
    role_types: BTreeMap<String, usize>,
    effect: Effect,
    matcher: Expr,
    matcher_source: String,
}

impl Model {
    pub fn from_file(path: &Path) -> Result<Self, AuthzError> {
        let text = std::fs::read_to_string(path).map_err(|source| AuthzError::LoadError {
            path: path.display().to_string(),
            source,
        })?;
        text.parse()
    }

    pub fn request(&self) -> &Definition {
        &self.request
    }

    pub fn policy(&self) -> &Definition {
        &self.policy
    }

    pub fn role_types(&self) -> &BTreeMap<String, usize> {
        &self.role_types
    }

    pub fn effect(&self) -> Effect {
        self.effect
    }

    pub fn matcher(&self) -> &Expr {
        &self.matcher
    }

    pub fn matcher_source(&self) -> &str {
        &self.matcher_source
    }

    /// Index of the `eft` column in policy rows, if the model declares one.
    pub fn effect_index(&self) -> Option<usize> {
        self.policy.field_index("eft")
    }
}

impl FromStr for Model {
    type Err = AuthzError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let sections = parse_sections(source)?;

        let request = single_definition(&sections, REQUEST_SECTION)?;
        let policy = single_definition(&sections, POLICY_SECTION)?;

        let mut role_types = BTreeMap::new();
        for (key, value) in sections.get(ROLE_SECTION).into_iter().flatten() {
            let parts = split_list(value);
            if !(2..=3).contains(&parts.len()) || parts.iter().any(|p| p != "_") {
                return Err(AuthzError::ModelParse(format!(
                    "role definition `{key} = {value}` must be `_, _` or `_, _, _`"
                )));
            }
            role_types.insert(key.clone(), parts.len());
        }

        let (_, effect_src) = single_entry(&sections, EFFECT_SECTION)?;
        let effect: Effect = effect_src.parse()?;
        if policy.field_index("eft").is_none() && effect != Effect::AllowOverride {
            tracing::warn!(
                effect = %effect,
                "policy definition has no `eft` field, every rule is treated as allow"
            );
        }

        let (_, matcher_source) = single_entry(&sections, MATCHER_SECTION)?;
        let scope = Scope {
            request_key: &request.key,
            request_fields: &request.fields,
            policy_key: &policy.key,
            policy_fields: &policy.fields,
            role_types: &role_types,
        };
        let matcher = matcher::compile(matcher_source, scope)?;

        Ok(Self {
            request,
            policy,
            role_types,
            effect,
            matcher,
            matcher_source: matcher_source.to_string(),
        })
    }
}

type Sections = BTreeMap<String, Vec<(String, String)>>;

/// INI-style parsing: `[section]` headers, `key = value` lines, `#`/`;`
/// comments, and `\` line continuations.
fn parse_sections(source: &str) -> Result<Sections, AuthzError> {
    let mut sections: Sections = BTreeMap::new();
    let mut current: Option<String> = None;
    let mut pending = String::new();

    for (lineno, raw) in source.lines().enumerate() {
        let line = raw.trim();
        if pending.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with(';'))
        {
            continue;
        }

        if let Some(continued) = line.strip_suffix('\\') {
            pending.push_str(continued.trim());
            pending.push(' ');
            continue;
        }
        let line = if pending.is_empty() {
            line.to_string()
        } else {
            let joined = format!("{pending}{line}");
            pending.clear();
            joined
        };

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        let Some(section) = &current else {
            return Err(AuthzError::ModelParse(format!(
                "line {}: `{line}` appears before any [section]",
                lineno + 1
            )));
        };
        let Some((key, value)) = line.split_once('=') else {
            return Err(AuthzError::ModelParse(format!(
                "line {}: expected `key = value`, got `{line}`",
                lineno + 1
            )));
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(AuthzError::ModelParse(format!(
                "line {}: empty key or value in `{line}`",
                lineno + 1
            )));
        }
        sections
            .entry(section.clone())
            .or_default()
            .push((key.to_string(), value.to_string()));
    }

    if !pending.is_empty() {
        return Err(AuthzError::ModelParse(
            "model ends with a dangling line continuation".into(),
        ));
    }
    Ok(sections)
}

fn single_entry<'a>(sections: &'a Sections, name: &str) -> Result<(&'a str, &'a str), AuthzError> {
    match sections.get(name).map(Vec::as_slice) {
        Some([(key, value)]) => Ok((key.as_str(), value.as_str())),
        Some([]) | None => Err(AuthzError::ModelParse(format!(
            "missing required section [{name}]"
        ))),
        Some(_) => Err(AuthzError::ModelParse(format!(
            "section [{name}] must contain exactly one entry"
        ))),
    }
}

fn single_definition(sections: &Sections, name: &str) -> Result<Definition, AuthzError> {
    let (key, value) = single_entry(sections, name)?;
    let fields = split_list(value);
    for (i, field) in fields.iter().enumerate() {
        let valid = field
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(AuthzError::ModelParse(format!(
                "invalid field name `{field}` in [{name}]"
            )));
        }
        if fields[..i].contains(field) {
            return Err(AuthzError::ModelParse(format!(
                "duplicate field `{field}` in [{name}]"
            )));
        }
    }
    Ok(Definition {
        key: key.to_string(),
        fields,
    })
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub const BASIC: &str = r#"
[request_definition]
r = obj, act

[policy_definition]
p = obj, act

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = r.obj == p.obj && r.act == p.act
"#;

    #[test]
    fn test_parse_basic_model() {
        let model: Model = BASIC.parse().unwrap();
        assert_eq!(model.request().key, "r");
        assert_eq!(model.request().fields, vec!["obj", "act"]);
        assert_eq!(model.policy().arity(), 2);
        assert_eq!(model.effect(), Effect::AllowOverride);
        assert!(model.role_types().is_empty());
        assert_eq!(model.effect_index(), None);
        assert_eq!(model.matcher_source(), "r.obj == p.obj && r.act == p.act");
    }

    #[test]
    fn test_parse_rbac_model_with_continuation() {
        let src = r#"
# RBAC with deny
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act, eft

[role_definition]
g = _, _
g2 = _, _, _

[policy_effect]
e = !some(where (p.eft == deny))

[matchers]
m = g(r.sub, p.sub) && \
    keyMatch(r.obj, p.obj) && \
    r.act == p.act
"#;
        let model: Model = src.parse().unwrap();
        assert_eq!(model.role_types().get("g"), Some(&2));
        assert_eq!(model.role_types().get("g2"), Some(&3));
        assert_eq!(model.effect(), Effect::DenyOverride);
        assert_eq!(model.effect_index(), Some(3));
    }

    #[test]
    fn test_missing_sections() {
        for section in [
            "[request_definition]",
            "[policy_definition]",
            "[policy_effect]",
            "[matchers]",
        ] {
            let mut src = String::new();
            let mut skip = false;
            for line in BASIC.lines() {
                if line.starts_with('[') {
                    skip = line == section;
                }
                if !skip {
                    src.push_str(line);
                    src.push('\n');
                }
            }
            let err = src.parse::<Model>().unwrap_err();
            assert!(
                matches!(err, AuthzError::ModelParse(_)),
                "removing {section} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_malformed_matcher_fails_at_load() {
        let src = BASIC.replace("r.obj == p.obj && r.act == p.act", "r.obj == p.obj &&");
        assert!(matches!(
            src.parse::<Model>(),
            Err(AuthzError::InvalidMatcher(_))
        ));

        let src = BASIC.replace("r.obj == p.obj", "g(r.obj, p.obj)");
        assert!(matches!(
            src.parse::<Model>(),
            Err(AuthzError::InvalidMatcher(_))
        ));
    }

    #[test]
    fn test_unknown_effect() {
        let src = BASIC.replace("some(where (p.eft == allow))", "max(p.priority)");
        assert!(matches!(
            src.parse::<Model>(),
            Err(AuthzError::UnsupportedEffect(_))
        ));
    }

    #[test]
    fn test_bad_definitions() {
        let src = BASIC.replace("p = obj, act", "p = obj, obj");
        assert!(matches!(src.parse::<Model>(), Err(AuthzError::ModelParse(_))));

        let src = BASIC.replace("p = obj, act", "p = obj, 1act");
        assert!(matches!(src.parse::<Model>(), Err(AuthzError::ModelParse(_))));

        let src = format!("{BASIC}\n[role_definition]\ng = _, _, _, _\n");
        assert!(matches!(src.parse::<Model>(), Err(AuthzError::ModelParse(_))));

        let src = format!("r = obj\n{BASIC}");
        assert!(matches!(src.parse::<Model>(), Err(AuthzError::ModelParse(_))));
    }

    #[test]
    fn test_second_policy_definition_is_rejected() {
        let src = BASIC.replace("p = obj, act", "p = obj, act\np2 = obj, act");
        let err = src.parse::<Model>().unwrap_err();
        assert!(matches!(err, AuthzError::ModelParse(_)));
        assert!(err.to_string().contains("exactly one entry"), "{err}");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.conf");
        std::fs::write(&path, BASIC).unwrap();
        let model = Model::from_file(&path).unwrap();
        assert_eq!(model.policy().fields, vec!["obj", "act"]);

        let err = Model::from_file(&dir.path().join("missing.conf")).unwrap_err();
        assert!(matches!(err, AuthzError::LoadError { .. }));
    }
}
