use std::fmt;
use std::str::FromStr;

use crate::authz::errors::AuthzError;

/// Effect carried by a single policy row (`p.eft`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEffect {
    Allow,
    Deny,
}

impl RuleEffect {
    pub fn parse(value: &str) -> Result<Self, AuthzError> {
        match value {
            "allow" => Ok(RuleEffect::Allow),
            "deny" => Ok(RuleEffect::Deny),
            other => Err(AuthzError::Evaluation(format!(
                "policy effect must be `allow` or `deny`, got `{other}`"
            ))),
        }
    }
}

/// How per-row matcher results combine into one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// `some(where (p.eft == allow))`
    AllowOverride,
    /// `!some(where (p.eft == deny))`
    DenyOverride,
    /// `some(where (p.eft == allow)) && !some(where (p.eft == deny))`
    AllowAndDeny,
    /// `priority(p.eft) || deny`
    Priority,
}

/// Outcome of combining matched rows. `rule` is the index of the row that
/// decided, when one did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Combined {
    pub allowed: bool,
    pub rule: Option<usize>,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::AllowOverride => "some(where (p.eft == allow))",
            Effect::DenyOverride => "!some(where (p.eft == deny))",
            Effect::AllowAndDeny => {
                "some(where (p.eft == allow)) && !some(where (p.eft == deny))"
            }
            Effect::Priority => "priority(p.eft) || deny",
        }
    }

    /// Combine `(row index, row effect)` pairs of matching rows, in rule order.
    pub fn combine<I>(&self, matched: I) -> Combined
    where
        I: IntoIterator<Item = (usize, RuleEffect)>,
    {
        let mut first_allow = None;
        for (idx, eft) in matched {
            match (self, eft) {
                (Effect::Priority, eft) => {
                    return Combined {
                        allowed: eft == RuleEffect::Allow,
                        rule: Some(idx),
                    };
                }
                (Effect::DenyOverride | Effect::AllowAndDeny, RuleEffect::Deny) => {
                    return Combined {
                        allowed: false,
                        rule: Some(idx),
                    };
                }
                (Effect::AllowOverride, RuleEffect::Allow) => {
                    return Combined {
                        allowed: true,
                        rule: Some(idx),
                    };
                }
                (_, RuleEffect::Allow) => {
                    first_allow.get_or_insert(idx);
                }
                (Effect::AllowOverride, RuleEffect::Deny) => {}
            }
        }

        match self {
            Effect::DenyOverride => Combined {
                allowed: true,
                rule: first_allow,
            },
            Effect::AllowAndDeny => Combined {
                allowed: first_allow.is_some(),
                rule: first_allow,
            },
            Effect::AllowOverride | Effect::Priority => Combined {
                allowed: false,
                rule: None,
            },
        }
    }
}

impl FromStr for Effect {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        match compact.as_str() {
            "some(where(p.eft==allow))" => Ok(Effect::AllowOverride),
            "!some(where(p.eft==deny))" => Ok(Effect::DenyOverride),
            "some(where(p.eft==allow))&&!some(where(p.eft==deny))" => Ok(Effect::AllowAndDeny),
            "priority(p.eft)||deny" => Ok(Effect::Priority),
            _ => Err(AuthzError::UnsupportedEffect(s.trim().to_string())),
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
