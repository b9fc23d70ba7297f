//! Built-in pattern functions callable from a matcher.
//!
//! - `keyMatch(path, pattern)`: `*` in the pattern matches everything after
//!   its position, e.g. `/containers/*` matches `/containers/123/start`.
//! - `keyMatch2(path, pattern)`: `:name` matches one path segment and `/*`
//!   matches the rest, e.g. `/containers/:id/start`.
//! - `keyMatch3(path, pattern)`: like `keyMatch2` with `{name}` segments.
//! - `regexMatch(value, regex)`: unanchored regular expression search.
//! - `globMatch(value, pattern)`: `*` matches any run of characters.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::authz::errors::AuthzError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    KeyMatch,
    KeyMatch2,
    KeyMatch3,
    RegexMatch,
    GlobMatch,
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::KeyMatch => "keyMatch",
            Builtin::KeyMatch2 => "keyMatch2",
            Builtin::KeyMatch3 => "keyMatch3",
            Builtin::RegexMatch => "regexMatch",
            Builtin::GlobMatch => "globMatch",
        }
    }

    pub fn arity(&self) -> usize {
        2
    }

    pub fn call(&self, args: &[&str], regexes: &RegexCache) -> Result<bool, AuthzError> {
        let [value, pattern] = args else {
            return Err(AuthzError::Evaluation(format!(
                "`{}` expects {} arguments, got {}",
                self.name(),
                self.arity(),
                args.len()
            )));
        };
        match self {
            Builtin::KeyMatch => Ok(key_match(value, pattern)),
            Builtin::KeyMatch2 => key_match2(value, pattern, regexes),
            Builtin::KeyMatch3 => key_match3(value, pattern, regexes),
            Builtin::RegexMatch => Ok(regexes.get(pattern)?.is_match(value)),
            Builtin::GlobMatch => Ok(glob_match(pattern, value)),
        }
    }
}

impl FromStr for Builtin {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyMatch" => Ok(Builtin::KeyMatch),
            "keyMatch2" => Ok(Builtin::KeyMatch2),
            "keyMatch3" => Ok(Builtin::KeyMatch3),
            "regexMatch" => Ok(Builtin::RegexMatch),
            "globMatch" => Ok(Builtin::GlobMatch),
            other => Err(AuthzError::InvalidMatcher(format!(
                "unknown function `{other}`"
            ))),
        }
    }
}

/// Compiled regular expressions shared by every evaluation of one enforcer.
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: RwLock<HashMap<String, Arc<Regex>>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pattern: &str) -> Result<Arc<Regex>, AuthzError> {
        if let Some(re) = self.compiled.read().get(pattern) {
            return Ok(re.clone());
        }
        let re = Arc::new(Regex::new(pattern).map_err(|e| {
            AuthzError::Evaluation(format!("invalid regular expression `{pattern}`: {e}"))
        })?);
        self.compiled
            .write()
            .insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    /// Drop every compiled pattern, e.g. once the policy that used them is gone.
    pub fn clear(&self) {
        self.compiled.write().clear();
    }

    pub fn len(&self) -> usize {
        self.compiled.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.read().is_empty()
    }
}

pub fn key_match(key: &str, pattern: &str) -> bool {
    match pattern.find('*') {
        None => key == pattern,
        Some(i) => key.starts_with(&pattern[..i]),
    }
}

pub fn key_match2(key: &str, pattern: &str, regexes: &RegexCache) -> Result<bool, AuthzError> {
    let pattern = pattern.replace("/*", "/.*");
    let segment = regexes.get(r":[^/]+")?;
    let pattern = segment.replace_all(&pattern, "[^/]+");
    Ok(regexes.get(&format!("^{pattern}$"))?.is_match(key))
}

pub fn key_match3(key: &str, pattern: &str, regexes: &RegexCache) -> Result<bool, AuthzError> {
    let pattern = pattern.replace("/*", "/.*");
    let segment = regexes.get(r"\{[^/]+?\}")?;
    let pattern = segment.replace_all(&pattern, "[^/]+");
    Ok(regexes.get(&format!("^{pattern}$"))?.is_match(key))
}

/// Iterative wildcard match with single-star backtracking.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let (mut p_idx, mut v_idx) = (0usize, 0usize);
    let (mut star_idx, mut match_idx) = (None, 0usize);
    let pattern = pattern.as_bytes();
    let value = value.as_bytes();

    while v_idx < value.len() {
        if p_idx < pattern.len() && pattern[p_idx] == b'*' {
            star_idx = Some(p_idx);
            match_idx = v_idx;
            p_idx += 1;
            continue;
        }

        if p_idx < pattern.len() && pattern[p_idx] == value[v_idx] {
            p_idx += 1;
            v_idx += 1;
            continue;
        }

        if let Some(star) = star_idx {
            p_idx = star + 1;
            match_idx += 1;
            v_idx = match_idx;
            continue;
        }

        return false;
    }

    while p_idx < pattern.len() && pattern[p_idx] == b'*' {
        p_idx += 1;
    }

    p_idx == pattern.len()
}
