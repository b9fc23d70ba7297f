use std::path::{Path, PathBuf};

use crate::authz::errors::AuthzError;
use crate::authz::model::Model;
use crate::authz::policy::{parse_csv, parse_kdl, Policy, PolicyLine};

/// Load policy rows from a single file or from every `.csv`/`.kdl` file in a
/// directory (sorted by path, merged in that order).
pub fn load_policy(
    model: &Model,
    path: &Path,
    max_hierarchy_level: usize,
) -> Result<Policy, AuthzError> {
    let files = policy_files(path)?;

    let mut policy = Policy::new(model, max_hierarchy_level);
    for file in &files {
        for line in read_policy_file(file)? {
            policy.add_line(model, line).map_err(|e| match e {
                AuthzError::InvalidPolicy(msg) => {
                    AuthzError::InvalidPolicy(format!("{}: {msg}", file.display()))
                }
                other => other,
            })?;
        }
    }

    tracing::info!(
        path = %path.display(),
        files = files.len(),
        rules = policy.rules().len(),
        role_links = policy.link_count(),
        "Loaded authorization policy"
    );

    Ok(policy)
}

fn policy_files(path: &Path) -> Result<Vec<PathBuf>, AuthzError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(AuthzError::InvalidPolicy(format!(
            "policy path `{}` does not exist",
            path.display()
        )));
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && matches!(extension(p), Some("csv" | "kdl")))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(AuthzError::InvalidPolicy(format!(
            "policy directory `{}` contains no .csv or .kdl files",
            path.display()
        )));
    }
    Ok(files)
}

/// Read one policy file; `.kdl` files are KDL, anything else is CSV.
pub fn read_policy_file(path: &Path) -> Result<Vec<PolicyLine>, AuthzError> {
    let contents = std::fs::read_to_string(path).map_err(|source| AuthzError::LoadError {
        path: path.display().to_string(),
        source,
    })?;
    match extension(path) {
        Some("kdl") => parse_kdl(&contents),
        _ => parse_csv(&contents),
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::role::DEFAULT_MAX_HIERARCHY_LEVEL;

    const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && keyMatch(r.obj, p.obj) && r.act == p.act
"#;

    fn model() -> Model {
        MODEL.parse().unwrap()
    }

    #[test]
    fn test_load_single_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.csv");
        std::fs::write(&path, "p, admin, /containers/*, GET\ng, alice, admin\n").unwrap();

        let policy = load_policy(&model(), &path, DEFAULT_MAX_HIERARCHY_LEVEL).unwrap();
        assert_eq!(policy.rules().len(), 1);
        assert_eq!(policy.link_count(), 1);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("20_containers.csv"),
            "p, admin, /containers/*, POST\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("10_images.kdl"),
            "p \"admin\" \"/images/*\" \"GET\"\ng \"alice\" \"admin\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a policy").unwrap();

        let policy = load_policy(&model(), dir.path(), DEFAULT_MAX_HIERARCHY_LEVEL).unwrap();
        assert_eq!(policy.rules().len(), 2);
        // sorted by file name: the KDL file comes first
        assert_eq!(policy.rules()[0].get(1), Some("/images/*"));
        assert_eq!(policy.rules()[1].get(1), Some("/containers/*"));
        assert_eq!(policy.link_count(), 1);
    }

    #[test]
    fn test_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.csv"), "x, a, b\n").unwrap();
        let err = load_policy(&model(), dir.path(), DEFAULT_MAX_HIERARCHY_LEVEL).unwrap_err();
        match err {
            AuthzError::InvalidPolicy(msg) => assert!(msg.contains("bad.csv")),
            other => panic!("expected InvalidPolicy, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "not a policy").unwrap();
        let err = load_policy(&model(), dir.path(), DEFAULT_MAX_HIERARCHY_LEVEL).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_load_nonexistent_path() {
        let err = load_policy(
            &model(),
            Path::new("/nonexistent/policy.csv"),
            DEFAULT_MAX_HIERARCHY_LEVEL,
        )
        .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }
}
