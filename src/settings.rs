use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::authz::role::DEFAULT_MAX_HIERARCHY_LEVEL;
use crate::errors::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub policy: PolicySettings,
}

/// Transport the plugin listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Listen {
    /// Unix socket under the daemon's plugin discovery directory.
    #[default]
    Unix,
    /// TCP, for plugins registered through a `.spec` file.
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen: Listen,
    /// Socket the daemon discovers the plugin by. Default: /run/docker/plugins/casbin-authz.sock
    pub socket_path: PathBuf,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Access-control model (INI). Default: policies/model.conf
    pub model_path: PathBuf,
    /// Policy file, or a directory of `.csv`/`.kdl` policy files. Default: policies/policy.csv
    pub policy_path: PathBuf,
    #[serde(default = "default_max_hierarchy_level")]
    pub max_hierarchy_level: usize,
    /// Re-read the policy on SIGHUP.
    #[serde(default = "default_reload_on_hangup")]
    pub reload_on_hangup: bool,
}

fn default_max_hierarchy_level() -> usize {
    DEFAULT_MAX_HIERARCHY_LEVEL
}

fn default_reload_on_hangup() -> bool {
    true
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Listen::Unix,
            socket_path: PathBuf::from("/run/docker/plugins/casbin-authz.sock"),
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("policies/model.conf"),
            policy_path: PathBuf::from("policies/policy.csv"),
            max_hierarchy_level: DEFAULT_MAX_HIERARCHY_LEVEL,
            reload_on_hangup: true,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, AppError> {
        let server = Server::default();
        let policy = PolicySettings::default();
        let mut builder = config::Config::builder()
            .set_default("server.listen", "unix")?
            .set_default(
                "server.socket_path",
                server.socket_path.to_string_lossy().to_string(),
            )?
            .set_default("server.host", server.host)?
            .set_default("server.port", server.port)?
            .set_default(
                "policy.model_path",
                policy.model_path.to_string_lossy().to_string(),
            )?
            .set_default(
                "policy.policy_path",
                policy.policy_path.to_string_lossy().to_string(),
            )?
            .set_default("policy.max_hierarchy_level", policy.max_hierarchy_level as u64)?
            .set_default("policy.reload_on_hangup", policy.reload_on_hangup)?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: DOCKER_AUTHZ__SERVER__LISTEN=tcp, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("DOCKER_AUTHZ").separator("__"));

        let mut s: Settings = builder.build()?.try_deserialize()?;

        // Normalize policy paths to be relative to current dir
        let cwd = std::env::current_dir()?;
        if s.policy.model_path.is_relative() {
            s.policy.model_path = cwd.join(&s.policy.model_path);
        }
        if s.policy.policy_path.is_relative() {
            s.policy.policy_path = cwd.join(&s.policy.policy_path);
        }

        Ok(s)
    }
}
