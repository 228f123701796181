//! Data server launch plan

use crate::common::{ClusterConfig, NodeAddr, Role};
use std::path::{Path, PathBuf};

pub const DEFAULT_PROGRAM: &str = "redis-server";

/// Program and arguments for the data server, built from a role decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchPlan {
    /// Build the argument list: port, replication source for replicas,
    /// credentials, announce address, then the role-specific config file and
    /// the common one.
    pub fn build(
        cluster: &ClusterConfig,
        hostname: &str,
        role: Role,
        master: Option<&NodeAddr>,
        password: Option<&str>,
    ) -> Self {
        let mut args = vec!["--port".to_string(), cluster.data_port.to_string()];

        if let (Role::Replica, Some(master)) = (role, master) {
            args.push("--replicaof".to_string());
            args.push(master.host.clone());
            args.push(master.port.to_string());
        }

        if let Some(password) = password {
            args.push("--requirepass".to_string());
            args.push(password.to_string());
            args.push("--masterauth".to_string());
            args.push(password.to_string());
        }

        args.push("--replica-announce-ip".to_string());
        args.push(cluster.full_hostname(hostname));
        args.push("--replica-announce-port".to_string());
        args.push(cluster.data_port.to_string());

        let role_conf = if role.is_master() {
            "master.conf"
        } else {
            "replica.conf"
        };
        args.push("--include".to_string());
        args.push(conf_path(&cluster.conf_dir, role_conf));
        args.push("--include".to_string());
        args.push(conf_path(&cluster.conf_dir, "redis.conf"));

        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Rendering for logs, with credentials masked
    pub fn redacted(&self) -> String {
        let mut out = self.program.clone();
        let mut mask_next = false;
        for arg in &self.args {
            out.push(' ');
            if mask_next {
                out.push_str("****");
            } else {
                out.push_str(arg);
            }
            mask_next = arg == "--requirepass" || arg == "--masterauth";
        }
        out
    }
}

fn conf_path(dir: &Path, file: &str) -> String {
    PathBuf::from(dir).join(file).display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_plan() {
        let cluster = ClusterConfig::default();
        let plan = LaunchPlan::build(&cluster, "redis-node-0", Role::Master, None, None);
        assert_eq!(plan.program, "redis-server");
        assert_eq!(&plan.args[..2], &["--port", "6379"]);
        assert!(!plan.args.iter().any(|a| a == "--replicaof"));
        assert!(plan
            .args
            .contains(&"/opt/bitnami/redis/etc/master.conf".to_string()));
        assert_eq!(
            plan.args.last().map(String::as_str),
            Some("/opt/bitnami/redis/etc/redis.conf")
        );
    }

    #[test]
    fn test_replica_plan_with_auth() {
        let cluster = ClusterConfig::default();
        let master = NodeAddr::new("redis-node-0.redis-headless.default.svc.cluster.local", 6379);
        let plan = LaunchPlan::build(
            &cluster,
            "redis-node-1",
            Role::Replica,
            Some(&master),
            Some("pw"),
        );
        let idx = plan.args.iter().position(|a| a == "--replicaof").unwrap();
        assert_eq!(plan.args[idx + 1], master.host);
        assert_eq!(plan.args[idx + 2], "6379");
        assert!(plan
            .args
            .contains(&"/opt/bitnami/redis/etc/replica.conf".to_string()));
        assert!(plan
            .args
            .contains(&"redis-node-1.redis-headless.default.svc.cluster.local".to_string()));

        let shown = plan.redacted();
        assert!(!shown.contains("pw "));
        assert!(shown.contains("--requirepass ****"));
    }
}
