//! Remote command execution over ssh for `--run`.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{
    errors::{Error, Result},
    instance::Instance,
};

/// The `ssh` section of the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SshSettings {
    /// Private key path passed to `ssh -i`.
    pub identity: String,
    pub username: String,
}

/// Runs the command on every instance, one host at a time. Per-host
/// failures are logged and counted, never fatal; only a failure to spawn
/// `ssh` itself aborts.
pub async fn run_command(ssh: &SshSettings, instances: &[Instance], command: &str) -> Result<()> {
    if instances.is_empty() {
        warn!("no instances to run the command on");
        return Ok(());
    }

    let mut failed: usize = 0;
    for rec in instances {
        let host = match target_host(rec) {
            Some(h) => h,
            None => {
                warn!("'{}' has no reachable address, skipping", rec.instance_id);
                failed += 1;
                continue;
            }
        };
        let target = format!("{}@{}", ssh.username, host);
        info!("running on {}: {}", target, command);

        let output = Command::new("ssh")
            .arg("-i")
            .arg(&ssh.identity)
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg(&target)
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::Other {
                message: format!("failed to spawn ssh {:?}", e),
                is_retryable: false,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            println!("{}", stdout.trim_end());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!("[{}] {}", target, stderr.trim_end());
        }
        if !output.status.success() {
            warn!("command on {} exited with {}", target, output.status);
            failed += 1;
        }
    }

    if failed > 0 {
        warn!("command failed on {} of {} host(s)", failed, instances.len());
    }
    Ok(())
}

/// Prefers the public IPv4, falls back to the public hostname.
fn target_host(rec: &Instance) -> Option<String> {
    if !rec.public_ipv4.is_empty() {
        return Some(rec.public_ipv4.clone());
    }
    if !rec.public_hostname.is_empty() {
        return Some(rec.public_hostname.clone());
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::DateTime;

    use super::*;

    fn host_record(ipv4: &str, hostname: &str) -> Instance {
        Instance {
            provider: String::from("ec2"),
            instance_id: String::from("i-abc"),
            launched_at_utc: DateTime::from_timestamp(1_690_000_000, 0).unwrap(),
            state: String::from("running"),
            availability_zone: String::from("us-west-2a"),
            public_hostname: String::from(hostname),
            public_ipv4: String::from(ipv4),
            tags: HashMap::new(),
        }
    }

    /// RUST_LOG=debug cargo test --package hailstorm --lib -- ssh::tests::test_target_host --exact --show-output
    #[test]
    fn test_target_host() {
        let _ = env_logger::builder().is_test(true).try_init();

        let both = host_record("203.0.113.5", "host.example.com");
        assert_eq!(target_host(&both).unwrap(), "203.0.113.5");

        let hostname_only = host_record("", "host.example.com");
        assert_eq!(target_host(&hostname_only).unwrap(), "host.example.com");

        let neither = host_record("", "");
        assert!(target_host(&neither).is_none());
    }
}
