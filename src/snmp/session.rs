//! SNMP session transport
//!
//! The wire protocol is out of scope here: [`SnmpSession`] is the seam,
//! and the production implementation delegates to the net-snmp
//! command-line tools. Drivers only ever see `(oid, value)` pairs.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use crate::error::{Error, Result};
use crate::topology::Switch;

/// One OID/value pair from a get or walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarBind {
    pub oid: String,
    pub value: String,
}

/// SNMPv3 security level, derived from which protocol fields are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

impl SecurityLevel {
    fn flag(self) -> &'static str {
        match self {
            SecurityLevel::NoAuthNoPriv => "noAuthNoPriv",
            SecurityLevel::AuthNoPriv => "authNoPriv",
            SecurityLevel::AuthPriv => "authPriv",
        }
    }
}

/// Connection parameters for one switch session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub address: String,
    pub user: String,
    pub auth_password: String,
    pub auth_protocol: String,
    pub priv_password: String,
    pub priv_protocol: String,
}

impl SessionConfig {
    /// Builds connection parameters from a topology switch record. The
    /// address gets the default SNMP port appended when none is present.
    pub fn from_switch(switch: &Switch) -> Self {
        let mut address = switch.address.clone();
        if !address.contains(':') {
            address.push_str(":161");
        }
        Self {
            address,
            user: switch.snmp_user.clone(),
            auth_password: switch.snmp_auth_password.clone(),
            auth_protocol: switch.snmp_auth_protocol.clone(),
            priv_password: switch.snmp_priv_password.clone(),
            priv_protocol: switch.snmp_priv_protocol.clone(),
        }
    }

    /// Security level follows from the protocol fields: no auth protocol
    /// means no authentication at all; no priv protocol means auth only.
    pub fn security_level(&self) -> SecurityLevel {
        if self.auth_protocol.eq_ignore_ascii_case("none") || self.auth_protocol.is_empty() {
            SecurityLevel::NoAuthNoPriv
        } else if self.priv_protocol.eq_ignore_ascii_case("none") || self.priv_protocol.is_empty() {
            SecurityLevel::AuthNoPriv
        } else {
            SecurityLevel::AuthPriv
        }
    }
}

/// An established session capable of gets and bulk walks.
#[async_trait]
pub trait SnmpSession: Send + Sync {
    /// Fetches a single OID's value.
    async fn get(&self, oid: &str) -> Result<String>;

    /// Walks a subtree, returning every `(oid, value)` pair under it.
    async fn get_bulk_walk(&self, oid: &str) -> Result<Vec<VarBind>>;
}

/// Factory closure building sessions; tests inject their own.
pub type SessionFactory =
    std::sync::Arc<dyn Fn(SessionConfig) -> Box<dyn SnmpSession> + Send + Sync>;

/// The default factory producing [`NetSnmpSession`]s.
pub fn net_snmp_factory() -> SessionFactory {
    std::sync::Arc::new(|config| -> Box<dyn SnmpSession> { Box::new(NetSnmpSession::new(config)) })
}

// =============================================================================
// net-snmp CLI adapter
// =============================================================================

/// Session implementation shelling out to the net-snmp tools
/// (`snmpget` / `snmpbulkwalk`) with v3 security parameters.
pub struct NetSnmpSession {
    config: SessionConfig,
}

impl NetSnmpSession {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    fn base_args(&self) -> Vec<String> {
        let cfg = &self.config;
        let level = cfg.security_level();

        // -Oqn: quick print, numeric OIDs -> "oid value" per line
        let mut args = vec![
            "-v3".to_string(),
            "-Oqn".to_string(),
            "-t".to_string(),
            "5".to_string(),
            "-r".to_string(),
            "1".to_string(),
            "-l".to_string(),
            level.flag().to_string(),
            "-u".to_string(),
            cfg.user.clone(),
        ];

        if level != SecurityLevel::NoAuthNoPriv {
            args.push("-a".to_string());
            args.push(cfg.auth_protocol.to_uppercase());
            args.push("-A".to_string());
            args.push(cfg.auth_password.clone());
        }
        if level == SecurityLevel::AuthPriv {
            args.push("-x".to_string());
            args.push(cfg.priv_protocol.to_uppercase());
            args.push("-X".to_string());
            args.push(cfg.priv_password.clone());
        }

        args.push(format!("udp:{}", cfg.address));
        args
    }

    async fn run(&self, tool: &str, oid: &str) -> Result<String> {
        let mut args = self.base_args();
        args.push(oid.to_string());

        trace!("{tool} {} {oid}", self.config.address);
        let output = Command::new(tool)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::SnmpTransport(format!("failed to run {tool}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::SnmpTransport(format!(
                "{tool} against {} failed: {}",
                self.config.address,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parses `-Oqn` output: one `oid value` pair per line, value possibly
/// quoted and possibly containing spaces.
pub fn parse_quick_output(stdout: &str) -> Vec<VarBind> {
    let mut binds = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (oid, value) = match line.split_once(' ') {
            Some(pair) => pair,
            None => (line, ""),
        };
        if !oid.starts_with('.') && !oid.starts_with(|c: char| c.is_ascii_digit()) {
            // Diagnostic output, not a varbind
            continue;
        }
        binds.push(VarBind {
            oid: oid.trim_start_matches('.').to_string(),
            value: value.trim().trim_matches('"').to_string(),
        });
    }
    binds
}

#[async_trait]
impl SnmpSession for NetSnmpSession {
    async fn get(&self, oid: &str) -> Result<String> {
        let stdout = self.run("snmpget", oid).await?;
        let binds = parse_quick_output(&stdout);
        binds
            .into_iter()
            .next()
            .map(|b| b.value)
            .ok_or_else(|| Error::SnmpTransport(format!("empty response for {oid}")))
    }

    async fn get_bulk_walk(&self, oid: &str) -> Result<Vec<VarBind>> {
        let stdout = self.run("snmpbulkwalk", oid).await?;
        Ok(parse_quick_output(&stdout))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_level_derivation() {
        let mut config = SessionConfig {
            auth_protocol: "none".to_string(),
            ..Default::default()
        };
        assert_eq!(config.security_level(), SecurityLevel::NoAuthNoPriv);

        config.auth_protocol = "MD5".to_string();
        config.priv_protocol = "none".to_string();
        assert_eq!(config.security_level(), SecurityLevel::AuthNoPriv);

        config.priv_protocol = "DES".to_string();
        assert_eq!(config.security_level(), SecurityLevel::AuthPriv);
    }

    #[test]
    fn test_from_switch_appends_default_port() {
        let switch = Switch {
            address: "10.254.0.2".to_string(),
            ..Default::default()
        };
        assert_eq!(SessionConfig::from_switch(&switch).address, "10.254.0.2:161");

        let with_port = Switch {
            address: "10.254.0.2:1161".to_string(),
            ..Default::default()
        };
        assert_eq!(
            SessionConfig::from_switch(&with_port).address,
            "10.254.0.2:1161"
        );
    }

    #[test]
    fn test_parse_quick_output() {
        let stdout = "\
.1.3.6.1.2.1.31.1.1.1.1.41 \"ethernet1/1/1\"
.1.3.6.1.2.1.31.1.1.1.1.42 mgmt1/1/1
.1.3.6.1.2.1.17.1.4.1.2.1 41
";
        let binds = parse_quick_output(stdout);
        assert_eq!(binds.len(), 3);
        assert_eq!(binds[0].oid, "1.3.6.1.2.1.31.1.1.1.1.41");
        assert_eq!(binds[0].value, "ethernet1/1/1");
        assert_eq!(binds[1].value, "mgmt1/1/1");
        assert_eq!(binds[2].value, "41");
    }

    #[test]
    fn test_parse_quick_output_value_with_spaces() {
        let binds = parse_quick_output(".1.3.6.1.2.1.1.1.0 \"Dell EMC Networking OS10\"\n");
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].value, "Dell EMC Networking OS10");
    }

    #[test]
    fn test_parse_quick_output_skips_noise() {
        let binds = parse_quick_output("Timeout: No Response from udp:10.0.0.1:161\n");
        assert!(binds.is_empty());
    }

    #[test]
    fn test_auth_priv_args_carry_protocols() {
        let session = NetSnmpSession::new(SessionConfig {
            address: "10.254.0.2:161".to_string(),
            user: "scanner".to_string(),
            auth_password: "authpw00".to_string(),
            auth_protocol: "sha".to_string(),
            priv_password: "privpw00".to_string(),
            priv_protocol: "aes".to_string(),
        });
        let args = session.base_args();
        assert!(args.contains(&"authPriv".to_string()));
        assert!(args.contains(&"SHA".to_string()));
        assert!(args.contains(&"AES".to_string()));
        assert!(args.contains(&"udp:10.254.0.2:161".to_string()));
    }
}
