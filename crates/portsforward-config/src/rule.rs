//! Forwarding rules and the `portsforward.conf` line format
//!
//! One rule per line: `sourcePort,destinationHost,destinationPort,bandwidth`.
//! Parsing is best effort: a malformed numeric field reads as zero, and a line
//! that could never be served (missing fields, zero port, duplicate source
//! port) is skipped with a warning instead of failing the whole reload.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::ConfigError;

/// Rule written to an absent or empty rules file
pub const DEFAULT_RULE_LINE: &str = "22001,0.0.0.0,22000,1500";

/// Bandwidth values in the rules file are KiB per second
const BANDWIDTH_UNIT: u64 = 1024;

/// A single source-port-to-destination mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub source_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
    /// Per-connection ceiling in KiB/s, `0` means unlimited
    pub bandwidth: u64,
}

impl ForwardRule {
    pub fn new(
        source_port: u16,
        destination_host: impl Into<String>,
        destination_port: u16,
        bandwidth: u64,
    ) -> Self {
        Self {
            source_port,
            destination_host: destination_host.into(),
            destination_port,
            bandwidth,
        }
    }

    /// Address the rule's listener binds to
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.source_port))
    }

    /// `host:port` string handed to the dialer
    pub fn destination_addr(&self) -> String {
        format!("{}:{}", self.destination_host, self.destination_port)
    }

    pub fn bandwidth_bytes_per_sec(&self) -> u64 {
        self.bandwidth.saturating_mul(BANDWIDTH_UNIT)
    }

    /// Render the rule back into its file line
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{}",
            self.source_port, self.destination_host, self.destination_port, self.bandwidth
        )
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "srcPort: {}, dstHost: {}, dstPort: {}, bandwidth: {} KiB/s",
            self.source_port, self.destination_host, self.destination_port, self.bandwidth
        )
    }
}

/// Ordered rules from one version of the rules file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<ForwardRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<ForwardRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ForwardRule] {
        &self.rules
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ForwardRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn source_ports(&self) -> Vec<u16> {
        self.rules.iter().map(|r| r.source_port).collect()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a ForwardRule;
    type IntoIter = std::slice::Iter<'a, ForwardRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

/// Parse the rules file content
pub fn parse_rules(content: &str) -> RuleSet {
    let mut rules = Vec::new();
    let mut seen_ports = HashSet::new();

    for (index, line) in content.trim().split('\n').enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(rule) = parse_line(line) else {
            warn!("Skipping rules line {}: {:?}", line_no, line);
            continue;
        };

        if !seen_ports.insert(rule.source_port) {
            warn!(
                "Skipping rules line {}: source port {} is already forwarded",
                line_no, rule.source_port
            );
            continue;
        }

        debug!("Parsed rule: {}", rule);
        rules.push(rule);
    }

    RuleSet::new(rules)
}

fn parse_line(line: &str) -> Option<ForwardRule> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 4 {
        return None;
    }

    let source_port = parse_port(parts[0])?;
    let destination_host = parts[1].to_string();
    let destination_port = parse_port(parts[2])?;
    let bandwidth = parts[3].parse::<i64>().unwrap_or(0).max(0) as u64;

    Some(ForwardRule {
        source_port,
        destination_host,
        destination_port,
        bandwidth,
    })
}

/// Malformed ports read as zero, and zero is not a usable port
fn parse_port(field: &str) -> Option<u16> {
    let port = field.parse::<i64>().unwrap_or(0);
    u16::try_from(port).ok().filter(|p| *p != 0)
}

/// Read the rules file, seeding it with `default_line` when absent or empty
pub async fn ensure_rules_file(path: &Path, default_line: &str) -> Result<String, ConfigError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(ConfigError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if !content.trim().is_empty() {
        return Ok(content);
    }

    let content = format!("{}\n", default_line.trim());
    tokio::fs::write(path, &content)
        .await
        .map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
    warn!("Rules file {:?} was empty, wrote default rule", path);

    Ok(content)
}
