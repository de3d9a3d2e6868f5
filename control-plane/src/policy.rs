//! Per-user access rules and the matching algorithm that evaluates them.
//!
//! Unknown users default-permit (no rules on file); once a user has a
//! single rule, evaluation becomes closed-world — the first rule that
//! matches decides, and no match denies. That asymmetry is load-bearing,
//! not an oversight, and every test below exercises it explicitly.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ControlPlaneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Domain,
    Ip,
    IpRange,
    UrlPattern,
    ProtocolRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: Uuid,
    pub user_id: String,
    pub rule_type: RuleType,
    pub access_type: AccessType,
    pub pattern: String,
    pub priority: i64,
    pub is_active: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RuleBundle {
    pub allow_domains: Vec<String>,
    pub deny_domains: Vec<String>,
    pub allow_ips: Vec<String>,
    pub deny_ips: Vec<String>,
    pub allow_ip_ranges: Vec<String>,
    pub deny_ip_ranges: Vec<String>,
    pub allow_url_patterns: Vec<String>,
    pub deny_url_patterns: Vec<String>,
    pub allow_protocol_rules: Vec<String>,
    pub deny_protocol_rules: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub cached_at: OffsetDateTime,
}

pub struct PolicyStore {
    rules: RwLock<HashMap<String, Vec<AccessRule>>>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, mut rule: AccessRule) -> AccessRule {
        rule.id = Uuid::new_v4();
        let mut guard = self.rules.write();
        let user_rules = guard.entry(rule.user_id.clone()).or_default();
        user_rules.push(rule.clone());
        user_rules.sort_by_key(|r| r.priority);
        rule
    }

    pub fn update(&self, user_id: &str, rule_id: Uuid, patch: impl FnOnce(&mut AccessRule)) -> Result<AccessRule> {
        let mut guard = self.rules.write();
        let user_rules = guard
            .get_mut(user_id)
            .ok_or_else(|| ControlPlaneError::not_found("no rules for this user"))?;

        let rule = user_rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| ControlPlaneError::not_found("rule not found"))?;

        patch(rule);
        let updated = rule.clone();
        user_rules.sort_by_key(|r| r.priority);
        Ok(updated)
    }

    pub fn remove(&self, user_id: &str, rule_id: Uuid) -> bool {
        let mut guard = self.rules.write();
        match guard.get_mut(user_id) {
            Some(user_rules) => {
                let before = user_rules.len();
                user_rules.retain(|r| r.id != rule_id);
                before != user_rules.len()
            }
            None => false,
        }
    }

    pub fn get_user(&self, user_id: &str) -> Vec<AccessRule> {
        self.rules.read().get(user_id).cloned().unwrap_or_default()
    }

    pub fn get_all(&self) -> HashMap<String, Vec<AccessRule>> {
        self.rules.read().clone()
    }

    pub fn export_user(&self, user_id: &str) -> RuleBundle {
        let rules = self.get_user(user_id);
        let mut bundle = RuleBundle {
            cached_at: OffsetDateTime::now_utc(),
            ..Default::default()
        };

        for rule in rules.iter().filter(|r| r.is_active) {
            let (allow_bucket, deny_bucket): (&mut Vec<String>, &mut Vec<String>) = match rule.rule_type {
                RuleType::Domain => (&mut bundle.allow_domains, &mut bundle.deny_domains),
                RuleType::Ip => (&mut bundle.allow_ips, &mut bundle.deny_ips),
                RuleType::IpRange => (&mut bundle.allow_ip_ranges, &mut bundle.deny_ip_ranges),
                RuleType::UrlPattern => (&mut bundle.allow_url_patterns, &mut bundle.deny_url_patterns),
                RuleType::ProtocolRule => (&mut bundle.allow_protocol_rules, &mut bundle.deny_protocol_rules),
            };

            match rule.access_type {
                AccessType::Allow => allow_bucket.push(rule.pattern.clone()),
                AccessType::Deny => deny_bucket.push(rule.pattern.clone()),
            }
        }

        bundle
    }

    /// §4.5's matching algorithm. Unknown users (no rules at all) default to
    /// allow; once a user has rules, the first matching rule (in ascending
    /// `priority` order) decides, and no match denies.
    pub fn check_access(&self, user_id: &str, target: &str) -> AccessType {
        let rules = self.get_user(user_id);
        if rules.is_empty() {
            return AccessType::Allow;
        }

        for rule in rules.iter().filter(|r| r.is_active) {
            if rule_matches(rule, target) {
                return rule.access_type;
            }
        }

        AccessType::Deny
    }
}

fn rule_matches(rule: &AccessRule, target: &str) -> bool {
    match rule.rule_type {
        RuleType::Domain => domain_matches(&rule.pattern, target),
        RuleType::Ip => ip_matches(&rule.pattern, target),
        RuleType::IpRange => ip_range_matches(&rule.pattern, target),
        RuleType::UrlPattern => url_pattern_matches(&rule.pattern, target),
        RuleType::ProtocolRule => protocol_rule_matches(&rule.pattern, target),
    }
}

fn extract_host(target: &str) -> String {
    let without_scheme = target.split("://").nth(1).unwrap_or(target);
    let host_and_port = without_scheme.split(['/', '?', '#']).next().unwrap_or(without_scheme);
    host_and_port.split(':').next().unwrap_or(host_and_port).to_lowercase()
}

fn domain_matches(pattern: &str, target: &str) -> bool {
    let host = extract_host(target);
    let pattern = pattern.to_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{suffix}"))
    } else {
        host == pattern
    }
}

fn ip_matches(pattern: &str, target: &str) -> bool {
    let host = extract_host(target);
    match (pattern.parse::<IpAddr>(), host.parse::<IpAddr>()) {
        (Ok(p), Ok(t)) => p == t,
        _ => false,
    }
}

fn ip_range_matches(pattern: &str, target: &str) -> bool {
    let host = extract_host(target);
    let Ok(network) = pattern.parse::<IpNetwork>() else {
        return false;
    };
    let Ok(addr) = host.parse::<IpAddr>() else {
        return false;
    };
    network.contains(addr)
}

fn url_pattern_matches(pattern: &str, target: &str) -> bool {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .is_ok_and(|re| re.is_match(target))
}

/// `proto:src_ip:src_port->dst_ip:dst_port[:direction]`.
fn protocol_rule_matches(pattern: &str, target: &str) -> bool {
    let Some(parsed_pattern) = ProtocolSpec::parse(pattern) else {
        return false;
    };
    let Some(parsed_target) = ProtocolSpec::parse(target) else {
        return false;
    };

    parsed_pattern.proto.eq_ignore_ascii_case(&parsed_target.proto)
        && field_matches(&parsed_pattern.src_ip, &parsed_target.src_ip)
        && port_matches(&parsed_pattern.src_port, &parsed_target.src_port)
        && field_matches(&parsed_pattern.dst_ip, &parsed_target.dst_ip)
        && port_matches(&parsed_pattern.dst_port, &parsed_target.dst_port)
        && direction_matches(parsed_pattern.direction.as_deref(), parsed_target.direction.as_deref())
}

struct ProtocolSpec {
    proto: String,
    src_ip: String,
    src_port: String,
    dst_ip: String,
    dst_port: String,
    direction: Option<String>,
}

impl ProtocolSpec {
    fn parse(spec: &str) -> Option<Self> {
        let (proto, rest) = spec.split_once(':')?;
        let (src, rest) = rest.split_once("->")?;
        let (src_ip, src_port) = src.split_once(':')?;

        let mut dst_parts = rest.splitn(3, ':');
        let dst_ip = dst_parts.next()?;
        let dst_port = dst_parts.next()?;
        let direction = dst_parts.next().map(str::to_owned);

        Some(Self {
            proto: proto.to_owned(),
            src_ip: src_ip.to_owned(),
            src_port: src_port.to_owned(),
            dst_ip: dst_ip.to_owned(),
            dst_port: dst_port.to_owned(),
            direction,
        })
    }
}

fn field_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Ok(network) = pattern.parse::<IpNetwork>() {
        return value.parse::<IpAddr>().is_ok_and(|addr| network.contains(addr));
    }
    pattern == value
}

fn port_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let Ok(port) = value.parse::<u32>() else {
        return false;
    };

    if let Some((lo, hi)) = pattern.split_once('-') {
        return matches!((lo.parse::<u32>(), hi.parse::<u32>()), (Ok(lo), Ok(hi)) if (lo..=hi).contains(&port));
    }

    pattern.split(',').any(|p| p.trim().parse::<u32>() == Ok(port))
}

fn direction_matches(pattern: Option<&str>, value: Option<&str>) -> bool {
    match pattern {
        None => true,
        Some("both") => true,
        Some(p) => value.is_some_and(|v| v.eq_ignore_ascii_case(p)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(rule_type: RuleType, access_type: AccessType, pattern: &str, priority: i64) -> AccessRule {
        AccessRule {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            rule_type,
            access_type,
            pattern: pattern.into(),
            priority,
            is_active: true,
        }
    }

    #[test]
    fn unknown_user_defaults_to_allow() {
        let store = PolicyStore::new();
        assert_eq!(store.check_access("nobody", "example.com"), AccessType::Allow);
    }

    #[test]
    fn known_user_with_no_match_denies() {
        let store = PolicyStore::new();
        store.add(rule(RuleType::Domain, AccessType::Allow, "example.com", 10));
        assert_eq!(store.check_access("alice", "other.com"), AccessType::Deny);
    }

    #[test]
    fn wildcard_domain_matches_suffix_on_dot_boundary() {
        let store = PolicyStore::new();
        store.add(rule(RuleType::Domain, AccessType::Allow, "*.example.com", 10));
        assert_eq!(store.check_access("alice", "https://api.example.com/path"), AccessType::Allow);
        assert_eq!(store.check_access("alice", "evilexample.com"), AccessType::Deny);
    }

    #[test]
    fn priority_order_decides_first_match() {
        let store = PolicyStore::new();
        store.add(rule(RuleType::Domain, AccessType::Deny, "example.com", 5));
        store.add(rule(RuleType::Domain, AccessType::Allow, "example.com", 10));
        assert_eq!(store.check_access("alice", "example.com"), AccessType::Deny);
    }

    #[test]
    fn ip_range_rule_matches_cidr_membership() {
        let store = PolicyStore::new();
        store.add(rule(RuleType::IpRange, AccessType::Allow, "10.0.0.0/8", 10));
        assert_eq!(store.check_access("alice", "10.1.2.3"), AccessType::Allow);
        assert_eq!(store.check_access("alice", "11.1.2.3"), AccessType::Deny);
    }

    #[test]
    fn url_pattern_rule_is_case_insensitive_regex() {
        let store = PolicyStore::new();
        store.add(rule(RuleType::UrlPattern, AccessType::Deny, r"(?i)/admin/.*", 10));
        assert_eq!(store.check_access("alice", "https://host/ADMIN/panel"), AccessType::Deny);
    }

    #[test]
    fn protocol_rule_matches_cidr_and_port_range() {
        let store = PolicyStore::new();
        store.add(rule(
            RuleType::ProtocolRule,
            AccessType::Allow,
            "tcp:10.0.0.0/8:1024-65535->0.0.0.0/0:443:outbound",
            10,
        ));
        assert_eq!(
            store.check_access("alice", "tcp:10.1.1.1:50000->93.184.216.34:443:outbound"),
            AccessType::Allow
        );
    }

    #[test]
    fn export_user_buckets_rules_by_type_and_access() {
        let store = PolicyStore::new();
        store.add(rule(RuleType::Domain, AccessType::Allow, "example.com", 10));
        store.add(rule(RuleType::Domain, AccessType::Deny, "bad.com", 20));

        let bundle = store.export_user("alice");
        assert_eq!(bundle.allow_domains, vec!["example.com".to_string()]);
        assert_eq!(bundle.deny_domains, vec!["bad.com".to_string()]);
    }
}
