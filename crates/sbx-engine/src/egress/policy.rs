//! Egress policy evaluation: ordered domain and CIDR rules with a default
//! action. Domain rules only ever see domains, CIDR rules only ever see IPs.

use std::net::IpAddr;

use ipnet::IpNet;

use sbx_types::{EgressAction, EgressPolicy, EgressRule, Error, Result};

#[derive(Debug, Clone)]
enum RuleKind {
    Domain(String),
    Cidr(IpNet),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    kind: RuleKind,
    action: EgressAction,
}

/// A validated, order-preserving compilation of an [`EgressPolicy`].
#[derive(Debug, Clone)]
pub struct PolicyMatcher {
    default_action: EgressAction,
    rules: Vec<CompiledRule>,
}

impl PolicyMatcher {
    /// Compiles a policy, rejecting rules that carry neither or both of
    /// `domain`/`cidr`, and CIDR strings that do not parse.
    pub fn compile(policy: &EgressPolicy) -> Result<Self> {
        let mut rules = Vec::with_capacity(policy.rules.len());
        for rule in &policy.rules {
            rules.push(compile_rule(rule)?);
        }
        Ok(Self {
            default_action: policy.default,
            rules,
        })
    }

    /// First matching domain rule wins; CIDR rules are skipped. Falls back
    /// to the policy default.
    pub fn match_domain(&self, domain: &str) -> EgressAction {
        let needle = normalize_domain(domain);
        for rule in &self.rules {
            let RuleKind::Domain(pattern) = &rule.kind else {
                continue;
            };
            if domain_matches(pattern, &needle) {
                return rule.action;
            }
        }
        self.default_action
    }

    /// First matching CIDR rule wins; domain rules are skipped. Falls back
    /// to the policy default.
    pub fn match_ip(&self, ip: IpAddr) -> EgressAction {
        for rule in &self.rules {
            let RuleKind::Cidr(net) = &rule.kind else {
                continue;
            };
            if net.contains(&ip) {
                return rule.action;
            }
        }
        self.default_action
    }
}

fn compile_rule(rule: &EgressRule) -> Result<CompiledRule> {
    let kind = match (&rule.domain, &rule.cidr) {
        (Some(domain), None) => RuleKind::Domain(normalize_domain(domain)),
        (None, Some(cidr)) => RuleKind::Cidr(
            cidr.parse()
                .map_err(|_| Error::NotValid(format!("invalid cidr {cidr:?}")))?,
        ),
        (Some(_), Some(_)) => {
            return Err(Error::NotValid(
                "egress rule must set exactly one of domain/cidr, got both".into(),
            ))
        }
        (None, None) => {
            return Err(Error::NotValid(
                "egress rule must set exactly one of domain/cidr, got neither".into(),
            ))
        }
    };
    Ok(CompiledRule {
        kind,
        action: rule.action,
    })
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// `*.suffix` matches strict subdomains of `suffix`, never the bare suffix;
/// anything else matches exactly.
fn domain_matches(pattern: &str, domain: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        domain
            .strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('.'))
    } else {
        pattern == domain
    }
}
