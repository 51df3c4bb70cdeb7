use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose;
use base64::Engine;
use ipnet::IpNet;
use tracing::warn;

use crate::config::LoginRule;
use crate::session::new_session_id;

/// Placeholder expanded with a fresh session token at resolution time.
const SESSION_ID_TOKEN: &str = "${SESSION_ID}";

/// Credentials injected into one upstream-bound connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    /// Render the `Proxy-Authorization` header value.
    pub fn basic_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(raw))
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    net: IpNet,
    username: String,
    password: String,
}

/// Ordered CIDR rules mapping client IPs to upstream credentials.
///
/// The rule set is replaced wholesale on configuration reload. Lookups clone
/// the current snapshot, so resolutions racing a reload see either the old
/// rules or the new ones, never a mix.
pub struct CredentialResolver {
    rules: RwLock<Arc<Vec<CompiledRule>>>,
}

impl CredentialResolver {
    pub fn new(rules: &[LoginRule]) -> Self {
        Self {
            rules: RwLock::new(Arc::new(compile(rules))),
        }
    }

    /// Swap in a new rule set.
    pub fn replace(&self, rules: &[LoginRule]) {
        *self.rules.write().unwrap() = Arc::new(compile(rules));
    }

    /// Resolve credentials for a client IP.
    ///
    /// Rules are evaluated in order; the first whose network contains `ip`
    /// wins, with `${SESSION_ID}` in its username template expanded to a
    /// fresh token. `None` means the caller omits proxy authentication.
    pub fn resolve(&self, ip: IpAddr) -> Option<Credential> {
        let rules = self.rules.read().unwrap().clone();
        for rule in rules.iter() {
            if rule.net.contains(&ip) {
                let username = rule.username.replace(SESSION_ID_TOKEN, &new_session_id());
                if username.is_empty() {
                    return None;
                }
                return Some(Credential {
                    username,
                    password: rule.password.clone(),
                });
            }
        }
        None
    }
}

fn compile(rules: &[LoginRule]) -> Vec<CompiledRule> {
    rules
        .iter()
        .filter_map(|rule| match rule.ip_range.parse::<IpNet>() {
            Ok(net) => Some(CompiledRule {
                net,
                username: rule.username.clone(),
                password: rule.password.clone(),
            }),
            Err(err) => {
                warn!(
                    "skipping login rule with bad ip_range {:?}: {}",
                    rule.ip_range, err
                );
                None
            }
        })
        .collect()
}
