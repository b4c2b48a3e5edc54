//! Outbound network policy model.
//!
//! Network specs are short tokens given on the command line or in config:
//! presets (`npm`, `github`, ...), literal domains, `*.example.com`
//! wildcards, and the special values `all` / `none`. Parsing never fails:
//! invalid wildcard patterns are dropped, and `all` / `none` win over
//! anything listed next to them. The resulting [`Policy`] drives the
//! iptables allowlist emitted into the guest init script.

use std::collections::HashSet;

use crate::errors::{FaizeError, FaizeResult};

/// Allow all outbound traffic.
pub const NETWORK_ALL: &str = "all";
/// Block all outbound traffic.
pub const NETWORK_NONE: &str = "none";

/// Fixed domain lists for well-known ecosystems.
pub fn preset_domains(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "npm" => Some(&["registry.npmjs.org", "npmjs.com"]),
        "pypi" => Some(&["pypi.org", "files.pythonhosted.org"]),
        "github" => Some(&["github.com", "api.github.com", "raw.githubusercontent.com"]),
        "anthropic" => Some(&["api.anthropic.com", "anthropic.com"]),
        "openai" => Some(&["api.openai.com", "openai.com"]),
        "bun" => Some(&["bun.sh", "registry.npmjs.org"]),
        _ => None,
    }
}

/// Outbound network permissions for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// No firewall: every destination is reachable.
    AllowAll,
    /// Loopback only; every outbound connection is dropped.
    BlockAll,
    /// Default-drop with accepts for the listed domains and wildcards.
    Allowlist {
        /// Literal domains, resolved to A records at guest boot.
        domains: Vec<String>,
        /// `*.base.domain` patterns, matched against the TLS SNI.
        wildcards: Vec<String>,
    },
}

impl Policy {
    /// Parse network specs into a policy.
    ///
    /// Tokens are trimmed and lowercased. `all` / `none` short-circuit
    /// regardless of position. Presets expand to their domain lists,
    /// `*.`-prefixed tokens go through wildcard validation (invalid ones
    /// are dropped, they do not become literal domains), and everything
    /// else is a literal domain. Empty input blocks all traffic.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Policy {
        if specs.is_empty() {
            return Policy::BlockAll;
        }

        // Special values take precedence over any co-listed entries.
        for spec in specs {
            let spec = spec.as_ref().trim().to_lowercase();
            if spec == NETWORK_ALL {
                return Policy::AllowAll;
            }
            if spec == NETWORK_NONE {
                return Policy::BlockAll;
            }
        }

        let mut domains = Vec::new();
        let mut wildcards = Vec::new();
        let mut seen_domains = HashSet::new();
        let mut seen_wildcards = HashSet::new();

        for spec in specs {
            let spec = spec.as_ref().trim().to_lowercase();

            if let Some(preset) = preset_domains(&spec) {
                for domain in preset {
                    if seen_domains.insert(domain.to_string()) {
                        domains.push(domain.to_string());
                    }
                }
            } else if is_wildcard(&spec) {
                match validate_wildcard(&spec) {
                    Ok(()) => {
                        if seen_wildcards.insert(spec.clone()) {
                            wildcards.push(spec);
                        }
                    }
                    Err(err) => {
                        tracing::debug!(pattern = %spec, %err, "dropping invalid wildcard");
                    }
                }
            } else if seen_domains.insert(spec.clone()) {
                domains.push(spec);
            }
        }

        Policy::Allowlist { domains, wildcards }
    }

    pub fn is_allow_all(&self) -> bool {
        matches!(self, Policy::AllowAll)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Policy::BlockAll)
    }
}

/// True if the token is a wildcard pattern (`*.example.com`).
pub fn is_wildcard(domain: &str) -> bool {
    domain.starts_with("*.")
}

/// Validate a wildcard pattern.
///
/// Valid: `*.example.com` (leading single-level wildcard).
/// Invalid: `*.com` (TLD-only), `**.example.com` (recursive),
/// `sub.*.example.com` (mid-level).
pub fn validate_wildcard(pattern: &str) -> FaizeResult<()> {
    if !is_wildcard(pattern) {
        return Err(FaizeError::NetworkSpec(format!(
            "not a wildcard pattern: {pattern}"
        )));
    }

    if pattern.contains("**") {
        return Err(FaizeError::NetworkSpec(format!(
            "recursive wildcards not supported: {pattern}"
        )));
    }

    let base = extract_base_domain(pattern);
    if base.contains('*') {
        return Err(FaizeError::NetworkSpec(format!(
            "mid-level wildcards not supported: {pattern}"
        )));
    }

    // Base domain must contain a dot, e.g. example.com. A bare "com" would
    // allowlist an entire TLD.
    if !base.contains('.') {
        return Err(FaizeError::NetworkSpec(format!(
            "TLD wildcards not allowed: {pattern}"
        )));
    }

    Ok(())
}

/// Strip the `*.` prefix: `*.example.com` -> `example.com`.
pub fn extract_base_domain(pattern: &str) -> &str {
    pattern.strip_prefix("*.").unwrap_or(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(domains: &[&str], wildcards: &[&str]) -> Policy {
        Policy::Allowlist {
            domains: domains.iter().map(|s| s.to_string()).collect(),
            wildcards: wildcards.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_empty_specs_block_all() {
        let specs: [&str; 0] = [];
        assert_eq!(Policy::parse(&specs), Policy::BlockAll);
    }

    #[test]
    fn test_all_allows_everything() {
        assert_eq!(Policy::parse(&["all"]), Policy::AllowAll);
    }

    #[test]
    fn test_none_blocks_network() {
        assert_eq!(Policy::parse(&["none"]), Policy::BlockAll);
    }

    #[test]
    fn test_special_values_override_other_specs() {
        assert_eq!(Policy::parse(&["npm", "all"]), Policy::AllowAll);
        assert_eq!(Policy::parse(&["npm", "none"]), Policy::BlockAll);
        assert_eq!(Policy::parse(&["*.example.com", "all"]), Policy::AllowAll);
        // "all" wins over "none" by first-match order.
        assert_eq!(Policy::parse(&["all", "none"]), Policy::AllowAll);
    }

    #[test]
    fn test_single_preset() {
        assert_eq!(
            Policy::parse(&["npm"]),
            allowlist(&["registry.npmjs.org", "npmjs.com"], &[])
        );
    }

    #[test]
    fn test_multiple_presets_preserve_order() {
        assert_eq!(
            Policy::parse(&["npm", "github"]),
            allowlist(
                &[
                    "registry.npmjs.org",
                    "npmjs.com",
                    "github.com",
                    "api.github.com",
                    "raw.githubusercontent.com"
                ],
                &[]
            )
        );
    }

    #[test]
    fn test_preset_with_literal_domain() {
        assert_eq!(
            Policy::parse(&["npm", "custom.example.com"]),
            allowlist(&["registry.npmjs.org", "npmjs.com", "custom.example.com"], &[])
        );
    }

    #[test]
    fn test_case_insensitive_and_trimmed() {
        assert_eq!(
            Policy::parse(&["NPM", " GitHub "]),
            Policy::parse(&["npm", "github"])
        );
    }

    #[test]
    fn test_duplicates_removed() {
        assert_eq!(Policy::parse(&["npm", "npm"]), Policy::parse(&["npm"]));
        assert_eq!(
            Policy::parse(&["*.example.com", "*.example.com"]),
            allowlist(&[], &["*.example.com"])
        );
    }

    #[test]
    fn test_parse_is_idempotent_under_self_concatenation() {
        let specs = ["npm", "*.example.com", "custom.org", "github"];
        let doubled: Vec<&str> = specs.iter().chain(specs.iter()).copied().collect();
        assert_eq!(Policy::parse(&specs), Policy::parse(&doubled));
    }

    #[test]
    fn test_mixed_domains_and_wildcards() {
        assert_eq!(
            Policy::parse(&["NPM", "*.example.com", "custom.org", "*.com"]),
            allowlist(
                &["registry.npmjs.org", "npmjs.com", "custom.org"],
                &["*.example.com"]
            )
        );
    }

    #[test]
    fn test_invalid_wildcards_are_dropped_not_demoted() {
        // "*.com" and "*." are wildcard-shaped but invalid: dropped, and
        // never demoted to literal domains. "**.x.com" and "a.*.b.com" do
        // not start with "*." at all, so they stay literal tokens.
        assert_eq!(
            Policy::parse(&["**.x.com", "a.*.b.com", "*.com", "*."]),
            allowlist(&["**.x.com", "a.*.b.com"], &[])
        );
    }

    #[test]
    fn test_validate_wildcard_boundaries() {
        assert!(validate_wildcard("*.example.com").is_ok());
        assert!(validate_wildcard("*.internal.company.com").is_ok());
        assert!(validate_wildcard("*.com").is_err());
        assert!(validate_wildcard("**.x.com").is_err());
        assert!(validate_wildcard("*.").is_err());
        assert!(validate_wildcard("*.a*.com").is_err());
        assert!(validate_wildcard("example.com").is_err());
    }

    #[test]
    fn test_accepted_wildcards_have_dotted_base() {
        let policy = Policy::parse(&["*.example.com", "*.deep.example.org"]);
        let Policy::Allowlist { wildcards, .. } = policy else {
            panic!("expected allowlist");
        };
        for w in &wildcards {
            assert!(is_wildcard(w));
            assert!(extract_base_domain(w).contains('.'));
        }
    }

    #[test]
    fn test_extract_base_domain() {
        assert_eq!(extract_base_domain("*.example.com"), "example.com");
        assert_eq!(extract_base_domain("example.com"), "example.com");
    }

    #[test]
    fn test_empty_allowlist_from_only_invalid_tokens() {
        // All tokens rejected: still an allowlist (default-drop), not block-all.
        assert_eq!(Policy::parse(&["*.com"]), allowlist(&[], &[]));
    }
}
