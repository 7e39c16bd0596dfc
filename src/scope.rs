//! Scope Catalogue (§4.A): maps `(method, path)` to a required-scope set via
//! an ordered, first-match rule list. Grounded on the teacher's pattern of
//! holding ordered, regex-driven rule tables behind a `RwLock` (see
//! `AuthenticationManager`'s provider registry in `security/auth.rs`) rather
//! than a match statement, since the rule set is populated at startup and
//! can still grow at runtime.

use std::sync::RwLock;

use regex::Regex;

/// One entry in the catalogue. `matcher` is an anchored regular expression
/// over the normalized request path; `method` is optional (absent = matches
/// any verb).
pub struct ScopeRule {
    pub matcher: Regex,
    pub method: Option<String>,
    pub scopes: Vec<String>,
    pub description: Option<String>,
}

impl ScopeRule {
    pub fn new(pattern: &str, method: Option<&str>, scopes: &[&str]) -> Self {
        Self {
            matcher: Regex::new(pattern).expect("scope rule pattern must compile"),
            method: method.map(|m| m.to_uppercase()),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// The resolved requirement for a route: scopes plus the `"all"` evaluation
/// mode spec.md §3 names (there is currently exactly one mode — kept as an
/// explicit field rather than implied, so a future `"any"` mode doesn't
/// require changing every call site).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRequirement {
    pub scopes: Vec<String>,
    pub mode: RequirementMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementMode {
    All,
}

impl ScopeRequirement {
    fn new(scopes: Vec<String>) -> Self {
        Self {
            scopes,
            mode: RequirementMode::All,
        }
    }
}

/// `true` iff every scope in `required` is present in `granted`, or
/// `granted` holds the `admin` wildcard (§8 testable property).
pub fn scopes_satisfy_requirement(granted: &[String], required: &[String]) -> bool {
    if granted.iter().any(|s| s == "admin") {
        return true;
    }
    required.iter().all(|r| granted.iter().any(|g| g == r))
}

pub struct ScopeCatalogue {
    rules: RwLock<Vec<ScopeRule>>,
}

impl ScopeCatalogue {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// The catalogue pre-populated with the default rules spec.md §4.A
    /// names: restore workflows, approval, generic admin, history, graph
    /// read, code analyze/write, and the refresh endpoint.
    pub fn with_defaults() -> Self {
        let catalogue = Self::new();
        catalogue.register_rules(vec![
            // The approval rule must precede the general restore rule: its
            // pattern is a strict subset of the restore pattern below, and
            // first-match-wins would otherwise always resolve it to the
            // broader {admin, admin:restore} requirement.
            ScopeRule::new(
                r"^/api/v1/admin/restore/approve$",
                None,
                &["admin:restore:approve"],
            )
            .with_description("restore approval"),
            ScopeRule::new(
                r"^/api/v1/admin/restore(/.*)?$",
                None,
                &["admin", "admin:restore"],
            )
            .with_description("restore workflows"),
            ScopeRule::new(r"^/api/v1/admin(/.*)?$", None, &["admin"])
                .with_description("generic admin"),
            ScopeRule::new(r"^/mcp/history$", None, &["admin"]).with_description("history"),
            ScopeRule::new(
                r"^/api/v1/graph(/.*)?$",
                Some("GET"),
                &["graph:read"],
            )
            .with_description("graph read"),
            ScopeRule::new(
                r"^/api/v1/code/analyze(/.*)?$",
                Some("GET"),
                &["code:analyze"],
            )
            .with_description("code analyze"),
            ScopeRule::new(
                r"^/api/v1/code(/.*)?$",
                None,
                &["code:analyze", "code:write"],
            )
            .with_description("code analyze/write"),
            ScopeRule::new(
                r"^/api/v1/auth/refresh$",
                Some("POST"),
                &["session:refresh"],
            )
            .with_description("refresh endpoint"),
        ]);
        catalogue
    }

    pub fn register_rule(&self, rule: ScopeRule) {
        self.rules.write().unwrap().push(rule);
    }

    pub fn register_rules(&self, rules: Vec<ScopeRule>) {
        self.rules.write().unwrap().extend(rules);
    }

    pub fn list_rules(&self) -> Vec<(String, Option<String>, Vec<String>)> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .map(|r| {
                (
                    r.matcher.as_str().to_string(),
                    r.method.clone(),
                    r.scopes.clone(),
                )
            })
            .collect()
    }

    /// Resolve the requirement for `(method, path)`, normalizing the path by
    /// stripping a query string and uppercasing the method, then returning
    /// the first rule in insertion order whose method is absent or matches
    /// and whose matcher matches the path.
    pub fn resolve_requirement(&self, method: &str, path: &str) -> Option<ScopeRequirement> {
        let normalized_path = path.split('?').next().unwrap_or(path);
        let normalized_method = method.to_uppercase();

        let rules = self.rules.read().unwrap();
        for rule in rules.iter() {
            let method_matches = rule
                .method
                .as_ref()
                .map(|m| *m == normalized_method)
                .unwrap_or(true);
            if method_matches && rule.matcher.is_match(normalized_path) {
                return Some(ScopeRequirement::new(rule.scopes.clone()));
            }
        }
        None
    }
}

impl Default for ScopeCatalogue {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins_in_insertion_order() {
        let catalogue = ScopeCatalogue::new();
        catalogue.register_rule(ScopeRule::new(r"^/api/v1/.*$", None, &["first"]));
        catalogue.register_rule(ScopeRule::new(r"^/api/v1/admin$", None, &["second"]));

        let requirement = catalogue
            .resolve_requirement("GET", "/api/v1/admin")
            .unwrap();
        assert_eq!(requirement.scopes, vec!["first".to_string()]);
    }

    #[test]
    fn query_string_is_stripped_before_matching() {
        let catalogue = ScopeCatalogue::with_defaults();
        let requirement = catalogue
            .resolve_requirement("GET", "/api/v1/graph/search?q=hello")
            .unwrap();
        assert_eq!(requirement.scopes, vec!["graph:read".to_string()]);
    }

    #[test]
    fn restore_approval_path_gets_its_own_narrower_scope() {
        let catalogue = ScopeCatalogue::with_defaults();
        let requirement = catalogue
            .resolve_requirement("POST", "/api/v1/admin/restore/approve")
            .unwrap();
        assert_eq!(requirement.scopes, vec!["admin:restore:approve".to_string()]);

        let restore_requirement = catalogue
            .resolve_requirement("POST", "/api/v1/admin/restore/job-1")
            .unwrap();
        assert_eq!(
            restore_requirement.scopes,
            vec!["admin".to_string(), "admin:restore".to_string()]
        );
    }

    #[test]
    fn unmatched_route_has_no_requirement() {
        let catalogue = ScopeCatalogue::with_defaults();
        assert!(catalogue
            .resolve_requirement("GET", "/totally/unrelated")
            .is_none());
    }

    #[test]
    fn admin_wildcard_satisfies_any_requirement() {
        let granted = vec!["admin".to_string()];
        let required = vec!["graph:read".to_string(), "code:write".to_string()];
        assert!(scopes_satisfy_requirement(&granted, &required));
    }

    #[test]
    fn missing_required_scope_fails() {
        let granted = vec!["graph:read".to_string()];
        let required = vec!["graph:read".to_string(), "code:write".to_string()];
        assert!(!scopes_satisfy_requirement(&granted, &required));
    }
}
