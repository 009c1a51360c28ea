//! Resource restrictions: annotation-derived claim constraints on a role.
//!
//! A host annotated `authn-jwt/gitlab/project_path: group/app` may only
//! authenticate through `authn-jwt/gitlab` with a token whose `project_path`
//! claim equals `group/app`. Annotations written `authn-jwt/<name>` apply to
//! every service of the type; a service-specific annotation of the same name
//! overrides them.

use std::collections::BTreeMap;

use authn_types::{ResourceId, Webservice};
use tracing::debug;

use super::claims::{CLAIMS_DENY_LIST, ClaimAliasMap, DecodedToken, PATH_DELIMITER};
use crate::policy::PolicyStore;
use crate::{Error, Result};

/// One required claim value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRestriction {
    name: String,
    value: String,
}

impl ResourceRestriction {
    /// Build a restriction.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Restriction name as annotated (before alias resolution).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expected claim value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Read the restrictions annotated on `role` for `webservice`, in name order.
///
/// `siblings` are the service ids of other webservices of the same type. A
/// general annotation whose first segment is a sibling belongs to that sibling
/// and is skipped.
///
/// # Errors
///
/// [`Error::RoleNotFound`] when the role has no resource.
pub async fn extract_restrictions(
    store: &dyn PolicyStore,
    webservice: &Webservice,
    role: &ResourceId,
    siblings: &[String],
) -> Result<Vec<ResourceRestriction>> {
    let annotations = store
        .annotations(role)
        .await?
        .ok_or_else(|| Error::RoleNotFound(role.to_string()))?;

    let general_prefix = format!("{}/", webservice.authenticator());
    let specific_prefix = format!("{}{}/", general_prefix, webservice.service_id().unwrap_or_default());

    let mut general = BTreeMap::new();
    let mut specific = BTreeMap::new();
    for (key, value) in annotations {
        if let Some(name) = key.strip_prefix(&specific_prefix) {
            specific.insert(name.to_string(), value);
        } else if let Some(name) = key.strip_prefix(&general_prefix) {
            let first = name.split(PATH_DELIMITER).next().unwrap_or_default();
            if name.contains(PATH_DELIMITER) && siblings.iter().any(|s| s == first) {
                continue;
            }
            general.insert(name.to_string(), value);
        }
    }
    general.extend(specific);

    debug!(
        role = %role,
        webservice = %webservice,
        count = general.len(),
        "Extracted resource restrictions"
    );
    Ok(general
        .into_iter()
        .map(|(name, value)| ResourceRestriction::new(name, value))
        .collect())
}

/// Reject restrictions that target deny-listed standard claims.
///
/// # Errors
///
/// [`Error::RestrictionOnDeniedClaim`] naming the offending restriction.
pub fn validate_restriction_names(
    restrictions: &[ResourceRestriction],
    aliases: &ClaimAliasMap,
) -> Result<()> {
    for restriction in restrictions {
        let (claim, _) = aliases.resolve(restriction.name());
        if CLAIMS_DENY_LIST.contains(&claim) {
            return Err(Error::RestrictionOnDeniedClaim(restriction.name().to_string()));
        }
    }
    Ok(())
}

/// Result of checking every restriction against a token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionReport {
    /// Names of restrictions whose value did not match, in evaluation order.
    pub unsatisfied: Vec<String>,
}

impl RestrictionReport {
    /// Whether every restriction matched.
    pub fn is_satisfied(&self) -> bool {
        self.unsatisfied.is_empty()
    }
}

/// Checks restrictions against a decoded token.
pub trait RestrictionMatcher: Send + Sync {
    /// Check every restriction. A mismatch is reported, not raised; a blank
    /// value or a missing claim is an error.
    fn evaluate(
        &self,
        restrictions: &[ResourceRestriction],
        token: &DecodedToken,
        aliases: &ClaimAliasMap,
    ) -> Result<RestrictionReport>;

    /// Whether every restriction matched.
    fn all_restrictions_satisfied(
        &self,
        restrictions: &[ResourceRestriction],
        token: &DecodedToken,
        aliases: &ClaimAliasMap,
    ) -> Result<bool> {
        self.evaluate(restrictions, token, aliases)
            .map(|report| report.is_satisfied())
    }
}

/// Exact-match matcher: each restriction equals one claim.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaimRestrictionMatcher;

impl ClaimRestrictionMatcher {
    /// Check one restriction.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyAnnotationGiven`] for a blank value and
    /// [`Error::JwtTokenClaimIsMissing`] when the claim is absent or blank.
    pub fn matches(
        restriction: &ResourceRestriction,
        token: &DecodedToken,
        aliases: &ClaimAliasMap,
    ) -> Result<bool> {
        if restriction.value().trim().is_empty() {
            return Err(Error::EmptyAnnotationGiven(restriction.name().to_string()));
        }

        let (claim, alias) = aliases.resolve(restriction.name());
        let actual = token
            .lookup_string(claim)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                Error::JwtTokenClaimIsMissing(match alias {
                    Some(annotation) => format!("'{claim} (annotation: {annotation})'"),
                    None => format!("'{claim}'"),
                })
            })?;

        let matched = actual == restriction.value();
        debug!(restriction = %restriction.name(), claim, matched, "Checked resource restriction");
        Ok(matched)
    }
}

impl RestrictionMatcher for ClaimRestrictionMatcher {
    fn evaluate(
        &self,
        restrictions: &[ResourceRestriction],
        token: &DecodedToken,
        aliases: &ClaimAliasMap,
    ) -> Result<RestrictionReport> {
        let mut report = RestrictionReport::default();
        for restriction in restrictions {
            if !Self::matches(restriction, token, aliases)? {
                report.unsatisfied.push(restriction.name().to_string());
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::InMemoryPolicyStore;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    fn token(value: Value) -> DecodedToken {
        let Value::Object(map) = value else { panic!("object expected") };
        DecodedToken::from_verified(map)
    }

    fn check(name: &str, value: &str, t: &DecodedToken, aliases: &ClaimAliasMap) -> Result<bool> {
        ClaimRestrictionMatcher.all_restrictions_satisfied(
            &[ResourceRestriction::new(name, value)],
            t,
            aliases,
        )
    }

    #[test]
    fn nested_restriction_matches_nested_claim() {
        // GIVEN: a nested restriction and a matching token
        let aliases = ClaimAliasMap::default();
        let matching = token(json!({"additional_data": {"group_name": "mygroup"}}));
        let other = token(json!({"additional_data": {"group_name": "othergroup"}}));
        let absent = token(json!({"additional_data": {}}));

        // THEN: match, mismatch, and missing claim
        assert!(check("additional_data/group_name", "mygroup", &matching, &aliases).unwrap());
        assert!(!check("additional_data/group_name", "mygroup", &other, &aliases).unwrap());
        let err = check("additional_data/group_name", "mygroup", &absent, &aliases).unwrap_err();
        assert!(matches!(err, Error::JwtTokenClaimIsMissing(ref c) if c.contains("additional_data/group_name")));
    }

    #[test]
    fn blank_restriction_value_always_errors() {
        // GIVEN: a token that does contain the claim
        let t = token(json!({"sub": ""}));
        let aliases = ClaimAliasMap::default();

        // THEN: empty and whitespace values raise regardless of token content
        assert!(matches!(check("sub", "", &t, &aliases), Err(Error::EmptyAnnotationGiven(_))));
        assert!(matches!(check("sub", "   ", &t, &aliases), Err(Error::EmptyAnnotationGiven(_))));
        assert!(matches!(
            check("missing", " ", &t, &aliases),
            Err(Error::EmptyAnnotationGiven(_))
        ));
    }

    #[test]
    fn alias_is_applied_before_lookup() {
        let t = token(json!({"project_path": "group/app"}));
        let aliases = ClaimAliasMap::parse("project:project_path").unwrap();
        assert!(check("project", "group/app", &t, &aliases).unwrap());
    }

    #[test]
    fn missing_aliased_claim_names_the_annotation() {
        // GIVEN: an alias pointing at a claim the token lacks
        let t = token(json!({"sub": "x"}));
        let aliases = ClaimAliasMap::parse("machine_name:not_existing").unwrap();

        // WHEN
        let err = check("machine_name", "x", &t, &aliases).unwrap_err();

        // THEN
        assert_eq!(
            err.to_string(),
            "Claim 'not_existing (annotation: machine_name)' is missing from JWT token"
        );
    }

    #[test]
    fn alias_target_is_not_realiased() {
        // GIVEN: restriction "a", aliases a -> b and b -> c, token has both b and c
        let t = token(json!({"b": "from-b", "c": "from-c"}));
        let aliases = ClaimAliasMap::parse("a:b,b:c").unwrap();

        // THEN: "a" reads claim b, never c
        assert!(check("a", "from-b", &t, &aliases).unwrap());
        assert!(!check("a", "from-c", &t, &aliases).unwrap());
    }

    #[test]
    fn literal_slash_claim_takes_precedence() {
        let t = token(json!({"namespaced/inline": "yes", "namespaced": {"inline": "no"}}));
        assert!(check("namespaced/inline", "yes", &t, &ClaimAliasMap::default()).unwrap());
    }

    #[test]
    fn mismatch_does_not_skip_later_presence_checks() {
        // GIVEN: first restriction mismatches, second names a missing claim
        let t = token(json!({"a": "wrong"}));
        let restrictions = vec![
            ResourceRestriction::new("a", "right"),
            ResourceRestriction::new("b", "anything"),
        ];

        // THEN: the missing claim still raises
        let result = ClaimRestrictionMatcher.evaluate(&restrictions, &t, &ClaimAliasMap::default());
        assert!(matches!(result, Err(Error::JwtTokenClaimIsMissing(_))));
    }

    #[test]
    fn report_lists_every_mismatch() {
        let t = token(json!({"a": "1", "b": "2", "c": "3"}));
        let restrictions = vec![
            ResourceRestriction::new("a", "x"),
            ResourceRestriction::new("b", "2"),
            ResourceRestriction::new("c", "y"),
        ];
        let report = ClaimRestrictionMatcher
            .evaluate(&restrictions, &t, &ClaimAliasMap::default())
            .unwrap();
        assert_eq!(report.unsatisfied, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn denied_claims_cannot_be_restricted() {
        let restrictions = vec![ResourceRestriction::new("expiry", "1")];
        let aliases = ClaimAliasMap::default();
        assert!(validate_restriction_names(&restrictions, &aliases).is_ok());
        assert!(matches!(
            validate_restriction_names(&[ResourceRestriction::new("iss", "x")], &aliases),
            Err(Error::RestrictionOnDeniedClaim(_))
        ));
    }

    #[tokio::test]
    async fn specific_annotations_override_general_ones() {
        // GIVEN: a host with general, specific, sibling and foreign annotations
        let store = InMemoryPolicyStore::new();
        let role = ResourceId::new("acme", "host", "ci");
        store.add_role(
            role.clone(),
            BTreeMap::from([
                ("authn-jwt/ref".to_string(), "general".to_string()),
                ("authn-jwt/gitlab/ref".to_string(), "specific".to_string()),
                ("authn-jwt/project".to_string(), "infra".to_string()),
                ("authn-jwt/github/ref".to_string(), "sibling".to_string()),
                ("authn-oidc/gitlab/ref".to_string(), "foreign".to_string()),
                ("description".to_string(), "ci runner".to_string()),
            ]),
        );
        let ws = Webservice::parse("acme", "authn-jwt/gitlab").unwrap();

        // WHEN
        let restrictions =
            extract_restrictions(&store, &ws, &role, &["gitlab".to_string(), "github".to_string()])
                .await
                .unwrap();

        // THEN: sorted, specific wins, sibling and foreign ignored
        assert_eq!(
            restrictions,
            vec![
                ResourceRestriction::new("project", "infra"),
                ResourceRestriction::new("ref", "specific"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_role_is_reported() {
        let store = InMemoryPolicyStore::new();
        let ws = Webservice::parse("acme", "authn-jwt/gitlab").unwrap();
        let role = ResourceId::new("acme", "host", "ghost");
        assert!(matches!(
            extract_restrictions(&store, &ws, &role, &[]).await,
            Err(Error::RoleNotFound(_))
        ));
    }
}
