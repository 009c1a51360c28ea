//! Claim names, claim lookup and claim-list configuration.
//!
//! Claim paths are slash-delimited and may index arrays: `additional_data/group_name`,
//! `groups[0]`, `ref/protected[1]/name`. A top-level key that literally contains a
//! slash (`"namespaced/inline"`) wins over the nested walk.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use super::restrictions::ResourceRestriction;
use crate::{Error, Result};

/// Standard claims that may not be enforced, aliased or used as restrictions.
pub const CLAIMS_DENY_LIST: [&str; 6] = ["iss", "exp", "nbf", "iat", "jti", "aud"];

/// Separator between list entries in `enforced-claims` and `claim-aliases`.
pub const LIST_DELIMITER: char = ',';

/// Separator between alias and claim in a `claim-aliases` entry.
pub const TUPLE_DELIMITER: char = ':';

/// Separator between nested claim segments.
pub const PATH_DELIMITER: char = '/';

fn single_claim_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z|$_][a-zA-Z|$_0-9.]*$").expect("static regex"))
}

fn nested_claim_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let segment = r"[a-zA-Z|$_][a-zA-Z|$_0-9.]*(\[\d+\])*";
        Regex::new(&format!(r"^{segment}(/{segment})*$")).expect("static regex")
    })
}

/// Whether `name` is a single claim name (no nesting, no index).
pub fn is_single_claim_name(name: &str) -> bool {
    single_claim_re().is_match(name)
}

/// A validated, possibly nested claim path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimPath(String);

impl ClaimPath {
    /// Validate a claim path.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidClaimName`] when the path does not match the claim grammar.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if nested_claim_re().is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::InvalidClaimName(raw.to_string()))
        }
    }

    /// The path as written.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is one of the deny-listed standard claims.
    pub fn is_denied(&self) -> bool {
        CLAIMS_DENY_LIST.contains(&self.0.as_str())
    }
}

impl fmt::Display for ClaimPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── DecodedToken ──────────────────────────────────────────────────────────

/// Claim set of a token whose signature has been verified.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    claims: Map<String, Value>,
}

impl DecodedToken {
    /// Wrap claims. Only the verifier constructs these.
    pub(crate) fn from_verified(claims: Map<String, Value>) -> Self {
        Self { claims }
    }

    /// All claims.
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// Look up a claim path. A literal top-level key wins over the nested walk.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.claims.get(path) {
            return Some(value);
        }
        if !path.contains(PATH_DELIMITER) && !path.contains('[') {
            return None;
        }

        let mut segments = path.split(PATH_DELIMITER);
        let first = segments.next()?;
        let (name, indices) = split_indices(first)?;
        let mut current = index_into(self.claims.get(name)?, &indices)?;

        for segment in segments {
            let (name, indices) = split_indices(segment)?;
            current = index_into(current.as_object()?.get(name)?, &indices)?;
        }
        Some(current)
    }

    /// Look up a claim path and render a scalar value as a string. `null`
    /// counts as absent; objects and arrays render as JSON.
    pub fn lookup_string(&self, path: &str) -> Option<String> {
        match self.lookup(path)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }
}

/// `groups[0][1]` → (`groups`, [0, 1]).
fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let name = &segment[..open];
    let mut indices = Vec::new();
    let mut rest = &segment[open..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped.find(']')?;
        indices.push(stripped[..close].parse().ok()?);
        rest = &stripped[close + 1..];
    }
    rest.is_empty().then_some((name, indices))
}

fn index_into<'a>(mut value: &'a Value, indices: &[usize]) -> Option<&'a Value> {
    for &i in indices {
        value = value.as_array()?.get(i)?;
    }
    Some(value)
}

// ── Enforced claims ───────────────────────────────────────────────────────

/// Parse the `enforced-claims` variable: comma-separated claim paths.
///
/// # Errors
///
/// [`Error::InvalidEnforcedClaimsFormat`] for empty segments, invalid names or
/// duplicates; [`Error::ClaimInDenyList`] for standard claims.
pub fn parse_enforced_claims(value: &str) -> Result<Vec<ClaimPath>> {
    let mut claims: Vec<ClaimPath> = Vec::new();
    for entry in value.split(LIST_DELIMITER).map(str::trim) {
        if entry.is_empty() {
            return Err(Error::InvalidEnforcedClaimsFormat(value.to_string()));
        }
        let claim =
            ClaimPath::parse(entry).map_err(|_| Error::InvalidEnforcedClaimsFormat(value.to_string()))?;
        if claim.is_denied() {
            return Err(Error::ClaimInDenyList(claim.0));
        }
        if claims.contains(&claim) {
            return Err(Error::InvalidEnforcedClaimsFormat(value.to_string()));
        }
        claims.push(claim);
    }
    debug!(count = claims.len(), "Parsed enforced claims");
    Ok(claims)
}

// ── Claim aliases ─────────────────────────────────────────────────────────

/// Operator-declared mapping from a restriction (annotation) name to the token
/// claim it reads.
///
/// Resolution is a single substitution: an alias target is never aliased again,
/// so cycles such as `a:b,b:a` are harmless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimAliasMap {
    aliases: BTreeMap<String, ClaimPath>,
}

impl ClaimAliasMap {
    /// Parse the `claim-aliases` variable: comma-separated `alias:claim` tuples.
    ///
    /// # Errors
    ///
    /// [`Error::MappedClaimsBlankOrEmpty`] for empty entries,
    /// [`Error::InvalidClaimAliasFormat`] for entries that are not one `alias:claim`
    /// pair, [`Error::InvalidClaimName`] for names outside the claim grammar,
    /// [`Error::ClaimInDenyList`] for standard claims and
    /// [`Error::DuplicateClaimAlias`] for repeated aliases.
    pub fn parse(value: &str) -> Result<Self> {
        let mut aliases = BTreeMap::new();
        for entry in value.split(LIST_DELIMITER).map(str::trim) {
            if entry.is_empty() {
                return Err(Error::MappedClaimsBlankOrEmpty(value.to_string()));
            }

            let mut parts = entry.split(TUPLE_DELIMITER).map(str::trim);
            let (Some(alias), Some(claim), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(Error::InvalidClaimAliasFormat(entry.to_string()));
            };
            if alias.is_empty() || claim.is_empty() {
                return Err(Error::InvalidClaimAliasFormat(entry.to_string()));
            }

            if !is_single_claim_name(alias) {
                return Err(Error::InvalidClaimName(alias.to_string()));
            }
            let claim = ClaimPath::parse(claim)?;
            if CLAIMS_DENY_LIST.contains(&alias) {
                return Err(Error::ClaimInDenyList(alias.to_string()));
            }
            if claim.is_denied() {
                return Err(Error::ClaimInDenyList(claim.0));
            }

            if aliases.insert(alias.to_string(), claim).is_some() {
                return Err(Error::DuplicateClaimAlias(alias.to_string()));
            }
        }
        Ok(Self { aliases })
    }

    /// Fixed mapping built in code. Entries are trusted and not validated.
    pub(crate) fn from_pairs<const N: usize>(pairs: [(&str, &str); N]) -> Self {
        Self {
            aliases: pairs
                .into_iter()
                .map(|(alias, claim)| (alias.to_string(), ClaimPath(claim.to_string())))
                .collect(),
        }
    }

    /// Claim read for restriction `name`, and the alias used if any.
    pub fn resolve<'a>(&'a self, name: &'a str) -> (&'a str, Option<&'a str>) {
        match self.aliases.get(name) {
            Some(claim) => (claim.as_str(), Some(name)),
            None => (name, None),
        }
    }

    /// Whether no aliases are declared.
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Alias → claim pairs in alias order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases.iter().map(|(a, c)| (a.as_str(), c.as_str()))
    }
}

// ── ClaimsValidator ───────────────────────────────────────────────────────

/// Claim checks applied after signature verification: the standard claims the
/// signature library does not cover (`iat`, `iss`, `aud`), and the operator's
/// enforced claims.
#[derive(Debug, Clone, Default)]
pub struct ClaimsValidator {
    /// Expected `iss`, checked when the token carries one.
    pub issuer: Option<String>,
    /// Required audience. When set, `aud` is mandatory.
    pub audience: Option<String>,
    /// Claims every role must restrict on.
    pub enforced: Vec<ClaimPath>,
    /// Restriction name → claim mapping.
    pub aliases: ClaimAliasMap,
    /// Tolerated clock skew.
    pub leeway: Duration,
}

impl ClaimsValidator {
    /// Check `iat`, `iss` and `aud`.
    pub fn validate_standard(&self, token: &DecodedToken) -> Result<()> {
        if let Some(iat) = token.claims().get("iat") {
            let iat = iat
                .as_u64()
                .ok_or_else(|| Error::MalformedToken("'iat' is not a timestamp".to_string()))?;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs();
            if iat > now + self.leeway.as_secs() {
                return Err(Error::TokenIssuedInFuture);
            }
        }

        if let (Some(expected), Some(actual)) = (&self.issuer, token.claims().get("iss")) {
            let actual = actual.as_str().unwrap_or_default();
            if actual != expected {
                return Err(Error::InvalidIssuer {
                    expected: expected.clone(),
                    actual: actual.to_string(),
                });
            }
        }

        if let Some(expected) = &self.audience {
            let aud = token
                .claims()
                .get("aud")
                .ok_or_else(|| Error::MissingMandatoryClaim("aud".to_string()))?;
            if !audience_contains(aud, expected) {
                return Err(Error::InvalidAudience(expected.clone()));
            }
        }
        Ok(())
    }

    /// Every enforced claim must be covered by a restriction once aliases are
    /// applied.
    pub fn validate_enforced(&self, restrictions: &[ResourceRestriction]) -> Result<()> {
        for claim in &self.enforced {
            let covered = restrictions
                .iter()
                .any(|r| self.aliases.resolve(r.name()).0 == claim.as_str());
            if !covered {
                return Err(Error::RoleMissingConstraint(claim.to_string()));
            }
        }
        Ok(())
    }
}

/// Whether an `aud` claim (string or array) contains `expected`.
fn audience_contains(aud: &Value, expected: &str) -> bool {
    match aud {
        Value::String(s) => s == expected,
        Value::Array(arr) => arr.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    }
}
