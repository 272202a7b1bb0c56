//! Cache Groups and Policy Resolution
//!
//! A group is a named policy bucket: TTL, tier selection, compression, warm
//! flag and invalidation tags. The [`GroupRegistry`] is frozen once built;
//! lookups of unknown groups fall back to [`CacheGroupPolicy::default`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::parse_duration;
use crate::error::{Error, Result};

// =============================================================================
// Tiers
// =============================================================================

/// Storage tier, ordered fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Process-local memory
    Local,
    /// Persistence-backed store
    Durable,
    /// Optional cross-process store
    Shared,
}

impl CacheTier {
    /// All tiers in lookup order
    pub const ALL: [CacheTier; 3] = [CacheTier::Local, CacheTier::Durable, CacheTier::Shared];

    /// Lowercase name used in logs and config
    pub fn name(&self) -> &'static str {
        match self {
            CacheTier::Local => "local",
            CacheTier::Durable => "durable",
            CacheTier::Shared => "shared",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CacheTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" | "memory" => Ok(CacheTier::Local),
            "durable" => Ok(CacheTier::Durable),
            "shared" => Ok(CacheTier::Shared),
            other => Err(Error::Config(format!("unknown cache tier: {}", other))),
        }
    }
}

/// Set of enabled tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TierSet {
    local: bool,
    durable: bool,
    shared: bool,
}

impl TierSet {
    /// Every tier
    pub const fn all() -> Self {
        Self {
            local: true,
            durable: true,
            shared: true,
        }
    }

    /// No tier
    pub const fn none() -> Self {
        Self {
            local: false,
            durable: false,
            shared: false,
        }
    }

    /// Set containing exactly `tiers`
    pub fn of(tiers: &[CacheTier]) -> Self {
        tiers.iter().fold(Self::none(), |set, tier| set.with(*tier))
    }

    /// Copy of the set with `tier` enabled
    pub fn with(mut self, tier: CacheTier) -> Self {
        match tier {
            CacheTier::Local => self.local = true,
            CacheTier::Durable => self.durable = true,
            CacheTier::Shared => self.shared = true,
        }
        self
    }

    /// Whether `tier` is enabled
    pub fn contains(&self, tier: CacheTier) -> bool {
        match tier {
            CacheTier::Local => self.local,
            CacheTier::Durable => self.durable,
            CacheTier::Shared => self.shared,
        }
    }

    /// Enabled tiers in lookup order
    pub fn iter(&self) -> impl Iterator<Item = CacheTier> + '_ {
        CacheTier::ALL.into_iter().filter(|t| self.contains(*t))
    }

    /// True when no tier is enabled
    pub fn is_empty(&self) -> bool {
        !(self.local || self.durable || self.shared)
    }
}

impl Default for TierSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Config form of a tier set: `"all"` or a list of tier names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TierSelection {
    /// `"all"`
    Keyword(String),
    /// `["local", "durable"]`
    List(Vec<CacheTier>),
}

impl TierSelection {
    /// Resolve to a concrete set
    pub fn resolve(&self) -> Result<TierSet> {
        match self {
            TierSelection::Keyword(word) if word.eq_ignore_ascii_case("all") => Ok(TierSet::all()),
            TierSelection::Keyword(word) => Ok(TierSet::of(&[word.parse()?])),
            TierSelection::List(tiers) => Ok(TierSet::of(tiers)),
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Policy applied to every key of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGroupPolicy {
    /// Default time to live
    pub ttl: Duration,
    /// Enabled tiers
    pub tiers: TierSet,
    /// Compress payloads above the threshold
    pub compress: bool,
    /// Include in scheduled warming
    pub warm: bool,
    /// Invalidation tags
    pub tags: BTreeSet<String>,
}

impl Default for CacheGroupPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            tiers: TierSet::all(),
            compress: false,
            warm: false,
            tags: BTreeSet::new(),
        }
    }
}

impl CacheGroupPolicy {
    /// Policy with the given TTL and defaults elsewhere
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    /// Restrict to `tiers`
    pub fn tiers(mut self, tiers: &[CacheTier]) -> Self {
        self.tiers = TierSet::of(tiers);
        self
    }

    /// Enable compression
    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    /// Enable scheduled warming
    pub fn warmed(mut self) -> Self {
        self.warm = true;
        self
    }

    /// Add invalidation tags
    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Whether any of `tags` is carried by this policy
    pub fn has_any_tag<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter().any(|t| self.tags.contains(t.as_ref()))
    }
}

/// Partial policy read from configuration; unset fields keep the base value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupOverride {
    /// TTL as a duration string (`"30m"`, `"6h"`)
    pub ttl: Option<String>,
    /// Tier selection
    pub tiers: Option<TierSelection>,
    /// Compression flag
    pub compress: Option<bool>,
    /// Warm flag
    pub warm: Option<bool>,
    /// Replacement tag list
    pub tags: Option<Vec<String>>,
}

impl GroupOverride {
    /// Apply on top of `base`
    pub fn apply(&self, base: &CacheGroupPolicy) -> Result<CacheGroupPolicy> {
        let mut policy = base.clone();
        if let Some(ttl) = &self.ttl {
            policy.ttl = parse_duration(ttl)?;
        }
        if let Some(tiers) = &self.tiers {
            policy.tiers = tiers.resolve()?;
        }
        if let Some(compress) = self.compress {
            policy.compress = compress;
        }
        if let Some(warm) = self.warm {
            policy.warm = warm;
        }
        if let Some(tags) = &self.tags {
            policy.tags = tags.iter().cloned().collect();
        }
        Ok(policy)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Immutable group → policy table
#[derive(Debug, Clone, Default)]
pub struct GroupRegistry {
    groups: HashMap<String, CacheGroupPolicy>,
    default_policy: CacheGroupPolicy,
}

impl GroupRegistry {
    /// Start an empty registry
    pub fn builder() -> GroupRegistryBuilder {
        GroupRegistryBuilder::default()
    }

    /// Registry holding the built-in group table
    pub fn with_defaults() -> Self {
        GroupRegistryBuilder::with_defaults().build()
    }

    /// Policy for `group`, or the default policy when unregistered
    pub fn resolve(&self, group: &str) -> &CacheGroupPolicy {
        self.groups.get(group).unwrap_or(&self.default_policy)
    }

    /// Whether `group` has an explicit entry
    pub fn contains(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    /// Policy used for unregistered groups
    pub fn default_policy(&self) -> &CacheGroupPolicy {
        &self.default_policy
    }

    /// Groups whose tags intersect `tags`, sorted by name
    pub fn groups_with_tags<S: AsRef<str>>(&self, tags: &[S]) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .groups
            .iter()
            .filter(|(_, policy)| policy.has_any_tag(tags))
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Groups flagged for warming, sorted by name
    pub fn warm_groups(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .groups
            .iter()
            .filter(|(_, policy)| policy.warm)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Registered group names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.groups.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True when no group is registered
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Builder for [`GroupRegistry`]; registration is only possible here
#[derive(Debug, Default)]
pub struct GroupRegistryBuilder {
    groups: HashMap<String, CacheGroupPolicy>,
    default_policy: CacheGroupPolicy,
}

impl GroupRegistryBuilder {
    /// Builder seeded with the built-in table
    pub fn with_defaults() -> Self {
        let hour = Duration::from_secs(3600);
        let minute = Duration::from_secs(60);

        Self::default()
            .register(
                "ai_responses",
                CacheGroupPolicy::with_ttl(6 * hour).compressed().tagged(["ai"]),
            )
            .register(
                "settings",
                CacheGroupPolicy::with_ttl(24 * hour)
                    .tiers(&[CacheTier::Local, CacheTier::Durable])
                    .warmed()
                    .tagged(["config"]),
            )
            .register(
                "analytics",
                CacheGroupPolicy::with_ttl(30 * minute)
                    .compressed()
                    .warmed()
                    .tagged(["analytics", "reports"]),
            )
            .register(
                "reports",
                CacheGroupPolicy::with_ttl(hour)
                    .tiers(&[CacheTier::Durable, CacheTier::Shared])
                    .compressed()
                    .warmed()
                    .tagged(["reports"]),
            )
            .register(
                "user_sessions",
                CacheGroupPolicy::with_ttl(15 * minute)
                    .tiers(&[CacheTier::Local, CacheTier::Shared])
                    .tagged(["users"]),
            )
            .register(
                "health_checks",
                CacheGroupPolicy::with_ttl(5 * minute)
                    .tiers(&[CacheTier::Local])
                    .tagged(["monitoring"]),
            )
    }

    /// Register or replace a group
    pub fn register(mut self, name: impl Into<String>, policy: CacheGroupPolicy) -> Self {
        self.groups.insert(name.into(), policy);
        self
    }

    /// Replace the policy used for unregistered groups
    pub fn default_policy(mut self, policy: CacheGroupPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Merge configuration overrides; unknown groups are created from the default policy
    pub fn apply_overrides(mut self, overrides: &BTreeMap<String, GroupOverride>) -> Result<Self> {
        for (name, over) in overrides {
            let base = self
                .groups
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.default_policy.clone());
            let policy = over
                .apply(&base)
                .map_err(|e| Error::Config(format!("group '{}': {}", name, e)))?;
            self.groups.insert(name.clone(), policy);
        }
        Ok(self)
    }

    /// Freeze the table
    pub fn build(self) -> GroupRegistry {
        GroupRegistry {
            groups: self.groups,
            default_policy: self.default_policy,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
