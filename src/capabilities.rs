//! Source version and feature flag checks used when building stages.

use std::collections::HashMap;

use semver::Version;

use crate::config::FeatureFlagConfig;

/// Feature flag gating project migration.
pub const PROJECT_MIGRATION_FLAG: &str = "bulk_import_projects";

/// Features that depend on the source instance version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFeature {
    ProjectMigration,
}

impl SourceFeature {
    /// Oldest source version supporting the feature.
    pub fn min_version(&self) -> Version {
        match self {
            SourceFeature::ProjectMigration => Version::new(14, 4, 0),
        }
    }
}

/// Injected lookups for the stage builder.
pub trait Capabilities: Send + Sync {
    fn version_supports(&self, feature: SourceFeature) -> bool;

    /// `scope` is a root namespace; `None` resolves the flag globally.
    fn flag_enabled(&self, name: &str, scope: Option<&str>) -> bool;
}

/// Parses a reported version, ignoring suffixes like `-ee` or `-pre`.
///
/// Two-part versions such as `15.1` are accepted.
pub fn parse_source_version(raw: &str) -> Option<Version> {
    let core = raw.trim().split(['-', '+', ' ']).next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u64>());

    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;

    Some(Version::new(major, minor, patch))
}

/// Capabilities backed by the reported source version and configured flags.
#[derive(Debug, Clone)]
pub struct ConfigCapabilities {
    source_version: Option<Version>,
    flags: HashMap<String, FeatureFlagConfig>,
}

impl ConfigCapabilities {
    pub fn new(source_version: Option<&str>, flags: &HashMap<String, FeatureFlagConfig>) -> Self {
        Self {
            source_version: source_version.and_then(parse_source_version),
            flags: flags.clone(),
        }
    }
}

impl Capabilities for ConfigCapabilities {
    fn version_supports(&self, feature: SourceFeature) -> bool {
        self.source_version
            .as_ref()
            .is_some_and(|v| *v >= feature.min_version())
    }

    fn flag_enabled(&self, name: &str, scope: Option<&str>) -> bool {
        let Some(flag) = self.flags.get(name) else {
            return false;
        };
        if flag.enabled {
            return true;
        }
        scope.is_some_and(|ns| flag.namespaces.iter().any(|n| n == ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(enabled: bool, namespaces: &[&str]) -> HashMap<String, FeatureFlagConfig> {
        HashMap::from([(
            PROJECT_MIGRATION_FLAG.to_string(),
            FeatureFlagConfig {
                enabled,
                namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            },
        )])
    }

    #[test]
    fn parse_ignores_edition_suffix() {
        assert_eq!(parse_source_version("14.4.0-ee"), Some(Version::new(14, 4, 0)));
        assert_eq!(parse_source_version("15.1"), Some(Version::new(15, 1, 0)));
        assert_eq!(parse_source_version("16.0.1-pre"), Some(Version::new(16, 0, 1)));
        assert_eq!(parse_source_version("garbage"), None);
    }

    #[test]
    fn version_support_uses_minimum() {
        let flags = HashMap::new();
        let supported = |v: &str| {
            ConfigCapabilities::new(Some(v), &flags).version_supports(SourceFeature::ProjectMigration)
        };

        assert!(supported("14.4.0"));
        assert!(supported("14.4.0-ee"));
        assert!(supported("15.0.0"));
        assert!(!supported("14.3.9"));
        assert!(!ConfigCapabilities::new(None, &flags)
            .version_supports(SourceFeature::ProjectMigration));
    }

    #[test]
    fn unknown_flag_is_disabled() {
        let caps = ConfigCapabilities::new(Some("15.0.0"), &HashMap::new());
        assert!(!caps.flag_enabled(PROJECT_MIGRATION_FLAG, None));
    }

    #[test]
    fn globally_enabled_flag_applies_to_every_scope() {
        let caps = ConfigCapabilities::new(None, &flags(true, &[]));
        assert!(caps.flag_enabled(PROJECT_MIGRATION_FLAG, None));
        assert!(caps.flag_enabled(PROJECT_MIGRATION_FLAG, Some("acme")));
    }

    #[test]
    fn scoped_flag_only_applies_to_listed_namespaces() {
        let caps = ConfigCapabilities::new(None, &flags(false, &["acme"]));
        assert!(caps.flag_enabled(PROJECT_MIGRATION_FLAG, Some("acme")));
        assert!(!caps.flag_enabled(PROJECT_MIGRATION_FLAG, Some("other")));
        assert!(!caps.flag_enabled(PROJECT_MIGRATION_FLAG, None));
    }
}
