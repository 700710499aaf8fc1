//! Profile selection, group admission, and cache pool mapping.

use std::collections::BTreeMap;

use super::paths::is_under;
use super::refusal::Refusal;
use super::types::{Profile, StrictVariant};

/// Path prefixes whose changes escalate STRICT to STRICT_DEEP.
pub const STRICT_DEEP_PREFIXES: &[&str] = &["schema/", "data/registries/", "data/policies/"];

/// Shared cache pool for the policy runner under FAST and STRICT.
pub const SHARED_REPOX_PROFILE_ID: &str = "SHARED_REPOX";

/// Explicit request, else the gate-policy mode for the command.
fn requested_mode<'a>(
    requested: &'a str,
    gate_command: &str,
    default_mode_by_command: &'a BTreeMap<String, String>,
) -> Option<&'a str> {
    if !requested.trim().is_empty() {
        return Some(requested);
    }
    default_mode_by_command
        .get(gate_command)
        .map(String::as_str)
        .filter(|mode| !mode.trim().is_empty())
}

/// Resolve the active profile for a gate command.
///
/// Order: explicit request, gate-policy default for the command, then the
/// built-in mapping (`strict` → STRICT, `full`/`dist` → FULL, else FAST).
/// `STRICT-LIGHT` and `STRICT-DEEP` resolve to STRICT.
pub fn select_profile(
    requested: &str,
    gate_command: &str,
    default_mode_by_command: &BTreeMap<String, String>,
) -> Result<Profile, Refusal> {
    if let Some(mode) = requested_mode(requested, gate_command, default_mode_by_command) {
        return Profile::parse(mode);
    }
    Ok(match gate_command {
        "strict" => Profile::Strict,
        "full" | "dist" => Profile::Full,
        _ => Profile::Fast,
    })
}

/// Variant named by the request or gate policy (`STRICT-LIGHT`/`STRICT-DEEP`).
pub fn pinned_strict_variant(
    requested: &str,
    gate_command: &str,
    default_mode_by_command: &BTreeMap<String, String>,
) -> Option<StrictVariant> {
    requested_mode(requested, gate_command, default_mode_by_command)
        .and_then(StrictVariant::parse)
}

/// The pinned variant, else STRICT_DEEP when any change touches a
/// schema/registry/policy prefix.
///
/// Only populated for STRICT.
pub fn strict_variant(
    profile: Profile,
    pinned: Option<StrictVariant>,
    changed_paths: &[String],
) -> Option<StrictVariant> {
    if profile != Profile::Strict {
        return None;
    }
    if pinned.is_some() {
        return pinned;
    }
    let deep = changed_paths.iter().any(|path| {
        STRICT_DEEP_PREFIXES
            .iter()
            .any(|prefix| is_under(path, prefix))
    });
    Some(if deep {
        StrictVariant::StrictDeep
    } else {
        StrictVariant::StrictLight
    })
}

fn admission_rank(profile: Profile) -> u8 {
    match profile {
        Profile::Fast => 0,
        Profile::Strict => 1,
        Profile::Full | Profile::FullAll => 2,
    }
}

/// Whether a group declared for `group_profile` runs under `active`.
///
/// FAST admits FAST groups; STRICT admits FAST and STRICT; FULL admits all.
/// An unparseable group profile is treated as FULL-only.
pub fn admits(active: Profile, group_profile: &str) -> bool {
    let declared = Profile::parse(group_profile).unwrap_or(Profile::Full);
    admission_rank(declared) <= admission_rank(active)
}

/// Whether every group is included regardless of impact.
pub fn include_all_groups(profile: Profile, full_all_env: Option<&str>) -> bool {
    match profile {
        Profile::FullAll => true,
        Profile::Full => full_all_env.is_some_and(is_truthy),
        _ => false,
    }
}

/// Cache profile id for a runner; the only sanctioned cross-profile sharing.
pub fn cache_profile_id(runner_id: &str, profile: Profile) -> String {
    if runner_id == "repox_runner" && matches!(profile, Profile::Fast | Profile::Strict) {
        return SHARED_REPOX_PROFILE_ID.to_string();
    }
    profile.as_str().to_string()
}

/// `1`, `true`, `yes`, `on` (case-insensitive).
pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_policy() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn explicit_request_wins() {
        let profile = select_profile("full", "verify", &no_policy()).expect("profile");
        assert_eq!(profile, Profile::Full);
    }

    #[test]
    fn gate_policy_overrides_builtin_mapping() {
        let mut policy = BTreeMap::new();
        policy.insert("verify".to_string(), "strict".to_string());
        let profile = select_profile("", "verify", &policy).expect("profile");
        assert_eq!(profile, Profile::Strict);
    }

    #[test]
    fn builtin_mapping_by_command() {
        let policy = no_policy();
        assert_eq!(select_profile("", "strict", &policy).expect("s"), Profile::Strict);
        assert_eq!(select_profile("", "full", &policy).expect("f"), Profile::Full);
        assert_eq!(select_profile("", "dist", &policy).expect("d"), Profile::Full);
        assert_eq!(select_profile("", "verify", &policy).expect("v"), Profile::Fast);
        assert_eq!(select_profile("", "snapshot", &policy).expect("x"), Profile::Fast);
    }

    #[test]
    fn strict_variant_depends_on_prefixes() {
        let deep = vec!["data/registries/testx_groups.json".to_string()];
        let light = vec!["engine/core/a.c".to_string()];
        assert_eq!(
            strict_variant(Profile::Strict, None, &deep),
            Some(StrictVariant::StrictDeep)
        );
        assert_eq!(
            strict_variant(Profile::Strict, None, &light),
            Some(StrictVariant::StrictLight)
        );
        assert_eq!(strict_variant(Profile::Fast, None, &deep), None);
    }

    #[test]
    fn named_strict_variant_is_pinned() {
        let light = vec!["engine/core/a.c".to_string()];
        let pinned = pinned_strict_variant("strict-deep", "verify", &no_policy());
        assert_eq!(pinned, Some(StrictVariant::StrictDeep));
        assert_eq!(
            select_profile("strict-deep", "verify", &no_policy()).expect("profile"),
            Profile::Strict
        );
        assert_eq!(
            strict_variant(Profile::Strict, pinned, &light),
            Some(StrictVariant::StrictDeep)
        );

        let mut policy = BTreeMap::new();
        policy.insert("strict".to_string(), "STRICT_LIGHT".to_string());
        assert_eq!(
            pinned_strict_variant("", "strict", &policy),
            Some(StrictVariant::StrictLight)
        );
        assert_eq!(pinned_strict_variant("strict", "strict", &policy), None);
    }

    #[test]
    fn admission_follows_profile_ladder() {
        assert!(admits(Profile::Fast, "FAST"));
        assert!(!admits(Profile::Fast, "STRICT"));
        assert!(admits(Profile::Strict, "fast"));
        assert!(admits(Profile::Strict, "STRICT"));
        assert!(!admits(Profile::Strict, "FULL"));
        assert!(admits(Profile::Full, "FULL"));
        assert!(admits(Profile::FullAll, "STRICT"));
        assert!(!admits(Profile::Strict, "mystery"));
    }

    #[test]
    fn include_all_requires_full_and_truthy_env() {
        assert!(include_all_groups(Profile::Full, Some("1")));
        assert!(!include_all_groups(Profile::Full, Some("0")));
        assert!(!include_all_groups(Profile::Full, None));
        assert!(!include_all_groups(Profile::Fast, Some("true")));
        assert!(include_all_groups(Profile::FullAll, None));
    }

    #[test]
    fn repox_shares_cache_pool_across_fast_and_strict() {
        assert_eq!(cache_profile_id("repox_runner", Profile::Fast), "SHARED_REPOX");
        assert_eq!(cache_profile_id("repox_runner", Profile::Strict), "SHARED_REPOX");
        assert_eq!(cache_profile_id("repox_runner", Profile::Full), "FULL");
        assert_eq!(cache_profile_id("testx_runner", Profile::Fast), "FAST");
    }
}
