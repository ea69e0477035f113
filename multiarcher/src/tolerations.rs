use k8s_openapi::api::core::v1::Toleration;

use crate::config::PlatformTolerationConfig;

/// Appends the tolerations of every supported platform to `existing`
///
/// Mappings are applied in configuration order. A toleration is skipped when
/// one with the same key, value, operator and effect is already present, so
/// applying the result again changes nothing.
pub fn apply_tolerations(
    config: &PlatformTolerationConfig,
    existing: &[Toleration],
    supported: &[String],
) -> Vec<Toleration> {
    let mut tolerations = existing.to_vec();
    for spec in config.tolerations_for(supported) {
        if !tolerations.iter().any(|t| spec.matches(t)) {
            tolerations.push(spec.to_toleration());
        }
    }
    tolerations
}

/// Applies [`apply_tolerations`] to an optional toleration list in place
///
/// The list is left untouched when nothing needs adding.
pub fn patch_tolerations(
    config: &PlatformTolerationConfig,
    tolerations: &mut Option<Vec<Toleration>>,
    supported: &[String],
) {
    let current = tolerations.as_deref().unwrap_or_default();
    let updated = apply_tolerations(config, current, supported);
    if updated.len() != current.len() {
        *tolerations = Some(updated);
    }
}
