//! Context and phase settings
//!
//! Settings extend the creation API of contexts and phases without the core
//! knowing the modules that read them. Each setting belongs to a
//! [`SettingKind`]; a static table decides which kinds conflict, so at most
//! one setting per conflict class reaches a context.

use crate::{IdempotencyError, PublishStrategy};
use serde::{Deserialize, Serialize};

/// Extension marker attached to a context or a phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Setting {
    /// Selects how [`publish`](crate::publish) behaves in the process
    Publishing(PublishStrategy),
}

/// Discriminant of [`Setting`] used by the conflict table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SettingKind {
    /// [`Setting::Publishing`]
    Publishing,
}

impl SettingKind {
    /// Kinds that may not appear together with this one
    pub fn conflicts_with(self) -> &'static [SettingKind] {
        match self {
            SettingKind::Publishing => &[SettingKind::Publishing],
        }
    }
}

impl Setting {
    /// Kind of this setting
    pub fn kind(&self) -> SettingKind {
        match self {
            Setting::Publishing(_) => SettingKind::Publishing,
        }
    }

    /// Check whether this setting conflicts with `other`
    pub fn conflicts_with(&self, other: &Setting) -> bool {
        self.kind().conflicts_with().contains(&other.kind())
            || other.kind().conflicts_with().contains(&self.kind())
    }

    /// Publish strategy carried by this setting, if any
    pub fn as_publish_strategy(&self) -> Option<PublishStrategy> {
        match self {
            Setting::Publishing(strategy) => Some(*strategy),
        }
    }
}

impl From<PublishStrategy> for Setting {
    fn from(strategy: PublishStrategy) -> Self {
        Setting::Publishing(strategy)
    }
}

/// Fail with an assertion error when two settings conflict
pub fn validate_settings(owner: &str, settings: &[Setting]) -> Result<(), IdempotencyError> {
    for (i, a) in settings.iter().enumerate() {
        if let Some(b) = settings[i + 1..].iter().find(|b| a.conflicts_with(b)) {
            return Err(IdempotencyError::assertion(format!(
                "{owner}: conflicting settings provided: {a:?} and {b:?}."
            )));
        }
    }
    Ok(())
}

/// Append `default` unless one of `settings` conflicts with it
pub fn with_default(mut settings: Vec<Setting>, default: Option<&Setting>) -> Vec<Setting> {
    if let Some(default) = default {
        if !settings.iter().any(|s| s.conflicts_with(default)) {
            settings.push(default.clone());
        }
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_strategies_conflict() {
        let settings = vec![
            Setting::Publishing(PublishStrategy::InFinalPhase),
            Setting::Publishing(PublishStrategy::NoPublishing),
        ];
        let err = validate_settings("Process change-phone", &settings).unwrap_err();
        assert!(err.is_assertion());
        assert!(validate_settings("p", &settings[..1]).is_ok());
        assert!(validate_settings("p", &[]).is_ok());
    }

    #[test]
    fn test_default_added_only_without_conflict() {
        let default = Setting::Publishing(PublishStrategy::InFinalPhase);

        let added = with_default(vec![], Some(&default));
        assert_eq!(added, vec![default.clone()]);

        let explicit = vec![Setting::Publishing(PublishStrategy::InConsumer)];
        let kept = with_default(explicit.clone(), Some(&default));
        assert_eq!(kept, explicit);

        assert!(with_default(vec![], None).is_empty());
    }
}
