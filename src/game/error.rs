//! Rejection taxonomy for fire intents

use uuid::Uuid;

use super::weapon::WeaponKind;

/// Why an incoming intent produced no state change.
///
/// Every variant is recovered from locally: the message is discarded and the
/// authoritative simulation carries on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FireRejection {
    /// Sequence index outside the acceptance window (dropped silently)
    #[error("stale fire event {index} (last accepted {last_accepted})")]
    StaleEvent { index: u8, last_accepted: u8 },

    /// Weapon has no living owner
    #[error("weapon {weapon:?} has no living owner {owner}")]
    InvalidOwner { owner: Uuid, weapon: WeaponKind },

    #[error("combatant {owner} does not carry {weapon:?}")]
    UnknownWeapon { owner: Uuid, weapon: WeaponKind },

    #[error("fire mode {mode} is not defined for {weapon:?}")]
    UnknownFireMode { weapon: WeaponKind, mode: u8 },

    /// State machine refused the transition (ignored, never fatal)
    #[error("transition ignored: {0}")]
    IllegalTransition(&'static str),

    /// Not an error; triggers a switch to the best remaining weapon
    #[error("{weapon:?} is out of ammo")]
    AmmoExhausted { weapon: WeaponKind },
}

impl FireRejection {
    /// Whether this rejection deserves a log line
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            FireRejection::InvalidOwner { .. }
                | FireRejection::UnknownWeapon { .. }
                | FireRejection::UnknownFireMode { .. }
        )
    }
}
