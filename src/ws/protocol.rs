//! WebSocket protocol message definitions
//! These are the wire types between a controlling client and the authority

use glam::Vec3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::capabilities::DamageReport;
use crate::game::combat::MovementState;
use crate::game::sequence::SequenceIndex;
use crate::game::weapon::{FireModeId, WeaponKind, WeaponState, ZoomStatus};

/// Bumped whenever a message shape changes
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a controlling client to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMsg {
    /// Join a session
    Hello {
        protocol_version: u32,
        /// None for free-for-all
        #[serde(default)]
        team: Option<u8>,
    },

    /// Begin a firing sequence; resent until acknowledged
    RequestStartFire {
        weapon: WeaponKind,
        fire_mode: FireModeId,
        seq: SequenceIndex,
        /// Vertical view offset applied to the muzzle
        #[serde(default)]
        aux_offset: Option<f32>,
        /// Controller's own trace hit a combatant
        #[serde(default)]
        locally_hit: bool,
    },

    /// End a firing sequence
    RequestStopFire {
        weapon: WeaponKind,
        fire_mode: FireModeId,
        seq: SequenceIndex,
    },

    /// Advisory client-side hit, used for the padding rule and diagnostics
    ReportHitScanTarget {
        weapon: WeaponKind,
        target_id: Uuid,
        seq: SequenceIndex,
    },

    /// Zoom decided by the controller, mirrored to observers
    SetZoom {
        weapon: WeaponKind,
        zoom: ZoomStatus,
    },

    /// Bring a different weapon up
    SwitchWeapon {
        weapon: WeaponKind,
    },

    /// Position and aim from the movement system
    UpdateMovement {
        position: Vec3,
        aim: Vec3,
        #[serde(default)]
        movement: MovementState,
    },

    /// Full state resynchronisation for one weapon; `seq` must be the
    /// reserved sentinel
    RequestResync {
        weapon: WeaponKind,
        seq: SequenceIndex,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Bounce of the latest pong; the authority times the round trip
    Echo {
        server_time: u64,
    },

    /// Leave the session
    Leave,
}

/// Messages sent from the authority to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthorityMsg {
    /// Reply to Hello
    Welcome {
        participant_id: Uuid,
        session_id: Uuid,
        server_time: u64,
        /// Seed for deterministic shot spread
        session_seed: u64,
        protocol_version: u32,
        /// Retransmit interval the controller's fire queue should use
        fire_queue_drain_ms: u64,
    },

    /// Last accepted sequence index for a weapon
    AckFireEvent {
        weapon: WeaponKind,
        last_accepted: SequenceIndex,
    },

    /// Trigger muzzle/impact effects on observers
    BroadcastFiringState {
        owner: Uuid,
        weapon: WeaponKind,
        fire_mode: FireModeId,
        /// 0 means "stopped firing"
        flash_count: u8,
        flash_location: Option<Vec3>,
    },

    /// Owner's authoritative ammo
    NotifyAmmoChanged {
        weapon: WeaponKind,
        ammo: u32,
    },

    /// Zoom relayed from the controlling client
    ZoomChanged {
        owner: Uuid,
        weapon: WeaponKind,
        zoom: ZoomStatus,
    },

    /// Authoritative projectile now exists
    ProjectileSpawned {
        owner: Uuid,
        weapon: WeaponKind,
        shot_number: u32,
        projectile_id: u32,
        position: Vec3,
        velocity: Vec3,
        /// Milliseconds the projectile was advanced on spawn
        fast_forward_ms: u64,
    },

    /// Replicated weapon state (sent at regular intervals and on resync)
    WeaponSnapshots {
        tick: u64,
        weapons: Vec<WeaponSnapshot>,
    },

    /// Owner ran dry; bring this weapon up
    SwitchToBestWeapon {
        weapon: WeaponKind,
    },

    /// Damage landed
    CombatantDamaged {
        instigator: Option<Uuid>,
        cause: String,
        report: DamageReport,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
        server_time: u64,
    },

    /// Error message
    Error {
        code: String,
        message: String,
    },
}

impl AuthorityMsg {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Read-only replica of one weapon's authoritative state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeaponSnapshot {
    pub owner: Uuid,
    pub weapon: WeaponKind,
    pub equipped: bool,
    pub state: WeaponState,
    pub ammo: u32,
    pub max_ammo: u32,
    pub zoom: ZoomStatus,
    pub last_accepted: SequenceIndex,
    pub flash_count: u8,
}
