//! Weapon prediction and reconciliation engine

pub mod authority;
pub mod capabilities;
pub mod combat;
pub mod error;
pub mod fire_queue;
pub mod geometry;
pub mod history;
pub mod hitscan;
pub mod local;
pub mod prediction;
pub mod projectile;
pub mod scheduler;
pub mod sequence;
pub mod session;
pub mod snapshot;
pub mod weapon;
pub mod world;

pub use authority::{AuthorityContext, Outbound, Recipient};
pub use error::FireRejection;
pub use local::LocalContext;
pub use session::{GameSession, ParticipantInput, SessionHandle, SessionRegistry};
