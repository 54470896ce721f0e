//! Weapon Authority Server
//!
//! Client prediction and server reconciliation for hit-scan and projectile
//! weapons:
//! - sequenced, resent fire intents with an authoritative acceptance window
//! - weapon firing/zoom state machines shared by controller and authority
//! - lag-compensated hit scanning against rewound combatants
//! - predicted projectiles reconciled with a fast-forwarded authoritative copy

pub mod app;
pub mod config;
pub mod game;
pub mod http;
pub mod util;
pub mod ws;
