//! Dispatch of controller messages onto the authoritative context

use tracing::{debug, warn};
use uuid::Uuid;

use crate::game::authority::{AuthorityContext, Recipient};
use crate::game::capabilities::WorldGeometry;
use crate::game::error::FireRejection;
use crate::util::time::TimeMs;
use crate::ws::protocol::{AuthorityMsg, ControllerMsg, PROTOCOL_VERSION};

/// What the session loop should do with the sender after routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEffect {
    Continue,
    Joined,
    Left,
}

/// Maps each message kind to one context operation
#[derive(Debug, Clone)]
pub struct MessageRouter {
    session_id: Uuid,
    max_participants: usize,
}

impl MessageRouter {
    pub fn new(session_id: Uuid, max_participants: usize) -> Self {
        Self {
            session_id,
            max_participants,
        }
    }

    pub fn route<W: WorldGeometry>(
        &self,
        ctx: &mut AuthorityContext<W>,
        participant: Uuid,
        msg: ControllerMsg,
        now: TimeMs,
    ) -> RouteEffect {
        let to = Recipient::Participant(participant);

        match msg {
            ControllerMsg::Hello {
                protocol_version,
                team,
            } => return self.hello(ctx, participant, protocol_version, team, now),
            ControllerMsg::Ping { t } => {
                ctx.send(to, AuthorityMsg::Pong { t, server_time: now });
                ctx.await_echo(participant, now);
                return RouteEffect::Continue;
            }
            ControllerMsg::Echo { server_time } => {
                ctx.record_echo(participant, server_time, now);
                return RouteEffect::Continue;
            }
            ControllerMsg::Leave => {
                return if ctx.leave(participant) {
                    RouteEffect::Left
                } else {
                    RouteEffect::Continue
                };
            }
            _ => {}
        }

        if !ctx.is_participant(&participant) {
            ctx.send(to, AuthorityMsg::error("not_joined", "send hello first"));
            return RouteEffect::Continue;
        }

        let result = match msg {
            ControllerMsg::RequestStartFire {
                weapon,
                fire_mode,
                seq,
                aux_offset,
                locally_hit,
            } => ctx
                .start_fire(participant, weapon, fire_mode, seq, aux_offset, locally_hit, now)
                .map(drop),
            ControllerMsg::RequestStopFire {
                weapon,
                fire_mode,
                seq,
            } => ctx.stop_fire(participant, weapon, fire_mode, seq, now).map(drop),
            ControllerMsg::ReportHitScanTarget {
                weapon,
                target_id,
                seq,
            } => ctx.report_hit(participant, weapon, target_id, seq),
            ControllerMsg::SetZoom { weapon, zoom } => ctx.set_zoom(participant, weapon, zoom),
            ControllerMsg::SwitchWeapon { weapon } => ctx.switch_weapon(participant, weapon, now),
            ControllerMsg::UpdateMovement {
                position,
                aim,
                movement,
            } => ctx.update_movement(participant, position, aim, movement, now),
            ControllerMsg::RequestResync { weapon, seq } => ctx.resync(participant, weapon, seq),
            ControllerMsg::Hello { .. }
            | ControllerMsg::Ping { .. }
            | ControllerMsg::Echo { .. }
            | ControllerMsg::Leave => Ok(()),
        };

        if let Err(rejection) = result {
            report_rejection(ctx, participant, &rejection);
        }
        RouteEffect::Continue
    }

    fn hello<W: WorldGeometry>(
        &self,
        ctx: &mut AuthorityContext<W>,
        participant: Uuid,
        protocol_version: u32,
        team: Option<u8>,
        now: TimeMs,
    ) -> RouteEffect {
        let to = Recipient::Participant(participant);
        if protocol_version != PROTOCOL_VERSION {
            warn!(participant_id = %participant, protocol_version, "protocol version mismatch");
            ctx.send(
                to,
                AuthorityMsg::error(
                    "protocol_version",
                    format!("expected protocol {PROTOCOL_VERSION}, got {protocol_version}"),
                ),
            );
            return RouteEffect::Continue;
        }
        if ctx.is_participant(&participant) {
            ctx.send(to, AuthorityMsg::error("already_joined", "participant already in session"));
            return RouteEffect::Continue;
        }
        if ctx.participant_count() >= self.max_participants {
            ctx.send(to, AuthorityMsg::error("session_full", "session is full"));
            return RouteEffect::Continue;
        }

        ctx.send(
            to,
            AuthorityMsg::Welcome {
                participant_id: participant,
                session_id: self.session_id,
                server_time: now,
                session_seed: ctx.session_seed(),
                protocol_version: PROTOCOL_VERSION,
                fire_queue_drain_ms: ctx.config().fire_queue_drain_ms,
            },
        );
        match ctx.join(participant, team, now) {
            Ok(_) => RouteEffect::Joined,
            Err(rejection) => {
                report_rejection(ctx, participant, &rejection);
                RouteEffect::Continue
            }
        }
    }
}

/// Stale intents vanish, ownership problems are logged, unknown ids are
/// reported back; nothing else is worth more than a debug line.
fn report_rejection<W: WorldGeometry>(ctx: &mut AuthorityContext<W>, participant: Uuid, rejection: &FireRejection) {
    match rejection {
        FireRejection::StaleEvent { .. } => {}
        FireRejection::InvalidOwner { .. } => {
            warn!(participant_id = %participant, reason = %rejection, "intent from invalid owner");
        }
        FireRejection::UnknownWeapon { .. } | FireRejection::UnknownFireMode { .. } => {
            warn!(participant_id = %participant, reason = %rejection, "intent names unknown weapon");
            ctx.send(
                Recipient::Participant(participant),
                AuthorityMsg::error("unknown_weapon", rejection.to_string()),
            );
        }
        FireRejection::IllegalTransition(_) | FireRejection::AmmoExhausted { .. } => {
            debug!(participant_id = %participant, reason = %rejection, "intent ignored");
        }
    }
}
