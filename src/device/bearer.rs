//! Per-bearer state and bearer selection.
//!
//! A device keeps one [BearerState] for BR/EDR and one for LE. Bearer
//! selection decides which of the two a connect or pair request uses,
//! from presence, bonding, preference flags, address type and how
//! recently each bearer was seen.

use std::time::{Duration, Instant};
use strum::{Display, EnumString};

use crate::{AddressType, Bearer};

/// A bearer seen longer ago than this has unknown freshness.
pub const SEEN_FRESHNESS_MAX: Duration = Duration::from_secs(300);

/// Preferred bearer for initiating connections.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
pub enum PreferredBearer {
    /// Use the bearer of the last successful connection.
    #[default]
    #[strum(serialize = "last-used")]
    LastUsed,
    /// Always use BR/EDR.
    #[strum(serialize = "bredr")]
    BrEdr,
    /// Always use LE.
    #[strum(serialize = "le")]
    Le,
    /// Use the bearer the device was last seen on.
    #[strum(serialize = "last-seen")]
    LastSeen,
}

/// State of one bearer of a device.
#[derive(Clone, Copy, Debug, Default)]
pub struct BearerState {
    /// The device has this bearer.
    pub present: bool,
    /// Keys were exchanged on this bearer in this session.
    pub paired: bool,
    /// Exchanged keys are persisted.
    pub bonded: bool,
    /// The link on this bearer is up.
    pub connected: bool,
    /// Service discovery completed on this bearer.
    pub svc_resolved: bool,
    /// The local host initiated the current link.
    pub initiator: bool,
    /// The device currently accepts connections on this bearer.
    pub connectable: bool,
    /// This bearer is explicitly preferred for connecting.
    pub prefer: bool,
    /// When the bearer was last seen in a report. `None` means never.
    pub last_seen: Option<Instant>,
    /// When the bearer was last used for a connection. `None` means never.
    pub last_used: Option<Instant>,
}

impl BearerState {
    /// Records an advertising or inquiry sighting.
    pub fn seen(&mut self, now: Instant, connectable: bool) {
        self.present = true;
        self.connectable = connectable;
        self.last_seen = Some(now);
    }

    /// Sets the paired flag, clearing bonded when pairing is cleared.
    pub fn set_paired(&mut self, paired: bool) {
        self.paired = paired;
        if !paired {
            self.bonded = false;
        }
    }

    /// Sets the bonded flag, implying paired when set.
    pub fn set_bonded(&mut self, bonded: bool) {
        self.bonded = bonded;
        if bonded {
            self.paired = true;
        }
    }

    /// How recently this bearer was seen, if it is connectable and the
    /// sighting is fresh enough to matter.
    fn freshness(&self, now: Instant) -> Option<Duration> {
        if !self.connectable {
            return None;
        }
        let age = now.saturating_duration_since(self.last_seen?);
        if age > SEEN_FRESHNESS_MAX {
            None
        } else {
            Some(age)
        }
    }
}

/// Selects the bearer for a connect request.
///
/// Returns `None` only when neither bearer is present, which a valid
/// device never reports.
pub(crate) fn select_connect_bearer(
    bredr: &BearerState, le: &BearerState, prefer: PreferredBearer, address_type: AddressType,
    now: Instant,
) -> Option<Bearer> {
    match (bredr.present, le.present) {
        (true, false) => return Some(Bearer::BrEdr),
        (false, true) => return Some(Bearer::Le),
        (false, false) => return None,
        (true, true) => {}
    }

    if bredr.bonded != le.bonded {
        return Some(if bredr.bonded { Bearer::BrEdr } else { Bearer::Le });
    }

    if bredr.prefer != le.prefer {
        return Some(if bredr.prefer { Bearer::BrEdr } else { Bearer::Le });
    }

    if address_type == AddressType::LeRandom {
        return Some(Bearer::Le);
    }

    if prefer == PreferredBearer::LastUsed {
        match (bredr.last_used, le.last_used) {
            (Some(b), Some(l)) if b != l => {
                return Some(if b > l { Bearer::BrEdr } else { Bearer::Le })
            }
            (Some(_), None) => return Some(Bearer::BrEdr),
            (None, Some(_)) => return Some(Bearer::Le),
            _ => {}
        }
    }

    // advertising EIR with the BR/EDR flag tends to be freshest when equal,
    // so ties go to BR/EDR
    Some(match (bredr.freshness(now), le.freshness(now)) {
        (None, None) => address_type.bearer(),
        (Some(_), None) => Bearer::BrEdr,
        (None, Some(_)) => Bearer::Le,
        (Some(b), Some(l)) => {
            if l < b {
                Bearer::Le
            } else {
                Bearer::BrEdr
            }
        }
    })
}

/// Selects the bearer for a pair request.
///
/// A bearer that is already bonded loses to the other one, so pairing a
/// half-bonded dual-mode device completes the missing bearer.
pub(crate) fn select_pair_bearer(
    bredr: &BearerState, le: &BearerState, prefer: PreferredBearer, address_type: AddressType,
    now: Instant,
) -> Option<Bearer> {
    match (bredr.present, le.present) {
        (true, false) => return Some(Bearer::BrEdr),
        (false, true) => return Some(Bearer::Le),
        (false, false) => return None,
        (true, true) => {}
    }

    if bredr.bonded != le.bonded {
        return Some(if bredr.bonded { Bearer::Le } else { Bearer::BrEdr });
    }

    select_connect_bearer(bredr, le, prefer, address_type, now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(connectable: bool) -> BearerState {
        BearerState { present: true, connectable, ..Default::default() }
    }

    fn now() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn single_present_bearer_wins() {
        let now = now();
        let bredr = present(true);
        let le = BearerState::default();
        assert_eq!(
            select_connect_bearer(&bredr, &le, PreferredBearer::LastUsed, AddressType::BrEdr, now),
            Some(Bearer::BrEdr)
        );
        assert_eq!(
            select_connect_bearer(&le, &bredr, PreferredBearer::LastUsed, AddressType::LePublic, now),
            Some(Bearer::Le)
        );
        assert_eq!(
            select_connect_bearer(&le, &le, PreferredBearer::LastUsed, AddressType::LePublic, now),
            None
        );
    }

    #[test]
    fn bonded_bearer_wins() {
        let now = now();
        let bredr = present(true);
        let mut le = present(true);
        le.set_bonded(true);
        assert_eq!(
            select_connect_bearer(&bredr, &le, PreferredBearer::LastUsed, AddressType::BrEdr, now),
            Some(Bearer::Le)
        );
    }

    #[test]
    fn prefer_flag_wins_over_address_type() {
        let now = now();
        let mut bredr = present(true);
        bredr.prefer = true;
        let le = present(true);
        assert_eq!(
            select_connect_bearer(&bredr, &le, PreferredBearer::BrEdr, AddressType::LeRandom, now),
            Some(Bearer::BrEdr)
        );
    }

    #[test]
    fn random_address_picks_le() {
        let now = now();
        let bredr = present(true);
        let le = present(true);
        assert_eq!(
            select_connect_bearer(&bredr, &le, PreferredBearer::LastUsed, AddressType::LeRandom, now),
            Some(Bearer::Le)
        );
    }

    #[test]
    fn never_used_bearer_loses_last_used_comparison() {
        let now = now();
        let bredr = present(true);
        let mut le = present(true);
        le.last_used = Some(now - Duration::from_secs(10));
        assert_eq!(
            select_connect_bearer(&bredr, &le, PreferredBearer::LastUsed, AddressType::BrEdr, now),
            Some(Bearer::Le)
        );
    }

    #[test]
    fn fresher_bearer_wins() {
        let now = now();
        let mut bredr = present(true);
        let mut le = present(true);
        bredr.last_seen = Some(now - Duration::from_secs(200));
        le.last_seen = Some(now - Duration::from_secs(20));
        assert_eq!(
            select_connect_bearer(&bredr, &le, PreferredBearer::LastSeen, AddressType::BrEdr, now),
            Some(Bearer::Le)
        );
    }

    #[test]
    fn stale_sightings_clamp_to_unknown() {
        let now = now();
        let mut bredr = present(true);
        let mut le = present(true);
        bredr.last_seen = Some(now - Duration::from_secs(400));
        le.last_seen = Some(now - Duration::from_secs(500));
        // both unknown, BR/EDR public address falls back to its natural bearer
        assert_eq!(
            select_connect_bearer(&bredr, &le, PreferredBearer::LastSeen, AddressType::BrEdr, now),
            Some(Bearer::BrEdr)
        );
    }

    #[test]
    fn freshness_tie_prefers_bredr() {
        let now = now();
        let mut bredr = present(true);
        let mut le = present(true);
        let seen = now - Duration::from_secs(30);
        bredr.last_seen = Some(seen);
        le.last_seen = Some(seen);
        assert_eq!(
            select_connect_bearer(&bredr, &le, PreferredBearer::LastSeen, AddressType::LePublic, now),
            Some(Bearer::BrEdr)
        );
    }

    #[test]
    fn unconnectable_bearer_has_no_freshness() {
        let now = now();
        let mut bredr = present(false);
        let mut le = present(true);
        bredr.last_seen = Some(now - Duration::from_secs(1));
        le.last_seen = Some(now - Duration::from_secs(100));
        assert_eq!(
            select_connect_bearer(&bredr, &le, PreferredBearer::LastSeen, AddressType::BrEdr, now),
            Some(Bearer::Le)
        );
    }

    #[test]
    fn pair_picks_the_unbonded_bearer() {
        let now = now();
        let mut bredr = present(true);
        bredr.set_bonded(true);
        let le = present(true);
        assert_eq!(
            select_pair_bearer(&bredr, &le, PreferredBearer::LastUsed, AddressType::BrEdr, now),
            Some(Bearer::Le)
        );
    }

    #[test]
    fn bonded_implies_paired() {
        let mut bs = BearerState::default();
        bs.set_bonded(true);
        assert!(bs.paired && bs.bonded);
        bs.set_paired(false);
        assert!(!bs.paired && !bs.bonded);
    }
}
