//! In-progress service discovery.
//!
//! One browse runs per device: either an SDP walk over the mandatory
//! browse UUIDs (BR/EDR) or GATT discovery over the ATT link (LE). The
//! record collects results as they stream in and produces a single
//! outcome that the controller commits atomically — a canceled or failed
//! browse changes nothing.

use std::collections::{BTreeSet, VecDeque};
use uuid::Uuid;

use super::Reply;
use crate::{
    event::{GattPrimary, SdpRecord},
    uuid_ext::ids,
    Bearer, DeviceId, Result,
};

/// UUIDs searched by a BR/EDR browse, in order.
pub(crate) const SDP_BROWSE_SEQUENCE: [Uuid; 3] =
    [ids::L2CAP, ids::PUBLIC_BROWSE_GROUP, ids::PNP_INFORMATION];

/// Discovery mechanism of a browse.
#[derive(Debug)]
pub enum BrowseKind {
    /// SDP search walking the mandatory UUID list.
    Sdp {
        /// UUIDs not yet searched.
        remaining: VecDeque<Uuid>,
        /// Records gathered so far.
        records: Vec<SdpRecord>,
    },
    /// GATT discovery over the ATT link.
    Gatt,
}

/// Result of a finished browse, committed by the controller.
#[derive(Clone, Debug, Default)]
pub struct BrowseOutcome {
    /// Resolved service UUIDs to add.
    pub uuids: BTreeSet<Uuid>,
    /// Primary GATT services found.
    pub primaries: Vec<GattPrimary>,
    /// Device ID metadata from the PnP record, if present.
    pub device_id: Option<DeviceId>,
    /// Raw SDP records for the on-disk cache.
    pub records: Vec<SdpRecord>,
}

/// One in-progress browse.
#[derive(custom_debug::Debug)]
pub struct BrowseRequest {
    /// Bearer the browse runs on.
    pub bearer: Bearer,
    /// Discovery mechanism.
    pub kind: BrowseKind,
    #[debug(skip)]
    reply: Option<Reply>,
    /// The browse was canceled; its completion must not commit results.
    pub canceled: bool,
}

impl BrowseRequest {
    /// Creates an SDP browse over the mandatory UUID sequence.
    pub(crate) fn sdp(reply: Option<Reply>) -> Self {
        Self {
            bearer: Bearer::BrEdr,
            kind: BrowseKind::Sdp { remaining: SDP_BROWSE_SEQUENCE.into(), records: Vec::new() },
            reply,
            canceled: false,
        }
    }

    /// Creates a GATT browse.
    pub(crate) fn gatt(reply: Option<Reply>) -> Self {
        Self { bearer: Bearer::Le, kind: BrowseKind::Gatt, reply, canceled: false }
    }

    /// Next UUID to search, advancing the SDP walk.
    pub(crate) fn next_sdp_uuid(&mut self) -> Option<Uuid> {
        match &mut self.kind {
            BrowseKind::Sdp { remaining, .. } => remaining.pop_front(),
            BrowseKind::Gatt => None,
        }
    }

    /// Adds records returned for one searched UUID.
    pub(crate) fn push_records(&mut self, found: Vec<SdpRecord>) {
        if let BrowseKind::Sdp { records, .. } = &mut self.kind {
            for record in found {
                if !records.iter().any(|r| r.handle == record.handle) {
                    records.push(record);
                }
            }
        }
    }

    /// Outcome of a finished SDP walk.
    pub(crate) fn sdp_outcome(&mut self) -> BrowseOutcome {
        let records = match &mut self.kind {
            BrowseKind::Sdp { records, .. } => std::mem::take(records),
            BrowseKind::Gatt => Vec::new(),
        };
        let mut outcome = BrowseOutcome::default();
        for record in &records {
            outcome.uuids.extend(record.uuids.iter().copied());
            if outcome.device_id.is_none() {
                outcome.device_id = record.device_id;
            }
            if let Some((start, end)) = record.att_range {
                for uuid in &record.uuids {
                    outcome.primaries.push(GattPrimary { uuid: *uuid, start, end });
                }
            }
        }
        outcome.records = records;
        outcome
    }

    /// Outcome of a finished GATT discovery.
    pub(crate) fn gatt_outcome(primaries: Vec<GattPrimary>) -> BrowseOutcome {
        BrowseOutcome {
            uuids: primaries.iter().map(|p| p.uuid).collect(),
            primaries,
            device_id: None,
            records: Vec::new(),
        }
    }

    /// Walks the waiter's continuation with the final outcome.
    pub(crate) fn reply(&mut self, result: Result<()>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }

    /// Detaches the waiter's continuation, for handing it to a
    /// replacement browse.
    pub(crate) fn take_reply(&mut self) -> Option<Reply> {
        self.reply.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdp_walk_covers_the_mandatory_sequence() {
        let mut req = BrowseRequest::sdp(None);
        assert_eq!(req.next_sdp_uuid(), Some(ids::L2CAP));
        assert_eq!(req.next_sdp_uuid(), Some(ids::PUBLIC_BROWSE_GROUP));
        assert_eq!(req.next_sdp_uuid(), Some(ids::PNP_INFORMATION));
        assert_eq!(req.next_sdp_uuid(), None);
    }

    #[test]
    fn records_are_unique_by_handle() {
        let mut req = BrowseRequest::sdp(None);
        req.push_records(vec![
            SdpRecord { handle: 0x10000, uuids: vec![ids::AUDIO_SINK], ..Default::default() },
            SdpRecord { handle: 0x10001, uuids: vec![ids::AV_REMOTE_CONTROL], ..Default::default() },
        ]);
        req.push_records(vec![SdpRecord {
            handle: 0x10000,
            uuids: vec![ids::AUDIO_SINK],
            ..Default::default()
        }]);

        let outcome = req.sdp_outcome();
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.uuids.contains(&ids::AUDIO_SINK));
        assert!(outcome.uuids.contains(&ids::AV_REMOTE_CONTROL));
    }

    #[test]
    fn pnp_record_yields_device_id() {
        let mut req = BrowseRequest::sdp(None);
        let device_id = DeviceId { source: 1, vendor: 0x1d6b, product: 0x246, version: 0x540 };
        req.push_records(vec![SdpRecord {
            handle: 0x10005,
            uuids: vec![ids::PNP_INFORMATION],
            device_id: Some(device_id),
            ..Default::default()
        }]);
        assert_eq!(req.sdp_outcome().device_id, Some(device_id));
    }

    #[test]
    fn gatt_outcome_collects_primaries() {
        let primaries = vec![
            GattPrimary { uuid: ids::GAP, start: 1, end: 10 },
            GattPrimary { uuid: ids::BATTERY, start: 11, end: 20 },
        ];
        let outcome = BrowseRequest::gatt_outcome(primaries.clone());
        assert_eq!(outcome.primaries, primaries);
        assert!(outcome.uuids.contains(&ids::BATTERY));
    }
}
