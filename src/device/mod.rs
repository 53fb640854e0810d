//! Per-remote-device state machine.
//!
//! [Device] is the nexus the rest of the stack converges on: it owns the
//! dual-bearer lifecycle, pairing and bonding, service discovery, the
//! per-profile service attachments and the persistence of everything a
//! device teaches us.
//!
//! All mutations happen on the engine loop. Operations that cannot
//! complete immediately record a continuation in one of the named slots
//! (`connect_req`, `disconnect_req`, `browse`, `bonding`, `authr`) and
//! return; the completion event walks the slot and replies. At most one
//! of browse, bonding and connect is in flight; further requests fail
//! with [InProgress](crate::ErrorKind::InProgress).

use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use uuid::Uuid;

mod auth;
mod bearer;
mod bonding;
mod browse;
mod cache;
mod keys;
mod props;
mod service;

pub use auth::{AuthKind, AuthRequest};
pub use bearer::{BearerState, PreferredBearer, SEEN_FRESHNESS_MAX};
pub use bonding::BondingRequest;
pub use browse::{BrowseKind, BrowseOutcome, BrowseRequest};
pub use cache::{AdvCache, CacheField, TX_POWER_UNKNOWN};
pub use keys::{
    CounterUpdate, DeviceSet, KeyStore, LongTermKey, SetIdentityKey, SignatureKey,
};
pub use props::{DeviceProperty, PropertyDef, PROPERTIES};
pub use service::{Service, ServiceSet, ServiceState};

use crate::{
    adapter::{AdapterOps, DeviceFlags, DeviceWatcher, SecurityLevel},
    agent::Agent,
    config::{Config, JustWorksRepairing},
    event::{
        AdvReport, AgentReply, AuthEvent, BondingStatus, BrowseFault, DeviceEvent,
        DisconnectReason, GattPrimary, SdpRecord,
    },
    profile::ProfileRegistry,
    store::{self, DeviceCache, DeviceInfo, Store},
    Address, AddressType, Bearer, DeviceId, Error, ErrorKind, Modalias, Result,
};

/// Grace period between a disconnect request and forcing bearers down.
pub(crate) const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Deferral before auto-starting discovery after an inbound pairing.
pub(crate) const DISCOVERY_DEFER: Duration = Duration::from_secs(1);

/// Continuation of a caller waiting for an operation to complete.
pub(crate) type Reply = oneshot::Sender<Result<()>>;

pub(crate) fn respond(reply: Reply, result: Result<()>) {
    let _ = reply.send(result);
}

/// Shared collaborators of all devices of one adapter.
#[derive(custom_debug::Debug)]
pub struct DeviceContext {
    /// Outbound command surface.
    #[debug(skip)]
    pub adapter: Arc<dyn AdapterOps>,
    /// Change observer (the publication layer).
    #[debug(skip)]
    pub watcher: Arc<dyn DeviceWatcher>,
    /// Registered profiles.
    pub profiles: ProfileRegistry,
    /// Per-adapter persistent storage.
    pub store: Store,
    /// Policy configuration.
    pub config: Config,
    /// Agent used when a request carries none.
    #[debug(skip)]
    pub default_agent: Option<Arc<dyn Agent>>,
}

/// Remote-wake override requested through the WakeAllowed property.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WakeOverride {
    /// Follow the kernel default.
    #[default]
    Default,
    /// Wake-up enabled.
    Enabled,
    /// Wake-up disabled.
    Disabled,
}

/// In-flight connect request.
#[derive(custom_debug::Debug)]
struct ConnectRequest {
    bearer: Bearer,
    profile: Option<Uuid>,
    #[debug(skip)]
    reply: Option<Reply>,
    last_error: Option<Error>,
}

impl ConnectRequest {
    fn reply(&mut self, result: Result<()>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// In-flight disconnect request.
#[derive(custom_debug::Debug)]
struct DisconnectRequest {
    #[debug(skip)]
    reply: Option<Reply>,
}

/// One remote Bluetooth device.
#[derive(custom_debug::Debug)]
pub struct Device {
    #[debug(skip)]
    ctx: Arc<DeviceContext>,
    address: Address,
    address_type: AddressType,
    rpa: bool,
    conn_address: Option<(Address, AddressType)>,
    bredr: BearerState,
    le: BearerState,
    alias: Option<String>,
    device_id: Option<DeviceId>,
    trusted: bool,
    blocked: bool,
    cable_pairing: bool,
    legacy_pairing: bool,
    temporary: bool,
    auto_connect: bool,
    disable_auto_connect: bool,
    prefer_bearer: PreferredBearer,
    wake_override: WakeOverride,
    keys: KeyStore,
    cache: AdvCache,
    uuids: BTreeSet<Uuid>,
    primaries: Vec<GattPrimary>,
    sdp_records: Vec<SdpRecord>,
    services: ServiceSet,
    pending: VecDeque<Uuid>,
    browse: Option<BrowseRequest>,
    bonding: Option<BondingRequest>,
    authr: Option<AuthRequest>,
    connect_req: Option<ConnectRequest>,
    disconnect_req: Option<DisconnectRequest>,
    pending_paired: Option<Bearer>,
    disconn_timer: Option<Instant>,
    discov_timer: Option<Instant>,
    temporary_timer: Option<Instant>,
    supported_flags: DeviceFlags,
    pending_flags: Option<DeviceFlags>,
    current_flags: DeviceFlags,
    ccc_le: Option<u16>,
    ccc_bredr: Option<u16>,
    name_resolve_failed_at: Option<Instant>,
    att_connected: bool,
    gatt_ready: bool,
    store_pending: bool,
    cache_pending: bool,
    created: Instant,
}

impl Device {
    /// Creates a device first observed with the given address.
    ///
    /// The device is born temporary; its expiry timer starts running
    /// immediately.
    pub fn new(
        ctx: Arc<DeviceContext>, address: Address, address_type: AddressType, now: Instant,
    ) -> Self {
        let mut bredr = BearerState::default();
        let mut le = BearerState::default();
        match address_type.bearer() {
            Bearer::BrEdr => bredr.present = true,
            Bearer::Le => le.present = true,
        }
        let temporary_timer = Some(now + ctx.config.temporary_timeout);
        log::debug!("{address}: created temporary device ({address_type})");
        Self {
            ctx,
            address,
            address_type,
            rpa: false,
            conn_address: None,
            bredr,
            le,
            alias: None,
            device_id: None,
            trusted: false,
            blocked: false,
            cable_pairing: false,
            legacy_pairing: false,
            temporary: true,
            auto_connect: false,
            disable_auto_connect: false,
            prefer_bearer: PreferredBearer::default(),
            wake_override: WakeOverride::default(),
            keys: KeyStore::default(),
            cache: AdvCache::default(),
            uuids: BTreeSet::new(),
            primaries: Vec::new(),
            sdp_records: Vec::new(),
            services: ServiceSet::default(),
            pending: VecDeque::new(),
            browse: None,
            bonding: None,
            authr: None,
            connect_req: None,
            disconnect_req: None,
            pending_paired: None,
            disconn_timer: None,
            discov_timer: None,
            temporary_timer,
            supported_flags: DeviceFlags::default(),
            pending_flags: None,
            current_flags: DeviceFlags::default(),
            ccc_le: None,
            ccc_bredr: None,
            name_resolve_failed_at: None,
            att_connected: false,
            gatt_ready: false,
            store_pending: false,
            cache_pending: false,
            created: now,
        }
    }

    /// Restores a device from its persistent state.
    pub(crate) fn from_store(
        ctx: Arc<DeviceContext>, address: Address, info: DeviceInfo, cached: Option<DeviceCache>,
        now: Instant,
    ) -> Self {
        let address_type = info.general.address_type.parse().unwrap_or_default();
        let mut device = Self::new(ctx, address, address_type, now);
        device.temporary = false;
        device.temporary_timer = None;

        for tech in &info.general.supported_technologies {
            match tech.as_str() {
                "BR/EDR" => device.bredr.present = true,
                "LE" => device.le.present = true,
                other => log::warn!("{address}: unknown stored technology {other}"),
            }
        }
        device.cache.name = info.general.name;
        device.alias = info.general.alias;
        device.cache.class = info.general.class;
        device.cache.appearance = info.general.appearance;
        device.trusted = info.general.trusted;
        device.blocked = info.general.blocked;
        device.cable_pairing = info.general.cable_pairing;
        if let Some(prefer) = &info.general.preferred_bearer {
            if let Ok(prefer) = prefer.parse() {
                device.prefer_bearer = prefer;
                device.bredr.prefer = prefer == PreferredBearer::BrEdr;
                device.le.prefer = prefer == PreferredBearer::Le;
            }
        }
        if let Some(last_used) = &info.general.last_used_bearer {
            match last_used.parse::<Bearer>() {
                Ok(Bearer::BrEdr) => device.bredr.last_used = Some(now),
                Ok(Bearer::Le) => device.le.last_used = Some(now),
                Err(_) => {}
            }
        }
        for uuid in &info.general.services {
            match uuid.parse() {
                Ok(uuid) => {
                    device.uuids.insert(uuid);
                }
                Err(_) => log::warn!("{address}: ignoring malformed stored service {uuid}"),
            }
        }
        device.device_id =
            info.device_id.map(|d| DeviceId {
                source: d.source,
                vendor: d.vendor,
                product: d.product,
                version: d.version,
            });
        if let Some(ltk) = &info.long_term_key {
            if let Some(value) = store::key_from_hex(&ltk.key) {
                device.keys.set_ltk(LongTermKey {
                    value,
                    central: ltk.central,
                    enc_size: ltk.enc_size,
                });
                // kernel-held LE keys imply a bond on that bearer
                device.le.set_bonded(true);
            }
        }
        if let Some(csrk) = &info.local_signature_key {
            if let Some(value) = store::key_from_hex(&csrk.key) {
                device.keys.set_local_csrk(SignatureKey {
                    value,
                    counter: csrk.counter,
                    authenticated: csrk.authenticated,
                });
            }
        }
        if let Some(csrk) = &info.remote_signature_key {
            if let Some(value) = store::key_from_hex(&csrk.key) {
                device.keys.set_remote_csrk(SignatureKey {
                    value,
                    counter: csrk.counter,
                    authenticated: csrk.authenticated,
                });
            }
        }
        for sirk in &info.set_identity_resolving_keys {
            if let Some(value) = store::key_from_hex(&sirk.key) {
                device.keys.add_sirk(SetIdentityKey {
                    value,
                    encrypted: sirk.encrypted,
                    size: sirk.size,
                    rank: sirk.rank,
                });
            }
        }
        if let Some(sc) = &info.service_changed {
            device.ccc_le = sc.ccc_le;
            device.ccc_bredr = sc.ccc_bredr;
        }
        if info.general.wake_allowed {
            device.wake_override = WakeOverride::Enabled;
        }

        if let Some(cached) = cached {
            if device.cache.name.is_none() {
                device.cache.name = cached.name;
            }
            for record in &cached.service_records {
                let uuids = record
                    .uuids
                    .iter()
                    .filter_map(|u| u.parse().ok())
                    .collect();
                device.sdp_records.push(SdpRecord {
                    handle: record.handle,
                    uuids,
                    device_id: None,
                    att_range: None,
                    raw: hex::decode(&record.value).unwrap_or_default(),
                });
            }
            for attr in &cached.attributes {
                if let Ok(uuid) = attr.uuid.parse() {
                    device.primaries.push(GattPrimary { uuid, start: attr.start, end: attr.end });
                }
            }
        }

        device.probe_profiles();
        log::debug!("{address}: restored from storage");
        device
    }

    // ===========================================================================================
    // Identity and observables
    // ===========================================================================================

    /// Peer address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Identity address type.
    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    /// Name of the adapter the device belongs to.
    pub fn adapter_name(&self) -> &str {
        self.ctx.adapter.name()
    }

    /// Remote name, if one was observed or resolved.
    pub fn name(&self) -> Option<&str> {
        self.cache.name.as_deref()
    }

    /// Friendly name: the alias if set, else the remote name, else the
    /// address.
    pub fn alias(&self) -> String {
        self.alias
            .clone()
            .or_else(|| self.cache.name.clone())
            .unwrap_or_else(|| self.address.to_string())
    }

    /// Class of device.
    pub fn class(&self) -> Option<u32> {
        self.cache.class
    }

    /// GAP appearance.
    pub fn appearance(&self) -> Option<u16> {
        self.cache.appearance
    }

    /// Icon name derived from the class of device, falling back to the
    /// appearance.
    pub fn icon(&self) -> Option<&'static str> {
        self.cache
            .class
            .and_then(props::class_to_icon)
            .or_else(|| self.cache.appearance.and_then(props::appearance_to_icon))
    }

    /// Keys were exchanged on at least one bearer.
    pub fn is_paired(&self) -> bool {
        self.bredr.paired || self.le.paired
    }

    /// Keys are persisted for at least one bearer.
    pub fn is_bonded(&self) -> bool {
        self.bredr.bonded || self.le.bonded
    }

    /// At least one bearer is connected.
    pub fn is_connected(&self) -> bool {
        self.bredr.connected || self.le.connected
    }

    /// The device is trusted.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// The device is blocked.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// The device has not been promoted to persistent.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// The device only supports pre-2.1 pairing.
    pub fn legacy_pairing(&self) -> bool {
        self.legacy_pairing
    }

    /// The device was cable-paired.
    pub fn cable_pairing(&self) -> bool {
        self.cable_pairing
    }

    /// Signal strength of the last report.
    pub fn rssi(&self) -> Option<i16> {
        self.cache.rssi
    }

    /// Advertised transmit power.
    pub fn tx_power(&self) -> Option<i16> {
        self.cache.tx_power
    }

    /// Known service UUIDs: the resolved set once any discovery
    /// completed, else the advertised one.
    pub fn uuids_observable(&self) -> Vec<Uuid> {
        if !self.uuids.is_empty() || self.bredr.svc_resolved || self.le.svc_resolved {
            self.uuids.iter().copied().collect()
        } else {
            self.cache.eir_uuids.iter().copied().collect()
        }
    }

    /// Device ID in modalias form.
    pub fn modalias(&self) -> Option<Modalias> {
        self.device_id.map(|id| id.modalias())
    }

    /// Manufacturer specific advertising data.
    pub fn manufacturer_data(&self) -> &std::collections::HashMap<u16, Vec<u8>> {
        &self.cache.manufacturer_data
    }

    /// Service advertising data.
    pub fn service_data(&self) -> &std::collections::HashMap<Uuid, Vec<u8>> {
        &self.cache.service_data
    }

    /// Raw advertising data records.
    pub fn advertising_data(&self) -> &std::collections::HashMap<u8, Vec<u8>> {
        &self.cache.advertising_data
    }

    /// Advertising data flags.
    pub fn advertising_flags(&self) -> &[u8] {
        &self.cache.flags
    }

    /// Discovery completed on a bearer while connected.
    pub fn services_resolved(&self) -> bool {
        self.is_connected() && (self.bredr.svc_resolved || self.le.svc_resolved)
    }

    /// The kernel supports waking the host for this device.
    pub fn wake_supported(&self) -> bool {
        self.supported_flags.remote_wakeup
    }

    /// The device may wake the host from suspend.
    pub fn wake_allowed(&self) -> bool {
        self.current_flags.remote_wakeup
    }

    /// Coordinated-set memberships.
    pub fn sets(&self) -> Vec<DeviceSet> {
        self.keys.sets()
    }

    /// Preferred bearer for connecting.
    pub fn preferred_bearer(&self) -> PreferredBearer {
        self.prefer_bearer
    }

    /// Both bearers are present.
    pub fn is_dual_mode(&self) -> bool {
        self.bredr.present && self.le.present
    }

    /// Address and type actually used by the current or latest
    /// connection.
    pub fn connection_address(&self) -> Option<(Address, AddressType)> {
        self.conn_address
    }

    /// State of one bearer.
    pub fn bearer_state(&self, bearer: Bearer) -> &BearerState {
        match bearer {
            Bearer::BrEdr => &self.bredr,
            Bearer::Le => &self.le,
        }
    }

    /// Service attachments of the device.
    pub fn services(&self) -> &ServiceSet {
        &self.services
    }

    /// Key material of the device.
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// The current address is an LE private address (resolvable or
    /// non-resolvable). Private addresses never touch stable storage.
    pub fn is_private_address(&self) -> bool {
        self.address_type == AddressType::LeRandom && self.address.0[0] & 0xc0 != 0xc0
    }

    fn bearer_mut(&mut self, bearer: Bearer) -> &mut BearerState {
        match bearer {
            Bearer::BrEdr => &mut self.bredr,
            Bearer::Le => &mut self.le,
        }
    }

    fn bearer_address_type(&self, bearer: Bearer) -> AddressType {
        match bearer {
            Bearer::BrEdr => AddressType::BrEdr,
            Bearer::Le => {
                if self.address_type == AddressType::LeRandom {
                    AddressType::LeRandom
                } else {
                    AddressType::LePublic
                }
            }
        }
    }

    fn emit(&self, property: DeviceProperty) {
        log::trace!("{}: {} changed", self.address, property.name());
        self.ctx.watcher.property_changed(self.address, property);
    }

    fn should_store(&self) -> bool {
        !self.temporary && !self.is_private_address()
    }

    fn mark_info(&mut self) {
        if self.should_store() {
            self.store_pending = true;
        }
    }

    fn mark_cache(&mut self) {
        if !self.is_private_address() {
            self.cache_pending = true;
        }
    }

    // ===========================================================================================
    // Public operations
    // ===========================================================================================

    /// Connects the device, choosing a bearer and resolving services
    /// first when necessary.
    ///
    /// The reply is sent once at least one service is connected (BR/EDR)
    /// or the LE link is up.
    pub fn connect(&mut self, now: Instant, reply: Reply) {
        if !self.ctx.adapter.is_powered() {
            return respond(reply, Err(Error::new(ErrorKind::NotReady)));
        }
        if self.blocked {
            return respond(
                reply,
                Err(Error::with_message(ErrorKind::Failed, "device is blocked")),
            );
        }
        if self.connect_req.is_some() || self.browse.is_some() || self.bonding.is_some() {
            return respond(reply, Err(Error::new(ErrorKind::InProgress)));
        }
        let Some(bearer) = bearer::select_connect_bearer(
            &self.bredr,
            &self.le,
            self.prefer_bearer,
            self.address_type,
            now,
        ) else {
            return respond(reply, Err(Error::new(ErrorKind::Failed)));
        };
        log::debug!("{}: connecting on {bearer}", self.address);
        self.connect_req =
            Some(ConnectRequest { bearer, profile: None, reply: Some(reply), last_error: None });
        self.start_connect(bearer, now);
    }

    /// Connects a single profile identified by its remote UUID.
    pub fn connect_profile(&mut self, uuid: Uuid, now: Instant, reply: Reply) {
        if !self.ctx.adapter.is_powered() {
            return respond(reply, Err(Error::new(ErrorKind::NotReady)));
        }
        if self.blocked {
            return respond(
                reply,
                Err(Error::with_message(ErrorKind::Failed, "device is blocked")),
            );
        }
        if self.connect_req.is_some() || self.browse.is_some() || self.bonding.is_some() {
            return respond(reply, Err(Error::new(ErrorKind::InProgress)));
        }
        let Some(bearer) = bearer::select_connect_bearer(
            &self.bredr,
            &self.le,
            self.prefer_bearer,
            self.address_type,
            now,
        ) else {
            return respond(reply, Err(Error::new(ErrorKind::Failed)));
        };
        log::debug!("{}: connecting profile {uuid} on {bearer}", self.address);
        self.connect_req = Some(ConnectRequest {
            bearer,
            profile: Some(uuid),
            reply: Some(reply),
            last_error: None,
        });
        self.start_connect(bearer, now);
    }

    fn start_connect(&mut self, bearer: Bearer, now: Instant) {
        match bearer {
            Bearer::BrEdr => {
                if self.bredr.svc_resolved {
                    self.connect_next_services(bearer, now);
                } else {
                    self.begin_browse(bearer, None, now);
                }
            }
            Bearer::Le => {
                if self.le.connected {
                    let profile = self.connect_req.as_ref().and_then(|r| r.profile);
                    if profile.is_some() {
                        if self.le.svc_resolved {
                            self.connect_next_services(bearer, now);
                        } else {
                            self.begin_browse(Bearer::Le, None, now);
                        }
                    } else {
                        self.finish_connect(Err(Error::new(ErrorKind::AlreadyConnected)));
                    }
                } else if let Err(err) = self.ctx.adapter.open_att(
                    self.address,
                    self.bearer_address_type(Bearer::Le),
                    SecurityLevel::Low,
                ) {
                    self.finish_connect(Err(err));
                }
                // reply is sent when the link comes up
            }
        }
    }

    fn connect_next_services(&mut self, bearer: Bearer, now: Instant) {
        let profile = self.connect_req.as_ref().and_then(|c| c.profile);
        let queue: Vec<Uuid> = match profile {
            Some(uuid) => {
                if self.services.get(&uuid).is_some() {
                    vec![uuid]
                } else {
                    self.finish_connect(Err(Error::for_bearer(
                        ErrorKind::ProfileUnavailable,
                        bearer,
                    )));
                    return;
                }
            }
            None => self.services.connectable_uuids(),
        };
        self.pending = queue.into();
        self.advance_pending(now);
    }

    fn advance_pending(&mut self, _now: Instant) {
        while let Some(uuid) = self.pending.front().copied() {
            let Some(service) = self.services.get(&uuid) else {
                self.pending.pop_front();
                continue;
            };
            if service.state != ServiceState::Disconnected {
                self.pending.pop_front();
                continue;
            }
            let driver = service.profile.driver.clone();
            match driver.connect(self.address, uuid) {
                Ok(()) => {
                    self.services.set_state(&uuid, ServiceState::Connecting);
                    return;
                }
                Err(err) => {
                    log::warn!("{}: connecting service {uuid} failed: {err}", self.address);
                    if let Some(req) = &mut self.connect_req {
                        req.last_error = Some(err);
                    }
                    self.pending.pop_front();
                }
            }
        }

        // queue is drained and nothing is connecting
        if let Some(mut req) = self.connect_req.take() {
            if self.services.any_connected() {
                req.reply(Ok(()));
            } else {
                let err = req
                    .last_error
                    .take()
                    .unwrap_or_else(|| Error::for_bearer(ErrorKind::ProfileUnavailable, req.bearer));
                req.reply(Err(err));
            }
        }
    }

    fn finish_connect(&mut self, result: Result<()>) {
        if let Some(mut req) = self.connect_req.take() {
            req.reply(result);
        }
    }

    /// Disconnects the device: cancels bonding and browse, signals all
    /// services, and forces the bearers down after a grace period.
    pub fn disconnect(&mut self, now: Instant, reply: Reply) {
        if self.disconnect_req.is_some() {
            return respond(reply, Err(Error::new(ErrorKind::InProgress)));
        }
        log::debug!("{}: disconnect requested", self.address);

        self.cancel_bonding_internal();
        self.cancel_browse();
        self.finish_connect(Err(Error::new(ErrorKind::Canceled)));
        if self.att_connected {
            self.ctx.adapter.close_att(self.address);
        }

        self.pending.clear();
        self.disconnect_services();

        self.ctx.watcher.disconnect_requested(self.address, self.temporary);

        if !self.trusted {
            self.disable_auto_connect = true;
            self.sync_auto_connect();
        }

        if self.is_connected() {
            self.disconn_timer = Some(now + DISCONNECT_GRACE);
            self.disconnect_req = Some(DisconnectRequest { reply: Some(reply) });
        } else {
            respond(reply, Ok(()));
        }
    }

    fn disconnect_services(&mut self) {
        let busy: Vec<(Uuid, Arc<dyn crate::profile::ProfileDriver>)> = self
            .services
            .iter()
            .filter(|s| matches!(s.state, ServiceState::Connecting | ServiceState::Connected))
            .map(|s| (s.uuid(), s.profile.driver.clone()))
            .collect();
        for (uuid, driver) in busy {
            self.services.set_state(&uuid, ServiceState::Disconnecting);
            if let Err(err) = driver.disconnect(self.address, uuid) {
                log::warn!("{}: disconnecting service {uuid} failed: {err}", self.address);
                self.services.set_state(&uuid, ServiceState::Disconnected);
            }
        }
    }

    /// Disconnects exactly one service.
    pub fn disconnect_profile(&mut self, uuid: Uuid, reply: Reply) {
        let Some(service) = self.services.get(&uuid) else {
            return respond(reply, Err(Error::new(ErrorKind::NotSupported)));
        };
        if service.state == ServiceState::Disconnected {
            return respond(reply, Err(Error::new(ErrorKind::NotConnected)));
        }
        let driver = service.profile.driver.clone();
        self.services.set_state(&uuid, ServiceState::Disconnecting);
        match driver.disconnect(self.address, uuid) {
            Ok(()) => respond(reply, Ok(())),
            Err(err) => {
                self.services.set_state(&uuid, ServiceState::Disconnected);
                respond(reply, Err(err));
            }
        }
    }

    /// Starts pairing, selecting a bearer and acquiring the caller's
    /// agent.
    pub fn pair(&mut self, agent: Option<Arc<dyn Agent>>, now: Instant, reply: Reply) {
        if !self.ctx.adapter.is_powered() {
            return respond(reply, Err(Error::new(ErrorKind::NotReady)));
        }
        if self.bonding.is_some() || self.browse.is_some() || self.connect_req.is_some() {
            return respond(reply, Err(Error::new(ErrorKind::InProgress)));
        }
        let Some(bearer) = bearer::select_pair_bearer(
            &self.bredr,
            &self.le,
            self.prefer_bearer,
            self.address_type,
            now,
        ) else {
            return respond(reply, Err(Error::new(ErrorKind::Failed)));
        };
        if self.bearer_state(bearer).bonded {
            return respond(reply, Err(Error::for_bearer(ErrorKind::AlreadyExists, bearer)));
        }

        let agent = agent.or_else(|| self.ctx.default_agent.clone());
        let pins = if self.legacy_pairing { self.ctx.config.legacy_pins.clone() } else { Vec::new() };
        let mut request = BondingRequest::new(
            bearer,
            self.bearer_address_type(bearer),
            agent,
            reply,
            pins,
            now,
        );
        request.begin_attempt(now);
        log::info!(
            "{}: pairing on {bearer} with io capability {}",
            self.address,
            request.io_cap
        );
        self.bonding = Some(request);
        self.start_bonding_attempt(now);
    }

    fn start_bonding_attempt(&mut self, _now: Instant) {
        let (bearer, io_cap) = match &self.bonding {
            Some(req) => (req.bearer, req.io_cap),
            None => return,
        };
        match bearer {
            Bearer::BrEdr => {
                if let Err(err) =
                    self.ctx.adapter.create_bonding(self.address, AddressType::BrEdr, io_cap)
                {
                    self.fail_bonding(err);
                }
            }
            Bearer::Le => {
                if !self.att_connected && self.ctx.config.le_connect_before_bonding {
                    // key exchange rides ATT, bring the link up first
                    if let Err(err) = self.ctx.adapter.open_att(
                        self.address,
                        self.bearer_address_type(Bearer::Le),
                        SecurityLevel::Low,
                    ) {
                        self.fail_bonding(err);
                    }
                } else {
                    self.start_le_key_exchange();
                }
            }
        }
    }

    fn start_le_key_exchange(&mut self) {
        let (io_cap, started) = match &self.bonding {
            Some(req) => (req.io_cap, req.exchange_started),
            None => return,
        };
        if started {
            return;
        }
        if let Some(req) = &mut self.bonding {
            req.exchange_started = true;
        }
        let result = if self.ctx.config.le_elevate_security {
            self.ctx.adapter.elevate_security(self.address, SecurityLevel::Medium)
        } else {
            self.ctx.adapter.create_bonding(
                self.address,
                self.bearer_address_type(Bearer::Le),
                io_cap,
            )
        };
        if let Err(err) = result {
            self.fail_bonding(err);
        }
    }

    fn fail_bonding(&mut self, err: Error) {
        if let Some(mut req) = self.bonding.take() {
            log::warn!("{}: bonding failed: {err}", self.address);
            req.reply(Err(err));
        }
    }

    fn cancel_bonding_internal(&mut self) {
        if let Some(mut req) = self.bonding.take() {
            if let Some(mut authr) = self.authr.take() {
                authr.cancel(&*self.ctx.adapter, self.address);
            }
            self.ctx.adapter.cancel_bonding(self.address, req.address_type);
            req.reply(Err(Error::new(ErrorKind::AuthenticationCanceled)));
        }
    }

    /// Cancels an in-flight bonding, or removes stored bonding when none
    /// is active.
    pub fn cancel_pairing(&mut self, reply: Reply) {
        if self.bonding.is_some() {
            self.cancel_bonding_internal();
            return respond(reply, Ok(()));
        }
        if self.is_paired() || self.is_bonded() {
            let was_paired = self.is_paired();
            let was_bonded = self.is_bonded();
            if self.bredr.paired {
                self.ctx.adapter.remove_bonding(self.address, AddressType::BrEdr);
            }
            if self.le.paired {
                self.ctx
                    .adapter
                    .remove_bonding(self.address, self.bearer_address_type(Bearer::Le));
            }
            self.bredr.set_paired(false);
            self.le.set_paired(false);
            self.keys.drop_le_keys();
            self.pending_paired = None;
            if was_paired {
                self.emit(DeviceProperty::Paired(false));
            }
            if was_bonded {
                self.emit(DeviceProperty::Bonded(false));
            }
            self.mark_info();
            return respond(reply, Ok(()));
        }
        respond(reply, Err(Error::new(ErrorKind::DoesNotExist)))
    }

    /// Blocks the device: all links are forced down, services are torn
    /// down and incoming connections are rejected.
    pub fn block(&mut self) -> Result<()> {
        if self.blocked {
            return Ok(());
        }
        self.ctx.adapter.block(self.address, self.address_type)?;

        self.cancel_bonding_internal();
        self.cancel_browse();
        self.finish_connect(Err(Error::new(ErrorKind::Canceled)));
        if let Some(mut authr) = self.authr.take() {
            authr.cancel(&*self.ctx.adapter, self.address);
        }
        self.pending.clear();
        self.disconnect_services();
        self.services.clear();
        if self.att_connected {
            self.ctx.adapter.close_att(self.address);
        }
        if self.bredr.connected {
            let _ = self.ctx.adapter.disconnect(self.address, AddressType::BrEdr);
        }
        if self.le.connected {
            let _ = self
                .ctx
                .adapter
                .disconnect(self.address, self.bearer_address_type(Bearer::Le));
        }

        self.blocked = true;
        self.emit(DeviceProperty::Blocked(true));
        self.promote();
        self.mark_info();
        log::info!("{}: blocked", self.address);
        Ok(())
    }

    /// Unblocks the device and re-probes profiles against its UUIDs.
    ///
    /// No services connect automatically as a result.
    pub fn unblock(&mut self) -> Result<()> {
        if !self.blocked {
            return Ok(());
        }
        self.ctx.adapter.unblock(self.address, self.address_type)?;
        self.blocked = false;
        self.emit(DeviceProperty::Blocked(false));
        self.probe_profiles();
        self.mark_info();
        log::info!("{}: unblocked", self.address);
        Ok(())
    }

    /// Sets the trusted flag. Trusting promotes a temporary device to
    /// persistent.
    pub fn set_trusted(&mut self, trusted: bool) -> Result<()> {
        if self.trusted == trusted {
            return Ok(());
        }
        self.trusted = trusted;
        self.emit(DeviceProperty::Trusted(trusted));
        if trusted {
            self.promote();
        }
        self.mark_info();
        Ok(())
    }

    /// Sets the alias. An empty string clears it back to the remote
    /// name.
    pub fn set_alias(&mut self, alias: &str) -> Result<()> {
        let new = if alias.is_empty() { None } else { Some(alias.to_string()) };
        if self.alias == new {
            return Ok(());
        }
        self.alias = new;
        self.emit(DeviceProperty::Alias(self.alias()));
        self.mark_info();
        Ok(())
    }

    /// Sets the remote-wake override.
    ///
    /// Fails with [Unsupported](ErrorKind::Unsupported) on temporary
    /// devices and [NotSupported](ErrorKind::NotSupported) when the
    /// kernel cannot wake on this device.
    pub fn set_wake_allowed(&mut self, allowed: bool) -> Result<()> {
        if self.temporary {
            return Err(Error::new(ErrorKind::Unsupported));
        }
        if !self.wake_supported() {
            return Err(Error::new(ErrorKind::NotSupported));
        }
        self.wake_override = if allowed { WakeOverride::Enabled } else { WakeOverride::Disabled };
        self.mark_info();
        self.apply_wake_override()
    }

    fn apply_wake_override(&mut self) -> Result<()> {
        let desired = match self.wake_override {
            WakeOverride::Default => return Ok(()),
            WakeOverride::Enabled => true,
            WakeOverride::Disabled => false,
        };
        if !self.wake_supported() {
            return Ok(());
        }
        if self.current_flags.remote_wakeup == desired || self.pending_flags.is_some() {
            return Ok(());
        }
        let mut flags = self.current_flags;
        flags.remote_wakeup = desired;
        self.pending_flags = Some(flags);
        self.ctx.adapter.set_device_flags(self.address, self.address_type, flags)
    }

    /// Sets the preferred bearer of a dual-mode device.
    pub fn set_preferred_bearer(&mut self, prefer: PreferredBearer) -> Result<()> {
        if !self.is_dual_mode() {
            return Err(Error::new(ErrorKind::NotSupported));
        }
        if self.prefer_bearer == prefer {
            return Ok(());
        }
        self.prefer_bearer = prefer;
        self.bredr.prefer = prefer == PreferredBearer::BrEdr;
        self.le.prefer = prefer == PreferredBearer::Le;
        self.sync_auto_connect();
        self.emit(DeviceProperty::PreferredBearer(prefer));
        self.mark_info();
        Ok(())
    }

    /// Enables or disables passive-scan auto-connect for the device.
    pub fn set_auto_connect(&mut self, enable: bool) {
        if self.auto_connect == enable {
            return;
        }
        self.auto_connect = enable;
        if enable {
            self.disable_auto_connect = false;
        }
        self.sync_auto_connect();
    }

    fn sync_auto_connect(&self) {
        // BR/EDR preference and address privacy both keep the device off
        // the passive-scan list
        let effective = self.auto_connect
            && !self.disable_auto_connect
            && self.le.present
            && self.prefer_bearer != PreferredBearer::BrEdr
            && !self.is_private_address()
            && !self.rpa;
        let address_type = self.bearer_address_type(Bearer::Le);
        if effective {
            self.ctx.adapter.add_auto_connect(self.address, address_type);
        } else {
            self.ctx.adapter.remove_auto_connect(self.address, address_type);
        }
    }

    /// Promotes or demotes the device between temporary and persistent.
    pub fn set_temporary(&mut self, temporary: bool, now: Instant) {
        if temporary {
            self.demote(now);
        } else {
            self.promote();
        }
    }

    fn promote(&mut self) {
        if !self.temporary {
            return;
        }
        self.temporary = false;
        self.temporary_timer = None;
        log::debug!("{}: promoted to persistent", self.address);
        self.mark_info();
        self.mark_cache();
    }

    fn demote(&mut self, now: Instant) {
        if self.temporary {
            return;
        }
        self.temporary = true;
        self.temporary_timer = Some(now + self.ctx.config.temporary_timeout);
        self.store_pending = false;
        if let Err(err) = self.ctx.store.remove_device(self.address) {
            log::warn!("{}: removing stored state failed: {err}", self.address);
        }
        log::debug!("{}: reverted to temporary", self.address);
    }

    // ===========================================================================================
    // Browse engine
    // ===========================================================================================

    fn begin_browse(&mut self, bearer: Bearer, reply: Option<Reply>, now: Instant) {
        if self.browse.is_some() {
            if let Some(reply) = reply {
                respond(reply, Err(Error::new(ErrorKind::InProgress)));
            }
            return;
        }
        log::debug!("{}: starting {bearer} discovery", self.address);
        match bearer {
            Bearer::BrEdr => {
                let mut request = BrowseRequest::sdp(reply);
                let Some(uuid) = request.next_sdp_uuid() else {
                    return;
                };
                match self.ctx.adapter.sdp_search(self.address, uuid) {
                    Ok(()) => self.browse = Some(request),
                    Err(err) => {
                        request.reply(Err(err.clone()));
                        self.finish_connect(Err(err));
                    }
                }
            }
            Bearer::Le => {
                let request = BrowseRequest::gatt(reply);
                if self.gatt_ready {
                    let outcome = BrowseRequest::gatt_outcome(self.primaries.clone());
                    self.browse = Some(request);
                    self.finish_browse(Ok(outcome), now);
                } else if !self.att_connected {
                    match self.ctx.adapter.open_att(
                        self.address,
                        self.bearer_address_type(Bearer::Le),
                        SecurityLevel::Low,
                    ) {
                        Ok(()) => self.browse = Some(request),
                        Err(err) => {
                            let mut request = request;
                            request.reply(Err(err.clone()));
                            self.finish_connect(Err(err));
                        }
                    }
                } else {
                    // the GATT client is coming up, wait for ready
                    self.browse = Some(request);
                }
            }
        }
    }

    fn cancel_browse(&mut self) {
        if let Some(mut request) = self.browse.take() {
            request.canceled = true;
            match request.kind {
                BrowseKind::Sdp { .. } => self.ctx.adapter.cancel_sdp_search(self.address),
                BrowseKind::Gatt => self.ctx.adapter.close_att(self.address),
            }
            request.reply(Err(Error::new(ErrorKind::Canceled)));
            log::debug!("{}: discovery canceled", self.address);
        }
    }

    fn finish_browse(&mut self, result: Result<BrowseOutcome>, now: Instant) {
        let Some(mut request) = self.browse.take() else {
            return;
        };
        let bearer = request.bearer;
        match result {
            Ok(outcome) => {
                let uuids_before = self.uuids_observable();
                let resolved_before = self.services_resolved();

                self.uuids.extend(outcome.uuids.iter().copied());
                if !outcome.primaries.is_empty() {
                    // adopt the new database outline only on success
                    self.primaries = outcome.primaries.clone();
                }
                if let Some(id) = outcome.device_id {
                    if self.device_id != Some(id) {
                        self.device_id = Some(id);
                        self.emit(DeviceProperty::Modalias(id.modalias().to_string()));
                    }
                }
                if !outcome.records.is_empty() {
                    self.sdp_records = outcome.records;
                }
                self.bearer_mut(bearer).svc_resolved = true;
                self.probe_profiles();

                if self.uuids_observable() != uuids_before {
                    self.emit(DeviceProperty::Uuids(self.uuids_observable()));
                }
                if self.services_resolved() != resolved_before {
                    self.emit(DeviceProperty::ServicesResolved(self.services_resolved()));
                }
                if let Some(_pending) = self.pending_paired.take() {
                    self.emit(DeviceProperty::Paired(true));
                }
                self.mark_info();
                self.mark_cache();
                log::debug!(
                    "{}: {bearer} discovery finished with {} service(s)",
                    self.address,
                    self.uuids.len()
                );

                request.reply(Ok(()));
                if self.connect_req.is_some() {
                    self.connect_next_services(bearer, now);
                }
            }
            Err(err) => {
                log::warn!("{}: {bearer} discovery failed: {err}", self.address);
                request.reply(Err(err.clone()));
                self.finish_connect(Err(err));
            }
        }
    }

    fn probe_profiles(&mut self) {
        let matched = self.ctx.profiles.probe(self.uuids.iter());
        let allow = self.ctx.adapter.allowed_uuids();
        self.services.rebuild(matched, allow.as_ref(), &self.primaries);
    }

    // ===========================================================================================
    // Event intake
    // ===========================================================================================

    /// Applies one inbound event.
    pub fn handle_event(&mut self, event: DeviceEvent, now: Instant) {
        match event {
            DeviceEvent::Found(report) => self.handle_found(report, now),
            DeviceEvent::Connected { bearer, address_type, initiator } => {
                self.handle_connected(bearer, address_type, initiator, now)
            }
            DeviceEvent::Disconnected { bearer, reason } => {
                self.handle_disconnected(bearer, reason, now)
            }
            DeviceEvent::BondingComplete { bearer, status } => {
                self.handle_bonding_complete(bearer, status, now)
            }
            DeviceEvent::Paired { bearer, bonded } => {
                self.handle_paired(bearer, bonded, now);
            }
            DeviceEvent::Unpaired { bearer } => self.handle_unpaired(bearer),
            DeviceEvent::NewLongTermKey { key, store_hint } => {
                let sets_changed = self.keys.set_ltk(key);
                if sets_changed {
                    self.emit(DeviceProperty::Sets(self.sets()));
                }
                if store_hint {
                    self.mark_info();
                }
            }
            DeviceEvent::NewSignatureKey { key, local, store_hint } => {
                if local {
                    self.keys.set_local_csrk(key);
                } else {
                    self.keys.set_remote_csrk(key);
                }
                if store_hint {
                    self.mark_info();
                }
            }
            DeviceEvent::NewSetIdentityKey { key } => {
                if self.keys.add_sirk(key) {
                    self.emit(DeviceProperty::Sets(self.sets()));
                }
                self.mark_info();
            }
            DeviceEvent::SignedWriteReceived { counter } => {
                match self.keys.receive_remote_counter(counter) {
                    CounterUpdate::Accepted => self.mark_info(),
                    CounterUpdate::Rejected => {
                        log::warn!(
                            "{}: rejected signed write with stale counter {counter}",
                            self.address
                        );
                    }
                }
            }
            DeviceEvent::SdpResult { uuid, records } => self.handle_sdp_result(uuid, records, now),
            DeviceEvent::SdpFailed { fault } => self.handle_sdp_failed(fault, now),
            DeviceEvent::AttConnected => self.handle_att_connected(),
            DeviceEvent::AttFailed { fault } => self.handle_att_failed(fault, now),
            DeviceEvent::AttClosed => {
                self.att_connected = false;
                self.gatt_ready = false;
            }
            DeviceEvent::GattReady { primaries } => self.handle_gatt_ready(primaries, now),
            DeviceEvent::GattFailed { fault } => {
                if matches!(self.browse, Some(BrowseRequest { kind: BrowseKind::Gatt, .. })) {
                    self.finish_browse(Err(fault.to_error(Bearer::Le)), now);
                }
            }
            DeviceEvent::GattServiceChanged { start, end } => {
                self.handle_gatt_service_changed(start, end, now)
            }
            DeviceEvent::ServiceChangedSubscribed { bearer, ccc } => {
                match bearer {
                    Bearer::Le => self.ccc_le = Some(ccc),
                    Bearer::BrEdr => self.ccc_bredr = Some(ccc),
                }
                self.mark_info();
            }
            DeviceEvent::FlagsChanged { supported, current } => {
                self.handle_flags_changed(supported, current)
            }
            DeviceEvent::Authentication(auth) => self.handle_authentication(auth),
            DeviceEvent::AgentReply(reply) => self.handle_agent_reply(reply),
            DeviceEvent::NameResolved { name } => {
                self.name_resolve_failed_at = None;
                if self.cache.set_name(&name) {
                    self.emit(DeviceProperty::Name(name));
                    if self.alias.is_none() {
                        self.emit(DeviceProperty::Alias(self.alias()));
                    }
                    self.mark_cache();
                }
            }
            DeviceEvent::NameResolveFailed => {
                self.name_resolve_failed_at = Some(now);
                self.mark_cache();
            }
            DeviceEvent::ProfileConnected { uuid, result } => {
                self.handle_profile_connected(uuid, result, now)
            }
            DeviceEvent::ProfileDisconnected { uuid } => {
                self.services.set_state(&uuid, ServiceState::Disconnected);
            }
        }
    }

    fn handle_found(&mut self, report: AdvReport, now: Instant) {
        let bearer = report.address_type.bearer();
        self.bearer_mut(bearer).seen(now, report.connectable);
        if report.address_type != AddressType::BrEdr {
            self.rpa = report.rpa;
        }
        if let Some(legacy) = report.legacy_pairing {
            if self.legacy_pairing != legacy {
                self.legacy_pairing = legacy;
                self.emit(DeviceProperty::LegacyPairing(legacy));
            }
        }

        let icon_before = self.icon();
        let alias_before = self.alias();
        let changed = self.cache.merge(&report);
        for field in &changed {
            match field {
                CacheField::Name => {
                    self.emit(DeviceProperty::Name(
                        self.cache.name.clone().unwrap_or_default(),
                    ));
                    self.mark_cache();
                    self.mark_info();
                }
                CacheField::Class => {
                    if let Some(class) = self.cache.class {
                        self.emit(DeviceProperty::Class(class));
                    }
                    self.mark_info();
                }
                CacheField::Appearance => {
                    if let Some(appearance) = self.cache.appearance {
                        self.emit(DeviceProperty::Appearance(appearance));
                    }
                    self.mark_info();
                }
                CacheField::TxPower => {
                    if let Some(tx_power) = self.cache.tx_power {
                        self.emit(DeviceProperty::TxPower(tx_power));
                    }
                }
                CacheField::Rssi => {
                    if let Some(rssi) = self.cache.rssi {
                        self.emit(DeviceProperty::Rssi(rssi));
                    }
                }
                CacheField::Flags => {
                    self.emit(DeviceProperty::AdvertisingFlags(self.cache.flags.clone()));
                }
                CacheField::EirUuids => {
                    if self.uuids.is_empty() && !self.bredr.svc_resolved && !self.le.svc_resolved {
                        self.emit(DeviceProperty::Uuids(self.uuids_observable()));
                    }
                }
                CacheField::ManufacturerData => {
                    self.emit(DeviceProperty::ManufacturerData(
                        self.cache.manufacturer_data.clone(),
                    ));
                }
                CacheField::ServiceData => {
                    self.emit(DeviceProperty::ServiceData(self.cache.service_data.clone()));
                }
                CacheField::AdvertisingData => {
                    self.emit(DeviceProperty::AdvertisingData(
                        self.cache.advertising_data.clone(),
                    ));
                }
            }
        }
        if self.alias() != alias_before {
            self.emit(DeviceProperty::Alias(self.alias()));
        }
        if self.icon() != icon_before {
            if let Some(icon) = self.icon() {
                self.emit(DeviceProperty::Icon(icon.to_string()));
            }
        }

        // sighting keeps a temporary device alive
        if self.temporary {
            self.temporary_timer = Some(now + self.ctx.config.temporary_timeout);
        }
    }

    fn handle_connected(
        &mut self, bearer: Bearer, address_type: AddressType, initiator: bool, now: Instant,
    ) {
        let connected_before = self.is_connected();
        {
            let state = self.bearer_mut(bearer);
            state.present = true;
            state.connected = true;
            state.initiator = initiator;
            state.last_used = Some(now);
            state.last_seen = Some(now);
        }
        self.conn_address = Some((self.address, address_type));
        log::debug!(
            "{}: connected on {bearer} ({})",
            self.address,
            if initiator { "initiator" } else { "acceptor" }
        );
        if !connected_before {
            self.emit(DeviceProperty::Connected(true));
        }
        if self.temporary {
            self.temporary_timer = Some(now + self.ctx.config.temporary_timeout);
        }
        self.mark_info();

        if bearer == Bearer::Le {
            let plain_connect_waiting = self
                .connect_req
                .as_ref()
                .map_or(false, |r| r.bearer == Bearer::Le && r.profile.is_none());
            if plain_connect_waiting {
                // the LE path succeeds when the link is up
                self.finish_connect(Ok(()));
            }
            if !self.le.svc_resolved && self.browse.is_none() {
                self.begin_browse(Bearer::Le, None, now);
            }
        }
    }

    fn handle_disconnected(&mut self, bearer: Bearer, reason: DisconnectReason, now: Instant) {
        let connected_before = self.is_connected();
        let resolved_before = self.services_resolved();
        let paired_before = self.is_paired();
        let bonded_before = self.is_bonded();

        if !self.bearer_state(bearer).connected {
            log::debug!("{}: stray disconnect on {bearer}", self.address);
            return;
        }
        {
            let state = self.bearer_mut(bearer);
            state.connected = false;
            state.svc_resolved = false;
            state.initiator = false;
        }
        if bearer == Bearer::Le {
            self.att_connected = false;
            self.gatt_ready = false;
        }
        log::debug!("{}: disconnected on {bearer} ({reason})", self.address);

        // a bearer that was paired but never bonded loses its pairing on
        // link loss
        let drop_pairing = {
            let state = self.bearer_state(bearer);
            state.paired && !state.bonded
        };
        if drop_pairing {
            self.bearer_mut(bearer).set_paired(false);
            self.pending_paired = None;
            if bearer == Bearer::Le {
                self.keys.drop_le_keys();
            }
            self.ctx.adapter.remove_bonding(self.address, self.bearer_address_type(bearer));
            self.mark_info();
        }

        if !self.is_connected() {
            self.conn_address = None;
            let states: Vec<Uuid> = self
                .services
                .iter()
                .filter(|s| s.state != ServiceState::Disconnected)
                .map(|s| s.uuid())
                .collect();
            for uuid in states {
                self.services.set_state(&uuid, ServiceState::Disconnected);
            }
            self.pending.clear();
            self.disconn_timer = None;
            if let Some(mut req) = self.disconnect_req.take() {
                if let Some(reply) = req.reply.take() {
                    respond(reply, Ok(()));
                }
            }
        }

        let connect_on_bearer = self.connect_req.as_ref().map_or(false, |r| r.bearer == bearer);
        if connect_on_bearer {
            self.finish_connect(Err(Error::for_bearer(
                ErrorKind::ConnectionAttemptFailed,
                bearer,
            )));
        }

        self.ctx.watcher.disconnected(self.address, reason);
        if self.services_resolved() != resolved_before {
            self.emit(DeviceProperty::ServicesResolved(false));
        }
        if self.is_connected() != connected_before {
            self.emit(DeviceProperty::Connected(false));
        }
        if self.is_paired() != paired_before {
            self.emit(DeviceProperty::Paired(false));
        }
        if self.is_bonded() != bonded_before {
            self.emit(DeviceProperty::Bonded(false));
        }

        if self.temporary {
            self.temporary_timer = Some(now + self.ctx.config.temporary_timeout);
        }
    }

    fn handle_paired(&mut self, bearer: Bearer, bonded: bool, now: Instant) {
        let paired_before = self.is_paired();
        let bonded_before = self.is_bonded();
        {
            let state = self.bearer_mut(bearer);
            if bonded {
                state.set_bonded(true);
            } else {
                state.paired = true;
            }
        }
        log::debug!(
            "{}: {} on {bearer}",
            self.address,
            if bonded { "bonded" } else { "paired" }
        );

        if bonded {
            self.promote();
        }
        self.mark_info();

        if !paired_before {
            // LE pairing completes before its GATT database is known;
            // hold the Paired signal until discovery finishes
            if bearer == Bearer::Le && !self.le.svc_resolved {
                self.pending_paired = Some(bearer);
            } else {
                self.emit(DeviceProperty::Paired(true));
            }
        }
        if bonded && !bonded_before {
            self.emit(DeviceProperty::Bonded(true));
        }

        // peer-initiated pairing defers discovery briefly
        if self.bonding.is_none()
            && self.browse.is_none()
            && !self.bearer_state(bearer).svc_resolved
        {
            self.discov_timer = Some(now + DISCOVERY_DEFER);
        }
    }

    fn handle_unpaired(&mut self, bearer: Bearer) {
        let paired_before = self.is_paired();
        let bonded_before = self.is_bonded();
        self.bearer_mut(bearer).set_paired(false);
        if bearer == Bearer::Le {
            self.keys.drop_le_keys();
        }
        self.pending_paired = None;
        if self.is_paired() != paired_before {
            self.emit(DeviceProperty::Paired(false));
        }
        if self.is_bonded() != bonded_before {
            self.emit(DeviceProperty::Bonded(false));
        }
        self.mark_info();
    }

    fn handle_bonding_complete(&mut self, bearer: Bearer, status: BondingStatus, now: Instant) {
        let Some(mut request) = self.bonding.take() else {
            log::debug!("{}: unsolicited bonding result {status:?}", self.address);
            return;
        };
        if request.bearer != bearer {
            log::warn!(
                "{}: bonding result for {bearer} while bonding on {}",
                self.address,
                request.bearer
            );
            self.bonding = Some(request);
            return;
        }

        match status {
            BondingStatus::Success => {
                log::info!(
                    "{}: bonding on {bearer} succeeded after {:?} ({} attempt(s))",
                    self.address,
                    request.elapsed(now),
                    request.attempts
                );
                self.handle_paired(bearer, true, now);
                if let Err(err) = self.apply_wake_override() {
                    log::warn!("{}: applying wake override failed: {err}", self.address);
                }
                request.reply(Ok(()));
                if !self.bearer_state(bearer).svc_resolved && self.browse.is_none() {
                    self.discov_timer = None;
                    self.begin_browse(bearer, None, now);
                }
            }
            status
                if status.is_transient()
                    && request.can_retry(self.ctx.config.max_bonding_attempts) =>
            {
                log::info!(
                    "{}: bonding attempt {} failed with {status:?} after {:?}, retrying",
                    self.address,
                    request.attempts,
                    request.attempt_elapsed(now),
                );
                request.retry_at = Some(now + bonding::BONDING_RETRY_DELAY);
                self.bonding = Some(request);
            }
            status => {
                if let Some(mut authr) = self.authr.take() {
                    authr.cancel(&*self.ctx.adapter, self.address);
                }
                let err = status.to_error(bearer);
                log::warn!("{}: bonding on {bearer} failed: {err}", self.address);
                request.reply(Err(err));
                if status == BondingStatus::AuthFailed {
                    let _ = self
                        .ctx
                        .adapter
                        .disconnect(self.address, self.bearer_address_type(bearer));
                }
                if !self.is_connected() && !self.is_bonded() && !self.trusted {
                    self.demote(now);
                }
            }
        }
    }

    fn handle_sdp_result(&mut self, uuid: Uuid, records: Vec<SdpRecord>, now: Instant) {
        let Some(mut request) = self.browse.take() else {
            log::debug!("{}: unsolicited SDP result for {uuid}", self.address);
            return;
        };
        if request.canceled {
            return;
        }
        if !matches!(request.kind, BrowseKind::Sdp { .. }) {
            self.browse = Some(request);
            return;
        }
        log::trace!("{}: {} record(s) for {uuid}", self.address, records.len());
        request.push_records(records);
        match request.next_sdp_uuid() {
            Some(next) => match self.ctx.adapter.sdp_search(self.address, next) {
                Ok(()) => self.browse = Some(request),
                Err(err) => {
                    self.browse = Some(request);
                    self.finish_browse(Err(err), now);
                }
            },
            None => {
                let outcome = request.sdp_outcome();
                self.browse = Some(request);
                self.finish_browse(Ok(outcome), now);
            }
        }
    }

    fn handle_sdp_failed(&mut self, fault: BrowseFault, now: Instant) {
        let Some(request) = &self.browse else {
            return;
        };
        if !matches!(request.kind, BrowseKind::Sdp { .. }) {
            return;
        }

        if fault == BrowseFault::HostDown && self.le.present && !self.le.connected {
            // the classic page failed but the device has an LE bearer:
            // fall through to an LE connect instead of failing the caller
            log::info!("{}: br/edr host down, falling back to le", self.address);
            let mut old = match self.browse.take() {
                Some(old) => old,
                None => return,
            };
            old.canceled = true;
            self.ctx.adapter.cancel_sdp_search(self.address);
            let reply = old.take_reply();
            if let Some(req) = &mut self.connect_req {
                req.bearer = Bearer::Le;
            }
            let request = BrowseRequest::gatt(reply);
            match self.ctx.adapter.open_att(
                self.address,
                self.bearer_address_type(Bearer::Le),
                SecurityLevel::Low,
            ) {
                Ok(()) => self.browse = Some(request),
                Err(err) => {
                    let mut request = request;
                    request.reply(Err(err.clone()));
                    self.finish_connect(Err(err));
                }
            }
            return;
        }

        self.finish_browse(Err(fault.to_error(Bearer::BrEdr)), now);
    }

    fn handle_att_connected(&mut self) {
        self.att_connected = true;
        let exchange_waiting = self
            .bonding
            .as_ref()
            .map_or(false, |r| r.bearer == Bearer::Le && !r.exchange_started);
        if exchange_waiting {
            self.start_le_key_exchange();
        }
    }

    fn handle_att_failed(&mut self, fault: BrowseFault, now: Instant) {
        self.att_connected = false;
        let err = fault.to_error(Bearer::Le);
        if matches!(self.browse, Some(BrowseRequest { kind: BrowseKind::Gatt, .. })) {
            self.finish_browse(Err(err.clone()), now);
        }
        let bonding_waiting = self
            .bonding
            .as_ref()
            .map_or(false, |r| r.bearer == Bearer::Le && !r.exchange_started);
        if bonding_waiting {
            self.fail_bonding(err.clone());
        }
        let connect_waiting = self.connect_req.as_ref().map_or(false, |r| r.bearer == Bearer::Le);
        if connect_waiting {
            self.finish_connect(Err(err));
        }
    }

    fn handle_gatt_ready(&mut self, primaries: Vec<GattPrimary>, now: Instant) {
        self.gatt_ready = true;
        if !matches!(self.browse, Some(BrowseRequest { kind: BrowseKind::Gatt, .. })) {
            // unsolicited readiness after a reconnect still resolves
            // services
            if self.browse.is_some() {
                return;
            }
            self.browse = Some(BrowseRequest::gatt(None));
        }
        self.finish_browse(Ok(BrowseRequest::gatt_outcome(primaries)), now);
    }

    fn handle_gatt_service_changed(&mut self, start: u16, end: u16, now: Instant) {
        log::debug!(
            "{}: attribute range 0x{start:04x}..0x{end:04x} changed",
            self.address
        );
        let resolved_before = self.services_resolved();
        self.le.svc_resolved = false;
        self.gatt_ready = false;
        if self.services_resolved() != resolved_before {
            self.emit(DeviceProperty::ServicesResolved(false));
        }
        if self.le.connected && self.browse.is_none() && self.bonding.is_none() {
            self.discov_timer = Some(now + DISCOVERY_DEFER);
        }
    }

    fn handle_flags_changed(&mut self, supported: DeviceFlags, current: DeviceFlags) {
        let wake_before = self.wake_allowed();
        self.supported_flags = supported;
        self.current_flags = current;
        self.pending_flags = None;
        if self.wake_allowed() != wake_before && self.wake_supported() {
            self.emit(DeviceProperty::WakeAllowed(self.wake_allowed()));
            self.mark_info();
        }
        // re-assert the override; a lost race with the kernel converges
        // here
        if let Err(err) = self.apply_wake_override() {
            log::warn!("{}: applying wake override failed: {err}", self.address);
        }
    }

    fn handle_authentication(&mut self, auth: AuthEvent) {
        if self.authr.is_some() {
            log::warn!("{}: authentication request while one is pending", self.address);
            return;
        }
        let agent = self
            .bonding
            .as_ref()
            .and_then(|b| b.agent.clone())
            .or_else(|| self.ctx.default_agent.clone());
        let address_type = self
            .bonding
            .as_ref()
            .map(|b| b.address_type)
            .unwrap_or(self.address_type);

        let kind = match auth {
            AuthEvent::PinCode { secure } => {
                if !secure {
                    if let Some(pin) = self.bonding.as_mut().and_then(|b| b.next_pin()) {
                        log::debug!("{}: replying with fallback pin", self.address);
                        self.ctx.adapter.pin_code_reply(self.address, address_type, Some(pin));
                        return;
                    }
                }
                AuthKind::PinCode { secure }
            }
            AuthEvent::Passkey => AuthKind::Passkey,
            AuthEvent::Confirm { passkey, confirm_hint } => {
                if confirm_hint && self.bonding.is_some() {
                    // the local pair intent is the consent
                    self.ctx.adapter.confirm_reply(self.address, address_type, true);
                    return;
                }
                if confirm_hint && self.is_paired() {
                    match self.ctx.config.just_works_repairing {
                        JustWorksRepairing::Never => {
                            log::info!(
                                "{}: rejecting just-works re-pairing by policy",
                                self.address
                            );
                            self.ctx.adapter.confirm_reply(self.address, address_type, false);
                            return;
                        }
                        JustWorksRepairing::Always => {
                            self.ctx.adapter.confirm_reply(self.address, address_type, true);
                            return;
                        }
                        JustWorksRepairing::Ask => {}
                    }
                }
                AuthKind::Confirm { passkey }
            }
            AuthEvent::DisplayPasskey { passkey, entered } => {
                AuthKind::DisplayPasskey { passkey, entered }
            }
            AuthEvent::DisplayPinCode { pincode } => AuthKind::DisplayPinCode { pincode },
        };

        let mut request = AuthRequest::new(kind, agent, address_type);
        if request.dispatch(&*self.ctx.adapter, self.address) {
            self.authr = Some(request);
        }
    }

    fn handle_agent_reply(&mut self, reply: AgentReply) {
        let Some(mut request) = self.authr.take() else {
            log::debug!("{}: agent reply without pending request", self.address);
            return;
        };
        request.apply_reply(&*self.ctx.adapter, self.address, reply);
        if !request.is_done() {
            self.authr = Some(request);
        }
    }

    fn handle_profile_connected(&mut self, uuid: Uuid, result: Result<()>, now: Instant) {
        match &result {
            Ok(()) => {
                log::debug!("{}: service {uuid} connected", self.address);
                self.services.set_state(&uuid, ServiceState::Connected);
                if self.temporary {
                    self.temporary_timer = Some(now + self.ctx.config.temporary_timeout);
                }
                // at least one connected service makes the request a
                // success
                self.finish_connect(Ok(()));
            }
            Err(err) => {
                log::warn!("{}: service {uuid} failed to connect: {err}", self.address);
                self.services.set_state(&uuid, ServiceState::Disconnected);
                if let Some(req) = &mut self.connect_req {
                    req.last_error = Some(err.clone());
                }
            }
        }
        if self.pending.front() == Some(&uuid) {
            self.pending.pop_front();
        }
        if !self.pending.is_empty() || self.connect_req.is_some() {
            self.advance_pending(now);
        }
    }

    // ===========================================================================================
    // Timers
    // ===========================================================================================

    /// Earliest pending timer deadline.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for deadline in [
            self.disconn_timer,
            self.discov_timer,
            self.temporary_timer,
            self.bonding.as_ref().and_then(|b| b.retry_at),
        ]
        .into_iter()
        .flatten()
        {
            next = Some(match next {
                Some(current) if current <= deadline => current,
                _ => deadline,
            });
        }
        next
    }

    /// Fires all timers that are due.
    ///
    /// Returns `true` when the device expired as temporary and must be
    /// removed from the registry.
    pub fn handle_timeout(&mut self, now: Instant) -> bool {
        if due(self.disconn_timer, now) {
            self.disconn_timer = None;
            log::debug!("{}: disconnect grace expired, forcing bearers down", self.address);
            if self.bredr.connected {
                let _ = self.ctx.adapter.disconnect(self.address, AddressType::BrEdr);
            }
            if self.le.connected {
                let _ = self
                    .ctx
                    .adapter
                    .disconnect(self.address, self.bearer_address_type(Bearer::Le));
            }
        }

        if due(self.discov_timer, now) {
            self.discov_timer = None;
            if self.browse.is_none() && self.bonding.is_none() {
                let bearer = if self.le.connected {
                    Some(Bearer::Le)
                } else if self.bredr.connected {
                    Some(Bearer::BrEdr)
                } else {
                    None
                };
                if let Some(bearer) = bearer {
                    self.begin_browse(bearer, None, now);
                }
            }
        }

        let retry_due = self.bonding.as_ref().map_or(false, |b| due(b.retry_at, now));
        if retry_due {
            if let Some(request) = &mut self.bonding {
                request.begin_attempt(now);
            }
            log::debug!("{}: retrying bonding", self.address);
            self.start_bonding_attempt(now);
        }

        if due(self.temporary_timer, now) {
            if self.browse.is_some() || self.bonding.is_some() || self.services.busy()
                || self.is_connected()
            {
                // activity extends the lifetime for another period
                self.temporary_timer = Some(now + self.ctx.config.temporary_timeout);
            } else {
                log::debug!("{}: temporary device expired", self.address);
                self.temporary_timer = None;
                return true;
            }
        }

        false
    }

    // ===========================================================================================
    // Persistence
    // ===========================================================================================

    /// A store flush is pending.
    pub fn is_dirty(&self) -> bool {
        self.store_pending || self.cache_pending
    }

    /// Writes pending state to the store.
    ///
    /// Called by the engine at its idle tick; write errors are logged,
    /// not propagated.
    pub fn flush_store(&mut self) {
        if self.store_pending {
            self.store_pending = false;
            if self.should_store() {
                let info = self.build_info();
                if let Err(err) = self.ctx.store.store_info(self.address, &info) {
                    log::error!("{}: storing info failed: {err}", self.address);
                }
            }
        }
        if self.cache_pending {
            self.cache_pending = false;
            if !self.is_private_address() {
                let cached = self.build_cache();
                if let Err(err) = self.ctx.store.store_cache(self.address, &cached) {
                    log::error!("{}: storing cache failed: {err}", self.address);
                }
            }
        }
    }

    fn build_info(&self) -> DeviceInfo {
        let mut technologies = Vec::new();
        if self.bredr.present {
            technologies.push("BR/EDR".to_string());
        }
        if self.le.present {
            technologies.push("LE".to_string());
        }
        let last_used_bearer = match (self.bredr.last_used, self.le.last_used) {
            (Some(b), Some(l)) => Some(if b >= l { Bearer::BrEdr } else { Bearer::Le }),
            (Some(_), None) => Some(Bearer::BrEdr),
            (None, Some(_)) => Some(Bearer::Le),
            (None, None) => None,
        };

        DeviceInfo {
            general: store::General {
                name: self.cache.name.clone(),
                alias: self.alias.clone(),
                class: self.cache.class,
                appearance: self.cache.appearance,
                supported_technologies: technologies,
                address_type: self.address_type.to_string(),
                preferred_bearer: self
                    .is_dual_mode()
                    .then(|| self.prefer_bearer.to_string()),
                last_used_bearer: last_used_bearer.map(|b| b.to_string()),
                trusted: self.trusted,
                blocked: self.blocked,
                cable_pairing: self.cable_pairing,
                wake_allowed: self.wake_allowed(),
                services: self.uuids.iter().map(|u| u.to_string()).collect(),
            },
            device_id: self.device_id.map(|id| store::DeviceIdGroup {
                source: id.source,
                vendor: id.vendor,
                product: id.product,
                version: id.version,
            }),
            long_term_key: self.keys.ltk().map(|ltk| store::LongTermKeyGroup {
                key: store::key_to_hex(&ltk.value),
                central: ltk.central,
                enc_size: ltk.enc_size,
            }),
            local_signature_key: self.keys.local_csrk().map(|csrk| store::SignatureKeyGroup {
                key: store::key_to_hex(&csrk.value),
                counter: csrk.counter,
                authenticated: csrk.authenticated,
            }),
            remote_signature_key: self.keys.remote_csrk().map(|csrk| store::SignatureKeyGroup {
                key: store::key_to_hex(&csrk.value),
                counter: csrk.counter,
                authenticated: csrk.authenticated,
            }),
            set_identity_resolving_keys: self
                .keys
                .sirks()
                .iter()
                .map(|sirk| store::SetIdentityKeyGroup {
                    key: store::key_to_hex(&sirk.value),
                    size: sirk.size,
                    rank: sirk.rank,
                    encrypted: sirk.encrypted,
                })
                .collect(),
            service_changed: (self.ccc_le.is_some() || self.ccc_bredr.is_some()).then(|| {
                store::ServiceChangedGroup { ccc_le: self.ccc_le, ccc_bredr: self.ccc_bredr }
            }),
        }
    }

    fn build_cache(&self) -> DeviceCache {
        DeviceCache {
            name: self.cache.name.clone(),
            name_resolve_failed: self
                .name_resolve_failed_at
                .map(|at| at.saturating_duration_since(self.created).as_secs()),
            service_records: self
                .sdp_records
                .iter()
                .map(|record| store::ServiceRecordEntry {
                    handle: record.handle,
                    uuids: record.uuids.iter().map(|u| u.to_string()).collect(),
                    value: hex::encode(&record.raw),
                })
                .collect(),
            attributes: self
                .primaries
                .iter()
                .map(|primary| store::AttributeEntry {
                    uuid: primary.uuid.to_string(),
                    start: primary.start,
                    end: primary.end,
                })
                .collect(),
        }
    }

    /// Remote name resolution is wanted and its retry delay has passed.
    pub fn should_resolve_name(&self, now: Instant) -> bool {
        self.cache.name.is_none()
            && self.name_resolve_failed_at.map_or(true, |at| {
                now.saturating_duration_since(at) >= self.ctx.config.name_resolve_retry_delay
            })
    }

    // ===========================================================================================
    // Removal
    // ===========================================================================================

    /// Tears the device down for removal: cancels everything in flight,
    /// disconnects services and bearers and optionally purges storage.
    pub(crate) fn teardown(&mut self, purge_storage: bool) {
        self.cancel_bonding_internal();
        self.cancel_browse();
        self.finish_connect(Err(Error::new(ErrorKind::Canceled)));
        if let Some(mut authr) = self.authr.take() {
            authr.cancel(&*self.ctx.adapter, self.address);
        }
        if let Some(mut req) = self.disconnect_req.take() {
            if let Some(reply) = req.reply.take() {
                respond(reply, Ok(()));
            }
        }
        self.pending.clear();
        self.disconnect_services();
        self.services.clear();
        if self.att_connected {
            self.ctx.adapter.close_att(self.address);
        }
        if self.bredr.connected {
            let _ = self.ctx.adapter.disconnect(self.address, AddressType::BrEdr);
        }
        if self.le.connected {
            let _ = self
                .ctx
                .adapter
                .disconnect(self.address, self.bearer_address_type(Bearer::Le));
        }
        if purge_storage {
            if let Err(err) = self.ctx.store.remove_device(self.address) {
                log::warn!("{}: purging stored state failed: {err}", self.address);
            }
        }
    }
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    matches!(deadline, Some(deadline) if deadline <= now)
}
