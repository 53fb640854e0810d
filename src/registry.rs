//! Per-adapter device registry.
//!
//! Owns every [Device] known to one adapter, creates devices on first
//! observation, restores persistent ones at startup and removes
//! temporary ones when their lifetime expires.

use std::{collections::HashMap, sync::Arc, time::Instant};

use crate::{
    device::{Device, DeviceContext},
    event::DeviceEvent,
    Address, Result,
};

/// All devices of one adapter.
#[derive(Debug)]
pub struct DeviceRegistry {
    ctx: Arc<DeviceContext>,
    devices: HashMap<Address, Device>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx, devices: HashMap::new() }
    }

    /// Shared collaborators of the registry's devices.
    pub fn ctx(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Restores all persistently stored devices.
    pub fn load(&mut self, now: Instant) -> Result<usize> {
        let addresses = self.ctx.store.list()?;
        let mut restored = 0;
        for address in addresses {
            let Some(info) = self.ctx.store.load_info(address)? else {
                continue;
            };
            let cached = self.ctx.store.load_cache(address)?;
            let device = Device::from_store(self.ctx.clone(), address, info, cached, now);
            self.devices.insert(address, device);
            restored += 1;
        }
        if restored > 0 {
            log::info!("restored {restored} device(s) from storage");
        }
        Ok(restored)
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// The registry has no devices.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Addresses of all registered devices.
    pub fn addresses(&self) -> Vec<Address> {
        self.devices.keys().copied().collect()
    }

    /// The device with the given address.
    pub fn get(&self, address: Address) -> Option<&Device> {
        self.devices.get(&address)
    }

    /// The device with the given address, mutably.
    pub fn get_mut(&mut self, address: Address) -> Option<&mut Device> {
        self.devices.get_mut(&address)
    }

    /// Routes an inbound event to its device.
    ///
    /// A found report for an unknown address creates the device; any
    /// other event for an unknown address is logged and ignored.
    pub fn handle_event(&mut self, address: Address, event: DeviceEvent, now: Instant) {
        if !self.devices.contains_key(&address) {
            let DeviceEvent::Found(report) = &event else {
                log::debug!("{address}: ignoring {event:?} for unknown device");
                return;
            };
            let device =
                Device::new(self.ctx.clone(), address, report.address_type, now);
            self.devices.insert(address, device);
        }

        let resolve_name = matches!(&event, DeviceEvent::Found(report) if report.name.is_none());
        if let Some(device) = self.devices.get_mut(&address) {
            device.handle_event(event, now);
            if resolve_name && device.should_resolve_name(now) {
                if let Err(err) = self.ctx.adapter.resolve_name(address) {
                    log::debug!("{address}: name resolution not started: {err}");
                }
            }
        }
    }

    /// Removes a device, tearing down everything it owns.
    ///
    /// `purge_storage` also deletes its persistent state.
    pub fn remove(&mut self, address: Address, purge_storage: bool) -> bool {
        let Some(mut device) = self.devices.remove(&address) else {
            return false;
        };
        device.teardown(purge_storage);
        self.ctx.watcher.removed(address);
        log::info!("{address}: removed");
        true
    }

    /// Earliest timer deadline over all devices.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.devices.values().filter_map(Device::next_timeout).min()
    }

    /// Fires due timers on all devices and removes expired temporary
    /// ones.
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired: Vec<Address> = self
            .devices
            .iter_mut()
            .filter_map(|(address, device)| device.handle_timeout(now).then_some(*address))
            .collect();
        for address in expired {
            self.remove(address, false);
        }
    }

    /// A store flush is pending on some device.
    pub fn dirty(&self) -> bool {
        self.devices.values().any(Device::is_dirty)
    }

    /// Flushes pending store writes of all devices.
    pub fn flush(&mut self) {
        for device in self.devices.values_mut() {
            if device.is_dirty() {
                device.flush_store();
            }
        }
    }
}
