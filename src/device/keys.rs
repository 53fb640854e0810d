//! Key material learned from pairing.
//!
//! Holds the long-term key, the two connection signature resolving keys
//! and any set identity resolving keys of a device. Counter handling is
//! strict: the local sign counter only ever increments, the remote sign
//! counter only accepts non-decreasing values.

use std::fmt;

/// Long-term key for LE link encryption.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LongTermKey {
    /// Key value.
    pub value: [u8; 16],
    /// Key was generated in the central role.
    pub central: bool,
    /// Negotiated encryption key size in bytes.
    pub enc_size: u8,
}

impl fmt::Debug for LongTermKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // key value intentionally not printed
        f.debug_struct("LongTermKey")
            .field("central", &self.central)
            .field("enc_size", &self.enc_size)
            .finish()
    }
}

/// Connection signature resolving key with its sign counter.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SignatureKey {
    /// Key value.
    pub value: [u8; 16],
    /// Sign counter.
    pub counter: u32,
    /// Key was exchanged over an authenticated link.
    pub authenticated: bool,
}

impl fmt::Debug for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignatureKey")
            .field("counter", &self.counter)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

/// Set identity resolving key for coordinated-set membership.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SetIdentityKey {
    /// Key value, encrypted if [encrypted](Self::encrypted) is set.
    pub value: [u8; 16],
    /// The key value needs the LTK to be decrypted.
    pub encrypted: bool,
    /// Size of the coordinated set.
    pub size: u8,
    /// Rank of this device in the set.
    pub rank: u8,
}

impl fmt::Debug for SetIdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SetIdentityKey")
            .field("encrypted", &self.encrypted)
            .field("size", &self.size)
            .field("rank", &self.rank)
            .finish()
    }
}

/// Membership of a device in a coordinated set, derived from a usable
/// set identity resolving key.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceSet {
    /// Set identifier (the resolving key in hexadecimal).
    pub id: String,
    /// Rank of the device in the set.
    pub rank: u8,
}

/// Outcome of receiving a remote sign counter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterUpdate {
    /// The counter was accepted and stored.
    Accepted,
    /// The counter was lower than the stored one and was rejected.
    Rejected,
}

/// Key material store of one device.
#[derive(Clone, Debug, Default)]
pub struct KeyStore {
    ltk: Option<LongTermKey>,
    local_csrk: Option<SignatureKey>,
    remote_csrk: Option<SignatureKey>,
    sirks: Vec<SetIdentityKey>,
}

impl KeyStore {
    /// The long-term key, if one was exchanged.
    pub fn ltk(&self) -> Option<&LongTermKey> {
        self.ltk.as_ref()
    }

    /// The key used to sign outbound writes.
    pub fn local_csrk(&self) -> Option<&SignatureKey> {
        self.local_csrk.as_ref()
    }

    /// The key used to verify inbound signed writes.
    pub fn remote_csrk(&self) -> Option<&SignatureKey> {
        self.remote_csrk.as_ref()
    }

    /// All stored set identity resolving keys.
    pub fn sirks(&self) -> &[SetIdentityKey] {
        &self.sirks
    }

    /// Stores the long-term key.
    ///
    /// Returns `true` if the device-set memberships changed because a
    /// previously encrypted set identity key became usable.
    pub fn set_ltk(&mut self, key: LongTermKey) -> bool {
        let usable_before = self.usable_sirk_count();
        self.ltk = Some(key);
        self.usable_sirk_count() != usable_before
    }

    /// Stores the local signature key.
    pub fn set_local_csrk(&mut self, key: SignatureKey) {
        self.local_csrk = Some(key);
    }

    /// Stores the remote signature key.
    pub fn set_remote_csrk(&mut self, key: SignatureKey) {
        self.remote_csrk = Some(key);
    }

    /// Increments the local sign counter for an outbound signed write.
    ///
    /// Returns the counter value to sign with, or `None` if no local
    /// signature key is available.
    pub fn bump_local_counter(&mut self) -> Option<u32> {
        let key = self.local_csrk.as_mut()?;
        key.counter = key.counter.wrapping_add(1);
        Some(key.counter)
    }

    /// Validates the sign counter of an inbound signed write.
    ///
    /// A counter not lower than the stored one is accepted and stored; a
    /// lower counter leaves the store untouched.
    pub fn receive_remote_counter(&mut self, counter: u32) -> CounterUpdate {
        match self.remote_csrk.as_mut() {
            Some(key) if counter >= key.counter => {
                key.counter = counter;
                CounterUpdate::Accepted
            }
            Some(_) => CounterUpdate::Rejected,
            None => CounterUpdate::Rejected,
        }
    }

    /// Adds a set identity resolving key.
    ///
    /// Keys are unique by value; re-adding an existing key updates its
    /// metadata. Returns `true` if the usable memberships changed.
    pub fn add_sirk(&mut self, key: SetIdentityKey) -> bool {
        let usable_before = self.sets();
        match self.sirks.iter_mut().find(|k| k.value == key.value) {
            Some(existing) => *existing = key,
            None => self.sirks.push(key),
        }
        self.sets() != usable_before
    }

    /// Current device-set memberships.
    ///
    /// A set identity key participates only when it is unencrypted or an
    /// LTK is available to decrypt it.
    pub fn sets(&self) -> Vec<DeviceSet> {
        let has_ltk = self.ltk.is_some();
        self.sirks
            .iter()
            .filter(|k| !k.encrypted || has_ltk)
            .map(|k| DeviceSet { id: hex::encode(k.value), rank: k.rank })
            .collect()
    }

    fn usable_sirk_count(&self) -> usize {
        let has_ltk = self.ltk.is_some();
        self.sirks.iter().filter(|k| !k.encrypted || has_ltk).count()
    }

    /// Drops the LE pairing material (LTK and both signature keys).
    ///
    /// Set identity keys are kept; encrypted ones become unusable until
    /// a new LTK arrives.
    pub fn drop_le_keys(&mut self) -> bool {
        let had = self.ltk.is_some() || self.local_csrk.is_some() || self.remote_csrk.is_some();
        self.ltk = None;
        self.local_csrk = None;
        self.remote_csrk = None;
        had
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csrk(counter: u32) -> SignatureKey {
        SignatureKey { value: [7; 16], counter, authenticated: false }
    }

    #[test]
    fn remote_counter_is_monotonic() {
        let mut keys = KeyStore::default();
        keys.set_remote_csrk(csrk(5));

        assert_eq!(keys.receive_remote_counter(5), CounterUpdate::Accepted);
        assert_eq!(keys.receive_remote_counter(9), CounterUpdate::Accepted);
        assert_eq!(keys.remote_csrk().unwrap().counter, 9);

        assert_eq!(keys.receive_remote_counter(4), CounterUpdate::Rejected);
        assert_eq!(keys.remote_csrk().unwrap().counter, 9);
    }

    #[test]
    fn remote_counter_without_key_is_rejected() {
        let mut keys = KeyStore::default();
        assert_eq!(keys.receive_remote_counter(1), CounterUpdate::Rejected);
    }

    #[test]
    fn local_counter_increments_per_write() {
        let mut keys = KeyStore::default();
        assert_eq!(keys.bump_local_counter(), None);
        keys.set_local_csrk(csrk(0));
        assert_eq!(keys.bump_local_counter(), Some(1));
        assert_eq!(keys.bump_local_counter(), Some(2));
    }

    #[test]
    fn sirks_are_unique_by_value() {
        let mut keys = KeyStore::default();
        let sirk = SetIdentityKey { value: [1; 16], encrypted: false, size: 2, rank: 1 };
        assert!(keys.add_sirk(sirk));
        assert!(!keys.add_sirk(sirk));
        assert_eq!(keys.sirks().len(), 1);

        let updated = SetIdentityKey { rank: 2, ..sirk };
        assert!(keys.add_sirk(updated));
        assert_eq!(keys.sirks().len(), 1);
        assert_eq!(keys.sets()[0].rank, 2);
    }

    #[test]
    fn encrypted_sirk_needs_ltk() {
        let mut keys = KeyStore::default();
        let sirk = SetIdentityKey { value: [2; 16], encrypted: true, size: 2, rank: 1 };
        assert!(!keys.add_sirk(sirk));
        assert!(keys.sets().is_empty());

        let ltk = LongTermKey { value: [3; 16], central: true, enc_size: 16 };
        assert!(keys.set_ltk(ltk));
        assert_eq!(keys.sets().len(), 1);
        assert_eq!(keys.sets()[0].id, hex::encode([2u8; 16]));
    }

    #[test]
    fn dropping_le_keys_disables_encrypted_sets() {
        let mut keys = KeyStore::default();
        keys.set_ltk(LongTermKey { value: [3; 16], central: false, enc_size: 16 });
        keys.add_sirk(SetIdentityKey { value: [2; 16], encrypted: true, size: 2, rank: 1 });
        assert_eq!(keys.sets().len(), 1);

        assert!(keys.drop_le_keys());
        assert!(keys.sets().is_empty());
        assert_eq!(keys.sirks().len(), 1);
    }
}
