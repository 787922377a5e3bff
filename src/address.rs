//! LE device addresses, the host address policy, and private address minting.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

/// A 48-bit Bluetooth device address, most significant byte first.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const EMPTY: Address = Address([0u8; 6]);

    /// Returns the two most significant bits, which carry the random
    /// address sub-type.
    fn msb_type_bits(&self) -> u8 {
        self.0[0] >> 6
    }

    /// True for a resolvable private address (0b01 sub-type).
    pub fn is_resolvable_private(&self) -> bool {
        self.msb_type_bits() == 0b01
    }

    /// True for a non-resolvable private address (0b00 sub-type).
    pub fn is_non_resolvable_private(&self) -> bool {
        self.msb_type_bits() == 0b00
    }

    /// True for a static random address (0b11 sub-type).
    pub fn is_static_random(&self) -> bool {
        self.msb_type_bits() == 0b11
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// HCI-level address type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    PublicDeviceAddress = 0x00,
    RandomDeviceAddress = 0x01,
    PublicIdentityAddress = 0x02,
    RandomIdentityAddress = 0x03,
}

/// An address together with its HCI address type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressWithType {
    pub address: Address,
    pub address_type: AddressType,
}

impl AddressWithType {
    pub fn new(address: Address, address_type: AddressType) -> Self {
        Self { address, address_type }
    }

    pub const EMPTY: AddressWithType =
        AddressWithType { address: Address::EMPTY, address_type: AddressType::PublicDeviceAddress };
}

/// Address type an advertiser asks for, before policy narrowing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvertiserAddressType {
    Public,
    ResolvableRandom,
    NonResolvableRandom,
}

/// Host-wide address policy configured on the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressPolicy {
    UsePublicAddress,
    UseStaticAddress,
    UseResolvableAddress,
    UseNonResolvableAddress,
}

/// Determines the address type to use, based on the requested type and the
/// address manager policy, by selecting the "strictest" of the two.
/// Strictness is defined in ascending order as RPA -> NRPA -> Public. Thus:
/// (1) if the host only supports the public/static address policy, all
///     advertisements will be public
/// (2) if the host supports only non-resolvable addresses, then
///     advertisements will never use RPA
/// (3) if the host supports RPAs, then the requested type is always honored
pub fn advertiser_address_type_from_policy(
    requested: AdvertiserAddressType,
    policy: AddressPolicy,
) -> AdvertiserAddressType {
    match policy {
        AddressPolicy::UsePublicAddress | AddressPolicy::UseStaticAddress => {
            AdvertiserAddressType::Public
        }
        AddressPolicy::UseResolvableAddress => requested,
        AddressPolicy::UseNonResolvableAddress => match requested {
            AdvertiserAddressType::ResolvableRandom => AdvertiserAddressType::NonResolvableRandom,
            other => other,
        },
    }
}

/// Determines the address type for non-connectable advertising. Under the
/// public/static policy a non-connectable set may still use NRPA, so an RPA
/// request degrades to NRPA instead of exposing the identity address.
pub fn advertiser_address_type_non_connectable(
    requested: AdvertiserAddressType,
    policy: AddressPolicy,
) -> AdvertiserAddressType {
    match policy {
        AddressPolicy::UsePublicAddress | AddressPolicy::UseStaticAddress => match requested {
            AdvertiserAddressType::ResolvableRandom => AdvertiserAddressType::NonResolvableRandom,
            other => other,
        },
        _ => advertiser_address_type_from_policy(requested, policy),
    }
}

// Private address rotation window. A fresh interval is picked uniformly
// inside it for every rotation.
const MINIMUM_ROTATION_TIME: Duration = Duration::from_secs(7 * 60);
const MAXIMUM_ROTATION_TIME: Duration = Duration::from_secs(15 * 60);

/// Owns the identity addresses, the IRK, and the policy; mints private
/// addresses for advertisers on request.
pub struct LeAddressManager {
    policy: AddressPolicy,
    public_address: Address,
    static_address: Address,
    irk: [u8; 16],
    client_registered: bool,
    pause_acks: u32,
    resume_acks: u32,
}

impl LeAddressManager {
    pub fn new(policy: AddressPolicy, public_address: Address) -> Self {
        let mut static_address = Address::EMPTY;
        OsRng.fill_bytes(&mut static_address.0);
        static_address.0[0] |= 0xc0;
        let mut irk = [0u8; 16];
        OsRng.fill_bytes(&mut irk);
        LeAddressManager {
            policy,
            public_address,
            static_address,
            irk,
            client_registered: false,
            pause_acks: 0,
            resume_acks: 0,
        }
    }

    pub fn address_policy(&self) -> AddressPolicy {
        self.policy
    }

    /// The address used when initiating, i.e. the identity address under the
    /// current policy.
    pub fn initiator_address(&self) -> AddressWithType {
        match self.policy {
            AddressPolicy::UseStaticAddress => {
                AddressWithType::new(self.static_address, AddressType::RandomDeviceAddress)
            }
            _ => AddressWithType::new(self.public_address, AddressType::PublicDeviceAddress),
        }
    }

    pub fn public_address(&self) -> AddressWithType {
        AddressWithType::new(self.public_address, AddressType::PublicDeviceAddress)
    }

    /// Derives a fresh resolvable private address from the current IRK.
    pub fn new_resolvable_address(&self) -> AddressWithType {
        let mut prand = [0u8; 3];
        OsRng.fill_bytes(&mut prand);
        prand[0] = (prand[0] & 0x3f) | 0x40;
        let hash = ah(&self.irk, &prand);
        let address =
            Address([prand[0], prand[1], prand[2], hash[0], hash[1], hash[2]]);
        AddressWithType::new(address, AddressType::RandomDeviceAddress)
    }

    /// Mints a fresh non-resolvable private address.
    pub fn new_non_resolvable_address(&self) -> AddressWithType {
        let mut address = Address::EMPTY;
        OsRng.fill_bytes(&mut address.0);
        address.0[0] &= 0x3f;
        AddressWithType::new(address, AddressType::RandomDeviceAddress)
    }

    /// Delay until the next private address rotation of a set.
    pub fn next_private_address_interval(&self) -> Duration {
        let window = (MAXIMUM_ROTATION_TIME - MINIMUM_ROTATION_TIME).as_millis() as u64;
        MINIMUM_ROTATION_TIME + Duration::from_millis(OsRng.gen_range(0..window))
    }

    /// Installs a new IRK. The advertising manager must rotate every enabled
    /// set synchronously afterwards so later IRK-dependent work sees the new
    /// addresses.
    pub fn set_irk(&mut self, irk: [u8; 16]) {
        self.irk = irk;
    }

    pub fn register_client(&mut self) {
        self.client_registered = true;
    }

    pub fn unregister_client(&mut self) {
        self.client_registered = false;
    }

    pub fn is_client_registered(&self) -> bool {
        self.client_registered
    }

    pub fn ack_pause(&mut self) {
        self.pause_acks += 1;
    }

    pub fn ack_resume(&mut self) {
        self.resume_acks += 1;
    }

    pub fn pause_acks(&self) -> u32 {
        self.pause_acks
    }

    pub fn resume_acks(&self) -> u32 {
        self.resume_acks
    }
}

/// The random address hash function `ah` from the Core spec: AES-128 of the
/// zero-padded 24-bit prand under the IRK, keeping the low three bytes.
fn ah(irk: &[u8; 16], prand: &[u8; 3]) -> [u8; 3] {
    let cipher = Aes128::new_from_slice(irk).expect("IRK is 16 bytes");
    let mut block = [0u8; 16];
    block[13] = prand[0];
    block[14] = prand[1];
    block[15] = prand[2];
    let mut block = aes::Block::from(block);
    cipher.encrypt_block(&mut block);
    [block[13], block[14], block[15]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_narrowing_table() {
        use AddressPolicy::*;
        use AdvertiserAddressType::*;

        for policy in [UsePublicAddress, UseStaticAddress] {
            assert_eq!(advertiser_address_type_from_policy(Public, policy), Public);
            assert_eq!(advertiser_address_type_from_policy(ResolvableRandom, policy), Public);
            assert_eq!(advertiser_address_type_from_policy(NonResolvableRandom, policy), Public);
        }
        assert_eq!(advertiser_address_type_from_policy(Public, UseResolvableAddress), Public);
        assert_eq!(
            advertiser_address_type_from_policy(ResolvableRandom, UseResolvableAddress),
            ResolvableRandom
        );
        assert_eq!(
            advertiser_address_type_from_policy(NonResolvableRandom, UseResolvableAddress),
            NonResolvableRandom
        );
        assert_eq!(advertiser_address_type_from_policy(Public, UseNonResolvableAddress), Public);
        assert_eq!(
            advertiser_address_type_from_policy(ResolvableRandom, UseNonResolvableAddress),
            NonResolvableRandom
        );
        assert_eq!(
            advertiser_address_type_from_policy(NonResolvableRandom, UseNonResolvableAddress),
            NonResolvableRandom
        );
    }

    #[test]
    fn test_non_connectable_never_reveals_identity() {
        use AddressPolicy::*;
        use AdvertiserAddressType::*;

        for policy in [UsePublicAddress, UseStaticAddress] {
            assert_eq!(
                advertiser_address_type_non_connectable(ResolvableRandom, policy),
                NonResolvableRandom
            );
            assert_eq!(advertiser_address_type_non_connectable(Public, policy), Public);
        }
        assert_eq!(
            advertiser_address_type_non_connectable(ResolvableRandom, UseResolvableAddress),
            ResolvableRandom
        );
    }

    #[test]
    fn test_minted_address_sub_type_bits() {
        let manager =
            LeAddressManager::new(AddressPolicy::UseResolvableAddress, Address([1; 6]));

        let rpa = manager.new_resolvable_address();
        assert_eq!(rpa.address_type, AddressType::RandomDeviceAddress);
        assert!(rpa.address.is_resolvable_private());

        let nrpa = manager.new_non_resolvable_address();
        assert_eq!(nrpa.address_type, AddressType::RandomDeviceAddress);
        assert!(nrpa.address.is_non_resolvable_private());
    }

    #[test]
    fn test_rotation_interval_within_window() {
        let manager =
            LeAddressManager::new(AddressPolicy::UseResolvableAddress, Address([1; 6]));
        for _ in 0..16 {
            let interval = manager.next_private_address_interval();
            assert!(interval >= MINIMUM_ROTATION_TIME);
            assert!(interval < MAXIMUM_ROTATION_TIME);
        }
    }

    #[test]
    fn test_rpa_resolves_under_same_irk() {
        let manager =
            LeAddressManager::new(AddressPolicy::UseResolvableAddress, Address([1; 6]));
        let rpa = manager.new_resolvable_address().address;
        let prand = [rpa.0[0], rpa.0[1], rpa.0[2]];
        let hash = ah(&manager.irk, &prand);
        assert_eq!(&rpa.0[3..], &hash[..]);
    }

    #[test]
    fn test_static_address_has_static_bits() {
        let manager = LeAddressManager::new(AddressPolicy::UseStaticAddress, Address([1; 6]));
        assert!(manager.initiator_address().address.is_static_random());
    }
}
