//! Peer Registry Module
//!
//! Maps lens sides to physical addresses. The glasses advertise each lens
//! separately (`Even G1_87_L_39E92`, `Even G1_87_R_1A2B3`); the side comes
//! from the name and the shared prefix ties the two lenses together.

use super::protocol;
use crate::domain::error::PairingError;
use crate::domain::models::{PeerIdentity, Side};
use crate::domain::settings::PairedDevice;
use tracing::{debug, info};

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: String,
}

impl DiscoveredDevice {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    /// Side encoded in the advertised name, e.g. `Even G1_7_L_39A3F2`.
    pub fn side(&self) -> Option<Side> {
        protocol::side_from_full_name(&self.name)
    }

    pub fn base_name(&self) -> Option<&str> {
        protocol::name_from_full_name(&self.name)
    }

    fn identity(&self) -> Result<PeerIdentity, PairingError> {
        let side = self
            .side()
            .ok_or_else(|| PairingError::UnrecognizedName(self.name.clone()))?;
        Ok(PeerIdentity {
            side,
            address: self.address.clone(),
            name: self.name.clone(),
        })
    }
}

/// Devices in `candidates` that could be the other lens of `initial`.
pub fn partner_candidates<'a>(
    initial: &DiscoveredDevice,
    candidates: &'a [DiscoveredDevice],
) -> Result<Vec<&'a DiscoveredDevice>, PairingError> {
    let side = initial
        .side()
        .ok_or_else(|| PairingError::UnrecognizedName(initial.name.clone()))?;
    let base_name = initial
        .base_name()
        .ok_or_else(|| PairingError::UnrecognizedName(initial.name.clone()))?;

    Ok(candidates
        .iter()
        .filter(|candidate| candidate.address != initial.address)
        .filter(|candidate| candidate.base_name() == Some(base_name))
        .filter(|candidate| candidate.side() == Some(side.other()))
        .collect())
}

/// Bidirectional side/address map for one pair of glasses.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    left: Option<PeerIdentity>,
    right: Option<PeerIdentity>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_paired(paired: &PairedDevice) -> Self {
        Self {
            left: paired.left.clone(),
            right: paired.right.clone(),
        }
    }

    fn slot(&mut self, side: Side) -> &mut Option<PeerIdentity> {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    pub fn identity(&self, side: Side) -> Option<&PeerIdentity> {
        match side {
            Side::Left => self.left.as_ref(),
            Side::Right => self.right.as_ref(),
        }
    }

    /// Bind a side. Rebinding the same address is a no-op; a different
    /// address must be unbound first.
    pub fn bind(&mut self, identity: PeerIdentity) -> Result<(), PairingError> {
        let side = identity.side;
        let slot = self.slot(side);
        match slot {
            Some(existing) if existing.address == identity.address => {
                *existing = identity;
                Ok(())
            }
            Some(existing) => Err(PairingError::AlreadyBound {
                side,
                address: existing.address.clone(),
            }),
            None => {
                info!("Bound {} lens to {}", side, identity.address);
                *slot = Some(identity);
                Ok(())
            }
        }
    }

    /// Late-bind a device discovered after the first lens, e.g. the follower
    /// once it starts advertising.
    pub fn bind_discovered(
        &mut self,
        device: &DiscoveredDevice,
    ) -> Result<PeerIdentity, PairingError> {
        let identity = device.identity()?;
        self.bind(identity.clone())?;
        Ok(identity)
    }

    /// Bind both lenses at once, in either order.
    pub fn pair(
        &mut self,
        first: &DiscoveredDevice,
        second: &DiscoveredDevice,
    ) -> Result<(), PairingError> {
        let first = first.identity()?;
        let second = second.identity()?;
        if first.side == second.side {
            return Err(PairingError::AlreadyBound {
                side: second.side,
                address: first.address,
            });
        }
        self.bind(first)?;
        self.bind(second)
    }

    pub fn unbind(&mut self, side: Side) -> Option<PeerIdentity> {
        self.slot(side).take()
    }

    /// Side bound to `address`. Addresses compare case-insensitively.
    pub fn side_of(&self, address: &str) -> Option<Side> {
        Side::BOTH.into_iter().find(|side| {
            self.identity(*side)
                .is_some_and(|identity| identity.address.eq_ignore_ascii_case(address))
        })
    }

    pub fn require_side_of(&self, address: &str) -> Result<Side, PairingError> {
        self.side_of(address).ok_or_else(|| {
            debug!("No lens bound to {}", address);
            PairingError::UnknownAddress(address.to_string())
        })
    }

    /// Both sides bound. Auto-connect is only safe then, otherwise a
    /// reconnect during bonding can split the pair.
    pub fn is_complete(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    pub fn to_paired(&self) -> PairedDevice {
        let name = Side::BOTH
            .iter()
            .filter_map(|side| self.identity(*side))
            .find_map(|identity| protocol::name_from_full_name(&identity.name))
            .unwrap_or_default()
            .to_string();
        PairedDevice {
            name,
            left: self.left.clone(),
            right: self.right.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left() -> DiscoveredDevice {
        DiscoveredDevice::new("AA:00:00:00:00:01", "Even G1_87_L_39E92")
    }

    fn right() -> DiscoveredDevice {
        DiscoveredDevice::new("AA:00:00:00:00:02", "Even G1_87_R_1A2B3")
    }

    #[test]
    fn test_partner_candidates_filter_by_name_and_side() {
        let candidates = vec![
            left(),
            right(),
            DiscoveredDevice::new("AA:00:00:00:00:03", "Even G1_12_R_77777"),
            DiscoveredDevice::new("AA:00:00:00:00:04", "Even G1_87_L_00000"),
            DiscoveredDevice::new("AA:00:00:00:00:05", "Headphones"),
        ];
        let partners = partner_candidates(&left(), &candidates).unwrap();
        assert_eq!(partners, vec![&right()]);

        assert!(matches!(
            partner_candidates(&DiscoveredDevice::new("x", "Headphones"), &candidates),
            Err(PairingError::UnrecognizedName(_))
        ));
    }

    #[test]
    fn test_late_binding_follower() {
        let mut registry = PeerRegistry::new();
        registry.bind_discovered(&left()).unwrap();
        assert!(!registry.is_complete());
        assert_eq!(registry.side_of("AA:00:00:00:00:02"), None);

        registry.bind_discovered(&right()).unwrap();
        assert!(registry.is_complete());
        assert_eq!(registry.side_of("aa:00:00:00:00:02"), Some(Side::Right));
        assert_eq!(registry.to_paired().name, "Even G1_87");
    }

    #[test]
    fn test_rebinding_different_address_is_rejected() {
        let mut registry = PeerRegistry::new();
        registry.pair(&right(), &left()).unwrap();

        let imposter = DiscoveredDevice::new("AA:00:00:00:00:09", "Even G1_87_L_39E92");
        assert_eq!(
            registry.bind_discovered(&imposter),
            Err(PairingError::AlreadyBound {
                side: Side::Left,
                address: "AA:00:00:00:00:01".to_string()
            })
        );
        assert!(registry.bind_discovered(&left()).is_ok());

        registry.unbind(Side::Left);
        assert!(registry.bind_discovered(&imposter).is_ok());
    }

    #[test]
    fn test_unknown_address() {
        let registry = PeerRegistry::new();
        assert_eq!(
            registry.require_side_of("AA:00:00:00:00:01"),
            Err(PairingError::UnknownAddress("AA:00:00:00:00:01".to_string()))
        );
    }
}
