//! Topology facts consumed from the transport layer.
//!
//! The core does not manage queue pairs or driver handles; it only
//! needs a few sizing facts (usable ports, outstanding-WQE limits, the
//! scale-out transport strategy) to plan credit pools and hazard
//! windows.

use crate::engine::ScaleOutTransport;
use crate::error::{Result, WeftError};
use crate::types::BufferKind;

/// Facts about the fabrics this queue schedules onto.
#[derive(Debug, Clone)]
pub struct FabricTopology {
    /// Usable intra-node fabric ports.
    pub scaleup_ports: u8,
    /// Usable inter-node network ports.
    pub scaleout_ports: u8,
    /// Maximum outstanding work-queue entries the transport allows.
    pub max_outstanding_wqes: u32,
    pub transport: ScaleOutTransport,
}

impl FabricTopology {
    /// A single-box topology: no scale-out plane at all.
    pub fn single_box(scaleup_ports: u8) -> Self {
        Self {
            scaleup_ports,
            scaleout_ports: 0,
            max_outstanding_wqes: 0,
            transport: ScaleOutTransport::NativeFabric { ports: 0 },
        }
    }

    /// Check the topology can carry the given shape class at all.
    ///
    /// Surfaced as a typed error, not a contract violation: a missing
    /// port is an external condition, not an orchestration bug.
    pub fn validate(&self, needs_scaleout: bool) -> Result<()> {
        if self.scaleup_ports == 0 {
            return Err(WeftError::NoUsablePorts { fabric: "scaleup" });
        }
        if needs_scaleout && self.scaleout_ports == 0 {
            return Err(WeftError::NoUsablePorts { fabric: "scaleout" });
        }
        Ok(())
    }

    /// Clamp a configured credit-pool size to what the transport can
    /// actually keep in flight.
    pub fn clamp_credits(&self, kind: BufferKind, configured: usize) -> usize {
        match kind {
            BufferKind::ScaleOutStaging if self.max_outstanding_wqes > 0 => {
                configured.min(self.max_outstanding_wqes as usize).max(1)
            }
            _ => configured.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo() -> FabricTopology {
        FabricTopology {
            scaleup_ports: 6,
            scaleout_ports: 2,
            max_outstanding_wqes: 8,
            transport: ScaleOutTransport::HostNic { ring_capacity: 256 },
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(topo().validate(true).is_ok());
        assert!(topo().validate(false).is_ok());
    }

    #[test]
    fn test_validate_no_scaleout_ports() {
        let t = FabricTopology::single_box(4);
        assert!(t.validate(false).is_ok());
        assert!(matches!(
            t.validate(true),
            Err(WeftError::NoUsablePorts { fabric: "scaleout" })
        ));
    }

    #[test]
    fn test_validate_no_scaleup_ports() {
        let mut t = topo();
        t.scaleup_ports = 0;
        assert!(matches!(
            t.validate(false),
            Err(WeftError::NoUsablePorts { fabric: "scaleup" })
        ));
    }

    #[test]
    fn test_clamp_scaleout_credits_to_wqes() {
        let t = topo();
        assert_eq!(t.clamp_credits(BufferKind::ScaleOutStaging, 16), 8);
        assert_eq!(t.clamp_credits(BufferKind::ScaleOutStaging, 4), 4);
        // Other kinds are not WQE-bound.
        assert_eq!(t.clamp_credits(BufferKind::ScaleUpStaging, 16), 16);
        // Never clamp to zero.
        assert_eq!(t.clamp_credits(BufferKind::ReductionStaging, 0), 1);
    }
}
