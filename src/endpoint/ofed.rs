/*!
 * RDMA Endpoint Codec
 * `ocpi-ofed-rdma:<device>:<port>:<gidHi>.<gidLo>:<lid>:<psn>:<rkey>:<vaddr>:<size>.<mailbox>.<max>`
 */

use super::parse_field;
use crate::core::errors::{DataplaneError, DataplaneResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fabric address of a registered memory region
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfedAddress {
    pub device: String,
    pub port: u8,
    pub gid_hi: u64,
    pub gid_lo: u64,
    pub lid: u16,
    pub psn: u32,
    pub rkey: u32,
    pub vaddr: u64,
}

impl OfedAddress {
    /// Allocation form: hardware fields are zero until resources exist
    pub fn unassigned(device: impl Into<String>, port: u8) -> Self {
        Self {
            device: device.into(),
            port,
            gid_hi: 0,
            gid_lo: 0,
            lid: 0,
            psn: 0,
            rkey: 0,
            vaddr: 0,
        }
    }
}

pub(super) fn parse<'a>(full: &str, body: &'a str) -> DataplaneResult<(OfedAddress, &'a str)> {
    let fields: Vec<&str> = body.split(':').collect();
    if fields.len() != 8 {
        return Err(DataplaneError::unsupported(
            full,
            format!("expected 11 RDMA endpoint fields, found {} ':' groups", fields.len()),
        ));
    }
    let (gid_hi, gid_lo) = fields[2]
        .split_once('.')
        .filter(|(_, lo)| !lo.contains('.'))
        .ok_or_else(|| DataplaneError::unsupported(full, "gid must be <hi>.<lo>"))?;
    if fields[0].is_empty() {
        return Err(DataplaneError::unsupported(full, "empty device name"));
    }

    let address = OfedAddress {
        device: fields[0].to_string(),
        port: parse_field(full, "port", fields[1])?,
        gid_hi: parse_field(full, "gid hi", gid_hi)?,
        gid_lo: parse_field(full, "gid lo", gid_lo)?,
        lid: parse_field(full, "lid", fields[3])?,
        psn: parse_field(full, "psn", fields[4])?,
        rkey: parse_field(full, "rkey", fields[5])?,
        vaddr: parse_field(full, "vaddr", fields[6])?,
    };
    Ok((address, fields[7]))
}

pub(super) fn encode(addr: &OfedAddress, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
        f,
        "ocpi-ofed-rdma:{}:{}:{}.{}:{}:{}:{}:{}:",
        addr.device, addr.port, addr.gid_hi, addr.gid_lo, addr.lid, addr.psn, addr.rkey, addr.vaddr
    )
}

#[cfg(test)]
mod tests {
    use crate::endpoint::{Endpoint, EndpointAddress};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_form() {
        let s = "ocpi-ofed-rdma:mlx5_0:1:18338657682652659712.1234:7:3:4660:140737488355328:1048576.3.4";
        let ep = Endpoint::parse(s).unwrap();
        match ep.address() {
            EndpointAddress::Ofed(addr) => {
                assert_eq!(addr.device, "mlx5_0");
                assert_eq!(addr.port, 1);
                assert_eq!(addr.gid_hi, 18338657682652659712);
                assert_eq!(addr.gid_lo, 1234);
                assert_eq!(addr.lid, 7);
                assert_eq!(addr.psn, 3);
                assert_eq!(addr.rkey, 4660);
                assert_eq!(addr.vaddr, 140737488355328);
            }
            other => panic!("unexpected address {other:?}"),
        }
        assert_eq!(ep.size(), 1048576);
        assert_eq!(ep.mailbox(), 3);
        assert_eq!(ep.max_mailboxes(), 4);
        assert_eq!(ep.to_string(), s);
    }

    #[test]
    fn test_wrong_field_count_is_unsupported() {
        for bad in [
            "ocpi-ofed-rdma:mlx5_0:1:0.0:0:0:0:1048576.3.4",
            "ocpi-ofed-rdma:mlx5_0:1:0.0:0:0:0:0:0:1048576.3.4",
            "ocpi-ofed-rdma:mlx5_0:1:0:0:0:0:0:1048576.3.4",
            "ocpi-ofed-rdma:mlx5_0:1:0.0.0:0:0:0:0:1048576.3.4",
            "ocpi-ofed-rdma:mlx5_0:1:0.0:0:0:0:0:1048576.3",
            "ocpi-ofed-rdma::1:0.0:0:0:0:0:1048576.3.4",
            "ocpi-ofed-rdma:mlx5_0:x:0.0:0:0:0:0:1048576.3.4",
        ] {
            assert!(Endpoint::parse(bad).is_err(), "{bad} should not parse");
        }
    }
}
