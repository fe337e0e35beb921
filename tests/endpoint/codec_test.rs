/*!
 * Endpoint Codec Tests
 * Encode/parse agreement for every protocol, and rejection of malformed strings
 */

use circuit_dataplane::endpoint::{EndpointAddress, OfedAddress, PioAddress, SocketAddress};
use circuit_dataplane::{DataplaneError, Endpoint, Protocol};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn address() -> impl Strategy<Value = EndpointAddress> {
    prop_oneof![
        "[a-z][a-z0-9_-]{0,15}".prop_map(|name| EndpointAddress::Pio(PioAddress { name })),
        ("[a-z][a-z0-9.-]{0,15}", any::<u16>())
            .prop_map(|(host, port)| EndpointAddress::Socket(SocketAddress { host, port })),
        (
            "mlx[0-9]_[0-9]",
            any::<u8>(),
            any::<u64>(),
            any::<u64>(),
            any::<u16>(),
            any::<u32>(),
            any::<u32>(),
            any::<u64>()
        )
            .prop_map(|(device, port, gid_hi, gid_lo, lid, psn, rkey, vaddr)| {
                EndpointAddress::Ofed(OfedAddress {
                    device,
                    port,
                    gid_hi,
                    gid_lo,
                    lid,
                    psn,
                    rkey,
                    vaddr,
                })
            }),
    ]
}

fn endpoint() -> impl Strategy<Value = Endpoint> {
    (address(), any::<u64>(), 1u16..=32)
        .prop_flat_map(|(address, size, max)| {
            (Just(address), Just(size), 0..max, Just(max))
        })
        .prop_map(|(address, size, mailbox, max)| {
            Endpoint::new(address, size, mailbox, max).unwrap()
        })
}

proptest! {
    #[test]
    fn prop_encode_then_parse_is_identity(endpoint in endpoint()) {
        let encoded = endpoint.to_string();
        let parsed = Endpoint::parse(&encoded).unwrap();
        prop_assert_eq!(&parsed, &endpoint);
        prop_assert_eq!(parsed.to_string(), encoded);
        prop_assert!(parsed.same_location(&endpoint));
    }

    #[test]
    fn prop_garbage_never_panics(s in "\\PC{0,80}") {
        let _ = Endpoint::parse(&s);
    }
}

#[test]
fn test_ofed_field_count_is_exact() {
    let good = "ocpi-ofed-rdma:mlx5_0:1:65152.12345:7:100:4242:139637976727552:1048576.0.2";
    let endpoint = Endpoint::parse(good).unwrap();
    assert_eq!(endpoint.protocol(), Protocol::Ofed);
    assert_eq!(endpoint.size(), 1048576);
    assert_eq!(endpoint.to_string(), good);

    let missing = "ocpi-ofed-rdma:mlx5_0:1:65152.12345:7:100:4242:1048576.0.2";
    assert!(matches!(
        Endpoint::parse(missing),
        Err(DataplaneError::UnsupportedEndpoint { .. })
    ));
}

#[test]
fn test_bracketed_ipv6_socket_host() {
    let endpoint = Endpoint::parse("ocpi-socket-rdma:[::1]:4000;65536.1.4").unwrap();
    match endpoint.address() {
        EndpointAddress::Socket(addr) => {
            assert_eq!(addr.host, "[::1]");
            assert_eq!(addr.port, 4000);
        }
        other => panic!("unexpected address {:?}", other),
    }
    assert_eq!(endpoint.mailbox(), 1);
    assert_eq!(endpoint.max_mailboxes(), 4);
}

#[test]
fn test_mailbox_must_be_below_max() {
    assert!(Endpoint::parse("ocpi-smb-pio:a:65536.4.4").is_err());
    assert!(Endpoint::parse("ocpi-smb-pio:a:65536.0.33").is_err());
    assert!(Endpoint::parse("ocpi-smb-pio:a:65536.3.4").is_ok());
}

#[test]
fn test_unknown_prefix() {
    let err = Endpoint::parse("ocpi-pci-pio:0:65536.0.1").unwrap_err();
    assert!(matches!(err, DataplaneError::UnsupportedEndpoint { .. }));
}
