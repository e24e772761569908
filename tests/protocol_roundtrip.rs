//! Packet envelope scenarios: header plumbing, both framings, error
//! form, splitting, and out-of-order reassembly.

use knvtree::protocol::{tags, DEFAULT_MAX_PKG_SIZE};
use knvtree::{Key, KnvProtocol};

fn sample_request(body_size: usize) -> KnvProtocol {
    let mut p = KnvProtocol::new(0x4001, 2, 42).unwrap();
    let body = p.add_body(Key::from_int(12345678)).unwrap();
    let arena = p.arena_mut();
    let domain = arena.insert_subnode(body, 11, Key::none()).unwrap();
    arena
        .insert_str_leaf(domain, 102, &vec![0x5Au8; body_size])
        .unwrap();
    p
}

#[test]
fn native_encode_decode_roundtrip() -> eyre::Result<()> {
    let mut p = sample_request(64);
    let bytes = p.encode()?;

    let mut q = KnvProtocol::decode(&bytes)?;
    assert_eq!(q.command(), 0x4001);
    assert_eq!(q.subcommand(), 2);
    assert_eq!(q.sequence(), 42);
    assert_eq!(q.retcode(), 0);
    assert_eq!(q.key().map(|k| k.int_val()), Some(12345678));

    let body = q.body().expect("body");
    let domain = q.arena_mut().find_child_by_tag(body, 11).expect("domain");
    assert_eq!(q.arena_mut().child_str(domain, 102).len(), 64);
    Ok(())
}

#[test]
fn batch_bodies_iterate_in_order() -> eyre::Result<()> {
    let mut p = KnvProtocol::new(1, 0, 1)?;
    p.add_body(Key::from_int(1))?;
    p.add_body(Key::from_int(2))?;
    p.add_body(Key::from_int(3))?;

    let bytes = p.encode()?;
    let mut q = KnvProtocol::decode(&bytes)?;
    let mut keys = Vec::new();
    let mut cur = q.first_request();
    while let Some(b) = cur {
        keys.push(q.arena().key(b).int_val());
        cur = q.next_request();
    }
    assert_eq!(keys, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn error_form_drops_the_body() -> eyre::Result<()> {
    let mut p = sample_request(256);
    p.set_retcode(13)?;
    p.set_error_msg(b"no such record")?;

    let bytes = p.encode()?;
    let q = KnvProtocol::decode(&bytes)?;
    assert_eq!(q.retcode(), 13);
    assert_eq!(q.error_msg(), b"no such record");
    assert!(q.body().is_none());
    Ok(())
}

#[test]
fn legacy_frame_layout_is_bit_exact() -> eyre::Result<()> {
    let mut p = sample_request(32);
    let frame = p.encode_legacy()?;

    assert_eq!(frame[0], 0x28);
    assert_eq!(*frame.last().unwrap(), 0x29);
    let hlen = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
    let blen = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]) as usize;
    assert_eq!(frame.len(), 10 + hlen + blen);

    // The multi-body variant embeds serialized KNV bodies, which start
    // with the body field marker.
    assert_eq!(&frame[9 + hlen..9 + hlen + 2], &[0xEA, 0xDA]);
    Ok(())
}

#[test]
fn legacy_multi_body_roundtrip() -> eyre::Result<()> {
    let mut p = sample_request(32);
    let frame = p.encode_legacy()?;

    let mut q = KnvProtocol::decode(&frame)?;
    assert_eq!(q.command(), 0x4001);
    assert_eq!(q.sequence(), 42);
    let body = q.body().expect("body");
    assert_eq!(q.arena().key(body).int_val(), 12345678);
    let domain = q.arena_mut().find_child_by_tag(body, 11).expect("domain");
    assert_eq!(q.arena_mut().child_str(domain, 102).len(), 32);
    Ok(())
}

#[test]
fn legacy_compat_roundtrip_carries_bare_payload() -> eyre::Result<()> {
    let mut p = sample_request(32);
    let frame = p.encode_legacy_compat()?;

    // The compat body is the bare body payload: no 0xEA 0xDA marker.
    let hlen = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
    assert_ne!(&frame[9 + hlen..9 + hlen + 2], &[0xEA, 0xDA]);

    let mut q = KnvProtocol::decode(&frame)?;
    assert_eq!(q.command(), 0x4001);
    let body = q.body().expect("body");
    // Domains live directly under the reconstructed body.
    let domain = q.arena_mut().find_child_by_tag(body, 11).expect("domain");
    assert_eq!(q.arena_mut().child_str(domain, 102).len(), 32);
    Ok(())
}

#[test]
fn legacy_frame_rejects_corruption() {
    let mut p = sample_request(32);
    let mut frame = p.encode_legacy().unwrap();
    assert!(KnvProtocol::decode(&frame[..5]).is_err());
    let end = frame.len() - 1;
    frame[end] = 0x00; // clobber ETX
    assert!(KnvProtocol::decode(&frame).is_err());
}

#[test]
fn split_respects_max_pkg_size_and_reassembles_in_reverse() -> eyre::Result<()> {
    let mut p = sample_request(200_000);
    p.set_allow_split(true, 8000);
    let original = p.encode()?;

    p.split()?;
    let n = p.part_count();
    assert!(n > 1);
    // Part payload is bounded by max size minus header overhead, so the
    // count is at least the ideal and within one of it.
    let ideal = original.len().div_ceil(8000);
    assert!((n as usize) >= ideal && (n as usize) <= ideal + (original.len() / 8000 / 8) + 1);

    let mut parts = Vec::new();
    for k in 0..n {
        let bytes = p.encode_part(k)?;
        assert!(bytes.len() <= 8000 + 64, "part {k} exceeds ceiling");
        parts.push(bytes);
    }

    // Feed the receiver in reverse order.
    let mut rx = KnvProtocol::decode(&parts[n as usize - 1])?;
    assert!(!rx.is_complete());
    for bytes in parts[..n as usize - 1].iter().rev() {
        let part = KnvProtocol::decode(bytes)?;
        rx.add_partial(part)?;
    }
    assert!(rx.is_complete());

    // The reassembled packet is the original, body bytes included.
    assert_eq!(rx.command(), 0x4001);
    assert_eq!(rx.sequence(), 42);
    let body = rx.body().expect("body");
    let reassembled = rx.arena_mut().serialize(body, true)?;
    let mut orig = sample_request(200_000);
    let orig_body = orig.body().expect("body");
    let expected = orig.arena_mut().serialize(orig_body, true)?;
    assert_eq!(reassembled, expected);
    Ok(())
}

#[test]
fn duplicate_part_is_rejected() -> eyre::Result<()> {
    let mut p = sample_request(200_000);
    p.set_allow_split(true, 8000);
    p.split()?;
    let part0 = p.encode_part(0)?;
    let part1 = p.encode_part(1)?;

    let mut rx = KnvProtocol::decode(&part0)?;
    rx.add_partial(KnvProtocol::decode(&part1)?)?;
    let err = rx.add_partial(KnvProtocol::decode(&part1)?).unwrap_err();
    assert_eq!(err, knvtree::KnvError::PartialDuplicate);
    assert!(!rx.is_complete());
    Ok(())
}

#[test]
fn complete_packet_replaces_partial_state() -> eyre::Result<()> {
    let mut big = sample_request(200_000);
    big.set_allow_split(true, 8000);
    big.split()?;
    let part0 = big.encode_part(0)?;

    let mut small = sample_request(8);
    let whole = small.encode()?;

    let mut rx = KnvProtocol::decode(&part0)?;
    assert!(!rx.is_complete());
    rx.add_partial(KnvProtocol::decode(&whole)?)?;
    assert!(rx.is_complete());
    assert_eq!(rx.key().map(|k| k.int_val()), Some(12345678));
    Ok(())
}

#[test]
fn small_packets_do_not_split() -> eyre::Result<()> {
    let mut p = sample_request(100);
    p.set_allow_split(true, 8000);
    p.split()?;
    assert_eq!(p.part_count(), 1);
    // encode_part(0) of an unsplit packet is just the packet.
    let bytes = p.encode_part(0)?;
    let q = KnvProtocol::decode(&bytes)?;
    assert!(q.is_complete());
    Ok(())
}

#[test]
fn max_pkg_size_is_clamped() {
    let mut p = KnvProtocol::new(1, 0, 1).unwrap();
    assert_eq!(p.max_pkg_size(), DEFAULT_MAX_PKG_SIZE);
    p.set_allow_split(true, 64); // below the floor
    assert_eq!(p.max_pkg_size(), DEFAULT_MAX_PKG_SIZE);
    p.set_allow_split(true, 8000);
    assert_eq!(p.max_pkg_size(), 8000);
}

#[test]
fn header_fields_roundtrip_through_the_wire() -> eyre::Result<()> {
    let mut p = KnvProtocol::new(7, 8, 9)?;
    p.set_rsp_addr(&[127, 0, 0, 1, 0x1F, 0x90])?;
    p.set_req_split(true, 4096)?;
    p.set_header_int_field(tags::HDR_KEY, 555)?;

    let bytes = p.encode()?;
    let mut q = KnvProtocol::decode(&bytes)?;
    assert_eq!(q.rsp_addr(), &[127, 0, 0, 1, 0x1F, 0x90]);
    assert_eq!(q.header_int_field(tags::HDR_ALLOW_SPLIT), 1);
    assert_eq!(q.header_int_field(tags::HDR_MAX_PKG_SIZE), 4096);
    assert_eq!(q.header_int_field(tags::HDR_KEY), 555);
    assert!(q.allow_split());
    Ok(())
}

#[test]
fn domains_are_addressable_through_the_protocol() -> eyre::Result<()> {
    let mut p = KnvProtocol::new(1, 0, 1)?;
    p.add_body(Key::from_int(99))?;
    let d = p.add_domain(12)?;
    p.arena_mut().insert_int_leaf(d, 102, 7)?;
    assert_eq!(p.domain_count(), 1);
    assert!(p.domain(12).is_some());
    assert!(p.domain(13).is_none());

    // Same id twice returns the existing domain.
    let again = p.add_domain(12)?;
    assert_eq!(again, d);

    p.remove_domain(12)?;
    assert_eq!(p.domain_count(), 0);
    Ok(())
}
