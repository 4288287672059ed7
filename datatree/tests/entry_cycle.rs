//! Entry framing scenarios: plain round trips, magic-byte collisions, and
//! on-disk alignment.

use datatree::def::MAGIC_BYTES;
use datatree::entryfile::{entry_from_bytes, entry_to_bytes, Entry, EntryFile};
use datatree::TreeError;

fn entry(key: &str, value: &[u8], next_key: &str) -> Entry {
    Entry {
        key: key.as_bytes().to_vec(),
        value: value.to_vec(),
        next_key: next_key.as_bytes().to_vec(),
        height: 1,
        last_height: 0,
        serial_num: 0,
    }
}

#[test]
fn framing_without_collisions() {
    let e = entry("a", b"b", "c");
    let body = entry_to_bytes(&e, &[]);
    let (got, deact) = entry_from_bytes(&body).unwrap();
    assert_eq!(e, got);
    assert!(deact.is_empty());

    // the full frame on disk is 8-byte aligned
    let tmp = tempfile::Builder::new().prefix("frame").tempdir().unwrap();
    let ef = EntryFile::new(1024, 8192, tmp.path()).unwrap();
    let mut buffer = Vec::new();
    let pos = ef.append(&body, &mut buffer).unwrap();
    let pos2 = ef.append(&body, &mut buffer).unwrap();
    assert_eq!(0, pos % 8);
    assert_eq!(0, pos2 % 8);
    ef.close();
}

#[test]
fn framing_with_magic_collision() {
    // the value is exactly the magic marker
    let e = entry("k", &MAGIC_BYTES, "n");
    let body = entry_to_bytes(&e, &[]);
    // exactly one escaped position, and no marker survives in the body
    let positions = body
        .chunks_exact(4)
        .take_while(|c| *c != u32::MAX.to_le_bytes())
        .count();
    assert_eq!(1, positions);
    assert!(!body.windows(8).any(|w| w == MAGIC_BYTES));

    let (got, deact) = entry_from_bytes(&body).unwrap();
    assert_eq!(e, got);
    assert!(deact.is_empty());
}

#[test]
fn framing_with_many_collisions_and_deactivations() {
    for k in [2usize, 5, 16] {
        let mut e = entry("k", &[], "n");
        e.value = MAGIC_BYTES.repeat(k);
        let deact: Vec<i64> = (0..10).collect();
        let body = entry_to_bytes(&e, &deact);
        let (got, got_deact) = entry_from_bytes(&body).unwrap();
        assert_eq!(e, got);
        assert_eq!(deact, got_deact);
    }
}

#[test]
fn disk_round_trip_with_deactivation_list() {
    let tmp = tempfile::Builder::new().prefix("frame").tempdir().unwrap();
    let ef = EntryFile::new(1024, 8192, tmp.path()).unwrap();
    let mut buffer = Vec::new();

    let e = entry("key", b"ILOVEYOU and more", "next");
    let deact = vec![3i64, 5, 8];
    let pos = ef.append(&entry_to_bytes(&e, &deact), &mut buffer).unwrap();
    let second = ef
        .append(&entry_to_bytes(&entry("x", b"y", "z"), &[]), &mut buffer)
        .unwrap();
    ef.hp_file.flush(&mut buffer).unwrap();

    let (got, got_deact, next) = ef.read_entry(pos).unwrap();
    assert_eq!(e, got);
    assert_eq!(deact, got_deact);
    assert_eq!(second, next);
    assert_eq!(ef.skip_entry(pos).unwrap(), next);
}

#[test]
fn reads_below_the_pruned_head_fail_with_io() {
    let tmp = tempfile::Builder::new().prefix("frame").tempdir().unwrap();
    let ef = EntryFile::new(512, 512, tmp.path()).unwrap();
    let mut buffer = Vec::new();
    let e = entry("key", &[0xaa; 300], "next");
    let body = entry_to_bytes(&e, &[]);
    let first = ef.append(&body, &mut buffer).unwrap();
    let mut last = first;
    for _ in 0..5 {
        last = ef.append(&body, &mut buffer).unwrap();
    }
    ef.hp_file.flush(&mut buffer).unwrap();

    ef.prune_head(last).unwrap();
    match ef.read_entry(first) {
        Err(TreeError::Io(_)) => {}
        other => panic!("expected an IO error, got {:?}", other.map(|_| ())),
    }
    let (got, _, _) = ef.read_entry(last).unwrap();
    assert_eq!(e, got);
}
