//! Proof soundness over a multi-twig tree, plus the blob round-trip law.

use datatree::def::LEAF_COUNT_IN_TWIG;
use datatree::merkletree::check::check_hash_consistency;
use datatree::merkletree::helpers::{build_test_tree, small_config};
use datatree::merkletree::twig::NULL_ENTRY_HASH;
use datatree::{bytes_to_proof_path, TreeError};

#[test]
fn every_sampled_proof_reconstructs_the_root() {
    let tmp = tempfile::Builder::new().prefix("proof").tempdir().unwrap();
    let config = small_config(tmp.path().to_str().unwrap());

    let twig = LEAF_COUNT_IN_TWIG as i64;
    // all of twig 0 plus a few spread-out entries become inactive
    let deact: Vec<i64> = (0..twig).chain([5000, 5500, 5700, 5813, 6001]).collect();
    let (tree, root, _) = build_test_tree(&config, twig * 4 - 100, &deact).unwrap();
    check_hash_consistency(&tree);

    let max_sn = tree.next_serial_num();
    let mut samples: Vec<i64> = (0..max_sn).step_by(127).collect();
    samples.extend([1, twig - 1, twig, 2 * twig - 1, 2 * twig + 7, max_sn - 1]);
    for sn in samples {
        let proof = tree.get_proof(sn).unwrap();
        assert_eq!(sn, proof.serial_num);
        assert_eq!(root, proof.check(false).unwrap(), "proof of {}", sn);
        assert_eq!(root, proof.root);

        let bz = proof.to_bytes();
        let decoded = bytes_to_proof_path(&bz).unwrap();
        assert_eq!(proof, decoded);
        assert_eq!(root, decoded.check(true).unwrap());
    }

    // unwritten slots of the youngest twig prove as null leaves
    for sn in max_sn..max_sn + 5 {
        let proof = tree.get_proof(sn).unwrap();
        assert_eq!(*NULL_ENTRY_HASH, proof.leaf);
        assert_eq!(root, proof.check(true).unwrap());
    }
}

#[test]
fn tampered_proofs_fail() {
    let tmp = tempfile::Builder::new().prefix("proof2").tempdir().unwrap();
    let config = small_config(tmp.path().to_str().unwrap());
    let (tree, root, _) = build_test_tree(&config, 100, &[7]).unwrap();

    let mut proof = tree.get_proof(42).unwrap();
    proof.leaf[0] ^= 1;
    assert_ne!(root, proof.check(false).unwrap());
    assert!(matches!(proof.check(true), Err(TreeError::Corrupt { .. })));

    let mut proof = tree.get_proof(42).unwrap();
    proof.active_bits_mtl3[31] ^= 0x80;
    assert!(proof.check(true).is_err());
}

#[test]
#[should_panic(expected = "inside a block")]
fn proofs_inside_an_open_block_are_refused() {
    let tmp = tempfile::Builder::new().prefix("proof3").tempdir().unwrap();
    let config = small_config(tmp.path().to_str().unwrap());
    let (mut tree, _, _) = build_test_tree(&config, 10, &[]).unwrap();
    tree.deactivate_entry(3).unwrap();
    let err = tree.get_proof(1).unwrap_err();
    panic!("{}", err);
}
