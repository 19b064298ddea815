//! CTE tag/blob semantics against a live runtime.

mod common;

use std::sync::Arc;

use context_runtime::bdev::BdevType;
use context_runtime::{CteClient, PoolId, RuntimeError};

fn cte_with_storage() -> CteClient {
    let ctx = common::init_runtime();
    let cte = CteClient::new(Arc::clone(&ctx)).expect("cte client");
    cte.register_target(
        "ram::cte_storage",
        BdevType::Ram,
        64 * 1024 * 1024,
        PoolId::new(810, 0),
    )
    .expect("target registration");
    cte
}

#[test]
fn put_then_get_is_bit_identical() {
    let cte = cte_with_storage();
    cte.get_or_create_tag("bits").unwrap();

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(
        cte.put_blob("bits", "payload", 0, data.clone(), 0.8).unwrap(),
        data.len() as u64
    );
    let back = cte.get_blob("bits", "payload", 0, 0).unwrap();
    assert_eq!(back, data);

    // Ranged read.
    let middle = cte.get_blob("bits", "payload", 1000, 64).unwrap();
    assert_eq!(middle, data[1000..1064]);
}

#[test]
fn partial_writes_union_into_final_content() {
    let cte = cte_with_storage();
    cte.get_or_create_tag("partial").unwrap();

    cte.put_blob("partial", "doc", 0, vec![b'a'; 16], 0.5).unwrap();
    cte.put_blob("partial", "doc", 8, vec![b'b'; 16], 0.5).unwrap();

    let back = cte.get_blob("partial", "doc", 0, 0).unwrap();
    assert_eq!(back.len(), 24);
    assert_eq!(&back[..8], &[b'a'; 8]);
    assert_eq!(&back[8..], &[b'b'; 16]);
}

#[test]
fn writes_spanning_chunks_round_trip() {
    let cte = cte_with_storage();
    cte.get_or_create_tag("spans").unwrap();

    // Straddle two 256 KiB chunk boundaries.
    let data: Vec<u8> = (0..600_000u32).map(|i| (i % 193) as u8).collect();
    let off = 200_000u64;
    cte.put_blob("spans", "wide", off, data.clone(), 0.5).unwrap();

    let back = cte.get_blob("spans", "wide", off, data.len() as u64).unwrap();
    assert_eq!(back, data);
    // The hole before the write reads back as zeros.
    let hole = cte.get_blob("spans", "wide", 0, 100).unwrap();
    assert!(hole.iter().all(|b| *b == 0));
}

#[test]
fn zero_length_put_is_a_successful_noop() {
    let cte = cte_with_storage();
    cte.get_or_create_tag("zero").unwrap();
    assert_eq!(cte.put_blob("zero", "empty", 0, Vec::new(), 0.5).unwrap(), 0);
}

#[test]
fn tag_ids_are_stable_and_unique() {
    let cte = cte_with_storage();
    let a = cte.get_or_create_tag("stable_a").unwrap();
    let a_again = cte.get_or_create_tag("stable_a").unwrap();
    let b = cte.get_or_create_tag("stable_b").unwrap();
    assert_eq!(a, a_again);
    assert_ne!(a, b);
}

#[test]
fn deletion_and_not_found_errors() {
    let cte = cte_with_storage();
    cte.get_or_create_tag("doomed").unwrap();
    cte.put_blob("doomed", "b1", 0, vec![1, 2, 3], 0.5).unwrap();

    cte.del_blob("doomed", "b1").unwrap();
    assert!(matches!(
        cte.get_blob("doomed", "b1", 0, 0),
        Err(RuntimeError::BlobNotFound(_))
    ));
    cte.del_tag("doomed").unwrap();
    assert!(matches!(
        cte.put_blob("doomed", "b2", 0, vec![1], 0.5),
        Err(RuntimeError::TagNotFound(_))
    ));
    assert!(matches!(
        cte.del_tag("doomed"),
        Err(RuntimeError::TagNotFound(_))
    ));
}

#[test]
fn queries_filter_and_cap() {
    let cte = cte_with_storage();
    for i in 0..5 {
        cte.get_or_create_tag(&format!("query_tag_{i}")).unwrap();
        cte.put_blob(
            &format!("query_tag_{i}"),
            &format!("blob_{i}"),
            0,
            vec![0u8; 8],
            0.5,
        )
        .unwrap();
    }

    let all = cte.tag_query("^query_tag_.*", 100).unwrap();
    assert_eq!(all.len(), 5);
    let capped = cte.tag_query("^query_tag_.*", 2).unwrap();
    assert_eq!(capped.len(), 2);

    let pairs = cte.blob_query("^query_tag_[01]$", ".*", 100).unwrap();
    assert_eq!(pairs.len(), 2);
    assert!(pairs.iter().all(|(tag, blob)| {
        tag.starts_with("query_tag_") && blob.starts_with("blob_")
    }));

    let bad = cte.tag_query("([", 10);
    assert!(matches!(bad, Err(RuntimeError::ManifestInvalid(_))));
}

#[test]
fn contained_blobs_and_sizes() {
    let cte = cte_with_storage();
    cte.get_or_create_tag("inventory").unwrap();
    cte.put_blob("inventory", "x", 0, vec![0u8; 10], 0.5).unwrap();
    cte.put_blob("inventory", "y", 0, vec![0u8; 20], 0.5).unwrap();

    assert_eq!(cte.get_contained_blobs("inventory").unwrap(), vec!["x", "y"]);
    assert_eq!(cte.get_blob_size("inventory", "y").unwrap(), 20);
}

#[test]
fn reorganize_moves_blob_between_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let backing = dir.path().join("tier2.bin");
    let cte = cte_with_storage();
    cte.register_target(
        &format!("file::{}", backing.display()),
        BdevType::File,
        16 * 1024 * 1024,
        PoolId::new(811, 0),
    )
    .unwrap();

    cte.get_or_create_tag("tiered").unwrap();
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 97) as u8).collect();
    cte.put_blob("tiered", "mover", 0, data.clone(), 0.9).unwrap();

    // A hot blob lands on ram; demote it and the chunks follow.
    let before = cte.get_blob_info("tiered", "mover").unwrap();
    assert_eq!(before.targets, vec!["ram::cte_storage".to_string()]);

    cte.reorganize_blob("tiered", "mover", 0.1).unwrap();
    let after = cte.get_blob_info("tiered", "mover").unwrap();
    assert_eq!(after.targets, vec![format!("file::{}", backing.display())]);
    assert!((after.score - 0.1).abs() < f32::EPSILON);

    let back = cte.get_blob("tiered", "mover", 0, 0).unwrap();
    assert_eq!(back, data);
}

#[test]
fn target_listing_reports_registration() {
    let cte = cte_with_storage();
    let targets = cte.list_targets().unwrap();
    assert!(targets.iter().any(|t| t.name == "ram::cte_storage"));
    let stats = cte.stat_targets().unwrap();
    let ram = stats.iter().find(|t| t.name == "ram::cte_storage").unwrap();
    assert!(ram.free <= ram.capacity);
}
