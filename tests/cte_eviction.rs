//! Eviction under target pressure: victim selection, spill to a
//! persistent tier, and rematerialization on the next read.
//!
//! Runs alone in its own binary so the tiny targets see no other traffic.

mod common;

use std::sync::Arc;

use context_runtime::bdev::BdevType;
use context_runtime::cte::CHUNK_SIZE;
use context_runtime::{CteClient, PoolId};

fn patterned(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

#[test]
fn cold_blob_is_evicted_and_rematerialized() {
    let ctx = common::init_runtime();
    let cte = CteClient::new(Arc::clone(&ctx)).expect("cte client");

    // Two chunks of fast capacity, plus a roomy persistent spill tier.
    cte.register_target(
        "ram::tiny_fast",
        BdevType::Ram,
        2 * CHUNK_SIZE,
        PoolId::new(820, 0),
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let backing = dir.path().join("spill.bin");
    cte.register_target(
        &format!("file::{}", backing.display()),
        BdevType::File,
        64 * CHUNK_SIZE,
        PoolId::new(821, 0),
    )
    .unwrap();

    // A ram-pinned tag forces the capacity decision instead of a
    // placement fallback to the file tier.
    cte.get_or_create_tag_with_policy("pinned", Some(BdevType::Ram))
        .unwrap();

    let cold = patterned(1, CHUNK_SIZE as usize);
    let hot = patterned(2, CHUNK_SIZE as usize);
    let warm = patterned(3, CHUNK_SIZE as usize);

    cte.put_blob("pinned", "cold", 0, cold.clone(), 0.1).unwrap();
    cte.put_blob("pinned", "hot", 0, hot.clone(), 0.9).unwrap();

    // Fast tier is full; the lowest-score blob makes room.
    cte.put_blob("pinned", "warm", 0, warm.clone(), 0.5).unwrap();

    let cold_info = cte.get_blob_info("pinned", "cold").unwrap();
    assert!(!cold_info.resident, "lowest-score blob should be evicted");
    let hot_info = cte.get_blob_info("pinned", "hot").unwrap();
    assert!(hot_info.resident, "high-score blob stays resident");

    // Reading the evicted blob rematerializes it bit-identically.
    let back = cte.get_blob("pinned", "cold", 0, 0).unwrap();
    assert_eq!(back, cold);
    let cold_info = cte.get_blob_info("pinned", "cold").unwrap();
    assert!(cold_info.resident);

    // Every blob still reads back intact after the shuffle.
    assert_eq!(cte.get_blob("pinned", "hot", 0, 0).unwrap(), hot);
    assert_eq!(cte.get_blob("pinned", "warm", 0, 0).unwrap(), warm);
}
