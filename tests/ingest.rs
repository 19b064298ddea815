//! Ingest pipeline end-to-end: manifest → CAE → CTE → query → read-back.

mod common;

use std::io::Write;
use std::sync::Arc;

use context_runtime::bdev::BdevType;
use context_runtime::cae::{self, AssimilationCtx};
use context_runtime::{ContextInterface, PoolId, RuntimeError};

const TEST_FILE_SIZE: usize = 1024 * 1024;

/// 4-byte little-endian block indices, the classic patterned test file.
fn write_patterned_file(path: &std::path::Path, size: usize) {
    let mut file = std::fs::File::create(path).unwrap();
    let mut buf = Vec::with_capacity(size);
    for i in 0..(size / 4) as u32 {
        buf.extend_from_slice(&i.to_le_bytes());
    }
    file.write_all(&buf).unwrap();
}

fn interface_with_storage() -> ContextInterface {
    let ctx = common::init_runtime();
    let interface = ContextInterface::new(Arc::clone(&ctx)).expect("interface");
    interface
        .cte()
        .register_target(
            "ram::ingest_storage",
            BdevType::Ram,
            64 * 1024 * 1024,
            PoolId::new(800, 0),
        )
        .expect("target registration");
    interface
}

fn binary_entry(src: &std::path::Path, tag: &str) -> AssimilationCtx {
    AssimilationCtx {
        src: format!("file::{}", src.display()),
        dst: format!("iowarp::{tag}"),
        format: "binary".into(),
        depends_on: String::new(),
        range_off: 0,
        range_size: 0,
        src_token: String::new(),
        dst_token: String::new(),
        dataset_filter: None,
    }
}

#[test]
fn ingest_and_query_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f.bin");
    write_patterned_file(&src, TEST_FILE_SIZE);
    let expect = std::fs::read(&src).unwrap();

    let interface = interface_with_storage();
    let scheduled = interface
        .context_bundle(vec![binary_entry(&src, "roundtrip_tag")])
        .expect("bundle");
    assert_eq!(scheduled, 1);

    let blobs = interface
        .context_query("roundtrip_tag", ".*")
        .expect("query");
    assert!(!blobs.is_empty(), "ingest should produce at least one blob");

    // Blob names sort into stream order; their concatenation is the file.
    let mut sorted = blobs.clone();
    sorted.sort();
    let mut assembled = Vec::new();
    for name in &sorted {
        assembled.extend(
            interface
                .cte()
                .get_blob("roundtrip_tag", name, 0, 0)
                .expect("read back"),
        );
    }
    assert_eq!(assembled.len(), expect.len());
    assert_eq!(assembled, expect);

    let destroyed = interface
        .context_destroy(&["roundtrip_tag".to_string()])
        .expect("destroy");
    assert_eq!(destroyed, 1);
}

#[test]
fn empty_bundle_schedules_zero_tasks() {
    let interface = interface_with_storage();
    assert_eq!(interface.context_bundle(Vec::new()).expect("bundle"), 0);
}

#[test]
fn manifest_file_drives_ingest() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("manifest_src.bin");
    write_patterned_file(&src, 64 * 1024);

    let manifest_path = dir.path().join("transfer.yaml");
    std::fs::write(
        &manifest_path,
        format!(
            "transfers:\n  - src: \"file::{}\"\n    dst: \"iowarp::manifest_tag\"\n    format: binary\n",
            src.display()
        ),
    )
    .unwrap();

    let entries = cae::load_manifest(&manifest_path).expect("manifest parses");
    assert_eq!(entries.len(), 1);

    let interface = interface_with_storage();
    assert_eq!(interface.context_bundle(entries).expect("bundle"), 1);
    let blobs = interface.context_query("manifest_tag", ".*").unwrap();
    assert_eq!(blobs.len(), 1);
    assert_eq!(
        interface
            .cte()
            .get_blob_size("manifest_tag", &blobs[0])
            .unwrap(),
        64 * 1024
    );
}

#[test]
fn chained_dependencies_all_complete() {
    let dir = tempfile::tempdir().unwrap();
    let mut entries = Vec::new();
    for (i, tag) in ["chain_a", "chain_b", "chain_c"].iter().enumerate() {
        let src = dir.path().join(format!("chain_{i}.bin"));
        write_patterned_file(&src, 8 * 1024);
        let mut entry = binary_entry(&src, tag);
        if i > 0 {
            entry.depends_on = format!("iowarp::chain_{}", ["a", "b"][i - 1]);
        }
        entries.push(entry);
    }

    let interface = interface_with_storage();
    assert_eq!(interface.context_bundle(entries).expect("bundle"), 3);
    for tag in ["chain_a", "chain_b", "chain_c"] {
        let blobs = interface.context_query(tag, ".*").unwrap();
        assert_eq!(blobs.len(), 1, "tag {tag}");
    }
}

#[test]
fn range_fields_restrict_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("ranged.bin");
    std::fs::write(&src, b"0123456789").unwrap();

    let interface = interface_with_storage();
    let mut entry = binary_entry(&src, "ranged_tag");
    entry.range_off = 2;
    entry.range_size = 5;
    assert_eq!(interface.context_bundle(vec![entry]).unwrap(), 1);

    let blobs = interface.context_query("ranged_tag", ".*").unwrap();
    let data = interface
        .cte()
        .get_blob("ranged_tag", &blobs[0], 0, 0)
        .unwrap();
    assert_eq!(data, b"23456");
}

#[test]
fn missing_source_surfaces_through_the_bundle() {
    let interface = interface_with_storage();
    let entry = binary_entry(std::path::Path::new("/nonexistent/source.bin"), "ghost_tag");
    let err = interface.context_bundle(vec![entry]).unwrap_err();
    assert!(matches!(err, RuntimeError::Io { .. }));
}

#[test]
fn unknown_dependency_is_manifest_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("dep.bin");
    write_patterned_file(&src, 1024);

    let interface = interface_with_storage();
    let mut entry = binary_entry(&src, "dep_tag");
    entry.depends_on = "iowarp::never_declared".into();
    let err = interface.context_bundle(vec![entry]).unwrap_err();
    assert!(matches!(err, RuntimeError::ManifestInvalid(_)));
}
