//! Archive round trips: `save_task ∘ load_task` and
//! `local_save_out ∘ local_load_in` are identities for registered methods.

mod common;

use context_runtime::module::{AnyOut, AnyTask, Module};
use context_runtime::task::PoolId;
use context_runtime::{admin, bdev, cae, cte};

/// save → load → save must reproduce the original bytes.
fn assert_task_round_trip(module: &dyn Module, method: u32, task: AnyTask) {
    let bytes = module.save_task(method, &task).expect("save_task");
    let reloaded = module.load_task(method, &bytes).expect("load_task");
    let bytes_again = module.save_task(method, &reloaded).expect("re-save");
    assert_eq!(
        bytes, bytes_again,
        "task round trip for {}::{}",
        module.name(),
        method
    );
}

fn assert_out_round_trip(module: &dyn Module, method: u32, out: AnyOut) {
    let bytes = module.local_save_out(method, out.as_ref()).expect("save out");
    let reloaded = module.local_load_in(method, &bytes).expect("load out");
    let bytes_again = module
        .local_save_out(method, reloaded.as_ref())
        .expect("re-save out");
    assert_eq!(
        bytes, bytes_again,
        "result round trip for {}::{}",
        module.name(),
        method
    );
}

fn module_of(pool: PoolId) -> std::sync::Arc<dyn Module> {
    let ctx = common::init_runtime();
    let runtime = ctx.server().expect("integrated runtime");
    std::sync::Arc::clone(
        &runtime
            .pools()
            .container(pool, 0)
            .expect("built-in container")
            .module,
    )
}

#[test]
fn admin_archives_round_trip() {
    let module = module_of(PoolId::ADMIN);
    assert_task_round_trip(
        module.as_ref(),
        admin::methods::GET_OR_CREATE_POOL,
        Box::new(admin::GetOrCreatePoolTask {
            name: "roundtrip".into(),
            id: PoolId::new(42, 7),
            module: "bdev".into(),
            params: vec![1, 2, 3],
        }),
    );
    assert_task_round_trip(
        module.as_ref(),
        admin::methods::MIGRATE_CONTAINERS,
        Box::new(admin::MigrateContainersTask {
            migrations: vec![admin::MigrateInfo {
                pool: PoolId::new(200, 0),
                container_id: 0,
                dest_node: 1,
            }],
        }),
    );
    assert_out_round_trip(
        module.as_ref(),
        admin::methods::MIGRATE_CONTAINERS,
        Box::new(admin::MigrateContainersResult {
            num_migrated: 1,
            diagnostic: Some("partial".into()),
        }),
    );
    assert_task_round_trip(
        module.as_ref(),
        admin::methods::HEARTBEAT,
        Box::new(admin::HeartbeatTask { node: 3 }),
    );
}

#[test]
fn cte_archives_round_trip() {
    let module = module_of(cte::CTE_POOL);
    assert_task_round_trip(
        module.as_ref(),
        cte::methods::PUT_BLOB,
        Box::new(cte::PutBlobTask {
            tag: "t".into(),
            blob: "b".into(),
            off: 4096,
            data: (0..255u8).collect(),
            score: 0.75,
        }),
    );
    assert_task_round_trip(
        module.as_ref(),
        cte::methods::TAG_QUERY,
        Box::new(cte::TagQueryTask {
            regex: ".*".into(),
            max: 10,
        }),
    );
    assert_out_round_trip(
        module.as_ref(),
        cte::methods::GET_BLOB,
        Box::new(cte::GetBlobResult {
            data: vec![9u8; 1024],
        }),
    );
}

#[test]
fn cae_archives_round_trip() {
    let module = module_of(cae::CAE_POOL);
    assert_task_round_trip(
        module.as_ref(),
        cae::methods::PARSE_MANIFEST,
        Box::new(cae::ParseManifestTask {
            entries: vec![cae::AssimilationCtx {
                src: "file::/tmp/a".into(),
                dst: "iowarp::t".into(),
                format: "binary".into(),
                depends_on: String::new(),
                range_off: 0,
                range_size: 0,
                src_token: String::new(),
                dst_token: String::new(),
                dataset_filter: Some(cae::DatasetFilter {
                    include_patterns: vec!["^/data".into()],
                    exclude_patterns: vec![],
                }),
            }],
        }),
    );
    assert_out_round_trip(
        module.as_ref(),
        cae::methods::PARSE_MANIFEST,
        Box::new(cae::ParseManifestResult {
            num_tasks_scheduled: 4,
        }),
    );
}

#[test]
fn new_copy_is_a_deep_copy() {
    let module = module_of(cte::CTE_POOL);
    let original: AnyTask = Box::new(cte::PutBlobTask {
        tag: "copy".into(),
        blob: "blob".into(),
        off: 0,
        data: vec![5u8; 64],
        score: 0.5,
    });
    let copy = module
        .new_copy(cte::methods::PUT_BLOB, &original)
        .expect("new_copy");
    let a = module.save_task(cte::methods::PUT_BLOB, &original).unwrap();
    let b = module.save_task(cte::methods::PUT_BLOB, &copy).unwrap();
    assert_eq!(a, b);
}

#[test]
fn bdev_tables_reject_unknown_methods() {
    // The bdev table is reachable without a live target container.
    let task: AnyTask = Box::new(bdev::WriteTask {
        off: 0,
        data: vec![1, 2, 3],
    });
    let bytes = bdev::methods::save_task(bdev::methods::WRITE, &task).unwrap();
    let reloaded = bdev::methods::load_task(bdev::methods::WRITE, &bytes).unwrap();
    assert_eq!(
        bdev::methods::save_task(bdev::methods::WRITE, &reloaded).unwrap(),
        bytes
    );
    assert!(bdev::methods::save_task(77, &task).is_err());
    assert!(bdev::methods::load_task(77, &bytes).is_err());
}
