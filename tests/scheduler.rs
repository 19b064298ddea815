//! Scheduler behavior: co-primitive fairness, cancellation, migration,
//! monitor shape, and dispatch errors, exercised through a test module
//! registered on a live runtime.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use context_runtime::admin::MigrateInfo;
use context_runtime::module::{AnyOut, AnyTask, Module, RunContext, TaskBody};
use context_runtime::sched::{yield_now, CoFuture, CoMutex};
use context_runtime::task::MethodId;
use context_runtime::{AdminClient, PoolId, PoolQuery, RuntimeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeqTask {
    seq: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeqResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NoopTask {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NoopResult {}

mod methods {
    use super::*;

    context_runtime::method_table! {
        module "sched_probe";
        10 => LOCK_INC "LockInc" (SeqTask => SeqResult),
        11 => WAIT_FOREVER "WaitForever" (NoopTask => NoopResult),
        12 => NOOP "Noop" (NoopTask => NoopResult),
    }
}

#[derive(Default)]
struct ProbeState {
    mutex: CoMutex,
    counter: AtomicU32,
    order: Mutex<Vec<u32>>,
    never: CoFuture<()>,
}

struct ProbeModule {
    state: Arc<ProbeState>,
}

impl Module for ProbeModule {
    fn name(&self) -> &'static str {
        "sched_probe"
    }

    fn method_name(&self, method: MethodId) -> Option<&'static str> {
        methods::method_name(method)
    }

    fn run(&self, method: MethodId, task: AnyTask, _ctx: RunContext) -> Result<TaskBody, RuntimeError> {
        let state = Arc::clone(&self.state);
        match method {
            methods::LOCK_INC => {
                let task = task.downcast::<SeqTask>().unwrap();
                Ok(Box::pin(async move {
                    let _guard = state.mutex.lock().await;
                    // Hold the lock across a suspension so every later
                    // submitter actually contends.
                    yield_now().await;
                    state.order.lock().unwrap().push(task.seq);
                    state.counter.fetch_add(1, Ordering::AcqRel);
                    Ok(Box::new(SeqResult {}) as AnyOut)
                }))
            }
            methods::WAIT_FOREVER => Ok(Box::pin(async move {
                state.never.wait().await;
                Ok(Box::new(NoopResult {}) as AnyOut)
            })),
            methods::NOOP => Ok(Box::pin(async move {
                Ok(Box::new(NoopResult {}) as AnyOut)
            })),
            other => Err(RuntimeError::MethodNotFound {
                module: "sched_probe".into(),
                method: other,
            }),
        }
    }

    fn save_task(&self, method: MethodId, task: &AnyTask) -> Result<Vec<u8>, RuntimeError> {
        methods::save_task(method, task)
    }

    fn load_task(&self, method: MethodId, bytes: &[u8]) -> Result<AnyTask, RuntimeError> {
        methods::load_task(method, bytes)
    }

    fn local_save_out(&self, method: MethodId, out: &dyn std::any::Any) -> Result<Vec<u8>, RuntimeError> {
        methods::save_out(method, out)
    }

    fn local_load_in(&self, method: MethodId, bytes: &[u8]) -> Result<AnyOut, RuntimeError> {
        methods::load_out(method, bytes)
    }

    fn new_copy(&self, method: MethodId, task: &AnyTask) -> Result<AnyTask, RuntimeError> {
        methods::new_copy(method, task)
    }
}

/// Register the probe module (once) and create a pool for the given test.
fn probe_pool(name: &str, id: PoolId) -> (Arc<context_runtime::ContextClient>, Arc<ProbeState>) {
    let ctx = common::init_runtime();
    let state = Arc::new(ProbeState::default());
    let module_name = format!("sched_probe_{name}");
    {
        let state = Arc::clone(&state);
        let runtime = ctx.server().expect("integrated runtime");
        runtime.pools().modules().register(
            &module_name,
            Arc::new(
                move |_env: &context_runtime::module::ModuleEnv, _pool, _name, _params: &[u8]| {
                    Ok(Arc::new(ProbeModule {
                        state: Arc::clone(&state),
                    }) as Arc<dyn Module>)
                },
            ),
        );
    }
    AdminClient::new(Arc::clone(&ctx))
        .get_or_create_pool(&module_name, id, &module_name, Vec::new())
        .expect("pool creation");
    (ctx, state)
}

#[test]
fn comutex_is_fair_across_tasks() {
    let (ctx, state) = probe_pool("fair", PoolId::new(900, 0));

    let futures: Vec<_> = (0..8)
        .map(|seq| {
            ctx.submit(
                PoolId::new(900, 0),
                0,
                methods::LOCK_INC,
                PoolQuery::Local,
                SeqTask { seq },
            )
            .expect("submit")
        })
        .collect();
    for future in &futures {
        future.wait().expect("task completes");
    }

    assert_eq!(state.counter.load(Ordering::Acquire), 8);
    // Acquisition order equals submission order.
    assert_eq!(*state.order.lock().unwrap(), (0..8).collect::<Vec<u32>>());
}

#[test]
fn cancellation_reaches_a_terminal_state() {
    let (ctx, _state) = probe_pool("cancel", PoolId::new(901, 0));

    let future = ctx
        .submit(
            PoolId::new(901, 0),
            0,
            methods::WAIT_FOREVER,
            PoolQuery::Local,
            NoopTask {},
        )
        .expect("submit");

    // Let the task start and park on the never-signalled future.
    let deadline = Instant::now() + Duration::from_secs(2);
    while future.state() == context_runtime::task::FutureState::Pending {
        assert!(Instant::now() < deadline, "task never started");
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(10));

    future.cancel();
    assert!(matches!(future.wait(), Err(RuntimeError::Cancelled)));
    assert_eq!(future.state(), context_runtime::task::FutureState::Cancelled);
}

#[test]
fn migration_keeps_outstanding_tasks_completing() {
    let (ctx, _state) = probe_pool("migrate", PoolId::new(200, 0));

    let futures: Vec<_> = (0..100)
        .map(|_| {
            ctx.submit(
                PoolId::new(200, 0),
                0,
                methods::NOOP,
                PoolQuery::Local,
                NoopTask {},
            )
            .expect("submit")
        })
        .collect();

    let admin = AdminClient::new(Arc::clone(&ctx));
    let result = admin
        .migrate_containers(vec![MigrateInfo {
            pool: PoolId::new(200, 0),
            container_id: 0,
            dest_node: 1,
        }])
        .expect("migration");
    assert_eq!(result.num_migrated, 1);
    assert!(result.diagnostic.is_none(), "{:?}", result.diagnostic);

    for future in &futures {
        future.wait().expect("task survives migration");
    }
}

#[test]
fn monitor_reports_every_worker_with_all_fields() {
    let ctx = common::init_runtime();
    let admin = AdminClient::new(ctx);
    let report = admin.system_monitor().expect("monitor");
    assert_eq!(report.workers.len(), common::TEST_WORKERS);

    let json = serde_json::to_value(&report).unwrap();
    let workers = json["workers"].as_array().unwrap();
    assert_eq!(workers.len(), common::TEST_WORKERS);
    for worker in workers {
        for field in [
            "worker_id",
            "is_running",
            "is_active",
            "idle_iterations",
            "num_queued_tasks",
            "num_blocked_tasks",
            "num_periodic_tasks",
            "suspend_period_us",
        ] {
            assert!(worker.get(field).is_some(), "missing field {field}");
        }
    }
}

#[test]
fn unknown_method_is_rejected() {
    let (ctx, _state) = probe_pool("badmethod", PoolId::new(902, 0));
    let future = ctx
        .submit(PoolId::new(902, 0), 0, 99, PoolQuery::Local, NoopTask {})
        .expect("submit itself succeeds");
    assert!(matches!(
        future.wait(),
        Err(RuntimeError::MethodNotFound { .. })
    ));
}

#[test]
fn specific_route_to_unknown_node_is_unreachable() {
    let (ctx, _state) = probe_pool("route", PoolId::new(903, 0));
    let err = ctx
        .submit(
            PoolId::new(903, 0),
            0,
            methods::NOOP,
            PoolQuery::Specific(77),
            NoopTask {},
        )
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Unreachable(77)));
}

#[test]
fn heartbeat_keeps_the_local_node_fresh() {
    let ctx = common::init_runtime();
    let admin = AdminClient::new(ctx);
    // Give the periodic heartbeat a couple of firings.
    std::thread::sleep(Duration::from_millis(50));
    let probe = admin.heartbeat_probe().expect("probe");
    assert!(probe.nodes.iter().any(|(node, _)| *node == 0));
}

#[test]
fn pool_creation_is_idempotent_and_rejects_conflicts() {
    let (ctx, _state) = probe_pool("idem", PoolId::new(904, 0));
    let admin = AdminClient::new(Arc::clone(&ctx));

    // Same (id, name, params): fine.
    let again = admin
        .get_or_create_pool(
            "sched_probe_idem",
            PoolId::new(904, 0),
            "sched_probe_idem",
            Vec::new(),
        )
        .expect("idempotent re-create");
    assert_eq!(again.id, PoolId::new(904, 0));

    // Same id, different name: rejected.
    let err = admin
        .get_or_create_pool(
            "different_name",
            PoolId::new(904, 0),
            "sched_probe_idem",
            Vec::new(),
        )
        .unwrap_err();
    assert!(matches!(err, RuntimeError::PoolNotFound(_)));
}
