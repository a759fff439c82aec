//! Worker pool: engines on dedicated threads behind a Send handle.

use ember_runtime::{
    Arity, EmberError, Engine, EngineConfig, HostCall, HostFunction, HostValue,
    MemorySourceProvider, WorkerPool,
};
use serial_test::serial;
use std::sync::Arc;

fn pool_engine() -> ember_runtime::EngineBuilder {
    Engine::builder()
        .config(EngineConfig::new().ini("max_execution_steps", "100000"))
        .function(HostFunction::new("add", Arity::Exact(2), |args| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(HostValue::Int(a + b))
        }))
}

#[tokio::test]
#[serial]
async fn test_execute_on_pool() {
    let pool = WorkerPool::builder()
        .pool_size(2)
        .engine(pool_engine())
        .build()
        .unwrap();
    assert_eq!(pool.pool_size(), 2);
    let handle = pool.handle();

    let (value, diagnostics) = handle
        .execute("<?php echo 'hi'; return add(40, 2);")
        .await
        .unwrap();
    assert_eq!(value, HostValue::Int(42));
    assert_eq!(diagnostics.output, "hi");

    let (value, _) = handle
        .execute_with(
            "<?php return $greeting . ', ' . $who;",
            "greet.php",
            vec![
                ("greeting".to_string(), HostValue::from("hello")),
                ("who".to_string(), HostValue::from("pool")),
            ],
        )
        .await
        .unwrap();
    assert_eq!(value, HostValue::from("hello, pool"));

    let (value, _) = handle
        .call("add", vec![HostValue::Int(1), HostValue::Int(2)])
        .await
        .unwrap();
    assert_eq!(value, HostValue::Int(3));

    pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_jobs_from_many_tasks() {
    let pool = WorkerPool::builder()
        .pool_size(2)
        .engine(pool_engine())
        .build()
        .unwrap();
    let handle = pool.handle();

    let tasks: Vec<_> = (0..8i64)
        .map(|i| {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .execute_with("<?php return add($n, $n);", "job.php", vec![("n".into(), i.into())])
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        let (value, _) = task.await.unwrap().unwrap();
        results.push(value.as_i64().unwrap());
    }
    assert_eq!(results, [0, 2, 4, 6, 8, 10, 12, 14]);

    let stats = pool.stats().snapshot();
    assert_eq!(stats.jobs_submitted, 8);
    assert_eq!(stats.jobs_completed, 8);
    assert_eq!(stats.jobs_failed, 0);
    pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_contexts_are_fresh_per_job() {
    let pool = WorkerPool::builder()
        .pool_size(1)
        .engine(pool_engine())
        .build()
        .unwrap();
    let handle = pool.handle();

    handle
        .execute("<?php $leak = 1; function leaked() {}")
        .await
        .unwrap();
    let (value, _) = handle
        .execute("<?php return [isset($leak), function_exists('leaked')];")
        .await
        .unwrap();
    assert_eq!(value, HostValue::map([(0i64, false), (1i64, false)]));
    pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_script_errors_are_returned() {
    let pool = WorkerPool::builder()
        .pool_size(1)
        .engine(pool_engine())
        .build()
        .unwrap();
    let handle = pool.handle();

    let failure = handle
        .execute("<?php throw new RuntimeException('nope');")
        .await
        .unwrap_err();
    assert_eq!(failure.error.kind(), Some("RuntimeException"));

    let failure = handle.execute("<?php while (true) {}").await.unwrap_err();
    assert!(matches!(failure.error, EmberError::StepLimit(100000)));

    let failure = handle.call("missing", vec![]).await.unwrap_err();
    assert!(matches!(failure.error, EmberError::UnknownFunction(_)));

    let stats = pool.stats().snapshot();
    assert_eq!(stats.jobs_failed, 3);
    assert_eq!(stats.success_rate(), 0.0);
    pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_execute_file_uses_provider() {
    let provider = MemorySourceProvider::new().with_file("job.php", "<?php return add(2, 3);");
    let pool = WorkerPool::builder()
        .pool_size(1)
        .engine(pool_engine().source_provider(Arc::new(provider)))
        .build()
        .unwrap();

    let (value, _) = pool.handle().execute_file("job.php").await.unwrap();
    assert_eq!(value, HostValue::Int(5));
    pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_worker_survives_fault_and_panic() {
    let engine = pool_engine()
        .function(HostFunction::with_call(
            "crash",
            Arity::Exact(0),
            |call: &mut HostCall<'_>, _args: &[HostValue]| Err(call.fault("heap corrupted")),
        ))
        .function(HostFunction::new("explode", Arity::Exact(0), |_| {
            panic!("host bug")
        }));
    let pool = WorkerPool::builder()
        .pool_size(1)
        .engine(engine)
        .build()
        .unwrap();
    let handle = pool.handle();

    let failure = handle.execute("<?php crash();").await.unwrap_err();
    assert!(matches!(failure.error, EmberError::EngineFault(_)));
    let (value, _) = handle.execute("<?php return 'after fault';").await.unwrap();
    assert_eq!(value, HostValue::from("after fault"));
    assert_eq!(pool.stats().snapshot().engine_restarts, 1);

    let failure = handle.execute("<?php explode();").await.unwrap_err();
    assert!(matches!(failure.error, EmberError::WorkerPanic(ref m) if m == "host bug"));
    let (value, _) = handle.execute("<?php return add(1, 1);").await.unwrap();
    assert_eq!(value, HostValue::Int(2));

    pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_try_execute_and_shutdown() {
    let pool = WorkerPool::builder()
        .pool_size(1)
        .queue_capacity(4)
        .engine(pool_engine())
        .build()
        .unwrap();
    let handle = pool.handle();

    let rx = handle.try_execute("<?php return 7;").unwrap();
    let (value, _) = rx.await.unwrap().unwrap();
    assert_eq!(value, HostValue::Int(7));

    assert!(pool.is_running());
    pool.shutdown().await;

    let failure = handle.execute("<?php return 1;").await.unwrap_err();
    assert!(matches!(failure.error, EmberError::PoolClosed(_)));
    assert!(matches!(
        handle.try_execute("<?php return 1;"),
        Err(EmberError::PoolClosed(_))
    ));
}
