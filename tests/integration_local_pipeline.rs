//! End-to-end tests of the single-runtime dispatch path: two MSUs on two
//! workers wired by a route, shortest-queue balancing with live queue
//! lengths, and the cache/fileio pipeline over a real document root.

use dataflow_runtime::message::{Envelope, MsuId, ThreadMode};
use dataflow_runtime::msu::cache::{
    WebResponse, CACHE_MSU_TYPE_ID, FILEIO_MSU_TYPE_ID, WRITE_MSU_TYPE_ID,
};
use dataflow_runtime::msu::{MsuContext, MsuKind, MsuTypeSpec};
use dataflow_runtime::routing::{Endpoint, Locality, RouteStrategy};
use dataflow_runtime::runtime::{Runtime, RuntimeConfig};
use dataflow_runtime::worker::{spawn_worker, ControlCommand};
use dataflow_runtime::CoreResult;
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::sync::oneshot;

const UPPER_TYPE: u32 = 71;
const ECHO_TYPE: u32 = 70;

/// Record of one observed delivery.
#[derive(Debug, Clone)]
struct Seen {
    msu_id: MsuId,
    payload: Vec<u8>,
    origin: Option<u32>,
    thread: ThreadId,
}

type Journal = Arc<Mutex<Vec<Seen>>>;

/// Terminal MSU: uppercases the payload and records the delivery.
struct UppercaseSink {
    journal: Journal,
    /// When set, the first envelope blocks on the barrier before the
    /// instance processes anything (used to stack queues deterministically).
    gate: Option<Arc<Barrier>>,
}

impl MsuKind for UppercaseSink {
    fn receive(&mut self, ctx: &mut MsuContext<'_>, env: Envelope) -> CoreResult<()> {
        if env.payload == b"block" {
            if let Some(gate) = self.gate.take() {
                gate.wait();
            }
            return Ok(());
        }
        self.journal.lock().push(Seen {
            msu_id: ctx.msu_id(),
            payload: env.payload.to_ascii_uppercase(),
            origin: env.origin_runtime,
            thread: std::thread::current().id(),
        });
        Ok(())
    }
}

/// Pass-through MSU: forwards its payload to the uppercase type.
struct Echo;

impl MsuKind for Echo {
    fn receive(&mut self, ctx: &mut MsuContext<'_>, env: Envelope) -> CoreResult<()> {
        ctx.call_type(UPPER_TYPE, env.key, env.payload)
    }
}

fn register_test_types(runtime: &Runtime, journal: Journal, gate: Option<Arc<Barrier>>) {
    runtime
        .types
        .register(MsuTypeSpec::new(
            ECHO_TYPE,
            "echo",
            RouteStrategy::KeyBased,
            Arc::new(|_init: &[u8]| Ok(Box::new(Echo) as Box<dyn MsuKind>)),
        ))
        .unwrap();
    runtime
        .types
        .register(
            MsuTypeSpec::new(
                UPPER_TYPE,
                "uppercase",
                RouteStrategy::ShortestQueue,
                Arc::new(move |_init: &[u8]| {
                    Ok(Box::new(UppercaseSink {
                        journal: Arc::clone(&journal),
                        gate: gate.clone(),
                    }) as Box<dyn MsuKind>)
                }),
            )
            .with_cloneable(true),
        )
        .unwrap();
}

async fn create_msu(runtime: &Arc<Runtime>, thread: u32, msu_id: MsuId, type_id: u32) {
    let worker = runtime.workers.get(thread).unwrap();
    let (tx, rx) = oneshot::channel();
    worker.push_ctrl(ControlCommand::CreateMsu {
        msu_id,
        type_id,
        init_data: Vec::new(),
        completion: Some(tx),
    });
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("create timed out")
        .expect("worker gone")
        .expect("create failed");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Scenario: echo on thread 1, uppercase on thread 2, one key-0 endpoint.
/// An envelope injected at the echo MSU surfaces uppercased at the sink.
#[tokio::test]
async fn two_msu_pipeline_delivers_and_transforms() {
    let runtime = Runtime::new(RuntimeConfig::new(1));
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    register_test_types(&runtime, Arc::clone(&journal), None);

    spawn_worker(&runtime, 1, ThreadMode::Unpinned).unwrap();
    spawn_worker(&runtime, 2, ThreadMode::Unpinned).unwrap();

    let route = runtime.routes.create(100, UPPER_TYPE).unwrap();
    route
        .add_endpoint(Endpoint {
            key: 0,
            msu_id: 2,
            locality: Locality::Local,
        })
        .unwrap();

    create_msu(&runtime, 1, 1, ECHO_TYPE).await;
    create_msu(&runtime, 2, 2, UPPER_TYPE).await;

    // Route attachment is a control command on the same queue as the data
    // below, so it is observed first.
    runtime
        .workers
        .get(1)
        .unwrap()
        .push_ctrl(ControlCommand::AttachRoutes {
            msu_id: 1,
            route_ids: vec![100],
        });

    runtime
        .dispatch_local(Envelope::new(1, 0, b"hi".to_vec()))
        .unwrap();

    wait_until(|| !journal.lock().is_empty()).await;
    let seen = journal.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].msu_id, 2);
    assert_eq!(seen[0].payload, b"HI".to_vec());
    assert_eq!(seen[0].origin, None);

    runtime.shutdown();
}

/// Every mutation of an MSU's state happens on exactly one thread.
#[tokio::test]
async fn msu_state_is_touched_by_one_thread_only() {
    let runtime = Runtime::new(RuntimeConfig::new(1));
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    register_test_types(&runtime, Arc::clone(&journal), None);

    spawn_worker(&runtime, 1, ThreadMode::Unpinned).unwrap();
    create_msu(&runtime, 1, 7, UPPER_TYPE).await;

    for i in 0..64u8 {
        runtime
            .dispatch_local(Envelope::new(7, i as i32, vec![b'a' + (i % 26)]))
            .unwrap();
    }

    wait_until(|| journal.lock().len() == 64).await;
    let seen = journal.lock().clone();
    let first = seen[0].thread;
    assert!(seen.iter().all(|s| s.thread == first));

    runtime.shutdown();
}

/// Scenario: three sink instances whose workers hold queue lengths
/// {5, 1, 3}; a shortest-queue emission must land on the middle one.
#[tokio::test]
async fn shortest_queue_picks_the_least_loaded_instance() {
    let runtime = Runtime::new(RuntimeConfig::new(1));
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    // Workers 1..=3 block on the barrier; the main task is the fourth
    // participant and releases them together.
    let gate = Arc::new(Barrier::new(4));
    register_test_types(&runtime, Arc::clone(&journal), Some(Arc::clone(&gate)));

    for thread in 1..=4 {
        spawn_worker(&runtime, thread, ThreadMode::Unpinned).unwrap();
    }
    create_msu(&runtime, 1, 10, UPPER_TYPE).await;
    create_msu(&runtime, 2, 11, UPPER_TYPE).await;
    create_msu(&runtime, 3, 12, UPPER_TYPE).await;
    create_msu(&runtime, 4, 40, ECHO_TYPE).await;

    let route = runtime.routes.create(200, UPPER_TYPE).unwrap();
    for (key, msu_id) in [(0, 10), (1, 11), (2, 12)] {
        route
            .add_endpoint(Endpoint {
                key,
                msu_id,
                locality: Locality::Local,
            })
            .unwrap();
    }
    runtime
        .workers
        .get(4)
        .unwrap()
        .push_ctrl(ControlCommand::AttachRoutes {
            msu_id: 40,
            route_ids: vec![200],
        });

    // Park each sink worker inside a gate envelope, then stack the queues
    // to the scenario's lengths.
    for msu in [10, 11, 12] {
        runtime
            .dispatch_local(Envelope::new(msu, 0, b"block".to_vec()))
            .unwrap();
    }
    let stacked = [(10u32, 5usize), (11, 1), (12, 3)];
    wait_until(|| {
        // The gate envelopes must be *consumed* (workers parked inside
        // receive) so they no longer count toward queue lengths.
        (1..=3).all(|t| runtime.worker_queue_len(t) == Some(0))
    })
    .await;
    for (msu, n) in stacked {
        for i in 0..n {
            runtime
                .dispatch_local(Envelope::new(msu, i as i32, b"filler".to_vec()))
                .unwrap();
        }
    }
    assert_eq!(runtime.worker_queue_len(1), Some(5));
    assert_eq!(runtime.worker_queue_len(2), Some(1));
    assert_eq!(runtime.worker_queue_len(3), Some(3));

    // The probe routes while the queues still hold those lengths.
    runtime
        .dispatch_local(Envelope::new(40, 0, b"probe".to_vec()))
        .unwrap();
    wait_until(|| runtime.worker_queue_len(2) == Some(2)).await;

    gate.wait();
    wait_until(|| {
        journal
            .lock()
            .iter()
            .any(|s| s.payload == b"PROBE".to_vec())
    })
    .await;
    let probe_sink = journal
        .lock()
        .iter()
        .find(|s| s.payload == b"PROBE".to_vec())
        .map(|s| s.msu_id)
        .unwrap();
    assert_eq!(probe_sink, 11);

    runtime.shutdown();
}

/// The cache MSU pipeline: a lookup miss flows through the file reader,
/// comes back for storage, and the next lookup hits memory.
#[tokio::test]
async fn cache_miss_reads_disk_then_hits_memory() {
    let www = tempfile::tempdir().unwrap();
    std::fs::write(www.path().join("index.html"), b"<html>hello</html>").unwrap();

    let mut config = RuntimeConfig::new(1);
    config.www_dir = www.path().to_path_buf();
    let runtime = Runtime::new(config);
    runtime.register_builtin_types().unwrap();

    // A journal-backed write sink terminates the pipeline.
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let sink_journal = Arc::clone(&journal);
    runtime
        .types
        .register(MsuTypeSpec::new(
            WRITE_MSU_TYPE_ID,
            "write-sink",
            RouteStrategy::KeyBased,
            Arc::new(move |_init: &[u8]| {
                let journal = Arc::clone(&sink_journal);
                Ok(Box::new(JournalSink { journal }) as Box<dyn MsuKind>)
            }),
        ))
        .unwrap();

    spawn_worker(&runtime, 1, ThreadMode::Unpinned).unwrap();
    create_msu(&runtime, 1, 1, CACHE_MSU_TYPE_ID).await;
    create_msu(&runtime, 1, 2, FILEIO_MSU_TYPE_ID).await;
    create_msu(&runtime, 1, 3, WRITE_MSU_TYPE_ID).await;

    for (route_id, target_type, msu_id) in [
        (300, FILEIO_MSU_TYPE_ID, 2),
        (301, WRITE_MSU_TYPE_ID, 3),
        (302, CACHE_MSU_TYPE_ID, 1),
    ] {
        let route = runtime.routes.create(route_id, target_type).unwrap();
        route
            .add_endpoint(Endpoint {
                key: 0,
                msu_id,
                locality: Locality::Local,
            })
            .unwrap();
    }
    let worker = runtime.workers.get(1).unwrap();
    worker.push_ctrl(ControlCommand::AttachRoutes {
        msu_id: 1,
        route_ids: vec![300, 301],
    });
    worker.push_ctrl(ControlCommand::AttachRoutes {
        msu_id: 2,
        route_ids: vec![301, 302],
    });

    let request = WebResponse::request("/index.html").to_payload().unwrap();
    runtime
        .dispatch_local(Envelope::new(1, 0, request.clone()))
        .unwrap();

    // First answer comes off disk.
    wait_until(|| !journal.lock().is_empty()).await;
    {
        let seen = journal.lock();
        let resp = WebResponse::from_payload(&seen[0].payload).unwrap();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.body, b"<html>hello</html>".to_vec());
        assert_eq!(resp.mime_type.as_deref(), Some("text/html"));
    }

    // Remove the file: a second answer can only come from the cache.
    std::fs::remove_file(www.path().join("index.html")).unwrap();
    runtime.dispatch_local(Envelope::new(1, 0, request)).unwrap();
    wait_until(|| journal.lock().len() >= 2).await;
    {
        let seen = journal.lock();
        let resp = WebResponse::from_payload(&seen[1].payload).unwrap();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.body, b"<html>hello</html>".to_vec());
    }

    runtime.shutdown();
}

/// Write-side sink that stores raw payloads (no uppercasing).
struct JournalSink {
    journal: Journal,
}

impl MsuKind for JournalSink {
    fn receive(&mut self, ctx: &mut MsuContext<'_>, env: Envelope) -> CoreResult<()> {
        self.journal.lock().push(Seen {
            msu_id: ctx.msu_id(),
            payload: env.payload,
            origin: env.origin_runtime,
            thread: std::thread::current().id(),
        });
        Ok(())
    }
}
