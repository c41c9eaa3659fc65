mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lab_scheduler::config::DispatcherConfig;
use lab_scheduler::coordinator::{serve, Master};
use lab_scheduler::dispatcher::{Dispatcher, DispatcherEvent};
use lab_scheduler::registry::{DeviceState, JobHealth, JobId, JobState, MemoryRegistry, Registry};
use lab_scheduler::scheduler::cancel_job;
use test_harness::*;

const WAIT: Duration = Duration::from_secs(5);

async fn start_master(registry: &Arc<MemoryRegistry>, shutdown: &CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let config = test_config().with_ping_interval_ms(200);
    let master = Master::new(registry.clone(), Arc::new(StaticRenderer::default()), config).unwrap();
    tokio::spawn(serve(listener, master, shutdown.clone()));
    addr
}

async fn wait_for_job(registry: &MemoryRegistry, id: JobId, state: JobState) {
    tokio::time::timeout(WAIT, async {
        while registry.job(id).unwrap().state() != state {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {} never reached {}", id, state));
}

#[tokio::test]
async fn test_job_runs_through_a_real_dispatcher() {
    let registry = lab();
    let shutdown = CancellationToken::new();
    let addr = start_master(&registry, &shutdown).await;
    let id = submit(&registry, &qemu_job("wire"))[0];

    let mut config = DispatcherConfig::new("w1", addr);
    config.ping_interval_ms = 50;
    let (dispatcher, handle) = Dispatcher::new(config);
    let (events_tx, mut events_rx) = mpsc::channel(16);
    tokio::spawn(dispatcher.run(events_tx, shutdown.clone()));

    let event = tokio::time::timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
    let DispatcherEvent::Start(request) = event else {
        panic!("expected START, got {:?}", event);
    };
    assert_eq!(request.job_id, id);
    assert!(request.device_config.contains("hostname: q2"));

    wait_for_job(&registry, id, JobState::Running).await;
    assert_eq!(registry.device("q2").unwrap().state(), DeviceState::Running);

    handle
        .finish(id, "", Some("exit_code: 0\n".to_string()))
        .await
        .unwrap();
    wait_for_job(&registry, id, JobState::Finished).await;
    assert_eq!(registry.job(id).unwrap().health(), JobHealth::Complete);
    assert_eq!(registry.device("q2").unwrap().state(), DeviceState::Idle);

    shutdown.cancel();
}

#[tokio::test]
async fn test_cancel_reaches_the_dispatcher() {
    let registry = lab();
    let shutdown = CancellationToken::new();
    let addr = start_master(&registry, &shutdown).await;
    let id = submit(&registry, &qemu_job("stop-me"))[0];

    let mut config = DispatcherConfig::new("w1", addr);
    config.ping_interval_ms = 50;
    let (dispatcher, handle) = Dispatcher::new(config);
    let (events_tx, mut events_rx) = mpsc::channel(16);
    tokio::spawn(dispatcher.run(events_tx, shutdown.clone()));

    let event = tokio::time::timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, DispatcherEvent::Start(_)));
    wait_for_job(&registry, id, JobState::Running).await;

    cancel_job(registry.as_ref(), id).unwrap();
    let event = tokio::time::timeout(WAIT, events_rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, DispatcherEvent::Cancel { job_id: id });

    handle.finish(id, "Job canceled", None).await.unwrap();
    wait_for_job(&registry, id, JobState::Finished).await;
    assert_eq!(registry.job(id).unwrap().health(), JobHealth::Canceled);

    shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_master_keeps_retrying_until_shutdown() {
    // Grab a free port, then close it so nothing listens there.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let shutdown = CancellationToken::new();
    let (dispatcher, _handle) = Dispatcher::new(DispatcherConfig::new("w1", addr));
    let (events_tx, _events_rx) = mpsc::channel(16);
    let task = tokio::spawn(dispatcher.run(events_tx, shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.is_finished());
    shutdown.cancel();
    let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}
