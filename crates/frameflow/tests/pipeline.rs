//! End-to-end behavior of the queue and the buffer cache through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use frameflow::buffer::{BufferAttributes, CacheConfig, HeapBackend, PixelFormat, PoolCache};
use frameflow::{QueueConfig, Task, TaskQueue, TaskStatus};
use tokio::sync::{mpsc, oneshot};

/// Task that occupies a slot for `work`, tracking how many run at once.
fn encode_job(
    work: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
) -> (Task, oneshot::Receiver<()>) {
    let (done_tx, done_rx) = oneshot::channel();
    let task = Task::builder(move |task: &Task| {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);

        let task = task.clone();
        tokio::spawn(async move {
            tokio::time::sleep(work).await;
            active.fetch_sub(1, Ordering::SeqCst);
            task.finish();
        });
    })
    .on_complete(move |_| {
        let _ = done_tx.send(());
    })
    .build();
    (task, done_rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_jobs_with_limit_two_run_in_three_waves() -> anyhow::Result<()> {
    let queue = TaskQueue::new(QueueConfig::new().with_concurrency(2).with_label("encode"));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut done = Vec::new();
    for _ in 0..5 {
        let (task, rx) = encode_job(Duration::from_millis(50), active.clone(), peak.clone());
        assert!(queue.add(task));
        done.push(rx);
    }

    let (completed_tx, mut completed_rx) = mpsc::unbounded_channel();
    let started = Instant::now();
    assert!(queue.start(move |q: &TaskQueue| {
        let _ = completed_tx.send(q.len());
    }));

    for rx in futures::future::join_all(done).await {
        rx.context("task dropped without completing")?;
    }
    let drained = tokio::time::timeout(Duration::from_secs(2), completed_rx.recv())
        .await
        .context("queue never signalled completion")?;
    let elapsed = started.elapsed();

    assert_eq!(drained, Some(5));
    assert!(elapsed >= Duration::from_millis(140), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "too slow: {elapsed:?}");
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(queue.peak_concurrency() <= 2);
    assert!(
        queue
            .tasks()
            .iter()
            .all(|t| t.status() == TaskStatus::Finished)
    );

    // exactly one completion per drain
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(completed_rx.try_recv().is_err());
    assert!(!queue.add(Task::new(|_| {})));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_queued_job_still_drains() -> anyhow::Result<()> {
    let queue = TaskQueue::new(QueueConfig::new().with_concurrency(1));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (first, first_done) = encode_job(Duration::from_millis(30), active.clone(), peak.clone());
    let (second, _second_done) = encode_job(Duration::from_millis(30), active, peak);
    queue.add_all([first, second.clone()]);

    let (completed_tx, mut completed_rx) = mpsc::unbounded_channel();
    queue.start(move |_: &TaskQueue| {
        let _ = completed_tx.send(());
    });
    assert!(second.cancel());

    first_done.await.context("first job never completed")?;
    tokio::time::timeout(Duration::from_secs(2), completed_rx.recv())
        .await
        .context("queue never signalled completion")?;

    assert_eq!(second.status(), TaskStatus::Cancelled);
    assert_eq!(queue.snapshot().cancelled, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn idle_pool_is_evicted_and_rebuilt() -> anyhow::Result<()> {
    let backend = Arc::new(HeapBackend::new());
    let cache = PoolCache::new(
        backend.clone(),
        CacheConfig::new()
            .with_auto_flush(true)
            .with_flush_interval(Duration::from_secs(1)),
    );
    let hd = BufferAttributes::sized(1920, 1080, PixelFormat::BGRA32);
    let sd = BufferAttributes::sized(640, 480, PixelFormat::BGRA32);

    let frame = cache.get_buffer_for(&hd).context("hd buffer")?;
    cache.get_buffer_for(&sd).context("sd buffer")?;
    assert_eq!(cache.len(), 2);
    assert_eq!(frame.len(), 1920 * 1080 * 4);

    // keep sd warm; hd goes idle
    tokio::time::sleep(Duration::from_millis(700)).await;
    cache.get_buffer_for(&sd).context("sd buffer")?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(cache.len(), 1);
    assert!(cache.contains(&sd.validate()?));
    assert!(!cache.contains(&hd.validate()?));

    // outstanding frames are unaffected by eviction
    assert_eq!(frame.len(), 1920 * 1080 * 4);

    cache.get_buffer_for(&hd).context("hd buffer after eviction")?;
    assert_eq!(cache.len(), 2);
    assert_eq!(backend.pools_created(), 3);
    Ok(())
}
