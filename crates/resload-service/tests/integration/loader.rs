use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use resload_service::adapters::PassthroughResizer;
use resload_service::caching::{DiskCache, LoadRequest, TargetSize};
use resload_service::config::DiskCacheConfig;
use resload_service::executor::{ExecutorClosed, TaskExecutor, TaskOrder};
use resload_service::interface::ConsumerId;
use resload_service::loader::{Loader, LoaderError, RequestStatus};
use resload_test::{Event, RecordingSink, ScriptedFetcher, request, setup, tempdir, wait_until};

use crate::utils::{Sink, key, loader, loader_with_disk};

fn terminal_keys(sink: &Sink) -> Vec<String> {
    sink.terminal()
        .iter()
        .map(|event| match event {
            Event::Finished(key, ..) | Event::Cancelled(key, _) => key.to_string(),
            Event::Loading(..) => unreachable!(),
        })
        .collect()
}

#[test]
fn test_memory_hit_is_synchronous() {
    setup();
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 2);

    let status = loader.request(ConsumerId(1), request("a")).unwrap();
    assert_eq!(status, RequestStatus::Started);
    assert!(sink.wait_for_terminal(1));
    assert!(wait_until(|| loader.in_flight() == 0));

    let status = loader.request(ConsumerId(2), request("a")).unwrap();
    assert_eq!(status, RequestStatus::Cached);
    // delivered before `request` returned
    assert_eq!(sink.terminal_count(), 2);
    assert_eq!(
        sink.finished_for(ConsumerId(2)),
        vec![Some(Arc::new(b"a".to_vec()))]
    );
    assert_eq!(fetcher.calls("a"), 1);
}

#[test]
fn test_concurrent_requests_share_one_fetch() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    fetcher.insert("photo", b"pixels".to_vec());
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 2);

    let statuses: Vec<_> = (1..=5)
        .map(|id| loader.request(ConsumerId(id), request("photo")).unwrap())
        .collect();
    assert_eq!(statuses[0], RequestStatus::Started);
    assert!(statuses[1..].iter().all(|s| *s == RequestStatus::Joined));
    assert_eq!(loader.in_flight(), 1);

    assert!(fetcher.wait_for_calls(1));
    fetcher.release();
    assert!(sink.wait_for_terminal(5));

    assert_eq!(fetcher.calls("photo"), 1);
    for id in 1..=5 {
        assert_eq!(
            sink.finished_for(ConsumerId(id)),
            vec![Some(Arc::new(b"pixels".to_vec()))]
        );
    }
    assert!(loader.memory_cache().contains(&key("photo")));
}

#[test]
fn test_release_cancels_orphaned_task() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    loader.request(ConsumerId(1), request("a")).unwrap();
    assert!(fetcher.wait_for_calls(1));

    // queued behind "a" on the only worker
    loader.request(ConsumerId(2), request("b")).unwrap();
    loader.release(ConsumerId(2));

    fetcher.release();
    assert!(sink.wait_for_terminal(1));
    assert!(wait_until(|| loader.in_flight() == 0));
    assert!(wait_until(|| loader.executor().busy() == 0));

    assert_eq!(fetcher.calls("b"), 0);
    assert!(!loader.memory_cache().contains(&key("b")));
    assert_eq!(terminal_keys(&sink), vec!["a@0x0"]);
}

#[test]
fn test_rerequest_joins_cancelled_fetch() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 2);

    loader.request(ConsumerId(1), request("a")).unwrap();
    assert!(fetcher.wait_for_calls(1));
    loader.release(ConsumerId(1));

    assert_eq!(
        loader.request(ConsumerId(2), request("a")).unwrap(),
        RequestStatus::Joined
    );
    // the second worker is idle, yet "a" must not be fetched twice at once
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fetcher.calls("a"), 1);

    fetcher.release();
    assert!(sink.wait_for_terminal(1));
    assert!(wait_until(|| loader.in_flight() == 0));

    assert_eq!(fetcher.calls("a"), 1);
    assert_eq!(
        sink.finished_for(ConsumerId(2)),
        vec![Some(Arc::new(b"a".to_vec()))]
    );
    assert_eq!(sink.terminal_count(), 1);
}

#[test]
fn test_repeated_request_announces_loading_once() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    let statuses: Vec<_> = [1, 1, 2]
        .into_iter()
        .map(|id| loader.request(ConsumerId(id), request("a")).unwrap())
        .collect();
    assert_eq!(
        statuses,
        vec![
            RequestStatus::Started,
            RequestStatus::Joined,
            RequestStatus::Joined
        ]
    );

    let loading = |consumer: ConsumerId| {
        sink.events()
            .iter()
            .filter(|event| matches!(event, Event::Loading(_, c) if *c == consumer))
            .count()
    };
    assert_eq!(loading(ConsumerId(1)), 1);
    assert_eq!(loading(ConsumerId(2)), 1);

    fetcher.release();
    assert!(sink.wait_for_terminal(2));
    assert_eq!(sink.finished_for(ConsumerId(1)).len(), 1);
    assert_eq!(sink.finished_for(ConsumerId(2)).len(), 1);
}

#[test]
fn test_executor_shutdown_cancels_queued_tasks() {
    setup();
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let executor = Arc::new(TaskExecutor::new(1, TaskOrder::Fifo).unwrap());
    let loader = Loader::builder(
        Arc::clone(&fetcher),
        Arc::new(PassthroughResizer::new()),
        Arc::clone(&sink),
    )
    .executor(Arc::clone(&executor))
    .build()
    .unwrap();

    // occupy the only worker, so "a" stays queued
    let (unblock, blocked) = mpsc::channel::<()>();
    executor
        .execute(move || {
            let _ = blocked.recv();
        })
        .unwrap();
    assert!(wait_until(|| executor.busy() == 1));

    assert_eq!(
        loader.request(ConsumerId(1), request("a")).unwrap(),
        RequestStatus::Started
    );

    let unblocker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        drop(unblock);
    });
    executor.shutdown();
    unblocker.join().unwrap();

    assert_eq!(loader.in_flight(), 0);
    let terminal = sink.terminal();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(
        &terminal[0],
        Event::Cancelled(k, ConsumerId(1)) if *k == key("a")
    ));

    assert_eq!(
        loader.request(ConsumerId(2), request("a")),
        Err(LoaderError::Executor(ExecutorClosed))
    );
    assert_eq!(
        loader.preload([request("b")]),
        Err(LoaderError::Executor(ExecutorClosed))
    );
    assert!(
        sink.events()
            .iter()
            .all(|event| event.consumer() == ConsumerId(1))
    );
    assert_eq!(fetcher.total_calls(), 0);
}

#[test]
fn test_release_keeps_preload() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    assert_eq!(loader.preload([request("a")]).unwrap(), 1);
    assert_eq!(
        loader.request(ConsumerId(1), request("a")).unwrap(),
        RequestStatus::Joined
    );
    loader.release(ConsumerId(1));

    fetcher.release();
    assert!(wait_until(|| loader.memory_cache().contains(&key("a"))));
    assert!(wait_until(|| loader.in_flight() == 0));
    assert_eq!(fetcher.calls("a"), 1);
    assert_eq!(sink.terminal_count(), 0);
}

#[test]
fn test_preload_skips_cached_and_in_flight() {
    setup();
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    assert_eq!(loader.preload([request("a")]).unwrap(), 1);
    assert!(wait_until(|| loader.memory_cache().contains(&key("a"))));

    let started = loader
        .preload([request("a"), request("b"), request("b")])
        .unwrap();
    assert_eq!(started, 1);
    assert!(wait_until(|| loader.memory_cache().contains(&key("b"))));
    assert_eq!(fetcher.total_calls(), 2);
}

#[test]
fn test_rebinding_detaches_previous_key() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    loader.request(ConsumerId(1), request("a")).unwrap();
    assert!(fetcher.wait_for_calls(1));
    loader.request(ConsumerId(1), request("b")).unwrap();

    fetcher.release();
    assert!(sink.wait_for_terminal(1));
    assert!(wait_until(|| loader.in_flight() == 0));

    assert_eq!(terminal_keys(&sink), vec!["b@0x0"]);
    // cancelled while fetching, so nothing was committed
    assert!(!loader.memory_cache().contains(&key("a")));
}

#[test]
fn test_fetch_failure_delivers_none() {
    setup();
    let fetcher = ScriptedFetcher::new();
    fetcher.fail("missing");
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    loader.request(ConsumerId(1), request("missing")).unwrap();
    assert!(sink.wait_for_terminal(1));
    assert_eq!(sink.finished_for(ConsumerId(1)), vec![None]);
    assert!(!loader.memory_cache().contains(&key("missing")));
}

#[test]
fn test_decode_failure_delivers_none() {
    setup();
    let fetcher = ScriptedFetcher::new();
    fetcher.insert("huge", vec![0; 64]);
    let sink = RecordingSink::new();
    let loader = Loader::builder(
        Arc::clone(&fetcher),
        Arc::new(PassthroughResizer::with_limit(16)),
        Arc::clone(&sink),
    )
    .workers(1)
    .build()
    .unwrap();

    loader.request(ConsumerId(1), request("huge")).unwrap();
    loader.request(ConsumerId(2), request("small")).unwrap();
    assert!(sink.wait_for_terminal(2));

    assert_eq!(sink.finished_for(ConsumerId(1)), vec![None]);
    assert_eq!(
        sink.finished_for(ConsumerId(2)),
        vec![Some(Arc::new(b"small".to_vec()))]
    );
}

#[test]
fn test_panicking_fetcher_keeps_worker() {
    setup();
    let fetcher = ScriptedFetcher::new();
    fetcher.panic_on("boom");
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    loader.request(ConsumerId(1), request("boom")).unwrap();
    assert!(sink.wait_for_terminal(1));
    assert_eq!(sink.finished_for(ConsumerId(1)), vec![None]);

    loader.request(ConsumerId(2), request("fine")).unwrap();
    assert!(sink.wait_for_terminal(2));
    assert_eq!(
        sink.finished_for(ConsumerId(2)),
        vec![Some(Arc::new(b"fine".to_vec()))]
    );
}

#[test]
fn test_lifo_starts_newest_first() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    let sink = RecordingSink::new();
    let loader = Loader::builder(
        Arc::clone(&fetcher),
        Arc::new(PassthroughResizer::new()),
        Arc::clone(&sink),
    )
    .workers(1)
    .task_order(TaskOrder::Lifo)
    .build()
    .unwrap();

    loader.request(ConsumerId(0), request("first")).unwrap();
    assert!(fetcher.wait_for_calls(1));
    for (id, resource) in [(1, "a"), (2, "b"), (3, "c")] {
        loader.request(ConsumerId(id), request(resource)).unwrap();
    }

    fetcher.release();
    assert!(sink.wait_for_terminal(4));
    assert_eq!(
        terminal_keys(&sink),
        vec!["first@0x0", "c@0x0", "b@0x0", "a@0x0"]
    );
}

#[test]
fn test_switch_to_fifo() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);
    loader.set_task_order(TaskOrder::Lifo);
    loader.set_task_order(TaskOrder::Fifo);

    loader.request(ConsumerId(0), request("first")).unwrap();
    assert!(fetcher.wait_for_calls(1));
    for (id, resource) in [(1, "a"), (2, "b"), (3, "c")] {
        loader.request(ConsumerId(id), request(resource)).unwrap();
    }

    fetcher.release();
    assert!(sink.wait_for_terminal(4));
    assert_eq!(
        terminal_keys(&sink),
        vec!["first@0x0", "a@0x0", "b@0x0", "c@0x0"]
    );
}

#[test]
fn test_destroy_withholds_notifications() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 3);

    for (id, resource) in [(1, "a"), (2, "b"), (3, "c")] {
        loader.request(ConsumerId(id), request(resource)).unwrap();
    }
    assert!(fetcher.wait_for_calls(3));

    loader.destroy();
    assert!(loader.is_destroyed());
    assert_eq!(loader.in_flight(), 0);

    fetcher.release();
    assert!(wait_until(|| loader.executor().busy() == 0));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sink.terminal_count(), 0);
    assert!(!loader.memory_cache().contains(&key("a")));

    assert_eq!(
        loader.request(ConsumerId(4), request("d")),
        Err(LoaderError::Destroyed)
    );
    assert_eq!(loader.preload([request("d")]), Err(LoaderError::Destroyed));
    assert!(!loader.query_cache(ConsumerId(4), &request("a")));
}

#[test]
fn test_disk_cache_shared_between_sizes() {
    setup();
    let dir = tempdir();
    let disk = Arc::new(DiskCache::new(dir.path(), DiskCacheConfig::default()));
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader_with_disk(&fetcher, &sink, &disk);

    loader.request(ConsumerId(1), request("a")).unwrap();
    assert!(sink.wait_for_terminal(1));

    let resized = LoadRequest::new("a", TargetSize::new(64, 64));
    loader.request(ConsumerId(2), resized).unwrap();
    assert!(sink.wait_for_terminal(2));

    // the second size was decoded from the bytes stored on disk
    assert_eq!(fetcher.calls("a"), 1);
    assert_eq!(
        sink.finished_for(ConsumerId(2)),
        vec![Some(Arc::new(b"a".to_vec()))]
    );
}

#[test]
fn test_disk_cache_survives_loader() {
    setup();
    let dir = tempdir();
    let config = DiskCacheConfig::default();

    {
        let disk = Arc::new(DiskCache::new(dir.path(), config));
        let fetcher = ScriptedFetcher::new();
        let sink = RecordingSink::new();
        let loader = loader_with_disk(&fetcher, &sink, &disk);

        loader.request(ConsumerId(1), request("a")).unwrap();
        assert!(sink.wait_for_terminal(1));
        loader.destroy();
        disk.close();
    }

    let disk = Arc::new(DiskCache::new(dir.path(), config));
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader_with_disk(&fetcher, &sink, &disk);

    loader.request(ConsumerId(1), request("a")).unwrap();
    assert!(sink.wait_for_terminal(1));
    assert_eq!(fetcher.calls("a"), 0);
    assert_eq!(
        sink.finished_for(ConsumerId(1)),
        vec![Some(Arc::new(b"a".to_vec()))]
    );
}
