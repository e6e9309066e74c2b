use std::sync::Arc;
use std::thread;
use std::time::Duration;

use resload_service::interface::ConsumerId;
use resload_service::lifecycle::Phase;
use resload_service::loader::RequestStatus;
use resload_service::tasks::TaskState;
use resload_test::{RecordingSink, ScriptedFetcher, request, setup, wait_until};

use crate::utils::{key, loader};

#[test]
fn test_pause_holds_tasks_until_resume() {
    setup();
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 2);

    loader.pause();
    assert_eq!(loader.phase(), Phase::Paused);
    loader.request(ConsumerId(1), request("a")).unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(fetcher.calls("a"), 0);
    assert_eq!(sink.terminal_count(), 0);

    loader.resume();
    assert!(sink.wait_for_terminal(1));
    assert!(wait_until(|| loader.in_flight() == 0));
    assert_eq!(sink.terminal_count(), 1);
    assert_eq!(
        sink.finished_for(ConsumerId(1)),
        vec![Some(Arc::new(b"a".to_vec()))]
    );
}

#[test]
fn test_stop_stalls_and_recover_resubmits() {
    setup();
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 2);

    loader.stop();
    assert_eq!(
        loader.request(ConsumerId(1), request("a")).unwrap(),
        RequestStatus::Started
    );
    assert!(wait_until(
        || loader.task_state(&key("a")) == Some(TaskState::Stalled)
    ));
    assert_eq!(fetcher.calls("a"), 0);
    assert_eq!(sink.terminal_count(), 0);

    loader.recover();
    assert_eq!(loader.phase(), Phase::Running);
    assert!(sink.wait_for_terminal(1));
    assert_eq!(
        sink.finished_for(ConsumerId(1)),
        vec![Some(Arc::new(b"a".to_vec()))]
    );
}

#[test]
fn test_stop_during_fetch_skips_commit() {
    setup();
    let fetcher = ScriptedFetcher::blocked();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    loader.request(ConsumerId(1), request("a")).unwrap();
    assert!(fetcher.wait_for_calls(1));
    loader.stop();
    fetcher.release();

    assert!(wait_until(
        || loader.task_state(&key("a")) == Some(TaskState::Stalled)
    ));
    assert!(!loader.memory_cache().contains(&key("a")));
    assert_eq!(sink.terminal_count(), 0);

    loader.recover();
    assert!(sink.wait_for_terminal(1));
    assert_eq!(fetcher.calls("a"), 2);
    assert!(loader.memory_cache().contains(&key("a")));
}

#[test]
fn test_request_restarts_stalled_task_after_resume() {
    setup();
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    loader.stop();
    loader.request(ConsumerId(1), request("a")).unwrap();
    assert!(wait_until(
        || loader.task_state(&key("a")) == Some(TaskState::Stalled)
    ));

    // resuming alone leaves stalled tasks alone
    loader.resume();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(loader.task_state(&key("a")), Some(TaskState::Stalled));

    assert_eq!(
        loader.request(ConsumerId(2), request("a")).unwrap(),
        RequestStatus::Joined
    );
    assert!(sink.wait_for_terminal(2));
    assert_eq!(fetcher.calls("a"), 1);
    for id in [1, 2] {
        assert_eq!(
            sink.finished_for(ConsumerId(id)),
            vec![Some(Arc::new(b"a".to_vec()))]
        );
    }
}

#[test]
fn test_release_cancels_stalled_task() {
    setup();
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 1);

    loader.stop();
    loader.request(ConsumerId(1), request("a")).unwrap();
    assert!(wait_until(
        || loader.task_state(&key("a")) == Some(TaskState::Stalled)
    ));

    loader.release(ConsumerId(1));
    assert_eq!(loader.task_state(&key("a")), None);

    loader.recover();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fetcher.calls("a"), 0);
    assert_eq!(sink.terminal_count(), 0);
}

#[test]
fn test_destroy_releases_paused_workers() {
    setup();
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 2);

    loader.pause();
    loader.request(ConsumerId(1), request("a")).unwrap();
    loader.request(ConsumerId(2), request("b")).unwrap();
    assert!(wait_until(|| loader.executor().busy() == 2));

    loader.destroy();
    assert!(wait_until(|| loader.executor().busy() == 0));
    assert_eq!(fetcher.total_calls(), 0);
    assert_eq!(sink.terminal_count(), 0);

    // lifecycle changes after destroy are ignored
    loader.resume();
    loader.recover();
    assert_eq!(loader.phase(), Phase::Stopped);
}

#[test]
fn test_dropping_last_handle_destroys_loader() {
    setup();
    let fetcher = ScriptedFetcher::new();
    let sink = RecordingSink::new();
    let loader = loader(&fetcher, &sink, 2);
    let executor = Arc::clone(loader.executor());

    loader.pause();
    loader.request(ConsumerId(1), request("a")).unwrap();
    assert!(wait_until(|| executor.busy() == 1));

    let handle = loader.clone();
    drop(loader);
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_destroyed());
    assert_eq!(executor.busy(), 1);

    drop(handle);
    assert!(wait_until(|| executor.busy() == 0));
    assert_eq!(fetcher.total_calls(), 0);
    assert_eq!(sink.terminal_count(), 0);
}
