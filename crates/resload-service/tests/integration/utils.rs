use std::sync::Arc;

use resload_service::adapters::PassthroughResizer;
use resload_service::caching::{CacheKey, DiskCache};
use resload_service::executor::TaskOrder;
use resload_service::loader::Loader;
use resload_test::{RecordingSink, ScriptedFetcher};

pub type Sink = RecordingSink<Vec<u8>>;

/// A loader over `fetcher` without a disk cache, starting tasks in submission order.
pub fn loader(fetcher: &Arc<ScriptedFetcher>, sink: &Arc<Sink>, workers: usize) -> Loader<Vec<u8>> {
    Loader::builder(
        Arc::clone(fetcher),
        Arc::new(PassthroughResizer::new()),
        Arc::clone(sink),
    )
    .workers(workers)
    .task_order(TaskOrder::Fifo)
    .build()
    .unwrap()
}

pub fn loader_with_disk(
    fetcher: &Arc<ScriptedFetcher>,
    sink: &Arc<Sink>,
    disk: &Arc<DiskCache>,
) -> Loader<Vec<u8>> {
    Loader::builder(
        Arc::clone(fetcher),
        Arc::new(PassthroughResizer::new()),
        Arc::clone(sink),
    )
    .workers(2)
    .disk_cache(Arc::clone(disk))
    .build()
    .unwrap()
}

pub fn key(resource: &str) -> CacheKey {
    CacheKey::for_request(&resload_test::request(resource))
}
