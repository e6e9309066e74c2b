//! Implementations of the CLI subcommands.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use console::style;
use crossbeam_channel::RecvTimeoutError;

use resload_service::adapters::{ChannelSink, FilesystemFetcher, Notification, PassthroughResizer};
use resload_service::caching::{DiskCache, LoadRequest};
use resload_service::config::Config;
use resload_service::interface::ConsumerId;
use resload_service::loader::Loader;

use crate::cli::FetchArgs;

/// Loads every key in `args` and prints one line per key.
///
/// Fails if any key could not be loaded, or if loading took longer than the timeout.
pub fn fetch(config: &Config, args: &FetchArgs) -> Result<()> {
    let (sink, notifications) = ChannelSink::<Vec<u8>>::new();
    let loader = Loader::from_config(
        config,
        Arc::new(FilesystemFetcher::new(&args.root)),
        Arc::new(PassthroughResizer::new()),
        Arc::new(sink),
    )
    .context("failed to start workers")?;

    let mut pending = HashMap::new();
    for (id, key) in (0..).zip(&args.keys) {
        let consumer = ConsumerId(id);
        pending.insert(consumer, key.as_str());
        let status = loader.request(consumer, LoadRequest::new(key.as_str(), args.size()))?;
        tracing::debug!(%consumer, key, ?status, "requested resource");
    }

    let deadline = Instant::now() + args.timeout;
    let mut failed = 0;
    while !pending.is_empty() {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let notification = match notifications.recv_timeout(timeout) {
            Ok(notification) => notification,
            Err(RecvTimeoutError::Timeout) => {
                loader.destroy();
                bail!("timed out waiting for {} resources", pending.len());
            }
            Err(RecvTimeoutError::Disconnected) => bail!("loader went away"),
        };
        if !notification.is_terminal() {
            continue;
        }
        let Some(key) = pending.remove(&notification.consumer()) else {
            continue;
        };

        match notification {
            Notification::Finished {
                result: Some(bytes),
                ..
            } => println!("{} {key} ({} bytes)", style("loaded").green(), bytes.len()),
            Notification::Finished { result: None, .. } => {
                failed += 1;
                println!("{} {key}", style("failed").red());
            }
            _ => {
                failed += 1;
                println!("{} {key}", style("cancelled").yellow());
            }
        }
    }

    if let Some(disk) = loader.disk_cache() {
        disk.close();
    }
    loader.destroy();

    if failed > 0 {
        bail!("{failed} of {} resources failed to load", args.keys.len());
    }
    Ok(())
}

/// Deletes everything in the configured disk cache.
pub fn clear(config: &Config) -> Result<()> {
    let Some(disk) = DiskCache::from_config(config) else {
        bail!("no cache_dir configured");
    };
    disk.clear();
    disk.close();
    tracing::info!(directory = %disk.directory().display(), "cleared disk cache");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use resload_service::caching::InitState;

    use super::*;

    fn fetch_args(root: &std::path::Path, keys: &[&str]) -> FetchArgs {
        FetchArgs {
            root: root.to_owned(),
            width: 0,
            height: 0,
            timeout: Duration::from_secs(10),
            keys: keys.iter().map(|key| key.to_string()).collect(),
        }
    }

    #[test]
    fn test_fetch_fills_disk_cache() {
        resload_test::setup();
        let root = resload_test::tempdir();
        let cache_dir = resload_test::tempdir();
        fs::write(root.path().join("a.txt"), b"hello").unwrap();
        fs::write(root.path().join("b.txt"), b"world").unwrap();

        let config = Config {
            cache_dir: Some(cache_dir.path().to_owned()),
            workers: 2,
            ..Config::default()
        };
        fetch(&config, &fetch_args(root.path(), &["a.txt", "b.txt", "a.txt"])).unwrap();

        let disk = DiskCache::from_config(&config).unwrap();
        assert_eq!(disk.read("a.txt").as_deref(), Some(&b"hello"[..]));
        assert_eq!(disk.read("b.txt").as_deref(), Some(&b"world"[..]));
        assert_eq!(disk.state(), InitState::Ready);
    }

    #[test]
    fn test_fetch_reports_missing() {
        resload_test::setup();
        let root = resload_test::tempdir();
        fs::write(root.path().join("a.txt"), b"hello").unwrap();

        let error = fetch(
            &Config::default(),
            &fetch_args(root.path(), &["a.txt", "missing.txt"]),
        )
        .unwrap_err();
        assert_eq!(error.to_string(), "1 of 2 resources failed to load");
    }

    #[test]
    fn test_clear() {
        resload_test::setup();
        let cache_dir = resload_test::tempdir();
        let config = Config {
            cache_dir: Some(cache_dir.path().to_owned()),
            ..Config::default()
        };

        let disk = DiskCache::from_config(&config).unwrap();
        assert!(disk.write("a", b"bytes"));
        disk.close();

        clear(&config).unwrap();
        let disk = DiskCache::from_config(&config).unwrap();
        assert_eq!(disk.read("a"), None);
    }

    #[test]
    fn test_clear_without_cache_dir() {
        assert!(clear(&Config::default()).is_err());
    }
}
