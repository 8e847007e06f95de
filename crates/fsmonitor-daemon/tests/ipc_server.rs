#![cfg(unix)]

use std::{cell::Cell, collections::HashSet, sync::Arc, thread, time::Duration};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use fsmonitor_daemon::{
    ClientError, CloseReason, Command, DaemonClient, DaemonError, DaemonOpts, DaemonServer,
    DaemonState, EndpointError, RepoPaths,
};
use fsmonitor_filewatch::{ManualSource, ManualSourceHandle, COOKIE_PREFIX};
use pretty_assertions::assert_eq;
use tokio::{net::UnixStream, task::JoinHandle};
use tracing_test::traced_test;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
    paths: RepoPaths,
    client: DaemonClient,
    handle: Option<ManualSourceHandle>,
    server: JoinHandle<Result<CloseReason, DaemonError>>,
}

impl Harness {
    /// Runs a daemon over a fresh repository. With `cookie_sync` a helper
    /// thread plays the part of the OS and reports cookie files as they
    /// appear, so every query observes everything sent before it.
    async fn start(cookie_sync: bool, ipc_threads: usize) -> Self {
        Self::start_with_metadata(cookie_sync, ipc_threads, None).await
    }

    /// Like [`Self::start`], keeping metadata in `metadata` (relative to
    /// the worktree) instead of `.git`.
    async fn start_with_metadata(
        cookie_sync: bool,
        ipc_threads: usize,
        metadata: Option<&str>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dunce::canonicalize(dir.path()).unwrap()).unwrap();
        std::fs::create_dir(root.join(".git")).unwrap();
        let paths = match metadata {
            Some(metadata) => {
                std::fs::create_dir_all(root.join(metadata)).unwrap();
                RepoPaths::with_metadata_dir(&root, Utf8Path::new(metadata)).unwrap()
            }
            None => RepoPaths::discover(&root).unwrap(),
        };
        let opts = DaemonOpts {
            ipc_threads,
            test_tokens: true,
            cookie_sync,
            ..Default::default()
        };

        let (source, handle) = ManualSource::new();
        if cookie_sync {
            forward_cookies(paths.metadata_dir().to_owned(), handle.clone());
        }
        let state = Arc::new(DaemonState::new(paths.clone(), opts));
        let server = tokio::spawn(DaemonServer::new(state, source).serve());

        let client = DaemonClient::new(&paths.socket_path());
        for _ in 0..200 {
            if client.is_listening().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_listening().await, "daemon did not come up");

        Self {
            _dir: dir,
            root,
            paths,
            client,
            handle: Some(handle),
            server,
        }
    }

    fn touch(&self, rel: &[&str]) {
        let handle = self.handle.as_ref().unwrap();
        assert!(handle.send_paths(rel.iter().map(|rel| self.root.join(rel))));
    }

    async fn stop(self) -> CloseReason {
        self.client.stop(STOP_TIMEOUT).await.unwrap();
        self.server.await.unwrap().unwrap()
    }
}

fn forward_cookies(metadata_dir: Utf8PathBuf, handle: ManualSourceHandle) {
    thread::spawn(move || {
        let mut seen = HashSet::new();
        loop {
            let Ok(entries) = std::fs::read_dir(&metadata_dir) else {
                return;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(COOKIE_PREFIX)
                    && seen.insert(name)
                    && !handle.send_paths([entry.path()])
                {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(2));
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_reports_changes() {
    let harness = Harness::start(true, 8).await;

    let first = harness.client.query(None).await.unwrap();
    assert!(first.is_trivial());
    assert_eq!(first.token, "builtin:test_00000001:0");

    harness.touch(&["src/main.c", ".git/HEAD", "b.txt", "src/main.c"]);
    let second = harness.client.query(Some(&first.token)).await.unwrap();
    assert_eq!(second.token, "builtin:test_00000001:1");
    assert_eq!(
        second.paths,
        Some(vec!["b.txt".to_string(), "src/main.c".to_string()])
    );

    let third = harness.client.query(Some(&second.token)).await.unwrap();
    assert_eq!(third.token, "builtin:test_00000001:1");
    assert_eq!(third.paths, Some(vec![]));

    // an older token still sees everything since its own sequence
    harness.touch(&["c.txt"]);
    let from_start = harness.client.query(Some(&first.token)).await.unwrap();
    assert_eq!(
        from_start.paths,
        Some(vec![
            "b.txt".to_string(),
            "c.txt".to_string(),
            "src/main.c".to_string()
        ])
    );

    assert_eq!(harness.stop().await, CloseReason::Shutdown);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_dir_inside_worktree() {
    let harness = Harness::start_with_metadata(true, 8, Some("meta")).await;
    assert!(!harness.paths.watch_roots().has_separate_metadata());

    let first = harness.client.query(None).await.unwrap();
    harness.touch(&["a.txt", "meta/index", "meta/fsmonitor--daemon.log"]);
    let second = harness.client.query(Some(&first.token)).await.unwrap();

    // cookies under meta/ must still complete, and nothing under it is
    // reported as a worktree change
    assert_eq!(second.token, "builtin:test_00000001:1");
    assert_eq!(second.paths, Some(vec!["a.txt".to_string()]));
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_token_is_trivial() {
    let harness = Harness::start(true, 8).await;

    let reply = harness.client.query(Some("builtin:OLD-ID:5")).await.unwrap();

    assert!(reply.is_trivial());
    assert_eq!(reply.token, "builtin:test_00000001:0");
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_then_query_is_trivial() {
    let harness = Harness::start(true, 8).await;
    let before = harness.client.query(None).await.unwrap();

    harness.client.flush().await.unwrap();
    let after = harness.client.query(Some(&before.token)).await.unwrap();

    assert!(after.is_trivial());
    assert_eq!(after.token, "builtin:test_00000002:0");
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_overflow_forces_resync() {
    let harness = Harness::start(true, 8).await;
    let before = harness.client.query(None).await.unwrap();

    harness.touch(&["lost.txt"]);
    assert!(harness.handle.as_ref().unwrap().overflow());
    let after = harness.client.query(Some(&before.token)).await.unwrap();

    // the overflow may also abort this query's own cookie, which resyncs
    // once more
    assert!(after.is_trivial());
    assert_ne!(after.token, before.token);
    assert!(after.token.ends_with(":0"));
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status() {
    let harness = Harness::start(true, 3).await;
    harness.client.query(None).await.unwrap();

    let status = harness.client.status().await.unwrap();

    assert_eq!(status.worktree, harness.paths.worktree().as_str());
    assert_eq!(status.metadata_dir, harness.paths.metadata_dir().as_str());
    assert_eq!(status.token_id, "test_00000001");
    assert_eq!(status.head_sequence, 0);
    assert_eq!(status.ipc_threads, 3);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_command() {
    let harness = Harness::start(false, 8).await;

    let result = harness
        .client
        .send_command(&Command::Unknown("frobnicate".into()))
        .await;

    assert_matches!(result, Err(ClientError::Server(message)) if message == "unknown command 'frobnicate'");
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_queries() {
    let harness = Harness::start(true, 2).await;
    let first = harness.client.query(None).await.unwrap();
    harness.touch(&["a.txt"]);

    let mut queries = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let client = harness.client.clone();
        let token = first.token.clone();
        queries.spawn(async move { client.query(Some(&token)).await });
    }
    while let Some(reply) = queries.join_next().await {
        let reply = reply.unwrap().unwrap();
        assert_eq!(reply.paths, Some(vec!["a.txt".to_string()]));
    }
    harness.stop().await;
}

fn accepted_count(lines: &[&str]) -> usize {
    lines
        .iter()
        .filter(|line| line.contains("accepted connection"))
        .count()
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn test_idle_connections_wait_for_a_free_thread() {
    let harness = Harness::start(false, 1).await;
    // answered, so every earlier connection has been accepted
    harness.client.flush().await.unwrap();
    let baseline = Cell::new(0);
    logs_assert(|lines| {
        baseline.set(accepted_count(lines));
        Ok(())
    });

    let mut idle = Vec::new();
    for _ in 0..3 {
        idle.push(UnixStream::connect(harness.paths.socket_path()).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    logs_assert(|lines| match accepted_count(lines) - baseline.get() {
        1 => Ok(()),
        n => Err(format!("{n} idle connections accepted with one thread")),
    });

    // hanging up frees the thread for the rest
    drop(idle);
    harness.client.flush().await.unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quit_removes_socket() {
    let Harness {
        _dir,
        paths,
        client,
        server,
        ..
    } = Harness::start(false, 8).await;

    client.stop(STOP_TIMEOUT).await.unwrap();
    assert_eq!(server.await.unwrap().unwrap(), CloseReason::Shutdown);

    assert!(!paths.socket_path().exists());
    assert_matches!(
        client.stop(STOP_TIMEOUT).await,
        Err(ClientError::NotRunning)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_with_zero_timeout_waits_for_shutdown() {
    let Harness {
        _dir,
        paths,
        client,
        server,
        ..
    } = Harness::start(false, 8).await;

    client.stop(Duration::ZERO).await.unwrap();

    assert_eq!(server.await.unwrap().unwrap(), CloseReason::Shutdown);
    assert!(!paths.socket_path().exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_daemon_is_refused() {
    let harness = Harness::start(false, 8).await;

    let (source, _handle) = ManualSource::new();
    let opts = DaemonOpts {
        test_tokens: true,
        ..Default::default()
    };
    let state = Arc::new(DaemonState::new(harness.paths.clone(), opts));
    let result = DaemonServer::new(state, source).serve().await;

    assert_matches!(
        result,
        Err(DaemonError::Endpoint(EndpointError::AlreadyRunning(_)))
    );
    assert!(harness.client.is_listening().await);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_source_closing_stops_daemon() {
    let mut harness = Harness::start(false, 8).await;

    drop(harness.handle.take());
    let reason = tokio::time::timeout(STOP_TIMEOUT, harness.server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(reason, CloseReason::ListenerExited);
    assert!(!harness.paths.socket_path().exists());
}
