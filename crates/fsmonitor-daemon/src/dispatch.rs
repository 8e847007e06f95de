use fsmonitor_history::ClientToken;
use tracing::{debug, info, warn};

use crate::{
    protocol::{encode_error, encode_query_reply, Command, DaemonStatus},
    state::DaemonState,
};

/// Runs one command against the daemon state and renders the reply.
///
/// Never fails: anything a client can get wrong is answered, either
/// trivially or with an error reply.
#[tracing::instrument(skip(state))]
pub async fn dispatch(state: &DaemonState, command: Command) -> Vec<u8> {
    match command {
        Command::Quit => {
            info!("quit requested");
            state.request_shutdown();
            Vec::new()
        }
        Command::Flush => {
            let token_id = state.series().force_resync();
            debug!("flushed, new token id {}", token_id);
            Vec::new()
        }
        Command::Status => status(state),
        Command::Query(token) => query(state, token.as_deref()).await,
        Command::Unknown(verb) => {
            debug!("unknown command '{}'", verb);
            encode_error(format_args!("unknown command '{verb}'"))
        }
    }
}

async fn query(state: &DaemonState, raw_token: Option<&str>) -> Vec<u8> {
    // a token we cannot parse resolves like one from another series
    let token = raw_token.and_then(|raw| match raw.parse::<ClientToken>() {
        Ok(token) => Some(token),
        Err(err) => {
            debug!("treating malformed token as stale: {}", err);
            None
        }
    });

    if state.opts().cookie_sync {
        if let Err(err) = state.cookies().wait_for_cookie().await {
            warn!("cookie sync failed, forcing resync: {}", err);
            state.series().force_resync();
        }
    }

    let result = state.series().query(token.as_ref());
    debug!(
        "query {:?} -> {} ({})",
        raw_token,
        result.token,
        if result.is_trivial() { "trivial" } else { "incremental" }
    );
    encode_query_reply(&result)
}

fn status(state: &DaemonState) -> Vec<u8> {
    let series = state.series().status();
    let status = DaemonStatus {
        worktree: state.paths().worktree().to_string(),
        metadata_dir: state.paths().metadata_dir().to_string(),
        token_id: series.token_id,
        head_sequence: series.head_sequence,
        batches: series.batches,
        active_readers: series.active_readers,
        uptime_ms: state.uptime().as_millis() as u64,
        ipc_threads: state.opts().ipc_threads,
    };
    match serde_json::to_vec(&status) {
        Ok(reply) => reply,
        Err(err) => encode_error(err),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use camino::Utf8PathBuf;
    use fsmonitor_history::Batch;
    use pretty_assertions::assert_eq;

    use super::dispatch;
    use crate::{
        config::DaemonOpts,
        protocol::{Command, DaemonStatus, QueryReply},
        repo::RepoPaths,
        state::DaemonState,
    };

    fn state() -> (tempfile::TempDir, Arc<DaemonState>) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dunce::canonicalize(dir.path()).unwrap()).unwrap();
        std::fs::create_dir(root.join(".git")).unwrap();
        let opts = DaemonOpts {
            test_tokens: true,
            // no listener is running to see cookies
            cookie_sync: false,
            ..Default::default()
        };
        let paths = RepoPaths::discover(&root).unwrap();
        (dir, Arc::new(DaemonState::new(paths, opts)))
    }

    async fn query(state: &DaemonState, token: Option<&str>) -> QueryReply {
        let reply = dispatch(state, Command::Query(token.map(String::from))).await;
        QueryReply::decode(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_stale_token_is_trivial() {
        let (_dir, state) = state();
        let reply = query(&state, Some("builtin:OLD-ID:5")).await;
        assert_eq!(reply.token, "builtin:test_00000001:0");
        assert!(reply.is_trivial());
    }

    #[tokio::test]
    async fn test_malformed_token_is_trivial() {
        let (_dir, state) = state();
        for token in ["", "nonsense", "builtin:", "watchman:c:1:2", "builtin:x:notanumber"] {
            let reply = query(&state, Some(token)).await;
            assert!(reply.is_trivial(), "{token}");
            assert_eq!(reply.token, "builtin:test_00000001:0");
        }
    }

    #[tokio::test]
    async fn test_incremental_query() {
        let (_dir, state) = state();
        let first = query(&state, None).await;
        state.series().publish(Batch::with_paths([
            state.interner().intern("b.txt"),
            state.interner().intern("a.txt"),
        ]));

        let second = query(&state, Some(&first.token)).await;

        assert_eq!(second.token, "builtin:test_00000001:1");
        assert_eq!(second.paths, Some(vec!["a.txt".into(), "b.txt".into()]));
    }

    #[tokio::test]
    async fn test_flush_then_query_is_trivial() {
        let (_dir, state) = state();
        let before = query(&state, None).await;

        assert_eq!(dispatch(&state, Command::Flush).await, b"");
        let after = query(&state, Some(&before.token)).await;

        assert!(after.is_trivial());
        assert_eq!(after.token, "builtin:test_00000002:0");
    }

    #[tokio::test]
    async fn test_quit_is_idempotent() {
        let (_dir, state) = state();
        assert_eq!(dispatch(&state, Command::Quit).await, b"");
        assert_eq!(dispatch(&state, Command::Quit).await, b"");
        assert!(state.is_shutting_down());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (_dir, state) = state();
        let reply = dispatch(&state, Command::Unknown("frobnicate".into())).await;
        assert_eq!(
            String::from_utf8(reply).unwrap(),
            "error: unknown command 'frobnicate'"
        );
    }

    #[tokio::test]
    async fn test_status() {
        let (_dir, state) = state();
        let reply = dispatch(&state, Command::Status).await;
        let status: DaemonStatus = serde_json::from_slice(&reply).unwrap();
        assert_eq!(status.token_id, "test_00000001");
        assert_eq!(status.batches, 1);
        assert_eq!(status.ipc_threads, 8);
        assert_eq!(status.worktree, state.paths().worktree().as_str());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cookie_failure_forces_resync() {
        let (_dir, state) = state();
        let state = {
            let mut opts = state.opts().clone();
            opts.cookie_sync = true;
            Arc::new(DaemonState::new(state.paths().clone(), opts))
        };
        // nothing is listening, so every cookie is abandoned
        state.cookies().close();

        let first = query(&state, None).await;
        assert_eq!(first.token, "builtin:test_00000002:0");
        let second = query(&state, Some(&first.token)).await;

        assert!(second.is_trivial());
        assert_eq!(second.token, "builtin:test_00000003:0");
    }
}
