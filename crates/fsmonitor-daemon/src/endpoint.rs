//! The daemon's IPC endpoint: a Unix domain socket inside the metadata
//! directory.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

pub const SOCKET_NAME: &str = "fsmonitor--daemon.ipc";

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("fsmonitor-daemon is already running at {0}")]
    AlreadyRunning(Utf8PathBuf),
    #[error("IPC endpoint {0} is not usable")]
    InvalidPath(Utf8PathBuf),
    #[error("IPC endpoints are not supported on this platform")]
    Unsupported,
}

/// What is (or is not) at the endpoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcState {
    Listening,
    /// A socket file exists but nothing accepts connections on it.
    NotListening,
    PathNotFound,
    /// Something other than a socket is in the way.
    InvalidPath,
    OtherError,
}

#[cfg(unix)]
mod sys {
    use std::{io::ErrorKind, os::unix::fs::FileTypeExt};

    use camino::Utf8Path;
    pub use tokio::net::{UnixListener as IpcListener, UnixStream as IpcStream};

    use super::{EndpointError, IpcState};

    pub async fn get_state(path: &Utf8Path) -> IpcState {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) if metadata.file_type().is_socket() => {}
            Ok(_) => return IpcState::InvalidPath,
            Err(err) if err.kind() == ErrorKind::NotFound => return IpcState::PathNotFound,
            Err(_) => return IpcState::InvalidPath,
        }
        match IpcStream::connect(path).await {
            Ok(_) => IpcState::Listening,
            Err(err) if matches!(err.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
                IpcState::NotListening
            }
            Err(_) => IpcState::OtherError,
        }
    }

    pub fn bind(path: &Utf8Path) -> Result<IpcListener, EndpointError> {
        Ok(IpcListener::bind(path)?)
    }

    pub async fn connect(path: &Utf8Path) -> Result<IpcStream, EndpointError> {
        Ok(IpcStream::connect(path).await?)
    }
}

#[cfg(not(unix))]
mod sys {
    use camino::Utf8Path;

    use super::{EndpointError, IpcState};

    pub type IpcStream = tokio::io::DuplexStream;

    /// Never constructed on this platform.
    pub enum IpcListener {}

    impl IpcListener {
        pub async fn accept(&self) -> std::io::Result<(IpcStream, ())> {
            match *self {}
        }
    }

    pub async fn get_state(_path: &Utf8Path) -> IpcState {
        IpcState::OtherError
    }

    pub fn bind(_path: &Utf8Path) -> Result<IpcListener, EndpointError> {
        Err(EndpointError::Unsupported)
    }

    pub async fn connect(_path: &Utf8Path) -> Result<IpcStream, EndpointError> {
        Err(EndpointError::Unsupported)
    }
}

pub use sys::{IpcListener, IpcStream};

/// Probes the endpoint without side effects.
pub async fn get_state(path: &Utf8Path) -> IpcState {
    sys::get_state(path).await
}

/// Binds the endpoint, clearing away a stale socket left by a daemon that
/// did not shut down cleanly.
pub async fn listen_socket(path: &Utf8Path) -> Result<IpcListener, EndpointError> {
    match get_state(path).await {
        IpcState::Listening => return Err(EndpointError::AlreadyRunning(path.to_owned())),
        IpcState::NotListening => {
            debug!("removing stale socket {}", path);
            std::fs::remove_file(path)?;
        }
        IpcState::PathNotFound => {}
        IpcState::InvalidPath | IpcState::OtherError => {
            return Err(EndpointError::InvalidPath(path.to_owned()))
        }
    }
    debug!("opening socket at {}", path);
    sys::bind(path)
}

pub async fn connect(path: &Utf8Path) -> Result<IpcStream, EndpointError> {
    sys::connect(path).await
}

#[cfg(all(test, unix))]
mod test {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::{get_state, listen_socket, EndpointError, IpcState};

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_states() {
        let (_dir, dir) = tempdir();
        let socket = dir.join("fsmonitor--daemon.ipc");
        assert_eq!(get_state(&socket).await, IpcState::PathNotFound);

        let listener = listen_socket(&socket).await.unwrap();
        assert_eq!(get_state(&socket).await, IpcState::Listening);
        assert_matches!(
            listen_socket(&socket).await,
            Err(EndpointError::AlreadyRunning(_))
        );

        drop(listener);
        assert_eq!(get_state(&socket).await, IpcState::NotListening);
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let (_dir, dir) = tempdir();
        let socket = dir.join("fsmonitor--daemon.ipc");
        drop(listen_socket(&socket).await.unwrap());

        let _listener = listen_socket(&socket).await.unwrap();
        assert_eq!(get_state(&socket).await, IpcState::Listening);
    }

    #[tokio::test]
    async fn test_regular_file_is_invalid() {
        let (_dir, dir) = tempdir();
        let socket = dir.join("fsmonitor--daemon.ipc");
        std::fs::write(&socket, "not a socket").unwrap();

        assert_eq!(get_state(&socket).await, IpcState::InvalidPath);
        assert_matches!(
            listen_socket(&socket).await,
            Err(EndpointError::InvalidPath(_))
        );
    }
}
