//! Mapping of bollard failures onto semantic engine errors.

use std::error::Error as StdError;
use std::io::ErrorKind;
use std::path::Path;

use bollard::errors::Error as BollardError;

use crate::error::ContainerError;

/// The filesystem path behind a `unix://` or `npipe://` URI.
pub(super) fn socket_path(uri: &str) -> Option<&Path> {
    uri.strip_prefix("unix://")
        .or_else(|| uri.strip_prefix("npipe://"))
        .map(Path::new)
}

/// Turn a client construction failure into the most specific error available.
///
/// Missing sockets and permission problems are only reported as such when the
/// endpoint names a filesystem path; everything else is a connection failure.
pub(super) fn classify_connection_error(error: &BollardError, uri: &str) -> ContainerError {
    let path = socket_path(uri);
    let kind = match error {
        BollardError::SocketNotFoundError(_) => Some(ErrorKind::NotFound),
        BollardError::IOError { err } => Some(first_io_kind(err).unwrap_or_else(|| err.kind())),
        _ => first_io_kind(error),
    };

    match (kind, path) {
        (Some(ErrorKind::NotFound), Some(socket)) => ContainerError::SocketNotFound {
            path: socket.to_path_buf(),
        },
        (Some(ErrorKind::PermissionDenied), Some(socket)) => ContainerError::PermissionDenied {
            path: socket.to_path_buf(),
        },
        _ => ContainerError::ConnectionFailed {
            message: error.to_string(),
        },
    }
}

/// The kind of the first `io::Error` found below `error` in its source chain.
fn first_io_kind(error: &dyn StdError) -> Option<ErrorKind> {
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = cause.source();
    }
    None
}

/// The engine reports no such container.
pub(super) const fn is_missing(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// The engine reports the container was already in the requested state.
pub(super) const fn is_not_modified(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}
