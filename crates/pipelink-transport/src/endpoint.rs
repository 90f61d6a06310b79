use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TransportError};

/// Environment variable overriding the directory that holds named sockets.
pub const SOCKET_DIR_ENV: &str = "PIPELINK_SOCKET_DIR";

/// A logical local address shared by a server and its clients.
///
/// Both sides must use the identical name to rendezvous. The name is resolved
/// to a platform address only when binding or connecting:
/// - Unix: a name containing `/` is used as a filesystem path; any other name
///   becomes `<dir>/<name>.sock`, where `<dir>` is [`Endpoint::in_directory`],
///   else `$PIPELINK_SOCKET_DIR`, else the OS temp directory.
/// - Windows: `\\.\pipe\<name>`, or the name itself if it already starts
///   with `\\`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    name: String,
    directory: Option<PathBuf>,
}

impl Endpoint {
    /// Create an endpoint from its name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(TransportError::InvalidEndpoint {
                name,
                reason: "name must not be empty",
            });
        }
        if name.contains('\0') {
            return Err(TransportError::InvalidEndpoint {
                name,
                reason: "name must not contain NUL bytes",
            });
        }
        Ok(Self {
            name,
            directory: None,
        })
    }

    /// Resolve bare names inside `dir` instead of the default socket directory.
    ///
    /// Has no effect on Windows or on names that are already paths.
    pub fn in_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.directory = Some(dir.as_ref().to_path_buf());
        self
    }

    /// The logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem path of the Unix domain socket for this endpoint.
    #[cfg(unix)]
    pub fn socket_path(&self) -> PathBuf {
        if self.name.contains('/') {
            return PathBuf::from(&self.name);
        }
        let dir = self.directory.clone().unwrap_or_else(default_socket_dir);
        dir.join(format!("{}.sock", self.name))
    }

    /// Full named pipe path for this endpoint.
    #[cfg(windows)]
    pub fn pipe_name(&self) -> String {
        if self.name.starts_with(r"\\") {
            self.name.clone()
        } else {
            format!(r"\\.\pipe\{}", self.name)
        }
    }

    /// Platform address as a display string (for logs and errors).
    pub fn address(&self) -> String {
        #[cfg(unix)]
        {
            self.socket_path().display().to_string()
        }
        #[cfg(windows)]
        {
            self.pipe_name()
        }
        #[cfg(not(any(unix, windows)))]
        {
            self.name.clone()
        }
    }
}

#[cfg(unix)]
fn default_socket_dir() -> PathBuf {
    std::env::var_os(SOCKET_DIR_ENV)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
