use std::error::Error;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum ForwardError {
    AddressInUse(u16),
    Bind {
        port: u16,
        source: io::Error,
    },
    RemoteUnreachable {
        host: String,
        port: u16,
        source: io::Error,
    },
    Kubernetes(String),
    NoRunningPods {
        context: String,
        namespace: String,
        service: String,
    },
    Io(io::Error),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::AddressInUse(port) => {
                write!(f, "local port {port} is already in use")
            }
            ForwardError::Bind { port, source } => {
                write!(f, "failed to bind local port {port}: {source}")
            }
            ForwardError::RemoteUnreachable { host, port, source } => {
                write!(f, "failed to connect to {host}:{port}: {source}")
            }
            ForwardError::Kubernetes(msg) => write!(f, "kubernetes error: {msg}"),
            ForwardError::NoRunningPods {
                context,
                namespace,
                service,
            } => write!(
                f,
                "no running pods for service '{service}' in {context}/{namespace}"
            ),
            ForwardError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl Error for ForwardError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ForwardError::Bind { source, .. } => Some(source),
            ForwardError::RemoteUnreachable { source, .. } => Some(source),
            ForwardError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ForwardError {
    fn from(err: io::Error) -> Self {
        ForwardError::Io(err)
    }
}
