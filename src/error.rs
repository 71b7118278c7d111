use thiserror::Error;

use crate::monitor::MonitorError;
use crate::proxy::{EndpointError, ProxyError};

#[derive(Error, Debug)]
pub enum FuzzmonError {
    #[error("{0}")]
    Monitor(#[from] MonitorError),

    #[error("{0}")]
    Proxy(#[from] ProxyError),

    #[error("{0}")]
    Endpoint(#[from] EndpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FuzzmonError>;
