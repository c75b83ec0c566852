use thiserror::Error;
use uuid::Uuid;

/// Faults reported by a platform adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("bluetooth adapter unavailable")]
    AdapterUnavailable,

    #[error("bluetooth access not authorized")]
    Unauthorized,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("no open session")]
    NotConnected,

    #[error("service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("{0}")]
    Operation(String),
}

impl From<bluest::Error> for BleError {
    fn from(err: bluest::Error) -> Self {
        use bluest::error::ErrorKind;

        match err.kind() {
            ErrorKind::NotAuthorized => BleError::Unauthorized,
            ErrorKind::AdapterUnavailable => BleError::AdapterUnavailable,
            ErrorKind::NotConnected => BleError::NotConnected,
            _ => BleError::Operation(err.to_string()),
        }
    }
}
