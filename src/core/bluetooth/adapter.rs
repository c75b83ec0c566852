//! Platform adapter contract
//! The connection manager drives the radio only through [`PlatformAdapter`].
//! Commands are async calls; hardware callbacks come back as [`AdapterEvent`]s
//! on the channel handed to the adapter when it is built, in the order the
//! hardware produced them.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::types::{BleDevice, RadioState};

/// Sending half of the adapter event channel
pub type AdapterEventSender = mpsc::UnboundedSender<AdapterEvent>;
/// Receiving half of the adapter event channel
pub type AdapterEventReceiver = mpsc::UnboundedReceiver<AdapterEvent>;

/// Creates the channel an adapter reports hardware events on.
pub fn event_channel() -> (AdapterEventSender, AdapterEventReceiver) {
    mpsc::unbounded_channel()
}

/// Hardware callbacks, translated into plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// Advertisement received while scanning
    DeviceFound(BleDevice),
    /// Scanning stopped because of a fault
    ScanFailed(String),
    /// Low-level link to `id` is up
    Connected { id: String },
    /// Link to `id` dropped; `error` is set when the platform reported a cause
    Disconnected { id: String, error: Option<String> },
    /// Opening the session to `id` failed
    FailedToConnect { id: String, error: Option<String> },
    ServicesDiscovered { services: Vec<Uuid> },
    CharacteristicsDiscovered {
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    /// Read result or notification
    ValueUpdated { characteristic: Uuid, value: Vec<u8> },
    RadioStateChanged(RadioState),
}

/// Raw radio operations, one implementation per platform stack.
#[async_trait::async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Begin discovery; results arrive as [`AdapterEvent::DeviceFound`].
    async fn start_scan(&self) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Start opening a GATT session. Returns once the platform accepted the
    /// request; the outcome arrives as `Connected` or `FailedToConnect`.
    async fn open_session(&self, device_id: &str) -> Result<(), BleError>;

    /// Tear down the current session, if any.
    async fn close_session(&self) -> Result<(), BleError>;

    async fn discover_services(&self) -> Result<(), BleError>;

    async fn discover_characteristics(&self, service: Uuid) -> Result<(), BleError>;

    /// One-shot read; the value arrives as `ValueUpdated`.
    async fn read_characteristic(&self, characteristic: Uuid) -> Result<(), BleError>;

    /// Enable or disable notifications; values arrive as `ValueUpdated`
    /// until disabled or the session closes.
    async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<(), BleError>;

    async fn radio_state(&self) -> RadioState;
}
