pub mod controller;
pub mod error;
pub mod feed;
pub mod initiator;
pub mod state;
pub mod transport;

pub use controller::{CallController, CallTimings};
pub use error::CallError;
pub use feed::{CallEventKind, CallStatusEvent, CallStatusFeed, SimulatedStatusFeed, WebhookStatusFeed};
pub use initiator::{CallInitiator, HttpCallInitiator};
pub use state::{
    CallControls, CallInitiation, CallRequest, CallService, CallState, CallStatus, CallView,
    StatusOrigin,
};
pub use transport::{ActiveCallTransport, CallControl, HttpCallTransport};
