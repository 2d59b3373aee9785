//! Call state record and the wire types around it.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a call.
///
/// ## State Transitions:
/// `Idle` → `Dialing` → `Connecting` → `Connected` → `Ended` → `Idle`
///
/// `Dialing`/`Connecting`/`Connected` may fall into `Failed`, which stays
/// until the UI is closed or the call is redialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    Dialing,
    Connecting,
    Connected,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Dialing => "dialing",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Failed => "failed",
        }
    }

    /// Dialing, connecting or connected.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallStatus::Dialing | CallStatus::Connecting | CallStatus::Connected
        )
    }

    /// Waiting on the carrier: dialing or connecting.
    pub fn is_pending(&self) -> bool {
        matches!(self, CallStatus::Dialing | CallStatus::Connecting)
    }

    /// States from which a redial is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Failed)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telephony backend that carries a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallService {
    Twilio,
    Sip,
    Openphone,
}

/// Where a status transition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusOrigin {
    /// Reported by the telephony backend.
    Carrier,
    /// Produced locally by a timer, not by the carrier.
    Simulated,
}

/// Side-channel controls of an active call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallControls {
    pub muted: bool,
    pub on_hold: bool,
    pub speaker: bool,
}

/// The controller's call record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    pub status: CallStatus,
    pub phone_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub service: Option<CallService>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_origin: Option<StatusOrigin>,
    pub controls: CallControls,
}

impl CallState {
    pub fn is_call_active(&self) -> bool {
        self.status.is_active()
    }
}

/// What consumers see: the call record plus the UI flag and derived values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallView {
    #[serde(flatten)]
    pub state: CallState,
    #[serde(rename = "showCallUI")]
    pub show_call_ui: bool,
    pub is_call_active: bool,
}

/// Call-initiation request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub service: Option<CallService>,
}

impl CallRequest {
    pub fn new(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            message: None,
            service: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_service(mut self, service: CallService) -> Self {
        self.service = Some(service);
        self
    }
}

/// Call-initiation response body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiation {
    pub success: bool,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub service: Option<CallService>,
    #[serde(default)]
    pub error: Option<String>,
}
