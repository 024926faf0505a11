use serde::{Deserialize, Serialize};

pub use crate::payload::RequestId;

pub type AppId = String;
pub type AppIdConst = &'static str;

/// Source or destination of a message: a sender id, the platform receiver
/// id, or an application transport id.
pub type EndpointId = String;
pub type EndpointIdConst = &'static str;

pub type MessageType = String;
pub type MessageTypeConst = &'static str;

pub type Namespace = String;
pub type NamespaceConst = &'static str;

/// Device-assigned id of one running application instance.
pub type SessionId = String;

/// Device-assigned id of one load/play lifecycle.
pub type MediaSessionId = i32;

/// A running receiver application the client has a virtual connection to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AppSession {
    /// Transport id of the application; destination for media messages.
    pub app_destination_id: EndpointId,

    /// Platform receiver that launched the application.
    pub receiver_destination_id: EndpointId,

    pub session_id: SessionId,
}
