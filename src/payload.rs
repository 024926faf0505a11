//! JSON payloads carried in `CastMessagePayload::String` for each namespace.
//!
//! Every payload has a `type` and, for request/response pairs, a `requestId`.
//! Response types only name the fields the client acts on; unknown fields are
//! ignored so newer receiver firmware does not break parsing.

use crate::types::{AppId, AppSession,
                   EndpointId,
                   MediaSessionId,
                   MessageType, MessageTypeConst,
                   NamespaceConst, SessionId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{
    borrow::Cow,
    fmt::{self, Debug, Display},
    sync::atomic::{AtomicI32, Ordering},
};

/// i32 that represents a request_id in the Chromecast protocol.
///
/// Zero is only used in broadcast responses with no corresponding request.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct RequestId(i32);

pub(crate) struct RequestIdGen(AtomicI32);

impl RequestId {
    pub const BROADCAST: RequestId = RequestId(Self::BROADCAST_I32);
    const BROADCAST_I32: i32 = 0;
}

impl RequestIdGen {
    /// Some broadcasts have `request_id` 0, so skip that.
    const INITIAL_I32: i32 = RequestId::BROADCAST_I32 + 1;
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload<T>
{
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    #[serde(rename = "type")]
    pub typ: MessageType,

    #[serde(flatten)]
    pub inner: T,
}

/// A payload whose `inner` is the whole JSON object, `type` and `requestId` included.
pub type PayloadDyn = Payload<serde_json::Value>;

/// The two fields the router reads from every incoming payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadHeader {
    #[serde(default)]
    pub request_id: Option<RequestId>,

    #[serde(rename = "type")]
    pub typ: MessageType,
}

pub trait RequestInner: Debug + Serialize
{
    const CHANNEL_NAMESPACE: NamespaceConst;
    const TYPE_NAME: MessageTypeConst;
}

pub trait ResponseInner: Debug + DeserializeOwned
{
    const CHANNEL_NAMESPACE: NamespaceConst;
    const TYPE_NAMES: &'static [MessageTypeConst];
}

/// Sends `$name` as message type `$typ` on the enclosing module's `CHANNEL_NAMESPACE`.
macro_rules! request_type {
    ($name: ident, $typ: path) => {
        impl RequestInner for $name {
            const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
            const TYPE_NAME: MessageTypeConst = $typ;
        }
    };
}

macro_rules! response_types {
    ($name: ident, [$($typ: path),+ $(,)?]) => {
        impl ResponseInner for $name {
            const CHANNEL_NAMESPACE: NamespaceConst = CHANNEL_NAMESPACE;
            const TYPE_NAMES: &'static [MessageTypeConst] = &[$($typ),+];
        }
    };
}

pub const USER_AGENT: &str = concat!("stream2cast/", env!("CARGO_PKG_VERSION"));


impl RequestId {
    pub fn inner(self) -> i32 {
        self.0
    }

    fn rpc_id_from(n: i32) -> RequestId {
        debug_assert_ne!(n, Self::BROADCAST_I32, "RequestId::rpc_id_from: broadcast id");
        RequestId(n)
    }

    pub fn is_rpc(self) -> bool {
        self != RequestId::BROADCAST
    }
}

impl From<RequestId> for i32 {
    fn from(id: RequestId) -> i32 {
        id.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl RequestIdGen {
    pub(crate) fn new() -> RequestIdGen {
        RequestIdGen(AtomicI32::new(Self::INITIAL_I32))
    }

    pub(crate) fn take_next(&self) -> RequestId {
        loop {
            let id = self.0.fetch_add(1, Ordering::SeqCst);
            if id == RequestId::BROADCAST_I32 {
                // Receivers use 0 for broadcast messages, take the next value.
                continue;
            }

            return RequestId::rpc_id_from(id);
        }
    }
}

pub mod connection {
    use super::*;

    pub const CHANNEL_NAMESPACE: NamespaceConst = "urn:x-cast:com.google.cast.tp.connection";

    pub const MESSAGE_TYPE_CONNECT: MessageTypeConst = "CONNECT";
    pub const MESSAGE_TYPE_CLOSE: MessageTypeConst = "CLOSE";

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ConnectRequest {
        pub user_agent: String,
    }

    request_type!(ConnectRequest, MESSAGE_TYPE_CONNECT);

    #[derive(Debug, Serialize)]
    pub struct CloseRequest {}

    request_type!(CloseRequest, MESSAGE_TYPE_CLOSE);
}

pub mod heartbeat {
    use super::*;

    pub const CHANNEL_NAMESPACE: NamespaceConst = "urn:x-cast:com.google.cast.tp.heartbeat";

    pub const MESSAGE_TYPE_PING: MessageTypeConst = "PING";
    pub const MESSAGE_TYPE_PONG: MessageTypeConst = "PONG";

    #[derive(Debug, Serialize)]
    pub struct Ping {}

    request_type!(Ping, MESSAGE_TYPE_PING);

    #[derive(Debug, Serialize)]
    pub struct Pong {}

    request_type!(Pong, MESSAGE_TYPE_PONG);
}

pub mod media {
    use super::*;

    pub const CHANNEL_NAMESPACE: NamespaceConst = "urn:x-cast:com.google.cast.media";

    pub const MESSAGE_REQUEST_TYPE_GET_STATUS: MessageTypeConst = "GET_STATUS";
    pub const MESSAGE_REQUEST_TYPE_LOAD: MessageTypeConst = "LOAD";
    pub const MESSAGE_REQUEST_TYPE_PLAY: MessageTypeConst = "PLAY";
    pub const MESSAGE_REQUEST_TYPE_PAUSE: MessageTypeConst = "PAUSE";
    pub const MESSAGE_REQUEST_TYPE_STOP: MessageTypeConst = "STOP";

    pub const MESSAGE_RESPONSE_TYPE_MEDIA_STATUS: MessageTypeConst = "MEDIA_STATUS";
    pub const MESSAGE_RESPONSE_TYPE_LOAD_CANCELLED: MessageTypeConst = "LOAD_CANCELLED";
    pub const MESSAGE_RESPONSE_TYPE_LOAD_FAILED: MessageTypeConst = "LOAD_FAILED";
    pub const MESSAGE_RESPONSE_TYPE_INVALID_PLAYER_STATE: MessageTypeConst
        = "INVALID_PLAYER_STATE";
    pub const MESSAGE_RESPONSE_TYPE_INVALID_REQUEST: MessageTypeConst = "INVALID_REQUEST";
    pub const MESSAGE_RESPONSE_TYPE_ERROR: MessageTypeConst = "ERROR";

    /// Metadata type for content with only a title and subtitle.
    pub const METADATA_TYPE_GENERIC: u32 = 0;

    pub type TrackId = i32;

    mod shared {
        use super::*;

        #[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct Status {
            #[serde(rename = "status", default)]
            pub entries: Vec<StatusEntry>,
        }

        #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct StatusEntry {
            pub media_session_id: MediaSessionId,

            pub media: Option<Media>,

            pub player_state: PlayerState,
            pub idle_reason: Option<IdleReason>,
            pub current_time: Option<f64>,

            pub active_track_ids: Option<Vec<TrackId>>,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum PlayerState {
            Idle,
            Playing,
            Paused,
            Buffering,
            Loading,

            #[serde(other)]
            Unknown,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum IdleReason {
            Cancelled,
            Interrupted,
            Finished,
            Error,

            #[serde(other)]
            Unknown,
        }

        #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum StreamType {
            #[default]
            Buffered,
            Live,
            None,

            #[serde(other)]
            Unknown,
        }

        #[skip_serializing_none]
        #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct Media {
            #[serde(default)]
            pub content_id: String,

            #[serde(default)]
            pub stream_type: StreamType,

            #[serde(default)]
            pub content_type: String,

            pub metadata: Option<Metadata>,

            pub duration: Option<f64>,

            pub tracks: Option<Vec<Track>>,
        }

        #[skip_serializing_none]
        #[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct Metadata {
            #[serde(default)]
            pub metadata_type: u32,

            pub title: Option<String>,
            pub subtitle: Option<String>,
        }

        /// A side track of the media, e.g. a subtitle file.
        #[skip_serializing_none]
        #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct Track {
            pub track_id: TrackId,

            #[serde(rename = "type")]
            pub typ: TrackType,

            pub track_content_id: Option<String>,
            pub track_content_type: Option<String>,
            pub subtype: Option<TextTrackType>,
            pub language: Option<String>,
            pub name: Option<String>,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum TrackType {
            Text,
            Audio,
            Video,

            #[serde(other)]
            Unknown,
        }

        #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum TextTrackType {
            Subtitles,
            Captions,
            Descriptions,
            Chapters,
            Metadata,

            #[serde(other)]
            Unknown,
        }

        #[derive(Debug, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct MediaRequestCommon {
            pub media_session_id: MediaSessionId,

            #[serde(skip_serializing_if = "CustomData::is_null")]
            pub custom_data: CustomData,
        }

        #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
        pub struct CustomData(pub serde_json::Value);

        impl Default for CustomData {
            fn default() -> CustomData {
                CustomData::new()
            }
        }

        impl CustomData {
            pub fn new() -> CustomData {
                CustomData(serde_json::Value::Null)
            }

            pub fn is_null(&self) -> bool {
                self.0.is_null()
            }
        }

        impl Status {
            /// The entry for `media_session_id`, if the device reported one.
            pub fn entry(&self, media_session_id: MediaSessionId) -> Option<&StatusEntry> {
                self.entries.iter().find(|e| e.media_session_id == media_session_id)
            }

            pub fn first_media_session_id(&self) -> Option<MediaSessionId> {
                self.entries.first().map(|e| e.media_session_id)
            }
        }
    }
    pub use self::shared::*;

    pub mod small_debug {
        use crate::util::fmt::{opt_field, DebugInline};
        use super::*;

        pub struct MediaStatus<'a>(pub &'a super::Status);
        pub struct MediaStatusEntries<'a>(pub &'a [super::StatusEntry]);
        pub struct MediaStatusEntry<'a>(pub &'a super::StatusEntry);
        pub struct Media<'a>(pub &'a super::Media);
        pub struct Metadata<'a>(pub &'a super::Metadata);

        impl<'a> Debug for MediaStatus<'a> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_struct("media::Status")
                    .field("entries", &MediaStatusEntries(&self.0.entries))
                    .finish()
            }
        }

        impl<'a> Debug for MediaStatusEntries<'a> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut d = f.debug_list();
                for item in self.0 {
                    d.entry(&MediaStatusEntry(item));
                }
                d.finish()
            }
        }

        impl<'a> Debug for MediaStatusEntry<'a> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_struct("MediaStatusEntry")
                    .field("media_session_id", &self.0.media_session_id)
                    .field("player_state", &self.0.player_state)
                    .field("current_time", &DebugInline(&self.0.current_time))
                    .field("idle_reason", &DebugInline(&self.0.idle_reason))
                    .field("media", &self.0.media.as_ref().map(Media))
                    .finish()
            }
        }

        impl<'a> Debug for Media<'a> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_struct("Media")
                    .field("content_id", &self.0.content_id)
                    .field("content_type", &self.0.content_type)
                    .field("stream_type", &self.0.stream_type)
                    .field("duration", &DebugInline(&self.0.duration))
                    .field("tracks", &self.0.tracks.as_ref().map(Vec::len))
                    .field("metadata", &self.0.metadata.as_ref().map(Metadata))
                    .finish()
            }
        }

        impl<'a> Debug for Metadata<'a> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut s = f.debug_struct("Metadata");

                opt_field(&mut s, "title", &self.0.title);
                opt_field(&mut s, "subtitle", &self.0.subtitle);

                s.finish()
            }
        }
    }

    #[skip_serializing_none]
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LoadRequest {
        pub session_id: SessionId,

        pub media: Media,
        pub current_time: f64,
        pub autoplay: bool,

        /// Tracks shown from the start, e.g. the subtitle track.
        pub active_track_ids: Option<Vec<TrackId>>,

        #[serde(skip_serializing_if = "CustomData::is_null")]
        pub custom_data: CustomData,
    }

    request_type!(LoadRequest, MESSAGE_REQUEST_TYPE_LOAD);

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadResponse {
        #[serde(rename = "MEDIA_STATUS")]
        Ok(Status),

        #[serde(rename = "LOAD_CANCELLED")]
        LoadCancelled,

        #[serde(rename = "LOAD_FAILED", rename_all = "camelCase")]
        LoadFailed {
            #[serde(default)]
            reason: Option<String>,
            #[serde(default)]
            detailed_error_code: Option<i32>,
        },

        #[serde(rename = "INVALID_PLAYER_STATE")]
        InvalidPlayerState,

        #[serde(rename = "INVALID_REQUEST")]
        InvalidRequest {
            #[serde(default)]
            reason: Option<String>,
        },

        #[serde(rename = "ERROR", rename_all = "camelCase")]
        Error {
            #[serde(default)]
            reason: Option<String>,
            #[serde(default)]
            detailed_error_code: Option<i32>,
        },
    }

    response_types!(LoadResponse, [
        MESSAGE_RESPONSE_TYPE_MEDIA_STATUS,
        MESSAGE_RESPONSE_TYPE_LOAD_CANCELLED,
        MESSAGE_RESPONSE_TYPE_LOAD_FAILED,
        MESSAGE_RESPONSE_TYPE_INVALID_PLAYER_STATE,
        MESSAGE_RESPONSE_TYPE_INVALID_REQUEST,
        MESSAGE_RESPONSE_TYPE_ERROR,
    ]);

    #[skip_serializing_none]
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GetStatusRequest {
        pub media_session_id: Option<MediaSessionId>,
    }

    request_type!(GetStatusRequest, MESSAGE_REQUEST_TYPE_GET_STATUS);

    /// Response to GET_STATUS and to the playback commands.
    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    pub enum StatusResponse {
        #[serde(rename = "MEDIA_STATUS")]
        Ok(Status),

        #[serde(rename = "INVALID_PLAYER_STATE")]
        InvalidPlayerState,

        #[serde(rename = "INVALID_REQUEST")]
        InvalidRequest {
            #[serde(default)]
            reason: Option<String>,
        },

        #[serde(rename = "ERROR")]
        Error {
            #[serde(default)]
            reason: Option<String>,
        },
    }

    response_types!(StatusResponse, [
        MESSAGE_RESPONSE_TYPE_MEDIA_STATUS,
        MESSAGE_RESPONSE_TYPE_INVALID_PLAYER_STATE,
        MESSAGE_RESPONSE_TYPE_INVALID_REQUEST,
        MESSAGE_RESPONSE_TYPE_ERROR,
    ]);

    macro_rules! simple_media_request {
        ($name: ident, $msg_type_name: path) => {
            #[derive(Debug, Serialize)]
            pub struct $name(pub MediaRequestCommon);

            request_type!($name, $msg_type_name);
        };
    }

    simple_media_request!(PlayRequest,  MESSAGE_REQUEST_TYPE_PLAY);
    simple_media_request!(PauseRequest, MESSAGE_REQUEST_TYPE_PAUSE);
    simple_media_request!(StopRequest,  MESSAGE_REQUEST_TYPE_STOP);
}

pub mod receiver {
    use super::*;

    pub const CHANNEL_NAMESPACE: NamespaceConst = "urn:x-cast:com.google.cast.receiver";

    pub const MESSAGE_REQUEST_TYPE_LAUNCH: MessageTypeConst = "LAUNCH";
    pub const MESSAGE_REQUEST_TYPE_STOP: MessageTypeConst = "STOP";
    pub const MESSAGE_REQUEST_TYPE_GET_STATUS: MessageTypeConst = "GET_STATUS";
    pub const MESSAGE_REQUEST_TYPE_SET_VOLUME: MessageTypeConst = "SET_VOLUME";

    pub const MESSAGE_RESPONSE_TYPE_RECEIVER_STATUS: MessageTypeConst = "RECEIVER_STATUS";
    pub const MESSAGE_RESPONSE_TYPE_LAUNCH_ERROR: MessageTypeConst = "LAUNCH_ERROR";
    pub const MESSAGE_RESPONSE_TYPE_INVALID_REQUEST: MessageTypeConst = "INVALID_REQUEST";

    mod shared {
        use super::*;

        #[derive(Clone, Deserialize, Debug, PartialEq)]
        #[serde(rename_all = "camelCase")]
        pub struct StatusWrapper {
            pub status: Status,
        }

        #[derive(Clone, Debug, Default, Deserialize, PartialEq)]
        #[serde(rename_all = "camelCase")]
        pub struct Status {
            #[serde(default)]
            pub applications: Vec<Application>,

            /// Volume parameters of the currently active cast device.
            #[serde(default)]
            pub volume: Volume,
        }

        #[derive(Clone, Deserialize, Debug, PartialEq)]
        #[serde(rename_all = "camelCase")]
        pub struct Application {
            pub app_id: AppId,

            #[serde(default)]
            pub session_id: SessionId,

            #[serde(default)]
            pub transport_id: EndpointId,

            #[serde(default)]
            pub namespaces: Vec<AppNamespace>,

            #[serde(default)]
            pub display_name: String,

            #[serde(default)]
            pub status_text: String,
        }

        impl Status {
            pub fn find_app(&self, app_id: &str) -> Option<&Application> {
                self.applications.iter().find(|app| app.app_id == app_id)
            }

            /// First running application that speaks the media namespace.
            pub fn media_app(&self) -> Option<&Application> {
                self.applications.iter()
                    .find(|app| app.has_namespace(crate::payload::media::CHANNEL_NAMESPACE))
            }
        }

        impl Application {
            pub fn has_namespace(&self, ns: &str) -> bool {
                self.namespaces.iter().any(|app_ns| app_ns == ns)
            }

            /// True once the device has assigned both ids needed to address the app.
            pub fn is_addressable(&self) -> bool {
                !self.session_id.is_empty() && !self.transport_id.is_empty()
            }

            pub fn to_app_session(&self, receiver_destination_id: EndpointId) -> AppSession {
                AppSession {
                    receiver_destination_id,
                    app_destination_id: self.transport_id.clone(),
                    session_id: self.session_id.clone(),
                }
            }
        }

        #[derive(Clone, Deserialize, Debug, Eq, PartialEq)]
        #[serde(rename_all = "camelCase")]
        pub struct AppNamespace {
            pub name: Cow<'static, str>,
        }

        impl PartialEq<str> for AppNamespace {
            fn eq(&self, other: &str) -> bool {
                self.name == other
            }
        }

        /// Structure that describes possible cast device volume options.
        #[skip_serializing_none]
        #[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct Volume {
            /// Volume level.
            pub level: Option<f32>,
            /// Mute/unmute state.
            pub muted: Option<bool>,
        }
    }
    pub use self::shared::*;

    pub mod small_debug {
        use super::*;

        pub struct ReceiverStatus<'a>(pub &'a super::Status);
        pub struct Applications<'a>(pub &'a [super::Application]);
        pub struct Application<'a>(pub &'a super::Application);
        pub struct Volume<'a>(pub &'a super::Volume);

        impl<'a> Debug for ReceiverStatus<'a> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_struct("receiver::Status")
                    .field("applications", &Applications(&self.0.applications))
                    .field("volume", &Volume(&self.0.volume))
                    .finish()
            }
        }

        impl<'a> Debug for Applications<'a> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut d = f.debug_list();
                for item in self.0 {
                    d.entry(&Application(item));
                }
                d.finish()
            }
        }

        impl<'a> Debug for Application<'a> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_struct("Application")
                    .field("app_id", &self.0.app_id)
                    .field("session_id", &self.0.session_id)
                    .field("transport_id", &self.0.transport_id)
                    .field("display_name", &self.0.display_name)
                    .field("status_text", &self.0.status_text)
                    .finish()
            }
        }

        impl<'a> Debug for Volume<'a> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "Volume {{ level: {level}, muted: {muted} }}",
                       level = match self.0.level {
                           None => "None".to_string(),
                           Some(l) => format!("{l:.2}"),
                       },
                       muted = match self.0.muted {
                           None => "None".to_string(),
                           Some(m) => format!("{m}"),
                       })
            }
        }
    }

    #[derive(Debug, Serialize)]
    pub struct GetStatusRequest {}

    request_type!(GetStatusRequest, MESSAGE_REQUEST_TYPE_GET_STATUS);

    /// Response to GET_STATUS, STOP and SET_VOLUME.
    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    pub enum StatusResponse {
        #[serde(rename = "RECEIVER_STATUS")]
        Ok(StatusWrapper),

        #[serde(rename = "INVALID_REQUEST")]
        InvalidRequest {
            #[serde(default)]
            reason: Option<String>,
        },
    }

    response_types!(StatusResponse, [
        MESSAGE_RESPONSE_TYPE_RECEIVER_STATUS,
        MESSAGE_RESPONSE_TYPE_INVALID_REQUEST,
    ]);

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LaunchRequest {
        pub app_id: AppId,
    }

    request_type!(LaunchRequest, MESSAGE_REQUEST_TYPE_LAUNCH);

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    pub enum LaunchResponse {
        #[serde(rename = "RECEIVER_STATUS")]
        Ok(StatusWrapper),

        #[serde(rename = "LAUNCH_ERROR")]
        Error {
            #[serde(default)]
            reason: Option<String>,
        },

        #[serde(rename = "INVALID_REQUEST")]
        InvalidRequest {
            #[serde(default)]
            reason: Option<String>,
        },
    }

    response_types!(LaunchResponse, [
        MESSAGE_RESPONSE_TYPE_INVALID_REQUEST,
        MESSAGE_RESPONSE_TYPE_LAUNCH_ERROR,
        MESSAGE_RESPONSE_TYPE_RECEIVER_STATUS,
    ]);

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct StopRequest {
        pub session_id: SessionId,
    }

    request_type!(StopRequest, MESSAGE_REQUEST_TYPE_STOP);

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SetVolumeRequest {
        pub volume: Volume,
    }

    request_type!(SetVolumeRequest, MESSAGE_REQUEST_TYPE_SET_VOLUME);
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_id_gen_default() {
        let gen = RequestIdGen::new();
        assert_eq!(gen.take_next().0, 1);
        assert_eq!(gen.take_next().0, 2);
        assert_eq!(gen.take_next().0, 3);
    }

    #[test]
    fn request_id_gen_skip_0() {
        let gen = RequestIdGen(AtomicI32::new(-1));
        assert_eq!(gen.take_next().0, -1);
        assert_eq!(gen.take_next().0,  1);
        assert_eq!(gen.take_next().0,  2);
    }

    #[test]
    fn request_payload_json() {
        let pd = Payload {
            request_id: Some(RequestId(7)),
            typ: receiver::MESSAGE_REQUEST_TYPE_LAUNCH.to_string(),
            inner: receiver::LaunchRequest { app_id: "CC1AD845".to_string() },
        };

        let value = serde_json::to_value(&pd).unwrap();
        assert_eq!(value, json!({
            "requestId": 7,
            "type": "LAUNCH",
            "appId": "CC1AD845",
        }));
    }

    #[test]
    fn pong_has_no_request_id() {
        let pd = Payload {
            request_id: None,
            typ: heartbeat::MESSAGE_TYPE_PONG.to_string(),
            inner: heartbeat::Pong {},
        };

        assert_eq!(serde_json::to_string(&pd).unwrap(), r#"{"type":"PONG"}"#);
    }

    #[test]
    fn play_request_flattens_common_fields() {
        let pd = Payload {
            request_id: Some(RequestId(3)),
            typ: media::MESSAGE_REQUEST_TYPE_PLAY.to_string(),
            inner: media::PlayRequest(media::MediaRequestCommon {
                media_session_id: 42,
                custom_data: media::CustomData::default(),
            }),
        };

        assert_eq!(serde_json::to_value(&pd).unwrap(), json!({
            "requestId": 3,
            "type": "PLAY",
            "mediaSessionId": 42,
        }));
    }

    #[test]
    fn receiver_status_ignores_unknown_fields() {
        let value = json!({
            "requestId": 2,
            "type": "RECEIVER_STATUS",
            "status": {
                "applications": [{
                    "appId": "CC1AD845",
                    "displayName": "Default Media Receiver",
                    "iconUrl": "",
                    "isIdleScreen": false,
                    "launchedFromCloud": false,
                    "namespaces": [
                        { "name": "urn:x-cast:com.google.cast.media" },
                        { "name": "urn:x-cast:com.google.cast.cac" }
                    ],
                    "sessionId": "abc-123",
                    "statusText": "Ready To Cast",
                    "transportId": "T1",
                    "universalAppId": "CC1AD845"
                }],
                "userEq": {},
                "volume": {
                    "controlType": "attenuation",
                    "level": 0.25,
                    "muted": false,
                    "stepInterval": 0.05
                }
            }
        });

        let resp: receiver::StatusResponse = serde_json::from_value(value).unwrap();
        let receiver::StatusResponse::Ok(receiver::StatusWrapper { status }) = resp else {
            panic!("expected RECEIVER_STATUS, got {resp:?}");
        };

        let app = status.media_app().expect("media app");
        assert_eq!(app.transport_id, "T1");
        assert!(app.is_addressable());
        assert_eq!(status.volume.level, Some(0.25));
        assert_eq!(status.volume.muted, Some(false));
    }

    #[test]
    fn media_status_tolerates_new_player_states() {
        let value = json!({
            "type": "MEDIA_STATUS",
            "requestId": 0,
            "status": [{
                "mediaSessionId": 42,
                "playerState": "WARMING_UP",
                "currentTime": 1.5,
                "supportedMediaCommands": 15,
                "someFutureField": [1, 2, 3]
            }]
        });

        let status: media::Status = serde_json::from_value(value).unwrap();
        let entry = status.entry(42).unwrap();
        assert_eq!(entry.player_state, media::PlayerState::Unknown);
        assert_eq!(entry.current_time, Some(1.5));
    }

    #[test]
    fn load_failed_response() {
        let value = json!({
            "type": "LOAD_FAILED",
            "requestId": 9,
            "itemId": 1,
            "detailedErrorCode": 104
        });

        let resp: media::LoadResponse = serde_json::from_value(value).unwrap();
        assert!(matches!(resp, media::LoadResponse::LoadFailed {
            detailed_error_code: Some(104), ..
        }));
    }

    #[test]
    fn set_volume_serializes_only_set_fields() {
        let req = receiver::SetVolumeRequest {
            volume: receiver::Volume {
                level: Some(0.5),
                ..Default::default()
            },
        };

        assert_eq!(serde_json::to_value(&req).unwrap(), json!({ "volume": { "level": 0.5 } }));
    }
}
