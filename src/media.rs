//! Media session control against the default media receiver app.
//!
//! Playback moves `NoMedia -> Loading -> {Playing, Paused, Buffering} -> Idle`,
//! and a new `load` restarts at `Loading`. State is derived from the latest
//! MEDIA_STATUS snapshot, whether it was a response or a push.

use crate::{
    async_client::{app, Client, Result},
    error::Error,
    payload::{
        Payload,
        media::{self, CustomData, IdleReason, LoadResponse, MediaRequestCommon, PlayerState,
                StatusResponse, TrackId},
    },
    types::{AppSession, MediaSessionId},
    util::named,
};
use std::time::Duration;

/// Track id given to the subtitle track sent with LOAD.
pub const SUBTITLE_TRACK_ID: TrackId = 1;

pub const DEFAULT_SUBTITLE_LANGUAGE: &str = "en-US";

pub const SUBTITLE_CONTENT_TYPE: &str = "text/vtt";

/// What to play: a URL the device can fetch, plus optional extras.
#[derive(Clone, Debug)]
pub struct LoadArgs {
    pub url: String,
    pub content_type: String,
    pub subtitles: Option<Subtitles>,

    /// Shown by the device while playing.
    pub title: Option<String>,

    pub autoplay: bool,
    pub current_time: f64,
}

#[derive(Clone, Debug)]
pub struct Subtitles {
    /// WebVTT document URL.
    pub url: String,

    /// BCP 47 tag, `DEFAULT_SUBTITLE_LANGUAGE` when `None`.
    pub language: Option<String>,
}

/// Snapshot of one media session as last reported by the device.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaStatus {
    pub media_session_id: Option<MediaSessionId>,
    pub player_state: PlayerState,
    pub current_time: Option<f64>,
    pub idle_reason: Option<IdleReason>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PlaybackState {
    NoMedia,
    Loading,
    Playing,
    Paused,
    Buffering,
    Idle,
}

impl LoadArgs {
    pub fn new(url: impl Into<String>, content_type: impl Into<String>) -> LoadArgs {
        LoadArgs {
            url: url.into(),
            content_type: content_type.into(),
            subtitles: None,
            title: None,
            autoplay: true,
            current_time: 0.0,
        }
    }

    pub fn with_subtitles(mut self, url: impl Into<String>, language: Option<String>) -> LoadArgs {
        self.subtitles = Some(Subtitles {
            url: url.into(),
            language,
        });
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> LoadArgs {
        self.title = Some(title.into());
        self
    }

    pub fn with_autoplay(mut self, autoplay: bool) -> LoadArgs {
        self.autoplay = autoplay;
        self
    }

    pub fn with_current_time(mut self, current_time: f64) -> LoadArgs {
        self.current_time = current_time;
        self
    }

    fn to_request(&self, session_id: String) -> media::LoadRequest {
        let tracks = self.subtitles.as_ref().map(|subs| {
            let language = subs.language.clone()
                .unwrap_or_else(|| DEFAULT_SUBTITLE_LANGUAGE.to_string());
            vec![media::Track {
                track_id: SUBTITLE_TRACK_ID,
                typ: media::TrackType::Text,
                track_content_id: Some(subs.url.clone()),
                track_content_type: Some(SUBTITLE_CONTENT_TYPE.to_string()),
                subtype: Some(media::TextTrackType::Subtitles),
                name: Some(language.clone()),
                language: Some(language),
            }]
        });

        let metadata = self.title.as_ref().map(|title| media::Metadata {
            metadata_type: media::METADATA_TYPE_GENERIC,
            title: Some(title.clone()),
            ..Default::default()
        });

        media::LoadRequest {
            session_id,
            active_track_ids: tracks.as_ref().map(|_| vec![SUBTITLE_TRACK_ID]),
            media: media::Media {
                content_id: self.url.clone(),
                stream_type: media::StreamType::Buffered,
                content_type: self.content_type.clone(),
                metadata,
                duration: None,
                tracks,
            },
            current_time: self.current_time,
            autoplay: self.autoplay,
            custom_data: CustomData::new(),
        }
    }
}

impl MediaStatus {
    pub fn idle(media_session_id: Option<MediaSessionId>) -> MediaStatus {
        MediaStatus {
            media_session_id,
            player_state: PlayerState::Idle,
            current_time: None,
            idle_reason: None,
        }
    }

    /// Status for `media_session_id` (or the first entry when `None`).
    /// A session the device no longer lists is idle.
    pub fn from_status(status: &media::Status, media_session_id: Option<MediaSessionId>)
    -> MediaStatus
    {
        let entry = match media_session_id {
            Some(id) => status.entry(id),
            None => status.entries.first(),
        };

        match entry {
            Some(entry) => MediaStatus {
                media_session_id: Some(entry.media_session_id),
                player_state: entry.player_state,
                current_time: entry.current_time,
                idle_reason: entry.idle_reason,
            },
            None => MediaStatus::idle(media_session_id),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.player_state == PlayerState::Idle
    }
}

impl From<PlayerState> for PlaybackState {
    fn from(player_state: PlayerState) -> PlaybackState {
        match player_state {
            PlayerState::Idle => PlaybackState::Idle,
            PlayerState::Playing => PlaybackState::Playing,
            PlayerState::Paused => PlaybackState::Paused,
            PlayerState::Buffering => PlaybackState::Buffering,
            PlayerState::Loading => PlaybackState::Loading,
            // Newer firmware states are transitional.
            PlayerState::Unknown => PlaybackState::Buffering,
        }
    }
}

impl Client {
    /// Load media into the default media receiver, launching it if needed.
    ///
    /// Resolves with the first MEDIA_STATUS for the new media session.
    #[named]
    pub async fn load(&self, args: LoadArgs) -> Result<MediaStatus> {
        const METHOD_PATH: &str = method_path!("Client");

        self.ensure_connected()?;

        let app_session = self.media_app_session().await?;

        {
            let mut session = self.session();
            session.loading = true;
            session.media_session_id = None;
        }

        tracing::info!(target: METHOD_PATH,
                       url = %args.url,
                       content_type = %args.content_type,
                       subtitles = args.subtitles.is_some(),
                       transport = app_session.app_destination_id,
                       "load");

        let res = self.load_on(&app_session, &args).await;

        let mut session = self.session();
        session.loading = false;

        let (media_session_id, status) = res?;
        session.media_session_id = Some(media_session_id);

        Ok(status)
    }

    pub async fn play(&self) -> Result<MediaStatus> {
        self.media_command(media::PlayRequest).await
    }

    pub async fn pause(&self) -> Result<MediaStatus> {
        self.media_command(media::PauseRequest).await
    }

    /// Stop playback and tear down the receiver app session.
    ///
    /// The media session id is kept so later status reads report it as idle.
    pub async fn stop(&self) -> Result<MediaStatus> {
        let status = self.media_command(media::StopRequest).await?;
        self.stop_app().await?;
        Ok(status)
    }

    /// Poll the device for the current media session's status.
    ///
    /// With no receiver app session this is answered locally as idle.
    pub async fn get_media_status(&self) -> Result<MediaStatus> {
        self.ensure_connected()?;

        let (app_session, media_session_id) = {
            let session = self.session();
            (session.app_session.clone(), session.media_session_id)
        };

        let Some(app_session) = app_session else {
            return Ok(MediaStatus::idle(media_session_id));
        };

        let status = self.media_get_status(&app_session, media_session_id).await?;
        Ok(MediaStatus::from_status(&status, media_session_id))
    }

    /// Adopt playback already running on the device, e.g. started by
    /// another process.
    pub async fn attach(&self) -> Result<MediaStatus> {
        let receiver_status = self.get_status().await?;

        let app = receiver_status.find_app(app::DEFAULT_MEDIA_RECEIVER)
            .or_else(|| receiver_status.media_app())
            .filter(|app| app.is_addressable())
            .ok_or(Error::NoActiveSession)?;

        let app_session = self.adopt_app(app).await?;

        let status = self.media_get_status(&app_session, None).await?;
        let media_session_id = status.first_media_session_id();
        self.session().media_session_id = media_session_id;

        Ok(MediaStatus::from_status(&status, media_session_id))
    }

    /// True iff the latest known status of the current media session is
    /// Idle, or nothing was ever loaded. Never touches the network.
    pub fn is_idle(&self) -> bool {
        matches!(self.playback_state(), PlaybackState::Idle | PlaybackState::NoMedia)
    }

    pub fn playback_state(&self) -> PlaybackState {
        let (loading, media_session_id, has_app) = {
            let session = self.session();
            (session.loading, session.media_session_id, session.app_session.is_some())
        };

        if loading {
            return PlaybackState::Loading;
        }
        let Some(media_session_id) = media_session_id else {
            return PlaybackState::NoMedia;
        };
        if !has_app {
            return PlaybackState::Idle;
        }

        match self.shared.media_status_tx.borrow().as_ref()
                  .and_then(|status| status.entry(media_session_id))
        {
            Some(entry) => entry.player_state.into(),
            None => PlaybackState::Idle,
        }
    }

    /// Cached status of the current media session, if one was ever loaded.
    pub fn media_status(&self) -> Option<MediaStatus> {
        let (media_session_id, has_app) = {
            let session = self.session();
            (session.media_session_id?, session.app_session.is_some())
        };

        if !has_app {
            return Some(MediaStatus::idle(Some(media_session_id)));
        }

        let cached = self.shared.media_status_tx.borrow();
        Some(match cached.as_ref() {
            Some(status) => MediaStatus::from_status(status, Some(media_session_id)),
            None => MediaStatus::idle(Some(media_session_id)),
        })
    }

    /// Wait until the current media session is idle.
    ///
    /// Woken by MEDIA_STATUS pushes; polls the device only after
    /// `poll_interval` passes without one.
    #[named]
    pub async fn wait_until_idle(&self, poll_interval: Duration) -> Result<MediaStatus> {
        const METHOD_PATH: &str = method_path!("Client");

        let mut media_rx = self.shared.media_status_tx.subscribe();
        let mut state_rx = self.shared.subscribe_state();

        loop {
            if !self.session().loading && self.is_idle() {
                let media_session_id = self.session().media_session_id;
                return Ok(self.media_status()
                              .unwrap_or_else(|| MediaStatus::idle(media_session_id)));
            }

            self.ensure_connected()?;

            tokio::select! {
                _ = media_rx.changed() => (),
                _ = state_rx.changed() => (),
                () = tokio::time::sleep(poll_interval) => {
                    tracing::trace!(target: METHOD_PATH,
                                    ?poll_interval,
                                    "no media push, polling");
                    let status = self.get_media_status().await?;
                    if status.is_idle() && !self.session().loading {
                        return Ok(status);
                    }
                },
            }
        }
    }
}

/// Internals.
impl Client {
    /// The running media receiver app, reused when already known or running,
    /// launched otherwise.
    async fn media_app_session(&self) -> Result<AppSession> {
        if let Some(app_session) = self.session().app_session.clone() {
            return Ok(app_session);
        }

        let receiver_status = self.get_status().await?;
        if let Some(app) = receiver_status.find_app(app::DEFAULT_MEDIA_RECEIVER)
                                          .filter(|app| app.is_addressable())
        {
            return self.adopt_app(app).await;
        }

        self.launch(app::DEFAULT_MEDIA_RECEIVER).await
    }

    async fn load_on(&self, app_session: &AppSession, args: &LoadArgs)
    -> Result<(MediaSessionId, MediaStatus)>
    {
        let req = args.to_request(app_session.session_id.clone());

        let resp = self.json_rpc::<_, LoadResponse>(
            req, app_session.app_destination_id.clone(), self.config().request_timeout).await;

        let status = match resp {
            Ok(Payload { inner: LoadResponse::Ok(status), .. }) => status,
            Ok(Payload { inner, .. }) => return Err(Error::LoadFailed(load_error_text(&inner))),
            Err(Error::RequestTimeout { timeout, .. }) =>
                return Err(Error::LoadFailed(format!("no response within {timeout:?}"))),
            Err(err) => return Err(err),
        };

        let Some(media_session_id) = status.first_media_session_id() else {
            return Err(Error::LoadFailed("MEDIA_STATUS without a media session".to_string()));
        };

        Ok((media_session_id, MediaStatus::from_status(&status, Some(media_session_id))))
    }

    async fn media_get_status(&self, app_session: &AppSession,
                              media_session_id: Option<MediaSessionId>)
    -> Result<media::Status>
    {
        let resp = self.json_rpc::<_, StatusResponse>(
            media::GetStatusRequest { media_session_id },
            app_session.app_destination_id.clone(),
            self.config().request_timeout).await?;
        media_status_from_response(resp)
    }

    async fn media_command<Req>(&self, make_req: impl FnOnce(MediaRequestCommon) -> Req)
    -> Result<MediaStatus>
    where Req: crate::payload::RequestInner
    {
        self.ensure_connected()?;

        let (app_session, media_session_id) = {
            let session = self.session();
            match (session.app_session.clone(), session.media_session_id) {
                (Some(app_session), Some(id)) => (app_session, id),
                _ => return Err(Error::NoActiveSession),
            }
        };

        let req = make_req(MediaRequestCommon {
            media_session_id,
            custom_data: CustomData::new(),
        });

        let resp = self.json_rpc::<_, StatusResponse>(
            req, app_session.app_destination_id, self.config().request_timeout).await?;
        let status = media_status_from_response(resp)?;

        Ok(MediaStatus::from_status(&status, Some(media_session_id)))
    }
}

fn media_status_from_response(resp: Payload<StatusResponse>) -> Result<media::Status> {
    match resp.inner {
        StatusResponse::Ok(status) => Ok(status),
        StatusResponse::InvalidPlayerState =>
            Err(Error::UnexpectedResponse("INVALID_PLAYER_STATE".to_string())),
        StatusResponse::InvalidRequest { reason } | StatusResponse::Error { reason } =>
            Err(Error::UnexpectedResponse(format!(
                "{typ}: {reason}",
                typ = resp.typ,
                reason = reason.as_deref().unwrap_or("no reason given")))),
    }
}

fn load_error_text(resp: &LoadResponse) -> String {
    match resp {
        LoadResponse::Ok(_) => "MEDIA_STATUS".to_string(),
        LoadResponse::LoadCancelled => "LOAD_CANCELLED".to_string(),
        LoadResponse::InvalidPlayerState => "INVALID_PLAYER_STATE".to_string(),
        LoadResponse::LoadFailed { reason, detailed_error_code }
        | LoadResponse::Error { reason, detailed_error_code } => {
            let typ = if matches!(resp, LoadResponse::LoadFailed { .. }) { "LOAD_FAILED" }
                      else { "ERROR" };
            match (reason, detailed_error_code) {
                (Some(reason), Some(code)) => format!("{typ}: {reason} (code {code})"),
                (Some(reason), None) => format!("{typ}: {reason}"),
                (None, Some(code)) => format!("{typ}: code {code}"),
                (None, None) => typ.to_string(),
            }
        },
        LoadResponse::InvalidRequest { reason } =>
            format!("INVALID_REQUEST: {}", reason.as_deref().unwrap_or("no reason given")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        async_client::{StatusMessage, DEFAULT_RECEIVER_ID},
        error::CloseReason,
        payload::{connection, receiver},
        test_util::{self, FakeDevice},
    };
    use futures::StreamExt;
    use serde_json::json;

    fn media_status_body(media_session_id: i32, player_state: &str) -> serde_json::Value {
        json!({
            "type": "MEDIA_STATUS",
            "status": [{
                "mediaSessionId": media_session_id,
                "playerState": player_state,
                "currentTime": 0.0,
                "supportedMediaCommands": 15
            }]
        })
    }

    /// Device side of launch("CC1AD845") answered with transport "T1".
    async fn serve_launch(device: &mut FakeDevice) {
        let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "LAUNCH").await;
        device.reply(&req, &body, test_util::media_app_status("session-1", "T1")).await;
        device.expect(connection::CHANNEL_NAMESPACE, "CONNECT").await;
    }

    /// Device side of a LOAD answered with `media_session_id` playing.
    async fn serve_load(device: &mut FakeDevice, media_session_id: i32) -> serde_json::Value {
        let (req, body) = device.expect(media::CHANNEL_NAMESPACE, "LOAD").await;
        assert_eq!(req.destination, "T1");
        device.reply(&req, &body, media_status_body(media_session_id, "PLAYING")).await;
        body
    }

    async fn launched_and_loaded(media_session_id: i32) -> (Client, FakeDevice) {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let device_side = async {
            serve_launch(&mut device).await;
            serve_load(&mut device, media_session_id).await;
        };
        let load = async {
            client.launch(app::DEFAULT_MEDIA_RECEIVER).await?;
            client.load(LoadArgs::new("http://host:9000/movie.mp4", "video/mp4")).await
        };
        let (res, ()) = tokio::join!(load, device_side);
        res.unwrap();

        (client, device)
    }

    #[test]
    fn load_request_with_subtitles() {
        let args = LoadArgs::new("http://host:9000/movie.mp4", "video/mp4")
            .with_subtitles("http://host:9000/movie.vtt", None)
            .with_title("Movie");
        let req = serde_json::to_value(args.to_request("session-1".to_string())).unwrap();

        assert_eq!(req, json!({
            "sessionId": "session-1",
            "media": {
                "contentId": "http://host:9000/movie.mp4",
                "streamType": "BUFFERED",
                "contentType": "video/mp4",
                "metadata": { "metadataType": 0, "title": "Movie" },
                "tracks": [{
                    "trackId": 1,
                    "type": "TEXT",
                    "trackContentId": "http://host:9000/movie.vtt",
                    "trackContentType": "text/vtt",
                    "subtype": "SUBTITLES",
                    "language": "en-US",
                    "name": "en-US"
                }]
            },
            "currentTime": 0.0,
            "autoplay": true,
            "activeTrackIds": [1]
        }));
    }

    #[test]
    fn load_request_without_subtitles_has_no_tracks() {
        let args = LoadArgs::new("http://host:9000/a.mp3", "audio/mpeg");
        let req = serde_json::to_value(args.to_request("s".to_string())).unwrap();
        assert!(req.get("activeTrackIds").is_none());
        assert!(req["media"].get("tracks").is_none());
        assert!(req["media"].get("metadata").is_none());
    }

    #[test]
    fn media_status_for_missing_session_is_idle() {
        let status: media::Status =
            serde_json::from_value(media_status_body(7, "PLAYING")).unwrap();

        assert_eq!(MediaStatus::from_status(&status, Some(7)).player_state, PlayerState::Playing);
        assert!(MediaStatus::from_status(&status, Some(8)).is_idle());
        assert_eq!(MediaStatus::from_status(&status, None).media_session_id, Some(7));
    }

    #[tokio::test]
    async fn end_to_end_launch_load_stop() {
        let config = test_util::test_config();
        let (client, mut device) = test_util::connected(config).await;
        assert_eq!(client.playback_state(), PlaybackState::NoMedia);

        let (app_session, ()) = tokio::join!(client.launch(app::DEFAULT_MEDIA_RECEIVER),
                                             serve_launch(&mut device));
        assert_eq!(app_session.unwrap().app_destination_id, "T1");

        let (status, _) = tokio::join!(
            client.load(LoadArgs::new("http://host:9000/movie.mp4", "video/mp4")),
            serve_load(&mut device, 42));
        let status = status.unwrap();
        assert_eq!(status.media_session_id, Some(42));
        assert_eq!(status.player_state, PlayerState::Playing);
        assert!(!client.is_idle());

        let device_side = async {
            let (req, body) = device.expect(media::CHANNEL_NAMESPACE, "STOP").await;
            assert_eq!(body["mediaSessionId"], 42);
            assert_eq!(req.destination, "T1");
            device.reply(&req, &body, media_status_body(42, "IDLE")).await;

            let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "STOP").await;
            assert_eq!(body["sessionId"], "session-1");
            assert_eq!(req.destination, DEFAULT_RECEIVER_ID);
            device.reply(&req, &body, json!({
                "type": "RECEIVER_STATUS",
                "status": { "applications": [] }
            })).await;
        };
        let (res, ()) = tokio::join!(client.stop(), device_side);
        res.unwrap();

        let status = client.get_media_status().await.unwrap();
        assert_eq!(status.player_state, PlayerState::Idle);
        assert_eq!(status.media_session_id, Some(42));
        assert!(client.is_idle());

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn idle_push_then_new_load() {
        let (client, mut device) = launched_and_loaded(42).await;
        let mut updates = Box::pin(client.listen_status());
        assert!(!client.is_idle());

        device.send_json(media::CHANNEL_NAMESPACE, "T1", "*", json!({
            "type": "MEDIA_STATUS",
            "requestId": 0,
            "status": [{
                "mediaSessionId": 42,
                "playerState": "IDLE",
                "idleReason": "FINISHED"
            }]
        })).await;

        let update = updates.next().await.unwrap();
        assert!(matches!(update.msg, StatusMessage::Media(_)));
        assert!(client.is_idle());
        assert_eq!(client.media_status().unwrap().idle_reason, Some(IdleReason::Finished));

        let (status, _) = tokio::join!(
            client.load(LoadArgs::new("http://host:9000/next.mp4", "video/mp4")),
            serve_load(&mut device, 43));
        assert_eq!(status.unwrap().media_session_id, Some(43));
        assert!(!client.is_idle());
        assert_eq!(client.playback_state(), PlaybackState::Playing);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn not_idle_while_loading() {
        let (client, mut device) = launched_and_loaded(42).await;

        let device_side = async {
            let (req, body) = device.expect(media::CHANNEL_NAMESPACE, "LOAD").await;
            // Old session reports idle while the new load is in flight.
            device.send_json(media::CHANNEL_NAMESPACE, "T1", "*",
                             media_status_body(42, "IDLE")).await;
            tokio::task::yield_now().await;
            assert!(!client.is_idle());
            assert_eq!(client.playback_state(), PlaybackState::Loading);
            device.reply(&req, &body, media_status_body(43, "BUFFERING")).await;
        };

        let (res, ()) = tokio::join!(
            client.load(LoadArgs::new("http://host:9000/next.mp4", "video/mp4")),
            device_side);
        assert_eq!(res.unwrap().player_state, PlayerState::Buffering);
        assert_eq!(client.playback_state(), PlaybackState::Buffering);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn load_failed_payload() {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let device_side = async {
            serve_launch(&mut device).await;
            let (req, body) = device.expect(media::CHANNEL_NAMESPACE, "LOAD").await;
            device.reply(&req, &body, json!({ "type": "LOAD_FAILED" })).await;
        };
        let load = async {
            client.launch(app::DEFAULT_MEDIA_RECEIVER).await?;
            client.load(LoadArgs::new("http://host:9000/movie.mp4", "video/mp4")).await
        };

        let (res, ()) = tokio::join!(load, device_side);
        assert!(matches!(res, Err(Error::LoadFailed(_))), "{res:?}");
        assert_eq!(client.playback_state(), PlaybackState::NoMedia);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn load_reuses_running_app() {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let device_side = async {
            let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "GET_STATUS").await;
            device.reply(&req, &body, test_util::media_app_status("session-9", "T1")).await;
            device.expect(connection::CHANNEL_NAMESPACE, "CONNECT").await;
            let load_body = serve_load(&mut device, 5).await;
            assert_eq!(load_body["sessionId"], "session-9");
        };

        let (res, ()) = tokio::join!(
            client.load(LoadArgs::new("http://host:9000/movie.mp4", "video/mp4")),
            device_side);
        assert_eq!(res.unwrap().media_session_id, Some(5));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn commands_need_a_media_session() {
        let (client, _device) = test_util::connected(test_util::test_config()).await;

        assert!(matches!(client.play().await, Err(Error::NoActiveSession)));
        assert!(matches!(client.pause().await, Err(Error::NoActiveSession)));
        assert!(matches!(client.stop().await, Err(Error::NoActiveSession)));
        assert!(client.is_idle());

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn pause_and_play_address_media_session() {
        let (client, mut device) = launched_and_loaded(42).await;

        let device_side = async {
            let (req, body) = device.expect(media::CHANNEL_NAMESPACE, "PAUSE").await;
            assert_eq!(body["mediaSessionId"], 42);
            device.reply(&req, &body, media_status_body(42, "PAUSED")).await;

            let (req, body) = device.expect(media::CHANNEL_NAMESPACE, "PLAY").await;
            assert_eq!(body["mediaSessionId"], 42);
            device.reply(&req, &body, media_status_body(42, "PLAYING")).await;
        };
        let commands = async {
            let paused = client.pause().await?;
            assert_eq!(client.playback_state(), PlaybackState::Paused);
            let playing = client.play().await?;
            Ok::<_, Error>((paused, playing))
        };

        let (res, ()) = tokio::join!(commands, device_side);
        let (paused, playing) = res.unwrap();
        assert_eq!(paused.player_state, PlayerState::Paused);
        assert_eq!(playing.player_state, PlayerState::Playing);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn attach_adopts_running_session() {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let device_side = async {
            let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "GET_STATUS").await;
            device.reply(&req, &body, test_util::media_app_status("session-1", "T1")).await;
            device.expect(connection::CHANNEL_NAMESPACE, "CONNECT").await;

            let (req, body) = device.expect(media::CHANNEL_NAMESPACE, "GET_STATUS").await;
            assert!(body.get("mediaSessionId").is_none());
            device.reply(&req, &body, media_status_body(77, "PAUSED")).await;
        };

        let (res, ()) = tokio::join!(client.attach(), device_side);
        let status = res.unwrap();
        assert_eq!(status.media_session_id, Some(77));
        assert_eq!(client.playback_state(), PlaybackState::Paused);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn app_close_drops_session() {
        let (client, mut device) = launched_and_loaded(42).await;
        let mut updates = Box::pin(client.listen_status());

        device.send_json(connection::CHANNEL_NAMESPACE, "T1", "sender-0",
                         json!({ "type": "CLOSE" })).await;

        let update = updates.next().await.unwrap();
        assert!(matches!(update.msg, StatusMessage::ConnectionClosed { ref source } if source == "T1"));
        assert_eq!(client.app_session(), None);
        assert!(client.is_idle());
        assert!(matches!(client.play().await, Err(Error::NoActiveSession)));

        client.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_idle_wakes_on_push() {
        let (client, mut device) = launched_and_loaded(42).await;

        let device_side = async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            device.send_json(media::CHANNEL_NAMESPACE, "T1", "*",
                             media_status_body(42, "IDLE")).await;
        };

        let (res, ()) = tokio::join!(client.wait_until_idle(Duration::from_secs(60)),
                                     device_side);
        assert!(res.unwrap().is_idle());

        client.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_idle_polls_without_push() {
        let (client, mut device) = launched_and_loaded(42).await;

        let device_side = async {
            let (req, body) = device.expect(media::CHANNEL_NAMESPACE, "GET_STATUS").await;
            assert_eq!(body["mediaSessionId"], 42);
            device.reply(&req, &body, media_status_body(42, "IDLE")).await;
        };

        let (res, ()) = tokio::join!(client.wait_until_idle(Duration::from_secs(2)),
                                     device_side);
        assert!(res.unwrap().is_idle());

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn wait_until_idle_fails_with_channel() {
        let (client, device) = launched_and_loaded(42).await;

        let (res, ()) = tokio::join!(client.wait_until_idle(Duration::from_secs(60)),
                                     async move { drop(device) });
        let err = res.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed(CloseReason::Eof)), "{err:?}");

        client.close().await.unwrap();
    }
}
