//! Platform receiver control: app lifecycle and device volume.

use crate::{
    async_client::{Client, DEFAULT_RECEIVER_ID, Result},
    error::Error,
    payload::{Payload, receiver::{self, Application, StatusResponse}},
    types::AppSession,
    util::named,
};
use std::sync::Arc;

/// Change applied by `volume_up` and `volume_down`.
pub const VOLUME_STEP: f32 = 0.1;

impl Client {
    /// Device status from a fresh GET_STATUS round trip.
    pub async fn get_status(&self) -> Result<receiver::Status> {
        self.ensure_connected()?;
        let resp = self.json_rpc::<_, StatusResponse>(
            receiver::GetStatusRequest {},
            DEFAULT_RECEIVER_ID.to_string(),
            self.config().request_timeout).await?;
        status_from_response(resp)
    }

    /// Latest receiver status seen on the channel, solicited or pushed.
    pub fn receiver_status(&self) -> Option<Arc<receiver::Status>> {
        self.shared.receiver_status_tx.borrow().clone()
    }

    /// The receiver app session media commands are currently addressed to.
    pub fn app_session(&self) -> Option<AppSession> {
        self.session().app_session.clone()
    }

    /// Launch `app_id` and open a virtual connection to its transport.
    ///
    /// Succeeds once the device reports a running entry for the app with both
    /// a session id and a transport id.
    #[named]
    pub async fn launch(&self, app_id: &str) -> Result<AppSession> {
        self.ensure_connected()?;

        let req = receiver::LaunchRequest { app_id: app_id.to_string() };
        let resp = self.json_rpc::<_, receiver::LaunchResponse>(
            req, DEFAULT_RECEIVER_ID.to_string(), self.config().request_timeout).await;

        let status = match resp {
            Ok(Payload { inner: receiver::LaunchResponse::Ok(wrapper), .. }) => wrapper.status,
            Ok(Payload { inner: receiver::LaunchResponse::Error { reason }, .. }) =>
                return Err(Error::LaunchFailed(format!(
                    "LAUNCH_ERROR: {}", reason.as_deref().unwrap_or("no reason given")))),
            Ok(Payload { inner: receiver::LaunchResponse::InvalidRequest { reason }, .. }) =>
                return Err(Error::LaunchFailed(format!(
                    "INVALID_REQUEST: {}", reason.as_deref().unwrap_or("no reason given")))),
            Err(Error::RequestTimeout { timeout, .. }) =>
                return Err(Error::LaunchFailed(format!("no response within {timeout:?}"))),
            Err(err) => return Err(err),
        };

        let Some(app) = status.find_app(app_id).filter(|app| app.is_addressable()) else {
            tracing::warn!(target: method_path!("Client"),
                           app_id,
                           status = ?receiver::small_debug::ReceiverStatus(&status),
                           "launch status has no usable app entry");
            return Err(Error::LaunchFailed(format!(
                "no running {app_id} entry with a session and transport id")));
        };

        self.adopt_app(app).await
    }

    /// Stop the current receiver app session.
    ///
    /// The local session is dropped even if the device rejects the request.
    pub async fn stop_app(&self) -> Result<receiver::Status> {
        self.ensure_connected()?;

        let app_session = self.session().app_session.take()
            .ok_or(Error::NoActiveSession)?;

        let req = receiver::StopRequest { session_id: app_session.session_id.clone() };
        let resp = self.json_rpc::<_, StatusResponse>(
            req, app_session.receiver_destination_id, self.config().request_timeout).await?;
        status_from_response(resp)
    }

    /// Set the device volume, `level` in `0.0..=1.0`.
    ///
    /// Returns the volume the device reports afterwards.
    pub async fn set_volume(&self, level: f32) -> Result<receiver::Volume> {
        if !(0.0..=1.0).contains(&level) {
            return Err(Error::InvalidVolume(level));
        }

        self.set_volume_fields(receiver::Volume {
            level: Some(level),
            ..Default::default()
        }).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<receiver::Volume> {
        self.set_volume_fields(receiver::Volume {
            muted: Some(muted),
            ..Default::default()
        }).await
    }

    pub async fn volume_up(&self) -> Result<receiver::Volume> {
        self.step_volume(VOLUME_STEP).await
    }

    pub async fn volume_down(&self) -> Result<receiver::Volume> {
        self.step_volume(-VOLUME_STEP).await
    }

    #[named]
    async fn step_volume(&self, delta: f32) -> Result<receiver::Volume> {
        let status = self.get_status().await?;
        let current = status.volume.level.unwrap_or(0.0);
        let target = (current + delta).clamp(0.0, 1.0);

        tracing::debug!(target: method_path!("Client"),
                        current, delta, target,
                        "volume step");

        self.set_volume(target).await
    }

    async fn set_volume_fields(&self, volume: receiver::Volume) -> Result<receiver::Volume> {
        self.ensure_connected()?;
        let resp = self.json_rpc::<_, StatusResponse>(
            receiver::SetVolumeRequest { volume },
            DEFAULT_RECEIVER_ID.to_string(),
            self.config().request_timeout).await?;
        Ok(status_from_response(resp)?.volume)
    }

    /// Connect to a running app's transport and address media commands to it.
    pub(crate) async fn adopt_app(&self, app: &Application) -> Result<AppSession> {
        let app_session = app.to_app_session(DEFAULT_RECEIVER_ID.to_string());

        self.connection_connect(app_session.app_destination_id.clone()).await?;

        let mut session = self.session();
        if session.app_session.as_ref() != Some(&app_session) {
            session.media_session_id = None;
        }
        session.app_session = Some(app_session.clone());

        Ok(app_session)
    }
}

fn status_from_response(resp: Payload<StatusResponse>) -> Result<receiver::Status> {
    match resp.inner {
        StatusResponse::Ok(wrapper) => Ok(wrapper.status),
        StatusResponse::InvalidRequest { reason } => Err(Error::UnexpectedResponse(format!(
            "INVALID_REQUEST: {}", reason.as_deref().unwrap_or("no reason given")))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{payload, test_util};
    use serde_json::json;

    fn status_with_volume(level: f64) -> serde_json::Value {
        json!({
            "type": "RECEIVER_STATUS",
            "status": { "volume": { "level": level, "muted": false } }
        })
    }

    async fn volume_step_requests(start: f64, up: bool) -> serde_json::Value {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let device_side = async {
            let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "GET_STATUS").await;
            device.reply(&req, &body, status_with_volume(start)).await;

            let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "SET_VOLUME").await;
            let requested = body["volume"]["level"].clone();
            device.reply(&req, &body, status_with_volume(requested.as_f64().unwrap())).await;
            requested
        };

        let step = async {
            if up { client.volume_up().await } else { client.volume_down().await }
        };

        let (res, requested) = tokio::join!(step, device_side);
        let volume = res.unwrap();
        assert_eq!(volume.level.map(f64::from), requested.as_f64());

        client.close().await.unwrap();
        requested
    }

    #[tokio::test]
    async fn volume_up_clamps_at_one() {
        assert_eq!(volume_step_requests(0.95, true).await, json!(1.0));
    }

    #[tokio::test]
    async fn volume_down_clamps_at_zero() {
        assert_eq!(volume_step_requests(0.05, false).await, json!(0.0));
    }

    #[tokio::test]
    async fn device_reported_volume_wins() {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let device_side = async {
            let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "SET_VOLUME").await;
            assert_eq!(body["volume"], json!({ "level": 0.5 }));
            device.reply(&req, &body, status_with_volume(0.25)).await;
        };

        let (res, ()) = tokio::join!(client.set_volume(0.5), device_side);
        assert_eq!(res.unwrap().level, Some(0.25));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn set_volume_rejects_out_of_range() {
        let (client, _device) = test_util::connected(test_util::test_config()).await;

        assert!(matches!(client.set_volume(1.5).await, Err(Error::InvalidVolume(_))));
        assert!(matches!(client.set_volume(f32::NAN).await, Err(Error::InvalidVolume(_))));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn launch_connects_to_transport() {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let device_side = async {
            let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "LAUNCH").await;
            assert_eq!(body["appId"], "CC1AD845");
            device.reply(&req, &body, test_util::media_app_status("session-1", "T1")).await;

            let (connect, _) = device.expect(payload::connection::CHANNEL_NAMESPACE,
                                             "CONNECT").await;
            assert_eq!(connect.destination, "T1");
        };

        let (res, ()) = tokio::join!(client.launch("CC1AD845"), device_side);
        let app_session = res.unwrap();
        assert_eq!(app_session.app_destination_id, "T1");
        assert_eq!(app_session.session_id, "session-1");
        assert_eq!(client.app_session(), Some(app_session));
        assert!(client.receiver_status().is_some());

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn launch_error_is_launch_failed() {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let device_side = async {
            let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "LAUNCH").await;
            device.reply(&req, &body, json!({ "type": "LAUNCH_ERROR", "reason": "NOT_FOUND" }))
                  .await;
        };

        let (res, ()) = tokio::join!(client.launch("CC1AD845"), device_side);
        assert!(matches!(res, Err(Error::LaunchFailed(_))), "{res:?}");
        assert_eq!(client.app_session(), None);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn launch_without_transport_is_launch_failed() {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let device_side = async {
            let (req, body) = device.expect(receiver::CHANNEL_NAMESPACE, "LAUNCH").await;
            device.reply(&req, &body, test_util::media_app_status("session-1", "")).await;
        };

        let (res, ()) = tokio::join!(client.launch("CC1AD845"), device_side);
        assert!(matches!(res, Err(Error::LaunchFailed(_))), "{res:?}");

        client.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn launch_timeout_is_launch_failed() {
        let (client, mut device) = test_util::connected(test_util::test_config()).await;

        let (res, _req) = tokio::join!(
            client.launch("CC1AD845"),
            device.expect(receiver::CHANNEL_NAMESPACE, "LAUNCH"));
        assert!(matches!(res, Err(Error::LaunchFailed(_))), "{res:?}");

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn operations_after_close_are_not_connected() {
        let (client, _device) = test_util::connected(test_util::test_config()).await;
        client.close().await.unwrap();

        assert!(matches!(client.get_status().await, Err(Error::NotConnected)));
        assert!(matches!(client.launch("CC1AD845").await, Err(Error::NotConnected)));
        assert!(matches!(client.volume_up().await, Err(Error::NotConnected)));
    }
}
