use std::sync::Arc;

use crate::protocol::request::{Method, RtspRequest};
use crate::protocol::response::{RtspResponse, StatusCode};
use crate::session::ClientSession;

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// Routes RTSP requests on one connection to its [`ClientSession`].
///
/// Session-scoped methods must carry the id this connection was assigned;
/// anything else is answered 454 before the session sees it.
pub struct MethodHandler {
    session: Arc<ClientSession>,
}

impl MethodHandler {
    pub fn new(session: Arc<ClientSession>) -> Self {
        MethodHandler { session }
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    pub fn handle(&self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");
        tracing::debug!(method = %request.method, uri = %request.uri, %cseq, "request");

        match request.method {
            Method::Options => self.handle_options(request),
            Method::Describe => self.session.describe(request),
            Method::Setup => self.handle_setup(request),
            Method::Play => self.with_session(request, |s| s.play(request)),
            Method::Pause => self.with_session(request, |s| s.pause(request)),
            Method::Teardown => self.with_session(request, |s| s.teardown(request)),
            Method::GetParameter => self.handle_get_parameter(request),
            Method::Other(ref name) => {
                tracing::warn!(method = %name, %cseq, "unsupported RTSP method");
                self.session.response(request, StatusCode::NotImplemented)
            }
        }
    }

    fn handle_options(&self, request: &RtspRequest) -> RtspResponse {
        self.session
            .response(request, StatusCode::Ok)
            .add_header("Public", PUBLIC_METHODS)
    }

    fn handle_setup(&self, request: &RtspRequest) -> RtspResponse {
        if let (Some(given), Some(ours)) = (request.session_id(), self.session.session_id())
            && given != ours
        {
            tracing::warn!(session_id = %given, "SETUP for a foreign session");
            return self.session.response(request, StatusCode::SessionNotFound);
        }
        match self.session.setup(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, uri = %request.uri, "SETUP failed");
                self.session
                    .response(request, StatusCode::InternalServerError)
            }
        }
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(cseq = ?request.cseq(), "GET_PARAMETER keepalive");
        self.session.response(request, StatusCode::Ok)
    }

    fn with_session(
        &self,
        request: &RtspRequest,
        f: impl FnOnce(&ClientSession) -> RtspResponse,
    ) -> RtspResponse {
        let ours = self.session.session_id();
        match (request.session_id(), ours.as_deref()) {
            (Some(given), Some(ours)) if given == ours => f(&self.session),
            (given, _) => {
                tracing::warn!(method = %request.method, session_id = ?given, "unknown session");
                self.session.response(request, StatusCode::SessionNotFound)
            }
        }
    }
}
