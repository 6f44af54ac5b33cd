//! Offer/answer exchange for one media session.

use relaylink_common::{NegotiationError, RemoteCandidate, SdpType, SessionDescription};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::credentials::TraversalServer;
use crate::engine::{EngineEvents, MediaEngine, MediaSession, SessionConfig};
use crate::media::{MediaSink, VideoSource};
use crate::types::NegotiationRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferReceived,
    AnswerSent,
    OfferSent,
    AnswerReceived,
}

/// Owns at most one [`MediaSession`] at a time.
pub struct SessionNegotiator {
    engine: Arc<dyn MediaEngine>,
    role: NegotiationRole,
    servers: Vec<TraversalServer>,
    video_file: Option<PathBuf>,
    events: EngineEvents,
    sink: MediaSink,
    session: Option<Box<dyn MediaSession>>,
    state: NegotiationState,
}

impl SessionNegotiator {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        role: NegotiationRole,
        servers: Vec<TraversalServer>,
        video_file: Option<PathBuf>,
        events: EngineEvents,
    ) -> Self {
        Self {
            engine,
            role,
            servers,
            video_file,
            events,
            sink: MediaSink::new(),
            session: None,
            state: NegotiationState::Idle,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn sink(&self) -> &MediaSink {
        &self.sink
    }

    /// Caller role only: builds the session up front so remote answers have something to
    /// land on.
    pub async fn prepare(&mut self) -> Result<(), NegotiationError> {
        if self.role != NegotiationRole::Caller || self.session.is_some() {
            return Ok(());
        }
        self.open_session().await?;
        let session = self.current("prepare")?;
        session
            .add_track(VideoSource::select(self.video_file.as_deref()))
            .await
    }

    /// Caller role only: produces the local offer for a newly joined peer.
    ///
    /// Returns `Ok(None)` for a responder or once an offer has already gone out.
    pub async fn create_offer(&mut self) -> Result<Option<SessionDescription>, NegotiationError> {
        if self.role != NegotiationRole::Caller || self.state != NegotiationState::Idle {
            return Ok(None);
        }
        let session = self.current("offer")?;
        let offer = session.create_offer().await?;
        session.set_local_description(&offer).await?;
        let local = session.local_description().await.unwrap_or(offer);
        self.state = NegotiationState::OfferSent;
        Ok(Some(local))
    }

    /// Applies a remote offer and returns the local answer to send back.
    ///
    /// Returns `Ok(None)` when the offer is not acceptable right now: a session already
    /// exists or this side is the caller. The caller keeps its current state in that case.
    pub async fn handle_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        if self.role == NegotiationRole::Caller {
            warn!("offer received while acting as caller, ignoring");
            return Ok(None);
        }
        if self.session.is_some() {
            warn!(state = ?self.state, "offer received while a session is active, rejecting");
            return Ok(None);
        }
        if offer.sdp_type != SdpType::Offer {
            return Err(NegotiationError::InvalidDescription(format!(
                "expected an offer, got {}",
                offer.sdp_type
            )));
        }
        if offer.sdp.trim().is_empty() {
            return Err(NegotiationError::InvalidDescription("empty sdp".into()));
        }

        self.state = NegotiationState::OfferReceived;
        self.open_session().await?;
        let session = self.current("offer")?;
        session.set_remote_description(offer).await?;

        self.sink.start();
        session
            .add_track(VideoSource::select(self.video_file.as_deref()))
            .await?;

        let answer = session.create_answer().await?;
        session.set_local_description(&answer).await?;
        let local = session.local_description().await.unwrap_or(answer);
        info!(sdp_len = local.sdp.len(), "answer ready");
        Ok(Some(local))
    }

    /// Records that the answer produced by [`handle_offer`](Self::handle_offer) is on the wire.
    pub fn answer_sent(&mut self) {
        if self.state == NegotiationState::OfferReceived {
            self.state = NegotiationState::AnswerSent;
        }
    }

    /// Applies a remote answer to a caller-side session.
    ///
    /// Returns `Ok(false)` without touching the session unless our offer is outstanding,
    /// so a duplicate or premature answer is harmless.
    pub async fn handle_answer(
        &mut self,
        answer: &SessionDescription,
    ) -> Result<bool, NegotiationError> {
        let Some(session) = self.session.as_ref() else {
            return Err(NegotiationError::NoSession("answer"));
        };
        if self.state != NegotiationState::OfferSent {
            warn!(state = ?self.state, "answer without an outstanding offer, ignoring");
            return Ok(false);
        }
        if !matches!(answer.sdp_type, SdpType::Answer | SdpType::Pranswer) {
            return Err(NegotiationError::InvalidDescription(format!(
                "expected an answer, got {}",
                answer.sdp_type
            )));
        }
        session.set_remote_description(answer).await?;
        self.sink.start();
        self.state = NegotiationState::AnswerReceived;
        Ok(true)
    }

    /// Adds a trickled candidate. Returns false when there is no session to add it to.
    pub async fn handle_candidate(
        &mut self,
        candidate: &RemoteCandidate,
    ) -> Result<bool, NegotiationError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(false);
        };
        debug!(kind = %candidate.kind, address = %candidate.address, "adding remote candidate");
        session.add_remote_candidate(candidate).await?;
        Ok(true)
    }

    /// Releases the session and stops the sink. Safe to call more than once.
    pub async fn close(&mut self) {
        self.sink.stop();
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "media session close failed");
            }
            debug!("media session released");
        }
        self.state = NegotiationState::Idle;
    }

    async fn open_session(&mut self) -> Result<(), NegotiationError> {
        let config = SessionConfig {
            servers: self.servers.clone(),
        };
        let session = self
            .engine
            .create_session(config, self.events.clone(), self.sink.clone())
            .await?;
        self.session = Some(session);
        Ok(())
    }

    fn current(&self, step: &'static str) -> Result<&dyn MediaSession, NegotiationError> {
        self.session.as_deref().ok_or(NegotiationError::NoSession(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls {
        sessions: AtomicUsize,
        closes: AtomicUsize,
        candidates: AtomicUsize,
        log: Mutex<Vec<&'static str>>,
    }

    struct StubEngine {
        calls: Arc<Calls>,
        reject_remote: bool,
    }

    struct StubSession {
        calls: Arc<Calls>,
        reject_remote: bool,
    }

    #[async_trait]
    impl MediaEngine for StubEngine {
        async fn create_session(
            &self,
            _config: SessionConfig,
            _events: EngineEvents,
            _sink: MediaSink,
        ) -> Result<Box<dyn MediaSession>, NegotiationError> {
            self.calls.sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubSession {
                calls: Arc::clone(&self.calls),
                reject_remote: self.reject_remote,
            }))
        }
    }

    #[async_trait]
    impl MediaSession for StubSession {
        async fn set_remote_description(
            &self,
            _desc: &SessionDescription,
        ) -> Result<(), NegotiationError> {
            self.calls.log.lock().unwrap().push("remote");
            if self.reject_remote {
                return Err(NegotiationError::engine("set remote description", "bad sdp"));
            }
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
            self.calls.log.lock().unwrap().push("offer");
            Ok(SessionDescription::new(SdpType::Offer, "v=0 offer"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            self.calls.log.lock().unwrap().push("answer");
            Ok(SessionDescription::new(SdpType::Answer, "v=0 answer"))
        }
        async fn set_local_description(
            &self,
            _desc: &SessionDescription,
        ) -> Result<(), NegotiationError> {
            self.calls.log.lock().unwrap().push("local");
            Ok(())
        }
        async fn local_description(&self) -> Option<SessionDescription> {
            None
        }
        async fn add_track(&self, _source: VideoSource) -> Result<(), NegotiationError> {
            self.calls.log.lock().unwrap().push("track");
            Ok(())
        }
        async fn add_remote_candidate(
            &self,
            _candidate: &RemoteCandidate,
        ) -> Result<(), NegotiationError> {
            self.calls.candidates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> Result<(), NegotiationError> {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn negotiator(role: NegotiationRole, reject_remote: bool) -> (SessionNegotiator, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let engine = Arc::new(StubEngine {
            calls: Arc::clone(&calls),
            reject_remote,
        });
        let (events, _rx) = EngineEvents::channel();
        (
            SessionNegotiator::new(engine, role, vec![], None, events),
            calls,
        )
    }

    fn candidate() -> RemoteCandidate {
        RemoteCandidate::parse("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host", None, Some(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_offer_produces_answer_in_order() {
        let (mut n, calls) = negotiator(NegotiationRole::Responder, false);
        let answer = n
            .handle_offer(&SessionDescription::new(SdpType::Offer, "v=0 offer"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert_eq!(
            *calls.log.lock().unwrap(),
            vec!["remote", "track", "answer", "local"]
        );
        assert_eq!(n.state(), NegotiationState::OfferReceived);
        assert!(n.sink().is_running());
        n.answer_sent();
        assert_eq!(n.state(), NegotiationState::AnswerSent);
    }

    #[tokio::test]
    async fn test_second_offer_rejected_without_new_session() {
        let (mut n, calls) = negotiator(NegotiationRole::Responder, false);
        let offer = SessionDescription::new(SdpType::Offer, "v=0 offer");
        assert!(n.handle_offer(&offer).await.unwrap().is_some());
        n.answer_sent();
        assert!(n.handle_offer(&offer).await.unwrap().is_none());
        assert_eq!(calls.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(n.state(), NegotiationState::AnswerSent);
    }

    #[tokio::test]
    async fn test_engine_rejection_is_an_error_and_session_kept_for_cleanup() {
        let (mut n, calls) = negotiator(NegotiationRole::Responder, true);
        let err = n
            .handle_offer(&SessionDescription::new(SdpType::Offer, "v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Engine { .. }));
        assert!(n.has_session());
        n.close().await;
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_offer_description_rejected() {
        let (mut n, _) = negotiator(NegotiationRole::Responder, false);
        let err = n
            .handle_offer(&SessionDescription::new(SdpType::Answer, "v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidDescription(_)));
        assert!(!n.has_session());
    }

    #[tokio::test]
    async fn test_candidate_without_session_is_skipped() {
        let (mut n, calls) = negotiator(NegotiationRole::Responder, false);
        assert!(!n.handle_candidate(&candidate()).await.unwrap());
        n.handle_offer(&SessionDescription::new(SdpType::Offer, "v=0"))
            .await
            .unwrap();
        assert!(n.handle_candidate(&candidate()).await.unwrap());
        assert_eq!(calls.candidates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut n, calls) = negotiator(NegotiationRole::Responder, false);
        n.handle_offer(&SessionDescription::new(SdpType::Offer, "v=0"))
            .await
            .unwrap();
        n.close().await;
        n.close().await;
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
        assert!(!n.has_session());
        assert!(!n.sink().is_running());
        assert_eq!(n.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_caller_role_prepares_and_applies_answer() {
        let (mut n, calls) = negotiator(NegotiationRole::Caller, false);
        assert!(matches!(
            n.handle_answer(&SessionDescription::new(SdpType::Answer, "v=0"))
                .await,
            Err(NegotiationError::NoSession("answer"))
        ));
        n.prepare().await.unwrap();
        n.prepare().await.unwrap();
        assert_eq!(calls.sessions.load(Ordering::SeqCst), 1);
        assert!(!n.sink().is_running());

        let early = SessionDescription::new(SdpType::Answer, "v=0 early");
        assert!(!n.handle_answer(&early).await.unwrap());
        assert_eq!(n.state(), NegotiationState::Idle);
        assert!(!n.sink().is_running());

        let offer = n.create_offer().await.unwrap().unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(n.state(), NegotiationState::OfferSent);
        assert!(n.create_offer().await.unwrap().is_none());

        assert!(n
            .handle_offer(&SessionDescription::new(SdpType::Offer, "v=0"))
            .await
            .unwrap()
            .is_none());
        assert!(n
            .handle_answer(&SessionDescription::new(SdpType::Answer, "v=0"))
            .await
            .unwrap());
        assert_eq!(n.state(), NegotiationState::AnswerReceived);
        assert!(n.sink().is_running());

        assert!(!n
            .handle_answer(&SessionDescription::new(SdpType::Answer, "v=0"))
            .await
            .unwrap());
        assert_eq!(n.state(), NegotiationState::AnswerReceived);
    }
}
