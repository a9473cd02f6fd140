//! Enrollment state machine.
//!
//! An [`Enroller`] drives one registration attempt: it resolves the caller's
//! tab, waits for the origin to be approved, checks the requested app ids,
//! hands the encoded challenges to the device helper and delivers exactly one
//! terminal callback. All of it runs on a single thread; collaborators are
//! awaited in sequence and `close()` may be called from another task at any
//! suspension point.

pub mod collaborators;
pub mod config;
pub mod timer;

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use base64::Engine as _;
use sha2::{Digest, Sha256};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info, warn};

use crate::base64::{decode_websafe, BASE64_URLSAFE_NOPAD};
use crate::u2f::{
    attestation::make_cert_and_key,
    error::Error,
    proto::{
        constants::*,
        raw_message::{ChallengeParameter, Registration},
        web_message::*,
    },
};

pub use collaborators::*;
pub use config::{ConveyancePreference, EnrollerConfig};
pub use timer::Countdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error(ErrorCode),
    /// Closed by its owner, no callback delivered.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollerState {
    Created,
    AwaitingTabId,
    AwaitingOriginApproval,
    AwaitingAppIdCheck,
    AwaitingHelper,
    Done(Outcome),
}

impl EnrollerState {
    pub fn is_done(&self) -> bool {
        matches!(self, EnrollerState::Done(_))
    }
}

type SuccessCallback = Box<dyn FnOnce(U2fRegisterResponse)>;
type ErrorCallback = Box<dyn FnOnce(ClientError)>;

struct PendingEnroll {
    enroll_challenges: Vec<EnrollChallenge>,
    app_id: Option<String>,
}

struct EnrollerInner {
    state: EnrollerState,
    sender: Sender,
    timer: Countdown,
    /// Browser data sent (hashed) to the helper, keyed by protocol version.
    browser_data: HashMap<String, Vec<u8>>,
    handler: Option<Rc<dyn HelperHandle>>,
    pending: Option<PendingEnroll>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

/// Handle on one enrollment attempt. Clones share the attempt.
#[derive(Clone)]
pub struct Enroller {
    inner: Rc<RefCell<EnrollerInner>>,
    config: Rc<EnrollerConfig>,
    deps: EnrollerDeps,
    watchdog: Instant,
    finished: Rc<Notify>,
}

impl Enroller {
    pub fn new<S, E>(sender: Sender, config: EnrollerConfig, deps: EnrollerDeps, on_success: S, on_error: E) -> Self
    where
        S: FnOnce(U2fRegisterResponse) + 'static,
        E: FnOnce(ClientError) + 'static,
    {
        let timer = Countdown::new(config.protocol_timeout());
        let watchdog = Instant::now() + config.watchdog_timeout();

        Enroller {
            inner: Rc::new(RefCell::new(EnrollerInner {
                state: EnrollerState::Created,
                sender,
                timer,
                browser_data: HashMap::new(),
                handler: None,
                pending: None,
                on_success: Some(Box::new(on_success)),
                on_error: Some(Box::new(on_error)),
            })),
            config: Rc::new(config),
            deps,
            watchdog,
            finished: Rc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> EnrollerState {
        self.inner.borrow().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn sender(&self) -> Sender {
        self.inner.borrow().sender.clone()
    }

    /// Runs the enrollment until a terminal callback is delivered or the
    /// enroller is closed. Only the first call on an enroller does anything.
    pub async fn do_enroll(&self, enroll_challenges: Vec<EnrollChallenge>, sign_challenges: Vec<SignChallenge>, app_id: Option<String>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != EnrollerState::Created {
                warn!(state = ?inner.state, "Enrollment already started on this enroller");
                return;
            }

            inner.pending = Some(PendingEnroll {
                enroll_challenges: enroll_challenges.clone(),
                app_id: app_id.clone(),
            });
        }

        let attempt = tokio::time::timeout_at(self.watchdog, self.enroll(enroll_challenges, sign_challenges, app_id));

        tokio::select! {
            outcome = attempt => match outcome {
                Ok(Ok(reply)) => self.helper_complete(reply),
                Ok(Err(error)) => self.notify_error(error),
                Err(_) => {
                    warn!("Watchdog expired before the enrollment completed");
                    self.notify_error(ClientError::timeout());
                }
            },
            _ = self.finished.notified() => debug!("Enroller finished while a step was in flight"),
        }
    }

    async fn enroll(
        &self,
        enroll_challenges: Vec<EnrollChallenge>,
        sign_challenges: Vec<SignChallenge>,
        app_id: Option<String>,
    ) -> Result<HelperReply, ClientError> {
        let sender = self.advance(EnrollerState::AwaitingTabId)?;

        let tab_id = self
            .deps
            .tab_resolver
            .resolve_tab_id(&sender)
            .await
            .ok_or_else(|| ClientError::bad_request(Some("Unable to resolve the sender's tab".to_string())))?;
        self.inner.borrow_mut().sender.tab_id = Some(tab_id);

        self.approve_origin(&sender, tab_id).await?;
        self.send_to_helper(&sender, &enroll_challenges, &sign_challenges, app_id.as_deref()).await
    }

    /// Moves to `state` unless the enroller already finished.
    fn advance(&self, state: EnrollerState) -> Result<Sender, ClientError> {
        let mut inner = self.inner.borrow_mut();

        if inner.state.is_done() {
            return Err(ClientError::other_error(None));
        }

        debug!(from = ?inner.state, to = ?state, "Enroller transition");
        inner.state = state;
        Ok(inner.sender.clone())
    }

    async fn approve_origin(&self, sender: &Sender, tab_id: TabId) -> Result<(), ClientError> {
        self.advance(EnrollerState::AwaitingOriginApproval)?;

        if self.deps.approved_origins.is_approved(&sender.origin, tab_id).await {
            return Ok(());
        }

        // An unapproved origin only ever observes the same timeout a slow user would cause
        let timer = {
            let mut inner = self.inner.borrow_mut();
            if inner.timer.expired() {
                return Err(ClientError::timeout());
            }

            let rearmed = inner.timer.clone_timer();
            inner.timer.cancel();
            inner.timer = rearmed.clone();
            rearmed
        };

        debug!(origin = %sender.origin, "Origin not approved, waiting for the timer");
        timer.expiry().await;
        Err(ClientError::timeout())
    }

    async fn send_to_helper(
        &self,
        sender: &Sender,
        enroll_challenges: &[EnrollChallenge],
        sign_challenges: &[SignChallenge],
        app_id: Option<&str>,
    ) -> Result<HelperReply, ClientError> {
        self.advance(EnrollerState::AwaitingAppIdCheck)?;

        let (encoded_challenges, browser_data) = encode_enroll_challenges(enroll_challenges, app_id, sender).map_err(bad_request)?;
        let sign_data = encode_sign_challenges(sign_challenges, app_id).map_err(bad_request)?;

        let timer = {
            let mut inner = self.inner.borrow_mut();
            inner.browser_data.extend(browser_data);
            inner.timer.clone()
        };

        let request = HelperRequest {
            req_type: HelperRequestType::Enroll,
            enroll_challenges: encoded_challenges,
            sign_data,
            timeout_seconds: (!timer.expired()).then(|| timer.millis_remaining() as f64 / 1000.0),
            log_msg_url: self.config.log_msg_url.clone(),
        };

        let app_ids = collect_app_ids(app_id, enroll_challenges, sign_challenges);
        if app_ids.is_empty() {
            return Err(bad_request(Error::Validation("No app id to enroll for".to_string())));
        }

        if !self.deps.origin_checker.can_claim_app_ids(&sender.origin, &app_ids).await {
            return Err(ClientError::bad_request(Some(format!(
                "{} may not claim the requested app ids",
                sender.origin
            ))));
        }

        let allowed = self
            .deps
            .app_id_checker
            .check_app_ids(
                timer.clone_timer(),
                &sender.origin,
                &app_ids,
                sender.allow_http(),
                self.config.log_msg_url.as_deref(),
            )
            .await;
        if !allowed {
            return Err(ClientError::bad_request(Some("App id policy does not list the origin".to_string())));
        }

        self.advance(EnrollerState::AwaitingHelper)?;

        let handler = self
            .deps
            .helpers
            .get_handler(&request)
            .ok_or_else(|| ClientError::other_error(Some("No helper available".to_string())))?;
        self.inner.borrow_mut().handler = Some(handler.clone());

        debug!(challenges = request.enroll_challenges.len(), "Dispatching enroll request to helper");
        Ok(handler.run().await)
    }

    /// Handles the helper's reply. Replies arriving after the enrollment
    /// finished are dropped.
    pub fn helper_complete(&self, reply: HelperReply) {
        if self.is_done() {
            debug!("Ignoring helper reply for a finished enrollment");
            return;
        }

        match reply.code {
            Some(code) if code != DEVICE_OK_STATUS => {
                let error = self.map_device_error(code);
                self.notify_error(error);
            }
            _ => self.deliver_registration(reply),
        }
    }

    fn map_device_error(&self, code: i32) -> ClientError {
        match code {
            DEVICE_WRONG_DATA_STATUS => ClientError::device_ineligible(),
            DEVICE_TIMEOUT_STATUS | DEVICE_WAIT_TOUCH_STATUS => ClientError::timeout(),
            _ => {
                if self.deps.remote_log.admit() {
                    warn!(
                        target: "u2f_enroll::remote",
                        log_msg_url = ?self.config.log_msg_url,
                        code = %format!("{:#x}", code),
                        "Unmapped device status code"
                    );
                }
                ClientError::other_error(None)
            }
        }
    }

    fn deliver_registration(&self, reply: HelperReply) {
        let browser_data = if reply.version == U2F_V2_VERSION_STR {
            self.inner.borrow().browser_data.get(&reply.version).cloned()
        } else {
            None
        };

        let registration_data = match self.config.conveyance {
            ConveyancePreference::Direct => reply.enroll_data,
            ConveyancePreference::Anonymized => match self.anonymize(&reply, browser_data.as_deref()) {
                Ok(data) => data,
                Err(e) => {
                    warn!(error = %e, "Unable to replace the attestation certificate");
                    self.notify_error(ClientError::other_error(None));
                    return;
                }
            },
        };

        self.notify_success(U2fRegisterResponse {
            version: reply.version,
            registration_data,
            client_data: browser_data.map(|data| BASE64_URLSAFE_NOPAD.encode(data)),
        });
    }

    /// Swaps the device attestation in the reply for a synthetic one.
    fn anonymize(&self, reply: &HelperReply, browser_data: Option<&[u8]>) -> Result<String, Error> {
        let (app_id, challenge) = {
            let inner = self.inner.borrow();
            let pending = inner
                .pending
                .as_ref()
                .ok_or_else(|| Error::Validation("No enrollment in progress".to_string()))?;

            let challenge = pending.enroll_challenges.iter().find(|c| c.version() == reply.version);
            let app_id = challenge
                .and_then(|c| c.app_id.clone())
                .or_else(|| pending.app_id.clone())
                .ok_or_else(|| Error::Validation("No app id for the enrolled version".to_string()))?;

            (app_id, challenge.map(|c| c.challenge.clone()))
        };

        let legacy_hash;
        let challenge = match browser_data {
            Some(client_data) => ChallengeParameter::ClientData(client_data),
            None => {
                let challenge = challenge.ok_or_else(|| Error::Validation(format!("No challenge for version {}", reply.version)))?;
                legacy_hash = decode_websafe(&challenge)?;
                ChallengeParameter::Hash(&legacy_hash)
            }
        };

        let registration = Registration::from_base64(&reply.enroll_data, &app_id, challenge)?;
        let attestation = make_cert_and_key(registration.certificate())?;
        let signature = registration.sign(&attestation.key)?;

        registration.with_replacement(&attestation.certificate, &signature)
    }

    /// Releases the helper and stops the enroller without delivering anything.
    pub fn close(&self) {
        if self.finish(Outcome::Closed).is_some() {
            debug!("Enroller closed");
        }
    }

    fn notify_success(&self, response: U2fRegisterResponse) {
        if let Some((Some(on_success), _)) = self.finish(Outcome::Success) {
            info!(version = %response.version, "Enrollment succeeded");
            on_success(response);
        }
    }

    fn notify_error(&self, error: ClientError) {
        if let Some((_, Some(on_error))) = self.finish(Outcome::Error(error.error_code)) {
            info!(code = ?error.error_code, "Enrollment failed");
            on_error(error);
        }
    }

    /// Moves to `Done` once. Returns the callbacks only to the caller that did.
    fn finish(&self, outcome: Outcome) -> Option<(Option<SuccessCallback>, Option<ErrorCallback>)> {
        let (callbacks, handler) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state.is_done() {
                return None;
            }

            inner.state = EnrollerState::Done(outcome);
            inner.timer.cancel();
            ((inner.on_success.take(), inner.on_error.take()), inner.handler.take())
        };

        if let Some(handler) = handler {
            handler.close();
        }
        self.finished.notify_one();

        Some(callbacks)
    }
}

fn bad_request(e: Error) -> ClientError {
    warn!(error = %e, "Rejecting enroll request");
    ClientError::bad_request(Some(e.to_string()))
}

fn websafe_sha256(data: &[u8]) -> String {
    BASE64_URLSAFE_NOPAD.encode(Sha256::digest(data))
}

/// Encodes enroll challenges for the helper and returns the browser data
/// produced for current-version challenges.
fn encode_enroll_challenges(
    challenges: &[EnrollChallenge],
    app_id: Option<&str>,
    sender: &Sender,
) -> Result<(Vec<HelperEnrollChallenge>, HashMap<String, Vec<u8>>), Error> {
    let mut encoded = Vec::with_capacity(challenges.len());
    let mut browser_data = HashMap::new();

    for challenge in challenges {
        let version = challenge.version();
        let challenge_app_id = challenge
            .app_id
            .as_deref()
            .or(app_id)
            .ok_or_else(|| Error::Validation("Enroll challenge without app id".to_string()))?;

        let challenge_hash = if version == U2F_V2_VERSION_STR {
            let data = serde_json::to_string(&BrowserData::enroll(
                &challenge.challenge,
                &sender.origin,
                sender.tls_channel_id.as_deref(),
            ))?;
            let hash = websafe_sha256(data.as_bytes());
            browser_data.insert(version.to_string(), data.into_bytes());
            hash
        } else {
            challenge.challenge.clone()
        };

        encoded.push(HelperEnrollChallenge {
            version: version.to_string(),
            challenge_hash,
            app_id_hash: websafe_sha256(challenge_app_id.as_bytes()),
        });
    }

    Ok((encoded, browser_data))
}

fn encode_sign_challenges(challenges: &[SignChallenge], app_id: Option<&str>) -> Result<Vec<HelperSignChallenge>, Error> {
    challenges
        .iter()
        .map(|challenge| {
            let challenge_app_id = challenge
                .app_id
                .as_deref()
                .or(app_id)
                .ok_or_else(|| Error::Validation("Sign challenge without app id".to_string()))?;

            if challenge.key_handle.is_empty() {
                return Err(Error::Validation("Sign challenge without key handle".to_string()));
            }

            Ok(HelperSignChallenge {
                version: challenge.version().to_string(),
                challenge_hash: challenge.challenge.clone().unwrap_or_default(),
                app_id_hash: websafe_sha256(challenge_app_id.as_bytes()),
                key_handle: challenge.key_handle.clone(),
            })
        })
        .collect()
}

/// Request and per-challenge app ids, deduplicated in first-seen order.
fn collect_app_ids(app_id: Option<&str>, enroll_challenges: &[EnrollChallenge], sign_challenges: &[SignChallenge]) -> Vec<String> {
    let mut app_ids: Vec<String> = Vec::new();

    let referenced = app_id
        .into_iter()
        .chain(enroll_challenges.iter().filter_map(|c| c.app_id.as_deref()))
        .chain(sign_challenges.iter().filter_map(|c| c.app_id.as_deref()));

    for id in referenced {
        if !app_ids.iter().any(|known| known == id) {
            app_ids.push(id.to_string());
        }
    }

    app_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base64::BASE64;
    use crate::u2f::{
        attestation::{encode_certificate, extract_transport},
        proto::der::encode_ecdsa_signature,
    };
    use async_trait::async_trait;
    use base64::Engine as _;
    use std::{cell::Cell, time::Duration};
    use x509_parser::prelude::*;

    const ORIGIN: &str = "https://example.com";
    const APP_ID: &str = "https://example.com";

    #[derive(Clone, Copy)]
    enum Approval {
        Yes,
        No,
        Never,
    }

    struct Tab(Option<TabId>);

    #[async_trait(?Send)]
    impl TabResolver for Tab {
        async fn resolve_tab_id(&self, _sender: &Sender) -> Option<TabId> {
            self.0
        }
    }

    struct Approvals(Approval);

    #[async_trait(?Send)]
    impl OriginApprovalStore for Approvals {
        async fn is_approved(&self, _origin: &str, _tab_id: TabId) -> bool {
            match self.0 {
                Approval::Yes => true,
                Approval::No => false,
                Approval::Never => std::future::pending().await,
            }
        }
    }

    struct Claims(bool);

    #[async_trait(?Send)]
    impl OriginChecker for Claims {
        async fn can_claim_app_ids(&self, _origin: &str, _app_ids: &[String]) -> bool {
            self.0
        }
    }

    struct Policies {
        allow: bool,
        seen: RefCell<Vec<(Vec<String>, bool)>>,
    }

    #[async_trait(?Send)]
    impl AppIdChecker for Policies {
        async fn check_app_ids(&self, _timer: Countdown, _origin: &str, app_ids: &[String], allow_http: bool, _log_msg_url: Option<&str>) -> bool {
            self.seen.borrow_mut().push((app_ids.to_vec(), allow_http));
            self.allow
        }
    }

    struct Helper {
        reply: HelperReply,
        closed: Cell<usize>,
    }

    #[async_trait(?Send)]
    impl HelperHandle for Helper {
        async fn run(&self) -> HelperReply {
            self.reply.clone()
        }

        fn close(&self) {
            self.closed.set(self.closed.get() + 1);
        }
    }

    struct Helpers {
        reply: HelperReply,
        requests: RefCell<Vec<HelperRequest>>,
        handles: RefCell<Vec<Rc<Helper>>>,
    }

    impl HelperFactory for Helpers {
        fn get_handler(&self, request: &HelperRequest) -> Option<Rc<dyn HelperHandle>> {
            self.requests.borrow_mut().push(request.clone());
            let handle = Rc::new(Helper {
                reply: self.reply.clone(),
                closed: Cell::new(0),
            });
            self.handles.borrow_mut().push(handle.clone());
            Some(handle)
        }
    }

    #[derive(Default)]
    struct Delivered {
        successes: RefCell<Vec<U2fRegisterResponse>>,
        errors: RefCell<Vec<ClientError>>,
    }

    struct Setup {
        tab: Option<TabId>,
        approval: Approval,
        claims: bool,
        policies: bool,
        reply: HelperReply,
        config: EnrollerConfig,
    }

    impl Default for Setup {
        fn default() -> Self {
            Setup {
                tab: Some(7),
                approval: Approval::Yes,
                claims: true,
                policies: true,
                reply: reply(None, U2F_V2_VERSION_STR, "registration"),
                config: EnrollerConfig::default(),
            }
        }
    }

    struct Harness {
        enroller: Enroller,
        helpers: Rc<Helpers>,
        policies: Rc<Policies>,
        remote_log: Rc<LogRateLimiter>,
        delivered: Rc<Delivered>,
    }

    impl Harness {
        fn new(setup: Setup) -> Self {
            let helpers = Rc::new(Helpers {
                reply: setup.reply,
                requests: RefCell::new(Vec::new()),
                handles: RefCell::new(Vec::new()),
            });
            let policies = Rc::new(Policies {
                allow: setup.policies,
                seen: RefCell::new(Vec::new()),
            });
            let remote_log = Rc::new(LogRateLimiter::new(1, setup.config.remote_log_window()));
            let delivered = Rc::new(Delivered::default());

            let deps = EnrollerDeps {
                tab_resolver: Rc::new(Tab(setup.tab)),
                approved_origins: Rc::new(Approvals(setup.approval)),
                origin_checker: Rc::new(Claims(setup.claims)),
                app_id_checker: policies.clone(),
                helpers: helpers.clone(),
                remote_log: remote_log.clone(),
            };

            let on_success = {
                let delivered = delivered.clone();
                move |response: U2fRegisterResponse| delivered.successes.borrow_mut().push(response)
            };
            let on_error = {
                let delivered = delivered.clone();
                move |error: ClientError| delivered.errors.borrow_mut().push(error)
            };

            Harness {
                enroller: Enroller::new(Sender::new(ORIGIN), setup.config, deps, on_success, on_error),
                helpers,
                policies,
                remote_log,
                delivered,
            }
        }

        async fn enroll(&self, challenge: EnrollChallenge) {
            self.enroller.do_enroll(vec![challenge], Vec::new(), Some(APP_ID.to_string())).await;
        }

        fn errors(&self) -> Vec<ErrorCode> {
            self.delivered.errors.borrow().iter().map(|e| e.error_code).collect()
        }
    }

    fn reply(code: Option<i32>, version: &str, enroll_data: &str) -> HelperReply {
        HelperReply {
            code,
            version: version.to_string(),
            enroll_data: enroll_data.to_string(),
        }
    }

    fn v2_challenge() -> EnrollChallenge {
        EnrollChallenge {
            version: Some(U2F_V2_VERSION_STR.to_string()),
            challenge: "AAAA".to_string(),
            app_id: None,
        }
    }

    fn browser_data_json() -> String {
        serde_json::to_string(&BrowserData::enroll("AAAA", ORIGIN, None)).unwrap()
    }

    fn device_registration() -> Vec<u8> {
        let mut point = [0x22u8; U2F_EC_POINT_SIZE];
        point[0] = U2F_POINT_UNCOMPRESSED;

        let mut data = vec![U2F_REGISTER_ID];
        data.extend_from_slice(&point);
        data.push(4);
        data.extend_from_slice(b"kh01");
        data.extend_from_slice(&encode_certificate(&[0x42], &point, Some(&[0x05, 0x20])).unwrap());
        data.extend_from_slice(&encode_ecdsa_signature(&[0x01; 32], &[0x02; 32]).unwrap());
        data
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_request_and_response() {
        let h = Harness::new(Setup::default());
        h.enroll(v2_challenge()).await;

        let json = browser_data_json();
        let requests = h.helpers.requests.borrow();
        assert_eq!(requests.len(), 1);

        let request = &requests[0];
        assert_eq!(request.req_type, HelperRequestType::Enroll);
        assert_eq!(request.timeout_seconds, Some(29.0));
        assert_eq!(request.enroll_challenges.len(), 1);
        assert_eq!(request.enroll_challenges[0].version, U2F_V2_VERSION_STR);
        assert_eq!(request.enroll_challenges[0].challenge_hash, BASE64_URLSAFE_NOPAD.encode(Sha256::digest(json.as_bytes())));
        assert_eq!(request.enroll_challenges[0].app_id_hash, BASE64_URLSAFE_NOPAD.encode(Sha256::digest(APP_ID.as_bytes())));

        let successes = h.delivered.successes.borrow();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].version, U2F_V2_VERSION_STR);
        assert_eq!(successes[0].registration_data, "registration");
        assert_eq!(successes[0].client_data, Some(BASE64_URLSAFE_NOPAD.encode(json.as_bytes())));

        assert!(h.errors().is_empty());
        assert_eq!(h.enroller.state(), EnrollerState::Done(Outcome::Success));
        assert_eq!(h.enroller.sender().tab_id, Some(7));
        assert_eq!(h.policies.seen.borrow().as_slice(), &[(vec![APP_ID.to_string()], false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_challenge_passes_through() {
        let h = Harness::new(Setup {
            reply: reply(Some(0), U2F_V1_VERSION_STR, "legacy"),
            ..Setup::default()
        });

        h.enroll(EnrollChallenge {
            version: None,
            challenge: "bGVnYWN5LWNoYWxsZW5nZQ".to_string(),
            app_id: None,
        })
        .await;

        let request = h.helpers.requests.borrow()[0].clone();
        assert_eq!(request.enroll_challenges[0].version, U2F_V1_VERSION_STR);
        assert_eq!(request.enroll_challenges[0].challenge_hash, "bGVnYWN5LWNoYWxsZW5nZQ");

        let successes = h.delivered.successes.borrow();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].client_data, None);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_challenges_join_the_app_id_check() {
        let h = Harness::new(Setup::default());

        let sign = SignChallenge {
            version: Some(U2F_V2_VERSION_STR.to_string()),
            challenge: None,
            key_handle: "a2g".to_string(),
            app_id: Some("https://other.example.com".to_string()),
        };
        let enroll = EnrollChallenge {
            app_id: Some(APP_ID.to_string()),
            ..v2_challenge()
        };
        h.enroller.do_enroll(vec![enroll], vec![sign], Some(APP_ID.to_string())).await;

        let request = h.helpers.requests.borrow()[0].clone();
        assert_eq!(request.sign_data.len(), 1);
        assert_eq!(request.sign_data[0].challenge_hash, "");
        assert_eq!(request.sign_data[0].key_handle, "a2g");

        let seen = h.policies.seen.borrow();
        assert_eq!(seen[0].0, vec![APP_ID.to_string(), "https://other.example.com".to_string()]);
        assert_eq!(h.delivered.successes.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unapproved_origin_times_out_silently() {
        let h = Harness::new(Setup {
            approval: Approval::No,
            ..Setup::default()
        });
        let start = Instant::now();

        h.enroll(v2_challenge()).await;

        assert_eq!(h.errors(), vec![ErrorCode::Timeout]);
        assert_eq!(Instant::now() - start, Duration::from_secs(29));
        assert!(h.helpers.requests.borrow().is_empty());
        assert!(h.delivered.successes.borrow().is_empty());
        assert_eq!(h.enroller.state(), EnrollerState::Done(Outcome::Error(ErrorCode::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fires_when_a_step_hangs() {
        let h = Harness::new(Setup {
            approval: Approval::Never,
            ..Setup::default()
        });
        let start = Instant::now();

        h.enroll(v2_challenge()).await;

        assert_eq!(h.errors(), vec![ErrorCode::Timeout]);
        assert_eq!(Instant::now() - start, Duration::from_millis(29_500));
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_tab_is_a_bad_request() {
        let h = Harness::new(Setup {
            tab: None,
            ..Setup::default()
        });
        h.enroll(v2_challenge()).await;

        assert_eq!(h.errors(), vec![ErrorCode::BadRequest]);
        assert!(h.helpers.requests.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimable_app_id_is_a_bad_request() {
        let h = Harness::new(Setup {
            claims: false,
            ..Setup::default()
        });
        h.enroll(v2_challenge()).await;

        assert_eq!(h.errors(), vec![ErrorCode::BadRequest]);
        assert!(h.policies.seen.borrow().is_empty());
        assert!(h.helpers.requests.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_app_id_policy_is_a_bad_request() {
        let h = Harness::new(Setup {
            policies: false,
            ..Setup::default()
        });
        h.enroll(v2_challenge()).await;

        assert_eq!(h.errors(), vec![ErrorCode::BadRequest]);
        assert!(h.helpers.requests.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_app_id_is_a_bad_request() {
        let h = Harness::new(Setup::default());
        h.enroller.do_enroll(vec![v2_challenge()], Vec::new(), None).await;

        assert_eq!(h.errors(), vec![ErrorCode::BadRequest]);
        assert!(h.delivered.errors.borrow()[0].error_message.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn device_status_codes_map_to_client_errors() {
        let cases = [
            (DEVICE_WRONG_DATA_STATUS, ErrorCode::DeviceIneligible),
            (DEVICE_WAIT_TOUCH_STATUS, ErrorCode::Timeout),
            (DEVICE_TIMEOUT_STATUS, ErrorCode::Timeout),
            (0x6984, ErrorCode::OtherError),
        ];

        for (code, expected) in cases {
            let h = Harness::new(Setup {
                reply: reply(Some(code), "", ""),
                ..Setup::default()
            });
            h.enroll(v2_challenge()).await;

            assert_eq!(h.errors(), vec![expected], "status {:#x}", code);
            assert_eq!(h.helpers.handles.borrow()[0].closed.get(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unmapped_status_uses_the_remote_log_budget() {
        let h = Harness::new(Setup {
            reply: reply(Some(-6), "", ""),
            ..Setup::default()
        });
        h.enroll(v2_challenge()).await;

        assert_eq!(h.errors(), vec![ErrorCode::OtherError]);
        assert!(!h.remote_log.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_first_reply_is_delivered() {
        let h = Harness::new(Setup::default());
        h.enroll(v2_challenge()).await;

        h.enroller.helper_complete(reply(None, U2F_V2_VERSION_STR, "again"));
        h.enroller.helper_complete(reply(Some(DEVICE_WRONG_DATA_STATUS), "", ""));

        assert_eq!(h.delivered.successes.borrow().len(), 1);
        assert!(h.errors().is_empty());
        assert_eq!(h.helpers.requests.borrow().len(), 1);
        assert_eq!(h.helpers.handles.borrow()[0].closed.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_timeout_arms_clamped_timers() {
        let h = Harness::new(Setup {
            approval: Approval::No,
            config: EnrollerConfig {
                timeout_seconds: 1e30,
                ..EnrollerConfig::default()
            },
            ..Setup::default()
        });
        let start = Instant::now();

        h.enroll(v2_challenge()).await;

        assert_eq!(h.errors(), vec![ErrorCode::Timeout]);
        assert_eq!(Instant::now() - start, config::MAX_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn second_enroll_is_ignored() {
        let h = Harness::new(Setup::default());
        h.enroll(v2_challenge()).await;
        h.enroll(v2_challenge()).await;

        assert_eq!(h.helpers.requests.borrow().len(), 1);
        assert_eq!(h.delivered.successes.borrow().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_suppresses_callbacks() {
        let h = Harness::new(Setup {
            approval: Approval::No,
            ..Setup::default()
        });

        let closer = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            h.enroller.close();
        };
        tokio::join!(h.enroll(v2_challenge()), closer);

        assert!(h.errors().is_empty());
        assert!(h.delivered.successes.borrow().is_empty());
        assert_eq!(h.enroller.state(), EnrollerState::Done(Outcome::Closed));

        h.enroller.helper_complete(reply(None, U2F_V2_VERSION_STR, "late"));
        assert!(h.delivered.successes.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn anonymized_conveyance_replaces_attestation() {
        let original = device_registration();
        let h = Harness::new(Setup {
            reply: reply(None, U2F_V2_VERSION_STR, &BASE64.encode(&original)),
            config: EnrollerConfig {
                conveyance: ConveyancePreference::Anonymized,
                ..EnrollerConfig::default()
            },
            ..Setup::default()
        });
        h.enroll(v2_challenge()).await;

        let successes = h.delivered.successes.borrow();
        assert_eq!(successes.len(), 1);

        let json = browser_data_json();
        let device = Registration::parse(&original, APP_ID, ChallengeParameter::ClientData(json.as_bytes())).unwrap();
        let replaced = Registration::from_base64(&successes[0].registration_data, APP_ID, ChallengeParameter::ClientData(json.as_bytes())).unwrap();

        assert_eq!(replaced.key_handle(), device.key_handle());
        assert_eq!(replaced.user_public_key(), device.user_public_key());
        assert_ne!(replaced.certificate(), device.certificate());
        assert_eq!(extract_transport(replaced.certificate()).unwrap(), Some(vec![0x05, 0x20]));

        let (_, cert) = X509Certificate::from_der(replaced.certificate()).unwrap();
        replaced.verify_signature_with(cert.public_key().subject_public_key.data.as_ref()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_registration_fails_anonymization() {
        let h = Harness::new(Setup {
            reply: reply(None, U2F_V2_VERSION_STR, "AAAA"),
            config: EnrollerConfig {
                conveyance: ConveyancePreference::Anonymized,
                ..EnrollerConfig::default()
            },
            ..Setup::default()
        });
        h.enroll(v2_challenge()).await;

        assert_eq!(h.errors(), vec![ErrorCode::OtherError]);
        assert!(h.delivered.successes.borrow().is_empty());
    }
}
