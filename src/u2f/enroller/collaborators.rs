//! Services the enroller depends on but does not implement.

use std::{cell::RefCell, collections::VecDeque, rc::Rc, time::Duration};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::u2f::{
    enroller::{config::EnrollerConfig, timer::Countdown},
    proto::web_message::{HelperReply, HelperRequest},
};

pub type TabId = i64;

/// Identity of the page asking for an enrollment.
#[derive(Debug, Clone, PartialEq)]
pub struct Sender {
    pub origin: String,
    pub tls_channel_id: Option<String>,
    pub tab_id: Option<TabId>,
}

impl Sender {
    pub fn new(origin: &str) -> Self {
        Sender {
            origin: origin.to_string(),
            tls_channel_id: None,
            tab_id: None,
        }
    }

    /// App ids over plain http are only acceptable from an http origin.
    pub fn allow_http(&self) -> bool {
        self.origin.starts_with("http://")
    }
}

#[async_trait(?Send)]
pub trait TabResolver {
    /// Resolves the tab the sender lives in, `None` when it cannot be determined.
    async fn resolve_tab_id(&self, sender: &Sender) -> Option<TabId>;
}

#[async_trait(?Send)]
pub trait OriginApprovalStore {
    async fn is_approved(&self, origin: &str, tab_id: TabId) -> bool;
}

#[async_trait(?Send)]
pub trait OriginChecker {
    /// Whether `origin` may assert every one of `app_ids`.
    async fn can_claim_app_ids(&self, origin: &str, app_ids: &[String]) -> bool;
}

#[async_trait(?Send)]
pub trait AppIdChecker {
    /// Whether each app id's hosted policy lists `origin`.
    async fn check_app_ids(
        &self,
        timer: Countdown,
        origin: &str,
        app_ids: &[String],
        allow_http: bool,
        log_msg_url: Option<&str>,
    ) -> bool;
}

/// A request in flight to the device helper.
#[async_trait(?Send)]
pub trait HelperHandle {
    async fn run(&self) -> HelperReply;
    fn close(&self);
}

pub trait HelperFactory {
    /// Returns `None` when no helper can serve the request.
    fn get_handler(&self, request: &HelperRequest) -> Option<Rc<dyn HelperHandle>>;
}

/// Sliding-window limit on messages sent to the remote log.
#[derive(Debug)]
pub struct LogRateLimiter {
    limit: usize,
    window: Duration,
    admitted: RefCell<VecDeque<Instant>>,
}

impl LogRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        LogRateLimiter {
            limit,
            window,
            admitted: RefCell::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &EnrollerConfig) -> Self {
        Self::new(config.remote_log_limit, config.remote_log_window())
    }

    /// Records one message and returns whether it may be sent.
    pub fn admit(&self) -> bool {
        let now = Instant::now();
        let mut admitted = self.admitted.borrow_mut();

        while admitted.front().is_some_and(|at| now.duration_since(*at) >= self.window) {
            admitted.pop_front();
        }

        if admitted.len() >= self.limit {
            return false;
        }

        admitted.push_back(now);
        true
    }
}

/// Everything an enroller talks to.
#[derive(Clone)]
pub struct EnrollerDeps {
    pub tab_resolver: Rc<dyn TabResolver>,
    pub approved_origins: Rc<dyn OriginApprovalStore>,
    pub origin_checker: Rc<dyn OriginChecker>,
    pub app_id_checker: Rc<dyn AppIdChecker>,
    pub helpers: Rc<dyn HelperFactory>,
    /// Shared across enrollers so the limit holds process wide.
    pub remote_log: Rc<LogRateLimiter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_window_slides() {
        let limiter = LogRateLimiter::new(2, Duration::from_secs(60));

        assert!(limiter.admit());
        assert!(limiter.admit());
        assert!(!limiter.admit());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!limiter.admit());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_from_config() {
        let limiter = LogRateLimiter::from_config(&EnrollerConfig {
            remote_log_limit: 3,
            ..EnrollerConfig::default()
        });

        assert_eq!((0..5).filter(|_| limiter.admit()).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_limit_from_json() {
        let config = EnrollerConfig::from_json(r#"{"remoteLogLimit": 18446744073709551615}"#).unwrap();
        let limiter = LogRateLimiter::from_config(&config);

        assert!((0..100).all(|_| limiter.admit()));
    }

    #[test]
    fn http_origins_allow_http_app_ids() {
        assert!(Sender::new("http://localhost:8080").allow_http());
        assert!(!Sender::new("https://example.com").allow_http());
    }
}
