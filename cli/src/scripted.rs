use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use authsync::runtime::sleep;
use authsync::{
    Clock, ConnectionValidationResult, Credentials, RemoteAuth, RemoteError, Session, SignInOptions, SignInResponse,
    SignOutOptions, User,
};

/// Offline stand-in for the auth service. Every call succeeds after an
/// optional delay unless told to fail.
pub struct ScriptedRemote {
    clock: Rc<dyn Clock>,
    pub delay: Duration,
    pub refresh_delay: Duration,
    pub session_ttl: Duration,
    pub fail_sign_out: bool,
    pub fail_validation: bool,
    issued: Cell<u32>,
    calls: Cell<u32>,
    owners: RefCell<HashMap<String, String>>,
}

impl ScriptedRemote {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            delay: Duration::ZERO,
            refresh_delay: Duration::ZERO,
            session_ttl: Duration::from_secs(3600),
            fail_sign_out: false,
            fail_validation: false,
            issued: Cell::new(0),
            calls: Cell::new(0),
            owners: RefCell::new(HashMap::new()),
        }
    }

    /// Total remote calls served.
    pub fn calls(&self) -> u32 {
        self.calls.get()
    }

    fn session_for(&self, user_id: &str) -> Session {
        let n = self.issued.get() + 1;
        self.issued.set(n);
        let now = self.clock.now_ms();
        let id = format!("sess-{n}");
        self.owners.borrow_mut().insert(id.clone(), user_id.to_owned());
        Session {
            id,
            user_id: user_id.to_owned(),
            expires_at: now + i64::try_from(self.session_ttl.as_millis()).unwrap_or(i64::MAX / 2),
            is_active: true,
            created_at: Some(now),
            last_active_at: Some(now),
            user_agent: Some("authsync-cli".to_owned()),
            ip_address: None,
        }
    }

    async fn enter(&self, delay: Duration) {
        self.calls.set(self.calls.get() + 1);
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

#[async_trait(?Send)]
impl RemoteAuth for ScriptedRemote {
    async fn sign_in(&self, provider: Option<&str>, options: &SignInOptions) -> Result<SignInResponse, RemoteError> {
        self.enter(self.delay).await;
        let email = options.email.clone().unwrap_or_else(|| "demo@example.com".to_owned());
        let user_id = format!("user-{}", email.split('@').next().unwrap_or("demo"));
        let user = User {
            id: user_id.clone(),
            email,
            display_name: provider.map(|p| format!("{p} user")),
            profile_image_url: None,
            email_verified: true,
            created_at: self.clock.now_ms(),
            metadata: None,
            updated_at: None,
            last_active_at: None,
            signed_up_at: None,
        };
        Ok(SignInResponse { session: self.session_for(&user_id), user })
    }

    async fn sign_out(&self, _options: &SignOutOptions) -> Result<(), RemoteError> {
        self.enter(self.delay).await;
        if self.fail_sign_out {
            return Err(RemoteError::Network("auth service unreachable".into()));
        }
        Ok(())
    }

    async fn validate(&self, credentials: &Credentials) -> Result<ConnectionValidationResult, RemoteError> {
        self.enter(self.delay).await;
        if self.fail_validation {
            return Err(RemoteError::Network("auth service unreachable".into()));
        }
        let mut result = ConnectionValidationResult::valid();
        if credentials.publishable_key.starts_with("pk_test_") {
            result.warnings.push("using a test publishable key".to_owned());
        }
        Ok(result)
    }

    async fn refresh(&self, session_id: &str) -> Result<Session, RemoteError> {
        self.enter(self.refresh_delay).await;
        let owner = self.owners.borrow().get(session_id).cloned();
        let Some(user_id) = owner else {
            return Err(RemoteError::Rejected { code: "session_not_found".into(), message: format!("unknown session {session_id}") });
        };
        Ok(self.session_for(&user_id))
    }
}
