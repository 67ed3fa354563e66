use std::fmt;

/// Authenticated session handle.
///
/// Authentication and session validation happen upstream; the dispatcher
/// only needs the identity to log, record and attach to jobs.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    session_id: String,
    user_id: i32,
    context_id: i32,
}

impl Session {
    pub fn new(session_id: impl Into<String>, user_id: i32, context_id: i32) -> Self {
        Self {
            session_id: session_id.into(),
            user_id,
            context_id,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn user_id(&self) -> i32 {
        self.user_id
    }

    #[must_use]
    pub fn context_id(&self) -> i32 {
        self.context_id
    }
}

// The session id is a bearer secret; keep it out of Debug output.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("context_id", &self.context_id)
            .finish_non_exhaustive()
    }
}

/// Decides whether a user may define trust levels for remote certificates.
///
/// Consulted when a TLS failure surfaces from a handler: users allowed to
/// configure trust get a dedicated, actionable error instead of a generic one.
pub trait TrustConfiguration: Send + Sync {
    fn may_define_trust_level(&self, session: &Session) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_session_id() {
        let session = Session::new("secret-session-id", 3, 1);
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret-session-id"));
        assert!(rendered.contains("user_id: 3"));
    }
}
