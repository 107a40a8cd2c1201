use std::{sync::Arc, time::Duration};

use crate::{
    auth::{AuthHandler, DynAuthHandler},
    parse::HEADER_SECTION_MAX_LENGTH,
};

/// Default upper bound on an authentication hook decision.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default amount of client bytes queued before reading from the socket is paused.
pub const DEFAULT_HANDOFF_HIGH_WATER: usize = 64 * 1024;

/// Default time a half-closed tunnel may keep relaying the other direction.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of a proxy instance.
///
/// Built once and handed to [`crate::ProxyServer`]; a running server never
/// mutates it. To change the authentication hook, build a new config.
#[derive(derive_more::Debug, Clone)]
pub struct ProxyConfig {
    #[debug("{:?}", auth.as_ref().map(|_| "DynAuthHandler"))]
    pub(crate) auth: Option<Arc<DynAuthHandler<'static>>>,
    /// Maximum time the authentication hook may take to decide.
    pub auth_timeout: Duration,
    /// Maximum size of a request or response head.
    pub header_section_max_length: usize,
    /// Queued client bytes at which the handoff buffer stops reading from the socket.
    pub handoff_high_water: usize,
    /// How long a tunnel keeps relaying after one side closed, before both are dropped.
    pub drain_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            auth: None,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            header_section_max_length: HEADER_SECTION_MAX_LENGTH,
            handoff_high_water: DEFAULT_HANDOFF_HIGH_WATER,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    /// Sets the authentication hook run before every request and tunnel.
    pub fn auth(mut self, handler: impl AuthHandler + 'static) -> Self {
        self.auth = Some(DynAuthHandler::new_arc(handler));
        self
    }

    /// Removes the authentication hook; every request is allowed.
    pub fn without_auth(mut self) -> Self {
        self.auth = None;
        self
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }

    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn header_section_max_length(mut self, len: usize) -> Self {
        self.header_section_max_length = len;
        self
    }

    /// Sets the pause threshold of the client handoff buffer.
    ///
    /// Values below the header section limit are raised to it, so that a
    /// full request head always fits.
    pub fn handoff_high_water(mut self, len: usize) -> Self {
        self.handoff_high_water = len;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub(crate) fn effective_high_water(&self) -> usize {
        self.handoff_high_water.max(self.header_section_max_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DenyAll;

    #[test]
    fn builder_sets_and_clears_auth() {
        let config = ProxyConfig::default().auth(DenyAll);
        assert!(config.has_auth());
        assert!(format!("{config:?}").contains("DynAuthHandler"));
        let config = config.without_auth();
        assert!(!config.has_auth());
    }

    #[test]
    fn high_water_never_below_header_limit() {
        let config = ProxyConfig::default()
            .header_section_max_length(4096)
            .handoff_high_water(16);
        assert_eq!(config.effective_high_water(), 4096);
    }
}
