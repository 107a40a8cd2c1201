mod auth;
mod classify;
mod config;
mod dial;
mod error;
mod forward;
mod handoff;
mod parse;
mod server;
mod tunnel;
mod util;


pub use {
    auth::{AcceptAll, AuthCallback, AuthDecision, AuthGate, AuthHandler, Decide, Denial, DenyAll},
    classify::{
        ForwardTarget, RequestKind, classify, connect_target, ensure_not_self, forward_target,
    },
    config::{
        DEFAULT_AUTH_TIMEOUT, DEFAULT_DRAIN_TIMEOUT, DEFAULT_HANDOFF_HIGH_WATER, ProxyConfig,
    },
    dial::{DEFAULT_CONNECT_TIMEOUT, Dialer, TcpDialer},
    error::ProxyError,
    forward::ForwardRelay,
    handoff::{Attached, Flow, HandoffBuffer},
    parse::{
        Authority, CONNECT_ESTABLISHED, HEADER_SECTION_MAX_LENGTH, Headers, HttpRequest,
        HttpResponse,
    },
    server::ProxyServer,
    tunnel::{Tunnel, TunnelManager, TunnelState},
    util::Prebuffered,
};
