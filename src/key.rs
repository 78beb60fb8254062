//! Subject key derivation.
//!
//! A [`KeyStrategy`] maps the [`AdmissionContext`] of an inbound operation to the subject key
//! a decision is attributed to. Each strategy owns a namespace prefix (`ip:`, `user:`,
//! `api:`), so keys produced by different strategies never collide.

use crate::decision::Decision;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// Subject used when no strategy can identify the caller.
pub const ANONYMOUS: &str = "anonymous";

/// What the admission middleware needs to know about a request.
///
/// Implement this for your framework's request type; [`RequestInfo`] is a plain-data
/// implementation for tests and custom transports.
pub trait AdmissionContext {
    /// Address of the directly connected peer.
    fn peer_addr(&self) -> Option<IpAddr>;

    /// Raw `X-Forwarded-For` style chain, client first.
    fn forwarded_for(&self) -> Option<&str> {
        None
    }

    /// Authenticated identity, if any.
    fn identity(&self) -> Option<&str> {
        None
    }

    fn has_role(&self, _role: &str) -> bool {
        false
    }

    /// Presented credential by header name. Lookups are case-insensitive.
    fn credential(&self, _name: &str) -> Option<&str> {
        None
    }

    /// Called with the decision before an admitted request is forwarded.
    fn annotate(&mut self, _decision: &Decision) {}
}

/// How the subject key is derived from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Network address. With `trust_forwarded`, the first valid address of the forwarded-for
    /// chain wins over the peer address; only enable behind a proxy that sets the header.
    ByAddress { trust_forwarded: bool },
    /// Authenticated identity.
    ByIdentity,
    /// Credential presented under `header` (for example an API key).
    ByCredential { header: String },
}

impl Default for KeyStrategy {
    fn default() -> Self {
        Self::address()
    }
}

impl KeyStrategy {
    pub const ADDRESS_PREFIX: &'static str = "ip:";
    pub const IDENTITY_PREFIX: &'static str = "user:";
    pub const CREDENTIAL_PREFIX: &'static str = "api:";

    /// Peer address only.
    pub fn address() -> Self {
        Self::ByAddress { trust_forwarded: false }
    }

    /// Forwarded-for chain first, then peer address.
    pub fn forwarded_address() -> Self {
        Self::ByAddress { trust_forwarded: true }
    }

    pub fn identity() -> Self {
        Self::ByIdentity
    }

    pub fn credential(header: impl Into<String>) -> Self {
        Self::ByCredential { header: header.into() }
    }

    /// Key produced by this strategy alone, if it can identify the caller.
    pub fn derive<R>(&self, req: &R) -> Option<String>
    where
        R: AdmissionContext + ?Sized,
    {
        match self {
            Self::ByAddress { trust_forwarded } => address_of(req, *trust_forwarded)
                .map(|addr| format!("{}{}", Self::ADDRESS_PREFIX, addr)),
            Self::ByIdentity => non_empty(req.identity())
                .map(|id| format!("{}{}", Self::IDENTITY_PREFIX, id)),
            Self::ByCredential { header } => non_empty(req.credential(header))
                .map(|cred| format!("{}{}", Self::CREDENTIAL_PREFIX, cred)),
        }
    }

    /// Key for `req`, falling back to the address strategy and finally to [`ANONYMOUS`].
    pub fn subject_key<R>(&self, req: &R) -> String
    where
        R: AdmissionContext + ?Sized,
    {
        if let Some(key) = self.derive(req) {
            return key;
        }
        let trust_forwarded = matches!(self, Self::ByAddress { trust_forwarded: true });
        Self::ByAddress { trust_forwarded }
            .derive(req)
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByAddress { trust_forwarded: false } => f.write_str("address"),
            Self::ByAddress { trust_forwarded: true } => f.write_str("forwarded_address"),
            Self::ByIdentity => f.write_str("identity"),
            Self::ByCredential { header } => write!(f, "credential({})", header),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn address_of<R>(req: &R, trust_forwarded: bool) -> Option<IpAddr>
where
    R: AdmissionContext + ?Sized,
{
    if trust_forwarded {
        let forwarded = req
            .forwarded_for()
            .and_then(|chain| chain.split(',').find_map(|hop| hop.trim().parse::<IpAddr>().ok()));
        if forwarded.is_some() {
            return forwarded;
        }
    }
    req.peer_addr()
}

/// Plain-data [`AdmissionContext`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestInfo {
    pub peer_addr: Option<IpAddr>,
    pub forwarded_for: Option<String>,
    pub identity: Option<String>,
    pub roles: Vec<String>,
    /// Credentials keyed by lower-cased header name.
    pub credentials: HashMap<String, String>,
    pub route: Option<String>,
    /// Set by [`AdmissionContext::annotate`] when the request is admitted.
    pub decision: Option<Decision>,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }

    #[must_use]
    pub fn with_identity(mut self, id: impl Into<String>) -> Self {
        self.identity = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    #[must_use]
    pub fn with_credential(mut self, name: &str, value: impl Into<String>) -> Self {
        self.credentials.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Remaining quota recorded by the middleware, if the request was admitted.
    pub fn remaining(&self) -> Option<u32> {
        self.decision.map(|d| d.remaining)
    }
}

impl AdmissionContext for RequestInfo {
    fn peer_addr(&self) -> Option<IpAddr> {
        self.peer_addr
    }

    fn forwarded_for(&self) -> Option<&str> {
        self.forwarded_for.as_deref()
    }

    fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    fn credential(&self, name: &str) -> Option<&str> {
        self.credentials.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn annotate(&mut self, decision: &Decision) {
        self.decision = Some(*decision);
    }
}
