//! Content rewriting between the public and the local identity
//!
//! Requests travel from `http://[local]` towards `https://public`, responses
//! the other way. Every substitution is a literal, case-sensitive substring
//! replacement: HTML, CSS and JS are never parsed.

use crate::error::ConfigError;
use crate::identity::Identity;
use bytes::Bytes;
use hyper::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_SECURITY_POLICY, LOCATION, REFERER, REFRESH,
    SET_COOKIE, STRICT_TRANSPORT_SECURITY,
};
use hyper::HeaderMap;
use regex::bytes::{NoExpand, Regex};
use std::net::SocketAddr;
use tracing::warn;

pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_ORIGINAL_REFERER: HeaderName = HeaderName::from_static("x-original-referer");

/// How the outbound `Referer` header is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefererPolicy {
    /// Rewrite a `Referer` that starts with the local origin back to the
    /// public origin; leave anything else alone.
    #[default]
    Guarded,
    /// Always send `https://<public host>/` and echo the client's value in
    /// `X-Original-Referer`.
    Overwrite,
}

/// Knobs that are not part of the identity itself.
#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    pub referer_policy: RefererPolicy,
    /// Extra origins (e.g. `https://yunohost.local`) treated like the public
    /// origin in `Location` headers.
    pub location_aliases: Vec<String>,
}

/// Header and body transforms parameterized by one identity pair.
#[derive(Debug, Clone)]
pub struct Rewriter {
    public_host: String,
    public_origin: String,
    local_address: String,
    local_origin: String,
    options: RewriteOptions,
    body_pattern: Regex,
}

impl Rewriter {
    pub fn new(identity: &Identity, mut options: RewriteOptions) -> Result<Self, ConfigError> {
        // An empty alias would prefix-match (and rewrite) every Location.
        options.location_aliases = options
            .location_aliases
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        let public_origin = identity.public_origin();
        let body_pattern = Regex::new(&regex::escape(&public_origin))?;

        Ok(Self {
            public_host: identity.public_host().to_string(),
            public_origin,
            local_address: identity.local_address().to_string(),
            local_origin: identity.local_origin(),
            options,
            body_pattern,
        })
    }

    pub fn public_origin(&self) -> &str {
        &self.public_origin
    }

    pub fn local_origin(&self) -> &str {
        &self.local_origin
    }

    /// Headers to send to the backend for a request from `peer`.
    pub fn outbound_headers(&self, headers: &HeaderMap, peer: SocketAddr) -> HeaderMap {
        let mut modified = headers.clone();

        let peer = peer.to_string();
        set_str(&mut modified, X_REAL_IP, &peer);
        set_str(&mut modified, X_FORWARDED_FOR, &peer);

        // Literal rewriting only works on identity-encoded bodies.
        modified.remove(ACCEPT_ENCODING);

        match self.options.referer_policy {
            RefererPolicy::Guarded => {
                if let Some(referer) = header_str(&modified, &REFERER) {
                    if referer.starts_with(&self.local_origin) {
                        let rewritten = referer.replace(&self.local_origin, &self.public_origin);
                        set_str(&mut modified, REFERER, &rewritten);
                    }
                }
            }
            RefererPolicy::Overwrite => {
                let original = header_str(&modified, &REFERER).unwrap_or_default();
                set_str(&mut modified, X_ORIGINAL_REFERER, &original);
                set_str(&mut modified, REFERER, &format!("{}/", self.public_origin));
            }
        }

        modified
    }

    /// Headers to return to the client for a backend response.
    pub fn inbound_headers(&self, headers: &HeaderMap) -> HeaderMap {
        let mut modified = headers.clone();

        modified.remove(CONTENT_SECURITY_POLICY);
        modified.remove(STRICT_TRANSPORT_SECURITY);

        if let Some(location) = header_str(&modified, &LOCATION) {
            if location.starts_with(&self.public_origin)
                || self.options.location_aliases.iter().any(|a| location.starts_with(a.as_str()))
            {
                let mut rewritten = location.replace(&self.public_origin, &self.local_origin);
                for alias in &self.options.location_aliases {
                    rewritten = rewritten.replace(alias.as_str(), &self.local_origin);
                }
                set_str(&mut modified, LOCATION, &rewritten);
            }
        }

        if let Some(refresh) = header_str(&modified, &REFRESH) {
            let rewritten = refresh.replace(&self.public_origin, &self.local_origin);
            set_str(&mut modified, REFRESH, &rewritten);
        }

        let cookies: Vec<HeaderValue> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| match value.to_str() {
                Ok(cookie) => HeaderValue::from_str(&self.rewrite_cookie(cookie)).unwrap_or_else(|_| value.clone()),
                Err(_) => value.clone(),
            })
            .collect();
        if !cookies.is_empty() {
            modified.remove(SET_COOKIE);
            for cookie in cookies {
                modified.append(SET_COOKIE, cookie);
            }
        }

        modified
    }

    /// Rebind a `Set-Cookie` value to the local address and drop `Secure`.
    ///
    /// Other attributes are kept in their original order; `Domain` is
    /// replaced in place or appended when the cookie had none.
    pub fn rewrite_cookie(&self, set_cookie: &str) -> String {
        let mut parts = set_cookie.split(';');
        let pair = parts.next().unwrap_or_default().trim();

        let mut attributes = Vec::new();
        let mut has_domain = false;
        for attr in parts.map(str::trim).filter(|a| !a.is_empty()) {
            let name = attr.split('=').next().unwrap_or_default().trim();
            if name.eq_ignore_ascii_case("secure") {
                continue;
            }
            if name.eq_ignore_ascii_case("domain") {
                if !has_domain {
                    attributes.push(format!("Domain={}", self.local_address));
                    has_domain = true;
                }
                continue;
            }
            attributes.push(attr.to_string());
        }
        if !has_domain {
            attributes.push(format!("Domain={}", self.local_address));
        }

        let mut out = pair.to_string();
        for attr in attributes {
            out.push_str("; ");
            out.push_str(&attr);
        }
        out
    }

    /// Replace every public origin in `body` with the local origin.
    pub fn body(&self, body: &[u8]) -> Bytes {
        Bytes::from(
            self.body_pattern
                .replace_all(body, NoExpand(self.local_origin.as_bytes()))
                .into_owned(),
        )
    }

    /// Host header value sent to the backend.
    pub fn public_host(&self) -> &str {
        &self.public_host
    }
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn set_str(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(e) => warn!("Dropping unrepresentable {} value {:?}: {}", name, value, e),
    }
}
