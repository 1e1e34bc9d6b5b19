//! Answering authentication challenges.
//!
//! [`Authenticator`] turns a [`Realm`] plus, optionally, a server challenge
//! into an `Authorization` (or `Proxy-Authorization`) value. For Digest it
//! remembers the nonce of each protection space, so later requests can reuse
//! it with an incremented nonce count.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use http::header::{GetAll, HeaderValue};
use http::Method;

use crate::realm::{nc_hex, Algorithm, AuthScheme, DigestInput, Qop, Realm};
use crate::Url;

/// Computes credentials and keeps per-realm Digest state.
///
/// One instance is owned by each `Client` and shared by its requests.
#[derive(Default)]
pub struct Authenticator {
    sessions: Mutex<HashMap<SessionKey, DigestSession>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SessionKey {
    space: String,
    principal: String,
}

struct DigestSession {
    challenge: Challenge,
    cnonce: String,
    nc: u32,
}

/// A parsed Digest challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<Algorithm>,
    pub qop: Option<Qop>,
    pub stale: bool,
}

impl Authenticator {
    pub fn new() -> Authenticator {
        Authenticator::default()
    }

    /// Credentials for a request of `method` to `url`.
    ///
    /// Without a challenge, Basic credentials are produced only for a
    /// preemptive realm, and Digest credentials only for a preemptive realm
    /// that has already learned a nonce from this origin. With a challenge,
    /// credentials are always produced, or the challenge is rejected as
    /// malformed.
    pub fn credentials_for(
        &self,
        realm: &Realm,
        method: &Method,
        url: &Url,
        challenge: Option<&str>,
    ) -> crate::Result<Option<HeaderValue>> {
        self.authorize(realm, &origin_space(url), method, url, b"", challenge)
    }

    pub(crate) fn authorize(
        &self,
        realm: &Realm,
        space: &str,
        method: &Method,
        url: &Url,
        body: &[u8],
        challenge: Option<&str>,
    ) -> crate::Result<Option<HeaderValue>> {
        match realm.scheme() {
            AuthScheme::Basic => {
                if challenge.is_none() && !realm.is_preemptive() {
                    return Ok(None);
                }
                Ok(Some(crate::util::basic_auth(
                    realm.principal(),
                    realm.password(),
                    realm.charset_value(),
                )))
            }
            AuthScheme::Digest => {
                let key = SessionKey {
                    space: space.to_owned(),
                    principal: realm.principal().to_owned(),
                };
                let mut sessions = self
                    .sessions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);

                match challenge {
                    Some(header) => {
                        let challenge = Challenge::parse(header)?;
                        match sessions.get_mut(&key) {
                            Some(session)
                                if !challenge.stale && session.challenge.nonce == challenge.nonce =>
                            {
                                session.challenge = challenge;
                                session.advance();
                            }
                            _ => {
                                log::debug!(
                                    "new digest nonce for {space} (stale: {})",
                                    challenge.stale
                                );
                                sessions.insert(
                                    key.clone(),
                                    DigestSession {
                                        challenge,
                                        cnonce: new_cnonce(),
                                        nc: 1,
                                    },
                                );
                            }
                        }
                    }
                    None => match sessions.get_mut(&key) {
                        Some(session) if realm.is_preemptive() => session.advance(),
                        _ => return Ok(None),
                    },
                }

                let Some(session) = sessions.get(&key) else {
                    return Ok(None);
                };
                let value = digest_header(realm, session, method, url, body);
                let mut header = HeaderValue::from_str(&value).map_err(crate::error::builder)?;
                header.set_sensitive(true);
                Ok(Some(header))
            }
        }
    }

    /// Forget the Digest state learned for `url`'s origin.
    pub fn reset(&self, url: &Url) {
        let space = origin_space(url);
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| key.space != space);
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

pub(crate) fn origin_space(url: &Url) -> String {
    url.origin().ascii_serialization()
}

pub(crate) fn proxy_space(host: &str, port: u16) -> String {
    format!("proxy://{host}:{port}")
}

impl DigestSession {
    /// Count one more request under the current nonce. A spent counter
    /// starts over with a fresh cnonce.
    fn advance(&mut self) {
        match self.nc.checked_add(1) {
            Some(nc) => self.nc = nc,
            None => {
                self.cnonce = new_cnonce();
                self.nc = 1;
            }
        }
    }
}

fn new_cnonce() -> String {
    format!("{:016x}", crate::util::fast_random())
}

fn digest_header(
    realm: &Realm,
    session: &DigestSession,
    method: &Method,
    url: &Url,
    body: &[u8],
) -> String {
    let challenge = &session.challenge;
    let uri = realm.digest_uri(url);
    let response = DigestInput {
        algorithm: challenge.algorithm.unwrap_or(Algorithm::Md5),
        username: realm.principal(),
        realm: &challenge.realm,
        password: realm.password(),
        nonce: &challenge.nonce,
        cnonce: &session.cnonce,
        nc: session.nc,
        qop: challenge.qop,
        method: method.as_str(),
        uri: &uri,
        body,
    }
    .response();

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
        quote_escape(realm.principal()),
        quote_escape(&challenge.realm),
        quote_escape(&challenge.nonce),
        quote_escape(&uri)
    );
    if let Some(algorithm) = challenge.algorithm {
        header.push_str(", algorithm=");
        header.push_str(algorithm.as_str());
    }
    header.push_str(", response=\"");
    header.push_str(&response);
    header.push('"');
    if let Some(ref opaque) = challenge.opaque {
        header.push_str(", opaque=\"");
        header.push_str(&quote_escape(opaque));
        header.push('"');
    }
    if let Some(qop) = challenge.qop {
        header.push_str(", qop=");
        header.push_str(qop.as_str());
        header.push_str(", nc=");
        header.push_str(&nc_hex(session.nc));
        header.push_str(", cnonce=\"");
        header.push_str(&session.cnonce);
        header.push('"');
    }
    header
}

fn quote_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Pick the challenge matching `scheme` among `WWW-Authenticate` (or
/// `Proxy-Authenticate`) values. Schemes match case-insensitively.
pub(crate) fn select_challenge<'a>(
    headers: GetAll<'a, HeaderValue>,
    scheme: AuthScheme,
) -> Option<String> {
    headers
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(split_challenges)
        .find(|c| {
            c.split(|ch: char| ch.is_ascii_whitespace())
                .next()
                .map_or(false, |s| s.eq_ignore_ascii_case(scheme.as_str()))
        })
}

/// Split one header value carrying several challenges, e.g.
/// `Basic realm="a", Digest realm="b", nonce="n"`.
fn split_challenges(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut params = Params::new(value);
    let mut start = None;
    loop {
        let end = params.pos;
        match params.next_item() {
            Some(Item::Scheme) => {
                if let Some(begin) = start {
                    out.push(value[begin..end].trim().to_owned());
                }
                start = Some(params.start);
            }
            Some(Item::Param(..)) | Some(Item::Token68) => {}
            None => break,
        }
    }
    if let Some(begin) = start {
        out.push(value[begin..].trim().to_owned());
    }
    out
}

impl Challenge {
    /// Parse a `Digest` challenge.
    pub fn parse(header: &str) -> crate::Result<Challenge> {
        let mut params = Params::new(header);
        match params.next_item() {
            Some(Item::Scheme) if params.last_token.eq_ignore_ascii_case("digest") => {}
            _ => return Err(malformed("not a Digest challenge")),
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop = None;
        let mut stale = false;

        loop {
            match params.next_item() {
                Some(Item::Param(name, value)) => match name.to_ascii_lowercase().as_str() {
                    "realm" => realm = Some(value),
                    "nonce" => nonce = Some(value),
                    "opaque" => opaque = Some(value),
                    "stale" => stale = value.eq_ignore_ascii_case("true"),
                    "algorithm" => {
                        algorithm = Some(
                            Algorithm::parse(&value)
                                .ok_or_else(|| malformed("unsupported digest algorithm"))?,
                        )
                    }
                    "qop" => qop = Some(select_qop(&value)?),
                    _ => {}
                },
                Some(Item::Token68) => {}
                Some(Item::Scheme) | None => break,
            }
        }
        if params.failed {
            return Err(malformed("unterminated quoted string"));
        }

        Ok(Challenge {
            realm: realm.ok_or_else(|| malformed("missing realm"))?,
            nonce: nonce.ok_or_else(|| malformed("missing nonce"))?,
            opaque,
            algorithm,
            qop,
            stale,
        })
    }
}

/// Prefer `auth`, then `auth-int`.
fn select_qop(options: &str) -> crate::Result<Qop> {
    let mut auth_int = false;
    for option in options.split(',').map(str::trim) {
        if option.eq_ignore_ascii_case("auth") {
            return Ok(Qop::Auth);
        }
        auth_int |= option.eq_ignore_ascii_case("auth-int");
    }
    if auth_int {
        Ok(Qop::AuthInt)
    } else {
        Err(malformed("no supported qop"))
    }
}

fn malformed(msg: &'static str) -> crate::Error {
    crate::error::malformed_challenge(MalformedChallenge(msg))
}

#[derive(Debug)]
struct MalformedChallenge(&'static str);

impl fmt::Display for MalformedChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl StdError for MalformedChallenge {}

enum Item {
    Scheme,
    Param(String, String),
    Token68,
}

/// A small tokenizer for RFC 7235 challenges.
struct Params<'a> {
    src: &'a str,
    pos: usize,
    start: usize,
    last_token: &'a str,
    failed: bool,
}

impl<'a> Params<'a> {
    fn new(src: &'a str) -> Params<'a> {
        Params {
            src,
            pos: 0,
            start: 0,
            last_token: "",
            failed: false,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b',')) {
            self.pos += 1;
        }
    }

    fn token(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'=' || b == b',' || b == b'"' || b.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    fn quoted(&mut self) -> String {
        let src = self.src;
        // opening quote
        self.pos += 1;
        let mut out = String::new();
        let mut chars = src[self.pos..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += i + 1;
                    return out;
                }
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                }
                c => out.push(c),
            }
        }
        self.pos = self.src.len();
        self.failed = true;
        out
    }

    fn next_item(&mut self) -> Option<Item> {
        if self.failed {
            return None;
        }
        self.skip_separators();
        self.start = self.pos;
        let name = self.token();
        if name.is_empty() {
            return None;
        }
        self.skip_ws();
        if self.peek() != Some(b'=') {
            self.last_token = name;
            return Some(Item::Scheme);
        }

        // `name=` could still be token68 padding, as in `Negotiate abc==`
        self.pos += 1;
        self.skip_ws();
        match self.peek() {
            None | Some(b',') | Some(b'=') => {
                while self.peek() == Some(b'=') {
                    self.pos += 1;
                }
                Some(Item::Token68)
            }
            Some(b'"') => {
                let value = self.quoted();
                Some(Item::Param(name.to_owned(), value))
            }
            Some(_) => {
                let value = self.token().to_owned();
                Some(Item::Param(name.to_owned(), value))
            }
        }
    }
}
