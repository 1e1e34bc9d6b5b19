//! Credentials and the Digest computation.
//!
//! A [`Realm`] is what the caller configures: a scheme, a principal and a
//! password, plus a few knobs. The per-nonce state a Digest exchange
//! accumulates lives in [`crate::auth::Authenticator`].

use std::fmt;

use md5::Md5;
use sha2::{Digest, Sha256, Sha512_256};

/// Authentication schemes a [`Realm`] can answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Basic => "Basic",
            AuthScheme::Digest => "Digest",
        }
    }
}

/// Character set used to encode Basic credentials.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Charset {
    #[default]
    Utf8,
    /// Characters outside Latin-1 are sent as `?`.
    Iso8859_1,
}

impl Charset {
    pub(crate) fn encode(&self, s: &str) -> Vec<u8> {
        match self {
            Charset::Utf8 => s.as_bytes().to_vec(),
            Charset::Iso8859_1 => s
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

/// Digest hash algorithms (RFC 7616 section 3.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
    Sha512_256,
    Sha512_256Sess,
}

impl Algorithm {
    pub(crate) fn parse(s: &str) -> Option<Algorithm> {
        let algorithm = match s.to_ascii_uppercase().as_str() {
            "MD5" => Algorithm::Md5,
            "MD5-SESS" => Algorithm::Md5Sess,
            "SHA-256" => Algorithm::Sha256,
            "SHA-256-SESS" => Algorithm::Sha256Sess,
            "SHA-512-256" => Algorithm::Sha512_256,
            "SHA-512-256-SESS" => Algorithm::Sha512_256Sess,
            _ => return None,
        };
        Some(algorithm)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha256Sess => "SHA-256-sess",
            Algorithm::Sha512_256 => "SHA-512-256",
            Algorithm::Sha512_256Sess => "SHA-512-256-sess",
        }
    }

    fn is_sess(&self) -> bool {
        matches!(
            self,
            Algorithm::Md5Sess | Algorithm::Sha256Sess | Algorithm::Sha512_256Sess
        )
    }

    /// Lowercase hex digest of `data`.
    pub(crate) fn hex(&self, data: &[u8]) -> String {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => format!("{:x}", Md5::digest(data)),
            Algorithm::Sha256 | Algorithm::Sha256Sess => format!("{:x}", Sha256::digest(data)),
            Algorithm::Sha512_256 | Algorithm::Sha512_256Sess => {
                format!("{:x}", Sha512_256::digest(data))
            }
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality of protection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// Credentials for a server or proxy.
///
/// ```
/// # use ferry::Realm;
/// let realm = Realm::digest("user", "pass").preemptive(true);
/// assert_eq!(realm.principal(), "user");
/// ```
#[derive(Clone)]
pub struct Realm {
    scheme: AuthScheme,
    principal: String,
    password: String,
    charset: Charset,
    preemptive: bool,
    omit_query: bool,
    use_absolute_uri: bool,
}

impl Realm {
    /// Basic credentials. Sent only after a challenge unless
    /// [`preemptive`](Realm::preemptive) is set.
    pub fn basic(principal: impl Into<String>, password: impl Into<String>) -> Realm {
        Realm::new(AuthScheme::Basic, principal.into(), password.into())
    }

    /// Digest credentials. With [`preemptive`](Realm::preemptive) set, a nonce
    /// learned from an earlier challenge is reused on later requests.
    pub fn digest(principal: impl Into<String>, password: impl Into<String>) -> Realm {
        Realm::new(AuthScheme::Digest, principal.into(), password.into())
    }

    fn new(scheme: AuthScheme, principal: String, password: String) -> Realm {
        Realm {
            scheme,
            principal,
            password,
            charset: Charset::default(),
            preemptive: false,
            omit_query: false,
            use_absolute_uri: false,
        }
    }

    pub fn preemptive(mut self, enabled: bool) -> Realm {
        self.preemptive = enabled;
        self
    }

    pub fn charset(mut self, charset: Charset) -> Realm {
        self.charset = charset;
        self
    }

    /// Leave the query out of the Digest `uri`.
    pub fn omit_query(mut self, enabled: bool) -> Realm {
        self.omit_query = enabled;
        self
    }

    /// Use the absolute URL as the Digest `uri`.
    pub fn use_absolute_uri(mut self, enabled: bool) -> Realm {
        self.use_absolute_uri = enabled;
        self
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub(crate) fn charset_value(&self) -> Charset {
        self.charset
    }

    pub fn is_preemptive(&self) -> bool {
        self.preemptive
    }

    /// The `uri` directive for a request to `url`.
    pub(crate) fn digest_uri(&self, url: &url::Url) -> String {
        if self.use_absolute_uri {
            let mut url = url.clone();
            url.set_fragment(None);
            if self.omit_query {
                url.set_query(None);
            }
            return url.to_string();
        }
        let path = match url.path() {
            "" => "/",
            path => path,
        };
        match url.query() {
            Some(query) if !self.omit_query => format!("{path}?{query}"),
            _ => path.to_owned(),
        }
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("scheme", &self.scheme)
            .field("principal", &self.principal)
            .field("preemptive", &self.preemptive)
            .finish_non_exhaustive()
    }
}

/// Inputs of one Digest `response` computation.
pub(crate) struct DigestInput<'a> {
    pub(crate) algorithm: Algorithm,
    pub(crate) username: &'a str,
    pub(crate) realm: &'a str,
    pub(crate) password: &'a str,
    pub(crate) nonce: &'a str,
    pub(crate) cnonce: &'a str,
    pub(crate) nc: u32,
    pub(crate) qop: Option<Qop>,
    pub(crate) method: &'a str,
    pub(crate) uri: &'a str,
    pub(crate) body: &'a [u8],
}

impl DigestInput<'_> {
    /// The request-digest (RFC 7616 section 3.4.1).
    pub(crate) fn response(&self) -> String {
        let h = |s: &str| self.algorithm.hex(s.as_bytes());

        let mut ha1 = h(&format!("{}:{}:{}", self.username, self.realm, self.password));
        if self.algorithm.is_sess() {
            ha1 = h(&format!("{ha1}:{}:{}", self.nonce, self.cnonce));
        }

        let ha2 = match self.qop {
            Some(Qop::AuthInt) => h(&format!(
                "{}:{}:{}",
                self.method,
                self.uri,
                self.algorithm.hex(self.body)
            )),
            _ => h(&format!("{}:{}", self.method, self.uri)),
        };

        match self.qop {
            Some(qop) => h(&format!(
                "{ha1}:{}:{}:{}:{}:{ha2}",
                self.nonce,
                nc_hex(self.nc),
                self.cnonce,
                qop.as_str()
            )),
            None => h(&format!("{ha1}:{}:{ha2}", self.nonce)),
        }
    }
}

pub(crate) fn nc_hex(nc: u32) -> String {
    format!("{nc:08x}")
}
