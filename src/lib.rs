//! # ferry
//!
//! The `ferry` crate is the core of an asynchronous HTTP client: the part
//! that decides which connection a request goes out on, what happens when
//! the answer is a redirect or an authentication challenge, and when a failed
//! exchange may be sent again.
//!
//! - Connection pooling, partitioned by destination and proxy
//! - Redirects with a customizable policy
//! - Basic and Digest authentication, for servers and proxies
//! - An RFC 6265 cookie jar
//! - Connect, read and whole-request timeouts
//!
//! The wire itself is pluggable through [`transport::Transport`]; the
//! built-in [`transport::HttpTransport`] speaks HTTP/1.1 over TCP.
//!
//! ## Making a GET request
//!
//! ```no_run
//! # async fn run() -> Result<(), ferry::Error> {
//! let client = ferry::Client::new();
//! let res = client.get("http://example.com/").send().await?;
//!
//! println!("Status: {}", res.status());
//! println!("Body:\n\n{}", res.text());
//! # Ok(())
//! # }
//! ```
//!
//! The [`Client`] holds the pool and the cookie jar, so create one and
//! reuse it.
//!
//! ## Redirect Policies
//!
//! By default, a `Client` will automatically handle HTTP redirects, having a
//! maximum redirect chain of 5 hops. To customize this behavior, a
//! [`redirect::Policy`] can be used with a `ClientBuilder`.
//!
//! ## Authentication
//!
//! ```no_run
//! # async fn run() -> Result<(), ferry::Error> {
//! use ferry::Realm;
//!
//! let client = ferry::Client::builder()
//!     .realm(Realm::digest("alice", "secret"))
//!     .build()?;
//! let res = client.get("http://example.com/private").send().await?;
//! # Ok(())
//! # }
//! ```

pub use http::header;
pub use http::{Method, StatusCode, Version};
pub use url::Url;

pub use self::auth::{Authenticator, Challenge};
pub use self::client::{CancelHandle, Client, ClientBuilder, Pending};
pub use self::error::{Error, Result, TimeoutPhase};
pub use self::handler::{FilterContext, Listener, Outcome, ResponseFilter};
pub use self::into_url::IntoUrl;
pub use self::partition::PartitionKey;
pub use self::pool::{ClientStats, HostStats};
pub use self::proxy::ProxyServer;
pub use self::realm::{Algorithm, AuthScheme, Charset, Qop, Realm};
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;

mod auth;
mod client;
mod config;
pub mod cookie;
mod error;
mod exchange;
pub mod handler;
mod into_url;
pub mod keep_alive;
mod partition;
pub mod pool;
mod proxy;
mod realm;
pub mod redirect;
mod request;
mod response;
pub mod retry;
pub mod transport;
mod util;
