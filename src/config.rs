//! The `config` module provides a generic mechanism for request-scoped
//! configuration that overrides the client's defaults.
//!
//! # Design Overview
//!
//! - The [`RequestConfigValue`] trait associates a config key type with its value type.
//! - The [`RequestConfig`] struct wraps an optional value of the type linked via [`RequestConfigValue`].
//!
//! The client keeps one [`RequestConfig`] per key holding its default, and a
//! request may carry its own in [`http::Extensions`]. [`RequestConfig::fetch`]
//! resolves the two: whenever the request carries a value, that value is used,
//! even when the client's is finite and the request's is not.
//!
//! Several keys share the value type `Option<Duration>`; trait association
//! keeps them distinct at the type level. For timeouts, `None` means "no
//! limit".

use std::any::type_name;
use std::fmt::Debug;
use std::time::Duration;

use http::Extensions;

/// This trait is empty and is only used to associate a configuration key type with its
/// corresponding value type.
pub(crate) trait RequestConfigValue: Copy + Clone + 'static {
    type Value: Clone + Debug + Send + Sync + 'static;
}

/// RequestConfig carries a request-scoped configuration value.
#[derive(Clone, Copy)]
pub(crate) struct RequestConfig<T: RequestConfigValue>(Option<T::Value>);

impl<T: RequestConfigValue> Default for RequestConfig<T> {
    fn default() -> Self {
        RequestConfig(None)
    }
}

impl<T> RequestConfig<T>
where
    T: RequestConfigValue,
{
    pub(crate) fn new(v: Option<T::Value>) -> Self {
        RequestConfig(v)
    }

    /// format request config value as struct field.
    ///
    /// We provide this API directly to avoid leak internal value to callers.
    pub(crate) fn fmt_as_field(&self, f: &mut std::fmt::DebugStruct<'_, '_>) {
        if let Some(v) = &self.0 {
            f.field(type_name::<T>(), v);
        }
    }

    /// Retrieve the value from the request-scoped configuration.
    ///
    /// If the request specifies a value, use that value; otherwise, fall back
    /// to the value held by this instance (typically the client's).
    pub(crate) fn fetch<'client, 'request>(
        &'client self,
        ext: &'request Extensions,
    ) -> Option<&'request T::Value>
    where
        'client: 'request,
    {
        ext.get::<RequestConfig<T>>()
            .and_then(|v| v.0.as_ref())
            .or(self.0.as_ref())
    }

    /// Retrieve the value from the request's Extensions.
    pub(crate) fn get(ext: &Extensions) -> Option<&T::Value> {
        ext.get::<RequestConfig<T>>().and_then(|v| v.0.as_ref())
    }

    /// Retrieve the mutable value from the request's Extensions.
    pub(crate) fn get_mut(ext: &mut Extensions) -> &mut Option<T::Value> {
        let cfg = ext.get_or_insert_default::<RequestConfig<T>>();
        &mut cfg.0
    }
}

impl<T> RequestConfig<T>
where
    T: RequestConfigValue<Value = Option<Duration>>,
{
    /// Resolve a timeout: the request's value if it set one, else the
    /// client's. `None` means no limit.
    pub(crate) fn timeout(&self, ext: &Extensions) -> Option<Duration> {
        self.fetch(ext).copied().flatten()
    }
}

// ================================
//
// The following sections are all configuration types provided by ferry.
//
// To add a new config:
//
// 1. create a new struct for the config key like `RequestTimeout`.
// 2. implement `RequestConfigValue` for the struct, the `Value` is the config value's type.
//
// ================================

/// Time allowed to establish a new connection.
#[derive(Clone, Copy)]
pub(crate) struct ConnectTimeout;

impl RequestConfigValue for ConnectTimeout {
    type Value = Option<Duration>;
}

/// Maximum gap between received bytes of a response.
#[derive(Clone, Copy)]
pub(crate) struct ReadTimeout;

impl RequestConfigValue for ReadTimeout {
    type Value = Option<Duration>;
}

/// Wall-clock budget of a whole logical request.
#[derive(Clone, Copy)]
pub(crate) struct RequestTimeout;

impl RequestConfigValue for RequestTimeout {
    type Value = Option<Duration>;
}

#[derive(Clone, Copy)]
pub(crate) struct FollowRedirects;

impl RequestConfigValue for FollowRedirects {
    type Value = bool;
}
