//! Requests: the downstream request and requests built for [`fetch`].
//!
//! [`fetch`]: crate::fetch::fetch

use std::fmt;
use std::rc::Rc;

use url::Url;

use edge_compute_common::ScriptError;
use edge_compute_host::{
    BodyHandle, CacheOverride, FramingHeadersMode, PendingRequestHandle, RequestHandle,
};

use crate::body::{BodyInit, ExchangeKind, ExchangeObject, body_accessors, header_accessors};
use crate::context::ExchangeContext;
use crate::headers::Headers;

/// Methods upper-cased when matched case-insensitively.
const NORMALIZED_METHODS: [&str; 6] = ["DELETE", "GET", "HEAD", "OPTIONS", "POST", "PUT"];

/// Upper-case the standard methods; keep any other method as given.
pub fn normalize_method(method: &str) -> String {
    NORMALIZED_METHODS
        .iter()
        .find(|known| known.eq_ignore_ascii_case(method))
        .map_or_else(|| method.to_string(), |known| (*known).to_string())
}

/// Request-only state of an exchange object.
pub(crate) struct RequestData {
    pub(crate) handle: RequestHandle,
    pub(crate) method: String,
    pub(crate) backend: Option<String>,
    pub(crate) cache_override: CacheOverride,
    pub(crate) framing: FramingHeadersMode,
    /// The outbound send of this request, once started.
    pub(crate) pending: PendingRequestHandle,
}

/// Options for [`Request::new`].
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    pub method: Option<String>,
    pub headers: Option<Headers>,
    pub body: Option<BodyInit>,
    /// Name of the backend to send to.
    pub backend: Option<String>,
    pub cache_override: Option<CacheOverride>,
    /// Take `Content-Length`/`Transfer-Encoding` from the headers as given.
    pub manual_framing_headers: Option<bool>,
}

impl RequestInit {
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<BodyInit>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    #[must_use]
    pub fn cache_override(mut self, cache_override: CacheOverride) -> Self {
        self.cache_override = Some(cache_override);
        self
    }
}

/// An HTTP request.
///
/// Cloning the handle shares the request; use [`Request::try_clone`] for an
/// independent copy.
#[derive(Clone)]
pub struct Request {
    object: Rc<ExchangeObject>,
    cx: Rc<ExchangeContext>,
}

impl Request {
    /// Build a request for `url`.
    ///
    /// # Errors
    ///
    /// TypeError for an invalid URL, or for a body on a GET or HEAD request.
    pub fn new(cx: &Rc<ExchangeContext>, url: &str, init: RequestInit) -> Result<Self, ScriptError> {
        let parsed = Url::parse(url).map_err(|_| {
            ScriptError::type_error(format!("Request constructor: {url} is not a valid URL."))
        })?;
        let method = init
            .method
            .as_deref()
            .map_or_else(|| "GET".to_string(), normalize_method);
        if init.body.is_some() && (method == "GET" || method == "HEAD") {
            return Err(ScriptError::type_error(
                "Request constructor: HEAD or GET Request cannot have a body.",
            ));
        }

        let host = cx.host();
        let handle = host.req_new()?;
        host.req_method_set(&handle, &method)?;
        host.req_uri_set(&handle, parsed.as_str())?;
        let body = host.body_new()?;
        let request = Self::wrap(cx, handle, method, body, parsed.as_str());
        request.apply_init(init)?;
        Ok(request)
    }

    /// Build a request from `input`, overriding what `init` sets. Without an
    /// init body, `input`'s body moves to the new request.
    pub fn from_request(
        cx: &Rc<ExchangeContext>,
        input: &Request,
        mut init: RequestInit,
    ) -> Result<Self, ScriptError> {
        let take_input_body = init.body.is_none() && input.object.has_body();
        if take_input_body && input.body_used() {
            return Err(ScriptError::type_error(
                "Request constructor: the input request's body has already been used",
            ));
        }
        if init.method.is_none() {
            init.method = Some(input.method());
        }
        if init.headers.is_none() {
            init.headers = Some(input.headers()?);
        }
        if init.backend.is_none() {
            init.backend = input.backend();
        }
        if init.cache_override.is_none() {
            init.cache_override = Some(input.cache_override());
        }

        let request = Self::new(cx, &input.url(), init)?;
        if take_input_body {
            input.object.transfer_body(cx.host(), &request.object)?;
        }
        Ok(request)
    }

    /// The inbound request of this exchange. Available once.
    pub fn downstream(cx: &Rc<ExchangeContext>) -> Result<Self, ScriptError> {
        let host = cx.host();
        let (handle, body) = host.downstream_request()?;
        let method = host.req_method_get(&handle)?;
        let url = host.req_uri_get(&handle)?;
        let request = Self::wrap(cx, handle, method, body, url);
        request.object.set_has_body(true);
        Ok(request)
    }

    fn wrap(
        cx: &Rc<ExchangeContext>,
        handle: RequestHandle,
        method: String,
        body: BodyHandle,
        url: impl Into<String>,
    ) -> Self {
        let data = RequestData {
            handle,
            method,
            backend: None,
            cache_override: CacheOverride::None,
            framing: FramingHeadersMode::Automatic,
            pending: PendingRequestHandle::invalid(),
        };
        Self {
            object: ExchangeObject::new(ExchangeKind::Request(data), body, url),
            cx: Rc::clone(cx),
        }
    }

    fn apply_init(&self, init: RequestInit) -> Result<(), ScriptError> {
        if let Some(headers) = init.headers {
            self.object.set_headers(headers);
        }
        self.with_data_mut(|data| {
            data.backend = init.backend;
            if let Some(cache_override) = init.cache_override {
                data.cache_override = cache_override;
            }
            if init.manual_framing_headers == Some(true) {
                data.framing = FramingHeadersMode::ManuallyFromHeaders;
            }
        });
        if let Some(body) = init.body {
            self.object.extract_body(self.cx.host(), body)?;
        }
        Ok(())
    }

    pub(crate) fn object(&self) -> &Rc<ExchangeObject> {
        &self.object
    }

    pub(crate) fn context(&self) -> &Rc<ExchangeContext> {
        &self.cx
    }

    fn with_data<R>(&self, f: impl FnOnce(&RequestData) -> R) -> R {
        match &*self.object.kind() {
            ExchangeKind::Request(data) => f(data),
            _ => unreachable!("request object without request data"),
        }
    }

    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut RequestData) -> R) -> R {
        match &mut *self.object.kind_mut() {
            ExchangeKind::Request(data) => f(data),
            _ => unreachable!("request object without request data"),
        }
    }

    pub fn method(&self) -> String {
        self.with_data(|data| data.method.clone())
    }

    pub fn url(&self) -> String {
        self.object.url()
    }

    /// The backend this request is sent to, when one was named.
    pub fn backend(&self) -> Option<String> {
        self.with_data(|data| data.backend.clone())
    }

    pub fn set_backend(&self, backend: impl Into<String>) {
        let backend = backend.into();
        self.with_data_mut(|data| data.backend = Some(backend));
    }

    pub fn cache_override(&self) -> CacheOverride {
        self.with_data(|data| data.cache_override.clone())
    }

    pub fn set_cache_override(&self, cache_override: CacheOverride) {
        self.with_data_mut(|data| data.cache_override = cache_override);
    }

    pub fn set_manual_framing_headers(&self, manual: bool) {
        let mode = if manual {
            FramingHeadersMode::ManuallyFromHeaders
        } else {
            FramingHeadersMode::Automatic
        };
        self.with_data_mut(|data| data.framing = mode);
    }

    /// An independent copy. The body is split so both requests can read it.
    ///
    /// # Errors
    ///
    /// TypeError if the body was already used or its stream is locked.
    pub fn try_clone(&self) -> Result<Self, ScriptError> {
        if self.body_used() || self.object.stream().is_some_and(|s| s.is_locked()) {
            return Err(ScriptError::type_error(
                "Request.prototype.clone: the request's body isn't usable.",
            ));
        }
        let headers = self.headers()?;
        let host = self.cx.host();
        let method = self.method();
        let url = self.url();
        let handle = host.req_new()?;
        host.req_method_set(&handle, &method)?;
        host.req_uri_set(&handle, &url)?;

        let clone = Self::wrap(&self.cx, handle, method, host.body_new()?, url);
        clone.object.set_headers(headers);
        let (backend, cache_override, framing) = self.with_data(|data| {
            (data.backend.clone(), data.cache_override.clone(), data.framing)
        });
        clone.with_data_mut(|data| {
            data.backend = backend;
            data.cache_override = cache_override;
            data.framing = framing;
        });
        if let Some(branch) = self.object.tee_body(&self.cx)? {
            clone.object.extract_body(host, BodyInit::Stream(branch))?;
        }
        Ok(clone)
    }

    /// Write headers, cache override and framing mode to the host head.
    pub(crate) fn sync_for_send(&self) -> Result<(), ScriptError> {
        let host = self.cx.host();
        self.object.sync_headers(host)?;
        let framing = self
            .object
            .checked_framing(host, self.with_data(|data| data.framing))?;
        self.with_data(|data| -> Result<(), ScriptError> {
            if !data.cache_override.is_none() {
                host.req_cache_override_set(&data.handle, &data.cache_override)?;
            }
            host.req_framing_headers_mode_set(&data.handle, framing)?;
            Ok(())
        })
    }
}

body_accessors!(Request);
header_accessors!(Request);

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method())
            .field("url", &self.url())
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}
