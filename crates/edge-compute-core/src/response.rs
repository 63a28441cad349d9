//! Responses: built by handlers, or received from a backend.

use std::fmt;
use std::rc::Rc;

use url::Url;

use edge_compute_common::ScriptError;
use edge_compute_host::{BodyHandle, FramingHeadersMode, ResponseHandle, Upstream};

use crate::body::{BodyInit, ExchangeKind, ExchangeObject, body_accessors, header_accessors};
use crate::context::ExchangeContext;
use crate::headers::Headers;

const REDIRECT_STATUSES: [u16; 5] = [301, 302, 303, 307, 308];

/// Statuses that must not carry a body.
fn is_null_body_status(status: u16) -> bool {
    matches!(status, 101 | 204 | 205 | 304)
}

/// Response-only state of an exchange object.
pub(crate) struct ResponseData {
    pub(crate) handle: ResponseHandle,
    pub(crate) status: u16,
    pub(crate) status_text: String,
    /// Received from a backend rather than built.
    pub(crate) upstream: bool,
    pub(crate) framing: FramingHeadersMode,
}

/// Options for [`Response::new`].
#[derive(Debug, Clone, Default)]
pub struct ResponseInit {
    /// Defaults to 200.
    pub status: Option<u16>,
    pub status_text: Option<String>,
    pub headers: Option<Headers>,
    pub manual_framing_headers: Option<bool>,
}

impl ResponseInit {
    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// An HTTP response.
#[derive(Clone)]
pub struct Response {
    object: Rc<ExchangeObject>,
    cx: Rc<ExchangeContext>,
}

impl Response {
    /// Build a response.
    ///
    /// # Errors
    ///
    /// RangeError for a status outside 200..=599; TypeError for a body with
    /// a status that can't have one.
    pub fn new(
        cx: &Rc<ExchangeContext>,
        body: Option<BodyInit>,
        init: ResponseInit,
    ) -> Result<Self, ScriptError> {
        let status = init.status.unwrap_or(200);
        if !(200..=599).contains(&status) {
            return Err(ScriptError::range_error(format!(
                "Response constructor: Invalid response status code {status}"
            )));
        }
        if body.is_some() && is_null_body_status(status) {
            return Err(ScriptError::type_error(
                "Response constructor: Response body is given with a null body status.",
            ));
        }

        let host = cx.host();
        let handle = host.resp_new()?;
        host.resp_status_set(&handle, status)?;
        let response = Self::wrap(cx, handle, status, host.body_new()?, String::new(), false);

        if let Some(headers) = init.headers {
            response.object.set_headers(headers);
        }
        response.with_data_mut(|data| {
            data.status_text = init.status_text.unwrap_or_default();
            if init.manual_framing_headers == Some(true) {
                data.framing = FramingHeadersMode::ManuallyFromHeaders;
            }
        });
        if let Some(body) = body {
            response.object.extract_body(host, body)?;
        }
        Ok(response)
    }

    /// A response carrying `value` serialized as JSON.
    pub fn from_json(
        cx: &Rc<ExchangeContext>,
        value: &serde_json::Value,
        mut init: ResponseInit,
    ) -> Result<Self, ScriptError> {
        let text = serde_json::to_string(value)
            .map_err(|e| ScriptError::type_error(format!("Response.json: {e}")))?;
        let mut headers = init.headers.take().unwrap_or_default();
        headers.maybe_add("content-type", "application/json")?;
        init.headers = Some(headers);
        Self::new(cx, Some(BodyInit::Text(text)), init)
    }

    /// A redirect to `url`. `status` defaults to 302.
    pub fn redirect(
        cx: &Rc<ExchangeContext>,
        url: &str,
        status: Option<u16>,
    ) -> Result<Self, ScriptError> {
        let status = status.unwrap_or(302);
        if !REDIRECT_STATUSES.contains(&status) {
            return Err(ScriptError::range_error(
                "Response.redirect: Invalid redirect status code.",
            ));
        }
        let location = Url::parse(url).map_err(|_| {
            ScriptError::type_error(format!("Response.redirect: {url} is not a valid URL."))
        })?;
        let response = Self::new(cx, None, ResponseInit::with_status(status))?;
        response.set_header("location", location.as_str())?;
        Ok(response)
    }

    /// Wrap a response received from a backend for `url`.
    pub(crate) fn from_upstream(
        cx: &Rc<ExchangeContext>,
        upstream: Upstream,
        url: impl Into<String>,
    ) -> Result<Self, ScriptError> {
        let (handle, body) = upstream;
        let status = cx.host().resp_status_get(&handle)?;
        let response = Self::wrap(cx, handle, status, body, url, true);
        response.object.set_has_body(true);
        Ok(response)
    }

    fn wrap(
        cx: &Rc<ExchangeContext>,
        handle: ResponseHandle,
        status: u16,
        body: BodyHandle,
        url: impl Into<String>,
        upstream: bool,
    ) -> Self {
        let data = ResponseData {
            handle,
            status,
            status_text: String::new(),
            upstream,
            framing: FramingHeadersMode::Automatic,
        };
        Self {
            object: ExchangeObject::new(ExchangeKind::Response(data), body, url),
            cx: Rc::clone(cx),
        }
    }

    pub(crate) fn object(&self) -> &Rc<ExchangeObject> {
        &self.object
    }

    pub(crate) fn context(&self) -> &Rc<ExchangeContext> {
        &self.cx
    }

    fn with_data<R>(&self, f: impl FnOnce(&ResponseData) -> R) -> R {
        match &*self.object.kind() {
            ExchangeKind::Response(data) => f(data),
            _ => unreachable!("response object without response data"),
        }
    }

    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut ResponseData) -> R) -> R {
        match &mut *self.object.kind_mut() {
            ExchangeKind::Response(data) => f(data),
            _ => unreachable!("response object without response data"),
        }
    }

    pub fn status(&self) -> u16 {
        self.with_data(|data| data.status)
    }

    pub fn status_text(&self) -> String {
        self.with_data(|data| data.status_text.clone())
    }

    /// True for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status())
    }

    /// URL of the request this response answers; empty for built responses.
    pub fn url(&self) -> String {
        self.object.url()
    }

    /// True when the response came from a backend.
    pub fn is_upstream(&self) -> bool {
        self.with_data(|data| data.upstream)
    }

    pub fn set_manual_framing_headers(&self, manual: bool) {
        let mode = if manual {
            FramingHeadersMode::ManuallyFromHeaders
        } else {
            FramingHeadersMode::Automatic
        };
        self.with_data_mut(|data| data.framing = mode);
    }

    /// An independent copy. The body is split so both responses can read it.
    ///
    /// # Errors
    ///
    /// TypeError if the body was already used or its stream is locked.
    pub fn try_clone(&self) -> Result<Self, ScriptError> {
        if self.body_used() || self.object.stream().is_some_and(|s| s.is_locked()) {
            return Err(ScriptError::type_error(
                "Response.prototype.clone: the response's body isn't usable.",
            ));
        }
        let headers = self.headers()?;
        let host = self.cx.host();
        let status = self.status();
        let handle = host.resp_new()?;
        host.resp_status_set(&handle, status)?;

        let clone = Self::wrap(
            &self.cx,
            handle,
            status,
            host.body_new()?,
            self.url(),
            self.is_upstream(),
        );
        clone.object.set_headers(headers);
        let (status_text, framing) = self.with_data(|data| (data.status_text.clone(), data.framing));
        clone.with_data_mut(|data| {
            data.status_text = status_text;
            data.framing = framing;
        });
        if let Some(branch) = self.object.tee_body(&self.cx)? {
            clone.object.extract_body(host, BodyInit::Stream(branch))?;
        }
        Ok(clone)
    }

    /// Append `src`'s body to this response's body on the host side, without
    /// reading it. `src`'s body is used afterwards.
    ///
    /// # Errors
    ///
    /// TypeError if either body was used or has been turned into a stream.
    pub fn append_body(&self, src: &Response) -> Result<(), ScriptError> {
        let unusable = |r: &Response| r.body_used() || r.object.stream().is_some();
        if unusable(self) || unusable(src) {
            return Err(ScriptError::type_error(
                "Response.appendBody: both bodies must be unused host bodies",
            ));
        }
        ExchangeObject::append_body(self.cx.host(), &self.object, &src.object)
    }

    /// Write headers and framing mode to the host head.
    pub(crate) fn sync_for_send(&self) -> Result<(), ScriptError> {
        let host = self.cx.host();
        self.object.sync_headers(host)?;
        let framing = self
            .object
            .checked_framing(host, self.with_data(|data| data.framing))?;
        self.with_data(|data| -> Result<(), ScriptError> {
            host.resp_framing_headers_mode_set(&data.handle, framing)?;
            Ok(())
        })
    }

    /// Move the host head out for sending.
    pub(crate) fn take_handle(&self) -> ResponseHandle {
        self.with_data_mut(|data| data.handle.take())
    }
}

body_accessors!(Response);
header_accessors!(Response);

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status())
            .field("url", &self.url())
            .field("upstream", &self.is_upstream())
            .finish_non_exhaustive()
    }
}
