//! Request dispatch, grounded in
//! `original_source/ljrServer/http/servlet.{h,cpp}`.
//!
//! `Servlet` is a trait rather than a virtual base class; `parking_lot`
//! guards the dispatch table the way the original uses `RWMutex`.

use crate::http::message::{HttpRequest, HttpResponse, HttpStatus};
use crate::http::session::HttpSession;
use parking_lot::RwLock;
use std::sync::Arc;

/// Handles one HTTP request/response pair over a session, grounded in
/// `Servlet::handle`. Returns an opaque status code the original uses
/// as a generic "handled ok / handled with error" signal; `0` means
/// success, matching `Servlet::handle`'s `int32_t` contract.
pub trait Servlet: Send + Sync {
    fn handle(&self, request: &HttpRequest, response: &mut HttpResponse, session: &HttpSession) -> i32;

    fn name(&self) -> &str;
}

/// Wraps a plain closure as a [`Servlet`], grounded in
/// `FunctionServlet`.
pub struct FunctionServlet<F> {
    name: String,
    cb: F,
}

impl<F> FunctionServlet<F>
where
    F: Fn(&HttpRequest, &mut HttpResponse, &HttpSession) -> i32 + Send + Sync,
{
    pub fn new(name: impl Into<String>, cb: F) -> Self {
        FunctionServlet {
            name: name.into(),
            cb,
        }
    }
}

impl<F> Servlet for FunctionServlet<F>
where
    F: Fn(&HttpRequest, &mut HttpResponse, &HttpSession) -> i32 + Send + Sync,
{
    fn handle(&self, request: &HttpRequest, response: &mut HttpResponse, session: &HttpSession) -> i32 {
        (self.cb)(request, response, session)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Always answers 404, grounded in `NotFoundServlet`.
pub struct NotFoundServlet {
    body: String,
}

impl NotFoundServlet {
    pub fn new() -> Self {
        NotFoundServlet {
            body: "<html><body><h1>404 Not Found</h1></body></html>".to_string(),
        }
    }
}

impl Default for NotFoundServlet {
    fn default() -> Self {
        Self::new()
    }
}

impl Servlet for NotFoundServlet {
    fn handle(&self, _request: &HttpRequest, response: &mut HttpResponse, _session: &HttpSession) -> i32 {
        response.status = HttpStatus::NotFound;
        response.headers.set("content-type", "text/html");
        response.set_body(self.body.clone().into_bytes());
        0
    }

    fn name(&self) -> &str {
        "NotFoundServlet"
    }
}

/// A single glob dispatch entry: `uri` may contain `*` wildcards,
/// matched with simple shell-glob semantics.
struct GlobEntry {
    pattern: String,
    servlet: Arc<dyn Servlet>,
}

/// Routes requests to registered [`Servlet`]s by exact path match
/// first, then glob match, falling back to a default (404 by
/// default), grounded in `ServletDispatch`.
pub struct ServletDispatch {
    exact: RwLock<std::collections::HashMap<String, Arc<dyn Servlet>>>,
    globs: RwLock<Vec<GlobEntry>>,
    default: RwLock<Arc<dyn Servlet>>,
}

impl std::fmt::Debug for ServletDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServletDispatch")
            .field("exact_routes", &self.exact.read().len())
            .field("glob_routes", &self.globs.read().len())
            .finish()
    }
}

impl ServletDispatch {
    pub fn new() -> Self {
        ServletDispatch {
            exact: RwLock::new(std::collections::HashMap::new()),
            globs: RwLock::new(Vec::new()),
            default: RwLock::new(Arc::new(NotFoundServlet::new())),
        }
    }

    pub fn add_servlet(&self, uri: impl Into<String>, servlet: Arc<dyn Servlet>) {
        self.exact.write().insert(uri.into(), servlet);
    }

    pub fn add_glob_servlet(&self, pattern: impl Into<String>, servlet: Arc<dyn Servlet>) {
        self.globs.write().push(GlobEntry {
            pattern: pattern.into(),
            servlet,
        });
    }

    pub fn del_servlet(&self, uri: &str) {
        self.exact.write().remove(uri);
    }

    pub fn del_glob_servlet(&self, pattern: &str) {
        self.globs.write().retain(|e| e.pattern != pattern);
    }

    pub fn set_default(&self, servlet: Arc<dyn Servlet>) {
        *self.default.write() = servlet;
    }

    pub fn default_servlet(&self) -> Arc<dyn Servlet> {
        self.default.read().clone()
    }

    /// Exact match, then first-matching glob, then the default.
    pub fn matched_servlet(&self, uri: &str) -> Arc<dyn Servlet> {
        if let Some(s) = self.exact.read().get(uri) {
            return s.clone();
        }
        if let Some(entry) = self.globs.read().iter().find(|e| glob_match(&e.pattern, uri)) {
            return entry.servlet.clone();
        }
        self.default_servlet()
    }

    pub fn dispatch(&self, request: &HttpRequest, response: &mut HttpResponse, session: &HttpSession) -> i32 {
        let servlet = self.matched_servlet(&request.path);
        servlet.handle(request, response, session)
    }
}

impl Default for ServletDispatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal `*`-only glob match, grounded in the original's glob-based
/// `addGlobServlet` routes (e.g. `/api/*`).
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => {
                if inner(&p[1..], t) {
                    return true;
                }
                !t.is_empty() && inner(p, &t[1..])
            }
            Some(c) => !t.is_empty() && t[0] == *c && inner(&p[1..], &t[1..]),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_match_supports_trailing_wildcard() {
        assert!(glob_match("/api/*", "/api/users"));
        assert!(!glob_match("/api/*", "/other"));
        assert!(glob_match("/exact", "/exact"));
    }

    #[test]
    fn dispatch_prefers_exact_over_glob() {
        let dispatch = ServletDispatch::new();
        dispatch.add_glob_servlet(
            "/api/*",
            Arc::new(FunctionServlet::new("glob", |_, resp, _| {
                resp.headers.set("x-matched", "glob");
                0
            })),
        );
        dispatch.add_servlet(
            "/api/users",
            Arc::new(FunctionServlet::new("exact", |_, resp, _| {
                resp.headers.set("x-matched", "exact");
                0
            })),
        );
        assert_eq!(dispatch.matched_servlet("/api/users").name(), "exact");
        assert_eq!(dispatch.matched_servlet("/api/other").name(), "glob");
        assert_eq!(dispatch.matched_servlet("/unknown").name(), "NotFoundServlet");
    }
}
