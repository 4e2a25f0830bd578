//! Request context attached to snapshots.
//!
//! Host middleware builds a [`RequestContext`] from the inbound `http::Request`
//! and runs the handler inside [`with_request_context`]. Captures taken anywhere
//! in that task pick the context up through [`current`]. Outside a request (jobs,
//! CLI commands) [`RequestContext::cli`] is used instead.

use http::{header, HeaderMap, Request};
use serde::Serialize;
use std::{collections::BTreeMap, future::Future, net::SocketAddr};

/// Headers copied into the context. Everything else (cookies, credentials) is dropped.
pub const ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "content-length",
    "content-type",
    "host",
    "origin",
    "referer",
    "user-agent",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-request-id",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RequestContext {
    Http(HttpContext),
    Cli { command: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpContext {
    pub method: String,
    pub path: String,
    pub url: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
}

impl RequestContext {
    /// Placeholder context for work that is not serving a request.
    pub fn cli() -> Self {
        let command = std::env::args().collect::<Vec<_>>().join(" ");
        RequestContext::Cli { command }
    }

    pub fn from_request<B>(request: &Request<B>) -> Self {
        let uri = request.uri();
        let headers = request.headers();
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let url = if uri.scheme().is_some() && uri.authority().is_some() {
            uri.to_string()
        } else {
            let scheme = header_str(headers, "x-forwarded-proto").unwrap_or("http");
            match header_str(headers, header::HOST.as_str()) {
                Some(host) => format!("{}://{}{}", scheme, host, path_and_query),
                None => path_and_query.to_string(),
            }
        };

        let query = uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        let ip = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| header_str(headers, "x-real-ip").map(str::to_string))
            .or_else(|| {
                request
                    .extensions()
                    .get::<SocketAddr>()
                    .map(|addr| addr.ip().to_string())
            });

        let allowed = ALLOWED_HEADERS
            .iter()
            .filter_map(|name| header_str(headers, name).map(|v| (name.to_string(), v.to_string())))
            .collect();

        RequestContext::Http(HttpContext {
            method: request.method().to_string(),
            path: uri.path().to_string(),
            url,
            ip,
            user_agent: header_str(headers, header::USER_AGENT.as_str()).map(str::to_string),
            query,
            headers: allowed,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
}

/// Runs `fut` with `context` as the current request context.
pub async fn with_request_context<F: Future>(context: RequestContext, fut: F) -> F::Output {
    REQUEST_CONTEXT.scope(context, fut).await
}

/// The request context of the current task, if one was installed.
pub fn current() -> Option<RequestContext> {
    REQUEST_CONTEXT.try_with(Clone::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Request<()> {
        Request::builder()
            .method("POST")
            .uri("/orders?id=42&q=a%20b")
            .header("host", "shop.example.com")
            .header("user-agent", "curl/8.0")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .header("authorization", "Bearer secret")
            .header("cookie", "session=abc")
            .body(())
            .unwrap()
    }

    #[test]
    fn test_from_request() {
        let RequestContext::Http(ctx) = RequestContext::from_request(&sample_request()) else {
            panic!("expected http context");
        };
        assert_eq!(ctx.method, "POST");
        assert_eq!(ctx.path, "/orders");
        assert_eq!(ctx.url, "http://shop.example.com/orders?id=42&q=a%20b");
        assert_eq!(ctx.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(ctx.query.get("q").map(String::as_str), Some("a b"));
        assert_eq!(ctx.query.get("id").map(String::as_str), Some("42"));
        assert!(ctx.headers.contains_key("host"));
        assert!(!ctx.headers.contains_key("authorization"));
        assert!(!ctx.headers.contains_key("cookie"));
    }

    #[test]
    fn test_from_request_with_absolute_uri_and_socket_addr() {
        let mut request = Request::builder()
            .uri("https://api.example.com/health")
            .body(())
            .unwrap();
        request
            .extensions_mut()
            .insert("192.0.2.1:5000".parse::<SocketAddr>().unwrap());
        let RequestContext::Http(ctx) = RequestContext::from_request(&request) else {
            panic!("expected http context");
        };
        assert_eq!(ctx.url, "https://api.example.com/health");
        assert_eq!(ctx.ip.as_deref(), Some("192.0.2.1"));
        assert!(ctx.query.is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let value = serde_json::to_value(RequestContext::from_request(&sample_request())).unwrap();
        assert_eq!(value["type"], "http");
        assert_eq!(value["method"], "POST");

        let cli = serde_json::to_value(RequestContext::cli()).unwrap();
        assert_eq!(cli["type"], "cli");
    }

    #[tokio::test]
    async fn test_task_local_scope() {
        assert!(current().is_none());
        let ctx = RequestContext::from_request(&sample_request());
        let seen = with_request_context(ctx.clone(), async { current() }).await;
        assert_eq!(seen, Some(ctx));
        assert!(current().is_none());
    }
}
