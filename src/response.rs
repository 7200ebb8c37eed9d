//! Content-negotiated error/redirect rendering and the standard response
//! headers every response carries (§4.8).

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use serde_json::json;

/// The three distinct error templates called out in §4.8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    BadGateway,
    Internal,
}

impl ErrorKind {
    fn status(self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "404: This page could not be found",
            ErrorKind::BadGateway => "502: Bad Gateway",
            ErrorKind::Internal => "500: Internal Server Error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Negotiated {
    Json,
    Html,
    Plain,
}

fn negotiate(accept: Option<&str>) -> Negotiated {
    let Some(accept) = accept else {
        return Negotiated::Plain;
    };
    // Naive but order-preserving: take whichever of json/html appears
    // first in the Accept list, rather than doing full q-value ranking.
    let json_pos = accept.find("application/json");
    let html_pos = accept.find("text/html");
    match (json_pos, html_pos) {
        (Some(j), Some(h)) if j < h => Negotiated::Json,
        (Some(_), Some(_)) => Negotiated::Html,
        (Some(_), None) => Negotiated::Json,
        (None, Some(_)) => Negotiated::Html,
        (None, None) => Negotiated::Plain,
    }
}

/// Set the headers every response carries, regardless of status (§4.8).
pub fn apply_standard_headers(headers: &mut HeaderMap, request_id: &str) {
    headers.insert(
        "cache-control",
        HeaderValue::from_static("public, max-age=0, must-revalidate"),
    );
    headers.insert("server", HeaderValue::from_static("devdeploy"));
    headers.insert("x-now-trace", HeaderValue::from_static("dev1"));
    headers.insert(
        "x-now-id",
        HeaderValue::from_str(request_id).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert("x-now-cache", HeaderValue::from_static("MISS"));
}

/// Render a content-negotiated error page/body.
pub fn render_error(accept: Option<&str>, kind: ErrorKind, message: &str, request_id: &str) -> Response {
    let status = kind.status();
    let mut response = match negotiate(accept) {
        Negotiated::Json => Json(json!({
            "error": { "code": status.as_u16(), "message": message },
        }))
        .into_response(),
        Negotiated::Html => Html(error_page(kind, message)).into_response(),
        Negotiated::Plain => message.to_string().into_response(),
    };
    *response.status_mut() = status;
    apply_standard_headers(response.headers_mut(), request_id);
    response
}

/// Render a content-negotiated redirect (§4.7 step 5): status from the
/// matching route rule plus a `Location` header, with a body per `Accept`
/// for clients that don't follow redirects automatically.
pub fn render_redirect(status: StatusCode, location: &str, accept: Option<&str>, request_id: &str) -> Response {
    let mut response = match negotiate(accept) {
        Negotiated::Json => Json(json!({ "redirect": location })).into_response(),
        Negotiated::Html => Html(redirect_page(location)).into_response(),
        Negotiated::Plain => format!("Redirecting to {location}\n").into_response(),
    };
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("location", HeaderValue::from_str(location).unwrap_or_else(|_| HeaderValue::from_static("/")));
    apply_standard_headers(response.headers_mut(), request_id);
    response
}

fn error_page(kind: ErrorKind, message: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>{title}</title></head><body><h1>{title}</h1><p>{message}</p></body></html>",
        title = kind.title(),
        message = html_escape(message),
    )
}

fn redirect_page(location: &str) -> String {
    let location = html_escape(location);
    format!(
        "<!DOCTYPE html><html><head><title>Redirecting...</title></head><body>Redirecting to <a href=\"{location}\">{location}</a>.</body></html>",
    )
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
