//! Serves assets of one collection with encoding negotiation and
//! conditional-request support.

use crate::{
    errors::AppError,
    models::asset::ContentEncoding,
    services::{
        edge::EdgeService,
        resolve::{self, Precondition, ResolveError},
    },
};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};
use tracing::debug;

/// `GET|HEAD /{*path}`
///
/// Headers are identical for GET and HEAD; HEAD never reads the body from
/// the backend.
pub async fn serve_asset(
    State(edge): State<EdgeService>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let snapshot = edge.snapshot().await?;
    let path = urlencoding::decode(uri.path())
        .map_err(|_| AppError::bad_request("path is not valid UTF-8"))?;

    let Some((entry, status)) = resolve::resolve_asset(&snapshot.index, &snapshot.settings, &path)
    else {
        return Err(AppError::not_found(format!("no asset at `{path}`")));
    };

    let groups = resolve::parse_accept_encoding(header_str(&headers, header::ACCEPT_ENCODING));
    let variant = resolve::select_variant(entry, &groups)
        .ok_or_else(|| ResolveError::NoVariant(entry.key.clone()))?;
    let etag = resolve::etag(variant);

    let mut resp_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        resp_headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&resolve::format_http_date(entry.last_modified_time)) {
        resp_headers.insert(header::LAST_MODIFIED, value);
    }
    resp_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(resolve::cache_control(entry)),
    );
    resp_headers.insert(header::VARY, HeaderValue::from_static("accept-encoding"));

    let precondition = if status == StatusCode::OK {
        resolve::evaluate_preconditions(
            &method,
            &etag,
            entry.last_modified_time,
            header_str(&headers, header::IF_NONE_MATCH),
            header_str(&headers, header::IF_MODIFIED_SINCE),
        )
    } else {
        Precondition::Proceed
    };
    if precondition == Precondition::NotModified {
        debug!(path = %path, etag = %etag, "not modified");
        return Ok(respond(StatusCode::NOT_MODIFIED, resp_headers, Body::empty()));
    }

    resp_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&entry.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(variant.size));
    if variant.content_encoding != ContentEncoding::Identity {
        resp_headers.insert(
            header::CONTENT_ENCODING,
            HeaderValue::from_static(variant.content_encoding.as_str()),
        );
    }

    if method == Method::HEAD {
        return Ok(respond(status, resp_headers, Body::empty()));
    }

    let object = resolve::fetch_variant(edge.provider.as_ref(), &edge.publish_id, variant).await?;
    debug!(
        path = %path,
        asset = %entry.key,
        encoding = %variant.content_encoding,
        bytes = object.body.len(),
        "serving asset"
    );
    Ok(respond(status, resp_headers, Body::from(object.body)))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn respond(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
