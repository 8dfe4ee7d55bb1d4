use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use ring::constant_time;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
};
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    logging::redact_token,
    server::{
        admission::AdmissionPermit,
        error::status_with_message,
        range::{parse_range, ByteRange, Window},
        AppState,
    },
    telegram::FileHandle,
    transfer::ByteStream,
};

const CONTENT_SECURITY_POLICY: &str = "script-src 'self' 'unsafe-inline' 'unsafe-eval'";
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Deserialize)]
pub(crate) struct FileQuery {
    /// Present (with any value) to serve the file as an attachment
    dl: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DeleteResponse {
    pub(crate) deleted: bool,
    pub(crate) token: String,
}

pub(crate) async fn index(State(state): State<AppState>) -> Result<Response> {
    if !state.settings.show_index {
        return Ok(status_with_message(StatusCode::FORBIDDEN).into_response());
    }

    let profile = state.backend.describe_self().await?;
    let page = format!(
        r#"<a target="_blank" href="https://t.me/{}">{}</a><br/>"#,
        escape_html(&profile.username),
        escape_html(&profile.display_name)
    );
    Ok(Html(page).into_response())
}

/// A token without a file name addresses nothing
pub(crate) async fn bare_token(Path(_token): Path<String>) -> Response {
    status_with_message(StatusCode::NOT_FOUND).into_response()
}

pub(crate) async fn get_file(
    State(state): State<AppState>,
    Path((token, name)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response> {
    let request = FileRequest {
        token,
        name,
        download: query.dl.is_some(),
        head: false,
    };
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    serve_file(state, request, &headers, peer).await
}

pub(crate) async fn head_file(
    State(state): State<AppState>,
    Path((token, name)): Path<(String, String)>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let request = FileRequest {
        token,
        name,
        download: query.dl.is_some(),
        head: true,
    };
    serve_file(state, request, &headers, None).await
}

pub(crate) async fn delete_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>> {
    let Some(expected) = state.settings.delete_key.as_deref() else {
        return Err(Error::Unauthorized);
    };
    let authorized = headers
        .get(&state.settings.delete_key_header)
        .map(|provided| {
            constant_time::verify_slices_are_equal(provided.as_bytes(), expected.as_bytes()).is_ok()
        })
        .unwrap_or(false);
    if !authorized {
        return Err(Error::Unauthorized);
    }

    let identity = state.codec.decode(&token)?;
    state.backend.delete_message(&identity).await?;
    info!(token = %redact_token(&token), "Deleted {}", identity);

    Ok(Json(DeleteResponse {
        deleted: true,
        token,
    }))
}

struct FileRequest {
    token: String,
    name: String,
    download: bool,
    head: bool,
}

async fn serve_file(
    state: AppState,
    request: FileRequest,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<Response> {
    let token = redact_token(&request.token);
    let identity = state.codec.decode(&request.token).map_err(|e| {
        debug!(token = %token, "Undecodable token: {}", e);
        e
    })?;

    let handle = state.backend.resolve_file(&identity).await?;
    if handle.file_name != request.name {
        return Err(Error::NotFound(format!(
            "{} is served as {:?}, not {:?}",
            identity, handle.file_name, request.name
        )));
    }
    if let Some(max) = state.settings.max_file_size {
        if handle.size > max {
            return Err(Error::NotFound(format!(
                "{} is {} bytes, over the {} byte limit",
                identity, handle.size, max
            )));
        }
    }

    let window = if handle.size == 0 {
        Window {
            offset: 0,
            limit: 0,
            partial: false,
        }
    } else {
        let range = parse_range(headers.get(header::RANGE).and_then(|v| v.to_str().ok()));
        if range == ByteRange::Full && headers.contains_key(header::RANGE) {
            debug!(token = %token, "Ignoring unsupported Range header");
        }
        range.resolve(handle.size)?
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = if window.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    apply_headers(response.headers_mut(), &handle, &window, &request)?;

    if request.head || window.is_empty() {
        return Ok(response);
    }

    let client = client_ip(headers, peer, state.settings.trust_forwarded_headers);
    let permit = state
        .admission
        .try_admit(client)
        .ok_or(Error::AdmissionRejected)?;

    debug!(
        token = %token,
        client = %client,
        offset = window.offset,
        limit = window.limit,
        "Serving {} from partition {}",
        identity,
        handle.partition
    );
    let mut stream = state
        .engine
        .open_stream(handle, window.offset, window.limit)?;

    // Headers are only committed once the first chunk arrived
    let first = match stream.next().await {
        Some(Ok(first)) => first,
        Some(Err(e)) => return Err(e),
        None => return Err(Error::Internal("download ended before any byte".to_string())),
    };

    *response.body_mut() = Body::from_stream(AdmittedStream {
        first: Some(first),
        inner: stream,
        _permit: permit,
    });
    Ok(response)
}

fn apply_headers(
    headers: &mut HeaderMap,
    handle: &FileHandle,
    window: &Window,
    request: &FileRequest,
) -> Result<()> {
    let content_type = HeaderValue::from_str(&handle.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_MIME_TYPE));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(window.len()));
    if window.partial {
        headers.insert(
            header::CONTENT_RANGE,
            header_value(&window.content_range(handle.size))?,
        );
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    if request.download {
        headers.insert(
            header::CONTENT_DISPOSITION,
            header_value(&content_disposition(&request.name))?,
        );
    }
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Internal(format!("bad header value: {}", e)))
}

/// `attachment` with an ASCII fallback name and the exact UTF-8 name
pub(crate) fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    )
}

pub(crate) fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> IpAddr {
    if trust_forwarded {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }

    peer.map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Response body that holds the client's admission slot until it is dropped
struct AdmittedStream {
    /// Chunk already taken off `inner` before the headers went out
    first: Option<Bytes>,
    inner: ByteStream,
    _permit: AdmissionPermit,
}

impl Stream for AdmittedStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(first) = self.first.take() {
            return Poll::Ready(Some(Ok(first)));
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
