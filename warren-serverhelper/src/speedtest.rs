//! A synthetic speed-test endpoint: streams a configurable number of
//! mebibytes of random bytes so a client can measure raw throughput
//! through the tunnel (spec §10.1). Grounded on
//! `serverhelper/speedtest.go` (original source).

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{HeaderValue, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use rand::Rng as _;

const CHUNK_SIZE: usize = 16 * 1024;
const DEFAULT_MEBIBYTES: u64 = 10;
const ALLOWED_MEBIBYTES: [u64; 5] = [10, 20, 30, 50, 100];

/// A streaming body of `size` mebibytes of random bytes, 16 KiB per
/// frame, generated on demand rather than buffered up front.
pub struct SpeedTestBody {
    remaining_chunks: u64,
    chunk: Bytes,
}

impl SpeedTestBody {
    #[must_use]
    pub fn new(mebibytes: u64) -> Self {
        let mut buf = vec![0u8; CHUNK_SIZE];
        rand::rng().fill(buf.as_mut_slice());
        Self {
            remaining_chunks: mebibytes * 64,
            chunk: Bytes::from(buf),
        }
    }
}

impl Body for SpeedTestBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.remaining_chunks == 0 {
            return Poll::Ready(None);
        }
        self.remaining_chunks -= 1;
        Poll::Ready(Some(Ok(Frame::data(self.chunk.clone()))))
    }

    fn is_end_stream(&self) -> bool {
        self.remaining_chunks == 0
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining_chunks * CHUNK_SIZE as u64)
    }
}

/// Parses the `size` query-string value into a mebibyte count, falling
/// back to the original's default of 10 for anything not in the allowed
/// set (including a missing or malformed value).
#[must_use]
pub fn parse_size(query: Option<&str>) -> u64 {
    let Some(query) = query else {
        return DEFAULT_MEBIBYTES;
    };
    let requested = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("size="))
        .and_then(|v| v.parse::<u64>().ok());
    match requested {
        Some(v) if ALLOWED_MEBIBYTES.contains(&v) => v,
        _ => DEFAULT_MEBIBYTES,
    }
}

/// Builds the full speed-test response for a request's raw query string.
#[must_use]
pub fn response(query: Option<&str>) -> Response<SpeedTestBody> {
    let size = parse_size(query);
    let body = SpeedTestBody::new(size);
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::OK;
    let headers = resp.headers_mut();
    headers.insert(
        http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, max-age=0"),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(size * 1024 * 1024));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_ten_mebibytes() {
        assert_eq!(parse_size(None), 10);
        assert_eq!(parse_size(Some("")), 10);
        assert_eq!(parse_size(Some("size=7")), 10);
    }

    #[test]
    fn accepts_allowed_sizes() {
        assert_eq!(parse_size(Some("size=50")), 50);
        assert_eq!(parse_size(Some("foo=bar&size=100")), 100);
    }

    #[tokio::test]
    async fn body_yields_the_right_number_of_chunks_and_bytes() {
        use http_body_util::BodyExt;

        let mut body = SpeedTestBody::new(1);
        let mut total = 0usize;
        while let Some(frame) = body.frame().await {
            let frame = frame.unwrap();
            total += frame.into_data().unwrap().len();
        }
        assert_eq!(total, 1024 * 1024);
    }
}
