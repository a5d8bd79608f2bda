use std::io::{self, Read};

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode};

use crate::error::Error;

/// Upper bound for a decompressed body.
pub(crate) const MAX_DECODED_BODY_BYTES: usize = 256 * 1024 * 1024;

fn decode_error(encoding: &str, message: impl Into<String>) -> Error {
    Error::DecodeContentEncoding {
        encoding: encoding.to_owned(),
        message: message.into(),
    }
}

fn read_to_end_limited<R: Read>(
    reader: &mut R,
    encoding: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, Error> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 8 * 1024];

    loop {
        let read = reader
            .read(&mut chunk)
            .map_err(|error: io::Error| decode_error(encoding, error.to_string()))?;
        if read == 0 {
            break;
        }
        let next_size = decoded.len().saturating_add(read);
        if next_size > max_bytes {
            return Err(decode_error(
                encoding,
                format!("decoded body exceeds {max_bytes} bytes"),
            ));
        }
        decoded.extend_from_slice(&chunk[..read]);
    }

    Ok(decoded)
}

pub(crate) fn should_decode_content_encoded_body(
    method: &Method,
    status: StatusCode,
    body_len: usize,
) -> bool {
    if body_len == 0 {
        return false;
    }
    if *method == Method::HEAD {
        return false;
    }
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return false;
    }
    true
}

fn is_decodable_encoding(encoding: &str) -> bool {
    matches!(
        encoding.to_ascii_lowercase().as_str(),
        "identity" | "gzip" | "x-gzip" | "deflate"
    )
}

/// Whether every layer named by `Content-Encoding` can be decoded here.
pub(crate) fn has_decodable_encoding(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(CONTENT_ENCODING).and_then(|value| value.to_str().ok()) else {
        return false;
    };
    let mut layers = value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .peekable();
    layers.peek().is_some() && layers.all(is_decodable_encoding)
}

/// Decodes gzip/deflate layers in reverse order of application. Unknown
/// encodings leave the body untouched so callers still see the raw bytes.
pub(crate) fn decode_content_encoded_body(
    mut body: Bytes,
    headers: &HeaderMap,
    max_bytes: usize,
) -> Result<Bytes, Error> {
    let max_bytes = max_bytes.max(1);
    let Some(content_encoding) = headers.get(CONTENT_ENCODING) else {
        return Ok(body);
    };
    let content_encoding = content_encoding
        .to_str()
        .map_err(|error| decode_error("content-encoding", error.to_string()))?;
    let mut encodings = content_encoding
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();
    if !encodings.iter().copied().all(is_decodable_encoding) {
        return Ok(body);
    }

    while let Some(encoding) = encodings.pop() {
        let decoded = match encoding.to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => {
                let mut decoder = flate2::read::MultiGzDecoder::new(body.as_ref());
                read_to_end_limited(&mut decoder, encoding, max_bytes)?
            }
            "deflate" => {
                let mut decoder = flate2::read::ZlibDecoder::new(body.as_ref());
                read_to_end_limited(&mut decoder, encoding, max_bytes)?
            }
            _ => continue,
        };
        body = Bytes::from(decoded);
    }

    Ok(body)
}

pub(crate) fn remove_content_encoding_headers(headers: &mut HeaderMap) {
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
}
