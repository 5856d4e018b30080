//! Binary framing for HTTP requests and responses carried over a websocket.
//!
//! ```text
//! 3GPP-WS-Notif-Seq: <4 bytes big-endian>\r\n
//! <code> <reason>\r\n                          (responses only)
//! Content-Type: <value>\r\n
//! Content-Encoding: <value>\r\n                (optional)
//! Content-Length: <value>\r\n
//! \r\n
//! <body>
//! ```
//!
//! The body is not delimited; its length comes from `Content-Length`.

use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};

use crate::errors::{NotifyError, Result};

pub const SEQ_TAG: &[u8] = b"3GPP-WS-Notif-Seq: ";
const EOL: &[u8] = b"\r\n";

/// Encode `req` into a request frame tagged with `seq`.
pub fn encode_request(req: &Request<Vec<u8>>, seq: u32) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(SEQ_TAG.len() + 64 + req.body().len());
    put_sequence(&mut frame, seq);
    put_headers_and_body(&mut frame, req.headers(), req.body())?;
    Ok(frame)
}

/// Encode `resp` into a response frame tagged with `seq`.
pub fn encode_response(resp: &Response<Vec<u8>>, seq: u32) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(SEQ_TAG.len() + 96 + resp.body().len());
    put_sequence(&mut frame, seq);
    put_status(&mut frame, resp.status());
    put_headers_and_body(&mut frame, resp.headers(), resp.body())?;
    Ok(frame)
}

/// Decode a request frame. Returns the sequence number and a POST request.
pub fn decode_request(data: &[u8]) -> Result<(u32, Request<Vec<u8>>)> {
    let mut cur = Cursor::new(data);
    let seq = cur.read_sequence()?;
    let headers = cur.read_headers()?;
    let body = cur.read_body(&headers)?;

    let mut req = Request::new(body);
    *req.method_mut() = Method::POST;
    *req.headers_mut() = headers;
    Ok((seq, req))
}

/// Decode a response frame. Returns the sequence number and the response.
pub fn decode_response(data: &[u8]) -> Result<(u32, Response<Vec<u8>>)> {
    let mut cur = Cursor::new(data);
    let seq = cur.read_sequence()?;
    let status = cur.read_status()?;
    let headers = cur.read_headers()?;
    let body = cur.read_body(&headers)?;

    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    Ok((seq, resp))
}

fn put_sequence(frame: &mut Vec<u8>, seq: u32) {
    frame.extend_from_slice(SEQ_TAG);
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(EOL);
}

fn put_status(frame: &mut Vec<u8>, status: StatusCode) {
    let reason = status.canonical_reason().unwrap_or("");
    frame.extend_from_slice(format!("{} {}", status.as_u16(), reason).as_bytes());
    frame.extend_from_slice(EOL);
}

fn put_header(frame: &mut Vec<u8>, name: &str, value: &str) {
    frame.extend_from_slice(name.as_bytes());
    frame.extend_from_slice(b": ");
    frame.extend_from_slice(value.as_bytes());
    frame.extend_from_slice(EOL);
}

fn put_headers_and_body(frame: &mut Vec<u8>, headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let content_type =
        header_str(headers, &CONTENT_TYPE).ok_or(NotifyError::MissingHeader("Content-Type"))?;
    let content_encoding = header_str(headers, &CONTENT_ENCODING);

    // No Content-Length means no body on the wire.
    let (content_length, payload) = match header_str(headers, &CONTENT_LENGTH) {
        Some(len) => (len, body),
        None => ("0", &[][..]),
    };

    put_header(frame, "Content-Type", content_type);
    if let Some(encoding) = content_encoding {
        put_header(frame, "Content-Encoding", encoding);
    }
    put_header(frame, "Content-Length", content_length);
    frame.extend_from_slice(EOL);
    frame.extend_from_slice(payload);
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn malformed(detail: impl Into<String>) -> NotifyError {
    NotifyError::MalformedFrame(detail.into())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Next CRLF-terminated line, without the terminator.
    fn line(&mut self, what: &str) -> Result<&'a [u8]> {
        let rest = self.remaining();
        let end = rest
            .windows(EOL.len())
            .position(|w| w == EOL)
            .ok_or_else(|| malformed(format!("missing {what}")))?;
        self.pos += end + EOL.len();
        Ok(&rest[..end])
    }

    // Positional: the four sequence bytes may themselves contain CR or LF.
    fn read_sequence(&mut self) -> Result<u32> {
        let rest = self.remaining();
        let seq_end = SEQ_TAG.len() + 4;
        if rest.len() < seq_end + EOL.len() {
            return Err(malformed("missing sequence line"));
        }
        if &rest[..SEQ_TAG.len()] != SEQ_TAG {
            return Err(malformed(format!(
                "invalid sequence string: {}",
                String::from_utf8_lossy(&rest[..SEQ_TAG.len()])
            )));
        }
        if &rest[seq_end..seq_end + EOL.len()] != EOL {
            return Err(malformed("missing sequence number"));
        }

        let mut seq = [0u8; 4];
        seq.copy_from_slice(&rest[SEQ_TAG.len()..seq_end]);
        self.pos += seq_end + EOL.len();
        Ok(u32::from_be_bytes(seq))
    }

    fn read_status(&mut self) -> Result<StatusCode> {
        let line = self.line("status line")?;
        let line = std::str::from_utf8(line).map_err(|_| malformed("invalid status line format"))?;
        let (code, _reason) = line
            .split_once(' ')
            .ok_or_else(|| malformed("invalid status line format"))?;

        code.parse::<u16>()
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .filter(|s| s.canonical_reason().is_some())
            .ok_or_else(|| malformed(format!("invalid status code: {code}")))
    }

    fn read_headers(&mut self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        loop {
            let line = self.line("headers section")?;
            if line.is_empty() {
                break;
            }
            let text = std::str::from_utf8(line)
                .map_err(|_| malformed("invalid header line encoding"))?;
            let (name, value) = text
                .split_once(": ")
                .ok_or_else(|| malformed(format!("invalid header line: {text}")))?;
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| malformed(format!("invalid header name: {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| malformed(format!("invalid header value: {value}")))?;
            headers.append(name, value);
        }

        if !headers.contains_key(CONTENT_TYPE) {
            return Err(malformed("missing header: Content-Type"));
        }
        if !headers.contains_key(CONTENT_LENGTH) {
            return Err(malformed("missing header: Content-Length"));
        }
        Ok(headers)
    }

    fn read_body(&mut self, headers: &HeaderMap) -> Result<Vec<u8>> {
        let raw = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let len: usize = raw
            .trim()
            .parse()
            .map_err(|_| malformed(format!("invalid content length: {raw}")))?;

        let rest = self.remaining();
        if rest.len() < len {
            return Err(malformed(format!(
                "payload shorter than content length ({} < {len})",
                rest.len()
            )));
        }
        self.pos += len;
        Ok(rest[..len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &[u8]) -> Request<Vec<u8>> {
        Request::builder()
            .method(Method::POST)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, body.len().to_string())
            .body(body.to_vec())
            .unwrap()
    }

    fn response(status: StatusCode, body: &[u8]) -> Response<Vec<u8>> {
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, body.len().to_string())
            .body(body.to_vec())
            .unwrap()
    }

    #[test]
    fn request_frame_layout() {
        let frame = encode_request(&request(b"{\"a\":1}"), 0x0102_0304).unwrap();

        let mut expected = b"3GPP-WS-Notif-Seq: ".to_vec();
        expected.extend_from_slice(&[1, 2, 3, 4]);
        expected.extend_from_slice(
            b"\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}",
        );
        assert_eq!(frame, expected);
    }

    #[test]
    fn response_frame_has_status_line() {
        let frame = encode_response(&response(StatusCode::NO_CONTENT, b""), 7).unwrap();
        let text = String::from_utf8_lossy(&frame[SEQ_TAG.len() + 6..]).to_string();
        assert!(text.starts_with("204 No Content\r\nContent-Type: application/json\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn request_survives_encode_decode() {
        let mut req = request(b"payload bytes");
        req.headers_mut()
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let frame = encode_request(&req, 42).unwrap();
        let (seq, decoded) = decode_request(&frame).unwrap();

        assert_eq!(seq, 42);
        assert_eq!(decoded.method(), Method::POST);
        assert_eq!(decoded.headers(), req.headers());
        assert_eq!(decoded.body(), req.body());
    }

    #[test]
    fn response_survives_encode_decode() {
        let resp = response(StatusCode::BAD_REQUEST, b"{\"error\":\"nope\"}");
        let frame = encode_response(&resp, u32::MAX).unwrap();
        let (seq, decoded) = decode_response(&frame).unwrap();

        assert_eq!(seq, u32::MAX);
        assert_eq!(decoded.status(), StatusCode::BAD_REQUEST);
        assert_eq!(decoded.headers(), resp.headers());
        assert_eq!(decoded.body(), resp.body());
    }

    #[test]
    fn sequence_bytes_may_contain_crlf() {
        let seq = u32::from_be_bytes(*b"\r\n\r\n");
        let frame = encode_response(&response(StatusCode::NO_CONTENT, b""), seq).unwrap();
        let (decoded, _) = decode_response(&frame).unwrap();
        assert_eq!(decoded, seq);
    }

    #[test]
    fn missing_content_length_encodes_empty_body() {
        let req = Request::builder()
            .header(CONTENT_TYPE, "text/plain")
            .body(b"ignored".to_vec())
            .unwrap();
        let frame = encode_request(&req, 1).unwrap();
        let (_, decoded) = decode_request(&frame).unwrap();
        assert_eq!(decoded.headers()[CONTENT_LENGTH], "0");
        assert!(decoded.body().is_empty());
    }

    #[test]
    fn encode_requires_content_type() {
        let req = Request::builder().body(Vec::new()).unwrap();
        assert!(matches!(
            encode_request(&req, 1),
            Err(NotifyError::MissingHeader("Content-Type"))
        ));
    }

    fn raw_frame(seq: u32, rest: &[u8]) -> Vec<u8> {
        let mut frame = SEQ_TAG.to_vec();
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(EOL);
        frame.extend_from_slice(rest);
        frame
    }

    #[test]
    fn decode_rejects_missing_mandatory_headers() {
        let no_type = raw_frame(1, b"204 No Content\r\nContent-Length: 0\r\n\r\n");
        let no_len = raw_frame(1, b"204 No Content\r\nContent-Type: text/plain\r\n\r\n");

        for frame in [no_type, no_len] {
            assert!(matches!(
                decode_response(&frame),
                Err(NotifyError::MalformedFrame(_))
            ));
        }
    }

    #[test]
    fn decode_rejects_bad_sequence_tag() {
        let mut frame = raw_frame(1, b"Content-Type: a\r\nContent-Length: 0\r\n\r\n");
        frame[0] = b'4';
        assert!(matches!(
            decode_request(&frame),
            Err(NotifyError::MalformedFrame(_))
        ));
        assert!(decode_request(b"3GPP").is_err());
    }

    #[test]
    fn decode_rejects_unknown_status_code() {
        let frame = raw_frame(
            1,
            b"999 Whatever\r\nContent-Type: a\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(matches!(
            decode_response(&frame),
            Err(NotifyError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_honours_content_length() {
        let long = raw_frame(1, b"Content-Type: a\r\nContent-Length: 3\r\n\r\nabcdef");
        let (_, req) = decode_request(&long).unwrap();
        assert_eq!(req.body(), b"abc");

        let short = raw_frame(1, b"Content-Type: a\r\nContent-Length: 9\r\n\r\nabc");
        assert!(decode_request(&short).is_err());

        let bogus = raw_frame(1, b"Content-Type: a\r\nContent-Length: x\r\n\r\n");
        assert!(decode_request(&bogus).is_err());
    }

    #[test]
    fn decode_rejects_header_without_separator() {
        let frame = raw_frame(1, b"Content-Type application/json\r\n\r\n");
        assert!(matches!(
            decode_request(&frame),
            Err(NotifyError::MalformedFrame(_))
        ));
    }
}
