use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::{Body, Response, StatusCode};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

/// Bytes counted for every header line terminator. Output using bare `\n`
/// line endings is mis-framed by one byte per header line.
pub const LINE_TERMINATOR_BYTES: u64 = 2;

/// Header block and body of a script or FastCGI backend response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiResponse {
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CgiResponse {
    pub fn status_code(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Build the outbound response. Headers hyper cannot represent are logged
    /// and dropped; `Content-Length` always reflects the body. A reason phrase
    /// from the `Status` line replaces the canonical one on HTTP/1.
    pub fn into_response(self) -> Result<Response<Body>> {
        let status = StatusCode::from_u16(self.status_code())
            .with_context(|| format!("invalid status code {}", self.status_code()))?;
        let mut response = Response::builder().status(status).body(Body::empty())?;
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            let parsed = HeaderName::from_bytes(name.trim().as_bytes())
                .ok()
                .zip(HeaderValue::from_str(value).ok());
            match parsed {
                Some((name, value)) => {
                    headers.append(name, value);
                }
                None => tracing::warn!(header = %name, "dropping invalid response header"),
            }
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        let reason = self.reason.as_deref().map(str::trim);
        if let Some(reason) = reason.filter(|r| !r.is_empty()) {
            match ReasonPhrase::try_from(reason.as_bytes()) {
                Ok(phrase) => {
                    response.extensions_mut().insert(phrase);
                }
                Err(_) => tracing::warn!(reason = %reason, "dropping invalid reason phrase"),
            }
        }
        *response.body_mut() = Body::from(self.body);
        Ok(response)
    }
}

/// Parse CGI output: header lines up to the first blank line, then the body.
///
/// Header lines are `Status: <code> [reason]` (key case-insensitive) or
/// `Name: value`. The body starts at the offset computed by counting every
/// line as its text plus [`LINE_TERMINATOR_BYTES`], and runs to the end of
/// the stream. Without a blank line the body is empty.
pub fn parse_cgi_output<S: Read + Seek>(stream: &mut S) -> Result<CgiResponse> {
    let mut response = CgiResponse::default();
    let mut offset = 0u64;
    let mut body_offset = None;

    {
        let mut reader = BufReader::new(&mut *stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            let line = trim_line_end(&raw);
            offset += line.len() as u64 + LINE_TERMINATOR_BYTES;
            if line.is_empty() {
                body_offset = Some(offset);
                break;
            }
            let line = String::from_utf8_lossy(line);
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.eq_ignore_ascii_case("status") {
                let value = value.trim_start_matches(' ');
                let (code, reason) = match value.split_once(' ') {
                    Some((code, reason)) => (code, Some(reason.to_string())),
                    None => (value, None),
                };
                let code = code
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| anyhow!("invalid Status header: {}", line))?;
                response.status = Some(code);
                response.reason = reason;
            } else {
                response
                    .headers
                    .push((name.to_string(), value.trim_start_matches(' ').to_string()));
            }
        }
    }

    if let Some(start) = body_offset {
        let end = stream.seek(SeekFrom::End(0))?;
        if start < end {
            stream.seek(SeekFrom::Start(start))?;
            let mut body = Vec::with_capacity((end - start) as usize);
            stream.read_to_end(&mut body)?;
            response.body = Bytes::from(body);
        }
    }
    Ok(response)
}

fn trim_line_end(raw: &[u8]) -> &[u8] {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    line.strip_suffix(b"\r").unwrap_or(line)
}
