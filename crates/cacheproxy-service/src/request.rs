//! The subset of HTTP/1.0 spoken with clients.

use std::str;

use thiserror::Error;

/// The parts of an HTTP request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub version: &'a str,
}

/// Why a request line could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request line is not terminated")]
    Unterminated,
    #[error("request line has no method separator")]
    MissingMethod,
    #[error("request line has no version separator")]
    MissingVersion,
    #[error("request line is not valid utf-8")]
    InvalidEncoding,
}

impl<'a> RequestLine<'a> {
    /// Parses the request line at the start of `buf`.
    ///
    /// The line ends at the first `\r\n` or `\n`. Within it, the method ends at the first space and
    /// the URL at the second. Everything after the line, such as headers, is ignored.
    pub fn parse(buf: &'a [u8]) -> Result<Self, RequestError> {
        let end = buf
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(RequestError::Unterminated)?;
        let line = &buf[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = str::from_utf8(line).map_err(|_| RequestError::InvalidEncoding)?;

        let (method, rest) = line.split_once(' ').ok_or(RequestError::MissingMethod)?;
        let (url, version) = rest.split_once(' ').ok_or(RequestError::MissingVersion)?;

        Ok(Self {
            method,
            url,
            version,
        })
    }
}

/// The error responses sent to clients. None of them has a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    BadRequest,
    MethodNotAllowed,
    InternalServerError,
    BadGateway,
}

impl Status {
    /// The complete response written to the client.
    pub fn response(&self) -> &'static [u8] {
        match self {
            Status::BadRequest => b"HTTP/1.0 400 Bad Request\r\n\r\n",
            Status::MethodNotAllowed => b"HTTP/1.0 405 Method Not Allowed\r\n\r\n",
            Status::InternalServerError => b"HTTP/1.0 500 Internal Server Error\r\n\r\n",
            Status::BadGateway => b"HTTP/1.0 502 Bad Gateway\r\n\r\n",
        }
    }
}
