use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader, Cursor, Read};
use std::sync::Arc;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Request, Response};
use serde::de::DeserializeOwned;

use crate::hooks::{BoxFuture, ResponseHook};
use crate::{BoxError, Error, Result};

/// Default upper bound on the bytes read from one response body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Decoded response stream handed to the caller.
pub type RawBody = Box<dyn Read + Send>;
/// Decoder for an encoding this crate does not implement natively (`br`, `zstd`, ...).
pub type Decompressor = Arc<dyn Fn(RawBody) -> io::Result<RawBody> + Send + Sync>;

/// Response hook that decompresses and optionally parses the response body.
///
/// With `decompress` set, the body is decoded according to `Content-Encoding`:
/// `gzip`/`x-gzip` and `deflate` natively, anything else through a registered
/// [`Decompressor`]. Without it the body is passed through untouched, which is
/// also what happens when the transport already decoded it.
///
/// With `auto_parse` set, `application/json` bodies are decoded into
/// [`ResponseProcessor::body`] with `serde_json`, and `text/xml`/`application/xml`
/// ones with `quick-xml`. Other media types are left unparsed. When a body is
/// parsed, the stream from [`ResponseProcessor::take_raw_body`] has already been consumed.
///
/// The processor reads the response body through `&mut Response`, so the
/// response returned by the executor carries status and headers but an
/// exhausted body. Dropping the raw body and the response are independent.
///
/// At most `max_body_size` bytes are read off the wire; a longer body fails
/// with [`Error::BodyTooLarge`]. Each call to [`ResponseProcessor::process`]
/// clears what the previous one left behind, so a processor reused by `&mut`
/// only ever exposes the latest response.
pub struct ResponseProcessor<T> {
    body: Option<T>,
    raw_body: Option<RawBody>,
    decompress: bool,
    auto_parse: bool,
    max_body_size: usize,
    decompressors: HashMap<String, Decompressor>,
}

impl<T> Default for ResponseProcessor<T> {
    fn default() -> Self {
        Self {
            body: None,
            raw_body: None,
            decompress: false,
            auto_parse: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            decompressors: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for ResponseProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut algorithms: Vec<&String> = self.decompressors.keys().collect();
        algorithms.sort();
        f.debug_struct("ResponseProcessor")
            .field("decompress", &self.decompress)
            .field("auto_parse", &self.auto_parse)
            .field("max_body_size", &self.max_body_size)
            .field("decompressors", &algorithms)
            .field("body", &self.body.is_some())
            .field("raw_body", &self.raw_body.is_some())
            .finish()
    }
}

impl<T> ResponseProcessor<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decompress(mut self, decompress: bool) -> Self {
        self.decompress = decompress;
        self
    }

    pub fn auto_parse(mut self, auto_parse: bool) -> Self {
        self.auto_parse = auto_parse;
        self
    }

    /// Limit on the (still encoded) body bytes read. Zero falls back to
    /// [`DEFAULT_MAX_BODY_SIZE`].
    pub fn max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = if max_body_size == 0 {
            DEFAULT_MAX_BODY_SIZE
        } else {
            max_body_size
        };
        self
    }

    /// Registers a decoder for `algorithm` (matched case-insensitively).
    pub fn decompressor<F>(mut self, algorithm: impl AsRef<str>, decompressor: F) -> Self
    where
        F: Fn(RawBody) -> io::Result<RawBody> + Send + Sync + 'static,
    {
        self.decompressors.insert(
            algorithm.as_ref().trim().to_ascii_lowercase(),
            Arc::new(decompressor),
        );
        self
    }

    /// Parsed body, if auto-parse ran on a supported media type.
    pub fn body(&self) -> Option<&T> {
        self.body.as_ref()
    }

    pub fn take_body(&mut self) -> Option<T> {
        self.body.take()
    }

    /// Takes the (possibly decompressed) body stream.
    pub fn take_raw_body(&mut self) -> Option<RawBody> {
        self.raw_body.take()
    }

    /// Picks the decoder for `encoding` without touching the body.
    fn codec(&self, encoding: &str) -> Result<Codec> {
        match encoding {
            "" => Ok(Codec::Identity),
            "gzip" | "x-gzip" => Ok(Codec::Gzip),
            "deflate" => Ok(Codec::Deflate),
            "br" | "zstd" => self
                .decompressors
                .get(encoding)
                .cloned()
                .map(Codec::External)
                .ok_or_else(|| Error::MissingDecompressor(encoding.to_owned())),
            other => self
                .decompressors
                .get(other)
                .cloned()
                .map(Codec::External)
                .ok_or_else(|| Error::UnsupportedEncoding(other.to_owned())),
        }
    }
}

enum Codec {
    Identity,
    Gzip,
    Deflate,
    External(Decompressor),
}

impl Codec {
    fn wrap(self, bytes: Vec<u8>) -> Result<RawBody> {
        match self {
            Self::Identity => Ok(Box::new(Cursor::new(bytes))),
            Self::Gzip => {
                if !bytes.starts_with(&[0x1f, 0x8b]) {
                    return Err(Error::Decompress(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid gzip header",
                    )));
                }
                Ok(Box::new(GzDecoder::new(Cursor::new(bytes))))
            }
            Self::Deflate => {
                // Servers disagree on whether "deflate" carries the zlib wrapper.
                if has_zlib_header(&bytes) {
                    Ok(Box::new(ZlibDecoder::new(Cursor::new(bytes))))
                } else {
                    Ok(Box::new(DeflateDecoder::new(Cursor::new(bytes))))
                }
            }
            Self::External(decompressor) => {
                decompressor(Box::new(Cursor::new(bytes))).map_err(Error::Decompress)
            }
        }
    }
}

/// RFC 1950 header: CM = 8 and the check bits make CMF·256 + FLG a multiple of 31.
fn has_zlib_header(bytes: &[u8]) -> bool {
    match bytes {
        [cmf, flg, ..] => cmf & 0x0f == 8 && (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

impl<T: DeserializeOwned + Send> ResponseProcessor<T> {
    /// Processes `response`, leaving status and headers in place.
    ///
    /// Encoding errors are raised before any byte of the body is read.
    pub async fn process(&mut self, response: &mut Response) -> Result<()> {
        self.body = None;
        self.raw_body = None;

        let codec = if self.decompress {
            let encoding = header_str(response, CONTENT_ENCODING)?
                .trim()
                .to_ascii_lowercase();
            self.codec(&encoding)?
        } else {
            Codec::Identity
        };

        let media_type = if self.auto_parse {
            media_type(response)?
        } else {
            None
        };

        let bytes = read_body(response, self.max_body_size).await?;
        let mut raw = codec.wrap(bytes)?;

        if let Some(media_type) = media_type {
            match media_type.as_str() {
                "application/json" => {
                    let body = serde_json::from_reader(&mut raw)
                        .map_err(|err| Error::Decode(format!("invalid JSON body: {err}")))?;
                    self.body = Some(body);
                }
                "text/xml" | "application/xml" => {
                    let body = quick_xml::de::from_reader(BufReader::new(&mut raw))
                        .map_err(|err| Error::Decode(format!("invalid XML body: {err}")))?;
                    self.body = Some(body);
                }
                _ => {}
            }
        }

        self.raw_body = Some(raw);
        Ok(())
    }
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Result<&str> {
    match response.headers().get(&name) {
        Some(value) => value
            .to_str()
            .map_err(|_| Error::Decode(format!("{name} header is not valid ASCII"))),
        None => Ok(""),
    }
}

/// Lowercased `type/subtype` of `Content-Type`, `None` when absent.
fn media_type(response: &Response) -> Result<Option<String>> {
    let content_type = header_str(response, CONTENT_TYPE)?.trim();
    if content_type.is_empty() {
        return Ok(None);
    }
    let mime: mime::Mime = content_type
        .parse()
        .map_err(|err| Error::Decode(format!("invalid content type '{content_type}': {err}")))?;
    Ok(Some(mime.essence_str().to_ascii_lowercase()))
}

async fn read_body(response: &mut Response, limit: usize) -> Result<Vec<u8>> {
    if let Some(declared) = response.content_length() {
        let declared = usize::try_from(declared).unwrap_or(usize::MAX);
        if declared > limit {
            return Err(Error::BodyTooLarge {
                limit,
                actual: declared,
            });
        }
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(Error::transport)? {
        if bytes.len() + chunk.len() > limit {
            return Err(Error::BodyTooLarge {
                limit,
                actual: bytes.len() + chunk.len(),
            });
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

impl<T: DeserializeOwned + Send> ResponseHook for ResponseProcessor<T> {
    fn on_response<'a>(
        &'a mut self,
        _request: &'a Request,
        response: &'a mut Response,
    ) -> BoxFuture<'a, std::result::Result<(), BoxError>> {
        Box::pin(async move { self.process(response).await.map_err(BoxError::from) })
    }
}

impl<T: DeserializeOwned + Send> ResponseHook for &mut ResponseProcessor<T> {
    fn on_response<'a>(
        &'a mut self,
        request: &'a Request,
        response: &'a mut Response,
    ) -> BoxFuture<'a, std::result::Result<(), BoxError>> {
        (**self).on_response(request, response)
    }
}
