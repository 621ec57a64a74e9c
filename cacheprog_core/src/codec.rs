//! Framing of requests and responses on the byte streams.
//!
//! Input is a sequence of JSON values with no delimiter requirements. A `put`
//! with a positive `BodySize` is followed by one more value: a base64 string
//! holding exactly that many bytes. Output is one JSON value per line.

use crate::error::{Error, Result};
use crate::hash::decode_base64;
use crate::protocol::{Request, Response};
use serde_json::de::IoRead;
use serde_json::{Deserializer, StreamDeserializer, Value};
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::{Mutex, PoisonError};

/// Reads requests from the input stream.
///
/// Not safe for concurrent use; the dispatcher decodes one request at a time.
pub struct Decoder<R: Read> {
    values: StreamDeserializer<'static, IoRead<BufReader<R>>, Value>,
}

impl<R: Read> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            values: Deserializer::from_reader(BufReader::new(reader)).into_iter(),
        }
    }

    /// Decode the next request, including its body.
    ///
    /// Returns `Ok(None)` at a clean end of stream. Any error leaves the
    /// stream misaligned and ends the session.
    pub fn decode(&mut self) -> Result<Option<Request>> {
        let Some(value) = self.next_value()? else {
            return Ok(None);
        };
        let mut request: Request = serde_json::from_value(value)?;

        if request.expects_body() {
            let Some(value) = self.next_value()? else {
                return Err(Error::invalid_body(format!(
                    "stream ended before body of request {}",
                    request.id
                )));
            };
            request.body = Self::body_bytes(value, request.body_size)?;
        }

        Ok(Some(request))
    }

    fn next_value(&mut self) -> Result<Option<Value>> {
        self.values.next().transpose().map_err(Error::from)
    }

    fn body_bytes(value: Value, expected: i64) -> Result<Vec<u8>> {
        let Value::String(encoded) = value else {
            return Err(Error::invalid_body(format!(
                "expected a base64 string, got {}",
                value
            )));
        };

        let body = decode_base64(&encoded)?;
        if i64::try_from(body.len()).ok() != Some(expected) {
            return Err(Error::BodySizeMismatch {
                expected,
                got: body.len(),
            });
        }
        Ok(body)
    }
}

/// Writes responses to the output stream.
///
/// Every `encode` writes and flushes a whole response while holding the lock,
/// so concurrent handlers never interleave their output.
pub struct Encoder<W: Write> {
    writer: Mutex<BufWriter<W>>,
}

impl<W: Write> Encoder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
        }
    }

    /// Write one response followed by a newline, then flush.
    ///
    /// The response is serialized before the lock is taken, so a response
    /// that fails to serialize leaves nothing behind on the stream.
    pub fn encode(&self, response: &Response) -> Result<()> {
        let mut line = serde_json::to_vec(response)?;
        line.push(b'\n');

        // One handler panicking must not silence the others
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        let writer = self.writer.into_inner().unwrap_or_else(PoisonError::into_inner);
        writer.into_inner().map_err(|e| Error::from(e.into_error()))
    }
}
