//! Compression pipelines.
//!
//! [`CompressionStream`] and [`DecompressionStream`] wrap a mixin
//! [`TransformStream`] whose transformer runs each written chunk through
//! zlib and enqueues whatever output is ready. Closing the writable end
//! flushes the trailer.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use bytes::Bytes;
use flate2::write::{DeflateEncoder, GzDecoder, GzEncoder, ZlibEncoder};
use flate2::{Compression, Decompress, FlushDecompress, Status};
use tracing::trace;

use edge_compute_common::ScriptError;

use super::readable::ReadableStream;
use super::transform::{TransformController, TransformStream, Transformer};
use super::writable::WritableStream;

/// Output is produced in pieces of at most this many bytes per inflate call.
const INFLATE_CHUNK: usize = 16 * 1024;

/// Supported compression formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// zlib framing (RFC 1950).
    Deflate,
    /// Raw deflate without framing (RFC 1951).
    DeflateRaw,
    /// gzip framing (RFC 1952).
    Gzip,
}

impl CompressionFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deflate => "deflate",
            Self::DeflateRaw => "deflate-raw",
            Self::Gzip => "gzip",
        }
    }
}

impl FromStr for CompressionFormat {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deflate" => Ok(Self::Deflate),
            "deflate-raw" => Ok(Self::DeflateRaw),
            "gzip" => Ok(Self::Gzip),
            other => Err(ScriptError::type_error(format!(
                "'{other}' is not a supported compression format"
            ))),
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enqueue_output(controller: &TransformController, out: Vec<u8>) -> Result<(), ScriptError> {
    if out.is_empty() {
        return Ok(());
    }
    controller.enqueue(Bytes::from(out))
}

enum Encoder {
    Deflate(ZlibEncoder<Vec<u8>>),
    DeflateRaw(DeflateEncoder<Vec<u8>>),
    Gzip(GzEncoder<Vec<u8>>),
}

impl Encoder {
    fn new(format: CompressionFormat) -> Self {
        let level = Compression::default();
        match format {
            CompressionFormat::Deflate => Self::Deflate(ZlibEncoder::new(Vec::new(), level)),
            CompressionFormat::DeflateRaw => {
                Self::DeflateRaw(DeflateEncoder::new(Vec::new(), level))
            }
            CompressionFormat::Gzip => Self::Gzip(GzEncoder::new(Vec::new(), level)),
        }
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Self::Deflate(e) => e.write_all(chunk),
            Self::DeflateRaw(e) => e.write_all(chunk),
            Self::Gzip(e) => e.write_all(chunk),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        match self {
            Self::Deflate(e) => e.try_finish(),
            Self::DeflateRaw(e) => e.try_finish(),
            Self::Gzip(e) => e.try_finish(),
        }
    }

    /// Take the compressed bytes produced so far.
    fn take_output(&mut self) -> Vec<u8> {
        let out = match self {
            Self::Deflate(e) => e.get_mut(),
            Self::DeflateRaw(e) => e.get_mut(),
            Self::Gzip(e) => e.get_mut(),
        };
        std::mem::take(out)
    }
}

struct Compressor {
    encoder: Encoder,
}

impl Transformer for Compressor {
    fn transform(&mut self, chunk: Bytes, controller: &TransformController) -> Result<(), ScriptError> {
        self.encoder
            .write(&chunk)
            .map_err(|e| ScriptError::type_error(format!("CompressionStream: {e}")))?;
        enqueue_output(controller, self.encoder.take_output())
    }

    fn flush(&mut self, controller: &TransformController) -> Result<(), ScriptError> {
        self.encoder
            .finish()
            .map_err(|e| ScriptError::type_error(format!("CompressionStream: {e}")))?;
        enqueue_output(controller, self.encoder.take_output())
    }
}

fn corrupt() -> ScriptError {
    ScriptError::type_error("DecompressionStream: the compressed data is invalid")
}

fn trailing() -> ScriptError {
    ScriptError::type_error("DecompressionStream: data after the end of the compressed stream")
}

fn truncated() -> ScriptError {
    ScriptError::type_error("DecompressionStream: the compressed data ended early")
}

enum Decoder {
    /// zlib or raw deflate; `ended` once the final block was seen.
    Inflate { state: Decompress, ended: bool },
    Gzip(GzDecoder<Vec<u8>>),
}

impl Decoder {
    fn new(format: CompressionFormat) -> Self {
        match format {
            CompressionFormat::Deflate => Self::Inflate {
                state: Decompress::new(true),
                ended: false,
            },
            CompressionFormat::DeflateRaw => Self::Inflate {
                state: Decompress::new(false),
                ended: false,
            },
            CompressionFormat::Gzip => Self::Gzip(GzDecoder::new(Vec::new())),
        }
    }

    /// Decompress `input`, returning the bytes it produced.
    fn write(&mut self, input: &[u8]) -> Result<Vec<u8>, ScriptError> {
        match self {
            Self::Inflate { state, ended } => {
                if *ended {
                    return if input.is_empty() { Ok(Vec::new()) } else { Err(trailing()) };
                }
                let mut out = Vec::new();
                *ended = inflate(state, input, &mut out)?;
                Ok(out)
            }
            Self::Gzip(decoder) => {
                decoder.write_all(input).map_err(|e| match e.kind() {
                    io::ErrorKind::WriteZero => trailing(),
                    _ => corrupt(),
                })?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }

    fn finish(&mut self) -> Result<Vec<u8>, ScriptError> {
        match self {
            Self::Inflate { ended: true, .. } => Ok(Vec::new()),
            Self::Inflate { ended: false, .. } => Err(truncated()),
            Self::Gzip(decoder) => {
                decoder.try_finish().map_err(|_| truncated())?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }
}

/// Feed `input` to `state`, appending output to `out`. Returns whether the
/// end of the compressed stream was reached.
fn inflate(state: &mut Decompress, mut input: &[u8], out: &mut Vec<u8>) -> Result<bool, ScriptError> {
    loop {
        if out.capacity() - out.len() < INFLATE_CHUNK {
            out.reserve(INFLATE_CHUNK);
        }
        let (in_before, out_before) = (state.total_in(), state.total_out());
        let status = state
            .decompress_vec(input, out, FlushDecompress::None)
            .map_err(|_| corrupt())?;
        let consumed = usize::try_from(state.total_in() - in_before).map_err(|_| corrupt())?;
        input = &input[consumed..];

        if status == Status::StreamEnd {
            return if input.is_empty() { Ok(true) } else { Err(trailing()) };
        }
        if input.is_empty() && out.len() < out.capacity() {
            return Ok(false);
        }
        if consumed == 0 && state.total_out() == out_before {
            return Err(corrupt());
        }
    }
}

struct Decompressor {
    decoder: Decoder,
}

impl Transformer for Decompressor {
    fn transform(&mut self, chunk: Bytes, controller: &TransformController) -> Result<(), ScriptError> {
        let out = self.decoder.write(&chunk)?;
        enqueue_output(controller, out)
    }

    fn flush(&mut self, controller: &TransformController) -> Result<(), ScriptError> {
        let out = self.decoder.finish()?;
        enqueue_output(controller, out)
    }
}

/// Compresses bytes written to its writable end.
#[derive(Clone)]
pub struct CompressionStream {
    format: CompressionFormat,
    pipeline: TransformStream,
}

impl CompressionStream {
    pub fn new(format: CompressionFormat) -> Self {
        trace!(format = %format, "CompressionStream created");
        Self {
            format,
            pipeline: TransformStream::mixin(Compressor {
                encoder: Encoder::new(format),
            }),
        }
    }

    pub fn format(&self) -> CompressionFormat {
        self.format
    }

    pub fn readable(&self) -> ReadableStream {
        self.pipeline.readable()
    }

    pub fn writable(&self) -> WritableStream {
        self.pipeline.writable()
    }
}

impl fmt::Debug for CompressionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionStream")
            .field("format", &self.format)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// Decompresses bytes written to its writable end. Corrupt, truncated or
/// trailing input errors both ends with a `TypeError`.
#[derive(Clone)]
pub struct DecompressionStream {
    format: CompressionFormat,
    pipeline: TransformStream,
}

impl DecompressionStream {
    pub fn new(format: CompressionFormat) -> Self {
        trace!(format = %format, "DecompressionStream created");
        Self {
            format,
            pipeline: TransformStream::mixin(Decompressor {
                decoder: Decoder::new(format),
            }),
        }
    }

    pub fn format(&self) -> CompressionFormat {
        self.format
    }

    pub fn readable(&self) -> ReadableStream {
        self.pipeline.readable()
    }

    pub fn writable(&self) -> WritableStream {
        self.pipeline.writable()
    }
}

impl fmt::Debug for DecompressionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecompressionStream")
            .field("format", &self.format)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMATS: [CompressionFormat; 3] = [
        CompressionFormat::Deflate,
        CompressionFormat::DeflateRaw,
        CompressionFormat::Gzip,
    ];

    /// Write `chunks` and close, reading everything the readable end yields.
    fn pipe(
        writable: &WritableStream,
        readable: &ReadableStream,
        chunks: &[&[u8]],
    ) -> Result<Vec<u8>, ScriptError> {
        let writer = writable.get_writer()?;
        let reader = readable.get_reader()?;
        let mut out = Vec::new();
        let mut pending = None;
        // Returns whether the readable end closed.
        let mut drain = |out: &mut Vec<u8>| -> Result<bool, ScriptError> {
            loop {
                let read = pending.take().unwrap_or_else(|| reader.read());
                match read.result() {
                    Some(Ok(Some(chunk))) => out.extend_from_slice(&chunk),
                    Some(Ok(None)) => return Ok(true),
                    Some(Err(e)) => return Err(e),
                    None => {
                        pending = Some(read);
                        return Ok(false);
                    }
                }
            }
        };
        for chunk in chunks {
            let _ = writer.write(Bytes::copy_from_slice(chunk));
            drain(&mut out)?;
        }
        let _ = writer.close();
        assert!(drain(&mut out)?, "readable end did not close");
        Ok(out)
    }

    fn compress(format: CompressionFormat, chunks: &[&[u8]]) -> Vec<u8> {
        let stream = CompressionStream::new(format);
        pipe(&stream.writable(), &stream.readable(), chunks).unwrap()
    }

    fn decompress(format: CompressionFormat, chunks: &[&[u8]]) -> Result<Vec<u8>, ScriptError> {
        let stream = DecompressionStream::new(format);
        pipe(&stream.writable(), &stream.readable(), chunks)
    }

    #[test]
    fn test_format_names() {
        for format in FORMATS {
            assert_eq!(format.as_str().parse::<CompressionFormat>().unwrap(), format);
        }
        let err = "br".parse::<CompressionFormat>().unwrap_err();
        assert!(err.is_type_error());
    }

    #[test]
    fn test_compress_then_decompress_in_pieces() {
        let text = "edge compute ".repeat(500);
        for format in FORMATS {
            let compressed = compress(format, &[&text.as_bytes()[..100], &text.as_bytes()[100..]]);
            assert!(compressed.len() < text.len(), "{format} should shrink repetitive input");

            let pieces: Vec<&[u8]> = compressed.chunks(7).collect();
            let restored = decompress(format, &pieces).unwrap();
            assert_eq!(restored, text.as_bytes(), "{format}");
        }
    }

    #[test]
    fn test_gzip_output_has_magic_bytes() {
        let compressed = compress(CompressionFormat::Gzip, &[b"hello"]);
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_corrupt_input_errors() {
        for format in FORMATS {
            let err = decompress(format, &[b"definitely not compressed data"]).unwrap_err();
            assert!(err.is_type_error(), "{format}");
        }
    }

    #[test]
    fn test_truncated_input_errors() {
        for format in FORMATS {
            let compressed = compress(format, &[b"some text that will be cut short"]);
            let cut = &compressed[..compressed.len() - 4];
            let err = decompress(format, &[cut]).unwrap_err();
            assert!(err.is_type_error(), "{format}");
        }
    }

    #[test]
    fn test_trailing_data_errors() {
        let mut compressed = compress(CompressionFormat::Deflate, &[b"payload"]);
        compressed.extend_from_slice(b"junk");
        let err = decompress(CompressionFormat::Deflate, &[&compressed]).unwrap_err();
        assert_eq!(err, trailing());
    }

    #[test]
    fn test_pipelines_are_mixins() {
        assert!(CompressionStream::new(CompressionFormat::Gzip).pipeline.is_used_as_mixin());
        assert!(DecompressionStream::new(CompressionFormat::Gzip).pipeline.is_used_as_mixin());
    }
}
