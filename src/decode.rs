use chardetng::EncodingDetector;
use encoding_rs::{Decoder, DecoderResult, Encoding};
use std::io::{self, Read};
use thiserror::Error;

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read source: {0}")]
    Io(#[from] io::Error),
}

/// Raised through `io::Error` (kind `InvalidData`) when the stream is not valid
/// in the detected encoding.
#[derive(Debug, Error)]
#[error("malformed {encoding} input")]
pub struct MalformedInput {
    pub encoding: &'static str,
}

pub fn is_malformed_input(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidData
        && err
            .get_ref()
            .is_some_and(|inner| inner.is::<MalformedInput>())
}

/// Detect the encoding of a byte stream: BOM first, chardetng over the whole stream otherwise.
pub fn detect_encoding<R: Read>(mut reader: R) -> Result<&'static Encoding, DecodeError> {
    let mut detector = EncodingDetector::new();
    let mut head: Vec<u8> = Vec::with_capacity(3);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if head.len() < 3 {
            let missing = 3 - head.len();
            head.extend_from_slice(&buf[..read.min(missing)]);
        }
        detector.feed(&buf[..read], false);
    }
    detector.feed(&[], true);

    if let Some((encoding, _)) = Encoding::for_bom(&head) {
        return Ok(encoding);
    }
    Ok(detector.guess(None, true))
}

/// Incrementally decodes a byte stream into UTF-8.
///
/// A leading BOM is removed. Malformed input surfaces as an `InvalidData` error
/// wrapping [`MalformedInput`]; nothing is replaced.
pub struct DecodingReader<R> {
    inner: R,
    encoding: &'static Encoding,
    decoder: Decoder,
    input: Vec<u8>,
    input_pos: usize,
    input_len: usize,
    output: Vec<u8>,
    output_pos: usize,
    output_len: usize,
    eof: bool,
    finished: bool,
}

impl<R: Read> DecodingReader<R> {
    pub fn new(inner: R, encoding: &'static Encoding) -> Self {
        Self {
            inner,
            encoding,
            decoder: encoding.new_decoder_with_bom_removal(),
            input: vec![0u8; CHUNK_SIZE],
            input_pos: 0,
            input_len: 0,
            output: vec![0u8; CHUNK_SIZE * 3],
            output_pos: 0,
            output_len: 0,
            eof: false,
            finished: false,
        }
    }

    fn fill_input(&mut self) -> io::Result<()> {
        loop {
            match self.inner.read(&mut self.input) {
                Ok(read) => {
                    self.input_pos = 0;
                    self.input_len = read;
                    self.eof = read == 0;
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

impl<R: Read> Read for DecodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.output_pos < self.output_len {
                let count = buf.len().min(self.output_len - self.output_pos);
                buf[..count]
                    .copy_from_slice(&self.output[self.output_pos..self.output_pos + count]);
                self.output_pos += count;
                return Ok(count);
            }
            if self.finished {
                return Ok(0);
            }
            if self.input_pos == self.input_len && !self.eof {
                self.fill_input()?;
            }

            let last = self.eof;
            let (result, read, written) = self.decoder.decode_to_utf8_without_replacement(
                &self.input[self.input_pos..self.input_len],
                &mut self.output,
                last,
            );
            self.input_pos += read;
            self.output_pos = 0;
            self.output_len = written;

            match result {
                DecoderResult::InputEmpty => {
                    if last {
                        self.finished = true;
                    }
                }
                DecoderResult::OutputFull => {}
                DecoderResult::Malformed(_, _) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        MalformedInput {
                            encoding: self.encoding.name(),
                        },
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_8, WINDOWS_1252};
    use std::io::Cursor;

    fn decode_all(bytes: &[u8], encoding: &'static Encoding) -> io::Result<String> {
        let mut out = String::new();
        DecodingReader::new(Cursor::new(bytes.to_vec()), encoding).read_to_string(&mut out)?;
        Ok(out)
    }

    #[test]
    fn bom_wins_over_detection() {
        let bytes = b"\xEF\xBB\xBF\xE2\x82\xAC;title\n";
        assert_eq!(detect_encoding(Cursor::new(bytes)).unwrap(), UTF_8);
    }

    #[test]
    fn detects_utf8_without_bom() {
        let text = "€;title\n;Grüner Tee aus fairem Handel, schön verpackt\n";
        assert_eq!(detect_encoding(Cursor::new(text.as_bytes())).unwrap(), UTF_8);
    }

    #[test]
    fn detects_a_legacy_encoding_that_round_trips() {
        let text = "€;title\n;Grüner Tee für Bücherwürmer, schön verpackt\n";
        let (bytes, _, _) = WINDOWS_1252.encode(text);
        let detected = detect_encoding(Cursor::new(bytes.to_vec())).unwrap();
        assert_ne!(detected, UTF_8);
        assert_eq!(decode_all(&bytes, detected).unwrap(), text);
    }

    #[test]
    fn decoding_strips_bom_and_transcodes() {
        let out = decode_all(b"\xEF\xBB\xBFa;b\n", UTF_8).unwrap();
        assert_eq!(out, "a;b\n");

        let (bytes, _, _) = WINDOWS_1252.encode("€;Grüße");
        let out = decode_all(&bytes, WINDOWS_1252).unwrap();
        assert_eq!(out, "€;Grüße");
    }

    #[test]
    fn malformed_utf8_is_invalid_data() {
        let err = decode_all(b"\xEF\xBB\xBFok;\xFF\xFE;bad\n", UTF_8).unwrap_err();
        assert!(is_malformed_input(&err));
    }

    #[test]
    fn decodes_streams_larger_than_one_chunk() {
        let line = "Grüner Tee;Beschreibung mit Umlauten äöü\n";
        let text = line.repeat(2_000);
        let out = decode_all(text.as_bytes(), UTF_8).unwrap();
        assert_eq!(out.len(), text.len());
    }
}
