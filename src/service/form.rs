//! `multipart/form-data` ingestion for the admin upload page.
//!
//! Bodies arrive in whatever chunk sizes the socket produces, so the parser
//! is a resumable state machine over an internal buffer. Only parts carrying
//! a `filename` are persisted: each is streamed to a temp file and renamed
//! into place when the part closes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::http::{self, RequestContext};
use crate::pollable::Context;

use super::Service;

/// Receives the content of file parts as the parser uncovers them.
pub trait PartSink {
    fn open(&mut self, filename: &str) -> Result<()>;
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, PartialEq)]
enum ParseState {
    Start,
    Headers,
    Content { persist: bool },
    Done,
}

pub struct MultipartParser {
    boundary: Vec<u8>,
    buf: Vec<u8>,
    state: ParseState,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> MultipartParser {
        MultipartParser {
            boundary: boundary.as_bytes().to_vec(),
            buf: Vec::new(),
            state: ParseState::Start,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ParseState::Done
    }

    fn open_marker(&self) -> Vec<u8> {
        let mut marker = b"--".to_vec();
        marker.extend_from_slice(&self.boundary);
        marker.extend_from_slice(http::CRLF);
        marker
    }

    fn mid_marker(&self) -> Vec<u8> {
        let mut marker = http::CRLF.to_vec();
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(&self.boundary);
        marker.extend_from_slice(http::CRLF);
        marker
    }

    fn end_marker(&self) -> Vec<u8> {
        let mut marker = http::CRLF.to_vec();
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(&self.boundary);
        marker.extend_from_slice(b"--");
        marker
    }

    /// Feeds one chunk of body through the state machine.
    pub fn push(&mut self, chunk: &[u8], sink: &mut dyn PartSink) -> Result<()> {
        self.buf.extend_from_slice(chunk);

        loop {
            match self.state {
                ParseState::Start => {
                    let marker = self.open_marker();
                    match http::find(&self.buf, &marker) {
                        Some(pos) => {
                            self.buf.drain(..pos + marker.len());
                            self.state = ParseState::Headers;
                        }
                        None => {
                            // drop preamble but keep enough for a split marker
                            let keep = marker.len().saturating_sub(1);
                            if self.buf.len() > keep {
                                self.buf.drain(..self.buf.len() - keep);
                            }
                            return Ok(());
                        }
                    }
                }

                ParseState::Headers => {
                    // a part with no headers starts its content right after
                    // a lone CRLF
                    if self.buf.starts_with(http::CRLF) {
                        self.buf.drain(..http::CRLF.len());
                        self.state = ParseState::Content { persist: false };
                        continue;
                    }

                    let end = match http::find(&self.buf, http::HEADER_END) {
                        Some(end) => end,
                        None => return Ok(()),
                    };

                    let mut filename = None;
                    for line in self.buf[..end].split(|&b| b == b'\n') {
                        let line = strip_cr(line);
                        if line.is_empty() {
                            continue;
                        }
                        let (name, value) = http::parse_header_line(line)?;
                        if name == "content-disposition" {
                            filename = parse_filename(&value);
                        }
                    }

                    self.buf.drain(..end + http::HEADER_END.len());

                    match filename {
                        Some(name) => {
                            sink.open(&name)?;
                            self.state = ParseState::Content { persist: true };
                        }
                        None => {
                            self.state = ParseState::Content { persist: false };
                        }
                    }
                }

                ParseState::Content { persist } => {
                    let mid = self.mid_marker();
                    let end = self.end_marker();

                    let mid_pos = http::find(&self.buf, &mid);
                    let end_pos = http::find(&self.buf, &end);

                    match (mid_pos, end_pos) {
                        (Some(m), e) if e.map(|e| m <= e).unwrap_or(true) => {
                            if persist {
                                sink.write(&self.buf[..m])?;
                                sink.close()?;
                            }
                            self.buf.drain(..m + mid.len());
                            self.state = ParseState::Headers;
                        }
                        (Some(m), None) => {
                            if persist {
                                sink.write(&self.buf[..m])?;
                                sink.close()?;
                            }
                            self.buf.drain(..m + mid.len());
                            self.state = ParseState::Headers;
                        }
                        (_, Some(e)) => {
                            if persist {
                                sink.write(&self.buf[..e])?;
                                sink.close()?;
                            }
                            self.buf.clear();
                            self.state = ParseState::Done;
                        }
                        (None, None) => {
                            // flush what cannot be part of a split marker
                            let keep = end.len().saturating_sub(1);
                            if self.buf.len() > keep {
                                let flush = self.buf.len() - keep;
                                if persist {
                                    sink.write(&self.buf[..flush])?;
                                }
                                self.buf.drain(..flush);
                            }
                            return Ok(());
                        }
                    }
                }

                ParseState::Done => {
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn parse_filename(disposition: &str) -> Option<String> {
    for field in disposition.split(';') {
        let field = field.trim();
        if let Some(value) = field.strip_prefix("filename=") {
            let value = value.trim_matches('"');
            // keep the final path component only
            let name = Path::new(value).file_name()?.to_str()?;
            if name.is_empty() {
                return None;
            }
            return Some(name.to_string());
        }
    }
    None
}

/// Writes each part to `<base>/.upload.part` and renames on completion.
struct TempFileSink {
    base: PathBuf,
    tmp: PathBuf,
    target: Option<PathBuf>,
    file: Option<fs::File>,
}

impl TempFileSink {
    fn new(base: PathBuf) -> TempFileSink {
        let tmp = base.join(format!(".upload-{}.part", std::process::id()));
        TempFileSink {
            base,
            tmp,
            target: None,
            file: None,
        }
    }
}

impl PartSink for TempFileSink {
    fn open(&mut self, filename: &str) -> Result<()> {
        self.target = Some(self.base.join(filename));
        self.file = Some(fs::File::create(&self.tmp)?);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Some(file) = &mut self.file {
            file.write_all(data)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        if let Some(target) = self.target.take() {
            fs::rename(&self.tmp, &target)?;
            debug!("uploaded {:?}", target);
        }
        Ok(())
    }
}

/// The `/file_upload` handler.
pub struct FileFormService {
    parser: Option<MultipartParser>,
    sink: Option<TempFileSink>,
}

impl FileFormService {
    pub fn new() -> FileFormService {
        FileFormService {
            parser: None,
            sink: None,
        }
    }
}

impl Default for FileFormService {
    fn default() -> FileFormService {
        FileFormService::new()
    }
}

impl Service for FileFormService {
    fn wanted_headers(&self) -> &'static [&'static str] {
        &["Content-Type"]
    }

    fn before_content(&mut self, req: &mut RequestContext, ctx: &mut Context) -> Result<bool> {
        let content_type = req.header("content-type").unwrap_or("");

        if !content_type.contains("multipart/form-data") {
            return Err(Error::ProtocolMalformed);
        }
        let boundary = content_type
            .split("boundary=")
            .nth(1)
            .ok_or(Error::ProtocolMalformed)?
            .trim_matches('"');

        self.parser = Some(MultipartParser::new(boundary));
        self.sink = Some(TempFileSink::new(ctx.app.settings.base.clone()));
        Ok(true)
    }

    fn handle_content(
        &mut self,
        _req: &mut RequestContext,
        chunk: &[u8],
        _ctx: &mut Context,
    ) -> Result<()> {
        let parser = self
            .parser
            .as_mut()
            .ok_or_else(|| Error::Internal("form body before boundary parse".into()))?;
        let sink = self.sink.as_mut().expect("sink created with parser");

        parser.push(chunk, sink)
    }

    fn before_response_headers(&mut self, req: &mut RequestContext, _ctx: &mut Context) -> Result<bool> {
        if let Some(parser) = &self.parser {
            if !parser.is_done() {
                warn!("form body ended before its closing boundary");
                req.response_status = 400;
            }
        }

        let body: &[u8] = b"file uploaded\n";
        req.set_response_header("Content-Length", body.len());
        req.set_response_header("Content-Type", "text/plain");
        req.response_content = body.to_vec();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemorySink {
        files: Vec<(String, Vec<u8>)>,
        open: Option<(String, Vec<u8>)>,
    }

    impl PartSink for MemorySink {
        fn open(&mut self, filename: &str) -> Result<()> {
            self.open = Some((filename.to_string(), Vec::new()));
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.open.as_mut().unwrap().1.extend_from_slice(data);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.files.push(self.open.take().unwrap());
            Ok(())
        }
    }

    fn sample_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--frontier\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"note\"\r\n\r\n");
        body.extend_from_slice(b"not a file, skipped\r\n");
        body.extend_from_slice(b"--frontier\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"blob.bin\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(b"payload with \r\n embedded newlines \x00\x01\x02");
        body.extend_from_slice(b"\r\n--frontier--\r\n");
        body
    }

    #[test]
    fn whole_body_at_once() {
        let mut parser = MultipartParser::new("frontier");
        let mut sink = MemorySink::default();

        parser.push(&sample_body(), &mut sink).unwrap();

        assert!(parser.is_done());
        assert_eq!(sink.files.len(), 1);
        assert_eq!(sink.files[0].0, "blob.bin");
        assert_eq!(
            sink.files[0].1,
            b"payload with \r\n embedded newlines \x00\x01\x02".to_vec()
        );
    }

    #[test]
    fn arbitrary_chunking_gives_identical_bytes() {
        let body = sample_body();

        for chunk_size in [1, 2, 3, 5, 7, 16, 64, body.len()] {
            let mut parser = MultipartParser::new("frontier");
            let mut sink = MemorySink::default();

            for chunk in body.chunks(chunk_size) {
                parser.push(chunk, &mut sink).unwrap();
            }

            assert!(parser.is_done(), "chunk size {}", chunk_size);
            assert_eq!(sink.files.len(), 1, "chunk size {}", chunk_size);
            assert_eq!(
                sink.files[0].1,
                b"payload with \r\n embedded newlines \x00\x01\x02".to_vec(),
                "chunk size {}",
                chunk_size
            );
        }
    }

    #[test]
    fn filename_is_sanitized() {
        assert_eq!(
            parse_filename("form-data; name=\"f\"; filename=\"../../etc/passwd\""),
            Some("passwd".to_string())
        );
        assert_eq!(parse_filename("form-data; name=\"f\""), None);
    }
}
