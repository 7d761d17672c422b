//! Multipart form upload filter
//!
//! Parses a `multipart/form-data` request body as it arrives. Plain fields
//! become form variables, file parts are streamed into temporary files in
//! the location's upload directory and listed in `Request::files`. Nothing
//! of the multipart body reaches the handler except the end packet.
use std::cmp::min;
use std::io::Write;
use std::mem;
use std::path::Path;

use percent_encoding::percent_decode;
use tempfile::{Builder, NamedTempFile};

use crate::config::Location;
use crate::error::Error;
use crate::packet::Packet;
use crate::queue::Ctx;
use crate::request::{Request, UploadFile};
use crate::stage::{Stage, StageKind, default_incoming_data};


/// Longest line accepted in a part header
const MAX_PART_HEADER: usize = 8192;

pub struct UploadFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting a boundary line
    Boundary,
    /// Reading part headers
    ContentHeader,
    /// Reading part data up to the next boundary
    ContentData,
    /// Final boundary seen, the rest is ignored
    ContentEnd,
}

#[derive(Default)]
struct Part {
    name: String,
    client_filename: Option<String>,
    content_type: Option<String>,
    file: Option<NamedTempFile>,
    value: Vec<u8>,
    size: u64,
}

struct Upload {
    state: State,
    /// Boundary line, including the leading dashes
    boundary: Vec<u8>,
    buf: Vec<u8>,
    part: Part,
    max_upload: u64,
}

/// Extracts the boundary from the `Content-Type` of a form upload
fn boundary(content_type: &str) -> Option<String> {
    let mut items = content_type.split(';');
    let mime = items.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    items
        .filter_map(|item| {
            let mut pair = item.splitn(2, '=');
            let name = pair.next()?.trim();
            let value = pair.next()?.trim().trim_matches('"');
            if name.eq_ignore_ascii_case("boundary") && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        })
        .next()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Value of a `name="value"` parameter of the `Content-Disposition` header
fn disposition_param(value: &str, param: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|item| {
        let mut pair = item.splitn(2, '=');
        let name = pair.next()?.trim();
        if !name.eq_ignore_ascii_case(param) {
            return None;
        }
        Some(pair.next()?.trim().trim_matches('"').to_string())
    })
}

/// Strips directories some clients send in the file name
fn base_name(filename: &str) -> &str {
    filename.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(filename)
}

impl Upload {
    fn new(boundary: &str, max_upload: u64) -> Upload {
        Upload {
            state: State::Boundary,
            boundary: format!("--{}", boundary).into_bytes(),
            buf: Vec::new(),
            part: Part::default(),
            max_upload,
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = find(&self.buf, b"\r\n")?;
        let line = self.buf[..pos].to_vec();
        self.buf.drain(..pos+2);
        Some(line)
    }

    /// Consumes as much of the buffer as possible
    fn process(&mut self, req: &mut Request, dir: &Path) -> Result<(), Error> {
        loop {
            match self.state {
                State::Boundary => {
                    let line = match self.take_line() {
                        Some(line) => line,
                        None if self.buf.len() > self.boundary.len() + 4 => {
                            return Err(Error::BadUpload("Bad boundary"));
                        }
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        continue;
                    }
                    if line == self.boundary {
                        self.state = State::ContentHeader;
                    } else if line.starts_with(&self.boundary)
                        && &line[self.boundary.len()..] == b"--"
                    {
                        self.state = State::ContentEnd;
                    } else {
                        return Err(Error::BadUpload("Bad boundary"));
                    }
                }
                State::ContentHeader => {
                    let line = match self.take_line() {
                        Some(line) => line,
                        None if self.buf.len() > MAX_PART_HEADER => {
                            return Err(Error::BadUpload("Header too long"));
                        }
                        None => return Ok(()),
                    };
                    if line.is_empty() {
                        self.start_data(dir)?;
                    } else {
                        self.part_header(&String::from_utf8_lossy(&line))?;
                    }
                }
                State::ContentData => {
                    let mut delimiter = b"\r\n".to_vec();
                    delimiter.extend(&self.boundary);
                    match find(&self.buf, &delimiter) {
                        Some(pos) => {
                            let data: Vec<u8> = self.buf.drain(..pos).collect();
                            self.write_data(&data)?;
                            // boundary line is matched in the next state
                            self.buf.drain(..2);
                            self.finish_part(req)?;
                            self.state = State::Boundary;
                        }
                        None => {
                            // the delimiter may start in this buffer
                            let keep = min(self.buf.len(), delimiter.len() - 1);
                            let end = self.buf.len() - keep;
                            let data: Vec<u8> = self.buf.drain(..end).collect();
                            self.write_data(&data)?;
                            return Ok(());
                        }
                    }
                }
                State::ContentEnd => {
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }

    fn part_header(&mut self, line: &str) -> Result<(), Error> {
        let mut pair = line.splitn(2, ':');
        let name = pair.next().unwrap_or("").trim();
        let value = pair.next()
            .ok_or(Error::BadUpload("Bad part header"))?
            .trim();
        if name.eq_ignore_ascii_case("Content-Disposition") {
            let kind = value.split(';').next().unwrap_or("").trim();
            if !kind.eq_ignore_ascii_case("form-data") {
                return Err(Error::BadUpload("Bad content disposition"));
            }
            self.part.name = disposition_param(value, "name")
                .ok_or(Error::BadUpload("Missing field name"))?;
            self.part.client_filename = disposition_param(value, "filename")
                .filter(|f| !f.is_empty())
                .map(|f| base_name(&f).to_string());
        } else if name.eq_ignore_ascii_case("Content-Type") {
            self.part.content_type = Some(value.to_string());
        }
        Ok(())
    }

    fn start_data(&mut self, dir: &Path) -> Result<(), Error> {
        if self.part.name.is_empty() {
            return Err(Error::BadUpload("Missing content disposition"));
        }
        if self.part.client_filename.is_some() {
            let file = Builder::new().prefix("upload-").tempfile_in(dir)?;
            debug!("receiving upload {:?} into {:?}",
                   self.part.client_filename, file.path());
            self.part.file = Some(file);
        }
        self.state = State::ContentData;
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        self.part.size += data.len() as u64;
        match self.part.file {
            Some(ref mut file) => {
                if self.part.size > self.max_upload {
                    return Err(Error::PayloadTooLarge);
                }
                file.write_all(data)?;
            }
            None => self.part.value.extend_from_slice(data),
        }
        Ok(())
    }

    fn finish_part(&mut self, req: &mut Request) -> Result<(), Error> {
        let part = mem::take(&mut self.part);
        match (part.file, part.client_filename) {
            (Some(file), Some(client_filename)) => {
                let (_, filename) = file.keep().map_err(|e| e.error)?;
                req.form_vars.insert(part.name.clone(),
                                     client_filename.clone());
                req.files.push(UploadFile {
                    name: part.name,
                    client_filename,
                    filename,
                    content_type: part.content_type,
                    size: part.size,
                });
            }
            _ => {
                let value = percent_decode(&part.value).decode_utf8()?;
                req.form_vars.insert(part.name, value.into_owned());
            }
        }
        Ok(())
    }
}

impl Stage for UploadFilter {
    fn name(&self) -> &str {
        "uploadFilter"
    }
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }
    fn matches(&self, req: &Request, _location: &Location) -> bool {
        req.content_type.as_deref().and_then(boundary).is_some()
    }
    fn open(&self, cx: &mut Ctx) {
        let boundary = cx.req.content_type.as_deref().and_then(boundary);
        if let Some(boundary) = boundary {
            let max_upload = cx.host().limits.max_upload;
            cx.set_data(Upload::new(&boundary, max_upload));
        }
    }
    fn incoming_data(&self, cx: &mut Ctx, packet: Packet) {
        let mut upload = match cx.take_data::<Upload>() {
            Some(upload) => upload,
            None => return default_incoming_data(cx, packet),
        };
        if packet.is_end() {
            if upload.state != State::ContentEnd && !cx.req.failed {
                cx.fail_connection(400, "Client upload aborted");
            }
            cx.put_next(packet);
            cx.set_data(upload);
            return;
        }
        if cx.req.failed {
            cx.set_data(upload);
            return;
        }
        upload.buf.extend_from_slice(packet.content());
        let dir = cx.req.location.as_ref()
            .map(|loc| loc.upload_dir.clone())
            .unwrap_or_else(std::env::temp_dir);
        if let Err(e) = upload.process(cx.req, &dir) {
            debug!("upload to {} failed: {}", cx.req.url, e);
            cx.fail_with(&e);
        }
        cx.set_data(upload);
    }
}
