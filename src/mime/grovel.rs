//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Sealpost.
//
// Sealpost is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Sealpost is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Sealpost. If not, see <http://www.gnu.org/licenses/>.

use std::borrow::Cow;
use std::cell::Cell;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::rc::Rc;
use std::str;

use super::header::{self, ContentType};

/// A visitor which receives events from the push parser.
///
/// A visitor may produce its output at any step, which ends parsing at that
/// level: once a method returns `Err`, no further methods are called on that
/// visitor. `Result<(), Output>` is used instead of `Option<Output>` so that
/// `?` works and ignored results produce warnings.
///
/// Methods are declared in the order they are usually called.
#[allow(unused_variables)]
pub trait Visitor: fmt::Debug {
    type Output;

    /// Called once for every line which passes through the parser, in its raw
    /// form.
    ///
    /// `line` usually ends with "\r\n", but may end with a bare "\n" or
    /// nothing at all for binary payloads and over-long lines.
    ///
    /// Inside a multipart, the line ending of the last line before the next
    /// boundary belongs to the boundary, not to this part, yet is still
    /// included here. Use `content` where that matters.
    fn raw_line(&mut self, line: &[u8]) -> Result<(), Self::Output> {
        Ok(())
    }

    /// Called for each header found, with `name` trimmed and `value` raw.
    ///
    /// Headers which cannot be split or whose names are not UTF-8 are
    /// silently skipped.
    fn header(
        &mut self,
        raw: &[u8],
        name: &str,
        value: &[u8],
    ) -> Result<(), Self::Output> {
        Ok(())
    }

    /// Called with the parsed content type, or the implied default if the
    /// part has none.
    fn content_type(
        &mut self,
        ct: &ContentType<'_>,
    ) -> Result<(), Self::Output> {
        Ok(())
    }

    /// Indicates that this part has no children.
    ///
    /// A returned visitor *replaces* this one for all further callbacks.
    /// Called before `start_content()`.
    fn leaf_section(
        &mut self,
    ) -> Option<Box<dyn Visitor<Output = Self::Output>>> {
        None
    }

    /// Indicates the end of the headers. All further data up to the end of
    /// this part is "content".
    ///
    /// The content of a multipart is its raw body, boundaries included.
    fn start_content(&mut self) -> Result<(), Self::Output> {
        Ok(())
    }

    /// Whether text content should be converted to UTF-8 by a
    /// `ContentDecoder` wrapping this visitor.
    ///
    /// Consulted once, immediately after `start_content()`.
    fn wants_charset_decoding(&self) -> bool {
        true
    }

    /// Called with data which belongs strictly to this part.
    ///
    /// `data` is usually a line without its ending, or the line ending alone.
    fn content(&mut self, data: &[u8]) -> Result<(), Self::Output> {
        Ok(())
    }

    /// Indicates that a new child part of a multipart begins.
    ///
    /// To see the child's structure, return a visitor for it. Raw lines keep
    /// flowing to this visitor while headers, content, and grandchildren go
    /// to the child.
    fn start_part(
        &mut self,
    ) -> Option<Box<dyn Visitor<Output = Self::Output>>> {
        None
    }

    /// Called when the child created by `start_part` produces its output.
    fn child_result(
        &mut self,
        child_result: Self::Output,
    ) -> Result<(), Self::Output> {
        Ok(())
    }

    /// Reports that the input is malformed in a way the parser tolerated but
    /// a security-sensitive consumer may not want to.
    fn anomaly(&mut self, description: &str) -> Result<(), Self::Output> {
        Ok(())
    }

    /// Indicates that the end of the part has been reached.
    ///
    /// Always the last call. It takes `&mut self` to keep the trait
    /// object-safe.
    fn end(&mut self) -> Self::Output;
}

pub trait IntoBoxedVisitor<V> {
    fn into_boxed_visitor(self) -> Box<dyn Visitor<Output = V>>;
}

impl<V: Visitor + 'static> IntoBoxedVisitor<V::Output> for V {
    fn into_boxed_visitor(self) -> Box<dyn Visitor<Output = V::Output>> {
        Box::new(self)
    }
}

impl<V> IntoBoxedVisitor<V> for Box<dyn Visitor<Output = V>> {
    fn into_boxed_visitor(self) -> Self {
        self
    }
}

/// Run `visitor` over the whole message read from `reader`.
///
/// Reading stops as soon as the visitor produces its output.
pub fn grovel<V>(
    mut reader: impl Read,
    visitor: impl IntoBoxedVisitor<V>,
) -> io::Result<V> {
    let mut writer = GrovelWriter::new(visitor, usize::MAX);
    let mut buf = [0u8; 8192];
    while !writer.is_done() {
        let nread = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if io::ErrorKind::Interrupted == e.kind() => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..nread])?;
    }

    Ok(writer.finish())
}

/// Adapts the push parser to `io::Write`.
///
/// Bytes may be written in chunks of any size and split anywhere; the writer
/// reassembles lines itself. This is what lets the crypto engine stream
/// plaintext straight into the parser.
///
/// Once the visitor has produced its output, further writes are accepted and
/// discarded.
pub struct GrovelWriter<V> {
    groveller: Groveller<V>,
    pending: Vec<u8>,
    done: Option<V>,
}

impl<V> fmt::Debug for GrovelWriter<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GrovelWriter")
            .field("pending", &self.pending.len())
            .field("done", &self.done.is_some())
            .finish()
    }
}

impl<V> GrovelWriter<V> {
    /// Create a writer feeding `visitor`.
    ///
    /// Lines longer than `max_line_length` bytes are reported to the
    /// top-level visitor as an anomaly (once), but are still parsed.
    pub fn new(
        visitor: impl IntoBoxedVisitor<V>,
        max_line_length: usize,
    ) -> Self {
        let mut groveller = Groveller::new(visitor.into_boxed_visitor());
        groveller.max_line_length = max_line_length;
        GrovelWriter {
            groveller,
            pending: Vec::new(),
            done: None,
        }
    }

    /// Whether the visitor has already produced its output.
    pub fn is_done(&self) -> bool {
        self.done.is_some()
    }

    /// Flush any partial line and return the visitor's output.
    pub fn finish(mut self) -> V {
        self.drain(true);
        match self.done.take() {
            Some(output) => output,
            None => self.groveller.end(),
        }
    }

    fn drain(&mut self, at_eof: bool) {
        let mut start = 0;
        while self.done.is_none() {
            let avail = &self.pending[start..];
            if avail.is_empty() {
                break;
            }

            let line_len = match memchr::memchr(b'\n', avail) {
                // We need to see the first byte of the following line to know
                // whether a header continues.
                Some(lf) if lf < MAX_BUFFER => {
                    if lf + 1 < avail.len() || at_eof {
                        lf + 1
                    } else {
                        break;
                    }
                },
                _ if avail.len() >= MAX_BUFFER => {
                    // A CR at the very end could be the first half of the
                    // line ending before a boundary, so it must travel with
                    // what comes next.
                    if b'\r' == avail[MAX_BUFFER - 1] {
                        MAX_BUFFER - 1
                    } else {
                        MAX_BUFFER
                    }
                },
                None if at_eof => avail.len(),
                _ => break,
            };

            let (line, next) = avail.split_at(line_len);
            let next_could_be_continuation = if next.is_empty() {
                !at_eof
            } else {
                could_be_continuation(next)
            };

            if let Err(output) = self
                .groveller
                .push_line_and_content(line, next_could_be_continuation)
            {
                self.done = Some(output);
            }

            start += line_len;
        }

        if self.done.is_some() {
            self.pending = Vec::new();
        } else {
            self.pending.drain(..start);
        }
    }
}

impl<V> Write for GrovelWriter<V> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.done.is_none() {
            self.pending.extend_from_slice(data);
            self.drain(false);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A push parser which descends through a MIME message.
///
/// It aims to be robust rather than strictly correct: wildly malformed input
/// is accepted and parsed as sensibly as possible, and memory use is bounded
/// regardless of the input.
///
/// It knows nothing about headers except Content-Type, which it needs to find
/// boundaries, and leaves transfer and character encodings to the visitor
/// (see `ContentDecoder`).
#[derive(Debug)]
struct Groveller<V> {
    visitor: Box<dyn Visitor<Output = V>>,
    in_headers: bool,
    /// Set once the blank line separating headers from content has been
    /// passed.
    in_content: bool,
    /// Set until the first content line, since a boundary at the very start
    /// of the content has no line ending before it.
    first_line_of_content: bool,
    seen_content_type: bool,
    seen_boundary: bool,

    /// Whether the final line ending of this part is content.
    ///
    /// True at the top level and inside message/rfc822 bodies, false once
    /// inside a real multipart.
    last_line_ending_is_content: bool,

    /// The header being accumulated while continuation lines are possible.
    header_buf: Vec<u8>,
    /// The line ending at the end of the previous line.
    ///
    /// It is only passed on once we know the next line is not a boundary,
    /// since the line ending before a boundary belongs to the boundary.
    held_line_ending: &'static [u8],

    default_content_type: ContentType<'static>,
    child_default_content_type: ContentType<'static>,

    child: Option<Box<Self>>,
    /// The multipart delimiter, including the leading `--`.
    boundary: Option<Vec<u8>>,
    /// A message/rfc822 body is treated as a multipart with exactly one part
    /// and no boundaries.
    is_message_rfc822: bool,

    recursion_depth: u32,
    total_part_count: Rc<Cell<u32>>,

    max_line_length: usize,
    current_line_length: usize,
    reported_long_line: bool,
}

const CT_TEXT_PLAIN: ContentType<'static> = ContentType {
    typ: Cow::Borrowed(b"text"),
    subtype: Cow::Borrowed(b"plain"),
    parms: vec![],
};

const CT_MESSAGE_RFC822: ContentType<'static> = ContentType {
    typ: Cow::Borrowed(b"message"),
    subtype: Cow::Borrowed(b"rfc822"),
    parms: vec![],
};

#[cfg(not(test))]
const MAX_BUFFER: usize = 65536;
// Much smaller in tests so that the overflow paths actually get exercised.
#[cfg(test)]
pub(super) const MAX_BUFFER: usize = 256;

const MAX_RECURSION: u32 = 20;
const MAX_PARTS: u32 = 1000;

impl<V> Groveller<V> {
    fn new(visitor: Box<dyn Visitor<Output = V>>) -> Self {
        Groveller::with_part_count(visitor, Rc::new(Cell::new(0)))
    }

    fn with_part_count(
        visitor: Box<dyn Visitor<Output = V>>,
        part_count: Rc<Cell<u32>>,
    ) -> Self {
        Groveller {
            visitor,
            in_headers: true,
            in_content: false,
            first_line_of_content: true,
            seen_content_type: false,
            seen_boundary: false,

            last_line_ending_is_content: true,

            header_buf: vec![],
            held_line_ending: b"",

            default_content_type: CT_TEXT_PLAIN,
            child_default_content_type: CT_TEXT_PLAIN,

            child: None,
            boundary: None,
            is_message_rfc822: false,
            recursion_depth: 0,
            total_part_count: part_count,

            max_line_length: usize::MAX,
            current_line_length: 0,
            reported_long_line: false,
        }
    }

    /// Entry point for each line (or over-long fragment) of the top-level
    /// input.
    fn push_line_and_content(
        &mut self,
        line: &[u8],
        next_could_be_continuation: bool,
    ) -> Result<(), V> {
        self.current_line_length += line.len();
        if self.current_line_length > self.max_line_length
            && !mem::replace(&mut self.reported_long_line, true)
        {
            self.visitor.anomaly("line too long")?;
        }
        if line.ends_with(b"\n") {
            self.current_line_length = 0;
        }

        self.push(line, next_could_be_continuation)?;
        self.push_content(line)
    }

    fn push(
        &mut self,
        line: &[u8],
        next_could_be_continuation: bool,
    ) -> Result<(), V> {
        self.visitor.raw_line(line)?;

        if self.in_headers {
            self.push_header_line(line, next_could_be_continuation)
        } else {
            self.push_body_line(line, next_could_be_continuation)
        }
    }

    fn push_header_line(
        &mut self,
        line: &[u8],
        next_could_be_continuation: bool,
    ) -> Result<(), V> {
        let is_continuation = line.starts_with(b" ") || line.starts_with(b"\t");

        if !is_continuation && !self.header_buf.is_empty() {
            self.flush_header()?;
        }

        if b"\r\n" == line || b"\n" == line {
            self.end_headers()
        } else if is_continuation {
            // A continuation with nothing to continue is dropped
            if !self.header_buf.is_empty() {
                self.header_buf.extend_from_slice(line);
                if self.header_buf.len() > MAX_BUFFER {
                    self.flush_header()?;
                }
            }
            Ok(())
        } else if next_could_be_continuation {
            self.header_buf.extend_from_slice(line);
            Ok(())
        } else {
            self.process_header(line)
        }
    }

    fn push_body_line(
        &mut self,
        line: &[u8],
        next_could_be_continuation: bool,
    ) -> Result<(), V> {
        let is_first = mem::replace(&mut self.first_line_of_content, false);

        // A boundary can only follow a line ending (or start the content).
        // Bare LF is accepted as well as CRLF, since a boundary appearing in
        // binary data right after a LF is vanishingly unlikely.
        if is_first || !self.held_line_ending.is_empty() {
            if let Some(is_final) = self.match_boundary(line) {
                self.held_line_ending = b"";
                if self.seen_boundary {
                    self.end_multipart_part()?;
                }
                self.seen_boundary = true;

                if !is_final {
                    self.start_multipart_part()?;
                }

                return Ok(());
            }

            // Not a boundary, so the previous line ending was content
            let held = self.held_line_ending;
            self.on_child(|child| child.push_content(held))?;
        }

        let (content, ending): (&[u8], &'static [u8]) =
            if let Some(c) = line.strip_suffix(b"\r\n") {
                (c, b"\r\n")
            } else if let Some(c) = line.strip_suffix(b"\n") {
                (c, b"\n")
            } else {
                (line, b"")
            };
        self.held_line_ending = ending;

        self.on_child(|child| child.push(line, next_could_be_continuation))?;
        self.on_child(|child| child.push_content(content))
    }

    /// If `line` is a boundary of this multipart, return whether it is the
    /// closing one.
    fn match_boundary(&self, line: &[u8]) -> Option<bool> {
        let boundary = self.boundary.as_ref()?;
        line.strip_prefix(&boundary[..])
            .map(|rest| rest.starts_with(b"--"))
    }

    fn push_content(&mut self, content: &[u8]) -> Result<(), V> {
        if self.in_headers {
            Ok(())
        } else if self.in_content {
            self.visitor.content(content)
        } else {
            // This is the separator line, which only becomes content-relevant
            // once passed
            self.in_content |= b"\r\n" == content || b"\n" == content;
            Ok(())
        }
    }

    fn flush_header(&mut self) -> Result<(), V> {
        let mut header = mem::take(&mut self.header_buf);
        let result = self.process_header(&header);
        header.clear();
        self.header_buf = header;
        result
    }

    fn process_header(&mut self, header: &[u8]) -> Result<(), V> {
        let Some(colon) = memchr::memchr(b':', header) else {
            return Ok(());
        };

        let Ok(name) = str::from_utf8(&header[..colon]) else {
            return Ok(());
        };
        let name = name.trim();
        let value = &header[colon + 1..];

        self.visitor.header(header, name, value)?;

        if "Content-Type".eq_ignore_ascii_case(name) {
            if let Some(ct) = header::parse_content_type(value) {
                self.content_type(&ct)?;
            }
        }

        Ok(())
    }

    fn content_type(&mut self, ct: &ContentType<'_>) -> Result<(), V> {
        // Only the first Content-Type counts
        if mem::replace(&mut self.seen_content_type, true) {
            return Ok(());
        }

        self.visitor.content_type(ct)?;

        if ct.is_type("multipart") {
            if let Some(bound) = ct.parm("boundary") {
                let mut boundary = Vec::with_capacity(bound.len() + 2);
                boundary.extend_from_slice(b"--");
                boundary.extend_from_slice(bound);
                self.boundary = Some(boundary);
            }

            if ct.is_subtype("digest") {
                self.child_default_content_type = CT_MESSAGE_RFC822;
            }
        } else if ct.is("message", "rfc822") {
            self.is_message_rfc822 = true;
        }

        Ok(())
    }

    fn end_headers(&mut self) -> Result<(), V> {
        if !self.seen_content_type {
            let dct = self.default_content_type.clone();
            self.content_type(&dct)?;
        }

        self.in_headers = false;

        if !self.is_message_rfc822 && self.boundary.is_none() {
            if let Some(new_visitor) = self.visitor.leaf_section() {
                self.visitor = new_visitor;
            }
        }

        self.visitor.start_content()?;

        if self.is_message_rfc822 {
            self.start_multipart_part()?;
        }

        Ok(())
    }

    fn has_parts(&self) -> bool {
        self.boundary.is_some() || self.is_message_rfc822
    }

    fn start_multipart_part(&mut self) -> Result<(), V> {
        if !self.has_parts() {
            return Ok(());
        }

        if self.recursion_depth >= MAX_RECURSION {
            return self.visitor.anomaly("MIME structure nested too deeply");
        }

        if self.total_part_count.get() >= MAX_PARTS {
            return self.visitor.anomaly("too many MIME parts");
        }

        debug_assert!(self.child.is_none());

        if let Some(child_visitor) = self.visitor.start_part() {
            let mut child = Self::with_part_count(
                child_visitor,
                Rc::clone(&self.total_part_count),
            );
            child.default_content_type =
                self.child_default_content_type.clone();
            child.recursion_depth = self.recursion_depth + 1;
            child.last_line_ending_is_content =
                self.last_line_ending_is_content && self.is_message_rfc822;
            self.child = Some(Box::new(child));

            self.total_part_count.set(self.total_part_count.get() + 1);
        }

        Ok(())
    }

    fn on_child(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), V>,
    ) -> Result<(), V> {
        let child_result = self.child.as_mut().and_then(|c| f(c).err());
        if let Some(child_result) = child_result {
            self.child = None;
            self.visitor.child_result(child_result)
        } else {
            Ok(())
        }
    }

    fn end_multipart_part(&mut self) -> Result<(), V> {
        // Without boundaries (message/rfc822), the final line ending is
        // still the child's.
        if self.boundary.is_none()
            && !self.held_line_ending.is_empty()
            && self.last_line_ending_is_content
        {
            let held = self.held_line_ending;
            self.on_child(|child| child.push_content(held))?;
        }

        if let Some(child) = self.child.take() {
            self.visitor.child_result(child.end())?;
        }

        Ok(())
    }

    fn end(mut self) -> V {
        if !self.header_buf.is_empty() {
            if let Err(output) = self.flush_header() {
                return output;
            }
        }

        if let Err(output) = self.end_multipart_part() {
            return output;
        }

        self.visitor.end()
    }
}

fn could_be_continuation(tail: &[u8]) -> bool {
    tail.is_empty() || tail.starts_with(b" ") || tail.starts_with(b"\t")
}
