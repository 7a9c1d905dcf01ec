//! Byte stream to logical line decomposition with carriage-return
//! replacement semantics.
//!
//! Progress bars and spinners emit `\r` repeatedly without ever sending
//! `\n`; naively splitting on newlines alone would either never flush
//! that output or, splitting on `\r` alone, would turn ordinary file
//! output into a flood of "replacement" lines. [`LineDecoder`] is a small
//! explicit state machine (the alternative the teacher's own ANSI module
//! used for interactive rendering, generalized here into something the
//! ingestion pipeline can run against raw bytes) with one bit of state:
//! whether the last emission was an incomplete, CR-terminated update that
//! a following complete line should replace rather than follow.

/// One emission out of the decoder: the line text, and whether it should
/// replace the previously emitted line (a carriage-return update) rather
/// than append after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    pub text: String,
    pub is_replacement: bool,
}

/// Incremental UTF-8 + carriage-return line decoder.
///
/// Feed it arbitrarily-sized byte chunks via [`LineDecoder::feed`]; call
/// [`LineDecoder::finish`] once at end-of-stream to flush any trailing
/// partial line.
#[derive(Debug, Default)]
pub struct LineDecoder {
    byte_buffer: Vec<u8>,
    text_buffer: String,
    last_emit_was_replacement: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes, returning every complete or
    /// carriage-return-delimited line it produced.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedLine> {
        self.byte_buffer.extend_from_slice(chunk);
        self.drain_valid_utf8();
        self.drain_lines()
    }

    /// Call at end-of-stream: flushes a trailing partial line, if any.
    pub fn finish(mut self) -> Option<DecodedLine> {
        // Whatever is left in the byte buffer is not valid complete UTF-8
        // (or we'd have drained it already); decode it lossily rather
        // than discard a truncated multi-byte sequence silently.
        if !self.byte_buffer.is_empty() {
            self.text_buffer
                .push_str(&String::from_utf8_lossy(&self.byte_buffer));
            self.byte_buffer.clear();
        }
        if self.text_buffer.is_empty() {
            return None;
        }
        Some(DecodedLine {
            text: std::mem::take(&mut self.text_buffer),
            is_replacement: self.last_emit_was_replacement,
        })
    }

    /// Moves the longest valid-UTF-8 prefix of `byte_buffer` into
    /// `text_buffer`, leaving behind only a possible incomplete trailing
    /// multi-byte sequence.
    fn drain_valid_utf8(&mut self) {
        let valid_len = match std::str::from_utf8(&self.byte_buffer) {
            Ok(_) => self.byte_buffer.len(),
            Err(err) => err.valid_up_to(),
        };
        if valid_len == 0 {
            return;
        }
        let valid: Vec<u8> = self.byte_buffer.drain(..valid_len).collect();
        // Safety-by-construction: `valid_len` came from `str::from_utf8`.
        self.text_buffer.push_str(
            std::str::from_utf8(&valid).expect("prefix validated by from_utf8 above"),
        );
    }

    fn drain_lines(&mut self) -> Vec<DecodedLine> {
        let mut out = Vec::new();

        while let Some(newline_pos) = self.text_buffer.find('\n') {
            let mut line: String = self.text_buffer.drain(..newline_pos).collect();
            self.text_buffer.drain(..1); // drop the '\n' itself

            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(last_cr) = line.rfind('\r') {
                line.drain(..=last_cr);
            }

            out.push(DecodedLine {
                text: line,
                is_replacement: self.last_emit_was_replacement,
            });
            self.last_emit_was_replacement = false;
        }

        if self.text_buffer.contains('\r') {
            // Strip a single trailing CR first, the same as the complete-line
            // branch above: a buffer ending in bare CR ("Progress 50%\r") has
            // no text after it yet, so the content to surface is what came
            // before that CR, not the (empty) suffix after it.
            let mut candidate = std::mem::take(&mut self.text_buffer);
            if candidate.ends_with('\r') {
                candidate.pop();
            }
            let suffix = match candidate.rfind('\r') {
                Some(last_cr) => candidate[last_cr + 1..].to_string(),
                None => candidate,
            };
            self.text_buffer = suffix.clone();
            out.push(DecodedLine {
                text: suffix,
                is_replacement: true,
            });
            self.last_emit_was_replacement = true;
        }

        out
    }
}
