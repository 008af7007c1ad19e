//! Incremental pieces of a streamed completion.

/// One event from a completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Raw bytes of response text. A delta can end in the middle of a
    /// multi-byte character, see `Utf8Buffer`.
    Delta(Vec<u8>),
    /// The completion finished normally.
    End { finish_reason: Option<String> },
    /// The completion service reported an error mid-stream.
    Error(String),
}

impl Fragment {
    pub fn text(content: &str) -> Self {
        Fragment::Delta(content.as_bytes().to_vec())
    }

    pub fn end(finish_reason: &str) -> Self {
        Fragment::End {
            finish_reason: Some(finish_reason.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Fragment::Delta(_))
    }
}

/// Holds back the trailing bytes of an incomplete UTF-8 sequence
/// until the rest of the character arrives.
#[derive(Debug, Default, Clone)]
pub struct Utf8Buffer {
    pending: Vec<u8>,
}

impl Utf8Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every complete character decoded so
    /// far. Invalid sequences decode to U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        // Incomplete sequence at the end, wait for more
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Drains whatever is left, replacing an unfinished character
    /// with U+FFFD.
    pub fn flush(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
