#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Bracketed,
    Backticked,
    LineComment,
    BlockComment,
}

/// Iterates the bytes of a SQL string that sit outside literals, quoted identifiers and comments.
///
/// Yields `(index, byte)` pairs. Quote characters that open or close a literal are not yielded.
pub(crate) struct CodeBytes<'a> {
    bytes: &'a [u8],
    idx: usize,
    state: State,
}

impl<'a> CodeBytes<'a> {
    pub(crate) fn new(sql: &'a str) -> Self {
        Self {
            bytes: sql.as_bytes(),
            idx: 0,
            state: State::Normal,
        }
    }
}

impl Iterator for CodeBytes<'_> {
    type Item = (usize, u8);

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx < self.bytes.len() {
            let idx = self.idx;
            let b = self.bytes[idx];
            self.idx += 1;
            match self.state {
                State::Normal => match b {
                    b'\'' => self.state = State::SingleQuoted,
                    b'"' => self.state = State::DoubleQuoted,
                    b'[' => self.state = State::Bracketed,
                    b'`' => self.state = State::Backticked,
                    b'-' if self.bytes.get(idx + 1) == Some(&b'-') => {
                        self.state = State::LineComment;
                        self.idx += 1;
                    }
                    b'/' if self.bytes.get(idx + 1) == Some(&b'*') => {
                        self.state = State::BlockComment;
                        self.idx += 1;
                    }
                    _ => return Some((idx, b)),
                },
                State::SingleQuoted => self.close_quote(b, b'\''),
                State::DoubleQuoted => self.close_quote(b, b'"'),
                State::Backticked => self.close_quote(b, b'`'),
                State::Bracketed => {
                    if b == b']' {
                        self.state = State::Normal;
                    }
                }
                State::LineComment => {
                    if b == b'\n' {
                        self.state = State::Normal;
                    }
                }
                // sqlite block comments do not nest
                State::BlockComment => {
                    if b == b'*' && self.bytes.get(idx + 1) == Some(&b'/') {
                        self.state = State::Normal;
                        self.idx += 1;
                    }
                }
            }
        }
        None
    }
}

impl CodeBytes<'_> {
    fn close_quote(&mut self, b: u8, quote: u8) {
        if b == quote {
            if self.bytes.get(self.idx) == Some(&quote) {
                self.idx += 1; // escaped quote
            } else {
                self.state = State::Normal;
            }
        }
    }
}

pub(super) fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
