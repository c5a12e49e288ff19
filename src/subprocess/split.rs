//! Splitting raw byte streams into text records
//!
//! A [`StreamSplitter`] turns an arbitrary sequence of byte chunks into records
//! terminated by one of a set of candidate separators. Chunks may end anywhere,
//! including in the middle of a multi-byte code point or of a multi-character
//! separator such as `"\r\n"`.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::ProcessError;

const READ_CHUNK_SIZE: usize = 8192;

/// Ordered candidate terminators. Earlier entries win at the same offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeparatorSet {
    separators: Vec<String>,
}

impl SeparatorSet {
    pub fn new<I, S>(separators: I) -> Result<Self, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let separators: Vec<String> = separators.into_iter().map(Into::into).collect();
        if separators.is_empty() {
            return Err(ProcessError::InternalError {
                message: "separator set must not be empty".to_string(),
            });
        }
        if separators.iter().any(String::is_empty) {
            return Err(ProcessError::InternalError {
                message: "separators must not be empty strings".to_string(),
            });
        }
        Ok(Self { separators })
    }

    /// `"\r\n"`, `"\r"`, `"\n"`, in that priority order.
    pub fn line_endings() -> Self {
        Self {
            separators: vec!["\r\n".to_string(), "\r".to_string(), "\n".to_string()],
        }
    }

    /// A single NUL byte.
    pub fn nul() -> Self {
        Self {
            separators: vec!["\0".to_string()],
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.separators
    }
}

enum SeparatorMatch {
    Found(String),
    Pending,
    Absent,
}

/// One record extracted from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub text: String,
    /// The separator that ended this record; `None` for an unterminated
    /// remainder emitted at end-of-stream.
    pub terminator: Option<String>,
}

impl Record {
    /// The record text followed by its original terminator, if any.
    pub fn to_raw(&self) -> String {
        match &self.terminator {
            Some(sep) => format!("{}{}", self.text, sep),
            None => self.text.clone(),
        }
    }
}

/// Incremental record splitter.
#[derive(Debug)]
pub struct StreamSplitter {
    separators: SeparatorSet,
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence from the last chunk.
    partial: Vec<u8>,
    cursor: usize,
    ended: bool,
}

impl StreamSplitter {
    pub fn new(separators: SeparatorSet) -> Self {
        Self {
            separators,
            buffer: String::new(),
            partial: Vec::new(),
            cursor: 0,
            ended: false,
        }
    }

    /// Append a chunk of raw bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.partial.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.partial);
        self.partial = decode_utf8_prefix(&bytes, &mut self.buffer);
    }

    /// Signal that no more input will arrive.
    pub fn end(&mut self) {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.buffer.push_str(&String::from_utf8_lossy(&rest));
        }
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Extract the next complete record, if one is available.
    pub fn next_record(&mut self) -> Option<Record> {
        while self.cursor < self.buffer.len() {
            match self.match_at(self.cursor) {
                SeparatorMatch::Found(separator) => {
                    let text = self.buffer[..self.cursor].to_string();
                    self.buffer.drain(..self.cursor + separator.len());
                    self.cursor = 0;
                    return Some(Record {
                        text,
                        terminator: Some(separator),
                    });
                }
                SeparatorMatch::Pending => return None,
                SeparatorMatch::Absent => self.cursor += 1,
            }
        }

        if self.ended && !self.buffer.is_empty() {
            self.cursor = 0;
            return Some(Record {
                text: std::mem::take(&mut self.buffer),
                terminator: None,
            });
        }

        None
    }

    /// Test the separators at `offset` in priority order. A higher-priority
    /// separator that could still complete with more input blocks the
    /// decision until that input arrives or the stream ends.
    fn match_at(&self, offset: usize) -> SeparatorMatch {
        let rest = &self.buffer.as_bytes()[offset..];
        for separator in self.separators.as_slice() {
            let candidate = separator.as_bytes();
            if rest.starts_with(candidate) {
                return SeparatorMatch::Found(separator.clone());
            }
            if !self.ended && rest.len() < candidate.len() && candidate.starts_with(rest) {
                return SeparatorMatch::Pending;
            }
        }
        SeparatorMatch::Absent
    }

    /// Decoded text held back because no terminator has arrived for it yet.
    pub fn pending_text(&self) -> &str {
        &self.buffer
    }

    /// Drop the held-back text, e.g. a prompt that was already answered.
    pub fn discard_pending(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }

    /// Drain every record currently available.
    pub fn drain_records(&mut self) -> Vec<Record> {
        std::iter::from_fn(|| self.next_record()).collect()
    }
}

/// Decode as much of `bytes` as forms complete UTF-8, appending to `out`.
/// Returns the trailing bytes of an incomplete sequence.
fn decode_utf8_prefix(mut bytes: &[u8], out: &mut String) -> Vec<u8> {
    loop {
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                out.push_str(text);
                return Vec::new();
            }
            Err(err) => {
                let valid = err.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&bytes[..valid]));
                match err.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        bytes = &bytes[valid + bad..];
                    }
                    None => return bytes[valid..].to_vec(),
                }
            }
        }
    }
}

/// Pulls chunks from an async reader and yields records lazily.
pub struct RecordReader<R> {
    reader: R,
    splitter: StreamSplitter,
    buf: Vec<u8>,
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, separators: SeparatorSet) -> Self {
        Self {
            reader,
            splitter: StreamSplitter::new(separators),
            buf: vec![0; READ_CHUNK_SIZE],
        }
    }

    /// Next record, or `None` once the reader is exhausted and every record
    /// has been returned.
    pub async fn next_record(&mut self) -> std::io::Result<Option<Record>> {
        loop {
            if let Some(record) = self.splitter.next_record() {
                return Ok(Some(record));
            }
            if self.splitter.is_ended() {
                return Ok(None);
            }
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                self.splitter.end();
            } else {
                self.splitter.push(&self.buf[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn split_all(separators: SeparatorSet, chunks: &[&[u8]]) -> Vec<Record> {
        let mut splitter = StreamSplitter::new(separators);
        let mut records = Vec::new();
        for chunk in chunks {
            splitter.push(chunk);
            records.extend(splitter.drain_records());
        }
        splitter.end();
        records.extend(splitter.drain_records());
        records
    }

    fn texts(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.text.as_str()).collect()
    }

    #[test]
    fn test_rejects_empty_separators() {
        assert!(SeparatorSet::new(Vec::<String>::new()).is_err());
        assert!(SeparatorSet::new(["\n", ""]).is_err());
        assert!(SeparatorSet::new(["\n"]).is_ok());
    }

    #[test]
    fn test_splits_lines_in_one_chunk() {
        let records = split_all(SeparatorSet::line_endings(), &[b"one\ntwo\r\nthree\rfour"]);
        assert_eq!(texts(&records), vec!["one", "two", "three", "four"]);
        assert_eq!(records[1].terminator.as_deref(), Some("\r\n"));
        assert_eq!(records[2].terminator.as_deref(), Some("\r"));
        assert_eq!(records[3].terminator, None);
    }

    #[test]
    fn test_crlf_split_across_chunks_is_one_separator() {
        let records = split_all(SeparatorSet::line_endings(), &[b"a\r", b"\nb\n"]);
        assert_eq!(texts(&records), vec!["a", "b"]);
        assert_eq!(records[0].terminator.as_deref(), Some("\r\n"));
    }

    #[test]
    fn test_lf_is_emitted_without_lookahead() {
        let mut splitter = StreamSplitter::new(SeparatorSet::line_endings());
        splitter.push(b"Enter value:\n");
        let record = splitter.next_record().unwrap();
        assert_eq!(record.text, "Enter value:");
        assert_eq!(record.terminator.as_deref(), Some("\n"));
    }

    #[test]
    fn test_cr_waits_for_possible_lf() {
        let mut splitter = StreamSplitter::new(SeparatorSet::line_endings());
        splitter.push(b"progress\r");
        assert_eq!(splitter.next_record(), None);
        splitter.push(b"next\n");
        let record = splitter.next_record().unwrap();
        assert_eq!(record.text, "progress");
        assert_eq!(record.terminator.as_deref(), Some("\r"));
    }

    #[test]
    fn test_pending_text_and_discard() {
        let mut splitter = StreamSplitter::new(SeparatorSet::line_endings());
        splitter.push(b"done\nEnter value: ");
        assert_eq!(splitter.next_record().unwrap().text, "done");
        assert_eq!(splitter.next_record(), None);
        assert_eq!(splitter.pending_text(), "Enter value: ");

        splitter.discard_pending();
        assert_eq!(splitter.pending_text(), "");
        splitter.push(b"after\n");
        assert_eq!(splitter.next_record().unwrap().text, "after");
    }

    #[test]
    fn test_trailing_cr_at_end_of_stream() {
        let records = split_all(SeparatorSet::line_endings(), &[b"a\r"]);
        assert_eq!(texts(&records), vec!["a"]);
        assert_eq!(records[0].terminator.as_deref(), Some("\r"));
    }

    #[test]
    fn test_no_record_until_terminator_or_end() {
        let mut splitter = StreamSplitter::new(SeparatorSet::nul());
        splitter.push(b"{\"a\":");
        assert_eq!(splitter.next_record(), None);
        splitter.push(b"1}");
        assert_eq!(splitter.next_record(), None);
        splitter.end();
        assert_eq!(splitter.next_record().unwrap().text, "{\"a\":1}");
        assert_eq!(splitter.next_record(), None);
    }

    #[test]
    fn test_empty_records_between_adjacent_separators() {
        let records = split_all(SeparatorSet::line_endings(), &[b"a\n\n\nb"]);
        assert_eq!(texts(&records), vec!["a", "", "", "b"]);
    }

    #[test]
    fn test_empty_and_zero_length_chunks() {
        assert!(split_all(SeparatorSet::nul(), &[]).is_empty());
        assert!(split_all(SeparatorSet::nul(), &[b"", b""]).is_empty());
        let records = split_all(SeparatorSet::nul(), &[b"", b"x\0", b""]);
        assert_eq!(texts(&records), vec!["x"]);
    }

    #[test]
    fn test_multibyte_code_point_split_across_chunks() {
        let snowman = "☃".as_bytes();
        let records = split_all(
            SeparatorSet::line_endings(),
            &[&snowman[..1], &snowman[1..2], &snowman[2..], b"\n"],
        );
        assert_eq!(texts(&records), vec!["☃"]);
    }

    #[test]
    fn test_invalid_utf8_becomes_replacement() {
        let records = split_all(SeparatorSet::line_endings(), &[b"a\xffb\n"]);
        assert_eq!(texts(&records), vec!["a\u{fffd}b"]);
    }

    #[test]
    fn test_incomplete_sequence_at_end_is_replaced() {
        let records = split_all(SeparatorSet::line_endings(), &[b"ok\xe2\x98"]);
        assert_eq!(texts(&records), vec!["ok\u{fffd}"]);
    }

    #[test]
    fn test_priority_order_at_same_offset() {
        let separators = SeparatorSet::new(["ab", "a"]).unwrap();
        let records = split_all(separators, &[b"xaby"]);
        assert_eq!(texts(&records), vec!["x", "y"]);
        assert_eq!(records[0].terminator.as_deref(), Some("ab"));

        let separators = SeparatorSet::new(["a", "ab"]).unwrap();
        let records = split_all(separators, &[b"xaby"]);
        assert_eq!(texts(&records), vec!["x", "by"]);
    }

    #[test]
    fn test_nul_records_split_mid_record() {
        let records = split_all(
            SeparatorSet::nul(),
            &[b"{\"a\":1}\0{\"b", b"\":2}\0{\"c\"", b":3}"],
        );
        assert_eq!(texts(&records), vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);
    }

    #[tokio::test]
    async fn test_record_reader_over_async_source() {
        let data: &[u8] = b"first\r\nsecond\nthird";
        let mut reader = RecordReader::new(data, SeparatorSet::line_endings());
        let mut seen = Vec::new();
        while let Some(record) = reader.next_record().await.unwrap() {
            seen.push(record.text);
        }
        assert_eq!(seen, vec!["first", "second", "third"]);
        assert!(reader.next_record().await.unwrap().is_none());
    }

    fn rejoin(records: &[Record]) -> String {
        records.iter().map(Record::to_raw).collect()
    }

    fn chunk_at(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
        let mut cuts: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
        cuts.sort_unstable();
        let mut chunks = Vec::new();
        let mut start = 0;
        for cut in cuts {
            chunks.push(bytes[start..cut].to_vec());
            start = cut;
        }
        chunks.push(bytes[start..].to_vec());
        chunks
    }

    proptest! {
        #[test]
        fn test_round_trip_for_any_chunking(
            text in r"[ab\r\n\x00é☃]{0,40}",
            cuts in prop::collection::vec(0usize..64, 0..8),
            nul in any::<bool>(),
        ) {
            let separators = if nul { SeparatorSet::nul() } else { SeparatorSet::line_endings() };
            let bytes = text.as_bytes();
            let chunks = chunk_at(bytes, &cuts);
            let refs: Vec<&[u8]> = chunks.iter().map(Vec::as_slice).collect();
            let records = split_all(separators, &refs);
            prop_assert_eq!(rejoin(&records), text.clone());

            // Only the final record may lack a terminator.
            for record in records.iter().rev().skip(1) {
                prop_assert!(record.terminator.is_some());
            }
        }

        #[test]
        fn test_byte_at_a_time_matches_all_at_once(text in r"[xy\r\n]{0,30}") {
            let bytes = text.as_bytes();
            let whole = split_all(SeparatorSet::line_endings(), &[bytes]);
            let singles: Vec<&[u8]> = bytes.chunks(1).collect();
            let split = split_all(SeparatorSet::line_endings(), &singles);
            prop_assert_eq!(whole, split);
        }
    }
}
