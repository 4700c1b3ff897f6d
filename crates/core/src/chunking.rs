use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::models::{ChunkMetadata, EventChunk, EventRecord};

/// Replaces the invisible separators found in the agenda export with plain
/// spaces and trims the result.
pub fn normalize_text(text: &str) -> String {
    text.replace(['\u{2028}', '\u{2029}', '\u{a0}'], " ")
        .trim()
        .to_string()
}

/// Splits text into overlapping windows of at most `chunk_size` characters.
///
/// Adjacent chunks share exactly `chunk_overlap` characters, so dropping the
/// first `chunk_overlap` characters of every chunk after the first and
/// concatenating gives back the input. Window ends are pulled back to a
/// paragraph, sentence or word break when one sits in the second half of the
/// window.
#[derive(Debug, Clone, Copy)]
pub struct TextChunker {
    config: ChunkingConfig,
}

impl TextChunker {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn spans<'a>(&self, text: &'a str) -> ChunkSpans<'a> {
        ChunkSpans::new(text, self.config)
    }

    pub fn chunk_record<'a>(&self, record: &'a EventRecord) -> RecordChunks<'a> {
        RecordChunks {
            metadata: ChunkMetadata::from(record),
            spans: self.spans(&record.text_to_embed).enumerate(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkSpans<'a> {
    text: &'a str,
    chars: Vec<char>,
    /// Byte offset of every char, plus `text.len()` as a sentinel.
    offsets: Vec<usize>,
    config: ChunkingConfig,
    start: usize,
    finished: bool,
}

impl<'a> ChunkSpans<'a> {
    fn new(text: &'a str, config: ChunkingConfig) -> Self {
        let mut chars = Vec::with_capacity(text.len());
        let mut offsets = Vec::with_capacity(text.len() + 1);
        for (offset, ch) in text.char_indices() {
            offsets.push(offset);
            chars.push(ch);
        }
        offsets.push(text.len());

        Self {
            text,
            finished: chars.is_empty(),
            chars,
            offsets,
            config,
            start: 0,
        }
    }

    fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.text[self.offsets[start]..self.offsets[end]]
    }

    fn window_end(&self, start: usize, hard_end: usize) -> usize {
        let overlap = self.config.chunk_overlap;
        let min_end = start + (overlap + 1).max(self.config.chunk_size / 2).max(2);
        if min_end > hard_end {
            return hard_end;
        }

        let chars = &self.chars;
        let is_paragraph = |end: usize| chars[end - 2] == '\n' && chars[end - 1] == '\n';
        let is_sentence = |end: usize| {
            chars[end - 1].is_whitespace() && matches!(chars[end - 2], '.' | '!' | '?' | ';')
        };
        let is_word = |end: usize| chars[end - 1].is_whitespace();

        let candidates = || (min_end..=hard_end).rev();
        candidates()
            .find(|&end| is_paragraph(end))
            .or_else(|| candidates().find(|&end| is_sentence(end)))
            .or_else(|| candidates().find(|&end| is_word(end)))
            .unwrap_or(hard_end)
    }
}

impl<'a> Iterator for ChunkSpans<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let total = self.chars.len();
        let start = self.start;
        let hard_end = start + self.config.chunk_size;

        if hard_end >= total {
            self.finished = true;
            return Some(self.slice(start, total));
        }

        let end = self.window_end(start, hard_end);
        self.start = end - self.config.chunk_overlap;
        Some(self.slice(start, end))
    }
}

#[derive(Debug, Clone)]
pub struct RecordChunks<'a> {
    metadata: ChunkMetadata,
    spans: std::iter::Enumerate<ChunkSpans<'a>>,
}

impl Iterator for RecordChunks<'_> {
    type Item = EventChunk;

    fn next(&mut self) -> Option<Self::Item> {
        let (chunk_index, text) = self.spans.next()?;
        Some(EventChunk {
            metadata: self.metadata.clone(),
            chunk_index,
            page_content: text.to_string(),
        })
    }
}
