//! WordPiece tokenizer
//!
//! Converts text to sub-word token ids against a `vocab.txt`-style
//! vocabulary. Per-word tokenization results go through a bounded LRU cache
//! because natural-language chunks repeat common words heavily; on long
//! documents this cuts tokenize latency substantially.

use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;

use super::EmbeddingError;

/// Default ids for BERT-style special tokens, overridden by the vocabulary
/// when it defines them.
const DEFAULT_CLS_ID: i64 = 101;
const DEFAULT_SEP_ID: i64 = 102;
const DEFAULT_PAD_ID: i64 = 0;
const DEFAULT_UNK_ID: i64 = 100;

const TOKEN_CACHE_CAPACITY: usize = 4096;

/// Hash-fallback ids land in [1000, 30521] so they stay clear of the
/// special-token range while fitting a BERT-sized vocabulary.
const FALLBACK_VOCAB_SIZE: u64 = 30522;
const FALLBACK_MIN_ID: u64 = 1000;

/// WordPiece tokenizer with a per-instance LRU over per-word results.
///
/// Without a loaded vocabulary the tokenizer degrades to deterministic
/// hash-derived pseudo-ids; `has_vocab` distinguishes that mode for
/// diagnostics.
pub struct WordPieceTokenizer {
    token_to_id: HashMap<String, i64>,
    cls_id: i64,
    sep_id: i64,
    pad_id: i64,
    unk_id: i64,
    vocab_loaded: bool,
    cache: Mutex<LruCache<String, Vec<i64>>>,
    hasher: ahash::RandomState,
}

impl Default for WordPieceTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl WordPieceTokenizer {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(TOKEN_CACHE_CAPACITY)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            token_to_id: HashMap::new(),
            cls_id: DEFAULT_CLS_ID,
            sep_id: DEFAULT_SEP_ID,
            pad_id: DEFAULT_PAD_ID,
            unk_id: DEFAULT_UNK_ID,
            vocab_loaded: false,
            cache: Mutex::new(LruCache::new(capacity)),
            // Fixed seeds keep fallback pseudo-ids stable across processes
            hasher: ahash::RandomState::with_seeds(7, 31, 131, 911),
        }
    }

    /// Load a `vocab.txt` vocabulary: one token per line, id = line number.
    pub fn load_vocab(&mut self, path: &Path) -> Result<(), EmbeddingError> {
        let content = fs::read_to_string(path)?;

        let mut token_to_id = HashMap::new();
        for (id, line) in content.lines().enumerate() {
            let token = line.strip_suffix('\r').unwrap_or(line);
            token_to_id.insert(token.to_string(), id as i64);
        }

        if token_to_id.is_empty() {
            return Err(EmbeddingError::Vocabulary(format!(
                "vocabulary file is empty: {}",
                path.display()
            )));
        }

        self.token_to_id = token_to_id;
        self.vocab_loaded = true;

        // Refresh special token ids if the vocabulary defines them
        self.cls_id = self.lookup_or("[CLS]", DEFAULT_CLS_ID);
        self.sep_id = self.lookup_or("[SEP]", DEFAULT_SEP_ID);
        self.pad_id = self.lookup_or("[PAD]", DEFAULT_PAD_ID);
        self.unk_id = self.lookup_or("[UNK]", DEFAULT_UNK_ID);

        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }

        tracing::debug!(
            vocab_size = self.token_to_id.len(),
            path = %path.display(),
            "loaded tokenizer vocabulary"
        );
        Ok(())
    }

    /// Whether a vocabulary is loaded; `false` means hash-fallback mode.
    pub fn has_vocab(&self) -> bool {
        self.vocab_loaded
    }

    pub fn vocab_size(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn pad_id(&self) -> i64 {
        self.pad_id
    }

    /// Encode text to a fixed-length id sequence:
    /// `[CLS] + word pieces + [SEP]`, right-padded with `[PAD]`.
    pub fn encode(&self, text: &str, max_length: usize) -> Vec<i64> {
        if max_length < 2 {
            return vec![self.pad_id; max_length];
        }

        let mut ids = Vec::with_capacity(max_length);
        ids.push(self.cls_id);

        'words: for word in basic_tokenize(text) {
            if ids.len() >= max_length - 1 {
                break;
            }
            for id in self.word_to_ids(&word) {
                if ids.len() >= max_length - 1 {
                    break 'words;
                }
                ids.push(id);
            }
        }

        ids.push(self.sep_id);
        ids.resize(max_length, self.pad_id);
        ids
    }

    /// 1 for real tokens, 0 for padding
    pub fn create_attention_mask(&self, token_ids: &[i64]) -> Vec<i64> {
        token_ids
            .iter()
            .map(|&id| i64::from(id != self.pad_id))
            .collect()
    }

    /// All zeros: single-sequence models only
    pub fn create_token_type_ids(&self, length: usize) -> Vec<i64> {
        vec![0; length]
    }

    fn word_to_ids(&self, word: &str) -> Vec<i64> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(ids) = cache.get(word) {
                return ids.clone();
            }
        }

        let pieces = self.wordpiece_tokenize(word);
        let ids: Vec<i64> = pieces.iter().map(|p| self.token_id_for(p)).collect();

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(word.to_string(), ids.clone());
        }
        ids
    }

    /// Whole word if known, else greedy longest-prefix pieces with `##`
    /// continuations, else `[UNK]`.
    fn wordpiece_tokenize(&self, word: &str) -> Vec<String> {
        if !self.vocab_loaded {
            return vec![word.to_string()];
        }

        if self.token_to_id.contains_key(word) {
            return vec![word.to_string()];
        }

        let mut pieces = Vec::new();
        let mut start = 0;
        while start < word.len() {
            let mut end = word.len();
            let mut matched: Option<String> = None;

            while start < end {
                let candidate = if start > 0 {
                    format!("##{}", &word[start..end])
                } else {
                    word[start..end].to_string()
                };
                if self.token_to_id.contains_key(&candidate) {
                    matched = Some(candidate);
                    break;
                }
                end -= 1;
            }

            match matched {
                Some(piece) => {
                    pieces.push(piece);
                    start = end;
                }
                None => return vec!["[UNK]".to_string()],
            }
        }

        pieces
    }

    fn token_id_for(&self, token: &str) -> i64 {
        if let Some(&id) = self.token_to_id.get(token) {
            return id;
        }

        if self.vocab_loaded {
            return self.unk_id;
        }

        let hash = self.hasher.hash_one(token);
        let range = FALLBACK_VOCAB_SIZE - FALLBACK_MIN_ID;
        (hash % range + FALLBACK_MIN_ID) as i64
    }

    fn lookup_or(&self, token: &str, fallback: i64) -> i64 {
        self.token_to_id.get(token).copied().unwrap_or(fallback)
    }
}

/// Split text into lowercase ASCII-alphanumeric words. Non-alphanumeric
/// bytes separate words; any byte with the high bit set also forces a word
/// boundary, which keeps the scheme correct for non-ASCII text without full
/// Unicode normalization.
fn basic_tokenize(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();

    for &byte in text.as_bytes() {
        if byte & 0x80 != 0 || !byte.is_ascii_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(byte.to_ascii_lowercase() as char);
    }

    if !current.is_empty() {
        words.push(current);
    }

    words
}
