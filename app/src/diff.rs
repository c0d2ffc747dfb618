//! Maps free-form edits of the local text field onto the append/backspace
//! wire protocol, and replays the peer's stream onto a display buffer.
//!
//! The wire has no cursor addressing, so only edits at the tail or inside
//! the trailing word are transmissible; anything further left is rejected
//! and the field is restored. Counts are in characters, not bytes.

use rtp_text::TextEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// Transmit these events; the engine has adopted the new text.
    Send(Vec<TextEvent>),
    /// Nothing changed on the wire (e.g. an editor's no-op replacement).
    Unchanged,
    /// The edit is not transmissible; restore the field to this text.
    Rejected { restore: String },
}

#[derive(Debug, Default)]
pub struct TextDiffEngine {
    current: Vec<char>,
}

impl TextDiffEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> String {
        self.current.iter().collect()
    }

    /// Observe the field's new content, deriving the minimal single edit
    /// against the previous content.
    pub fn observe(&mut self, new_text: &str) -> EditOutcome {
        let new: Vec<char> = new_text.chars().collect();
        let old = &self.current;

        let prefix = old
            .iter()
            .zip(new.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take_while(|(a, b)| a == b)
            .take(max_suffix)
            .count();

        let deleted = old.len() - prefix - suffix;
        let inserted = new.len() - prefix - suffix;
        self.on_edit(new_text, prefix, deleted, inserted)
    }

    /// Observe an edit already described as `(start, deleted, inserted)`
    /// against the previous content.
    pub fn on_edit(
        &mut self,
        new_text: &str,
        start: usize,
        deleted: usize,
        inserted: usize,
    ) -> EditOutcome {
        let new: Vec<char> = new_text.chars().collect();
        let old_len = self.current.len();

        if start + deleted > old_len || start + inserted > new.len() {
            log::warn!("inconsistent edit notification; reverting field");
            return EditOutcome::Rejected {
                restore: self.current(),
            };
        }

        let touches_tail = start + deleted == old_len;
        let word_start = trailing_word_start(&self.current);

        let events = if touches_tail {
            classify_tail_edit(
                &self.current[start..start + deleted],
                &new[start..start + inserted],
            )
        } else if start >= word_start {
            // An interior edit of the trailing word: erase back to the word
            // start and retransmit the whole word.
            let erase = old_len - word_start;
            let word: String = new[word_start..].iter().collect();
            let mut events = Vec::new();
            if erase > 0 {
                events.push(TextEvent::Backspace(clamp_count(erase)));
            }
            if !word.is_empty() {
                events.push(TextEvent::Append(word));
            }
            events
        } else {
            return EditOutcome::Rejected {
                restore: self.current(),
            };
        };

        self.current = new;
        if events.is_empty() {
            EditOutcome::Unchanged
        } else {
            EditOutcome::Send(events)
        }
    }
}

/// Sub-classify an edit that replaces `removed` at the tail with `added`.
fn classify_tail_edit(removed: &[char], added: &[char]) -> Vec<TextEvent> {
    let overlap = removed
        .iter()
        .zip(added.iter())
        .take_while(|(a, b)| a == b)
        .count();

    if overlap == removed.len() {
        // Kept tail intact: pure append (empty when the "replacement" was a
        // no-op, a common editor quirk around word boundaries).
        let rest: String = added[overlap..].iter().collect();
        if rest.is_empty() {
            Vec::new()
        } else {
            vec![TextEvent::Append(rest)]
        }
    } else if overlap == added.len() {
        // Kept prefix intact: pure deletion of the shortfall.
        vec![TextEvent::Backspace(clamp_count(removed.len() - overlap))]
    } else {
        let text: String = added.iter().collect();
        vec![
            TextEvent::Backspace(clamp_count(removed.len())),
            TextEvent::Append(text),
        ]
    }
}

/// Index of the first character after the last whitespace.
fn trailing_word_start(text: &[char]) -> usize {
    text.iter()
        .rposition(|c| c.is_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0)
}

fn clamp_count(count: usize) -> u16 {
    count.try_into().unwrap_or(u16::MAX)
}

/// Receive side: the exact left inverse of the encode side.
#[derive(Debug, Default)]
pub struct DisplayBuffer {
    text: String,
}

impl DisplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &TextEvent) {
        match event {
            TextEvent::Append(s) => self.text.push_str(s),
            TextEvent::Backspace(count) => {
                for _ in 0..*count {
                    if self.text.pop().is_none() {
                        break;
                    }
                }
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}
