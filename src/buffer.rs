use std::collections::VecDeque;

use crate::message::Message;

pub const DEFAULT_BUFFER_SIZE: usize = 10;

/// Bounded in-session transcript. Oldest messages are evicted first.
#[derive(Clone, Debug)]
pub struct ConversationBuffer {
    messages: VecDeque<Message>,
    max_length: usize,
}

impl Default for ConversationBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl ConversationBuffer {
    pub fn new(max_length: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(max_length),
            max_length,
        }
    }

    pub fn push(&mut self, message: Message) {
        if self.max_length == 0 {
            return;
        }
        while self.messages.len() >= self.max_length {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.push(message);
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.messages.iter()
    }

    /// Snapshot in chronological order, ready to hand to a model.
    pub fn history(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.back()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut buffer = ConversationBuffer::new(3);
        for i in 0..5 {
            buffer.push(Message::user(format!("m{i}")));
        }

        let contents: Vec<&str> = buffer.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn never_exceeds_bound_across_mixed_appends() {
        let mut buffer = ConversationBuffer::new(4);
        let mut pushed = Vec::new();
        for round in 0..7 {
            let batch: Vec<Message> = (0..round)
                .map(|i| Message::assistant(format!("r{round}-{i}")))
                .collect();
            pushed.extend(batch.iter().map(|m| m.content.clone()));
            buffer.extend(batch);
            assert!(buffer.len() <= 4);

            let expected: Vec<String> = pushed.iter().rev().take(4).rev().cloned().collect();
            let actual: Vec<String> = buffer.iter().map(|m| m.content.clone()).collect();
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn zero_bound_keeps_nothing() {
        let mut buffer = ConversationBuffer::new(0);
        buffer.push(Message::user("dropped"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn default_bound_is_ten() {
        assert_eq!(ConversationBuffer::default().max_length(), 10);
    }
}
