use serde::Serialize;

pub type MessageId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Resolved,
    Errored,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Resolved | MessageStatus::Errored)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    Image {
        preview_url: String,
        file_name: String,
    },
    Audio {
        preview_url: String,
        file_name: String,
    },
    File {
        file_name: String,
    },
}

impl Attachment {
    pub fn file_name(&self) -> &str {
        match self {
            Attachment::Image { file_name, .. } => file_name,
            Attachment::Audio { file_name, .. } => file_name,
            Attachment::File { file_name } => file_name,
        }
    }

    // File attachments render as a name-only card; only Image/Audio carry a
    // visible media preview, which is what suppresses the progress body.
    pub fn has_preview(&self) -> bool {
        !matches!(self, Attachment::File { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub sender: Sender,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub status: MessageStatus,
}

impl Message {
    pub fn resolved(sender: Sender, body: impl Into<String>) -> Self {
        Self {
            sender,
            body: body.into(),
            attachment: None,
            status: MessageStatus::Resolved,
        }
    }

    pub fn pending(sender: Sender) -> Self {
        Self {
            sender,
            body: String::new(),
            attachment: None,
            status: MessageStatus::Pending,
        }
    }

    pub fn pending_upload(body: impl Into<String>, attachment: Attachment) -> Self {
        Self {
            sender: Sender::User,
            body: body.into(),
            attachment: Some(attachment),
            status: MessageStatus::Pending,
        }
    }

    pub fn errored(sender: Sender, body: impl Into<String>) -> Self {
        Self {
            sender,
            body: body.into(),
            attachment: None,
            status: MessageStatus::Errored,
        }
    }
}

// Append-only by construction: entries are never removed or reordered, and
// in-place mutation is only reachable from the session reducer.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) -> MessageId {
        self.entries.push(message);
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.entries.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.entries.get_mut(id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.clone()
    }

    // Recency heuristic used only for realtime events that carry no
    // correlation id: the most recently appended message still pending.
    pub fn last_pending(&self) -> Option<MessageId> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| m.status == MessageStatus::Pending)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_stable_positions() {
        let mut t = Transcript::new();
        let a = t.append(Message::resolved(Sender::User, "Hello"));
        let b = t.append(Message::pending(Sender::Assistant));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(t.len(), 2);

        let c = t.append(Message::pending(Sender::User));
        assert_eq!(c, 2);
        // Earlier entries keep their sender and position.
        assert_eq!(t.get(a).unwrap().sender, Sender::User);
        assert_eq!(t.get(a).unwrap().body, "Hello");
        assert_eq!(t.get(b).unwrap().sender, Sender::Assistant);
    }

    #[test]
    fn last_pending_picks_most_recent() {
        let mut t = Transcript::new();
        t.append(Message::resolved(Sender::User, "one"));
        let first = t.append(Message::pending(Sender::User));
        let second = t.append(Message::pending(Sender::User));
        assert_eq!(t.last_pending(), Some(second));

        t.get_mut(second).unwrap().status = MessageStatus::Resolved;
        assert_eq!(t.last_pending(), Some(first));

        t.get_mut(first).unwrap().status = MessageStatus::Errored;
        assert_eq!(t.last_pending(), None);
    }

    #[test]
    fn attachment_preview_rules() {
        let image = Attachment::Image {
            preview_url: "blob:1".to_string(),
            file_name: "photo.png".to_string(),
        };
        let file = Attachment::File {
            file_name: "notes.pdf".to_string(),
        };
        assert!(image.has_preview());
        assert!(!file.has_preview());
        assert_eq!(file.file_name(), "notes.pdf");
    }
}
