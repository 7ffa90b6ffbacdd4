//! `ChatSystem`: the authoritative in-memory log of messages for one chat
//! plus durable persistence (spec.md §4.2). Grounded on the teacher's
//! `communication/chat.rs` (`ChatMessage`/`insert`), generalized from one
//! global faction feed to one `ChatSystem` per `(game_id, chat_type,
//! owner_id)` row, with the doubly-linked message index the spec
//! describes.

use crate::core::models::{Chat, ChatId, ChatType, GameId, InterfaceType, Message, MessageKind, UserId};
use crate::core::system::SystemCore;
use crate::lib::error::{Code, ServerError};
use crate::lib::time::Time;
use crate::lib::Result;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, PgConnection, Postgres};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Message plus the neighbor ids it sits between after insertion, either
/// of which may be absent when the message is first/last in the chat.
#[derive(Debug, Clone, Serialize)]
pub struct MessageOutWithNeighbors {
    pub message: Message,
    pub previous_id: Option<i64>,
    pub next_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSegmentOut {
    pub messages: Vec<Message>,
    pub previous_id: Option<i64>,
    pub next_id: Option<i64>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    ChatMessageSentEvent {
        chat_id: ChatId,
        message: Message,
        previous_id: Option<i64>,
        next_id: Option<i64>,
    },
    ChatMessageEditEvent {
        chat_id: ChatId,
        message: Message,
    },
    ChatMessageDeletedEvent {
        chat_id: ChatId,
        message: Message,
    },
    ChatUpdatedSuggestions {
        chat_id: ChatId,
        suggestions: Vec<String>,
    },
}

/// One arena slot. Slots `0` and `1` are the dummy head/tail sentinels
/// and are never exposed to callers; every other slot holds a message.
struct Node {
    prev: usize,
    next: usize,
    message: Option<Message>,
}

const HEAD: usize = 0;
const TAIL: usize = 1;

struct Index {
    arena: Vec<Node>,
    by_id: HashMap<i64, usize>,
    suggestions: Vec<String>,
}

impl Index {
    fn empty() -> Self {
        Self {
            arena: vec![
                Node { prev: HEAD, next: TAIL, message: None },
                Node { prev: HEAD, next: TAIL, message: None },
            ],
            by_id: HashMap::new(),
            suggestions: Vec::new(),
        }
    }

    fn load(messages: Vec<Message>) -> Self {
        let mut index = Self::empty();
        for message in messages {
            index.push_back(message);
        }
        index
    }

    fn push_back(&mut self, message: Message) -> (Option<i64>, Option<i64>) {
        let id = message.id;
        let before_tail = self.arena[TAIL].prev;
        let slot = self.arena.len();
        self.arena.push(Node { prev: before_tail, next: TAIL, message: Some(message) });
        self.arena[before_tail].next = slot;
        self.arena[TAIL].prev = slot;
        self.by_id.insert(id, slot);

        let previous_id = self.real_message_at(before_tail).map(|m| m.id);
        (previous_id, None)
    }

    fn real_message_at(&self, slot: usize) -> Option<&Message> {
        if slot == HEAD || slot == TAIL {
            None
        } else {
            self.arena[slot].message.as_ref()
        }
    }

    fn peek(&self, id: i64) -> Result<Message> {
        let slot = *self.by_id.get(&id).ok_or_else(|| ServerError::domain(Code::MessageNotFound, "message not found"))?;
        Ok(self.arena[slot].message.clone().expect("indexed slot always holds a message"))
    }

    /// Overwrites the slot's message in place, keeping its arena position
    /// and neighbor links. Callers persist the new value to the database
    /// before calling this, never after.
    fn replace(&mut self, id: i64, message: Message) -> Result<()> {
        let slot = *self.by_id.get(&id).ok_or_else(|| ServerError::domain(Code::MessageNotFound, "message not found"))?;
        self.arena[slot].message = Some(message);
        Ok(())
    }

    fn unlink(&mut self, id: i64) -> Result<Message> {
        let slot = self
            .by_id
            .remove(&id)
            .ok_or_else(|| ServerError::domain(Code::MessageNotFound, "message not found"))?;
        let node = &self.arena[slot];
        let (prev, next) = (node.prev, node.next);
        self.arena[prev].next = next;
        self.arena[next].prev = prev;
        Ok(self.arena[slot].message.take().expect("indexed slot always holds a message"))
    }

    /// Walks forward starting strictly after `after` (or from the first
    /// real node when `after` is `None`), taking up to `limit` messages.
    fn walk_forward(&self, after: Option<i64>, limit: usize) -> Vec<Message> {
        let start = match after {
            None => self.arena[HEAD].next,
            Some(id) => self.by_id.get(&id).map(|&slot| self.arena[slot].next).unwrap_or(TAIL),
        };
        let mut out = Vec::new();
        let mut cur = start;
        while cur != TAIL && out.len() < limit {
            out.push(self.arena[cur].message.clone().expect("non-sentinel slot"));
            cur = self.arena[cur].next;
        }
        out
    }

    /// Walks backward starting from `before` inclusive (or the last real
    /// node when `before` is `None`), taking up to `limit`, then returned
    /// already sorted ascending by the caller.
    fn walk_backward(&self, before: Option<i64>, limit: usize) -> Vec<Message> {
        let start = match before {
            None => self.arena[TAIL].prev,
            Some(id) => *self.by_id.get(&id).unwrap_or(&HEAD),
        };
        let mut out = Vec::new();
        let mut cur = start;
        while cur != HEAD && out.len() < limit {
            out.push(self.arena[cur].message.clone().expect("non-sentinel slot"));
            cur = self.arena[cur].prev;
        }
        out.reverse();
        out
    }

    fn neighbors_of(&self, id: i64) -> (Option<i64>, Option<i64>) {
        match self.by_id.get(&id) {
            Some(&slot) => (
                self.real_message_at(self.arena[slot].prev).map(|m| m.id),
                self.real_message_at(self.arena[slot].next).map(|m| m.id),
            ),
            None => (None, None),
        }
    }
}

pub struct ChatSystem {
    pub id: ChatId,
    pub game_id: GameId,
    pub chat_type: ChatType,
    pub owner_id: Option<UserId>,
    pub interface_type: InterfaceType,
    core: SystemCore<ChatEvent>,
    index: Mutex<Index>,
}

impl ChatSystem {
    pub async fn create_or_load(
        conn: &mut PgConnection,
        game_id: GameId,
        chat_type: ChatType,
        owner_id: Option<UserId>,
        interface_type: InterfaceType,
    ) -> Result<Self> {
        let chat = match Chat::find_by_triple(game_id, chat_type, owner_id, conn).await? {
            Some(chat) => chat,
            None => {
                let chat = Chat {
                    id: ChatId::new(),
                    game_id,
                    chat_type,
                    owner_id,
                    interface_type,
                    deadline: None,
                };
                chat.insert(conn).await?;
                chat
            }
        };
        let messages = Message::find_by_chat(chat.id, conn).await?;
        Ok(Self {
            id: chat.id,
            game_id: chat.game_id,
            chat_type: chat.chat_type,
            owner_id: chat.owner_id,
            interface_type: chat.interface_type,
            core: SystemCore::new("chat", chat.id.into()),
            index: Mutex::new(Index::load(messages)),
        })
    }

    pub fn listen(&self) -> Result<tokio::sync::mpsc::UnboundedReceiver<ChatEvent>, &'static str> {
        self.core.listen()
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_message<E>(
        &self,
        exec: &mut E,
        kind: MessageKind,
        text: String,
        sender_id: Option<UserId>,
        special: Option<Value>,
        metadata: Option<Value>,
        sent_at: Option<Time>,
    ) -> Result<MessageOutWithNeighbors>
    where
        E: Executor<Database = Postgres>,
    {
        let sent_at = sent_at.unwrap_or_else(Time::now);
        let mut message = Message {
            id: 0,
            chat_id: self.id,
            sender_id,
            kind,
            text,
            special,
            metadata,
            sent_at,
        };
        message.id = message.insert(exec).await?;

        let mut index = self.index.lock().await;
        let (previous_id, _) = index.push_back(message.clone());
        drop(index);

        let out = MessageOutWithNeighbors { message: message.clone(), previous_id, next_id: None };
        self.core.emit(ChatEvent::ChatMessageSentEvent {
            chat_id: self.id,
            message,
            previous_id,
            next_id: None,
        });
        Ok(out)
    }

    /// Persists the edit before touching the in-memory index, so a failed
    /// update never leaves the index diverged from the database (matches
    /// `send_message`'s insert-then-index order).
    pub async fn edit_message<E>(
        &self,
        exec: &mut E,
        id: i64,
        text: String,
        special: Option<Value>,
        metadata: Option<Value>,
    ) -> Result<Message>
    where
        E: Executor<Database = Postgres>,
    {
        let mut message = {
            let index = self.index.lock().await;
            index.peek(id)?
        };
        message.text = text;
        message.special = special;
        message.metadata = metadata;

        let affected = message.update(exec).await?;
        ServerError::expect_one_row(affected, "message update")?;

        let mut index = self.index.lock().await;
        index.replace(id, message.clone())?;
        drop(index);

        self.core.emit(ChatEvent::ChatMessageEditEvent { chat_id: self.id, message: message.clone() });
        Ok(message)
    }

    /// Persists the delete before unlinking from the index, for the same
    /// reason as `edit_message`.
    pub async fn delete_message<E>(&self, exec: &mut E, id: i64) -> Result<Message>
    where
        E: Executor<Database = Postgres>,
    {
        let message = {
            let index = self.index.lock().await;
            index.peek(id)?
        };

        let affected = Message::remove(id, exec).await?;
        ServerError::expect_one_row(affected, "message delete")?;

        let mut index = self.index.lock().await;
        index.unlink(id)?;
        drop(index);

        self.core.emit(ChatEvent::ChatMessageDeletedEvent { chat_id: self.id, message: message.clone() });
        Ok(message)
    }

    pub async fn get_messages(&self, limit: i64, before: Option<i64>, after: Option<i64>) -> Result<ChatSegmentOut> {
        if before.is_some() && after.is_some() {
            return Err(ServerError::domain(Code::MutuallyExclusiveOptions, "before and after are mutually exclusive"));
        }
        let limit = limit.clamp(1, 500) as usize;
        let index = self.index.lock().await;

        let messages = if let Some(after) = after {
            index.walk_forward(Some(after), limit)
        } else {
            index.walk_backward(before, limit)
        };

        let previous_id = messages.first().and_then(|m| index.neighbors_of(m.id).0);
        let next_id = messages.last().and_then(|m| index.neighbors_of(m.id).1);

        Ok(ChatSegmentOut { messages, previous_id, next_id, suggestions: index.suggestions.clone() })
    }

    pub async fn add_suggestion(&self, suggestion: String) {
        let mut index = self.index.lock().await;
        index.suggestions.push(suggestion);
        let suggestions = index.suggestions.clone();
        drop(index);
        self.core.emit(ChatEvent::ChatUpdatedSuggestions { chat_id: self.id, suggestions });
    }

    pub async fn clear_suggestions(&self) {
        let mut index = self.index.lock().await;
        index.suggestions.clear();
        drop(index);
        self.core.emit(ChatEvent::ChatUpdatedSuggestions { chat_id: self.id, suggestions: Vec::new() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64) -> Message {
        Message {
            id,
            chat_id: ChatId::new(),
            sender_id: None,
            kind: MessageKind::Player,
            text: format!("m{}", id),
            special: None,
            metadata: None,
            sent_at: Time::now(),
        }
    }

    #[test]
    fn walk_forward_from_none_starts_at_first_node() {
        let index = Index::load(vec![msg(1), msg(2), msg(3)]);
        let out = index.walk_forward(None, 10);
        assert_eq!(out.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn walk_backward_from_none_starts_at_last_node() {
        let index = Index::load(vec![msg(1), msg(2), msg(3)]);
        let out = index.walk_backward(None, 2);
        assert_eq!(out.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn walk_forward_after_id_is_strictly_greater() {
        let index = Index::load(vec![msg(1), msg(2), msg(3)]);
        let out = index.walk_forward(Some(1), 10);
        assert_eq!(out.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn unlink_splices_neighbors() {
        let mut index = Index::load(vec![msg(1), msg(2), msg(3)]);
        index.unlink(2).unwrap();
        let out = index.walk_forward(None, 10);
        assert_eq!(out.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn edit_keeps_neighbor_pointers() {
        let mut index = Index::load(vec![msg(1), msg(2), msg(3)]);
        let mut message = index.peek(2).unwrap();
        message.text = "changed".into();
        index.replace(2, message).unwrap();
        let out = index.walk_forward(None, 10);
        assert_eq!(out[1].text, "changed");
        assert_eq!(out.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn peek_on_unknown_id_is_message_not_found() {
        let index = Index::load(vec![msg(1)]);
        assert!(matches!(index.peek(99), Err(ServerError::Domain(Code::MessageNotFound, ..))));
    }
}
