use crate::error::{EventingError, EventingResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 事件唯一标识（128 位随机 UUID），同时作为去重键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> EventingResult<Self> {
        let uuid = Uuid::parse_str(raw)?;
        Self::try_from(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<Uuid> for EventId {
    type Error = EventingError;

    fn try_from(value: Uuid) -> Result<Self, Self::Error> {
        if value.is_nil() {
            return Err(EventingError::validation("event id must not be the nil uuid"));
        }
        Ok(Self(value))
    }
}

impl From<EventId> for Uuid {
    fn from(value: EventId) -> Self {
        value.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nil_and_garbage() {
        assert!(EventId::parse("00000000-0000-0000-0000-000000000000").is_err());
        assert!(EventId::parse("not-a-uuid").is_err());
        let id = EventId::new();
        assert_eq!(EventId::parse(&id.to_string()).unwrap(), id);
    }
}
