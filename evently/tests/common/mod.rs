//! Aggregates shared by the integration tests.
#![allow(missing_docs)]

use std::collections::BTreeMap;

use evently::{Aggregate, Error, Event, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCreated {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserUpdated {
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Event)]
pub enum UserEvent {
    UserCreated(UserCreated),
    UserUpdated(UserUpdated),
    UserDeactivated,
}

pub fn created(email: &str, name: &str) -> UserEvent {
    UserEvent::UserCreated(UserCreated {
        email: email.into(),
        name: name.into(),
    })
}

pub fn email_changed(email: &str) -> UserEvent {
    UserEvent::UserUpdated(UserUpdated {
        email: Some(email.into()),
        name: None,
    })
}

/// A user whose state snapshots as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    pub name: String,
    pub active: bool,
    pub registered: bool,
}

impl Aggregate for User {
    type Id = Uuid;
    type Event = UserEvent;
    const TYPE: &'static str = "User";

    fn apply(&mut self, event: &Self::Event) -> Result<()> {
        match event {
            UserEvent::UserCreated(e) => {
                if self.registered {
                    return Err(Error::Domain("user already exists".into()));
                }
                self.email.clone_from(&e.email);
                self.name.clone_from(&e.name);
                self.active = true;
                self.registered = true;
            }
            UserEvent::UserUpdated(e) => {
                if !self.active {
                    return Err(Error::Domain("user is not active".into()));
                }
                if let Some(email) = &e.email {
                    self.email.clone_from(email);
                }
                if let Some(name) = &e.name {
                    self.name.clone_from(name);
                }
            }
            UserEvent::UserDeactivated => {
                if !self.active {
                    return Err(Error::Domain("user is not active".into()));
                }
                self.active = false;
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::EventSerializationFailed {
            event_type: Self::TYPE.into(),
            reason: e.to_string(),
        })
    }

    fn restore(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::EventSerializationFailed {
            event_type: Self::TYPE.into(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tallied {
    pub amount: i64,
}

/// A payload JSON cannot encode: map keys must be strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unencodable {
    pub cells: BTreeMap<(u8, u8), u8>,
}

impl Unencodable {
    pub fn new() -> Self {
        Self {
            cells: BTreeMap::from([((0, 0), 1)]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Event)]
pub enum TallyEvent {
    Tallied(Tallied),
    Unencodable(Unencodable),
}

/// An aggregate without snapshot hooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    pub total: i64,
    pub entries: usize,
}

impl Aggregate for Tally {
    type Id = String;
    type Event = TallyEvent;
    const TYPE: &'static str = "Tally";

    fn apply(&mut self, event: &Self::Event) -> Result<()> {
        match event {
            TallyEvent::Tallied(e) => self.total += e.amount,
            TallyEvent::Unencodable(_) => {}
        }
        self.entries += 1;
        Ok(())
    }
}

pub fn tallied(amount: i64) -> TallyEvent {
    TallyEvent::Tallied(Tallied { amount })
}
