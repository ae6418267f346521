//! Shared fixtures for pipeline tests: an in-memory database, seeded users,
//! and a Notifier that records fan-out instead of opening sockets.

use std::sync::Mutex;

use uuid::Uuid;

use parley_db::{Database, models::UserRow, now_rfc3339, queries};
use parley_gateway::Notify;
use parley_types::api::Claims;
use parley_types::events::GatewayEvent;

use crate::auth::fingerprint;

pub struct RecordingNotifier {
    events: Mutex<Vec<(Uuid, GatewayEvent)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<(Uuid, GatewayEvent)> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl Notify for RecordingNotifier {
    fn publish(&self, user_id: Uuid, event: GatewayEvent) {
        self.events.lock().unwrap().push((user_id, event));
    }
}

pub fn seed_user(db: &Database, name: &str) -> UserRow {
    let user = UserRow {
        id: Uuid::new_v4().to_string(),
        email: format!("{name}@example.com"),
        name: name.to_string(),
        password: format!("{name}-argon2-hash"),
        public_key: Some(format!("{name}-public-key")),
        last_seen: now_rfc3339(),
        conversations_count: 0,
        created_at: now_rfc3339(),
    };
    db.with_conn(|conn| queries::insert_user(conn, &user)).unwrap();
    user
}

pub fn claims_for(user: &UserRow) -> Claims {
    Claims {
        sub: user.id.parse().unwrap(),
        fpr: fingerprint(&user.password),
        exp: usize::MAX,
    }
}
