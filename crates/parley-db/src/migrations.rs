use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                   TEXT PRIMARY KEY,
            email                TEXT NOT NULL UNIQUE,
            name                 TEXT NOT NULL,
            password             TEXT NOT NULL,
            public_key           TEXT,
            last_seen            TEXT NOT NULL DEFAULT (datetime('now')),
            conversations_count  INTEGER NOT NULL DEFAULT 0,
            created_at           TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- pair_lo/pair_hi are the two participant ids in sorted order; the
        -- UNIQUE constraint is the source of truth for at-most-one
        -- conversation per unordered pair and kind.
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL CHECK (kind IN ('private', 'secret')),
            pair_lo     TEXT NOT NULL REFERENCES users(id),
            pair_hi     TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(pair_lo, pair_hi, kind)
        );

        CREATE TABLE IF NOT EXISTS participants (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            user_id          TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS conversation_views (
            user_id                TEXT NOT NULL REFERENCES users(id),
            conversation_id        TEXT NOT NULL REFERENCES conversations(id),
            participant_id         TEXT NOT NULL REFERENCES users(id),
            messages_count         INTEGER NOT NULL DEFAULT 0,
            unread_messages_count  INTEGER NOT NULL DEFAULT 0,
            last_message_id        TEXT,
            updated_at             TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_id, conversation_id)
        );

        CREATE INDEX IF NOT EXISTS idx_views_user
            ON conversation_views(user_id, updated_at);

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            author_id        TEXT NOT NULL REFERENCES users(id),
            content_type     TEXT NOT NULL DEFAULT 'text/plain',
            content          TEXT NOT NULL,
            read             INTEGER NOT NULL DEFAULT 0,
            read_at          TEXT,
            edited           INTEGER NOT NULL DEFAULT 0,
            consumed         INTEGER,
            created_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        -- One row per non-author participant at send time; never for the
        -- author. The read transition is keyed off it.
        CREATE TABLE IF NOT EXISTS message_receipts (
            message_id    TEXT NOT NULL REFERENCES messages(id),
            recipient_id  TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (message_id, recipient_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
