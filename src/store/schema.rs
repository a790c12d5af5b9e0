//! Database schema

pub const SCHEMA: &str = r"
-- One serialized session record per user
CREATE TABLE IF NOT EXISTS sessions (
    user_id INTEGER PRIMARY KEY,
    record TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS banned_users (
    user_id INTEGER PRIMARY KEY,
    reason TEXT NOT NULL,
    banned_at TEXT NOT NULL
);
";
