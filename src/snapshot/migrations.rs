pub const BASE_MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS vote_observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    observed_at TEXT NOT NULL,
    board TEXT NOT NULL,
    candidate_name TEXT NOT NULL,
    percent REAL NOT NULL,
    real_percent REAL
);
CREATE INDEX IF NOT EXISTS idx_observations_board_observed
    ON vote_observations(board, observed_at);
CREATE INDEX IF NOT EXISTS idx_observations_candidate
    ON vote_observations(candidate_name);

CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;
