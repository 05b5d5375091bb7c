pub const CREATE_CLIPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS clips (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  fingerprint TEXT NOT NULL UNIQUE,
  content TEXT NOT NULL CHECK (length(content) > 0),
  pinned INTEGER NOT NULL DEFAULT 0 CHECK (pinned IN (0, 1)),
  created_at TEXT NOT NULL,
  record TEXT NOT NULL
);
"#;

pub const CREATE_SETTINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  history_limit INTEGER NOT NULL DEFAULT 500,
  tracking_paused INTEGER NOT NULL DEFAULT 0 CHECK (tracking_paused IN (0, 1)),
  max_clip_bytes INTEGER NOT NULL DEFAULT 10485760
);
"#;

pub const CREATE_INDEX_CREATED_AT: &str =
    "CREATE INDEX IF NOT EXISTS idx_created_at ON clips(created_at DESC);";
pub const CREATE_INDEX_PINNED: &str = "CREATE INDEX IF NOT EXISTS idx_pinned ON clips(pinned);";
