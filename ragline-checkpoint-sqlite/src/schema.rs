pub const CHECKPOINTS_TABLE: &str = "checkpoints";
pub const CONVERSATIONS_TABLE: &str = "conversations";
pub const FAILURES_TABLE: &str = "failures";
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_CHECKPOINTS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS checkpoints (\
    run_id TEXT NOT NULL,\
    step INTEGER NOT NULL,\
    conversation_id TEXT NOT NULL,\
    state_blob TEXT NOT NULL,\
    next_node TEXT NOT NULL,\
    status TEXT NOT NULL,\
    created_at TEXT NOT NULL,\
    PRIMARY KEY (run_id, step)\
)";

pub const CREATE_CONVERSATIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS conversations (\
    conversation_id TEXT PRIMARY KEY,\
    run_id TEXT NOT NULL,\
    updated_at TEXT NOT NULL\
)";

pub const CREATE_FAILURES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS failures (\
    run_id TEXT PRIMARY KEY,\
    step INTEGER NOT NULL,\
    reason TEXT NOT NULL,\
    created_at TEXT NOT NULL\
)";

pub const CREATE_CHECKPOINTS_CONVERSATION_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_conversation ON checkpoints (conversation_id)";

pub const MIGRATION_STATEMENTS_SQL: [&str; 4] = [
    CREATE_CHECKPOINTS_TABLE_SQL,
    CREATE_CONVERSATIONS_TABLE_SQL,
    CREATE_FAILURES_TABLE_SQL,
    CREATE_CHECKPOINTS_CONVERSATION_INDEX_SQL,
];

pub(crate) const SELECT_CHECKPOINT_COLUMNS: &str =
    "SELECT run_id, step, conversation_id, state_blob, next_node, status, created_at FROM checkpoints";
