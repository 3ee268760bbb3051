mod atomic_write;

pub use atomic_write::{read_json, write_json_atomic, RecordLock};
