mod list_cache;
mod local_store;
mod queue;
mod work_file;

pub use list_cache::*;
pub use local_store::*;
pub use queue::*;
pub use work_file::*;

/// Hidden sibling directory holding work-file sidecars, e.g. the sidecar for
/// `/docs/a.txt` lives at `/docs/.rq/a.txt`. Never synchronized and never
/// listed.
pub const WORK_DIR_NAME: &str = ".rq";

/// Queue persistence file under the configured work path.
pub const QUEUE_FILE_NAME: &str = "queue.jsonl";
