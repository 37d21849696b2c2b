//! On-disk cache of downloaded frames.
//!
//! Frames are stored per archive host and per version:
//!
//! ```text
//! <working_dir>/cache/archive/<host_hash>/
//!     inprogress/frames/<frame_id>/versions/<version_id>/<basename><ext>
//!     completed/frames/<frame_id>/versions/<version_id>/<basename><ext>
//!     completed/frames/<frame_id>/versions/latest -> <version_id>
//! ```
//!
//! Downloads stream into `inprogress` and are renamed into `completed` only
//! once the body has been fully written. The `latest` alias is a directory
//! symlink that is swapped atomically, so readers never observe a partial
//! file or a missing alias.

mod frame_cache;

pub use frame_cache::{host_hash, FrameCache, LocalFrame};
