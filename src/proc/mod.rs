/*
 * Process/thread subsystem: control blocks, the pid table, thread groups,
 * wait queues, cloning and the exit/wait lifecycle.
 */

pub mod clone;
pub mod lifecycle;
pub mod table;
pub mod thread;
pub mod thread_group;
pub mod tq;

/// Filesystem state (root/cwd). The VFS is an external collaborator; the
/// core only shares or copies this refcounted handle per CLONE_FS.
#[derive(Debug, Default)]
pub struct FsStruct {
    _private: (),
}

impl FsStruct {
    pub fn new() -> Self {
        FsStruct { _private: () }
    }
}

/// File-descriptor table handle, shared per CLONE_FILES. Contents belong
/// to the VFS layer.
#[derive(Debug, Default)]
pub struct FdTable {
    _private: (),
}

impl FdTable {
    pub fn new() -> Self {
        FdTable { _private: () }
    }
}

pub use thread::{Pid, Thread, ThreadState};
