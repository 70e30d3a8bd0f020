/// Process state: the fd table and the AIO context table, both with
/// lowest-free-slot id allocation under the process lock. The unikernel
/// runs a single process; tests build their own.
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use super::aio::Aio;
use super::blockq::Blockq;
use super::fdesc::Fdesc;

struct ProcInner {
    files: Vec<Option<Arc<dyn Fdesc>>>,
    aio: Vec<Option<Arc<Aio>>>,
}

pub struct Process {
    inner: Mutex<ProcInner>,
}

impl Process {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ProcInner { files: Vec::new(), aio: Vec::new() }),
        })
    }

    // ---- fd table ----

    /// Install a descriptor at the lowest free slot; returns the fd.
    pub fn install_fd(&self, f: Arc<dyn Fdesc>) -> u32 {
        let mut inner = self.inner.lock();
        match inner.files.iter().position(|e| e.is_none()) {
            Some(slot) => {
                inner.files[slot] = Some(f);
                slot as u32
            }
            None => {
                inner.files.push(Some(f));
                (inner.files.len() - 1) as u32
            }
        }
    }

    pub fn fd_get(&self, fd: u32) -> Option<Arc<dyn Fdesc>> {
        self.inner.lock().files.get(fd as usize)?.clone()
    }

    pub fn close_fd(&self, fd: u32) -> Option<Arc<dyn Fdesc>> {
        self.inner.lock().files.get_mut(fd as usize)?.take()
    }

    // ---- AIO context table ----

    /// Record a context at the lowest free id.
    pub fn aio_register(&self, aio: Arc<Aio>) -> u32 {
        let mut inner = self.inner.lock();
        match inner.aio.iter().position(|e| e.is_none()) {
            Some(slot) => {
                inner.aio[slot] = Some(aio);
                slot as u32
            }
            None => {
                inner.aio.push(Some(aio));
                (inner.aio.len() - 1) as u32
            }
        }
    }

    pub fn aio_get(&self, id: u32) -> Option<Arc<Aio>> {
        self.inner.lock().aio.get(id as usize)?.clone()
    }

    /// Remove a context from the table, ending resolution of its id.
    pub fn aio_remove(&self, id: u32) -> Option<Arc<Aio>> {
        self.inner.lock().aio.get_mut(id as usize)?.take()
    }
}

/// A kernel-visible thread: its blockq plus nothing else this core
/// needs. Blocking syscalls park on `bq`; a signal nullifies it.
pub struct Task {
    pub bq: Arc<Blockq>,
}

impl Task {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { bq: Blockq::new() })
    }
}

static CURRENT: Once<Arc<Process>> = Once::new();

/// The single process of this unikernel.
pub fn current() -> Arc<Process> {
    CURRENT.call_once(Process::new).clone()
}
