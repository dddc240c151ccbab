use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use canser_proto::{NodeUuid, Result};
use nix::sys::inotify::{InitFlags, Inotify};

use crate::allocator::PortNumbers;
use crate::backend::socketcan::SocketBus;
use crate::backend::CanBus;
use crate::config::Config;
use crate::ports::PortTable;
use crate::{ping, reactor};

/// Everything the worker and the callers share, under one mutex.
pub struct MuxState {
    pub bus: Box<dyn CanBus>,
    pub notify: Inotify,
    pub ports: PortTable,
    pub numbers: PortNumbers,
    pub ping_cursor: usize,
    pub link_dir: PathBuf,
    pub link_prefix: String,
}

pub struct Shared {
    pub state: Mutex<MuxState>,
    pub stop: AtomicBool,
}

/// Lifecycle facade: owns the shared state and the multiplexer worker.
/// One init → run → shutdown cycle per value.
pub struct Gateway {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
pub struct PortInfo {
    pub number: u16,
    pub can_id: u16,
    pub uuid: NodeUuid,
    pub link_path: PathBuf,
    pub attached: bool,
    pub ping_credit: u8,
}

impl Gateway {
    /// Bind the configured CAN interface and start multiplexing.
    pub fn open(config: &Config) -> anyhow::Result<Gateway> {
        let bus = SocketBus::open(&config.interface)?;
        Gateway::new(Box::new(bus), config)
    }

    /// Start the gateway on an already opened bus.
    pub fn new(bus: Box<dyn CanBus>, config: &Config) -> anyhow::Result<Gateway> {
        let notify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(MuxState {
                bus,
                notify,
                ports: PortTable::new(),
                numbers: PortNumbers::new(),
                ping_cursor: 0,
                link_dir: config.link_dir.clone(),
                link_prefix: config.link_prefix(),
            }),
            stop: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("canserd-mux".to_owned())
            .spawn(move || reactor::run(worker_shared))?;

        Ok(Gateway {
            shared,
            worker: Some(worker),
        })
    }

    /// Transmit one frame, serialized with the multiplexer.
    pub fn send(&self, id: u16, payload: &[u8]) -> Result<()> {
        let state = self.shared.state.lock().unwrap();
        state.bus.send(id, payload)
    }

    /// One step of the liveness sweep; drive this from a periodic timer.
    pub fn ping(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        ping::sweep(&mut state)
    }

    pub fn ports(&self) -> Vec<PortInfo> {
        let state = self.shared.state.lock().unwrap();
        state
            .ports
            .iter()
            .map(|entry| PortInfo {
                number: entry.number,
                can_id: entry.can_id,
                uuid: entry.uuid,
                link_path: entry.link_path.clone(),
                attached: entry.attached,
                ping_credit: entry.ping_credit,
            })
            .collect()
    }

    /// Stop the worker and tear down every published port. Blocks until
    /// the worker has exited; the worker notices the flag within one
    /// poll interval.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("multiplexer worker panicked");
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
