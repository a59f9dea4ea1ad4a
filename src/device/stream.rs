use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{DeviceError, DeviceErrorCode, DeviceMemory, DevicePtr};

/// Device-side work item. Runs on the stream worker with exclusive access to
/// device memory.
pub type Kernel = Box<dyn FnOnce(&mut DeviceMemory) -> Result<(), DeviceErrorCode> + Send>;

enum Command {
    HostToDevice { dst: DevicePtr, data: Vec<u8> },
    DeviceToHost { src: DevicePtr, len: usize },
    Launch { name: &'static str, kernel: Kernel },
}

impl Command {
    fn operation(&self) -> &'static str {
        match self {
            Command::HostToDevice { .. } => "memcpy_htod_async",
            Command::DeviceToHost { .. } => "memcpy_dtoh_async",
            Command::Launch { name, .. } => *name,
        }
    }
}

#[derive(Default)]
struct Progress {
    submitted: u64,
    completed: u64,
    error: Option<DeviceError>,
}

struct Shared {
    progress: Mutex<Progress>,
    idle: Condvar,
    staging: Mutex<Vec<u8>>,
}

/// In-order command queue bound to one device.
///
/// Copies and launches return as soon as they are queued. The first failing
/// command poisons the stream: everything queued after it is skipped and new
/// work is refused with the original error.
pub struct Stream {
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    ordinal: u32,
}

impl Stream {
    pub(super) fn spawn(
        ordinal: u32,
        memory: Arc<Mutex<DeviceMemory>>,
    ) -> Result<Self, DeviceError> {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            progress: Mutex::new(Progress::default()),
            idle: Condvar::new(),
            staging: Mutex::new(Vec::new()),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("dynplan-stream-{}", ordinal))
            .spawn(move || run_worker(receiver, memory, worker_shared))
            .map_err(|_| DeviceError::new("stream_create", DeviceErrorCode::LaunchFailure))?;
        debug!(ordinal, "created stream");
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            shared,
            ordinal,
        })
    }

    pub fn memcpy_htod_async(&self, dst: DevicePtr, data: Vec<u8>) -> Result<(), DeviceError> {
        self.submit(Command::HostToDevice { dst, data })
    }

    /// Queue a device-to-host copy into the stream's staging buffer.
    pub fn memcpy_dtoh_async(&self, src: DevicePtr, len: usize) -> Result<(), DeviceError> {
        self.submit(Command::DeviceToHost { src, len })
    }

    pub fn launch(&self, name: &'static str, kernel: Kernel) -> Result<(), DeviceError> {
        self.submit(Command::Launch { name, kernel })
    }

    /// Block until every queued command has run.
    pub fn synchronize(&self) -> Result<(), DeviceError> {
        let mut progress = self.shared.progress.lock();
        while progress.completed < progress.submitted {
            self.shared.idle.wait(&mut progress);
        }
        match &progress.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Hand out the staging buffer. Only valid once the stream is idle.
    pub fn take_staged(&self) -> Result<Vec<u8>, DeviceError> {
        let progress = self.shared.progress.lock();
        if let Some(err) = &progress.error {
            return Err(err.clone());
        }
        if progress.completed < progress.submitted {
            return Err(DeviceError::new("stream_query", DeviceErrorCode::NotReady));
        }
        Ok(std::mem::take(&mut *self.shared.staging.lock()))
    }

    /// Number of commands accepted since the stream was created.
    pub fn submitted(&self) -> u64 {
        self.shared.progress.lock().submitted
    }

    pub fn is_poisoned(&self) -> bool {
        self.shared.progress.lock().error.is_some()
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    fn submit(&self, command: Command) -> Result<(), DeviceError> {
        let operation = command.operation();
        let mut progress = self.shared.progress.lock();
        if let Some(err) = &progress.error {
            return Err(err.clone());
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| DeviceError::new(operation, DeviceErrorCode::LaunchFailure))?;
        sender
            .send(command)
            .map_err(|_| DeviceError::new(operation, DeviceErrorCode::LaunchFailure))?;
        progress.submitted += 1;
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(receiver: Receiver<Command>, memory: Arc<Mutex<DeviceMemory>>, shared: Arc<Shared>) {
    for command in receiver {
        let operation = command.operation();
        let poisoned = shared.progress.lock().error.is_some();
        let outcome = if poisoned {
            Ok(())
        } else {
            execute(command, &memory, &shared.staging)
        };

        let mut progress = shared.progress.lock();
        if let Err(code) = outcome {
            warn!(operation, %code, "stream poisoned");
            progress.error = Some(DeviceError::new(operation, code));
        }
        progress.completed += 1;
        shared.idle.notify_all();
    }
}

fn execute(
    command: Command,
    memory: &Mutex<DeviceMemory>,
    staging: &Mutex<Vec<u8>>,
) -> Result<(), DeviceErrorCode> {
    let mut memory = memory.lock();
    match command {
        Command::HostToDevice { dst, data } => {
            let region = memory.region_mut(dst)?;
            region
                .get_mut(..data.len())
                .ok_or(DeviceErrorCode::IllegalAddress)?
                .copy_from_slice(&data);
        }
        Command::DeviceToHost { src, len } => {
            let region = memory.region(src)?;
            let bytes = region.get(..len).ok_or(DeviceErrorCode::IllegalAddress)?;
            let mut staging = staging.lock();
            staging.clear();
            staging.extend_from_slice(bytes);
        }
        Command::Launch { kernel, .. } => kernel(&mut *memory)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::device::{Device, DeviceErrorCode, DeviceMemory};

    #[test]
    fn commands_run_in_order() {
        let device = Device::with_capacity(1 << 16);
        let buffer = device.malloc(4).unwrap();
        let stream = device.create_stream().unwrap();
        let ptr = buffer.ptr();

        stream.memcpy_htod_async(ptr, vec![1, 2, 3, 4]).unwrap();
        stream
            .launch(
                "increment",
                Box::new(move |memory: &mut DeviceMemory| {
                    for byte in memory.region_mut(ptr)? {
                        *byte += 10;
                    }
                    Ok(())
                }),
            )
            .unwrap();
        stream.memcpy_dtoh_async(ptr, 4).unwrap();
        stream.synchronize().unwrap();

        assert_eq!(stream.submitted(), 3);
        assert_eq!(stream.take_staged().unwrap(), vec![11, 12, 13, 14]);
    }

    #[test]
    fn first_failure_poisons_the_stream() {
        let device = Device::with_capacity(1 << 16);
        let buffer = device.malloc(4).unwrap();
        let stream = device.create_stream().unwrap();

        stream
            .launch(
                "faulty",
                Box::new(|_: &mut DeviceMemory| Err(DeviceErrorCode::LaunchFailure)),
            )
            .unwrap();
        let err = stream.synchronize().unwrap_err();
        assert_eq!(err.operation, "faulty");
        assert_eq!(err.code, DeviceErrorCode::LaunchFailure);
        assert!(stream.is_poisoned());

        let refused = stream.memcpy_htod_async(buffer.ptr(), vec![0; 4]).unwrap_err();
        assert_eq!(refused, err);
        assert_eq!(stream.submitted(), 1);
        assert!(stream.take_staged().is_err());
    }

    #[test]
    fn copies_to_freed_memory_are_illegal() {
        let device = Device::with_capacity(1 << 16);
        let buffer = device.malloc(4).unwrap();
        let ptr = buffer.ptr();
        buffer.release().unwrap();

        let stream = device.create_stream().unwrap();
        stream.memcpy_htod_async(ptr, vec![0; 4]).unwrap();
        let err = stream.synchronize().unwrap_err();
        assert_eq!(err.operation, "memcpy_htod_async");
        assert_eq!(err.code, DeviceErrorCode::IllegalAddress);
    }
}
