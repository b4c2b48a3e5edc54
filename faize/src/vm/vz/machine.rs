//! Virtualization.framework machine wrapper.
//!
//! `VZVirtualMachine` demands that every call happen on the dispatch queue
//! it was created with, and its Objective-C handle is not `Send`. Both
//! constraints are satisfied by confining the VM to a dedicated OS thread
//! that owns the handle and a serial dispatch queue; the async world talks
//! to it through a command channel and observes state through a `watch`
//! channel the thread refreshes.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use block2::RcBlock;
use dispatch2::DispatchQueue;
use objc2::rc::Retained;
use objc2::AnyThread;
use objc2_foundation::{NSArray, NSError, NSFileHandle, NSString, NSURL};
use objc2_virtualization::{
    VZDiskImageStorageDeviceAttachment, VZFileHandleSerialPortAttachment, VZLinuxBootLoader,
    VZNATNetworkDeviceAttachment, VZSharedDirectory, VZSingleDirectoryShare,
    VZVirtioBlockDeviceConfiguration, VZVirtioConsoleDeviceSerialPortConfiguration,
    VZVirtioEntropyDeviceConfiguration, VZVirtioFileSystemDeviceConfiguration,
    VZVirtioNetworkDeviceConfiguration, VZVirtualMachine, VZVirtualMachineConfiguration,
    VZVirtualMachineState,
};

use crate::console::GuestConsole;
use crate::errors::{FaizeError, FaizeResult};
use crate::session::VmMount;

/// Host-side view of the machine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl MachineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MachineState::Stopped | MachineState::Error)
    }
}

/// Everything the device graph is assembled from.
pub struct MachineSpec {
    pub kernel_path: PathBuf,
    pub command_line: String,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub rootfs_path: PathBuf,
    pub console: GuestConsole,
    pub mounts: Vec<VmMount>,
}

enum Command {
    Start(mpsc::Sender<FaizeResult<()>>),
    RequestStop(mpsc::Sender<FaizeResult<()>>),
    ForceStop(mpsc::Sender<FaizeResult<()>>),
    Shutdown,
}

/// Handle to a machine confined to its own thread.
pub struct VzMachine {
    commands: mpsc::Sender<Command>,
    state_rx: tokio::sync::watch::Receiver<MachineState>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl VzMachine {
    /// Build the device graph, validate the configuration, and allocate
    /// the machine. Returns once the VM exists (or the framework refused).
    pub fn build(spec: MachineSpec) -> FaizeResult<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<FaizeResult<()>>();
        let (state_tx, state_rx) = tokio::sync::watch::channel(MachineState::Created);

        let thread = std::thread::Builder::new()
            .name("faize-vz".into())
            .spawn(move || machine_thread(spec, cmd_rx, ready_tx, state_tx))
            .map_err(|e| FaizeError::Vm(format!("failed to spawn VM thread: {e}")))?;

        // Propagate configuration/validation failures synchronously.
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: cmd_tx,
                state_rx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(FaizeError::Vm("VM thread exited during setup".into()))
            }
        }
    }

    /// Subscribe to machine state changes.
    pub fn state_stream(&self) -> tokio::sync::watch::Receiver<MachineState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> MachineState {
        *self.state_rx.borrow()
    }

    pub async fn start(&self) -> FaizeResult<()> {
        self.roundtrip(Command::Start).await
    }

    /// Ask the guest to power off. Errors if the guest cannot be asked.
    pub async fn request_stop(&self) -> FaizeResult<()> {
        self.roundtrip(Command::RequestStop).await
    }

    /// Force the machine off.
    pub async fn force_stop(&self) -> FaizeResult<()> {
        self.roundtrip(Command::ForceStop).await
    }

    async fn roundtrip(
        &self,
        make: impl FnOnce(mpsc::Sender<FaizeResult<()>>) -> Command,
    ) -> FaizeResult<()> {
        let (tx, rx) = mpsc::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| FaizeError::Vm("VM thread is gone".into()))?;
        tokio::task::spawn_blocking(move || {
            rx.recv()
                .unwrap_or_else(|_| Err(FaizeError::Vm("VM thread is gone".into())))
        })
        .await
        .map_err(|e| FaizeError::Vm(format!("VM call failed: {e}")))?
    }
}

impl Drop for VzMachine {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The VM thread: owns the Objective-C handle and its dispatch queue,
/// services commands, and refreshes the state channel between commands.
fn machine_thread(
    spec: MachineSpec,
    commands: mpsc::Receiver<Command>,
    ready: mpsc::Sender<FaizeResult<()>>,
    state_tx: tokio::sync::watch::Sender<MachineState>,
) {
    let queue = DispatchQueue::new("ai.faize.vm", None);

    let vm = match build_machine(&spec, &queue) {
        Ok(vm) => {
            let _ = ready.send(Ok(()));
            vm
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    // The serial device holds its own descriptors now; release the guest
    // ends so the broker observes EOF when the machine goes away.
    drop(spec);

    loop {
        // Poll state between commands so subscribers see guest-initiated
        // stops without any host action.
        let command = match commands.recv_timeout(Duration::from_millis(100)) {
            Ok(command) => Some(command),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let current = read_state(&vm, &queue);
        state_tx.send_if_modified(|state| {
            if *state != current {
                *state = current;
                true
            } else {
                false
            }
        });

        match command {
            None => continue,
            Some(Command::Shutdown) => break,
            Some(Command::Start(reply)) => {
                let _ = reply.send(start_machine(&vm, &queue));
            }
            Some(Command::RequestStop(reply)) => {
                let _ = reply.send(request_stop_machine(&vm, &queue));
            }
            Some(Command::ForceStop(reply)) => {
                let _ = reply.send(force_stop_machine(&vm, &queue));
            }
        }
    }

    let final_state = read_state(&vm, &queue);
    let _ = state_tx.send(final_state);
}

fn ns_url(path: &Path) -> Retained<NSURL> {
    let path = NSString::from_str(&path.to_string_lossy());
    unsafe { NSURL::fileURLWithPath(&path) }
}

fn vm_error(op: &str, err: &NSError) -> FaizeError {
    FaizeError::Vm(format!("{op}: {}", err.localizedDescription()))
}

/// Assemble the device graph in the order the framework expects:
/// entropy first, then storage, serial, network, and the directory shares.
fn build_machine(
    spec: &MachineSpec,
    queue: &DispatchQueue,
) -> FaizeResult<Retained<VZVirtualMachine>> {
    unsafe {
        let boot_loader =
            VZLinuxBootLoader::initWithKernelURL(VZLinuxBootLoader::alloc(), &ns_url(&spec.kernel_path));
        boot_loader.setCommandLine(&NSString::from_str(&spec.command_line));

        let config = VZVirtualMachineConfiguration::new();
        config.setBootLoader(Some(&boot_loader));
        config.setCPUCount(spec.cpus as usize);
        config.setMemorySize(spec.memory_bytes);

        // Entropy device first; macOS 12+ refuses to boot without one.
        let entropy = VZVirtioEntropyDeviceConfiguration::new();
        config.setEntropyDevices(&NSArray::from_retained_slice(&[Retained::into_super(
            entropy,
        )]));

        // Root disk, read-only: the in-guest overlay provides writes.
        let disk = VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
            VZDiskImageStorageDeviceAttachment::alloc(),
            &ns_url(&spec.rootfs_path),
            true,
        )
        .map_err(|e| vm_error("failed to create disk attachment", &e))?;
        let block = VZVirtioBlockDeviceConfiguration::initWithAttachment(
            VZVirtioBlockDeviceConfiguration::alloc(),
            &disk,
        );
        config.setStorageDevices(&NSArray::from_retained_slice(&[Retained::into_super(
            block,
        )]));

        // Serial console backed by the pipe pair; the guest ends are
        // wrapped in NSFileHandles that take fd ownership.
        let read_handle = NSFileHandle::initWithFileDescriptor_closeOnDealloc(
            NSFileHandle::alloc(),
            std::os::fd::IntoRawFd::into_raw_fd(spec.console.read_fd.try_clone().map_err(
                |e| FaizeError::Vm(format!("failed to clone console fd: {e}")),
            )?),
            true,
        );
        let write_handle = NSFileHandle::initWithFileDescriptor_closeOnDealloc(
            NSFileHandle::alloc(),
            std::os::fd::IntoRawFd::into_raw_fd(spec.console.write_fd.try_clone().map_err(
                |e| FaizeError::Vm(format!("failed to clone console fd: {e}")),
            )?),
            true,
        );
        let serial_attachment =
            VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
                VZFileHandleSerialPortAttachment::alloc(),
                Some(&read_handle),
                Some(&write_handle),
            );
        let serial = VZVirtioConsoleDeviceSerialPortConfiguration::new();
        serial.setAttachment(Some(&serial_attachment));
        config.setSerialPorts(&NSArray::from_retained_slice(&[Retained::into_super(
            serial,
        )]));

        // NAT network.
        let nat = VZNATNetworkDeviceAttachment::new();
        let network = VZVirtioNetworkDeviceConfiguration::new();
        network.setAttachment(Some(&Retained::into_super(nat)));
        config.setNetworkDevices(&NSArray::from_retained_slice(&[network]));

        // VirtioFS shares, bootstrap first.
        let mut fs_devices = Vec::with_capacity(spec.mounts.len());
        for (i, mount) in spec.mounts.iter().enumerate() {
            let tag = if mount.tag.is_empty() {
                format!("mount{i}")
            } else {
                mount.tag.clone()
            };
            let shared = VZSharedDirectory::initWithURL_readOnly(
                VZSharedDirectory::alloc(),
                &ns_url(&mount.source),
                mount.read_only,
            );
            let share =
                VZSingleDirectoryShare::initWithDirectory(VZSingleDirectoryShare::alloc(), &shared);
            let device = VZVirtioFileSystemDeviceConfiguration::initWithTag(
                VZVirtioFileSystemDeviceConfiguration::alloc(),
                &NSString::from_str(&tag),
            );
            device.setShare(Some(&Retained::into_super(share)));
            fs_devices.push(Retained::into_super(device));
        }
        config.setDirectorySharingDevices(&NSArray::from_retained_slice(&fs_devices));

        config
            .validateWithError()
            .map_err(|e| vm_error("invalid VM configuration", &e))?;
        tracing::debug!("VM configuration valid");

        let vm = VZVirtualMachine::initWithConfiguration_queue(
            VZVirtualMachine::alloc(),
            &config,
            queue,
        );
        tracing::debug!("virtual machine created");
        Ok(vm)
    }
}

fn read_state(vm: &VZVirtualMachine, queue: &DispatchQueue) -> MachineState {
    let mut state = MachineState::Error;
    queue.exec_sync(|| {
        let raw = unsafe { vm.state() };
        state = match raw {
            VZVirtualMachineState::Stopped => MachineState::Stopped,
            VZVirtualMachineState::Running => MachineState::Running,
            VZVirtualMachineState::Starting => MachineState::Starting,
            VZVirtualMachineState::Stopping | VZVirtualMachineState::Pausing => {
                MachineState::Stopping
            }
            VZVirtualMachineState::Error => MachineState::Error,
            _ => MachineState::Created,
        };
    });
    state
}

fn start_machine(vm: &VZVirtualMachine, queue: &DispatchQueue) -> FaizeResult<()> {
    let (tx, rx) = mpsc::channel::<Result<(), String>>();

    queue.exec_sync(|| {
        let tx = tx.clone();
        let block = RcBlock::new(move |err: *mut NSError| {
            let result = if err.is_null() {
                Ok(())
            } else {
                // SAFETY: non-null err is a valid NSError for the duration
                // of the completion handler.
                Err(unsafe { (*err).localizedDescription() }.to_string())
            };
            let _ = tx.send(result);
        });
        unsafe { vm.startWithCompletionHandler(&block) };
    });

    match rx.recv_timeout(Duration::from_secs(60)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(msg)) => Err(FaizeError::Vm(format!("failed to start VM: {msg}"))),
        Err(_) => Err(FaizeError::Vm("timed out waiting for VM start".into())),
    }
}

fn request_stop_machine(vm: &VZVirtualMachine, queue: &DispatchQueue) -> FaizeResult<()> {
    let mut result = Ok(());
    queue.exec_sync(|| unsafe {
        if !vm.canRequestStop() {
            result = Err(FaizeError::Vm("guest cannot be asked to stop".into()));
            return;
        }
        if let Err(e) = vm.requestStopWithError() {
            result = Err(vm_error("failed to request stop", &e));
        }
    });
    result
}

fn force_stop_machine(vm: &VZVirtualMachine, queue: &DispatchQueue) -> FaizeResult<()> {
    let (tx, rx) = mpsc::channel::<Result<(), String>>();

    queue.exec_sync(|| {
        let tx = tx.clone();
        let block = RcBlock::new(move |err: *mut NSError| {
            let result = if err.is_null() {
                Ok(())
            } else {
                // SAFETY: non-null err is a valid NSError for the duration
                // of the completion handler.
                Err(unsafe { (*err).localizedDescription() }.to_string())
            };
            let _ = tx.send(result);
        });
        unsafe { vm.stopWithCompletionHandler(&block) };
    });

    match rx.recv_timeout(Duration::from_secs(30)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(msg)) => Err(FaizeError::Vm(format!("failed to stop VM: {msg}"))),
        Err(_) => Err(FaizeError::Vm("timed out waiting for VM stop".into())),
    }
}
