use crate::util::Address;

/// Identifies a thread in the target process.
pub type RemoteThreadId = u64;

/// Execution state of the target process as observed through the channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// At least one thread is executing.
    Running,
    /// All threads are stopped; target memory is stable and may be read.
    Stopped,
    /// The process has exited; no further observation is possible.
    Terminated,
}

/// A failure in the transport to the target process.  The core subsystems
/// treat this as "the operation could not proceed" and propagate it
/// uninterpreted; it carries no heap or compilation semantics.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("target process has terminated")]
    Terminated,
    #[error("channel i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// The byte-stream transport used to observe and control the target VM
/// process.  Implemented elsewhere (ptrace, a debug agent, a core dump);
/// the core only consumes this contract.
///
/// All addresses are virtual addresses in the target's 64-bit address space.
/// Implementations are responsible for splitting transfers larger than their
/// transport's maximum chunk size into multiple underlying operations; callers
/// may pass buffers of any length.
pub trait ChannelProtocol: Send + Sync {
    /// Read `buf.len()` bytes of target memory starting at `src`.
    /// Returns the number of bytes actually read, which may be short only if
    /// the tail of the range is unmapped in the target.
    fn read_bytes(&self, src: Address, buf: &mut [u8]) -> Result<usize, ChannelError>;

    /// Write `buf.len()` bytes of target memory starting at `dst`.
    /// Returns the number of bytes actually written.
    fn write_bytes(&self, dst: Address, buf: &[u8]) -> Result<usize, ChannelError>;

    /// Read the integer register file of a target thread.
    fn read_registers(&self, thread: RemoteThreadId) -> Result<Vec<u64>, ChannelError>;

    /// Suspend a target thread.
    fn suspend(&self, thread: RemoteThreadId) -> Result<(), ChannelError>;

    /// Resume a target thread.
    fn resume(&self, thread: RemoteThreadId) -> Result<(), ChannelError>;

    /// Single-step a target thread by one instruction.
    fn single_step(&self, thread: RemoteThreadId) -> Result<(), ChannelError>;

    /// Block until every thread in the target has stopped, and report the
    /// resulting process state.
    fn wait_until_stopped(&self) -> Result<ProcessState, ChannelError>;

    /// Read one 64-bit word of target memory at `src`.  The target is
    /// modelled as little-endian.
    fn read_word(&self, src: Address) -> Result<u64, ChannelError> {
        let mut buf = [0u8; 8];
        let n = self.read_bytes(src, &mut buf)?;
        if n != buf.len() {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short word read at {}: {} bytes", src, n),
            )));
        }
        Ok(u64::from_le_bytes(buf))
    }
}

/// Capability witnessing that the target process has been observed stopped.
///
/// Operations that mutate the observer's model of the heap (reference
/// registration, bulk phase transitions) require a `&StopToken`, making the
/// "mutation only happens while the target is stopped" precondition a checked
/// part of their signatures rather than an undocumented assumption.  The
/// holder must discard the token before resuming the target.
#[derive(Debug)]
pub struct StopToken {
    _private: (),
}

impl StopToken {
    /// Obtain the capability from an observed process state.  Returns `None`
    /// unless the state is [`ProcessState::Stopped`].
    pub fn acquire(state: ProcessState) -> Option<StopToken> {
        match state {
            ProcessState::Stopped => Some(StopToken { _private: () }),
            ProcessState::Running | ProcessState::Terminated => None,
        }
    }
}
