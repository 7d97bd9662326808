//! Contracts between the vmprobe core and its collaborators: the byte-stream
//! channel to the target process, the compilers the scheduler drives, and the
//! methods they compile.  The core is generic over these traits; a concrete
//! debugger or VM supplies the implementations.

mod channel;
mod compiler;
mod method;

pub use self::channel::ChannelError;
pub use self::channel::ChannelProtocol;
pub use self::channel::ProcessState;
pub use self::channel::RemoteThreadId;
pub use self::channel::StopToken;
pub use self::compiler::CodeHandle;
pub use self::compiler::CompileError;
pub use self::compiler::Nature;
pub use self::compiler::RuntimeCompiler;
pub use self::compiler::TargetCode;
pub use self::method::flags;
pub use self::method::Method;
pub use self::method::MethodProfile;
pub use self::method::MethodRef;
pub use self::method::LONG_RECOUNT;
pub use self::method::SHORT_RECOUNT;
