use thiserror::Error;

/// Failures a system call can surface to user space. Every variant maps to
/// `-1` at the syscall boundary; the variants exist so kernel code can log
/// and test the precise cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("bad argument")]
    BadArgument,
    #[error("no space in the mapping window or region table")]
    NoSpace,
    #[error("out of physical frames")]
    OutOfMemory,
    #[error("short read or write")]
    Io,
    #[error("bad file descriptor")]
    BadFileDescriptor,
}

pub type KernelResult<T> = Result<T, KernelError>;
