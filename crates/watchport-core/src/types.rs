//! Platform-agnostic identifier and exception types.
//!
//! Everything the dispatch core passes across its callback boundary is
//! defined here: task identifiers, watch identifiers, readiness modes, and
//! the exception-subtype taxonomy shared by process and job watches.

use std::fmt;

/// Kernel-assigned unique identifier for a process, thread, or job.
///
/// Treated as an opaque unique id; the core never derives meaning from the
/// numeric value beyond equality.
///
/// ## Why wrap it in a struct?
///
/// Using a newtype pattern (`struct Koid(u64)`) instead of a raw `u64`
/// provides:
/// - **Type safety**: Prevents accidentally passing a watch id where a task
///   id is expected
/// - **Self-documenting code**: Makes it clear what the value represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Koid(pub u64);

impl Koid
{
    /// Raw numeric value, for logging and diagnostics.
    #[must_use]
    pub fn raw(self) -> u64
    {
        self.0
    }
}

impl From<u64> for Koid
{
    fn from(koid: u64) -> Self
    {
        Koid(koid)
    }
}

impl From<Koid> for u64
{
    fn from(koid: Koid) -> Self
    {
        koid.0
    }
}

impl fmt::Display for Koid
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one live registration in the message loop.
///
/// Ids are allocated monotonically starting at 1 and never reused; id 0 is
/// reserved for the loop's internal task-pending signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

impl WatchId
{
    /// Reserved key for the internal task-pending signal.
    pub const TASK_SIGNAL: WatchId = WatchId(0);

    /// Raw numeric value, for logging and diagnostics.
    #[must_use]
    pub fn raw(self) -> u64
    {
        self.0
    }
}

impl From<u64> for WatchId
{
    fn from(id: u64) -> Self
    {
        WatchId(id)
    }
}

impl fmt::Display for WatchId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Which readiness directions a descriptor/socket watch is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode
{
    /// Deliver only read readiness.
    Read,
    /// Deliver only write readiness.
    Write,
    /// Deliver both read and write readiness.
    ReadWrite,
}

impl WatchMode
{
    /// Whether this mode delivers read readiness.
    #[must_use]
    pub fn accepts_read(self) -> bool
    {
        matches!(self, WatchMode::Read | WatchMode::ReadWrite)
    }

    /// Whether this mode delivers write readiness.
    #[must_use]
    pub fn accepts_write(self) -> bool
    {
        matches!(self, WatchMode::Write | WatchMode::ReadWrite)
    }
}

/// Exception subtype carried by an exception packet.
///
/// Job exception channels deliver only `ProcessStarting`. Process exception
/// channels deliver the thread lifecycle subtypes plus the fault subtypes;
/// process termination is a separate signal, not an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionType
{
    /// A process started somewhere in the watched job tree. The initial
    /// thread is halted until the exception is resumed.
    ProcessStarting,
    /// A thread started in the watched process.
    ThreadStarting,
    /// A thread is exiting in the watched process.
    ThreadExiting,
    /// General fault not covered by a more specific subtype.
    General,
    /// Page fault / bad memory access.
    PageFault,
    /// Undefined or illegal instruction.
    UndefinedInstruction,
    /// Software breakpoint instruction.
    SoftwareBreakpoint,
    /// Hardware breakpoint or watchpoint.
    HardwareBreakpoint,
    /// Kernel policy violation.
    PolicyError,
}

impl ExceptionType
{
    /// Whether this subtype is a thread/process lifecycle notification
    /// rather than a fault.
    #[must_use]
    pub fn is_lifecycle(self) -> bool
    {
        matches!(
            self,
            ExceptionType::ProcessStarting | ExceptionType::ThreadStarting | ExceptionType::ThreadExiting
        )
    }
}

/// One exception delivery, as handed to watcher callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionInfo
{
    /// Koid of the process the exception belongs to.
    pub process: Koid,
    /// Koid of the thread that triggered the exception. This is the id to
    /// pass to [`MessageLoop::resume_from_exception`](crate::MessageLoop::resume_from_exception).
    pub thread: Koid,
    /// Exception subtype.
    pub ty: ExceptionType,
}

/// Options for resuming a thread from a pending exception.
///
/// The default (no special options) marks the exception handled and lets
/// the thread continue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeOptions
{
    /// Pass the exception on to the next handler in line instead of marking
    /// it handled.
    pub try_next: bool,
}
