//! Tests for the identifier and exception types.

use watchport_core::prelude::*;

#[test]
fn test_koid_conversions()
{
    let koid = Koid(42);
    assert_eq!(koid.raw(), 42);
    assert_eq!(Koid::from(42u64), koid);
    assert_eq!(u64::from(koid), 42);
    assert_eq!(koid.to_string(), "42");
}

#[test]
fn test_watch_id_reserves_task_signal()
{
    assert_eq!(WatchId::TASK_SIGNAL.raw(), 0);
    assert_ne!(WatchId::from(1u64), WatchId::TASK_SIGNAL);
}

#[test]
fn test_watch_mode_directions()
{
    assert!(WatchMode::Read.accepts_read());
    assert!(!WatchMode::Read.accepts_write());
    assert!(!WatchMode::Write.accepts_read());
    assert!(WatchMode::Write.accepts_write());
    assert!(WatchMode::ReadWrite.accepts_read());
    assert!(WatchMode::ReadWrite.accepts_write());
}

#[test]
fn test_exception_type_lifecycle_split()
{
    assert!(ExceptionType::ProcessStarting.is_lifecycle());
    assert!(ExceptionType::ThreadStarting.is_lifecycle());
    assert!(ExceptionType::ThreadExiting.is_lifecycle());
    assert!(!ExceptionType::General.is_lifecycle());
    assert!(!ExceptionType::PageFault.is_lifecycle());
    assert!(!ExceptionType::SoftwareBreakpoint.is_lifecycle());
}

#[test]
fn test_resume_options_default()
{
    assert!(!ResumeOptions::default().try_next);
}
