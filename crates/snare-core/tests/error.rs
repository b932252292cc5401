//! Tests for error messages

use snare_core::error::{SnareError, SnareResult};
use snare_core::image::ImageError;
use snare_core::types::{Address, ProcessId, ThreadId};

#[test]
fn test_attach_failed_display()
{
    let error = SnareError::AttachFailed {
        pid: ProcessId(4242),
        reason: "access denied".to_string(),
    };
    let message = format!("{}", error);
    assert!(message.contains("4242"));
    assert!(message.contains("access denied"));
}

#[test]
fn test_breakpoint_errors_name_the_address()
{
    let exists = SnareError::BreakpointExists(Address::new(0x401000));
    assert_eq!(exists.to_string(), "Breakpoint already defined at 0x401000");

    let missing = SnareError::NoBreakpoint(Address::new(0x401000));
    assert!(missing.to_string().contains("0x401000"));
}

#[test]
fn test_breakpoint_patch_reports_transfer()
{
    let error = SnareError::BreakpointPatch {
        action: "enable",
        address: Address::new(0x1000),
        transferred: 0,
        expected: 1,
    };
    let message = format!("{}", error);
    assert!(message.contains("enable"));
    assert!(message.contains("0 of 1 bytes"));
}

#[test]
fn test_flush_failed_shows_range()
{
    let error = SnareError::FlushFailed {
        start: Address::new(0x1000),
        end: Address::new(0x1010),
    };
    assert_eq!(
        error.to_string(),
        "Error while flushing instruction cache for memory [0x1000, 0x1010["
    );
}

#[test]
fn test_register_and_thread_errors()
{
    let index = SnareError::InvalidRegisterIndex { index: 16, count: 8 };
    assert!(index.to_string().contains("16"));
    assert!(index.to_string().contains("8 integer registers"));

    let thread = SnareError::UnknownThread(ThreadId(77));
    assert!(thread.to_string().contains("77"));
}

#[test]
fn test_io_error_conversion()
{
    fn fails() -> SnareResult<()>
    {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
        Ok(())
    }

    match fails() {
        Err(SnareError::Io(err)) => assert_eq!(err.to_string(), "boom"),
        other => panic!("Expected Io variant, got {:?}", other),
    }
}

#[test]
fn test_image_error_display()
{
    let error = ImageError::BadDosSignature(0x1234);
    assert!(error.to_string().contains("0x1234"));
}
