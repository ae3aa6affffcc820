//! Tests for error handling

use xedbg_core::config::{ConfigError, ProcessorConfig};
use xedbg_core::error::{DebugError, DebugResult, ResolveFailure};
use xedbg_core::types::{GuestAddress, ThreadId};
use xedbg_core::ExecutionState;

#[test]
fn test_resolve_failed_display()
{
    let error = DebugError::ResolveFailed {
        address: GuestAddress::new(0x8200_0010),
        reason: ResolveFailure::NotInModule,
    };
    let message = format!("{}", error);
    assert!(message.contains("0x82000010"));
    assert!(message.contains("not inside any loaded module"));
}

#[test]
fn test_resolve_failure_reasons()
{
    let declare = ResolveFailure::DeclareFailed("no thunk".to_string());
    let define = ResolveFailure::DefineFailed("bad opcode".to_string());
    assert_eq!(declare.to_string(), "declare failed: no thunk");
    assert_eq!(define.to_string(), "define failed: bad opcode");
    assert_eq!(define.clone(), define);
}

#[test]
fn test_invalid_state_display()
{
    let error = DebugError::InvalidState {
        expected: ExecutionState::Paused,
        actual: ExecutionState::Running,
    };
    let message = format!("{}", error);
    assert!(message.contains("Paused"));
    assert!(message.contains("Running"));
}

#[test]
fn test_thread_errors_name_the_thread()
{
    for error in [
        DebugError::UnknownThread(ThreadId(7)),
        DebugError::NoStackFrames(ThreadId(7)),
        DebugError::NotGuestCode(ThreadId(7)),
        DebugError::StepTimedOut {
            thread: ThreadId(7),
            address: GuestAddress::new(0x100),
        },
    ] {
        assert!(error.to_string().contains("#7"), "{error}");
    }
}

#[test]
fn test_no_safe_point_display()
{
    let error = DebugError::NoSafePoint {
        start: GuestAddress::new(0x8200_0000),
        limit: 256,
    };
    let message = error.to_string();
    assert!(message.contains("0x82000000"));
    assert!(message.contains("256"));
}

#[test]
fn test_session_errors()
{
    let error = DebugError::InvalidSessionSignature(*b"NOPE");
    assert!(error.to_string().contains("4e"));

    let error = DebugError::UnsupportedSessionVersion(9);
    assert!(error.to_string().contains('9'));
}

#[test]
fn test_io_error_conversion()
{
    let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
    let error: DebugError = io.into();

    match error {
        DebugError::Io(inner) => assert_eq!(inner.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("Expected Io variant, got {other:?}"),
    }
}

#[test]
fn test_config_error_display()
{
    let error = ProcessorConfig::from_lookup(|key| (key == "XEDBG_STEP_TIMEOUT_MS").then(|| "soon".to_string()))
        .unwrap_err();
    assert_eq!(
        error,
        ConfigError::InvalidValue {
            key: "XEDBG_STEP_TIMEOUT_MS",
            value: "soon".to_string(),
        }
    );
    assert!(error.to_string().contains("soon"));
}

#[test]
fn test_result_type()
{
    // Test that Result type is properly aliased
    let _result: DebugResult<()> = Ok(());
    let _error_result: DebugResult<()> = Err(DebugError::Module("boom".to_string()));
}
