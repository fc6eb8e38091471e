// ABOUTME: Protocol state enum, message type tags, and the (state, request, response) transition table
// ABOUTME: A single match-based table replaces the source's nested per-state switch dispatch (see DESIGN.md)

use num_enum::TryFromPrimitive;

use crate::error::IllegalTransition;

/// Per-connection protocol phase. `NEGOTIATION` is the initial state;
/// `DEFUNCT` is absorbing — once reached, the connection is torn down and no
/// further transition is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Negotiation,
    Authentication,
    Ready,
    Streaming,
    TxReady,
    TxStreaming,
    Failed,
    Interrupted,
    Defunct,
}

/// Request and response structure tags. Values follow the Bolt message
/// signature byte; `LOGON`/`LOGOFF` are this crate's own tag assignments for
/// the auth-exchange messages the spec calls out, since the distilled spec
/// treats the wire tag as an opaque `bolt_structure_type` passed through
/// unopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    // Requests
    Hello = 0x01,
    Goodbye = 0x02,
    Reset = 0x0F,
    Run = 0x10,
    Begin = 0x11,
    Commit = 0x12,
    Rollback = 0x13,
    Discard = 0x2F,
    Pull = 0x3F,
    Route = 0x66,
    Logon = 0x6A,
    Logoff = 0x6B,
    // Responses
    Success = 0x70,
    Record = 0x71,
    Ignored = 0x7E,
    Failure = 0x7F,
}

impl MessageType {
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::Success | MessageType::Record | MessageType::Ignored | MessageType::Failure
        )
    }
}

fn illegal(
    state: ProtocolState,
    request: MessageType,
    response: MessageType,
) -> Result<ProtocolState, IllegalTransition> {
    Err(IllegalTransition {
        state,
        request,
        response,
    })
}

/// Advances `state` given a `(request, response)` pair, or reports the
/// triple as illegal. Total over every input; never panics. `RECORD`
/// responses to an in-flight `PULL`/`RUN` stream are intermediate and never
/// change state.
pub fn step(
    state: ProtocolState,
    request: MessageType,
    response: MessageType,
) -> Result<ProtocolState, IllegalTransition> {
    use MessageType::*;
    use ProtocolState::*;

    if response == Record {
        return match (state, request) {
            (Streaming | TxStreaming, Pull | Run) => Ok(state),
            _ => illegal(state, request, response),
        };
    }

    match (state, request, response) {
        (Negotiation, Hello, Success) => Ok(Authentication),
        (Negotiation, Hello, Failure) => Ok(Defunct),

        (Authentication, Logon, Success) => Ok(Ready),
        (Authentication, Logon, Failure) => Ok(Defunct),

        (Ready, Logoff, Success) => Ok(Authentication),
        (Ready, Logoff, Failure) => Ok(Failed),
        (Ready, Run, Success) => Ok(Streaming),
        (Ready, Run, Failure) => Ok(Failed),
        (Ready, Begin, Success) => Ok(TxReady),
        (Ready, Begin, Failure) => Ok(Failed),
        (Ready, Route, Success) => Ok(Ready),
        (Ready, Route, Failure) => Ok(Failed),
        (Ready, Reset, _) => Ok(Ready),
        (Ready, Goodbye, _) => Ok(Defunct),

        (Streaming, Pull | Discard, Success) => Ok(Ready),
        (Streaming, Pull | Discard, Failure) => Ok(Failed),
        (Streaming, Reset, _) => Ok(Ready),
        (Streaming, Goodbye, _) => Ok(Defunct),

        (TxReady, Run, Success) => Ok(TxStreaming),
        (TxReady, Run, Failure) => Ok(Failed),
        (TxReady, Commit | Rollback, Success) => Ok(Ready),
        (TxReady, Commit | Rollback, Failure) => Ok(Failed),
        (TxReady, Reset, _) => Ok(Ready),
        (TxReady, Goodbye, _) => Ok(Defunct),

        (TxStreaming, Run, Success) => Ok(TxStreaming),
        (TxStreaming, Run, Failure) => Ok(Failed),
        (TxStreaming, Pull, Success) => Ok(TxStreaming),
        (TxStreaming, Pull, Failure) => Ok(Failed),
        (TxStreaming, Commit, Success) => Ok(Ready),
        (TxStreaming, Commit, Failure) => Ok(Failed),
        (TxStreaming, Discard, Success) => Ok(TxReady),
        (TxStreaming, Discard, Failure) => Ok(Failed),
        (TxStreaming, Reset, _) => Ok(Ready),
        (TxStreaming, Goodbye, _) => Ok(Defunct),

        (Failed, Run | Pull | Discard, Ignored) => Ok(Failed),
        (Failed, Reset, _) => Ok(Ready),
        (Failed, Goodbye, _) => Ok(Defunct),

        (Interrupted, Run | Pull | Discard | Begin | Commit | Rollback | Route, Ignored) => {
            Ok(Failed)
        }
        (Interrupted, Reset, Success) => Ok(Ready),
        (Interrupted, Reset, Failure) => Ok(Defunct),
        (Interrupted, Goodbye, _) => Ok(Defunct),

        _ => illegal(state, request, response),
    }
}
