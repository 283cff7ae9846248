//! Control-plane orchestration.
//!
//! Specializes [`StateMachine`] into describe → create → tag → endpoint →
//! token → ready → put-stream → streaming. Execute functions only queue a
//! [`ServiceCall`] in the outbox; the stream issues it after releasing its
//! lock and feeds the response back through [`ControlPlane::complete_call`].

use std::collections::BTreeMap;

use tracing::{debug, warn};
use url::Url;

use ingest_proto::{
    ServiceCallResult, StateSet, StreamConfig, StreamDescription, StreamState, StreamStatus,
    Timestamp,
};
use ingest_transport::{
    AuthInfo, CallContext, CreateStreamRequest, PutStreamRequest, ServiceCall, TagStreamRequest,
    SERVICE_CALL_DEFAULT_TIMEOUT, SERVICE_CALL_MAX_RETRY_COUNT,
};

use crate::error::StreamError;
use crate::fsm::{StateDef, StateMachine, INFINITE_RETRY_COUNT_SENTINEL};
use crate::session::MAX_LIVE_UPLOAD_HANDLES;
use crate::StreamResult;

/// Control-plane calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    DescribeStream,
    CreateStream,
    TagStream,
    GetStreamingEndpoint,
    GetStreamingToken,
    PutStream,
}

impl CallKind {
    /// State that issues this call.
    pub fn phase(self) -> StreamState {
        match self {
            Self::DescribeStream => StreamState::Describe,
            Self::CreateStream => StreamState::Create,
            Self::TagStream => StreamState::TagStream,
            Self::GetStreamingEndpoint => StreamState::GetEndpoint,
            Self::GetStreamingToken => StreamState::GetToken,
            Self::PutStream => StreamState::PutStream,
        }
    }
}

/// Coarse classification of a call result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Ok,
    NotFound,
    NotAuthorized,
    InUse,
    Retryable,
    Other,
}

impl ResultClass {
    pub fn of(result: ServiceCallResult) -> Self {
        match result {
            ServiceCallResult::Ok => Self::Ok,
            ServiceCallResult::ResourceNotFound => Self::NotFound,
            r if r.is_auth_failure() => Self::NotAuthorized,
            ServiceCallResult::ResourceInUse => Self::InUse,
            r if r.is_retryable() => Self::Retryable,
            _ => Self::Other,
        }
    }
}

/// What a failed call leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Continue on the success path of the phase.
    Proceed,

    /// Re-issue the same call within the retry budget.
    Retry,

    /// Move to another state.
    GoTo(StreamState),

    /// Fail the stream.
    Fatal,
}

/// Per-phase call failure table.
pub fn call_outcome(kind: CallKind, class: ResultClass) -> CallOutcome {
    use CallKind::*;
    use CallOutcome::*;
    use ResultClass as R;

    match (kind, class) {
        (_, R::Ok) => Proceed,
        (_, R::Retryable) => Retry,

        (DescribeStream, R::NotFound) => GoTo(StreamState::Create),
        (DescribeStream, R::NotAuthorized) => GoTo(StreamState::GetToken),
        (DescribeStream, _) => Fatal,

        (CreateStream, R::NotFound) => Retry,
        (CreateStream, R::NotAuthorized) => GoTo(StreamState::GetToken),
        (CreateStream, R::InUse) => GoTo(StreamState::Describe),
        (CreateStream, _) => Fatal,

        (TagStream, R::NotFound) => Retry,
        (TagStream, R::NotAuthorized) => GoTo(StreamState::GetToken),
        (TagStream, _) => GoTo(StreamState::GetEndpoint),

        (GetStreamingEndpoint, R::NotFound) => GoTo(StreamState::Describe),
        (GetStreamingEndpoint, R::NotAuthorized) => GoTo(StreamState::GetToken),
        (GetStreamingEndpoint, _) => Fatal,

        (GetStreamingToken, R::NotFound) => Retry,
        (GetStreamingToken, _) => Fatal,

        (PutStream, R::NotFound) => GoTo(StreamState::Describe),
        (PutStream, R::NotAuthorized) => GoTo(StreamState::GetToken),
        (PutStream, _) => Fatal,
    }
}

/// Re-entry state after an upload handle terminated with `result`.
///
/// Distinct from [`call_outcome`]: a timeout here keeps the session set up
/// and only needs a new handle.
pub fn termination_reentry(result: ServiceCallResult) -> StreamState {
    use ServiceCallResult::*;

    match result {
        ResourceNotFound | ResourceDeleted | ResourceInUse | InternalError => StreamState::Describe,
        NotAuthorized | Forbidden | StreamAuthInGracePeriod => StreamState::GetToken,
        DeviceLimit | StreamLimit => StreamState::GetEndpoint,
        RequestTimeout | GatewayTimeout | NetworkReadTimeout | NetworkConnectionTimeout => {
            StreamState::Ready
        }
        Ok => StreamState::Ready,
        _ => StreamState::GetEndpoint,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlightCall {
    correlation_id: u64,
    kind: CallKind,
}

/// Context of the control-plane state machine.
#[derive(Debug)]
pub struct ControlPlane {
    pub stream_name: String,
    create_request: CreateStreamRequest,
    tags: BTreeMap<String, String>,
    content_type: String,

    /// Result of the last completed call. `None` while a call is pending.
    pub last_result: Option<ServiceCallResult>,
    pub description: Option<StreamDescription>,
    pub stream_arn: Option<String>,
    pub endpoint: Option<Url>,
    pub token: Option<AuthInfo>,
    tag_attempts: u32,

    /// Set when an upload handle terminated and the control plane must re-enter.
    pub termination: Option<ServiceCallResult>,

    /// The active handle's token is close to expiring.
    pub rotation_pending: bool,

    pub stopping: bool,

    // Snapshot of the session layer, refreshed before every drive.
    pub live_handles: usize,
    pub streaming_handles: usize,
    pub has_content: bool,
    pub start_timestamp: Timestamp,

    in_flight: Option<InFlightCall>,
    next_correlation_id: u64,
    outbox: Vec<ServiceCall>,
}

impl ControlPlane {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            stream_name: config.name.clone(),
            create_request: CreateStreamRequest {
                content_type: config.content_type.clone(),
                kms_key_id: config.kms_key_id.clone(),
                retention_hours: config.retention_hours,
            },
            tags: config.tags.clone(),
            content_type: config.content_type.clone(),
            last_result: None,
            description: None,
            stream_arn: None,
            endpoint: None,
            token: None,
            tag_attempts: 0,
            termination: None,
            rotation_pending: false,
            stopping: false,
            live_handles: 0,
            streaming_handles: 0,
            has_content: false,
            start_timestamp: 0,
            in_flight: None,
            next_correlation_id: 1,
            outbox: Vec::new(),
        }
    }

    /// Whether a call is waiting for its result.
    pub fn call_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Drop the pending call so late results are rejected.
    pub fn cancel_call(&mut self) {
        self.in_flight = None;
    }

    /// Calls queued since the last take.
    pub fn take_outbox(&mut self) -> Vec<ServiceCall> {
        std::mem::take(&mut self.outbox)
    }

    fn begin_call(&mut self, kind: CallKind) -> CallContext {
        let correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;
        self.in_flight = Some(InFlightCall {
            correlation_id,
            kind,
        });
        self.last_result = None;

        CallContext {
            correlation_id,
            stream_name: self.stream_name.clone(),
            auth: self.token.clone(),
            timeout: SERVICE_CALL_DEFAULT_TIMEOUT,
        }
    }

    /// Check that a result matches the call in flight without consuming it.
    pub fn check_call(&self, kind: CallKind, correlation_id: u64) -> StreamResult<()> {
        match self.in_flight {
            Some(call) if call.kind == kind && call.correlation_id == correlation_id => Ok(()),
            _ => Err(StreamError::UnexpectedCorrelationId(correlation_id)),
        }
    }

    /// Record the result of the call in flight.
    pub fn complete_call(
        &mut self,
        kind: CallKind,
        correlation_id: u64,
        result: ServiceCallResult,
    ) -> StreamResult<()> {
        self.check_call(kind, correlation_id)?;
        debug!(call = ?kind, correlation_id, ?result, "Service call completed");
        self.in_flight = None;
        self.last_result = Some(result);
        Ok(())
    }

    /// Result of the in-flight call kind, if a transport refused it outright.
    pub fn in_flight_call(&self) -> Option<(CallKind, u64)> {
        self.in_flight.map(|call| (call.kind, call.correlation_id))
    }

    fn result(&self) -> ServiceCallResult {
        self.last_result.unwrap_or(ServiceCallResult::Unknown)
    }

    fn call_failed(&self, phase: StreamState) -> StreamError {
        StreamError::CallFailed {
            phase,
            result: self.result(),
        }
    }

    fn can_open_handle(&self) -> bool {
        self.has_content
            && self.live_handles < MAX_LIVE_UPLOAD_HANDLES
            && (self.streaming_handles == 0 || (self.rotation_pending && !self.stopping))
    }
}

// --- Next state ------------------------------------------------------------

fn resolve(ctx: &ControlPlane, kind: CallKind, success: StreamState) -> StreamResult<StreamState> {
    let phase = kind.phase();
    match call_outcome(kind, ResultClass::of(ctx.result())) {
        CallOutcome::Proceed => Ok(success),
        CallOutcome::Retry => Ok(phase),
        CallOutcome::GoTo(state) => Ok(state),
        CallOutcome::Fatal => {
            if kind == CallKind::GetStreamingToken && ctx.result().is_auth_failure() {
                Err(StreamError::StreamAuthFailed)
            } else {
                Err(ctx.call_failed(phase))
            }
        }
    }
}

fn next_new(_: &ControlPlane) -> StreamResult<StreamState> {
    Ok(StreamState::Describe)
}

fn next_describe(ctx: &ControlPlane) -> StreamResult<StreamState> {
    if ctx.result().is_ok() {
        return match ctx.description.as_ref().map(|d| d.status) {
            Some(StreamStatus::Creating) => Ok(StreamState::Describe),
            Some(StreamStatus::Deleting) => Err(StreamError::StreamIsBeingDeleted),
            _ => Ok(StreamState::GetEndpoint),
        };
    }
    resolve(ctx, CallKind::DescribeStream, StreamState::GetEndpoint)
}

fn next_create(ctx: &ControlPlane) -> StreamResult<StreamState> {
    let success = if ctx.tags.is_empty() {
        StreamState::GetEndpoint
    } else {
        StreamState::TagStream
    };
    resolve(ctx, CallKind::CreateStream, success)
}

fn next_tag(ctx: &ControlPlane) -> StreamResult<StreamState> {
    let next = resolve(ctx, CallKind::TagStream, StreamState::GetEndpoint)?;
    if next == StreamState::TagStream && ctx.tag_attempts > SERVICE_CALL_MAX_RETRY_COUNT {
        warn!(attempts = ctx.tag_attempts, "Tagging failed, continuing without tags");
        return Ok(StreamState::GetEndpoint);
    }
    Ok(next)
}

fn next_endpoint(ctx: &ControlPlane) -> StreamResult<StreamState> {
    resolve(ctx, CallKind::GetStreamingEndpoint, StreamState::GetToken)
}

fn next_token(ctx: &ControlPlane) -> StreamResult<StreamState> {
    let success = if ctx.endpoint.is_some() {
        StreamState::Ready
    } else {
        StreamState::GetEndpoint
    };
    resolve(ctx, CallKind::GetStreamingToken, success)
}

fn next_ready(ctx: &ControlPlane) -> StreamResult<StreamState> {
    if let Some(result) = ctx.termination {
        return Ok(termination_reentry(result));
    }
    if ctx.can_open_handle() {
        return Ok(StreamState::PutStream);
    }
    if ctx.stopping && ctx.live_handles == 0 {
        return Ok(StreamState::Stopped);
    }
    Ok(StreamState::Ready)
}

fn next_put_stream(ctx: &ControlPlane) -> StreamResult<StreamState> {
    resolve(ctx, CallKind::PutStream, StreamState::Streaming)
}

fn next_streaming(ctx: &ControlPlane) -> StreamResult<StreamState> {
    if let Some(result) = ctx.termination {
        return Ok(termination_reentry(result));
    }
    if ctx.rotation_pending && !ctx.stopping {
        return Ok(StreamState::GetToken);
    }
    if ctx.can_open_handle() {
        return Ok(StreamState::Ready);
    }
    if ctx.stopping && ctx.live_handles == 0 {
        return Ok(StreamState::Stopped);
    }
    Ok(StreamState::Streaming)
}

fn next_stopped(_: &ControlPlane) -> StreamResult<StreamState> {
    Ok(StreamState::Stopped)
}

// --- Execute -----------------------------------------------------------------

fn execute_noop(_: &mut ControlPlane, _: Timestamp) -> StreamResult<()> {
    Ok(())
}

fn execute_describe(ctx: &mut ControlPlane, _: Timestamp) -> StreamResult<()> {
    ctx.termination = None;
    ctx.description = None;
    let call = ctx.begin_call(CallKind::DescribeStream);
    ctx.outbox.push(ServiceCall::DescribeStream(call));
    Ok(())
}

fn execute_create(ctx: &mut ControlPlane, _: Timestamp) -> StreamResult<()> {
    let call = ctx.begin_call(CallKind::CreateStream);
    let request = ctx.create_request.clone();
    ctx.outbox.push(ServiceCall::CreateStream(call, request));
    Ok(())
}

fn execute_tag(ctx: &mut ControlPlane, _: Timestamp) -> StreamResult<()> {
    ctx.tag_attempts += 1;
    let call = ctx.begin_call(CallKind::TagStream);
    let request = TagStreamRequest {
        tags: ctx.tags.clone(),
    };
    ctx.outbox.push(ServiceCall::TagStream(call, request));
    Ok(())
}

fn execute_endpoint(ctx: &mut ControlPlane, _: Timestamp) -> StreamResult<()> {
    ctx.termination = None;
    let call = ctx.begin_call(CallKind::GetStreamingEndpoint);
    ctx.outbox.push(ServiceCall::GetStreamingEndpoint(call));
    Ok(())
}

fn execute_token(ctx: &mut ControlPlane, _: Timestamp) -> StreamResult<()> {
    ctx.termination = None;
    let call = ctx.begin_call(CallKind::GetStreamingToken);
    ctx.outbox.push(ServiceCall::GetStreamingToken(call));
    Ok(())
}

fn execute_ready(ctx: &mut ControlPlane, _: Timestamp) -> StreamResult<()> {
    ctx.termination = None;
    Ok(())
}

fn execute_put_stream(ctx: &mut ControlPlane, _: Timestamp) -> StreamResult<()> {
    let endpoint = ctx
        .endpoint
        .clone()
        .ok_or_else(|| StreamError::InvalidStreamingEndpoint("no endpoint".to_string()))?;
    let call = ctx.begin_call(CallKind::PutStream);
    let request = PutStreamRequest {
        endpoint,
        content_type: ctx.content_type.clone(),
        start_timestamp: ctx.start_timestamp,
    };
    ctx.outbox.push(ServiceCall::PutStream(call, request));
    Ok(())
}

// --- Table -------------------------------------------------------------------

fn retry_describe(ctx: &ControlPlane) -> StreamError {
    ctx.call_failed(StreamState::Describe)
}

fn retry_create(ctx: &ControlPlane) -> StreamError {
    ctx.call_failed(StreamState::Create)
}

fn retry_tag(ctx: &ControlPlane) -> StreamError {
    ctx.call_failed(StreamState::TagStream)
}

fn retry_endpoint(ctx: &ControlPlane) -> StreamError {
    ctx.call_failed(StreamState::GetEndpoint)
}

fn retry_token(ctx: &ControlPlane) -> StreamError {
    ctx.call_failed(StreamState::GetToken)
}

fn retry_put_stream(ctx: &ControlPlane) -> StreamError {
    ctx.call_failed(StreamState::PutStream)
}

fn never_exhausted(_: &ControlPlane) -> StreamError {
    StreamError::StreamTerminated
}

/// Build the control-plane table.
pub fn state_table() -> Vec<StateDef<StreamState, ControlPlane>> {
    use StreamState::*;

    vec![
        StateDef {
            state: New,
            accept_from: StateSet::of(&[New]),
            next_state: next_new,
            execute: execute_noop,
            max_retries: INFINITE_RETRY_COUNT_SENTINEL,
            retry_error: never_exhausted,
        },
        StateDef {
            state: Describe,
            accept_from: StateSet::of(&[
                New,
                Describe,
                Create,
                GetEndpoint,
                Ready,
                PutStream,
                Streaming,
            ]),
            next_state: next_describe,
            execute: execute_describe,
            max_retries: SERVICE_CALL_MAX_RETRY_COUNT,
            retry_error: retry_describe,
        },
        StateDef {
            state: Create,
            accept_from: StateSet::of(&[Describe, Create]),
            next_state: next_create,
            execute: execute_create,
            max_retries: SERVICE_CALL_MAX_RETRY_COUNT,
            retry_error: retry_create,
        },
        StateDef {
            state: TagStream,
            accept_from: StateSet::of(&[Create, TagStream]),
            next_state: next_tag,
            execute: execute_tag,
            max_retries: INFINITE_RETRY_COUNT_SENTINEL,
            retry_error: retry_tag,
        },
        StateDef {
            state: GetEndpoint,
            accept_from: StateSet::of(&[
                Describe,
                Create,
                TagStream,
                GetEndpoint,
                GetToken,
                Ready,
                Streaming,
            ]),
            next_state: next_endpoint,
            execute: execute_endpoint,
            max_retries: SERVICE_CALL_MAX_RETRY_COUNT,
            retry_error: retry_endpoint,
        },
        StateDef {
            state: GetToken,
            accept_from: StateSet::of(&[
                Describe,
                Create,
                TagStream,
                GetEndpoint,
                GetToken,
                Ready,
                PutStream,
                Streaming,
            ]),
            next_state: next_token,
            execute: execute_token,
            max_retries: SERVICE_CALL_MAX_RETRY_COUNT,
            retry_error: retry_token,
        },
        StateDef {
            state: Ready,
            accept_from: StateSet::of(&[GetToken, Ready, Streaming]),
            next_state: next_ready,
            execute: execute_ready,
            max_retries: INFINITE_RETRY_COUNT_SENTINEL,
            retry_error: never_exhausted,
        },
        StateDef {
            state: PutStream,
            accept_from: StateSet::of(&[Ready, PutStream]),
            next_state: next_put_stream,
            execute: execute_put_stream,
            max_retries: SERVICE_CALL_MAX_RETRY_COUNT,
            retry_error: retry_put_stream,
        },
        StateDef {
            state: Streaming,
            accept_from: StateSet::of(&[PutStream, Streaming]),
            next_state: next_streaming,
            execute: execute_noop,
            max_retries: INFINITE_RETRY_COUNT_SENTINEL,
            retry_error: never_exhausted,
        },
        StateDef {
            state: Stopped,
            accept_from: StateSet::all(),
            next_state: next_stopped,
            execute: execute_noop,
            max_retries: INFINITE_RETRY_COUNT_SENTINEL,
            retry_error: never_exhausted,
        },
    ]
}

/// Create the control-plane machine positioned at `New`.
pub fn create_state_machine() -> StreamResult<StateMachine<StreamState, ControlPlane>> {
    StateMachine::new(state_table(), StreamState::New)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ControlPlane {
        ControlPlane::new(&StreamConfig::new("cam"))
    }

    /// Step until a call is queued; return it.
    fn step_to_call(
        fsm: &mut StateMachine<StreamState, ControlPlane>,
        ctx: &mut ControlPlane,
    ) -> ServiceCall {
        loop {
            let before = fsm.current_state();
            fsm.step(ctx, 0).unwrap();
            let mut calls = ctx.take_outbox();
            if let Some(call) = calls.pop() {
                return call;
            }
            assert_ne!(before, fsm.current_state(), "machine stalled without a call");
        }
    }

    fn answer(ctx: &mut ControlPlane, call: &ServiceCall, kind: CallKind, result: ServiceCallResult) {
        ctx.complete_call(kind, call.context().correlation_id, result)
            .unwrap();
    }

    #[test]
    fn test_call_outcome_table() {
        assert_eq!(
            call_outcome(CallKind::DescribeStream, ResultClass::NotFound),
            CallOutcome::GoTo(StreamState::Create)
        );
        assert_eq!(
            call_outcome(CallKind::CreateStream, ResultClass::InUse),
            CallOutcome::GoTo(StreamState::Describe)
        );
        assert_eq!(
            call_outcome(CallKind::TagStream, ResultClass::Other),
            CallOutcome::GoTo(StreamState::GetEndpoint)
        );
        assert_eq!(
            call_outcome(CallKind::GetStreamingToken, ResultClass::NotAuthorized),
            CallOutcome::Fatal
        );
        assert_eq!(
            call_outcome(CallKind::PutStream, ResultClass::NotAuthorized),
            CallOutcome::GoTo(StreamState::GetToken)
        );
        assert_eq!(
            call_outcome(CallKind::GetStreamingEndpoint, ResultClass::Retryable),
            CallOutcome::Retry
        );
    }

    #[test]
    fn test_termination_table_differs_from_call_table() {
        assert_eq!(
            termination_reentry(ServiceCallResult::InternalError),
            StreamState::Describe
        );
        assert_eq!(
            termination_reentry(ServiceCallResult::Forbidden),
            StreamState::GetToken
        );
        assert_eq!(
            termination_reentry(ServiceCallResult::StreamLimit),
            StreamState::GetEndpoint
        );
        assert_eq!(
            termination_reentry(ServiceCallResult::NetworkReadTimeout),
            StreamState::Ready
        );
        assert_eq!(termination_reentry(ServiceCallResult::Ok), StreamState::Ready);
        assert_eq!(
            termination_reentry(ServiceCallResult::InvalidMkvData),
            StreamState::GetEndpoint
        );

        // The same code retries as a call failure.
        assert_eq!(
            call_outcome(
                CallKind::DescribeStream,
                ResultClass::of(ServiceCallResult::InternalError)
            ),
            CallOutcome::Retry
        );
    }

    #[test]
    fn test_happy_path_to_ready() {
        let mut fsm = create_state_machine().unwrap();
        let mut ctx = ctx();

        let call = step_to_call(&mut fsm, &mut ctx);
        assert_eq!(call.name(), "describe_stream");
        answer(&mut ctx, &call, CallKind::DescribeStream, ServiceCallResult::Ok);

        let call = step_to_call(&mut fsm, &mut ctx);
        assert_eq!(call.name(), "get_streaming_endpoint");
        ctx.endpoint = Some(Url::parse("https://ingest.example.com").unwrap());
        answer(&mut ctx, &call, CallKind::GetStreamingEndpoint, ServiceCallResult::Ok);

        let call = step_to_call(&mut fsm, &mut ctx);
        assert_eq!(call.name(), "get_streaming_token");
        answer(&mut ctx, &call, CallKind::GetStreamingToken, ServiceCallResult::Ok);

        fsm.step(&mut ctx, 0).unwrap();
        assert_eq!(fsm.current_state(), StreamState::Ready);

        // No content yet: stays ready.
        fsm.step(&mut ctx, 0).unwrap();
        assert_eq!(fsm.current_state(), StreamState::Ready);

        ctx.has_content = true;
        let call = step_to_call(&mut fsm, &mut ctx);
        assert_eq!(call.name(), "put_stream");
    }

    #[test]
    fn test_describe_not_found_creates_then_tags() {
        let mut config = StreamConfig::new("cam");
        config.tags.insert("team".into(), "video".into());
        let mut ctx = ControlPlane::new(&config);
        let mut fsm = create_state_machine().unwrap();

        let call = step_to_call(&mut fsm, &mut ctx);
        answer(&mut ctx, &call, CallKind::DescribeStream, ServiceCallResult::ResourceNotFound);

        let call = step_to_call(&mut fsm, &mut ctx);
        assert_eq!(call.name(), "create_stream");
        answer(&mut ctx, &call, CallKind::CreateStream, ServiceCallResult::Ok);

        let call = step_to_call(&mut fsm, &mut ctx);
        assert_eq!(call.name(), "tag_stream");
    }

    #[test]
    fn test_tag_failure_is_best_effort() {
        let mut config = StreamConfig::new("cam");
        config.tags.insert("team".into(), "video".into());
        let mut ctx = ControlPlane::new(&config);
        let mut fsm = create_state_machine().unwrap();
        fsm.accept_state(StreamState::Describe).unwrap();
        fsm.accept_state(StreamState::Create).unwrap();
        ctx.last_result = Some(ServiceCallResult::Ok);

        let mut call = step_to_call(&mut fsm, &mut ctx);
        for _ in 0..=SERVICE_CALL_MAX_RETRY_COUNT {
            assert_eq!(call.name(), "tag_stream");
            answer(&mut ctx, &call, CallKind::TagStream, ServiceCallResult::ServiceUnavailable);
            call = step_to_call(&mut fsm, &mut ctx);
        }
        assert_eq!(call.name(), "get_streaming_endpoint");
    }

    #[test]
    fn test_describe_deleting_is_fatal() {
        let mut fsm = create_state_machine().unwrap();
        let mut ctx = ctx();
        let call = step_to_call(&mut fsm, &mut ctx);
        answer(&mut ctx, &call, CallKind::DescribeStream, ServiceCallResult::Ok);
        ctx.description = Some(StreamDescription {
            status: StreamStatus::Deleting,
            ..Default::default()
        });

        assert_eq!(fsm.step(&mut ctx, 0), Err(StreamError::StreamIsBeingDeleted));
    }

    #[test]
    fn test_token_auth_failure_is_fatal() {
        let mut fsm = create_state_machine().unwrap();
        let mut ctx = ctx();
        fsm.accept_state(StreamState::Describe).unwrap();
        fsm.accept_state(StreamState::GetEndpoint).unwrap();
        ctx.last_result = Some(ServiceCallResult::Ok);

        let call = step_to_call(&mut fsm, &mut ctx);
        answer(&mut ctx, &call, CallKind::GetStreamingToken, ServiceCallResult::Forbidden);
        assert_eq!(fsm.step(&mut ctx, 0), Err(StreamError::StreamAuthFailed));
    }

    #[test]
    fn test_unexpected_correlation_id() {
        let mut fsm = create_state_machine().unwrap();
        let mut ctx = ctx();
        let call = step_to_call(&mut fsm, &mut ctx);
        let id = call.context().correlation_id;

        assert_eq!(
            ctx.complete_call(CallKind::DescribeStream, id + 1, ServiceCallResult::Ok),
            Err(StreamError::UnexpectedCorrelationId(id + 1))
        );
        assert_eq!(
            ctx.complete_call(CallKind::CreateStream, id, ServiceCallResult::Ok),
            Err(StreamError::UnexpectedCorrelationId(id))
        );
        assert!(ctx.call_in_flight());
    }

    #[test]
    fn test_streaming_reenters_on_termination() {
        let mut fsm = create_state_machine().unwrap();
        let mut ctx = ctx();
        for state in [
            StreamState::Describe,
            StreamState::GetEndpoint,
            StreamState::GetToken,
            StreamState::Ready,
            StreamState::PutStream,
            StreamState::Streaming,
        ] {
            fsm.accept_state(state).unwrap();
        }

        ctx.termination = Some(ServiceCallResult::NotAuthorized);
        let call = step_to_call(&mut fsm, &mut ctx);
        assert_eq!(call.name(), "get_streaming_token");
        assert_eq!(ctx.termination, None);
    }

    #[test]
    fn test_stopping_flushes_before_stopped() {
        let mut fsm = create_state_machine().unwrap();
        let mut ctx = ctx();
        for state in [
            StreamState::Describe,
            StreamState::GetEndpoint,
            StreamState::GetToken,
            StreamState::Ready,
        ] {
            fsm.accept_state(state).unwrap();
        }
        ctx.endpoint = Some(Url::parse("https://ingest.example.com").unwrap());
        ctx.stopping = true;
        ctx.has_content = true;

        let call = step_to_call(&mut fsm, &mut ctx);
        assert_eq!(call.name(), "put_stream");

        // Nothing left and no live handle.
        ctx.cancel_call();
        ctx.has_content = false;
        let mut fsm = create_state_machine().unwrap();
        for state in [
            StreamState::Describe,
            StreamState::GetEndpoint,
            StreamState::GetToken,
            StreamState::Ready,
        ] {
            fsm.accept_state(state).unwrap();
        }
        assert_eq!(fsm.step(&mut ctx, 0), Ok(StreamState::Stopped));
    }
}
