//! Logical-request scheduler.
//!
//! A session's control pipe carries one transfer at a time, while callers
//! may have many logical requests outstanding. The scheduler owns the
//! pending-request registry and a dedicated thread that advances each
//! request's state machine one transfer at a step:
//!
//! INIT → (SEND) → CHECK* → (RECV) → done
//!
//! Between steps the pipe mutex is released, so transfers of concurrent
//! requests interleave. CHECK polling backs off according to a
//! [`CheckInterval`] policy. Every request carries a deadline that fires at
//! any suspension point, and closing the session cancels everything that
//! is queued or in flight.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::backend::{SharedPipe, TRANSFER_TIMEOUT};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{self, ServiceReply, Status};

/// Consecutive USB transfer failures after which the device is presumed
/// disconnected and the session shuts itself down.
const MAX_USB_ERROR_STREAK: u32 = 3;

/// Reply to a completed logical request.
///
/// A reply is produced for *any* terminal status; interpreting a non-OK
/// status or a non-zero result code is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Terminal transport status reported by CHECK.
    pub status: Status,

    /// Logical result code; `None` when the device omitted the field.
    pub result: Option<i32>,

    /// Device-to-host payload, empty unless RECV ran.
    pub payload: Vec<u8>,
}

/// Polling backoff policy: delay before CHECK poll number `attempt`
/// (1-based). The attempt counter resets when a request (re-)enters INIT.
pub type CheckInterval = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// The default stepped backoff curve.
pub fn default_check_interval(attempt: u32) -> Duration {
    match attempt {
        0..=2 => Duration::from_millis(100),
        3..=4 => Duration::from_millis(250),
        5..=6 => Duration::from_millis(500),
        _ => Duration::from_millis(1000),
    }
}

/// Completion signal the caller blocks on.
///
/// Signalled exactly once per request, with the reply or the terminal
/// error.
pub(crate) struct Completion {
    outcome: Mutex<Option<Result<Reply>>>,
    signal: Condvar,
}

impl Completion {
    fn new() -> Completion {
        Completion {
            outcome: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    fn pre_completed(outcome: Result<Reply>) -> Arc<Completion> {
        let completion = Completion::new();
        *completion.outcome.lock().unwrap() = Some(outcome);
        Arc::new(completion)
    }

    fn complete(&self, outcome: Result<Reply>) {
        let mut slot = self.outcome.lock().unwrap();
        debug_assert!(slot.is_none(), "request completed twice");
        *slot = Some(outcome);
        self.signal.notify_all();
    }

    /// Block until the scheduler signals completion.
    ///
    /// The scheduler enforces the request deadline; the extra grace period
    /// here only bounds the wait if the scheduler thread itself is gone.
    pub(crate) fn wait(&self, deadline: Instant) -> Result<Reply> {
        let limit = deadline + TRANSFER_TIMEOUT + Duration::from_secs(5);
        let mut outcome = self.outcome.lock().unwrap();
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            let now = Instant::now();
            if now >= limit {
                return Err(Error::new(
                    ErrorKind::Internal,
                    "scheduler did not complete the request",
                )
                .log_error());
            }
            let (guard, _) = self.signal.wait_timeout(outcome, limit - now).unwrap();
            outcome = guard;
        }
    }
}

/// Per-request state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// INIT not yet accepted (includes busy-retries of INIT).
    Init,
    /// INIT accepted, outbound payload not yet sent.
    Send,
    /// Polling CHECK until a terminal status.
    Check,
    /// Terminal OK with a payload to read.
    Recv,
}

/// A pending logical request. Owned by the registry; the caller holds only
/// the completion signal.
struct Pending {
    /// Device-assigned id, known after INIT is accepted.
    req_id: Option<u16>,
    request_type: u16,
    payload: Vec<u8>,
    /// Inbound payload size, once reported by CHECK.
    recv_size: Option<u32>,
    /// Result code, once reported by CHECK.
    result: Option<i32>,
    step: Step,
    deadline: Instant,
    /// CHECK poll counter for the backoff curve.
    attempt: u32,
    /// Earliest time the next step may run.
    next_poll: Instant,
    /// Last-serviced order; the scheduler picks the smallest among ready
    /// requests so no request starves.
    seq: u64,
    completion: Arc<Completion>,
}

struct State {
    /// Admission queue, FIFO.
    queue: VecDeque<Pending>,
    /// In-progress requests (the pending registry).
    active: Vec<Pending>,
    concurrency_limit: Option<usize>,
    check_interval: CheckInterval,
    next_seq: u64,
    cancel_requested: bool,
    shutdown: bool,
    /// Set after repeated USB failures; the device is presumed gone.
    died: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Wakes the scheduler thread on submission, cancel or shutdown.
    wakeup: Condvar,
    /// Wakes waiters when the registry and queue become empty.
    drained: Condvar,
}

/// Handle to a session's scheduler thread.
pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(
        pipe: SharedPipe,
        concurrency_limit: Option<usize>,
        check_interval: CheckInterval,
    ) -> Scheduler {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active: Vec::new(),
                concurrency_limit,
                check_interval,
                next_seq: 0,
                cancel_requested: false,
                shutdown: false,
                died: false,
            }),
            wakeup: Condvar::new(),
            drained: Condvar::new(),
        });
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("particle-usb scheduler".into())
                .spawn(move || run(shared, pipe))
                .expect("failed to spawn scheduler thread")
        };
        Scheduler {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Queue a logical request. Admission is FIFO; when a concurrency limit
    /// is set, the request waits in the queue until a slot frees up.
    pub(crate) fn submit(
        &self,
        request_type: u16,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> Arc<Completion> {
        let mut state = self.shared.state.lock().unwrap();
        if state.died {
            return Completion::pre_completed(Err(Error::new(
                ErrorKind::State,
                "device is no longer available",
            )));
        }
        if state.shutdown {
            return Completion::pre_completed(Err(Error::new(
                ErrorKind::Cancelled,
                "session is closing",
            )));
        }
        let completion = Arc::new(Completion::new());
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back(Pending {
            req_id: None,
            request_type,
            payload,
            recv_size: None,
            result: None,
            step: Step::Init,
            deadline,
            attempt: 0,
            next_poll: Instant::now(),
            seq,
            completion: completion.clone(),
        });
        self.shared.wakeup.notify_one();
        completion
    }

    /// Cancel every queued and in-flight request.
    pub(crate) fn cancel_all(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.cancel_requested = true;
        self.shared.wakeup.notify_one();
        // Wait for the scheduler thread to acknowledge so cancellation is
        // synchronous to the caller.
        while state.cancel_requested && !state.shutdown {
            state = self.shared.drained.wait(state).unwrap();
        }
    }

    /// Whether the scheduler shut itself down after losing the device.
    pub(crate) fn is_dead(&self) -> bool {
        self.shared.state.lock().unwrap().died
    }

    /// Number of queued plus in-flight requests.
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.queue.len() + state.active.len()
    }

    /// Block until no requests are queued or in flight. Returns `false` if
    /// `timeout` elapses first.
    pub(crate) fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let limit = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.queue.is_empty() && state.active.is_empty() {
                return true;
            }
            match limit {
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return false;
                    }
                    let (guard, _) = self
                        .shared
                        .drained
                        .wait_timeout(state, limit - now)
                        .unwrap();
                    state = guard;
                }
                None => state = self.shared.drained.wait(state).unwrap(),
            }
        }
    }

    /// Cancel all pending requests and stop the scheduler thread.
    ///
    /// The thread issues a best-effort RESET of every outstanding device
    /// request (id 0) before exiting. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.request_shutdown();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }

    fn request_shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        self.shared.wakeup.notify_one();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// What a single driver step decided.
enum Outcome {
    /// Request stays pending; `next_poll` and `step` were updated.
    Continue,
    /// Request reached a terminal state.
    Done(Result<Reply>),
}

fn run(shared: Arc<Shared>, pipe: SharedPipe) {
    let mut usb_error_streak: u32 = 0;
    loop {
        let mut state = shared.state.lock().unwrap();

        // Wait for a runnable request, processing control flags and
        // deadlines while idle.
        let index = loop {
            if state.shutdown {
                teardown(state, &shared, &pipe);
                return;
            }
            if state.cancel_requested {
                state = cancel_all_pending(state, &shared, &pipe);
                continue;
            }

            let now = Instant::now();
            expire_queued(&mut state, now);
            admit(&mut state);
            if state.queue.is_empty() && state.active.is_empty() {
                shared.drained.notify_all();
            }

            if let Some(index) = pick(&state, now) {
                break index;
            }

            match next_wake(&state) {
                Some(wake) if wake <= now => {
                    // A deadline or poll time is already due; re-scan.
                    continue;
                }
                Some(wake) => {
                    let (guard, _) = shared.wakeup.wait_timeout(state, wake - now).unwrap();
                    state = guard;
                }
                None => state = shared.wakeup.wait(state).unwrap(),
            }
        };

        // Claim the request and release the registry lock: transfers are
        // never performed while holding it.
        state.active[index].seq = state.next_seq;
        state.next_seq += 1;
        let check_interval = state.check_interval.clone();
        let mut request = state.active.swap_remove(index);
        drop(state);

        let outcome = if Instant::now() >= request.deadline {
            timeout_request(&request, &pipe)
        } else {
            drive(&mut request, &pipe, &*check_interval, &mut usb_error_streak)
        };

        let mut state = shared.state.lock().unwrap();
        match outcome {
            Outcome::Continue => state.active.push(request),
            Outcome::Done(result) => {
                if let Err(err) = &result {
                    debug!(
                        "request {} (type {}) failed: {err}",
                        request.req_id.map_or(-1i32, i32::from),
                        request.request_type
                    );
                }
                request.completion.complete(result);
                if state.queue.is_empty() && state.active.is_empty() {
                    shared.drained.notify_all();
                }
            }
        }

        if usb_error_streak >= MAX_USB_ERROR_STREAK && !state.died {
            state.died = true;
            Error::new(
                ErrorKind::Usb,
                "repeated USB failures, presuming device disconnected",
            )
            .log_error();
            drop(cancel_all_pending(state, &shared, &pipe));
        }
    }
}

/// Fail queued requests whose deadline passed while waiting for admission.
fn expire_queued(state: &mut State, now: Instant) {
    let mut index = 0;
    while index < state.queue.len() {
        if now >= state.queue[index].deadline {
            let request = state.queue.remove(index).unwrap();
            request.completion.complete(Err(Error::new(
                ErrorKind::Timeout,
                "request timed out waiting for admission",
            )
            .log_warn()));
        } else {
            index += 1;
        }
    }
}

/// Move queued requests into the registry while the concurrency limit
/// permits.
fn admit(state: &mut State) {
    while !state.queue.is_empty()
        && state
            .concurrency_limit
            .map_or(true, |limit| state.active.len() < limit)
    {
        let request = state.queue.pop_front().unwrap();
        trace!("admitting request type {}", request.request_type);
        state.active.push(request);
    }
}

/// Pick the next request to service: among ready requests the
/// least-recently-serviced wins, with INIT-pending requests preferred so
/// INIT order stays prompt. Expired requests are always ready.
fn pick(state: &State, now: Instant) -> Option<usize> {
    let mut best: Option<(bool, u64, usize)> = None;
    for (index, request) in state.active.iter().enumerate() {
        if now < request.next_poll && now < request.deadline {
            continue;
        }
        let key = (request.step != Step::Init, request.seq, index);
        if best.map_or(true, |b| (key.0, key.1) < (b.0, b.1)) {
            best = Some(key);
        }
    }
    best.map(|(_, _, index)| index)
}

/// Earliest instant at which anything becomes runnable or expires.
fn next_wake(state: &State) -> Option<Instant> {
    let active = state
        .active
        .iter()
        .map(|r| r.next_poll.min(r.deadline))
        .min();
    let queued = state.queue.iter().map(|r| r.deadline).min();
    match (active, queued) {
        (Some(a), Some(q)) => Some(a.min(q)),
        (a, q) => a.or(q),
    }
}

/// Fail an expired request, aborting it on the device if it got an id.
fn timeout_request(request: &Pending, pipe: &SharedPipe) -> Outcome {
    if let Some(id) = request.req_id {
        reset_request(pipe, id);
    }
    Outcome::Done(Err(Error::new(ErrorKind::Timeout, "request timed out").log_warn()))
}

/// Best-effort RESET; device rejection is not an error.
fn reset_request(pipe: &SharedPipe, id: u16) {
    trace!("resetting request {id}");
    let setup = protocol::reset_packet(id);
    if let Err(err) = pipe.lock().unwrap().transfer_in(setup) {
        trace!("RESET of request {id} rejected: {err}");
    }
}

/// Advance a request's state machine by one transfer.
fn drive(
    request: &mut Pending,
    pipe: &SharedPipe,
    check_interval: &(dyn Fn(u32) -> Duration + Send + Sync),
    usb_error_streak: &mut u32,
) -> Outcome {
    match request.step {
        Step::Init => drive_init(request, pipe, check_interval, usb_error_streak),
        Step::Send => drive_send(request, pipe, usb_error_streak),
        Step::Check => drive_check(request, pipe, check_interval, usb_error_streak),
        Step::Recv => drive_recv(request, pipe, usb_error_streak),
    }
}

fn drive_init(
    request: &mut Pending,
    pipe: &SharedPipe,
    check_interval: &(dyn Fn(u32) -> Duration + Send + Sync),
    usb_error_streak: &mut u32,
) -> Outcome {
    let setup = protocol::init_packet(request.request_type, request.payload.len() as u16);
    let buf = match pipe.lock().unwrap().transfer_in(setup) {
        Ok(buf) => buf,
        Err(err) => {
            *usb_error_streak += 1;
            return Outcome::Done(Err(err.log_warn()));
        }
    };
    *usb_error_streak = 0;

    let reply = match ServiceReply::parse(&buf) {
        Ok(reply) => reply,
        Err(err) => return Outcome::Done(Err(err.log_warn())),
    };
    match reply.status {
        Status::Ok => {
            let Some(id) = reply.id else {
                return Outcome::Done(Err(Error::new(
                    ErrorKind::Protocol,
                    "INIT reply is missing the request id",
                )
                .log_warn()));
            };
            trace!(
                "request type {} initialized as id {id}",
                request.request_type
            );
            request.req_id = Some(id);
            request.attempt = 0;
            request.step = if request.payload.is_empty() {
                Step::Check
            } else {
                Step::Send
            };
            request.next_poll = Instant::now();
            Outcome::Continue
        }
        Status::Busy => {
            // Device can't take the request yet; retry INIT with backoff
            // until the deadline.
            request.attempt += 1;
            request.next_poll = Instant::now() + check_interval(request.attempt);
            trace!(
                "device busy, retrying INIT of request type {} (attempt {})",
                request.request_type,
                request.attempt
            );
            Outcome::Continue
        }
        Status::NoMemory => Outcome::Done(Err(Error::new(
            ErrorKind::Memory,
            "device ran out of memory for the request",
        )
        .log_warn())),
        status => Outcome::Done(Err(Error::new(
            ErrorKind::Protocol,
            format!("unexpected status {status:?} in INIT reply"),
        )
        .log_warn())),
    }
}

fn drive_send(request: &mut Pending, pipe: &SharedPipe, usb_error_streak: &mut u32) -> Outcome {
    let Some(id) = request.req_id else {
        return Outcome::Done(Err(
            Error::new(ErrorKind::Internal, "SEND without a request id").log_error()
        ));
    };
    let setup = protocol::send_packet(id, request.payload.len() as u16);
    match pipe
        .lock()
        .unwrap()
        .transfer_out(setup, &request.payload)
    {
        Ok(()) => {
            *usb_error_streak = 0;
            request.step = Step::Check;
            request.attempt = 0;
            request.next_poll = Instant::now();
            Outcome::Continue
        }
        Err(err) => {
            *usb_error_streak += 1;
            reset_request(pipe, id);
            Outcome::Done(Err(err.log_warn()))
        }
    }
}

fn drive_check(
    request: &mut Pending,
    pipe: &SharedPipe,
    check_interval: &(dyn Fn(u32) -> Duration + Send + Sync),
    usb_error_streak: &mut u32,
) -> Outcome {
    let Some(id) = request.req_id else {
        return Outcome::Done(Err(
            Error::new(ErrorKind::Internal, "CHECK without a request id").log_error()
        ));
    };
    let buf = match pipe.lock().unwrap().transfer_in(protocol::check_packet(id)) {
        Ok(buf) => buf,
        Err(err) => {
            // Transient CHECK failures are retried with backoff; a streak
            // of failures means the device is gone.
            *usb_error_streak += 1;
            if *usb_error_streak >= MAX_USB_ERROR_STREAK {
                reset_request(pipe, id);
                return Outcome::Done(Err(err.log_warn()));
            }
            request.attempt += 1;
            request.next_poll = Instant::now() + check_interval(request.attempt);
            return Outcome::Continue;
        }
    };
    *usb_error_streak = 0;

    let reply = match ServiceReply::parse(&buf) {
        Ok(reply) => reply,
        Err(err) => {
            reset_request(pipe, id);
            return Outcome::Done(Err(err.log_warn()));
        }
    };
    if let Some(size) = reply.size {
        request.recv_size = Some(size);
    }
    if let Some(result) = reply.result {
        request.result = Some(result);
    }
    match reply.status {
        Status::Pending => {
            request.attempt += 1;
            request.next_poll = Instant::now() + check_interval(request.attempt);
            Outcome::Continue
        }
        Status::Ok => {
            let size = request.recv_size.unwrap_or(0);
            if size == 0 {
                return Outcome::Done(Ok(Reply {
                    status: Status::Ok,
                    result: request.result,
                    payload: Vec::new(),
                }));
            }
            if size > u16::MAX as u32 {
                reset_request(pipe, id);
                return Outcome::Done(Err(Error::new(
                    ErrorKind::Protocol,
                    format!("reply payload of {size} bytes exceeds the transfer limit"),
                )
                .log_warn()));
            }
            request.step = Step::Recv;
            request.next_poll = Instant::now();
            Outcome::Continue
        }
        status => Outcome::Done(Ok(Reply {
            status,
            result: request.result,
            payload: Vec::new(),
        })),
    }
}

fn drive_recv(request: &mut Pending, pipe: &SharedPipe, usb_error_streak: &mut u32) -> Outcome {
    let Some(id) = request.req_id else {
        return Outcome::Done(Err(
            Error::new(ErrorKind::Internal, "RECV without a request id").log_error()
        ));
    };
    let size = request.recv_size.unwrap_or(0) as u16;
    match pipe
        .lock()
        .unwrap()
        .transfer_in(protocol::recv_packet(id, size))
    {
        Ok(mut payload) => {
            *usb_error_streak = 0;
            payload.truncate(size as usize);
            Outcome::Done(Ok(Reply {
                status: Status::Ok,
                result: request.result,
                payload,
            }))
        }
        Err(err) => {
            *usb_error_streak += 1;
            reset_request(pipe, id);
            Outcome::Done(Err(err.log_warn()))
        }
    }
}

/// Cancel everything queued and in flight, aborting initialized requests
/// on the device individually. The registry lock is released while the
/// aborts are on the wire; requests submitted meanwhile are untouched.
fn cancel_all_pending<'a>(
    mut state: std::sync::MutexGuard<'a, State>,
    shared: &'a Shared,
    pipe: &SharedPipe,
) -> std::sync::MutexGuard<'a, State> {
    let mut cancelled: Vec<Pending> = state.queue.drain(..).collect();
    cancelled.extend(state.active.drain(..));
    drop(state);

    if !cancelled.is_empty() {
        debug!("cancelling {} pending requests", cancelled.len());
    }
    for request in cancelled {
        if let Some(id) = request.req_id {
            reset_request(pipe, id);
        }
        request
            .completion
            .complete(Err(Error::new(ErrorKind::Cancelled, "request cancelled")));
    }

    let mut state = shared.state.lock().unwrap();
    state.cancel_requested = false;
    shared.drained.notify_all();
    state
}

/// Session close: cancel all pending requests, abort everything on the
/// device with RESET(0), and exit the thread.
fn teardown(
    mut state: std::sync::MutexGuard<'_, State>,
    shared: &Shared,
    pipe: &SharedPipe,
) {
    let mut cancelled: Vec<Pending> = state.queue.drain(..).collect();
    cancelled.extend(state.active.drain(..));
    drop(state);

    reset_request(pipe, 0);
    for request in cancelled {
        request
            .completion
            .complete(Err(Error::new(ErrorKind::Cancelled, "session closed")));
    }
    shared.drained.notify_all();
}
