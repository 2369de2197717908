//! Scripted device simulator.
//!
//! Implements [`Backend`] in terms of a small device-side model of the
//! service protocol: INIT allocates an id, CHECK consults a per-request
//! script, SEND/RECV move payload bytes, RESET aborts. Every transfer is
//! recorded so tests can assert on the exact wire activity, and a
//! concurrent-transfer counter verifies that the pipe never carries more
//! than one transfer at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{Backend, Opener};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{ServiceReply, SetupPacket, Status};

/// Serial number reported by the simulated device.
pub(crate) const SIM_SERIAL_NUMBER: &str = "0123456789abcdef01234567";

/// One transfer observed by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SimEvent {
    Init { request_type: u16, payload_size: u16 },
    Send { id: u16, data: Vec<u8> },
    Check { id: u16 },
    Recv { id: u16, size: u16 },
    Reset { id: u16 },
    /// Non-service IN transfer (service-layer bypass).
    In { request: u8 },
    /// Non-service OUT transfer (service-layer bypass).
    Out { request: u8, data: Vec<u8> },
}

/// Scripted behavior of one logical request, consumed per INIT.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// INIT replies with this status and no id.
    RejectInit(Status),
    /// Stay PENDING for `checks` polls, then report `status` with
    /// `result`; an OK status carries `reply` as the inbound payload.
    Respond {
        checks: u32,
        status: Status,
        result: Option<i32>,
        reply: Vec<u8>,
    },
    /// Never leave PENDING.
    NeverComplete,
}

impl Script {
    /// Complete immediately with OK and an empty payload.
    pub(crate) fn ok() -> Script {
        Script::Respond {
            checks: 0,
            status: Status::Ok,
            result: None,
            reply: Vec::new(),
        }
    }

    /// Complete with OK and `reply` after `checks` PENDING polls.
    pub(crate) fn reply_after(checks: u32, reply: Vec<u8>) -> Script {
        Script::Respond {
            checks,
            status: Status::Ok,
            result: Some(0),
            reply,
        }
    }
}

/// A request the simulated device is processing.
struct SimRequest {
    script: Script,
    checks_done: u32,
}

struct SimState {
    scripts: HashMap<u16, VecDeque<Script>>,
    requests: HashMap<u16, SimRequest>,
    next_id: u16,
    events: Vec<SimEvent>,
    fail_transfers: bool,
    /// Highest number of simultaneously tracked requests.
    max_outstanding: usize,
}

pub(crate) struct SimDevice {
    state: Mutex<SimState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimDevice {
    pub(crate) fn new() -> Arc<SimDevice> {
        Arc::new(SimDevice {
            state: Mutex::new(SimState {
                scripts: HashMap::new(),
                requests: HashMap::new(),
                next_id: 1,
                events: Vec::new(),
                fail_transfers: false,
                max_outstanding: 0,
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Queue `script` for the next INIT of `request_type`. INITs with no
    /// queued script complete immediately with OK and no payload.
    pub(crate) fn script(&self, request_type: u16, script: Script) {
        let mut state = self.state.lock().unwrap();
        state
            .scripts
            .entry(request_type)
            .or_default()
            .push_back(script);
    }

    /// Make every subsequent transfer fail, as if the device vanished.
    pub(crate) fn fail_transfers(&self, fail: bool) {
        self.state.lock().unwrap().fail_transfers = fail;
    }

    /// All transfers observed so far.
    pub(crate) fn events(&self) -> Vec<SimEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Highest number of concurrently outstanding transfers observed.
    pub(crate) fn max_concurrent_transfers(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Requests the device is still tracking (not completed, RECVed or
    /// RESET).
    pub(crate) fn outstanding_requests(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    /// Highest number of simultaneously tracked requests observed.
    pub(crate) fn max_outstanding_requests(&self) -> usize {
        self.state.lock().unwrap().max_outstanding
    }

    /// A [`Backend`] view of this device.
    pub(crate) fn backend(self: &Arc<Self>) -> Box<dyn Backend> {
        Box::new(SimBackend {
            device: self.clone(),
            closed: false,
        })
    }

    /// An [`Opener`] yielding fresh backends for this device.
    pub(crate) fn opener(self: &Arc<Self>) -> Opener {
        let device = self.clone();
        Box::new(move || Ok(device.backend()))
    }

    fn begin_transfer(&self) -> Result<()> {
        let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(n, Ordering::SeqCst);
        // Hold the slot long enough that an overlapping transfer would be
        // observed.
        std::thread::sleep(Duration::from_millis(1));
        if self.state.lock().unwrap().fail_transfers {
            self.end_transfer();
            return Err(Error::new(ErrorKind::Usb, "simulated transfer failure"));
        }
        Ok(())
    }

    fn end_transfer(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn handle_in(&self, setup: SetupPacket) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let reply = match setup.request {
            // INIT
            1 => {
                let request_type = setup.index;
                let payload_size = setup.value;
                state.events.push(SimEvent::Init {
                    request_type,
                    payload_size,
                });
                let script = state
                    .scripts
                    .get_mut(&request_type)
                    .and_then(|q| q.pop_front())
                    .unwrap_or_else(Script::ok);
                match script {
                    Script::RejectInit(status) => ServiceReply {
                        status,
                        id: None,
                        size: None,
                        result: None,
                    },
                    script => {
                        let id = state.next_id;
                        state.next_id = state.next_id.checked_add(1).unwrap_or(1);
                        state.requests.insert(
                            id,
                            SimRequest {
                                script,
                                checks_done: 0,
                            },
                        );
                        state.max_outstanding = state.max_outstanding.max(state.requests.len());
                        ServiceReply {
                            status: Status::Ok,
                            id: Some(id),
                            size: None,
                            result: None,
                        }
                    }
                }
            }
            // CHECK
            2 => {
                let id = setup.index;
                state.events.push(SimEvent::Check { id });
                const PENDING: ServiceReply = ServiceReply {
                    status: Status::Pending,
                    id: None,
                    size: None,
                    result: None,
                };
                let (reply, forget) = match state.requests.get_mut(&id) {
                    None => (
                        ServiceReply {
                            status: Status::NotFound,
                            id: None,
                            size: None,
                            result: None,
                        },
                        false,
                    ),
                    Some(request) => {
                        request.checks_done += 1;
                        match &request.script {
                            Script::NeverComplete => (PENDING, false),
                            Script::Respond {
                                checks,
                                status,
                                result,
                                reply,
                            } => {
                                if request.checks_done <= *checks {
                                    (PENDING, false)
                                } else {
                                    let done = ServiceReply {
                                        status: *status,
                                        id: None,
                                        size: Some(reply.len() as u32),
                                        result: *result,
                                    };
                                    // Nothing left to RECV: the device
                                    // forgets the request.
                                    (done, reply.is_empty() || *status != Status::Ok)
                                }
                            }
                            Script::RejectInit(_) => unreachable!("rejected INIT has no id"),
                        }
                    }
                };
                if forget {
                    state.requests.remove(&id);
                }
                reply
            }
            // RECV
            4 => {
                let id = setup.index;
                state.events.push(SimEvent::Recv {
                    id,
                    size: setup.length,
                });
                match state.requests.remove(&id) {
                    None => {
                        return Err(Error::new(
                            ErrorKind::Usb,
                            "simulated stall: RECV of unknown request",
                        ))
                    }
                    Some(request) => match request.script {
                        Script::Respond { reply, .. } => return Ok(reply),
                        _ => {
                            return Err(Error::new(
                                ErrorKind::Usb,
                                "simulated stall: RECV before completion",
                            ))
                        }
                    },
                }
            }
            // RESET
            5 => {
                let id = setup.index;
                state.events.push(SimEvent::Reset { id });
                if id == 0 {
                    state.requests.clear();
                } else {
                    state.requests.remove(&id);
                }
                ServiceReply {
                    status: Status::Ok,
                    id: None,
                    size: None,
                    result: None,
                }
            }
            // Non-service vendor transfer: reply with zeros.
            request => {
                state.events.push(SimEvent::In { request });
                return Ok(vec![0; setup.length as usize]);
            }
        };
        let mut buf = reply.encode();
        buf.resize(setup.length as usize, 0);
        Ok(buf)
    }

    fn handle_out(&self, setup: SetupPacket, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match setup.request {
            // SEND
            3 => {
                let id = setup.index;
                state.events.push(SimEvent::Send {
                    id,
                    data: data.to_vec(),
                });
                if state.requests.contains_key(&id) {
                    Ok(())
                } else {
                    Err(Error::new(
                        ErrorKind::Usb,
                        "simulated stall: SEND to unknown request",
                    ))
                }
            }
            // Non-service vendor transfer: accept and record.
            request => {
                state.events.push(SimEvent::Out {
                    request,
                    data: data.to_vec(),
                });
                Ok(())
            }
        }
    }
}

struct SimBackend {
    device: Arc<SimDevice>,
    closed: bool,
}

impl Backend for SimBackend {
    fn transfer_in(&mut self, setup: SetupPacket) -> Result<Vec<u8>> {
        if self.closed {
            return Err(Error::new(ErrorKind::State, "device is closed"));
        }
        self.device.begin_transfer()?;
        let result = self.device.handle_in(setup);
        self.device.end_transfer();
        result
    }

    fn transfer_out(&mut self, setup: SetupPacket, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::new(ErrorKind::State, "device is closed"));
        }
        self.device.begin_transfer()?;
        let result = self.device.handle_out(setup, data);
        self.device.end_transfer();
        result
    }

    fn serial_number(&self) -> Option<&str> {
        Some(SIM_SERIAL_NUMBER)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
