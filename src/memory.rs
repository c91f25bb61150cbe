/// Memory side of the CU boundary.
///
/// Real cache and DRAM timing is outside this crate. `FixedLatencyMemory`
/// closes the loop instead: it serves any number of request/response links
/// from one sparse backing store and answers every request after a fixed
/// number of cycles, in arrival order per link.
use std::collections::{HashMap, VecDeque};

use crate::config::MemoryConfig;
use crate::port::{channel, Receiver, Sender};
use crate::protocol::{MemReq, MemRsp};

/// CU end of a memory link.
#[derive(Debug)]
pub struct MemLink {
    pub req: Sender<MemReq>,
    pub rsp: Receiver<MemRsp>,
}

/// Memory end of a memory link.
#[derive(Debug)]
pub struct MemEndpoint {
    pub req: Receiver<MemReq>,
    pub rsp: Sender<MemRsp>,
}

/// A request/response port pair with `capacity` slots in each direction.
pub fn link(name: &str, capacity: usize) -> (MemLink, MemEndpoint) {
    let (req_tx, req_rx) = channel(format!("{name}.req"), capacity);
    let (rsp_tx, rsp_rx) = channel(format!("{name}.rsp"), capacity);
    (
        MemLink {
            req: req_tx,
            rsp: rsp_rx,
        },
        MemEndpoint {
            req: req_rx,
            rsp: rsp_tx,
        },
    )
}

/// Sparse byte-addressed global memory. Unwritten bytes read as zero.
#[derive(Debug, Default, Clone)]
pub struct GlobalMemory {
    data: HashMap<u64, u8>,
}

impl GlobalMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, addr: u64, len: u64) -> Vec<u8> {
        (addr..addr + len)
            .map(|a| *self.data.get(&a).unwrap_or(&0))
            .collect()
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.data.insert(addr + i as u64, byte);
        }
    }

    /// Write only the bytes whose mask bit is set.
    pub fn write_masked(&mut self, addr: u64, bytes: &[u8], mask: &[bool]) {
        for (i, (&byte, &dirty)) in bytes.iter().zip(mask).enumerate() {
            if dirty {
                self.data.insert(addr + i as u64, byte);
            }
        }
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let b = self.read(addr, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }
}

struct Port {
    endpoint: MemEndpoint,
    /// Responses and the cycle they become visible
    pending: VecDeque<(u64, MemRsp)>,
}

/// Answers every request `latency` cycles after accepting it.
pub struct FixedLatencyMemory {
    pub storage: GlobalMemory,
    latency: u64,
    ports: Vec<Port>,
    /// Requests each link may have accepted but not yet answered
    in_flight_limit: usize,
    served: u64,
}

impl FixedLatencyMemory {
    pub fn new(latency: u64) -> Self {
        FixedLatencyMemory {
            storage: GlobalMemory::new(),
            latency,
            ports: Vec::new(),
            in_flight_limit: 64,
            served: 0,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        FixedLatencyMemory {
            in_flight_limit: config.port_capacity,
            ..Self::new(config.latency)
        }
    }

    pub fn attach(&mut self, endpoint: MemEndpoint) {
        self.ports.push(Port {
            endpoint,
            pending: VecDeque::new(),
        });
    }

    /// Requests served so far.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn is_idle(&self) -> bool {
        self.ports
            .iter()
            .all(|p| p.pending.is_empty() && p.endpoint.req.is_empty())
    }

    fn access(&mut self, req: MemReq) -> MemRsp {
        match req {
            MemReq::Read(r) => MemRsp::DataReady {
                rsp_to: r.id,
                data: self.storage.read(r.address, r.byte_size),
            },
            MemReq::Write(w) => {
                self.storage.write_masked(w.address, &w.data, &w.dirty_mask);
                MemRsp::WriteDone { rsp_to: w.id }
            }
        }
    }

    /// Accept at most one request and return at most one response per link.
    pub fn tick(&mut self, now: u64) -> bool {
        let mut progress = false;
        for i in 0..self.ports.len() {
            let ready = matches!(self.ports[i].pending.front(), Some((at, _)) if *at <= now);
            if ready {
                if let Some((at, rsp)) = self.ports[i].pending.pop_front() {
                    if let Err(back) = self.ports[i].endpoint.rsp.send(rsp) {
                        log::trace!("memory response port {} full", self.ports[i].endpoint.rsp.name());
                        self.ports[i].pending.push_front((at, back.0));
                    } else {
                        progress = true;
                    }
                }
            }

            if self.ports[i].pending.len() >= self.in_flight_limit {
                continue;
            }
            if let Some(req) = self.ports[i].endpoint.req.retrieve() {
                let rsp = self.access(req);
                self.ports[i].pending.push_back((now + self.latency, rsp));
                self.served += 1;
                progress = true;
            }
        }
        progress
    }
}
