/// Top-level GPU simulator.
/// Models a GPU as one dispatcher feeding a set of Compute Units, all served
/// by a fixed-latency global memory. Components only talk through ports; the
/// `Gpu` owns them and advances them one cycle at a time.
use serde::Serialize;

use crate::config::SimConfig;
use crate::cu::{ComputeUnit, CuId, CuStats};
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, SimError};
use crate::isa::micro::{MicroAlu, MicroDecoder};
use crate::isa::{Alu, Decoder};
use crate::kernel::{Dim3, KernelLaunch};
use crate::memory::FixedLatencyMemory;
use crate::metrics::{now_ms, write_metrics, CuSnapshot, LiveMetrics};
use crate::port::{channel, Receiver, Sender};
use crate::protocol::{CuControlReq, CuControlRsp, LaunchKernelReq, LaunchKernelRsp, ReqId};

/// External controller's end of a CU's flush/restart ports.
#[derive(Debug)]
pub struct CuControlPort {
    pub req: Sender<CuControlReq>,
    pub rsp: Receiver<CuControlRsp>,
}

/// Statistics collected during a kernel launch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KernelStats {
    pub kernel: String,
    /// Cycles from launch to the launch response
    pub cycles: u64,
    pub work_groups: usize,
    /// Wavefronts retired, simulated or predicted
    pub wavefronts: u64,
    /// Of which retired by the sampling fast path
    pub wfs_sampled: u64,
    pub insts_issued: u64,
    /// Work-groups dispatched to each CU
    pub wgs_per_cu: Vec<usize>,
    /// Most work-groups resident at once on each CU since it was built
    pub peak_resident_per_cu: Vec<usize>,
}

pub struct Gpu {
    config: SimConfig,
    dispatcher: Dispatcher,
    cus: Vec<ComputeUnit>,
    controls: Vec<CuControlPort>,
    memory: FixedLatencyMemory,
    /// Driver side of the launch-response port
    launch_rsp: Receiver<LaunchKernelRsp>,
    /// Most recently launched kernel, kept for snapshots
    last_launch: Option<KernelLaunch>,
    now: u64,
}

impl Gpu {
    /// A GPU whose CUs run the built-in micro ISA.
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        Self::with_isa(config, || {
            (
                Box::new(MicroDecoder) as Box<dyn Decoder>,
                Box::new(MicroAlu) as Box<dyn Alu>,
            )
        })
    }

    /// `isa` is called once per CU for its decoder and ALU.
    pub fn with_isa<F>(config: SimConfig, isa: F) -> Result<Self, ConfigError>
    where
        F: Fn() -> (Box<dyn Decoder>, Box<dyn Alu>),
    {
        config.validate()?;
        let (rsp_tx, launch_rsp) = channel("driver.launch_rsp", config.dispatcher.port_capacity);
        let mut dispatcher = Dispatcher::new("dispatcher", config.dispatcher.clone(), rsp_tx)?;
        let mut memory = FixedLatencyMemory::from_config(&config.memory);

        let mut cus = Vec::with_capacity(config.num_cus);
        let mut controls = Vec::with_capacity(config.num_cus);
        for i in 0..config.num_cus {
            let (decoder, alu) = isa();
            let (cu, handles) = ComputeUnit::new(CuId(i), &config.cu, decoder, alu)?;
            dispatcher.register_cu(cu.id(), &config.cu, handles.map)?;
            memory.attach(handles.inst_mem);
            memory.attach(handles.scalar_mem);
            memory.attach(handles.vector_mem);
            controls.push(CuControlPort {
                req: handles.control,
                rsp: handles.control_rsp,
            });
            cus.push(cu);
        }

        log::info!(
            "built GPU: {} CUs x {} SIMDs, {} dispatch, memory latency {}",
            config.num_cus,
            config.cu.simd_count,
            config.dispatcher.policy.name(),
            config.memory.latency
        );

        Ok(Gpu {
            config,
            dispatcher,
            cus,
            controls,
            memory,
            launch_rsp,
            last_launch: None,
            now: 0,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn cus(&self) -> &[ComputeUnit] {
        &self.cus
    }

    pub fn cu(&self, index: usize) -> &ComputeUnit {
        &self.cus[index]
    }

    pub fn control(&self, index: usize) -> &CuControlPort {
        &self.controls[index]
    }

    /// Launch responses, for callers driving `step` themselves.
    pub fn launch_responses(&self) -> &Receiver<LaunchKernelRsp> {
        &self.launch_rsp
    }

    pub fn memory(&self) -> &FixedLatencyMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut FixedLatencyMemory {
        &mut self.memory
    }

    /// Load the code object at its kernel-object address and hand the
    /// launch to the dispatcher. Returns the id the response will carry.
    pub fn launch(&mut self, launch: KernelLaunch) -> Result<ReqId, SimError> {
        let req = LaunchKernelReq::new(launch.clone());
        let id = req.id;
        self.dispatcher.start_dispatching(req)?;
        self.memory
            .storage
            .write(launch.packet.kernel_object, &launch.code_object.code);
        self.last_launch = Some(launch);
        self.publish("running");
        Ok(id)
    }

    /// Advance every component by one cycle. CUs that made no progress last
    /// cycle are skipped until something arrives on one of their ports.
    pub fn step(&mut self) -> bool {
        let now = self.now;
        let mut progress = self.dispatcher.tick();
        for cu in &mut self.cus {
            if cu.needs_tick() {
                progress |= cu.tick(now);
            }
        }
        progress |= self.memory.tick(now);
        self.now += 1;

        if self.config.live_metrics_path.is_some() && self.now % self.config.metrics_interval == 0 {
            self.publish("running");
        }
        progress
    }

    /// Run one kernel to completion.
    pub fn run_kernel(&mut self, launch: KernelLaunch) -> Result<KernelStats, SimError> {
        let name = launch.code_object.name.clone();
        let before: Vec<CuStats> = self.cus.iter().map(|cu| cu.stats().clone()).collect();
        let start = self.now;
        let id = self.launch(launch)?;

        loop {
            if let Some(rsp) = self.launch_rsp.retrieve() {
                if rsp.rsp_to == id {
                    break;
                }
                log::warn!("ignoring launch response {} while waiting for {id}", rsp.rsp_to);
            }
            if self.now - start >= self.config.max_cycles {
                return Err(SimError::CycleLimitExceeded {
                    kernel: name,
                    cycles: self.config.max_cycles,
                });
            }
            self.step();
        }

        let cycles = self.now - start;
        self.publish("complete");
        log::info!("kernel {name} finished in {cycles} cycles");

        let delta = |f: fn(&CuStats) -> u64| -> u64 {
            self.cus
                .iter()
                .zip(&before)
                .map(|(cu, b)| f(cu.stats()) - f(b))
                .sum()
        };
        Ok(KernelStats {
            kernel: name,
            cycles,
            work_groups: self.dispatcher.num_completed(),
            wavefronts: delta(|s| s.wfs_completed) + delta(|s| s.wfs_sampled),
            wfs_sampled: delta(|s| s.wfs_sampled),
            insts_issued: delta(|s| s.insts_issued),
            wgs_per_cu: self.dispatcher.wgs_per_cu().to_vec(),
            peak_resident_per_cu: self
                .cus
                .iter()
                .map(|cu| cu.stats().peak_resident_wgs)
                .collect(),
        })
    }

    /// Current state as a live-metrics snapshot.
    pub fn snapshot(&self, status: &str) -> LiveMetrics {
        let kernel = self.last_launch.as_ref();
        let dims = |f: fn(&KernelLaunch) -> Dim3| kernel.map(f).map(|d| [d.x, d.y, d.z]);
        LiveMetrics {
            status: status.to_string(),
            kernel_name: kernel
                .map(|k| k.code_object.name.clone())
                .unwrap_or_default(),
            dispatch_policy: self.config.dispatcher.policy.name().to_string(),
            grid: dims(|k| k.packet.grid_size).unwrap_or_default(),
            work_group: dims(|k| k.packet.workgroup_size).unwrap_or_default(),
            cycle: self.now,
            wgs_total: self.dispatcher.num_wg(),
            wgs_dispatched: self.dispatcher.num_dispatched(),
            wgs_completed: self.dispatcher.num_completed(),
            wgs_in_flight: self.dispatcher.in_flight_wgs(),
            cus: self
                .cus
                .iter()
                .map(|cu| CuSnapshot {
                    id: cu.id().0,
                    resident_wgs: cu.resident_wgs(),
                    resident_wfs: cu.resident_wfs(),
                    wgs_completed: cu.stats().wgs_completed,
                    insts_issued: cu.stats().insts_issued,
                    peak_resident_wgs: cu.stats().peak_resident_wgs,
                    paused: cu.is_paused(),
                    active: cu.is_active(),
                })
                .collect(),
            memory_served: self.memory.served(),
            timestamp_ms: now_ms(),
        }
    }

    fn publish(&self, status: &str) {
        if let Some(path) = &self.config.live_metrics_path {
            write_metrics(path, &self.snapshot(status));
        }
    }
}
