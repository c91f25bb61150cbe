mod common;

use common::*;
use cusim::config::SamplingConfig;
use cusim::dispatch::DispatchPolicy;
use cusim::error::{DispatchError, SimError};
use cusim::gpu::Gpu;
use cusim::isa::micro::Asm;
use cusim::kernel::CodeObject;

#[test]
fn work_groups_are_admitted_one_at_a_time_when_slots_allow_one() {
    // 3 work-groups of 2 wavefronts; 2 slots fit exactly one of them
    let mut gpu = Gpu::new(small_config(1, 2)).unwrap();
    let code = Asm::new().s_nop().s_nop().s_endpgm().build();
    let id = gpu.launch(launch("three_groups", code, 384, 128)).unwrap();

    let mut peak = 0;
    let rsp = loop {
        assert!(gpu.now() < 100_000, "kernel never completed");
        gpu.step();
        peak = peak.max(gpu.cu(0).resident_wgs());
        if let Some(rsp) = gpu.launch_responses().retrieve() {
            break rsp;
        }
        assert!(gpu.dispatcher().num_completed() <= 3);
    };

    assert_eq!(rsp.rsp_to, id);
    assert_eq!(peak, 1);
    assert_eq!(gpu.cu(0).stats().wgs_admitted, 3);
    assert_eq!(gpu.cu(0).stats().wgs_completed, 3);
    assert_eq!(gpu.cu(0).stats().wfs_completed, 6);
    assert_eq!(gpu.dispatcher().num_completed(), 3);
    assert!(!gpu.dispatcher().is_dispatching());
}

#[test]
fn vec_add_round_robin_spreads_work_evenly() {
    let n = 512;
    let mut gpu = Gpu::new(small_config(2, 4)).unwrap();
    seed_vec_add(&mut gpu, n);

    let stats = gpu.run_kernel(vec_add(n)).unwrap();
    assert_eq!(stats.work_groups, 8);
    assert_eq!(stats.wavefronts, 8);
    assert_eq!(stats.wgs_per_cu, vec![4, 4]);
    assert!(vec_add_errors(&gpu, n).is_empty());

    // the dispatcher is ready for the next kernel
    let again = gpu.run_kernel(vec_add(n)).unwrap();
    assert_eq!(again.work_groups, 8);
    assert!(again.cycles > 0);
}

#[test]
fn vec_add_partition_computes_the_same_result() {
    let n = 1024;
    let mut config = small_config(3, 2);
    config.dispatcher.policy = DispatchPolicy::Partition;
    let mut gpu = Gpu::new(config).unwrap();
    seed_vec_add(&mut gpu, n);

    let stats = gpu.run_kernel(vec_add(n)).unwrap();
    assert_eq!(stats.work_groups, 16);
    assert_eq!(stats.wgs_per_cu.iter().sum::<usize>(), 16);
    assert!(stats.wgs_per_cu.iter().all(|&n| n > 0));
    assert!(vec_add_errors(&gpu, n).is_empty());
}

#[test]
fn barrier_orders_lds_traffic_between_wavefronts() {
    // Every lane reads the value the first lane of wavefront 1 wrote.
    let code = Asm::new()
        .s_load(8, 2, 0)
        .s_waitcnt(0, 0)
        .v_lshl(1, 0, 2)
        .ds_write(0, 1)
        .s_barrier()
        .s_mov(14, 256)
        .v_add_s(3, 2, 14)
        .ds_read(3, 3)
        .flat_store(3, 1, 8)
        .s_waitcnt(0, 0)
        .s_endpgm()
        .build();
    let kernel = launch_object(CodeObject::new("barrier", code).with_resources(16, 4, 512), 128, 128);

    let mut gpu = Gpu::new(small_config(1, 4)).unwrap();
    gpu.memory_mut()
        .storage
        .write(KERNARG, &BASE_C.to_le_bytes());
    let stats = gpu.run_kernel(kernel).unwrap();

    assert_eq!(stats.wavefronts, 2);
    let memory = &gpu.memory().storage;
    for i in 0..128 {
        assert_eq!(memory.read_u32(BASE_C + i * 4), 64, "work-item {i}");
    }
}

#[test]
fn undecodable_kernel_still_completes() {
    let mut gpu = Gpu::new(small_config(1, 4)).unwrap();
    let stats = gpu
        .run_kernel(launch("garbage", vec![0xff, 0, 0, 0], 128, 64))
        .unwrap();
    assert_eq!(stats.work_groups, 2);
    assert_eq!(stats.wavefronts, 2);
}

#[test]
fn runaway_kernel_hits_the_cycle_limit() {
    let mut config = small_config(1, 4);
    config.max_cycles = 2_000;
    let mut gpu = Gpu::new(config).unwrap();
    let spin = Asm::new().s_branch(-1).build();

    let err = gpu.run_kernel(launch("spin", spin, 64, 64)).unwrap_err();
    assert!(matches!(
        err,
        SimError::CycleLimitExceeded { ref kernel, cycles: 2_000 } if kernel == "spin"
    ));
}

#[test]
fn settled_durations_switch_to_sampling() {
    let mut config = small_config(1, 2);
    config.cu.sampling = Some(SamplingConfig {
        warmup: 2,
        window: 4,
        threshold: 0.5,
    });
    let mut gpu = Gpu::new(config).unwrap();
    let code = Asm::new().s_nop().s_nop().s_nop().s_nop().s_endpgm().build();

    let stats = gpu.run_kernel(launch("nops", code, 64 * 64, 64)).unwrap();
    assert_eq!(stats.work_groups, 64);
    assert_eq!(stats.wavefronts, 64);
    assert!(stats.wfs_sampled > 0);
    assert!(stats.wfs_sampled < 64);
}

#[test]
fn live_metrics_are_published() {
    let path = std::env::temp_dir().join(format!("cusim_live_{}.json", std::process::id()));
    let path = path.to_str().unwrap().to_string();
    let mut config = small_config(2, 4);
    config.live_metrics_path = Some(path.clone());
    config.metrics_interval = 50;
    let mut gpu = Gpu::new(config).unwrap();
    seed_vec_add(&mut gpu, 256);
    gpu.run_kernel(vec_add(256)).unwrap();

    let snapshot = cusim::metrics::read_metrics(&path).unwrap();
    assert_eq!(snapshot.status, "complete");
    assert_eq!(snapshot.kernel_name, "vec_add");
    assert_eq!(snapshot.wgs_completed, 4);
    assert_eq!(snapshot.cus.len(), 2);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn empty_work_group_size_is_an_error() {
    let mut gpu = Gpu::new(small_config(1, 4)).unwrap();
    let err = gpu
        .launch(launch("empty", Asm::new().s_endpgm().build(), 64, 0))
        .unwrap_err();
    assert!(matches!(
        err,
        SimError::Dispatch(DispatchError::EmptyWorkGroup { x: 0, .. })
    ));
    assert!(!gpu.dispatcher().is_dispatching());

    // the GPU still takes a well-formed kernel afterwards
    let stats = gpu
        .run_kernel(launch("ok", Asm::new().s_endpgm().build(), 64, 64))
        .unwrap();
    assert_eq!(stats.work_groups, 1);
}
