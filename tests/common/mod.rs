#![allow(dead_code)]

use cusim::config::{CuConfig, DispatcherConfig, MemoryConfig, SimConfig};
use cusim::gpu::Gpu;
use cusim::isa::micro::Asm;
use cusim::kernel::{CodeObject, Dim3, DispatchPacket, KernelLaunch};

pub const KERNARG: u64 = 0x100;
pub const CODE: u64 = 0x1000;
pub const BASE_A: u64 = 0x10_0000;
pub const BASE_B: u64 = 0x20_0000;
pub const BASE_C: u64 = 0x30_0000;

/// One-SIMD CUs with `slots` wavefront slots and no register limits.
pub fn small_config(num_cus: usize, slots: u32) -> SimConfig {
    SimConfig {
        num_cus,
        cu: CuConfig::unlimited_registers(1, slots),
        dispatcher: DispatcherConfig {
            kernel_overhead: 10,
            ..DispatcherConfig::default()
        },
        memory: MemoryConfig {
            latency: 20,
            ..MemoryConfig::default()
        },
        max_cycles: 500_000,
        ..SimConfig::default()
    }
}

pub fn launch(name: &str, code: Vec<u8>, grid: u32, wg: u32) -> KernelLaunch {
    launch_object(CodeObject::new(name, code), grid, wg)
}

pub fn launch_object(code_object: CodeObject, grid: u32, wg: u32) -> KernelLaunch {
    let mut packet = DispatchPacket::new(Dim3::x(grid), Dim3::x(wg));
    packet.kernel_object = CODE;
    packet.kernarg_address = KERNARG;
    KernelLaunch::new(code_object, packet)
}

/// C[i] = A[i] + B[i] with 64-item work-groups.
pub fn vec_add(n: u32) -> KernelLaunch {
    let code = Asm::new()
        .s_load(8, 6, 0)
        .s_waitcnt(0, 0)
        .s_lshl(14, 5, 8)
        .s_add_u32(8, 8, 14)
        .s_add_u32(10, 10, 14)
        .s_add_u32(12, 12, 14)
        .v_lshl(1, 0, 2)
        .flat_load(2, 1, 8)
        .flat_load(3, 1, 10)
        .s_waitcnt(0, 0)
        .v_add_u32(2, 2, 3)
        .flat_store(2, 1, 12)
        .s_waitcnt(0, 0)
        .s_endpgm()
        .build();
    launch("vec_add", code, n, 64)
}

pub fn seed_vec_add(gpu: &mut Gpu, n: u32) {
    let memory = &mut gpu.memory_mut().storage;
    for i in 0..n as u64 {
        memory.write_u32(BASE_A + i * 4, i as u32);
        memory.write_u32(BASE_B + i * 4, 3 * i as u32);
    }
    for (slot, ptr) in [BASE_A, BASE_B, BASE_C].into_iter().enumerate() {
        memory.write(KERNARG + slot as u64 * 8, &ptr.to_le_bytes());
    }
}

/// Indices whose result is wrong.
pub fn vec_add_errors(gpu: &Gpu, n: u32) -> Vec<u64> {
    let memory = &gpu.memory().storage;
    (0..n as u64)
        .filter(|&i| memory.read_u32(BASE_C + i * 4) != 4 * i as u32)
        .collect()
}
