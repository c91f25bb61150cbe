use cusim::config::SimConfig;
use cusim::gpu::Gpu;
use cusim::isa::micro::Asm;
use cusim::kernel::{CodeObject, Dim3, DispatchPacket, KernelLaunch};

const KERNARG: u64 = 0x100;
const CODE: u64 = 0x1000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => SimConfig::load(&path)?,
        None => SimConfig::default(),
    };
    let mut gpu = Gpu::new(config)?;
    println!(
        "Initialized GPU with {} CUs ({} SIMDs each, {} dispatch)",
        gpu.cus().len(),
        gpu.config().cu.simd_count,
        gpu.config().dispatcher.policy.name(),
    );

    // --- Vector addition demo ---
    // C[i] = A[i] + B[i] for N 32-bit integers, one element per work-item
    let n: u32 = 4096;
    let stride = 4u64;
    let base_a: u64 = 0x10_0000;
    let base_b: u64 = base_a + n as u64 * stride;
    let base_c: u64 = base_b + n as u64 * stride;

    let memory = &mut gpu.memory_mut().storage;
    for i in 0..n as u64 {
        memory.write_u32(base_a + i * stride, i as u32);
        memory.write_u32(base_b + i * stride, n - i as u32);
    }
    for (slot, ptr) in [base_a, base_b, base_c].into_iter().enumerate() {
        memory.write(KERNARG + slot as u64 * 8, &ptr.to_le_bytes());
    }

    // s0:s1 = kernarg pointer, s5 = work-group id, v0 = local id.
    // Each work-group covers 64 elements, so its byte offset is id << 8.
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

    let mut packet = DispatchPacket::new(Dim3::x(n), Dim3::x(64));
    packet.kernel_object = CODE;
    packet.kernarg_address = KERNARG;
    let launch = KernelLaunch::new(CodeObject::new("vec_add", code), packet);

    let stats = gpu.run_kernel(launch)?;

    // Verify results
    let memory = &gpu.memory().storage;
    let mismatches = (0..n as u64)
        .filter(|i| memory.read_u32(base_c + i * stride) != n)
        .count();
    if mismatches == 0 {
        println!("Verification PASSED: all {n} results correct (each = {n})");
    } else {
        println!("Verification FAILED: {mismatches} of {n} results wrong");
    }

    println!(
        "Stats: {} cycles | {} work-groups | {} wavefronts | {} instructions | per CU {:?}",
        stats.cycles, stats.work_groups, stats.wavefronts, stats.insts_issued, stats.wgs_per_cu,
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
