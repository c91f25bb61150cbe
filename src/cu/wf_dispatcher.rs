/// Wavefront initialisation at admission.
///
/// Sets the PC and EXEC mask and preloads the registers the kernel ABI
/// promises: the kernarg pointer in s0-s1, work-group counts in s2-s4 and the
/// work-group id in s5-s7 (each only if it fits the wavefront's SGPR
/// allocation), and the local work-item id in v0-v2.
use crate::isa::RegisterFile;
use crate::kernel::WAVEFRONT_SIZE;
use crate::wavefront::{WfRef, WfState, INST_FETCH_BYTES};

use super::CuState;

pub fn dispatch_wf(state: &mut CuState, r: WfRef) {
    let now = state.now;
    let Some(wg) = state.work_groups.get_mut(&r.wg) else {
        panic!("{}: dispatching {r} of an unknown work-group", state.id);
    };
    let packet = wg.launch.packet;
    let entry_pc = wg.launch.entry_pc();
    let wg_id = wg.desc.id;
    let counts = packet.workgroup_count();
    let local_ids: Vec<_> = {
        let first = wg.wfs[r.index].first_wi_flat_id;
        (0..WAVEFRONT_SIZE)
            .map(|lane| wg.desc.local_id(first + lane))
            .collect()
    };

    let wf = &mut wg.wfs[r.index];
    wf.pc = entry_pc;
    wf.exec = wf.init_exec_mask;
    wf.inst_buffer_start_pc = entry_pc & !(INST_FETCH_BYTES - 1);
    wf.state = WfState::Ready;
    wf.dispatch_time = now;

    let soff = wf.sreg_offset();
    let sgprs = [
        packet.kernarg_address as u32,
        (packet.kernarg_address >> 32) as u32,
        counts.x,
        counts.y,
        counts.z,
        wg_id.x,
        wg_id.y,
        wg_id.z,
    ];
    for (reg, value) in sgprs.into_iter().enumerate() {
        if (reg as u32) < wf.sgpr_count {
            state.sregs.write_u32(soff, reg as u32, 0, value);
        }
    }

    let voff = wf.vreg_offset();
    let vregs = &mut state.vregs[wf.simd_id()];
    let vgprs = wf.vgpr_count.min(3);
    for (lane, id) in local_ids.iter().enumerate() {
        for (reg, value) in [id.x, id.y, id.z].into_iter().take(vgprs as usize).enumerate() {
            vregs.write_u32(voff, reg as u32, lane, value);
        }
    }
    log::trace!("{}: {r} dispatched at pc {entry_pc:#x}", state.id);
}
