/// Allocation bitmask over a linear resource.
///
/// One cell stands for one allocation granule (16 SGPRs, 4 VGPRs per lane, or
/// 256 LDS bytes). Work-group placement first marks cells `ToReserve` while it
/// tries every resource kind, then either promotes them all to `Reserved` or
/// rolls them all back to `Free`.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocStatus {
    Free,
    /// Provisionally taken while a placement attempt is in progress
    ToReserve,
    /// Work-group placed, not yet released
    Reserved,
    Used,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceMask {
    Limited(Vec<AllocStatus>),
    /// No hard cap. Regions come from a cursor that only moves forward, so
    /// freed space is never handed out again.
    Unlimited { next: usize },
}

impl ResourceMask {
    pub fn limited(units: usize) -> Self {
        ResourceMask::Limited(vec![AllocStatus::Free; units])
    }

    pub fn unlimited() -> Self {
        ResourceMask::Unlimited { next: 0 }
    }

    /// Number of cells, `None` when unlimited.
    pub fn len(&self) -> Option<usize> {
        match self {
            ResourceMask::Limited(cells) => Some(cells.len()),
            ResourceMask::Unlimited { .. } => None,
        }
    }

    /// Offset of the leftmost run of `length` cells that are all `status`.
    pub fn next_region(&self, length: usize, status: AllocStatus) -> Option<usize> {
        if length == 0 {
            return Some(0);
        }
        let cells = match self {
            ResourceMask::Limited(cells) => cells,
            ResourceMask::Unlimited { next } => return Some(*next),
        };

        let mut run = 0;
        for (offset, cell) in cells.iter().enumerate() {
            if *cell == status {
                run += 1;
                if run == length {
                    return Some(offset + 1 - length);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    pub fn set_status(&mut self, offset: usize, length: usize, status: AllocStatus) {
        match self {
            ResourceMask::Limited(cells) => cells[offset..offset + length].fill(status),
            ResourceMask::Unlimited { next } => {
                if status != AllocStatus::Free {
                    *next = (*next).max(offset + length);
                }
            }
        }
    }

    /// Relabel every `from` cell as `to`.
    pub fn convert_status(&mut self, from: AllocStatus, to: AllocStatus) {
        if let ResourceMask::Limited(cells) = self {
            cells
                .iter_mut()
                .filter(|c| **c == from)
                .for_each(|c| *c = to);
        }
    }

    /// Cells currently in `status`. Always 0 for an unlimited mask.
    pub fn status_count(&self, status: AllocStatus) -> usize {
        match self {
            ResourceMask::Limited(cells) => cells.iter().filter(|c| **c == status).count(),
            ResourceMask::Unlimited { .. } => 0,
        }
    }

    /// Provisionally take the leftmost free run of `length` cells.
    pub fn reserve(&mut self, length: usize) -> Option<usize> {
        let offset = self.next_region(length, AllocStatus::Free)?;
        self.set_status(offset, length, AllocStatus::ToReserve);
        Some(offset)
    }

    pub fn free(&mut self, offset: usize, length: usize) {
        self.set_status(offset, length, AllocStatus::Free);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mask_from(used: &[bool]) -> ResourceMask {
        ResourceMask::Limited(
            used.iter()
                .map(|u| if *u { AllocStatus::Used } else { AllocStatus::Free })
                .collect(),
        )
    }

    #[test]
    fn finds_first_fitting_run() {
        let m = mask_from(&[true, false, true, false, false, false, true]);
        assert_eq!(m.next_region(1, AllocStatus::Free), Some(1));
        assert_eq!(m.next_region(2, AllocStatus::Free), Some(3));
        assert_eq!(m.next_region(3, AllocStatus::Free), Some(3));
        assert_eq!(m.next_region(4, AllocStatus::Free), None);
    }

    #[test]
    fn zero_length_region_is_always_found() {
        let m = mask_from(&[true, true]);
        assert_eq!(m.next_region(0, AllocStatus::Free), Some(0));
    }

    #[test]
    fn convert_promotes_only_matching_cells() {
        let mut m = ResourceMask::limited(4);
        m.set_status(0, 2, AllocStatus::ToReserve);
        m.set_status(3, 1, AllocStatus::Used);
        m.convert_status(AllocStatus::ToReserve, AllocStatus::Reserved);
        assert_eq!(m.status_count(AllocStatus::Reserved), 2);
        assert_eq!(m.status_count(AllocStatus::Used), 1);
        assert_eq!(m.status_count(AllocStatus::Free), 1);
    }

    #[test]
    fn unlimited_cursor_never_goes_back() {
        let mut m = ResourceMask::unlimited();
        assert_eq!(m.reserve(3), Some(0));
        assert_eq!(m.reserve(2), Some(3));
        m.free(0, 3);
        assert_eq!(m.reserve(1), Some(5));
        assert_eq!(m.status_count(AllocStatus::Free), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn reserve_then_free_restores_free_count(
            used in proptest::collection::vec(any::<bool>(), 1..96),
            len_frac in 0.0f64..=1.0,
        ) {
            let mut m = mask_from(&used);
            let length = (used.len() as f64 * len_frac) as usize;
            let before = m.status_count(AllocStatus::Free);
            if let Some(offset) = m.reserve(length) {
                prop_assert_eq!(m.status_count(AllocStatus::Free), before - length);
                m.free(offset, length);
            }
            prop_assert_eq!(m.status_count(AllocStatus::Free), before);
        }

        #[test]
        fn next_region_is_leftmost_and_pure(
            used in proptest::collection::vec(any::<bool>(), 1..96),
            length in 1usize..12,
        ) {
            let mut m = mask_from(&used);
            let expected = (0..used.len())
                .find(|&i| i + length <= used.len() && used[i..i + length].iter().all(|u| !u));
            prop_assert_eq!(m.next_region(length, AllocStatus::Free), expected);

            let snapshot = m.clone();
            if m.reserve(length).is_none() {
                prop_assert_eq!(&m, &snapshot);
            }
        }
    }
}
