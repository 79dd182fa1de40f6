//! Per-thread aggregate of the dtapp behavior.
//!
//! The thread owns a slab of device contexts; the input/output lists are
//! stable indices into it. The primary context is slot 0 by convention (it
//! arrives from the scheduler), so there is exactly one owner for every
//! context and nothing to free twice.

use btag::WriteOrderRing;
use devices::DeviceContext;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Input,
    Output,
}

pub struct DtappInfo {
    /// The thread's device slab; index 0 is the primary.
    pub devices: Vec<DeviceContext>,
    /// Slab indices of input-side contexts.
    pub inputs: Vec<usize>,
    /// Slab indices of output-side contexts.
    pub outputs: Vec<usize>,
    pub primary_side: Side,
    /// Circular record of the most recent writes, one slot per output.
    pub order: WriteOrderRing,
    /// Slab index of the device chosen for the current record.
    pub current: usize,
}

impl DtappInfo {
    pub fn new(primary: DeviceContext, primary_side: Side) -> DtappInfo {
        let mut info = DtappInfo {
            devices: vec![primary],
            inputs: Vec::new(),
            outputs: Vec::new(),
            primary_side,
            order: WriteOrderRing::new(),
            current: 0,
        };
        match primary_side {
            Side::Input => info.inputs.push(0),
            Side::Output => info.outputs.push(0),
        }
        info
    }

    pub fn push(&mut self, dip: DeviceContext, side: Side) -> usize {
        let at = self.devices.len();
        self.devices.push(dip);
        match side {
            Side::Input => self.inputs.push(at),
            Side::Output => self.outputs.push(at),
        }
        at
    }

    pub fn mirror_mode(&self) -> bool {
        !self.inputs.is_empty() && !self.outputs.is_empty()
    }

    /// The input paired with output number `nth` in mirror mode.
    pub fn paired_input(&self, nth: usize) -> Option<usize> {
        self.inputs.get(nth).copied()
    }

    /// Slab index of the output context with the given device index byte.
    pub fn output_by_device_index(&self, device_index: u8) -> Option<usize> {
        self.outputs
            .iter()
            .copied()
            .find(|&at| self.devices[at].index == device_index)
    }

    /// Sum of error counts across every participating context.
    pub fn total_errors(&self) -> u64 {
        self.devices.iter().map(|d| d.counters.errors).sum()
    }

    /// True when every context on the given side has hit EOF or dropped
    /// out with a premature EOF.
    pub fn all_eof(&self, side: Side) -> bool {
        let list = match side {
            Side::Input => &self.inputs,
            Side::Output => &self.outputs,
        };
        list.iter()
            .all(|&at| self.devices[at].eof || self.devices[at].premature_eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devices::DeviceSpec;
    use palign::Arena;

    fn dip(index: u8) -> DeviceContext {
        let mut d = DeviceContext::new(
            &DeviceSpec {
                path: format!("/tmp/dev{index}").into(),
                ..DeviceSpec::default()
            },
            index,
            Arena::new(),
        );
        d.index = index;
        d
    }

    #[test]
    fn primary_is_slot_zero() {
        let info = DtappInfo::new(dip(0), Side::Output);
        assert_eq!(info.outputs, vec![0]);
        assert!(info.inputs.is_empty());
        assert!(!info.mirror_mode());
    }

    #[test]
    fn mirror_pairs_by_position() {
        let mut info = DtappInfo::new(dip(0), Side::Output);
        info.push(dip(1), Side::Output);
        info.push(dip(0), Side::Input);
        info.push(dip(1), Side::Input);
        assert!(info.mirror_mode());
        assert_eq!(info.paired_input(0), Some(2));
        assert_eq!(info.paired_input(1), Some(3));
    }

    #[test]
    fn lookup_by_device_index() {
        let mut info = DtappInfo::new(dip(0), Side::Output);
        info.push(dip(1), Side::Output);
        assert_eq!(info.output_by_device_index(1), Some(1));
        assert_eq!(info.output_by_device_index(9), None);
    }

    #[test]
    fn eof_tracks_both_flavors() {
        let mut info = DtappInfo::new(dip(0), Side::Output);
        info.push(dip(1), Side::Output);
        assert!(!info.all_eof(Side::Output));
        info.devices[0].eof = true;
        info.devices[1].premature_eof = true;
        assert!(info.all_eof(Side::Output));
    }
}
