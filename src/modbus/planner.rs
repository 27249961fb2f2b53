//! Read range planner
//!
//! Coalesces the addresses of a channel's input points into the smallest
//! set of read requests that honors the per-function-code protocol limits.
//! Bridging a small address gap is cheaper than paying another round-trip,
//! so ranges may cover junk registers between points.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::PointConfig;
use crate::error::{GatewayError, Result};

use super::constants;

/// One point inside a planned range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPoint {
    pub id: String,
    pub address: u16,
    /// Element count: registers for FC 3/4, always 1 for FC 1/2
    pub quantity: u16,
}

/// A contiguous read request covering one or more points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRange {
    pub slave_id: u8,
    pub function_code: u8,
    pub start: u16,
    pub quantity: u16,
    pub points: Vec<PlannedPoint>,
}

impl ReadRange {
    /// Last occupied element address
    pub fn end(&self) -> u16 {
        self.start + self.quantity - 1
    }
}

/// Plan the read ranges for a point table
///
/// Ranges are emitted in ascending `(slave_id, function_code, start)` order;
/// this is the stable polling order of the channel.
pub fn plan_read_ranges(
    points: &BTreeMap<String, PointConfig>,
    max_registers: u16,
) -> Result<Vec<ReadRange>> {
    // Partition input points by (slave, function code), sorted by address.
    let mut partitions: BTreeMap<(u8, u8), BTreeSet<(u16, String)>> = BTreeMap::new();
    for (id, point) in points {
        if !point.point_type.is_input() {
            continue;
        }
        if point.slave_id == constants::BROADCAST_UNIT_ID {
            return Err(GatewayError::config(format!(
                "point '{id}': broadcast reads are illegal"
            )));
        }
        let fc = point.effective_function_code();
        partitions
            .entry((point.slave_id, fc))
            .or_default()
            .insert((point.address, id.clone()));
    }

    let mut ranges = Vec::new();
    for ((slave_id, function_code), members) in partitions {
        let cap = if constants::is_bit_function(function_code) {
            constants::MAX_READ_BITS
        } else {
            max_registers.min(constants::MAX_READ_REGISTERS)
        };

        let mut current: Option<ReadRange> = None;
        for (address, id) in members {
            let point = &points[&id];
            let quantity = if constants::is_bit_function(function_code) {
                1
            } else {
                point.register_count()
            };
            let planned = PlannedPoint {
                id,
                address,
                quantity,
            };

            // Extend while the gap from the last occupied element to this
            // point's first element stays small and the span fits the cap.
            let extend = current.as_ref().is_some_and(|range| {
                let gap = address - range.end() - 1;
                let span = address + quantity - range.start;
                gap <= constants::RANGE_GAP_LIMIT && span <= cap
            });

            if extend {
                if let Some(range) = current.as_mut() {
                    range.quantity = address + quantity - range.start;
                    range.points.push(planned);
                }
            } else {
                if let Some(done) = current.take() {
                    ranges.push(done);
                }
                current = Some(new_range(slave_id, function_code, planned));
            }
        }
        if let Some(range) = current {
            ranges.push(range);
        }
    }

    Ok(ranges)
}

fn new_range(slave_id: u8, function_code: u8, point: PlannedPoint) -> ReadRange {
    ReadRange {
        slave_id,
        function_code,
        start: point.address,
        quantity: point.quantity,
        points: vec![point],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ByteOrder, DataType, PointConfig, PointType};

    fn holding_point(slave_id: u8, address: u16) -> PointConfig {
        PointConfig {
            point_type: PointType::Ai,
            data_type: DataType::Uint16,
            byte_order: ByteOrder::Ab,
            slave_id,
            address,
            function_code: Some(3),
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            min: 0.0,
            max: 0.0,
            description: String::new(),
        }
    }

    fn table(addresses: &[u16]) -> BTreeMap<String, PointConfig> {
        addresses
            .iter()
            .map(|&a| (format!("p{a}"), holding_point(1, a)))
            .collect()
    }

    #[test]
    fn test_gap_coalescing() {
        // {100,101,102,108,130}: 102 -> 108 gap is 5 (bridged), 108 -> 130
        // gap is 21 (split).
        let ranges = plan_read_ranges(&table(&[100, 101, 102, 108, 130]), 120).unwrap();
        assert_eq!(ranges.len(), 2);

        assert_eq!(ranges[0].start, 100);
        assert_eq!(ranges[0].quantity, 9);
        assert_eq!(ranges[0].points.len(), 4);

        assert_eq!(ranges[1].start, 130);
        assert_eq!(ranges[1].quantity, 1);
    }

    #[test]
    fn test_every_point_in_exactly_one_range() {
        let addresses = [0, 5, 11, 30, 31, 55, 200, 201, 220, 400];
        let points = table(&addresses);
        let ranges = plan_read_ranges(&points, 120).unwrap();

        let mut covered = Vec::new();
        for range in &ranges {
            assert!(range.quantity <= 120);
            for point in &range.points {
                assert!(point.address >= range.start);
                assert!(point.address + point.quantity - 1 <= range.end());
                covered.push(point.address);
            }
        }
        covered.sort_unstable();
        assert_eq!(covered, addresses);
    }

    #[test]
    fn test_gap_policy_between_ranges() {
        // Adjacent ranges of one function code are separated by a gap > 10
        // unless the earlier range hit the size cap.
        let addresses: Vec<u16> = (0..300).step_by(3).collect();
        let points = table(&addresses);
        let cap = 40;
        let ranges = plan_read_ranges(&points, cap).unwrap();

        for pair in ranges.windows(2) {
            let gap = pair[1].start - pair[0].end() - 1;
            assert!(
                gap > 10 || pair[0].quantity + 3 > cap,
                "range split without cause: gap {gap}, quantity {}",
                pair[0].quantity
            );
        }
    }

    #[test]
    fn test_size_cap_respected() {
        let addresses: Vec<u16> = (0..200).collect();
        let ranges = plan_read_ranges(&table(&addresses), 120).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].quantity, 120);
        assert_eq!(ranges[1].start, 120);
        assert_eq!(ranges[1].quantity, 80);
    }

    #[test]
    fn test_32bit_points_occupy_two_registers() {
        let mut points = BTreeMap::new();
        let mut wide = holding_point(1, 10);
        wide.data_type = DataType::Float32;
        wide.byte_order = ByteOrder::Abcd;
        points.insert("wide".to_string(), wide);
        points.insert("next".to_string(), holding_point(1, 12));

        let ranges = plan_read_ranges(&points, 120).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 10);
        assert_eq!(ranges[0].quantity, 3);
    }

    #[test]
    fn test_partition_by_function_code_and_slave() {
        let mut points = table(&[10, 11]);
        let mut input = holding_point(1, 10);
        input.function_code = Some(4);
        points.insert("in10".to_string(), input);
        let mut other_slave = holding_point(2, 10);
        other_slave.function_code = Some(3);
        points.insert("s2".to_string(), other_slave);

        let ranges = plan_read_ranges(&points, 120).unwrap();
        assert_eq!(ranges.len(), 3);
        // Ascending (slave, fc, start) order
        assert_eq!(
            ranges
                .iter()
                .map(|r| (r.slave_id, r.function_code, r.start))
                .collect::<Vec<_>>(),
            vec![(1, 3, 10), (1, 4, 10), (2, 3, 10)]
        );
    }

    #[test]
    fn test_outputs_not_polled() {
        let mut points = table(&[10]);
        let mut command = holding_point(1, 50);
        command.point_type = PointType::Ao;
        command.function_code = Some(6);
        points.insert("cmd".to_string(), command);

        let ranges = plan_read_ranges(&points, 120).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].points.len(), 1);
    }

    #[test]
    fn test_broadcast_read_rejected() {
        let points = table(&[10]);
        let mut points = points;
        points.insert("bad".to_string(), holding_point(0, 20));
        assert!(plan_read_ranges(&points, 120).is_err());
    }

    #[test]
    fn test_bit_points_counted_in_bits() {
        let mut points = BTreeMap::new();
        for addr in [0u16, 1, 2, 500] {
            let mut p = holding_point(1, addr);
            p.point_type = PointType::Di;
            p.data_type = DataType::Bool;
            p.function_code = Some(2);
            points.insert(format!("di{addr}"), p);
        }

        let ranges = plan_read_ranges(&points, 120).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].quantity, 3);
        assert_eq!(ranges[1].start, 500);
    }
}
