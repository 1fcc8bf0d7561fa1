//! Upstream traversal and stream ordering over the river network.

use std::collections::HashMap;

use crate::merit::RiverReach;

/// Collect every COMID contributing to `terminal`, the terminal included.
///
/// Iterative depth-first walk with an explicit stack. Tributaries are
/// pushed in up1..up4 order and popped LIFO; downstream consumers rely on
/// that order, so it is part of the contract. The topology is acyclic by
/// dataset invariant, so each COMID is visited exactly once.
pub fn collect_upstream(terminal: i64, rivers: &HashMap<i64, RiverReach>) -> Vec<i64> {
    let mut upstream = Vec::with_capacity(256);
    let mut stack = vec![terminal];

    while let Some(comid) = stack.pop() {
        upstream.push(comid);
        if let Some(reach) = rivers.get(&comid) {
            for &up in &reach.up {
                if up != 0 {
                    stack.push(up);
                }
            }
        }
    }

    upstream
}

/// Strahler and Shreve orders for a river subset, keyed by COMID.
///
/// Only tributary links pointing inside the subset count. Nodes are
/// processed headwaters-first via Kahn's algorithm on in-degrees:
/// - Strahler: headwaters are 1; a confluence where the two highest
///   upstream orders tie emits max+1, otherwise max.
/// - Shreve: headwaters are 1; a confluence emits the sum of upstream
///   orders.
pub fn stream_orders(
    rivers: &HashMap<i64, RiverReach>,
) -> (HashMap<i64, u32>, HashMap<i64, u32>) {
    if rivers.is_empty() {
        return (HashMap::new(), HashMap::new());
    }

    let mut upstream_of: HashMap<i64, Vec<i64>> = HashMap::with_capacity(rivers.len());
    for (&comid, reach) in rivers {
        let ups = reach
            .up
            .iter()
            .copied()
            .filter(|up| *up != 0 && rivers.contains_key(up))
            .collect();
        upstream_of.insert(comid, ups);
    }

    let mut downstream_of: HashMap<i64, Vec<i64>> = HashMap::with_capacity(rivers.len());
    for (&comid, ups) in &upstream_of {
        for &up in ups {
            downstream_of.entry(up).or_default().push(comid);
        }
    }

    let mut in_degree: HashMap<i64, usize> = upstream_of
        .iter()
        .map(|(&comid, ups)| (comid, ups.len()))
        .collect();
    let mut queue: Vec<i64> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&comid, _)| comid)
        .collect();
    queue.sort_unstable();

    let mut topo_order = Vec::with_capacity(rivers.len());
    let mut head = 0;
    while head < queue.len() {
        let node = queue[head];
        head += 1;
        topo_order.push(node);
        if let Some(downs) = downstream_of.get(&node) {
            for &down in downs {
                let deg = in_degree.get_mut(&down).expect("node in degree map");
                *deg -= 1;
                if *deg == 0 {
                    queue.push(down);
                }
            }
        }
    }

    let mut strahler: HashMap<i64, u32> = HashMap::with_capacity(rivers.len());
    let mut shreve: HashMap<i64, u32> = HashMap::with_capacity(rivers.len());

    for comid in topo_order {
        let ups = &upstream_of[&comid];
        if ups.is_empty() {
            strahler.insert(comid, 1);
            shreve.insert(comid, 1);
        } else {
            let orders: Vec<u32> = ups.iter().map(|up| strahler[up]).collect();
            let max = *orders.iter().max().expect("confluence has tributaries");
            let ties = orders.iter().filter(|&&o| o == max).count();
            strahler.insert(comid, if ties >= 2 { max + 1 } else { max });
            shreve.insert(comid, ups.iter().map(|up| shreve[up]).sum());
        }
    }

    (strahler, shreve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::LineString;

    fn reach(comid: i64, up: [i64; 4], uparea: f64) -> (i64, RiverReach) {
        (
            comid,
            RiverReach {
                comid,
                up,
                uparea,
                geometry: LineString::new(vec![]),
            },
        )
    }

    fn chain_network() -> HashMap<i64, RiverReach> {
        // 41000003 -> 41000002 -> 41000001 (terminal)
        [
            reach(41000001, [41000002, 0, 0, 0], 300.0),
            reach(41000002, [41000003, 0, 0, 0], 200.0),
            reach(41000003, [0, 0, 0, 0], 100.0),
        ]
        .into_iter()
        .collect()
    }

    fn branched_network() -> HashMap<i64, RiverReach> {
        // Two headwaters joining at the terminal.
        [
            reach(41000001, [41000002, 41000003, 0, 0], 300.0),
            reach(41000002, [0, 0, 0, 0], 100.0),
            reach(41000003, [0, 0, 0, 0], 100.0),
        ]
        .into_iter()
        .collect()
    }

    fn seven_node_network() -> HashMap<i64, RiverReach> {
        // Two levels of confluence under one terminal:
        //   2 <- {4, 5},  3 <- {6, 7},  1 <- {2, 3}
        [
            reach(41000001, [41000002, 41000003, 0, 0], 700.0),
            reach(41000002, [41000004, 41000005, 0, 0], 300.0),
            reach(41000003, [41000006, 41000007, 0, 0], 300.0),
            reach(41000004, [0, 0, 0, 0], 100.0),
            reach(41000005, [0, 0, 0, 0], 100.0),
            reach(41000006, [0, 0, 0, 0], 100.0),
            reach(41000007, [0, 0, 0, 0], 100.0),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_single_reach() {
        let rivers: HashMap<i64, RiverReach> =
            [reach(41000001, [0, 0, 0, 0], 25.0)].into_iter().collect();
        assert_eq!(collect_upstream(41000001, &rivers), vec![41000001]);
    }

    #[test]
    fn test_chain_collects_all() {
        let upstream = collect_upstream(41000001, &chain_network());
        assert_eq!(upstream, vec![41000001, 41000002, 41000003]);
    }

    #[test]
    fn test_branch_traversal_order() {
        // up1 is pushed before up2, so the LIFO pop visits up2 first.
        let upstream = collect_upstream(41000001, &branched_network());
        assert_eq!(upstream, vec![41000001, 41000003, 41000002]);
    }

    #[test]
    fn test_seven_node_collects_once_each() {
        let upstream = collect_upstream(41000001, &seven_node_network());
        assert_eq!(upstream.len(), 7);
        assert_eq!(upstream[0], 41000001);
        let mut sorted = upstream.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 7);
    }

    #[test]
    fn test_orders_chain() {
        let (strahler, shreve) = stream_orders(&chain_network());
        // No confluences: order never increases.
        assert_eq!(strahler[&41000001], 1);
        assert_eq!(shreve[&41000001], 1);
        assert_eq!(strahler[&41000003], 1);
    }

    #[test]
    fn test_orders_branch() {
        let (strahler, shreve) = stream_orders(&branched_network());
        assert_eq!(strahler[&41000002], 1);
        assert_eq!(strahler[&41000003], 1);
        assert_eq!(strahler[&41000001], 2);
        assert_eq!(shreve[&41000001], 2);
    }

    #[test]
    fn test_orders_seven_node() {
        let (strahler, shreve) = stream_orders(&seven_node_network());
        assert_eq!(strahler[&41000002], 2);
        assert_eq!(strahler[&41000003], 2);
        assert_eq!(strahler[&41000001], 3);
        assert_eq!(shreve[&41000001], 4);
        for comid in [41000004, 41000005, 41000006, 41000007] {
            assert_eq!(strahler[&comid], 1);
            assert_eq!(shreve[&comid], 1);
        }
    }

    #[test]
    fn test_orders_mixed_confluence() {
        // An order-2 stream absorbing an order-1 tributary stays order 2,
        // while Shreve keeps summing.
        let rivers: HashMap<i64, RiverReach> = [
            reach(1, [2, 5, 0, 0], 500.0),
            reach(2, [3, 4, 0, 0], 300.0),
            reach(3, [0, 0, 0, 0], 100.0),
            reach(4, [0, 0, 0, 0], 100.0),
            reach(5, [0, 0, 0, 0], 100.0),
        ]
        .into_iter()
        .collect();
        let (strahler, shreve) = stream_orders(&rivers);
        assert_eq!(strahler[&2], 2);
        assert_eq!(strahler[&1], 2);
        assert_eq!(shreve[&1], 3);
    }

    #[test]
    fn test_orders_empty() {
        let (strahler, shreve) = stream_orders(&HashMap::new());
        assert!(strahler.is_empty());
        assert!(shreve.is_empty());
    }

    #[test]
    fn test_orders_ignore_links_outside_subset() {
        // Terminal references an upstream COMID that is not in the subset;
        // it must count as a headwater.
        let rivers: HashMap<i64, RiverReach> =
            [reach(41000001, [99000001, 0, 0, 0], 300.0)].into_iter().collect();
        let (strahler, shreve) = stream_orders(&rivers);
        assert_eq!(strahler[&41000001], 1);
        assert_eq!(shreve[&41000001], 1);
    }
}
