//! Predefined swap sequences and policy resolution.
//!
//! A swap sequence assigns a rank to every node of a route; lower ranks swap
//! first. Sequences can be given explicitly, by full name (`"swap_2_l2r"`),
//! or by policy name (`"l2r"`, `"r2l"`, `"baln"`, `"asap"`) which is resolved
//! against the route length.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{Result, SimError};

/// Named swap sequences, indexed by full name or `swap_{repeaters}_{policy}`.
static PREDEFINED: Lazy<BTreeMap<&'static str, &'static [u32]>> = Lazy::new(|| {
    let entries: &[(&'static str, &'static [u32])] = &[
        // disable swapping (for studying isolated links)
        ("no_swap", &[0, 0, 0]),
        // for 1-repeater
        ("swap_1", &[1, 0, 1]),
        ("swap_1_asap", &[1, 0, 1]),
        // for 2-repeater
        ("swap_2_asap", &[1, 0, 0, 1]),
        ("swap_2_l2r", &[2, 0, 1, 2]),
        ("swap_2_r2l", &[2, 1, 0, 2]),
        // for 3-repeater
        ("swap_3_asap", &[1, 0, 0, 0, 1]),
        ("swap_3_baln", &[2, 0, 1, 0, 2]),
        ("swap_3_l2r", &[3, 0, 1, 2, 3]),
        ("swap_3_r2l", &[3, 2, 1, 0, 3]),
        // for 4-repeater
        ("swap_4_asap", &[1, 0, 0, 0, 0, 1]),
        ("swap_4_baln", &[3, 0, 1, 0, 2, 3]),
        ("swap_4_baln2", &[3, 2, 0, 1, 0, 3]),
        ("swap_4_l2r", &[4, 0, 1, 2, 3, 4]),
        ("swap_4_r2l", &[4, 3, 2, 1, 0, 4]),
        // for 5-repeater
        ("swap_5_asap", &[1, 0, 0, 0, 0, 0, 1]),
        ("swap_5_baln", &[3, 0, 1, 0, 2, 0, 3]),
        ("swap_5_baln2", &[3, 0, 2, 0, 1, 0, 3]),
        ("swap_5_l2r", &[5, 0, 1, 2, 3, 4, 5]),
        ("swap_5_r2l", &[5, 4, 3, 2, 1, 0, 5]),
    ];
    entries.iter().copied().collect()
});

/// How the swap sequence of a path is specified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapSpec {
    /// Explicit rank per route node.
    Explicit(Vec<u32>),
    /// A predefined sequence name or a policy name resolved by route length.
    Named(String),
}

impl From<Vec<u32>> for SwapSpec {
    fn from(swap: Vec<u32>) -> Self {
        SwapSpec::Explicit(swap)
    }
}

impl<const N: usize> From<[u32; N]> for SwapSpec {
    fn from(swap: [u32; N]) -> Self {
        SwapSpec::Explicit(swap.to_vec())
    }
}

impl From<&str> for SwapSpec {
    fn from(name: &str) -> Self {
        SwapSpec::Named(name.to_string())
    }
}

fn lookup(name: &str) -> Option<&'static [u32]> {
    PREDEFINED.get(name).copied()
}

/// Resolve a swap specification against a route of `route_len` nodes.
pub fn parse_swap_sequence(spec: &SwapSpec, route_len: usize) -> Result<Vec<u32>> {
    let swap = match spec {
        SwapSpec::Explicit(swap) => swap.clone(),
        SwapSpec::Named(name) => {
            let by_policy = || {
                route_len
                    .checked_sub(2)
                    .and_then(|repeaters| lookup(&format!("swap_{repeaters}_{name}")))
            };
            lookup(name)
                .or_else(by_policy)
                .ok_or_else(|| SimError::UnknownSwapPolicy(name.clone(), route_len))?
                .to_vec()
        }
    };

    if swap.len() != route_len {
        return Err(SimError::Configuration(format!(
            "swap sequence {swap:?} does not match route with {route_len} nodes"
        )));
    }
    Ok(swap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_sequence_passes_through() {
        let got = parse_swap_sequence(&[1, 0, 1].into(), 3).unwrap();
        assert_eq!(got, vec![1, 0, 1]);
    }

    #[test]
    fn explicit_sequence_checks_length() {
        assert!(parse_swap_sequence(&[1, 0, 1].into(), 4).is_err());
    }

    #[test]
    fn full_name_lookup() {
        let got = parse_swap_sequence(&"swap_2_l2r".into(), 4).unwrap();
        assert_eq!(got, vec![2, 0, 1, 2]);
    }

    #[test]
    fn policy_resolved_by_route_length() {
        assert_eq!(parse_swap_sequence(&"asap".into(), 4).unwrap(), vec![1, 0, 0, 1]);
        assert_eq!(
            parse_swap_sequence(&"baln".into(), 5).unwrap(),
            vec![2, 0, 1, 0, 2]
        );
        assert_eq!(
            parse_swap_sequence(&"r2l".into(), 6).unwrap(),
            vec![4, 3, 2, 1, 0, 4]
        );
    }

    #[test]
    fn unknown_policy_is_an_error() {
        let err = parse_swap_sequence(&"zigzag".into(), 5).unwrap_err();
        assert!(matches!(err, SimError::UnknownSwapPolicy(_, 5)));
    }
}
